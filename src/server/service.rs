//! Local service implementations exposed by the server half.

use super::stream::ServerStream;
use crate::error::CallError;
use crate::registry::{Cardinality, MethodDescriptor};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

/// Application code behind one method.
#[async_trait]
pub trait MethodHandler: Send + Sync + 'static {
    async fn handle(&self, stream: ServerStream) -> Result<(), CallError>;
}

#[async_trait]
impl<F, Fut> MethodHandler for F
where
    F: Fn(ServerStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), CallError>> + Send + 'static,
{
    async fn handle(&self, stream: ServerStream) -> Result<(), CallError> {
        (self)(stream).await
    }
}

/// A method descriptor paired with its handler.
#[derive(Clone)]
pub struct ServerMethod {
    pub descriptor: Arc<MethodDescriptor>,
    pub handler: Arc<dyn MethodHandler>,
}

impl std::fmt::Debug for ServerMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerMethod")
            .field("descriptor", &self.descriptor)
            .finish()
    }
}

/// One local service: a `<package>.<Service>` name and its methods.
#[derive(Debug, Clone)]
pub struct ServiceDefinition {
    name: String,
    methods: Vec<ServerMethod>,
}

impl ServiceDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
        }
    }

    pub fn method(mut self, name: &str, cardinality: Cardinality, handler: impl MethodHandler) -> Self {
        let descriptor = MethodDescriptor::for_service(&self.name, name, cardinality, "", "");
        self.methods.push(ServerMethod {
            descriptor: Arc::new(descriptor),
            handler: Arc::new(handler),
        });
        self
    }

    pub fn unary(self, name: &str, handler: impl MethodHandler) -> Self {
        self.method(name, Cardinality::UnaryUnary, handler)
    }

    pub fn server_streaming(self, name: &str, handler: impl MethodHandler) -> Self {
        self.method(name, Cardinality::UnaryStream, handler)
    }

    pub fn client_streaming(self, name: &str, handler: impl MethodHandler) -> Self {
        self.method(name, Cardinality::StreamUnary, handler)
    }

    pub fn streaming(self, name: &str, handler: impl MethodHandler) -> Self {
        self.method(name, Cardinality::StreamStream, handler)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn methods(&self) -> &[ServerMethod] {
        &self.methods
    }
}

/// Supplies the local services a server exposes.
pub trait HandlerProvider: Send + Sync {
    fn services(&self) -> Vec<ServiceDefinition>;
}

impl HandlerProvider for Vec<ServiceDefinition> {
    fn services(&self) -> Vec<ServiceDefinition> {
        self.clone()
    }
}
