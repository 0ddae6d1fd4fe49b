//! Bound stubs and methods.
//!
//! A [`CallBinding`] is the result of resolving one call intent: the stub
//! descriptor from the registry plus a pooled channel. Dropping it releases
//! nothing; the channel belongs to the pool.

use super::metadata::Authorization;
use super::pool::{ChannelService, PooledChannel};
use crate::error::{ConfigurationError, Error, Result, RpcError};
use crate::registry::{Cardinality, MethodDescriptor, StubDescriptor};
use http::uri::PathAndQuery;
use std::sync::Arc;
use tonic::client::Grpc;
use tonic::codec::{ProstCodec, Streaming};
use tonic::{IntoRequest, IntoStreamingRequest, Request, Response, Status};

/// Either a whole stub or one of its methods.
#[derive(Debug, Clone)]
pub enum CallBinding {
    Stub(Stub),
    Method(BoundMethod),
}

impl CallBinding {
    pub fn into_stub(self) -> Option<Stub> {
        match self {
            CallBinding::Stub(stub) => Some(stub),
            CallBinding::Method(_) => None,
        }
    }

    pub fn into_method(self) -> Option<BoundMethod> {
        match self {
            CallBinding::Method(method) => Some(method),
            CallBinding::Stub(_) => None,
        }
    }
}

/// State shared by a stub and every method bound from it.
#[derive(Debug)]
struct Binding {
    channel: PooledChannel,
    authorization: Option<Authorization>,
    error_code_header: String,
}

/// A stub instance bound to a pooled channel.
#[derive(Debug, Clone)]
pub struct Stub {
    descriptor: Arc<StubDescriptor>,
    binding: Arc<Binding>,
}

impl Stub {
    pub(crate) fn new(
        descriptor: Arc<StubDescriptor>,
        channel: PooledChannel,
        authorization: Option<Authorization>,
        error_code_header: String,
    ) -> Self {
        Self {
            descriptor,
            binding: Arc::new(Binding {
                channel,
                authorization,
                error_code_header,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &StubDescriptor {
        &self.descriptor
    }

    pub fn channel(&self) -> &PooledChannel {
        &self.binding.channel
    }

    /// Bind one method of this stub.
    pub fn method(&self, name: &str) -> Result<BoundMethod> {
        let descriptor = self
            .descriptor
            .method(name)
            .cloned()
            .ok_or_else(|| ConfigurationError::UnknownMethod {
                stub: self.descriptor.name.clone(),
                method: name.to_string(),
            })?;
        let path = PathAndQuery::try_from(descriptor.path.as_str()).map_err(|e| {
            ConfigurationError::Invalid(format!("Invalid path {:?} for {}: {}", descriptor.path, name, e))
        })?;

        Ok(BoundMethod {
            descriptor: Arc::new(descriptor),
            path,
            binding: Arc::clone(&self.binding),
        })
    }
}

/// One callable remote method.
///
/// Bearer credentials, when the remote service has a token, are added to
/// every call that does not already carry an `authorization` entry.
#[derive(Debug, Clone)]
pub struct BoundMethod {
    descriptor: Arc<MethodDescriptor>,
    path: PathAndQuery,
    binding: Arc<Binding>,
}

impl BoundMethod {
    pub fn descriptor(&self) -> &MethodDescriptor {
        &self.descriptor
    }

    pub fn channel(&self) -> &PooledChannel {
        &self.binding.channel
    }

    pub async fn unary<Req, Res>(&self, request: impl IntoRequest<Req>) -> Result<Response<Res>>
    where
        Req: prost::Message + Send + Sync + 'static,
        Res: prost::Message + Default + Send + Sync + 'static,
    {
        self.require_cardinality(Cardinality::UnaryUnary)?;
        let mut grpc = self.ready().await?;
        let request = self.authorize(request.into_request());
        grpc.unary(request, self.path.clone(), ProstCodec::<Req, Res>::default())
            .await
            .map_err(|status| self.map_status(status))
    }

    pub async fn server_streaming<Req, Res>(
        &self,
        request: impl IntoRequest<Req>,
    ) -> Result<Response<Streaming<Res>>>
    where
        Req: prost::Message + Send + Sync + 'static,
        Res: prost::Message + Default + Send + Sync + 'static,
    {
        self.require_cardinality(Cardinality::UnaryStream)?;
        let mut grpc = self.ready().await?;
        let request = self.authorize(request.into_request());
        grpc.server_streaming(request, self.path.clone(), ProstCodec::<Req, Res>::default())
            .await
            .map_err(|status| self.map_status(status))
    }

    pub async fn client_streaming<Req, Res>(
        &self,
        request: impl IntoStreamingRequest<Message = Req>,
    ) -> Result<Response<Res>>
    where
        Req: prost::Message + Send + Sync + 'static,
        Res: prost::Message + Default + Send + Sync + 'static,
    {
        self.require_cardinality(Cardinality::StreamUnary)?;
        let mut grpc = self.ready().await?;
        let request = self.authorize(request.into_streaming_request());
        grpc.client_streaming(request, self.path.clone(), ProstCodec::<Req, Res>::default())
            .await
            .map_err(|status| self.map_status(status))
    }

    pub async fn streaming<Req, Res>(
        &self,
        request: impl IntoStreamingRequest<Message = Req>,
    ) -> Result<Response<Streaming<Res>>>
    where
        Req: prost::Message + Send + Sync + 'static,
        Res: prost::Message + Default + Send + Sync + 'static,
    {
        self.require_cardinality(Cardinality::StreamStream)?;
        let mut grpc = self.ready().await?;
        let request = self.authorize(request.into_streaming_request());
        grpc.streaming(request, self.path.clone(), ProstCodec::<Req, Res>::default())
            .await
            .map_err(|status| self.map_status(status))
    }

    fn require_cardinality(&self, expected: Cardinality) -> Result<()> {
        if self.descriptor.cardinality != expected {
            return Err(ConfigurationError::CardinalityMismatch {
                method: self.descriptor.name.clone(),
                expected: expected.as_str(),
                actual: self.descriptor.cardinality.as_str(),
            }
            .into());
        }
        Ok(())
    }

    async fn ready(&self) -> Result<Grpc<ChannelService>> {
        let mut grpc = Grpc::new(self.binding.channel.service_channel());
        grpc.ready()
            .await
            .map_err(|e| Status::unknown(format!("Service was not ready: {}", e)))
            .map_err(|status| self.map_status(status))?;
        Ok(grpc)
    }

    fn authorize<T>(&self, mut request: Request<T>) -> Request<T> {
        if let Some(authorization) = &self.binding.authorization {
            authorization.apply(request.metadata_mut());
        }
        request
    }

    fn map_status(&self, status: Status) -> Error {
        RpcError::from_status(&status, &self.binding.error_code_header).into()
    }
}
