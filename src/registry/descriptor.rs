//! Method, stub and package definitions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Whether a method's request and reply are single messages or streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    UnaryUnary,
    UnaryStream,
    StreamUnary,
    StreamStream,
}

impl Cardinality {
    pub fn client_streaming(&self) -> bool {
        matches!(self, Cardinality::StreamUnary | Cardinality::StreamStream)
    }

    pub fn server_streaming(&self) -> bool {
        matches!(self, Cardinality::UnaryStream | Cardinality::StreamStream)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Cardinality::UnaryUnary => "unary_unary",
            Cardinality::UnaryStream => "unary_stream",
            Cardinality::StreamUnary => "stream_unary",
            Cardinality::StreamStream => "stream_stream",
        }
    }
}

impl fmt::Display for Cardinality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One RPC method. Immutable once registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodDescriptor {
    /// Method name as exposed on the stub, e.g. `GetMyIp`
    pub name: String,
    /// Request path, e.g. `/userip.UserIpService/GetMyIp`
    pub path: String,
    pub cardinality: Cardinality,
    /// Fully qualified request message type
    pub request_type: String,
    /// Fully qualified reply message type
    pub reply_type: String,
}

impl MethodDescriptor {
    pub fn new(
        name: impl Into<String>,
        path: impl Into<String>,
        cardinality: Cardinality,
        request_type: impl Into<String>,
        reply_type: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            cardinality,
            request_type: request_type.into(),
            reply_type: reply_type.into(),
        }
    }

    /// Method whose path is derived from a `<package>.<Service>` name.
    pub fn for_service(
        service: &str,
        name: impl Into<String>,
        cardinality: Cardinality,
        request_type: impl Into<String>,
        reply_type: impl Into<String>,
    ) -> Self {
        let name = name.into();
        let path = format!("/{}/{}", service, name);
        Self::new(name, path, cardinality, request_type, reply_type)
    }
}

/// A generated client-side type exposing one remote service's methods.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StubDescriptor {
    pub name: String,
    /// Abstract stubs are base types and never indexed
    #[serde(default)]
    pub is_abstract: bool,
    #[serde(default)]
    pub methods: Vec<MethodDescriptor>,
}

impl StubDescriptor {
    pub fn new(name: impl Into<String>, methods: Vec<MethodDescriptor>) -> Self {
        Self {
            name: name.into(),
            is_abstract: false,
            methods,
        }
    }

    pub fn method(&self, name: &str) -> Option<&MethodDescriptor> {
        self.methods.iter().find(|m| m.name == name)
    }

    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.iter().map(|m| m.name.as_str())
    }
}

/// A module inside a protocol package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDefinition {
    pub name: String,
    #[serde(default)]
    pub stubs: Vec<StubDescriptor>,
}

/// Everything a discovery source returns for one package.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageDefinition {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub modules: Vec<ModuleDefinition>,
}
