pub mod auth;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod registry;
pub mod server;

// Re-export commonly used types
pub use auth::{Authenticator, Principal, RequestService, RequestUser};
pub use client::{BoundMethod, CallBinding, InterstellarClient, Stub};
pub use config::{RemoteService, Settings};
pub use error::{CallError, Error, ErrorCode, Result, RpcError};
pub use registry::{PackageSource, StaticPackageSource, StubRegistry};
pub use server::{InterstellarServer, ServerStream, ServiceDefinition};
