//! `grpc.health.v1.Health` check endpoint.

use super::service::ServiceDefinition;
use super::stream::ServerStream;
use crate::error::{CallError, RpcError};
use std::collections::HashSet;
use std::sync::Arc;
use tonic::Code;

pub const HEALTH_SERVICE: &str = "grpc.health.v1.Health";

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HealthCheckRequest {
    #[prost(string, tag = "1")]
    pub service: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HealthCheckResponse {
    #[prost(enumeration = "ServingStatus", tag = "1")]
    pub status: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ServingStatus {
    Unknown = 0,
    Serving = 1,
    NotServing = 2,
    ServiceUnknown = 3,
}

/// Health service reporting SERVING for each of `services` and, under the
/// empty name, for the server as a whole.
pub fn service(services: Vec<String>) -> ServiceDefinition {
    let known: Arc<HashSet<String>> = Arc::new(services.into_iter().collect());

    ServiceDefinition::new(HEALTH_SERVICE).unary("Check", move |mut stream: ServerStream| {
        let known = Arc::clone(&known);
        async move {
            let request: HealthCheckRequest = stream.recv_single().await?;
            if !request.service.is_empty() && !known.contains(&request.service) {
                return Err(CallError::from(RpcError::new(Code::NotFound, "unknown service")));
            }
            let reply = HealthCheckResponse {
                status: ServingStatus::Serving as i32,
            };
            stream.send(&reply).await
        }
    })
}
