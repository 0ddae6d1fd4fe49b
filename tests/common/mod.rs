//! Shared fixtures for the integration tests: an echo service, the package
//! catalogue that describes it to clients, and server/client helpers.
#![allow(dead_code)]

use anyhow::anyhow;
use interstellar_core::{
    config::{RemoteService, Settings},
    error::{CallError, RpcError},
    registry::{Cardinality, MethodDescriptor, ModuleDefinition, PackageDefinition, StaticPackageSource, StubDescriptor},
    server::{InterstellarServer, MemoryAccessLog, ServerOptions, ServerStream, ServiceDefinition},
    InterstellarClient,
};
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

pub const ECHO_SERVICE: &str = "echo.EchoService";
pub const SECRET_DETAIL: &str = "connection string contains hunter2";

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EchoRequest {
    #[prost(string, tag = "1")]
    pub text: ::prost::alloc::string::String,
    #[prost(uint32, tag = "2")]
    pub count: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EchoReply {
    #[prost(string, tag = "1")]
    pub text: ::prost::alloc::string::String,
    /// Authenticated source service of the caller
    #[prost(string, tag = "2")]
    pub caller: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub correlation_id: ::prost::alloc::string::String,
    #[prost(string, tag = "4")]
    pub user: ::prost::alloc::string::String,
}

fn reply_for(stream: &ServerStream, text: String) -> EchoReply {
    let correlation_id = stream
        .metadata()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    EchoReply {
        text,
        caller: stream.principal().service.source.clone(),
        correlation_id,
        user: stream.principal().user.id.clone(),
    }
}

/// Echo service covering every cardinality and failure shape.
pub fn echo_service() -> ServiceDefinition {
    ServiceDefinition::new(ECHO_SERVICE)
        .unary("Echo", |mut stream: ServerStream| async move {
            let request: EchoRequest = stream.recv_single().await?;
            let reply = reply_for(&stream, request.text);
            stream.send(&reply).await
        })
        .unary("Reject", |_stream: ServerStream| async move {
            Err::<(), _>(CallError::from(RpcError::permission_denied("not allowed")))
        })
        .unary("Fail", |_stream: ServerStream| async move {
            Err::<(), _>(CallError::from(anyhow!(SECRET_DETAIL)))
        })
        .unary("Sleep", |mut stream: ServerStream| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            let reply = reply_for(&stream, "late".to_string());
            stream.send(&reply).await
        })
        .unary("Stuck", |_stream: ServerStream| async move {
            // Holds its worker thread without reaching an await point
            std::thread::sleep(Duration::from_millis(500));
            Ok::<(), CallError>(())
        })
        .server_streaming("Count", |mut stream: ServerStream| async move {
            let request: EchoRequest = stream.recv_single().await?;
            for i in 0..request.count {
                let reply = reply_for(&stream, format!("{}-{}", request.text, i));
                stream.send(&reply).await?;
            }
            Ok(())
        })
        .client_streaming("Collect", |mut stream: ServerStream| async move {
            let mut texts = Vec::new();
            while let Some(request) = stream.recv::<EchoRequest>().await? {
                texts.push(request.text);
            }
            let reply = reply_for(&stream, texts.join(","));
            stream.send(&reply).await
        })
        .streaming("Chat", |mut stream: ServerStream| async move {
            while let Some(request) = stream.recv::<EchoRequest>().await? {
                let reply = reply_for(&stream, request.text.to_uppercase());
                stream.send(&reply).await?;
            }
            Ok(())
        })
}

fn echo_method(name: &str, cardinality: Cardinality) -> MethodDescriptor {
    MethodDescriptor::for_service(ECHO_SERVICE, name, cardinality, "echo.EchoRequest", "echo.EchoReply")
}

/// Packages describing the echo service, as installed on a client.
pub fn echo_packages() -> StaticPackageSource {
    let echo = PackageDefinition {
        version: None,
        modules: vec![ModuleDefinition {
            name: "echo_grpc".into(),
            stubs: vec![StubDescriptor::new(
                "EchoServiceStub",
                vec![
                    echo_method("Echo", Cardinality::UnaryUnary),
                    echo_method("Reject", Cardinality::UnaryUnary),
                    echo_method("Fail", Cardinality::UnaryUnary),
                    echo_method("Sleep", Cardinality::UnaryUnary),
                    echo_method("Count", Cardinality::UnaryStream),
                    echo_method("Collect", Cardinality::StreamUnary),
                    echo_method("Chat", Cardinality::StreamStream),
                    // Installed on the client but never served
                    echo_method("Missing", Cardinality::UnaryUnary),
                ],
            )],
        }],
    };
    let health = PackageDefinition {
        version: None,
        modules: vec![ModuleDefinition {
            name: "health_grpc".into(),
            stubs: vec![StubDescriptor::new(
                "HealthStub",
                vec![MethodDescriptor::for_service(
                    "grpc.health.v1.Health",
                    "Check",
                    Cardinality::UnaryUnary,
                    "grpc.health.v1.HealthCheckRequest",
                    "grpc.health.v1.HealthCheckResponse",
                )],
            )],
        }],
    };
    StaticPackageSource::new()
        .with_package("grpc-echo-test", echo)
        .with_package("grpc-echo-health", health)
}

/// Settings for a service named `echo` that talks to itself on `port`.
pub fn echo_settings(port: u16) -> Settings {
    let mut settings = Settings::default();
    settings.service.name = "echo".to_string();
    settings.service.source_ip = Some("127.0.0.1".to_string());
    settings.server.host = "127.0.0.1".to_string();
    settings.server.port = port;
    settings.client.services = vec![RemoteService::new("echo", "127.0.0.1", port)];
    settings
}

pub struct TestServer {
    pub server: InterstellarServer,
    pub addr: SocketAddr,
    pub log: Arc<MemoryAccessLog>,
}

impl TestServer {
    pub async fn stop(self) {
        self.server.stop().await;
    }
}

/// Start `services` on an ephemeral local port, recording access logs in memory.
pub async fn start_test_server(services: Vec<ServiceDefinition>) -> Result<TestServer, Box<dyn Error>> {
    let settings = echo_settings(0);
    let log = Arc::new(MemoryAccessLog::new());
    let options = ServerOptions {
        access_log: Some(log.clone()),
        ..Default::default()
    };
    let server = InterstellarServer::with_options(&settings, &services, options)?;
    let addr = server.start("127.0.0.1", 0).await?;
    Ok(TestServer { server, addr, log })
}

/// A client with the echo packages registered against `addr`.
pub fn start_test_client(addr: SocketAddr) -> Result<InterstellarClient, Box<dyn Error>> {
    let client = InterstellarClient::new(echo_settings(addr.port()), Arc::new(echo_packages()));
    client.init()?;
    Ok(client)
}

/// Access records are written once the response has been flushed, which can
/// land after the caller sees it.
pub async fn wait_for_records(log: &MemoryAccessLog, count: usize) {
    for _ in 0..200 {
        if log.len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
