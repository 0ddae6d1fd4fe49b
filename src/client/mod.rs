//! Client half: stub discovery, pooled channels and call binding.
//!
//! ```ignore
//! let client = InterstellarClient::new(settings, Arc::new(source));
//! client.init()?;
//!
//! let remote = client.remote("userip")?.clone();
//! let method = client.bind_method(&remote, "monolith", None, "UserIpService", "GetMyIp")?;
//! let reply: IpReply = method.unary(IpRequest::default()).await?.into_inner();
//! ```

pub mod binding;
pub mod context;
pub mod metadata;
pub mod pool;

pub use binding::{BoundMethod, CallBinding, Stub};
pub use context::CallerContext;
pub use metadata::{Authorization, BeforeSend, CallerMetadataInjector, MetadataChain};
pub use pool::{ChannelPool, PooledChannel};

use crate::config::{RemoteService, Settings};
use crate::error::{ConfigurationError, Result};
use crate::registry::{PackageSource, StubRegistry};
use std::sync::Arc;
use tracing::{info, warn};

/// Owns the stub registry and the channel pool for one process.
#[derive(Debug, Clone)]
pub struct InterstellarClient {
    settings: Arc<Settings>,
    registry: Arc<StubRegistry>,
    pool: Arc<ChannelPool>,
}

impl InterstellarClient {
    pub fn new(settings: Settings, source: Arc<dyn PackageSource>) -> Self {
        let source_ip = metadata::resolve_source_ip(&settings);
        let registry = Arc::new(StubRegistry::new(source, &settings.client));

        let chain_settings = settings.clone();
        let pool = Arc::new(ChannelPool::new(&settings.client, move |remote| {
            MetadataChain::new().with(CallerMetadataInjector::new(&chain_settings, remote, &source_ip))
        }));

        Self {
            settings: Arc::new(settings),
            registry,
            pool,
        }
    }

    /// Register every package discovered for each configured remote service.
    ///
    /// Returns the number of packages registered.
    pub fn init(&self) -> Result<usize> {
        let mut registered = 0;
        for remote in &self.settings.client.services {
            let packages = self.registry.scan_available_packages(Some(&remote.name))?;
            if packages.is_empty() {
                warn!("No protocol packages found for remote service {}", remote.name);
                continue;
            }
            self.registry.register(&packages)?;
            info!(
                "Registered {} packages for {} at {}:{}",
                packages.len(),
                remote.name,
                remote.host,
                remote.port
            );
            registered += packages.len();
        }
        Ok(registered)
    }

    /// A configured remote service by name.
    pub fn remote(&self, name: &str) -> Result<&RemoteService> {
        self.settings
            .remote_service(name)
            .ok_or_else(|| ConfigurationError::UnknownRemoteService(name.to_string()).into())
    }

    /// Resolve a stub (or one of its methods) and bind it to a pooled channel.
    pub fn bind(
        &self,
        remote: &RemoteService,
        namespace: &str,
        version: Option<&str>,
        stub: &str,
        method: Option<&str>,
    ) -> Result<CallBinding> {
        let descriptor = self
            .registry
            .get_stub(&remote.name, namespace, version, stub, method)?;
        let channel = self.pool.get_channel(remote)?;
        let authorization = remote
            .token
            .as_deref()
            .map(|token| Authorization::new(&self.settings.auth.header_prefix, token))
            .transpose()?;

        let stub = Stub::new(
            descriptor,
            channel,
            authorization,
            self.settings.headers.error_code.to_lowercase(),
        );
        match method {
            Some(method) => Ok(CallBinding::Method(stub.method(method)?)),
            None => Ok(CallBinding::Stub(stub)),
        }
    }

    pub fn bind_stub(
        &self,
        remote: &RemoteService,
        namespace: &str,
        version: Option<&str>,
        stub: &str,
    ) -> Result<Stub> {
        match self.bind(remote, namespace, version, stub, None)? {
            CallBinding::Stub(stub) => Ok(stub),
            CallBinding::Method(method) => Err(ConfigurationError::Invalid(format!(
                "Expected a stub binding, got method {}",
                method.descriptor().name
            ))
            .into()),
        }
    }

    pub fn bind_method(
        &self,
        remote: &RemoteService,
        namespace: &str,
        version: Option<&str>,
        stub: &str,
        method: &str,
    ) -> Result<BoundMethod> {
        match self.bind(remote, namespace, version, stub, Some(method))? {
            CallBinding::Method(method) => Ok(method),
            CallBinding::Stub(stub) => Err(ConfigurationError::Invalid(format!(
                "Expected a method binding, got stub {}",
                stub.name()
            ))
            .into()),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn registry(&self) -> &StubRegistry {
        &self.registry
    }

    pub fn pool(&self) -> &ChannelPool {
        &self.pool
    }

    /// Drop every registered stub and pooled channel.
    pub fn reset(&self) {
        self.registry.reset();
        self.pool.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::registry::{Cardinality, MethodDescriptor, ModuleDefinition, PackageDefinition, StaticPackageSource, StubDescriptor};

    fn client() -> InterstellarClient {
        let package = PackageDefinition {
            version: None,
            modules: vec![ModuleDefinition {
                name: "userip_grpc".into(),
                stubs: vec![StubDescriptor::new(
                    "UserIpServiceStub",
                    vec![MethodDescriptor::for_service(
                        "userip.UserIpService",
                        "GetMyIp",
                        Cardinality::UnaryUnary,
                        "userip.IpRequest",
                        "userip.IpReply",
                    )],
                )],
            }],
        };
        let source = StaticPackageSource::new().with_package("grpc-userip-monolith", package);

        let mut settings = Settings::default();
        settings.service.source_ip = Some("127.0.0.1".into());
        settings.client.max_channels_per_service = 2;
        settings.client.services = vec![
            RemoteService::new("userip", "127.0.0.1", 50051).with_token("t0ken"),
            RemoteService::new("orders", "127.0.0.1", 50052),
        ];
        InterstellarClient::new(settings, Arc::new(source))
    }

    #[tokio::test]
    async fn test_init_registers_configured_services() {
        let client = client();
        assert_eq!(client.init().unwrap(), 1);
        assert_eq!(client.registry().entries().len(), 1);
    }

    #[tokio::test]
    async fn test_bind_stub_and_method() {
        let client = client();
        client.init().unwrap();
        let remote = client.remote("userip").unwrap().clone();

        let stub = client.bind_stub(&remote, "monolith", None, "UserIpService").unwrap();
        assert_eq!(stub.name(), "UserIpServiceStub");

        let method = client
            .bind_method(&remote, "monolith", None, "UserIpService", "GetMyIp")
            .unwrap();
        assert_eq!(method.descriptor().name, "GetMyIp");

        for _ in 0..10 {
            client.bind(&remote, "monolith", None, "UserIpService", None).unwrap();
        }
        assert_eq!(client.pool().len("userip"), 2);
    }

    #[tokio::test]
    async fn test_bind_failures_are_configuration_errors() {
        let client = client();
        client.init().unwrap();

        assert!(matches!(
            client.remote("billing"),
            Err(Error::Configuration(ConfigurationError::UnknownRemoteService(_)))
        ));

        let orders = client.remote("orders").unwrap().clone();
        assert!(matches!(
            client.bind(&orders, "monolith", None, "OrderService", None),
            Err(Error::Configuration(ConfigurationError::NotConfigured(_)))
        ));
        assert_eq!(client.pool().len("orders"), 0);
    }

    #[tokio::test]
    async fn test_reset() {
        let client = client();
        client.init().unwrap();
        let remote = client.remote("userip").unwrap().clone();
        client.bind(&remote, "monolith", None, "UserIpService", None).unwrap();

        client.reset();
        assert!(client.registry().is_empty());
        assert!(client.pool().is_empty());
    }
}
