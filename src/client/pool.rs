//! Bounded channel pool per remote service.

use super::metadata::MetadataChain;
use crate::config::{ClientSettings, RemoteService};
use crate::error::{ConfigurationError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tonic::service::interceptor::InterceptedService;
use tonic::transport::{Channel, Endpoint};
use tracing::debug;

/// Channel with the outbound metadata chain installed.
pub type ChannelService = InterceptedService<Channel, MetadataChain>;

/// Builds the metadata chain for a new channel to one remote service.
pub type ChainFactory = Arc<dyn Fn(&RemoteService) -> MetadataChain + Send + Sync>;

/// A pooled transport channel. Cloning is cheap and shares the connection.
#[derive(Clone)]
pub struct PooledChannel {
    id: u64,
    service: String,
    endpoint: String,
    inner: ChannelService,
}

impl PooledChannel {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn service_channel(&self) -> ChannelService {
        self.inner.clone()
    }
}

impl fmt::Debug for PooledChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledChannel")
            .field("id", &self.id)
            .field("service", &self.service)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

/// Bounded, lazily grown channel lists keyed by remote service name.
///
/// Channels are never health-checked or evicted; only [`ChannelPool::reset`]
/// drops them.
pub struct ChannelPool {
    max_per_service: usize,
    connect_timeout: Duration,
    request_timeout: Option<Duration>,
    chain: ChainFactory,
    channels: RwLock<HashMap<String, Vec<PooledChannel>>>,
    next_id: AtomicU64,
}

impl ChannelPool {
    pub fn new<F>(settings: &ClientSettings, chain: F) -> Self
    where
        F: Fn(&RemoteService) -> MetadataChain + Send + Sync + 'static,
    {
        Self {
            max_per_service: settings.max_channels_per_service.max(1),
            connect_timeout: settings.connect_timeout(),
            request_timeout: settings.request_timeout(),
            chain: Arc::new(chain),
            channels: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// A channel to `remote`.
    ///
    /// Below the bound every call creates a new channel; at the bound a
    /// pseudo-randomly selected existing one is returned. Must be called from
    /// within a Tokio runtime.
    pub fn get_channel(&self, remote: &RemoteService) -> Result<PooledChannel> {
        {
            let channels = self.channels.read();
            if let Some(existing) = channels.get(&remote.name) {
                if existing.len() >= self.max_per_service {
                    return Ok(pick(existing));
                }
            }
        }

        let channel = self.connect(remote)?;

        let mut channels = self.channels.write();
        let existing = channels.entry(remote.name.clone()).or_default();
        if existing.len() >= self.max_per_service {
            return Ok(pick(existing));
        }
        existing.push(channel.clone());
        debug!(
            "Opened channel {} to {} ({}/{})",
            channel.id,
            channel.endpoint,
            existing.len(),
            self.max_per_service
        );
        Ok(channel)
    }

    fn connect(&self, remote: &RemoteService) -> Result<PooledChannel> {
        let uri = format!("http://{}:{}", remote.host, remote.port);
        let mut endpoint = Endpoint::from_shared(uri.clone())
            .map_err(|e| ConfigurationError::InvalidEndpoint {
                service: remote.name.clone(),
                reason: e.to_string(),
            })?
            .connect_timeout(self.connect_timeout);
        if let Some(timeout) = self.request_timeout {
            endpoint = endpoint.timeout(timeout);
        }

        let channel = endpoint.connect_lazy();
        Ok(PooledChannel {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            service: remote.name.clone(),
            endpoint: uri,
            inner: InterceptedService::new(channel, (self.chain)(remote)),
        })
    }

    /// Number of pooled channels for `service`.
    pub fn len(&self, service: &str) -> usize {
        self.channels.read().get(service).map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.channels.read().values().all(Vec::is_empty)
    }

    pub fn max_per_service(&self) -> usize {
        self.max_per_service
    }

    /// Drop every pooled channel.
    pub fn reset(&self) {
        self.channels.write().clear();
    }
}

fn pick(channels: &[PooledChannel]) -> PooledChannel {
    channels[fastrand::usize(..channels.len())].clone()
}

impl fmt::Debug for ChannelPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let channels = self.channels.read();
        let sizes: HashMap<&str, usize> = channels.iter().map(|(k, v)| (k.as_str(), v.len())).collect();
        f.debug_struct("ChannelPool")
            .field("max_per_service", &self.max_per_service)
            .field("channels", &sizes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::collections::HashSet;

    fn pool(max: usize) -> ChannelPool {
        let settings = ClientSettings {
            max_channels_per_service: max,
            ..Default::default()
        };
        ChannelPool::new(&settings, |_| MetadataChain::new())
    }

    #[tokio::test]
    async fn test_bound_is_never_exceeded() {
        let pool = pool(4);
        let remote = RemoteService::new("userip", "127.0.0.1", 50051);

        let ids: HashSet<u64> = (0..20)
            .map(|_| pool.get_channel(&remote).unwrap().id())
            .collect();

        assert_eq!(ids.len(), 4);
        assert_eq!(pool.len("userip"), 4);
    }

    #[tokio::test]
    async fn test_services_have_separate_lists() {
        let pool = pool(2);
        let a = RemoteService::new("a", "127.0.0.1", 1);
        let b = RemoteService::new("b", "127.0.0.1", 2);

        for _ in 0..5 {
            assert_eq!(pool.get_channel(&a).unwrap().service(), "a");
            assert_eq!(pool.get_channel(&b).unwrap().endpoint(), "http://127.0.0.1:2");
        }
        assert_eq!(pool.len("a"), 2);
        assert_eq!(pool.len("b"), 2);
    }

    #[tokio::test]
    async fn test_reset_clears_channels() {
        let pool = pool(1);
        let remote = RemoteService::new("userip", "127.0.0.1", 50051);

        let first = pool.get_channel(&remote).unwrap();
        assert_eq!(pool.get_channel(&remote).unwrap().id(), first.id());

        pool.reset();
        assert!(pool.is_empty());
        assert_ne!(pool.get_channel(&remote).unwrap().id(), first.id());
    }

    #[tokio::test]
    async fn test_invalid_endpoint_fails_synchronously() {
        let pool = pool(4);
        let remote = RemoteService::new("broken", "not a host", 50051);

        let err = pool.get_channel(&remote).unwrap_err();
        assert!(matches!(
            err,
            Error::Configuration(ConfigurationError::InvalidEndpoint { ref service, .. }) if service == "broken"
        ));
        assert_eq!(pool.len("broken"), 0);
    }

    #[tokio::test]
    async fn test_concurrent_callers_respect_bound() {
        let pool = Arc::new(pool(3));
        let remote = RemoteService::new("userip", "127.0.0.1", 50051);

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let remote = remote.clone();
                tokio::spawn(async move { pool.get_channel(&remote).map(|c| c.id()) })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(pool.len("userip"), 3);
    }
}
