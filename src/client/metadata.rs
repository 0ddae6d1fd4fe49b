//! Outbound metadata injection.
//!
//! Every pooled channel carries a [`MetadataChain`]: an ordered list of
//! [`BeforeSend`] steps run once per outbound call, before its headers are
//! sent. The chain is composed when the channel is built.

use super::context::CallerContext;
use crate::auth::{RequestService, RequestUser};
use crate::config::{RemoteService, Settings};
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::sync::Arc;
use tonic::metadata::{Ascii, MetadataKey, MetadataMap, MetadataValue};
use tonic::service::Interceptor;
use tonic::{Request, Status};
use tracing::debug;

/// Header carrying bearer credentials.
pub const AUTHORIZATION_HEADER: &str = "authorization";

/// One step of the outbound metadata chain.
pub trait BeforeSend: Send + Sync + 'static {
    fn before_send(&self, metadata: &mut MetadataMap) -> Result<(), Status>;
}

impl<F> BeforeSend for F
where
    F: Fn(&mut MetadataMap) -> Result<(), Status> + Send + Sync + 'static,
{
    fn before_send(&self, metadata: &mut MetadataMap) -> Result<(), Status> {
        (self)(metadata)
    }
}

/// Ordered [`BeforeSend`] steps, installed on a channel as its interceptor.
#[derive(Clone, Default)]
pub struct MetadataChain {
    steps: Vec<Arc<dyn BeforeSend>>,
}

impl MetadataChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, step: impl BeforeSend) -> Self {
        self.steps.push(Arc::new(step));
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn apply(&self, metadata: &mut MetadataMap) -> Result<(), Status> {
        for step in &self.steps {
            step.before_send(metadata)?;
        }
        Ok(())
    }
}

impl Interceptor for MetadataChain {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        self.apply(request.metadata_mut())?;
        Ok(request)
    }
}

impl std::fmt::Debug for MetadataChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataChain").field("steps", &self.steps.len()).finish()
    }
}

/// Set `name`, replacing any value the call site supplied.
fn set_header(metadata: &mut MetadataMap, name: &str, value: &str) -> Result<(), Status> {
    let key = MetadataKey::<Ascii>::from_bytes(name.as_bytes())
        .map_err(|_| Status::internal(format!("Invalid metadata key {:?}", name)))?;
    let value = MetadataValue::try_from(value)
        .map_err(|_| Status::internal(format!("Invalid value for metadata key {}", name)))?;
    metadata.insert(key, value);
    Ok(())
}

/// Set `name` unless the call site already did.
fn insert_if_absent(metadata: &mut MetadataMap, name: &str, value: &str) -> Result<(), Status> {
    if metadata.contains_key(name) {
        return Ok(());
    }
    set_header(metadata, name, value)
}

/// Attaches the caller's identity to outbound calls: correlation id, user,
/// calling service, timestamp and original remote address.
#[derive(Debug, Clone)]
pub struct CallerMetadataInjector {
    request_id_header: String,
    request_user_header: String,
    request_service_header: String,
    service: RequestService,
}

impl CallerMetadataInjector {
    pub fn new(settings: &Settings, remote: &RemoteService, source_ip: &str) -> Self {
        Self {
            request_id_header: settings.headers.request_id.to_lowercase(),
            request_user_header: settings.headers.request_user.to_lowercase(),
            request_service_header: settings.headers.request_service.to_lowercase(),
            service: RequestService::new(
                settings.service.name.clone(),
                remote.name.clone(),
                source_ip,
                settings.service.version.clone(),
            ),
        }
    }
}

impl BeforeSend for CallerMetadataInjector {
    fn before_send(&self, metadata: &mut MetadataMap) -> Result<(), Status> {
        let caller = CallerContext::current().unwrap_or_default();
        let correlation_id = caller
            .correlation_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let user = if caller.user.is_authenticated {
            caller.user
        } else {
            RequestUser::anonymous()
        };
        let date = chrono::Utc::now().format("%a, %d %b %y %T %z").to_string();
        let ip = caller.remote_addr.unwrap_or_else(|| "unknown".to_string());

        // Identity headers always come from this process, never the call site
        insert_if_absent(metadata, &self.request_id_header, &correlation_id)?;
        set_header(metadata, &self.request_user_header, &user.to_header_value())?;
        set_header(metadata, &self.request_service_header, &self.service.to_header_value())?;
        set_header(metadata, "date", &date)?;
        set_header(metadata, "ip", &ip)?;
        Ok(())
    }
}

/// Bearer credentials for one remote service.
#[derive(Debug, Clone)]
pub struct Authorization {
    value: MetadataValue<Ascii>,
}

impl Authorization {
    pub fn new(header_prefix: &str, token: &str) -> crate::error::Result<Self> {
        let value = MetadataValue::try_from(format!("{} {}", header_prefix, token)).map_err(|_| {
            crate::error::ConfigurationError::Invalid("Service token is not a valid header value".to_string())
        })?;
        Ok(Self { value })
    }

    /// Insert the credentials unless the call already carries an
    /// authorization entry.
    pub fn apply(&self, metadata: &mut MetadataMap) {
        if !metadata.contains_key(AUTHORIZATION_HEADER) {
            metadata.insert(AUTHORIZATION_HEADER, self.value.clone());
        }
    }
}

/// Address other services see this process calling from.
///
/// Connecting a UDP socket sends nothing; it only asks the kernel which local
/// address routes outward.
pub fn detect_source_ip() -> IpAddr {
    let detected = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|socket| {
            socket.connect((Ipv4Addr::new(10, 255, 255, 255), 1))?;
            socket.local_addr()
        })
        .map(|addr| addr.ip());

    match detected {
        Ok(ip) if !ip.is_unspecified() => ip,
        Ok(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
        Err(e) => {
            debug!("Falling back to loopback source address: {}", e);
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

/// The configured source address, or the detected one.
pub fn resolve_source_ip(settings: &Settings) -> String {
    settings
        .service
        .source_ip
        .clone()
        .unwrap_or_else(|| detect_source_ip().to_string())
}
