//! Configuration management for Interstellar.
//!
//! This module provides configuration handling through multiple sources:
//! 1. Default configuration (embedded in binary)
//! 2. System-wide configuration file (`/etc/interstellar/config.toml`)
//! 3. User-specified configuration file
//! 4. Environment variables (prefixed with `INTERSTELLAR`, nested keys
//!    separated by `__`, e.g. `INTERSTELLAR_SERVER__PORT`)
//! 5. Command-line arguments
//!
//! Configuration options are loaded in order of precedence, with later sources
//! overriding earlier ones.

use crate::error::Result;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");

/// Command-line arguments
#[derive(Debug, Default, Parser)]
pub struct Args {
    /// Configuration file path
    #[clap(short, long)]
    pub config: Option<PathBuf>,

    /// Local service name
    #[clap(long)]
    pub service_name: Option<String>,

    /// Server bind host
    #[clap(long)]
    pub host: Option<String>,

    /// Server bind port
    #[clap(long)]
    pub port: Option<u16>,

    /// Package manifest used for stub discovery
    #[clap(long)]
    pub manifest: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[clap(long)]
    pub log_level: Option<String>,
}

/// Complete Interstellar configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub service: ServiceSettings,
    #[serde(default)]
    pub headers: HeaderSettings,
    #[serde(default)]
    pub auth: AuthSettings,
    #[serde(default)]
    pub client: ClientSettings,
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Identity of the local service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSettings {
    /// Name other services must address as audience
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Source IP advertised on outbound calls; detected when unset
    #[serde(default)]
    pub source_ip: Option<String>,
    /// Destination version advertised on outbound calls
    #[serde(default = "default_service_version")]
    pub version: String,
}

/// Metadata header names shared by both halves
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderSettings {
    #[serde(default = "default_request_user_header")]
    pub request_user: String,
    #[serde(default = "default_request_service_header")]
    pub request_service: String,
    #[serde(default = "default_request_id_header")]
    pub request_id: String,
    #[serde(default = "default_error_code_header")]
    pub error_code: String,
}

/// How inbound callers prove their service identity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthScheme {
    /// Trust the peer-service header and check its audience
    #[default]
    ServiceHeader,
    /// Verify a bearer token from the authorization header
    BearerToken,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSettings {
    #[serde(default)]
    pub scheme: AuthScheme,
    /// Scheme word expected before bearer credentials
    #[serde(default = "default_header_prefix")]
    pub header_prefix: String,
}

/// A remote service the client half may call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteService {
    pub name: String,
    pub host: String,
    pub port: u16,
    /// Service token sent as bearer credentials when present
    #[serde(default)]
    pub token: Option<String>,
}

impl RemoteService {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

/// Client half configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    /// Upper bound of pooled channels per remote service
    #[serde(default = "default_max_channels")]
    pub max_channels_per_service: usize,
    /// Prefix every protocol package identifier starts with
    #[serde(default = "default_package_prefix")]
    pub package_prefix: String,
    /// Suffix of stub type names
    #[serde(default = "default_stub_suffix")]
    pub stub_suffix: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
    /// Package manifest used by the static discovery source
    #[serde(default)]
    pub manifest: Option<PathBuf>,
    /// Configured remote services
    #[serde(default)]
    pub services: Vec<RemoteService>,
}

impl ClientSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }
}

/// Server half configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_server_enabled")]
    pub enabled: bool,
    #[serde(default = "default_server_host")]
    pub host: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
    /// Codec subtype accepted after `application/grpc+`
    #[serde(default = "default_content_subtype")]
    pub content_subtype: String,
    /// Largest accepted request message in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// Time a cancelled handler gets to wind down before cancellation counts as failed
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,
    /// Response frames buffered per stream
    #[serde(default = "default_response_buffer")]
    pub response_buffer: usize,
}

impl ServerSettings {
    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Full `EnvFilter` directive; overrides `level` when set
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default)]
    pub format: LogFormat,
    /// Directory for a rolling log file; stdout when unset
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

impl Settings {
    /// Load configuration from all sources
    pub fn load(args: &Args) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::File::from_str(DEFAULT_CONFIG, config::FileFormat::Toml))
            .add_source(config::File::with_name("/etc/interstellar/config.toml").required(false));

        // Load user config if specified
        if let Some(path) = &args.config {
            builder = builder.add_source(config::File::from(path.as_path()));
        }

        // Add environment variables
        builder = builder.add_source(
            config::Environment::with_prefix("INTERSTELLAR")
                .prefix_separator("_")
                .separator("__"),
        );

        let mut settings: Settings = builder.build()?.try_deserialize()?;
        settings.apply_args(args);
        Ok(settings)
    }

    /// Parse settings from a TOML document layered over the defaults
    pub fn from_toml(document: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(DEFAULT_CONFIG, config::FileFormat::Toml))
            .add_source(config::File::from_str(document, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }

    fn apply_args(&mut self, args: &Args) {
        if let Some(name) = &args.service_name {
            self.service.name = name.clone();
        }
        if let Some(host) = &args.host {
            self.server.host = host.clone();
        }
        if let Some(port) = args.port {
            self.server.port = port;
        }
        if let Some(manifest) = &args.manifest {
            self.client.manifest = Some(manifest.clone());
        }
        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
        }
    }

    /// Look up a configured remote service by name
    pub fn remote_service(&self, name: &str) -> Option<&RemoteService> {
        self.client.services.iter().find(|s| s.name == name)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            service: ServiceSettings::default(),
            headers: HeaderSettings::default(),
            auth: AuthSettings::default(),
            client: ClientSettings::default(),
            server: ServerSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            source_ip: None,
            version: default_service_version(),
        }
    }
}

impl Default for HeaderSettings {
    fn default() -> Self {
        Self {
            request_user: default_request_user_header(),
            request_service: default_request_service_header(),
            request_id: default_request_id_header(),
            error_code: default_error_code_header(),
        }
    }
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            scheme: AuthScheme::default(),
            header_prefix: default_header_prefix(),
        }
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            max_channels_per_service: default_max_channels(),
            package_prefix: default_package_prefix(),
            stub_suffix: default_stub_suffix(),
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: None,
            manifest: None,
            services: Vec::new(),
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            enabled: default_server_enabled(),
            host: default_server_host(),
            port: default_server_port(),
            content_subtype: default_content_subtype(),
            max_message_size: default_max_message_size(),
            cancel_grace_ms: default_cancel_grace_ms(),
            response_buffer: default_response_buffer(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            filter: None,
            format: LogFormat::default(),
            directory: None,
        }
    }
}

fn default_service_name() -> String {
    "interstellar".to_string()
}

fn default_service_version() -> String {
    "0.0.1".to_string()
}

fn default_request_user_header() -> String {
    "x-request-user".to_string()
}

fn default_request_service_header() -> String {
    "x-request-service".to_string()
}

fn default_request_id_header() -> String {
    "x-request-id".to_string()
}

fn default_error_code_header() -> String {
    "x-error-code".to_string()
}

fn default_header_prefix() -> String {
    "Bearer".to_string()
}

fn default_max_channels() -> usize {
    4
}

fn default_package_prefix() -> String {
    "grpc".to_string()
}

fn default_stub_suffix() -> String {
    "Stub".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_server_enabled() -> bool {
    true
}

fn default_server_host() -> String {
    "0.0.0.0".to_string()
}

fn default_server_port() -> u16 {
    50051
}

fn default_content_subtype() -> String {
    "proto".to_string()
}

fn default_max_message_size() -> usize {
    4 * 1024 * 1024
}

fn default_cancel_grace_ms() -> u64 {
    100
}

fn default_response_buffer() -> usize {
    32
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let settings = Settings::load(&Args::default()).unwrap();
        assert_eq!(settings.client.max_channels_per_service, 4);
        assert_eq!(settings.client.package_prefix, "grpc");
        assert_eq!(settings.client.stub_suffix, "Stub");
        assert_eq!(settings.server.content_subtype, "proto");
        assert_eq!(settings.auth.scheme, AuthScheme::ServiceHeader);
        assert_eq!(settings.headers.request_user, "x-request-user");
    }

    #[test]
    fn test_embedded_defaults_match_default_impl() {
        let loaded = Settings::from_toml("").unwrap();
        let built = Settings::default();
        assert_eq!(loaded.service.name, built.service.name);
        assert_eq!(loaded.server.port, built.server.port);
        assert_eq!(loaded.server.cancel_grace_ms, built.server.cancel_grace_ms);
        assert_eq!(loaded.client.connect_timeout_ms, built.client.connect_timeout_ms);
        assert_eq!(loaded.headers.error_code, built.headers.error_code);
    }

    #[test]
    fn test_remote_services_from_toml() {
        let settings = Settings::from_toml(
            r#"
            [auth]
            scheme = "bearer_token"

            [[client.services]]
            name = "userip"
            host = "10.0.0.5"
            port = 8000
            token = "secret"
            "#,
        )
        .unwrap();

        assert_eq!(settings.auth.scheme, AuthScheme::BearerToken);
        let remote = settings.remote_service("userip").unwrap();
        assert_eq!(remote.host, "10.0.0.5");
        assert_eq!(remote.port, 8000);
        assert_eq!(remote.token.as_deref(), Some("secret"));
        assert!(settings.remote_service("missing").is_none());
    }

    #[test]
    fn test_args_override() {
        let args = Args {
            service_name: Some("orders".into()),
            port: Some(6000),
            log_level: Some("debug".into()),
            ..Default::default()
        };
        let settings = Settings::load(&args).unwrap();
        assert_eq!(settings.service.name, "orders");
        assert_eq!(settings.server.port, 6000);
        assert_eq!(settings.logging.level, "debug");
    }
}
