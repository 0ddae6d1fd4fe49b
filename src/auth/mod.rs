//! Principal extraction for inbound calls.
//!
//! Every inbound call carries a caller-identity header and proves its calling
//! service either through a peer-service header or a bearer token, selected by
//! [`AuthScheme`]. The result is a [`Principal`] that is always fully
//! populated; anything less is an [`AuthenticationError`].

pub mod header;
pub mod token;

pub use token::{ServiceClaims, TokenDecoder, TokenError};

use crate::config::{AuthScheme, Settings};
use crate::error::{AuthenticationError, ConfigurationError, Result};
use std::sync::Arc;
use tonic::metadata::MetadataMap;

/// Identity of the end user a call is made on behalf of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestUser {
    pub id: String,
    pub level: i64,
    pub is_authenticated: bool,
}

impl RequestUser {
    pub fn new(id: impl Into<String>, level: i64) -> Self {
        let id = id.into();
        Self {
            is_authenticated: !id.is_empty(),
            id,
            level,
        }
    }

    pub fn anonymous() -> Self {
        Self::new("", -1)
    }

    /// Parse `id=<id>;level=<level>`; missing keys keep their anonymous
    /// defaults.
    pub fn from_header_value(value: &str) -> std::result::Result<Self, AuthenticationError> {
        let pairs = header::parse_pairs(value).map_err(|_| AuthenticationError::InvalidUser)?;
        let mut user = Self::anonymous();
        for (key, value) in pairs {
            match key.as_str() {
                "id" => user.id = value,
                "level" => {
                    user.level = value.parse().map_err(|_| AuthenticationError::InvalidUser)?
                }
                _ => return Err(AuthenticationError::InvalidUser),
            }
        }
        user.is_authenticated = !user.id.is_empty();
        Ok(user)
    }

    pub fn to_header_value(&self) -> String {
        let level = self.level.to_string();
        header::to_header_value([("id", self.id.as_str()), ("level", level.as_str())])
    }
}

impl Default for RequestUser {
    fn default() -> Self {
        Self::anonymous()
    }
}

/// Identity of the service a call comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestService {
    pub source: String,
    pub aud: String,
    pub source_ip: String,
    pub destination_version: String,
    pub is_authenticated: bool,
}

impl RequestService {
    pub fn new(
        source: impl Into<String>,
        aud: impl Into<String>,
        source_ip: impl Into<String>,
        destination_version: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            aud: aud.into(),
            source_ip: source_ip.into(),
            destination_version: destination_version.into(),
            is_authenticated: false,
        }
    }

    /// Parse `source=..;aud=..;source_ip=..;destination_version=..`. All four
    /// keys are required and no others are accepted.
    pub fn from_header_value(value: &str) -> std::result::Result<Self, AuthenticationError> {
        let pairs = header::parse_pairs(value).map_err(|_| AuthenticationError::InvalidService)?;
        let (mut source, mut aud, mut source_ip, mut destination_version) = (None, None, None, None);
        for (key, value) in pairs {
            let slot = match key.as_str() {
                "source" => &mut source,
                "aud" => &mut aud,
                "source_ip" => &mut source_ip,
                "destination_version" => &mut destination_version,
                _ => return Err(AuthenticationError::InvalidService),
            };
            *slot = Some(value);
        }

        match (source, aud, source_ip, destination_version) {
            (Some(source), Some(aud), Some(source_ip), Some(destination_version)) => Ok(Self {
                source,
                aud,
                source_ip,
                destination_version,
                is_authenticated: true,
            }),
            _ => Err(AuthenticationError::InvalidService),
        }
    }

    pub fn from_claims(claims: ServiceClaims) -> Self {
        Self {
            source: claims.source,
            aud: claims.aud,
            source_ip: claims.source_ip.unwrap_or_default(),
            destination_version: claims.destination_version.unwrap_or_default(),
            is_authenticated: true,
        }
    }

    pub fn to_header_value(&self) -> String {
        header::to_header_value([
            ("source", self.source.as_str()),
            ("aud", self.aud.as_str()),
            ("source_ip", self.source_ip.as_str()),
            ("destination_version", self.destination_version.as_str()),
        ])
    }

    /// Whether this identity may call `service_name`.
    pub fn is_valid(&self, service_name: &str) -> bool {
        self.is_authenticated && !self.source.is_empty() && self.aud == service_name
    }
}

/// The authenticated (user, calling service) pair attached to an inbound call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user: RequestUser,
    pub service: RequestService,
}

/// Extracts principals from call metadata.
#[derive(Clone)]
pub struct Authenticator {
    scheme: AuthScheme,
    service_name: String,
    user_header: String,
    service_header: String,
    header_prefix: String,
    decoder: Option<Arc<dyn TokenDecoder>>,
}

impl Authenticator {
    /// Build from settings. The bearer-token scheme needs a decoder.
    pub fn new(settings: &Settings, decoder: Option<Arc<dyn TokenDecoder>>) -> Result<Self> {
        if settings.auth.scheme == AuthScheme::BearerToken && decoder.is_none() {
            return Err(ConfigurationError::Invalid(
                "auth.scheme = \"bearer_token\" requires a token decoder".to_string(),
            )
            .into());
        }

        Ok(Self {
            scheme: settings.auth.scheme,
            service_name: settings.service.name.clone(),
            user_header: settings.headers.request_user.to_lowercase(),
            service_header: settings.headers.request_service.to_lowercase(),
            header_prefix: settings.auth.header_prefix.to_lowercase(),
            decoder,
        })
    }

    pub fn scheme(&self) -> AuthScheme {
        self.scheme
    }

    pub fn authenticate(&self, metadata: &MetadataMap) -> std::result::Result<Principal, AuthenticationError> {
        let user = match metadata.get(self.user_header.as_str()) {
            None => return Err(AuthenticationError::MissingUser),
            Some(value) => {
                let value = value.to_str().map_err(|_| AuthenticationError::InvalidUser)?;
                RequestUser::from_header_value(value)?
            }
        };

        let service = match self.scheme {
            AuthScheme::ServiceHeader => self.service_from_header(metadata)?,
            AuthScheme::BearerToken => self.service_from_token(metadata)?,
        };

        if !service.is_valid(&self.service_name) {
            return Err(AuthenticationError::InvalidAudience(self.service_name.clone()));
        }

        Ok(Principal { user, service })
    }

    fn service_from_header(&self, metadata: &MetadataMap) -> std::result::Result<RequestService, AuthenticationError> {
        let value = metadata
            .get(self.service_header.as_str())
            .ok_or(AuthenticationError::MissingService)?
            .to_str()
            .map_err(|_| AuthenticationError::InvalidService)?;
        RequestService::from_header_value(value)
    }

    fn service_from_token(&self, metadata: &MetadataMap) -> std::result::Result<RequestService, AuthenticationError> {
        let value = metadata
            .get("authorization")
            .ok_or(AuthenticationError::MissingCredentials)?
            .to_str()
            .map_err(|_| AuthenticationError::InvalidPrefix)?;

        let token = self.bearer_token(value)?;
        let decoder = self
            .decoder
            .as_ref()
            .ok_or_else(|| AuthenticationError::InvalidToken("No token decoder configured.".to_string()))?;
        let claims = decoder
            .decode(token)
            .map_err(|e| AuthenticationError::InvalidToken(e.to_string()))?;

        Ok(RequestService::from_claims(claims))
    }

    fn bearer_token<'a>(&self, value: &'a str) -> std::result::Result<&'a str, AuthenticationError> {
        let parts: Vec<&str> = value.split_whitespace().collect();
        match parts.as_slice() {
            [] => Err(AuthenticationError::InvalidPrefix),
            [prefix, ..] if prefix.to_lowercase() != self.header_prefix => {
                Err(AuthenticationError::InvalidPrefix)
            }
            [_] => Err(AuthenticationError::NoCredentials),
            [_, token] => Ok(token),
            _ => Err(AuthenticationError::CredentialsContainSpaces),
        }
    }
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("scheme", &self.scheme)
            .field("service_name", &self.service_name)
            .field("has_decoder", &self.decoder.is_some())
            .finish()
    }
}
