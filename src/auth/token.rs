//! Bearer token verification seam.
//!
//! Token cryptography lives outside this crate. A [`TokenDecoder`] turns a raw
//! token into the claims that describe the calling service, or explains why
//! it cannot.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Service identity claims carried by a bearer token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceClaims {
    /// Calling service
    pub source: String,
    /// Service the token was issued for
    pub aud: String,
    #[serde(default)]
    pub source_ip: Option<String>,
    #[serde(default)]
    pub destination_version: Option<String>,
}

/// Errors from token decoding
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("Signature has expired.")]
    Expired,

    #[error("Error decoding signature.")]
    Decode,

    #[error("Invalid token: {0}")]
    Invalid(String),
}

/// Decodes and verifies bearer tokens.
pub trait TokenDecoder: Send + Sync {
    fn decode(&self, token: &str) -> Result<ServiceClaims, TokenError>;
}

impl<F> TokenDecoder for F
where
    F: Fn(&str) -> Result<ServiceClaims, TokenError> + Send + Sync,
{
    fn decode(&self, token: &str) -> Result<ServiceClaims, TokenError> {
        (self)(token)
    }
}
