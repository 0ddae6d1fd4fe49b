//! Package discovery.
//!
//! The registry never touches a packaging system directly; it asks a
//! [`PackageSource`] to enumerate package identifiers and to return the method
//! table of one package. [`StaticPackageSource`] serves packages from memory
//! or from a JSON manifest:
//!
//! ```json
//! {
//!   "packages": [
//!     {
//!       "id": "grpc-userip-monolith",
//!       "modules": [
//!         {
//!           "name": "userip_grpc",
//!           "stubs": [
//!             {
//!               "name": "UserIpServiceStub",
//!               "methods": [
//!                 {
//!                   "name": "GetMyIp",
//!                   "path": "/userip.UserIpService/GetMyIp",
//!                   "cardinality": "unary_unary",
//!                   "request_type": "userip.IpRequest",
//!                   "reply_type": "userip.IpReply"
//!                 }
//!               ]
//!             }
//!           ]
//!         }
//!       ]
//!     }
//!   ]
//! }
//! ```

use super::descriptor::{ModuleDefinition, PackageDefinition};
use crate::error::{ConfigurationError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Discovery strategy for protocol packages.
pub trait PackageSource: Send + Sync {
    /// Identifiers of all packages starting with `prefix`.
    fn scan(&self, prefix: &str) -> Result<Vec<String>>;

    /// The definition of one package.
    fn load(&self, package: &str) -> Result<PackageDefinition>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    #[serde(default)]
    packages: Vec<ManifestPackage>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ManifestPackage {
    id: String,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    modules: Vec<ModuleDefinition>,
}

/// In-memory package catalogue.
#[derive(Debug, Clone, Default)]
pub struct StaticPackageSource {
    packages: BTreeMap<String, PackageDefinition>,
}

impl StaticPackageSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_package(mut self, id: impl Into<String>, definition: PackageDefinition) -> Self {
        self.packages.insert(id.into(), definition);
        self
    }

    pub fn insert(&mut self, id: impl Into<String>, definition: PackageDefinition) {
        self.packages.insert(id.into(), definition);
    }

    /// Parse a JSON manifest document.
    pub fn from_json(document: &str) -> Result<Self> {
        let manifest: Manifest = serde_json::from_str(document)?;
        Ok(Self::from_manifest(manifest))
    }

    /// Read a JSON manifest from disk.
    pub fn from_manifest_file(path: &Path) -> Result<Self> {
        let document = std::fs::read_to_string(path)?;
        let manifest: Manifest =
            serde_json::from_str(&document).map_err(|e| ConfigurationError::Manifest {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        tracing::debug!("Loaded {} packages from {}", manifest.packages.len(), path.display());
        Ok(Self::from_manifest(manifest))
    }

    fn from_manifest(manifest: Manifest) -> Self {
        let packages = manifest
            .packages
            .into_iter()
            .map(|p| {
                (
                    p.id,
                    PackageDefinition {
                        version: p.version,
                        modules: p.modules,
                    },
                )
            })
            .collect();
        Self { packages }
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}

impl PackageSource for StaticPackageSource {
    fn scan(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .packages
            .keys()
            .filter(|id| id.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn load(&self, package: &str) -> Result<PackageDefinition> {
        self.packages
            .get(package)
            .cloned()
            .ok_or_else(|| ConfigurationError::PackageNotFound(package.to_string()).into())
    }
}
