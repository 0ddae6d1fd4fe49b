//! Stub registry for remote service definitions.
//!
//! This module provides:
//! - [`PackageId`] for parsing `<prefix>-<service>-<namespace>[-<version>]`
//!   package identifiers
//! - [`StubRegistry`], an append-only index of
//!   `service → namespace → version → stub name → stub`
//! - [`PackageSource`], the seam to whatever discovers packages
//!
//! # Usage
//!
//! ```ignore
//! let registry = StubRegistry::new(Arc::new(source), &settings.client);
//! registry.register(&registry.scan_available_packages(Some("userip"))?)?;
//!
//! let stub = registry.get_stub("userip", "monolith", None, "UserIpService", Some("GetMyIp"))?;
//! ```
//!
//! Population is expected to finish during startup; lookups afterwards only
//! take the read lock.

pub mod descriptor;
pub mod source;

pub use descriptor::{Cardinality, MethodDescriptor, ModuleDefinition, PackageDefinition, StubDescriptor};
pub use source::{PackageSource, StaticPackageSource};

use crate::config::ClientSettings;
use crate::error::{ConfigurationError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Version bucket for packages that carry no version.
pub const UNVERSIONED: &str = "unversioned";

/// Suffix of the module that holds generated stubs inside a package.
pub const STUB_MODULE_SUFFIX: &str = "_grpc";

/// Parsed protocol package identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackageId {
    pub prefix: String,
    pub service: String,
    pub namespace: String,
    pub version: Option<String>,
}

impl PackageId {
    pub fn parse(id: &str) -> Result<Self> {
        let parts: Vec<&str> = id.split('-').collect();
        let invalid = || ConfigurationError::InvalidPackageId(id.to_string());

        if parts.iter().any(|p| p.is_empty()) {
            return Err(invalid().into());
        }

        match parts.as_slice() {
            [prefix, service, namespace] => Ok(Self {
                prefix: prefix.to_string(),
                service: service.to_string(),
                namespace: namespace.to_string(),
                version: None,
            }),
            [prefix, service, namespace, version] => Ok(Self {
                prefix: prefix.to_string(),
                service: service.to_string(),
                namespace: namespace.to_string(),
                version: Some(version.to_string()),
            }),
            _ => Err(invalid().into()),
        }
    }

    /// The version bucket this package is indexed under.
    pub fn version_key(&self) -> &str {
        self.version.as_deref().unwrap_or(UNVERSIONED)
    }
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.prefix, self.service, self.namespace)?;
        if let Some(version) = &self.version {
            write!(f, "-{}", version)?;
        }
        Ok(())
    }
}

type StubTable = HashMap<String, Arc<StubDescriptor>>;
type VersionTable = HashMap<String, StubTable>;
type NamespaceTable = HashMap<String, VersionTable>;

/// One indexed stub with the coordinates it lives under.
#[derive(Debug, Clone)]
pub struct StubEntry {
    pub service: String,
    pub namespace: String,
    pub version: String,
    pub stub: Arc<StubDescriptor>,
}

/// Append-only index of stub definitions.
pub struct StubRegistry {
    source: Arc<dyn PackageSource>,
    prefix: String,
    stub_suffix: String,
    stubs: RwLock<HashMap<String, NamespaceTable>>,
}

impl StubRegistry {
    pub fn new(source: Arc<dyn PackageSource>, settings: &ClientSettings) -> Self {
        Self {
            source,
            prefix: settings.package_prefix.clone(),
            stub_suffix: settings.stub_suffix.clone(),
            stubs: RwLock::new(HashMap::new()),
        }
    }

    /// Load every package in `packages`.
    pub fn register<S: AsRef<str>>(&self, packages: &[S]) -> Result<()> {
        for package in packages {
            self.load_package(package.as_ref())?;
        }
        Ok(())
    }

    /// Load one package and index all of its stubs.
    ///
    /// Re-loading a package overwrites identical keys with the new definition.
    pub fn load_package(&self, package: &str) -> Result<PackageId> {
        let mut id = PackageId::parse(package)?;
        let definition = self.source.load(package)?;
        if id.version.is_none() {
            id.version = definition.version.clone();
        }

        let modules: Vec<_> = definition
            .modules
            .iter()
            .filter(|m| m.name.ends_with(STUB_MODULE_SUFFIX))
            .collect();
        if modules.is_empty() {
            return Err(ConfigurationError::PackageLoad {
                package: package.to_string(),
                reason: format!("Could not find module ending with \"{}\"", STUB_MODULE_SUFFIX),
            }
            .into());
        }

        let mut stubs = self.stubs.write();
        let table = stubs
            .entry(id.service.clone())
            .or_default()
            .entry(id.namespace.clone())
            .or_default()
            .entry(id.version_key().to_string())
            .or_default();

        let mut indexed = 0;
        for module in modules {
            for stub in &module.stubs {
                if stub.is_abstract || !stub.name.ends_with(&self.stub_suffix) {
                    continue;
                }
                table.insert(stub.name.clone(), Arc::new(stub.clone()));
                indexed += 1;
            }
        }

        tracing::debug!("Indexed {} stubs from {}", indexed, package);
        Ok(id)
    }

    /// Resolve a stub, and optionally check that it exposes `method`.
    ///
    /// `stub` may omit the configured suffix. `version` defaults to the
    /// unversioned bucket.
    pub fn get_stub(
        &self,
        service: &str,
        namespace: &str,
        version: Option<&str>,
        stub: &str,
        method: Option<&str>,
    ) -> Result<Arc<StubDescriptor>> {
        let version = version.unwrap_or(UNVERSIONED);
        let stub_name = self.normalize_stub_name(stub);
        let stubs = self.stubs.read();

        let namespaces = stubs.get(service).ok_or_else(|| {
            ConfigurationError::NotConfigured(format!(
                "No packages have been installed for service {}.",
                service
            ))
        })?;
        let versions = namespaces.get(namespace).ok_or_else(|| {
            ConfigurationError::NotConfigured(format!(
                "No packages with namespace {} for service: {}.",
                namespace, service
            ))
        })?;
        let table = versions.get(version).ok_or_else(|| {
            ConfigurationError::NotConfigured(format!(
                "No packages with version {} for service: {}, namespace: {}.",
                version, service, namespace
            ))
        })?;
        let descriptor = table.get(&stub_name).ok_or_else(|| ConfigurationError::UnknownStub {
            package: format!("{}-{}-{}", self.prefix, service, namespace),
            stub: stub_name.clone(),
        })?;

        if let Some(method) = method {
            if descriptor.method(method).is_none() {
                return Err(ConfigurationError::UnknownMethod {
                    stub: stub_name,
                    method: method.to_string(),
                }
                .into());
            }
        }

        Ok(Arc::clone(descriptor))
    }

    /// Package identifiers available from the source, optionally only those
    /// of one service.
    pub fn scan_available_packages(&self, service: Option<&str>) -> Result<Vec<String>> {
        let prefix = match service {
            Some(service) => format!("{}-{}-", self.prefix, service),
            None => format!("{}-", self.prefix),
        };
        let mut packages = self.source.scan(&prefix)?;
        packages.sort();
        Ok(packages)
    }

    /// Append the stub suffix when the caller left it off.
    pub fn normalize_stub_name(&self, stub: &str) -> String {
        if stub.ends_with(&self.stub_suffix) {
            stub.to_string()
        } else {
            format!("{}{}", stub, self.stub_suffix)
        }
    }

    /// Every indexed stub, sorted by coordinates.
    pub fn entries(&self) -> Vec<StubEntry> {
        let stubs = self.stubs.read();
        let mut entries: Vec<StubEntry> = stubs
            .iter()
            .flat_map(|(service, namespaces)| {
                namespaces.iter().flat_map(move |(namespace, versions)| {
                    versions.iter().flat_map(move |(version, table)| {
                        table.values().map(move |stub| StubEntry {
                            service: service.clone(),
                            namespace: namespace.clone(),
                            version: version.clone(),
                            stub: Arc::clone(stub),
                        })
                    })
                })
            })
            .collect();
        entries.sort_by(|a, b| {
            (&a.service, &a.namespace, &a.version, &a.stub.name)
                .cmp(&(&b.service, &b.namespace, &b.version, &b.stub.name))
        });
        entries
    }

    pub fn is_empty(&self) -> bool {
        self.stubs.read().is_empty()
    }

    /// Drop every indexed stub.
    pub fn reset(&self) {
        self.stubs.write().clear();
    }
}

impl fmt::Debug for StubRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StubRegistry")
            .field("prefix", &self.prefix)
            .field("stub_suffix", &self.stub_suffix)
            .field("services", &self.stubs.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn userip_package() -> PackageDefinition {
        PackageDefinition {
            version: None,
            modules: vec![
                ModuleDefinition {
                    name: "userip_pb2".into(),
                    stubs: vec![],
                },
                ModuleDefinition {
                    name: "userip_grpc".into(),
                    stubs: vec![
                        StubDescriptor::new(
                            "UserIpServiceStub",
                            vec![
                                MethodDescriptor::for_service(
                                    "userip.UserIpService",
                                    "GetMyIp",
                                    Cardinality::UnaryUnary,
                                    "userip.IpRequest",
                                    "userip.IpReply",
                                ),
                                MethodDescriptor::for_service(
                                    "userip.UserIpService",
                                    "WatchIp",
                                    Cardinality::UnaryStream,
                                    "userip.IpRequest",
                                    "userip.IpReply",
                                ),
                            ],
                        ),
                        StubDescriptor::new("UserIpServiceBase", vec![]),
                        StubDescriptor {
                            name: "AbstractStub".into(),
                            is_abstract: true,
                            methods: vec![],
                        },
                    ],
                },
            ],
        }
    }

    fn registry() -> StubRegistry {
        let source = StaticPackageSource::new()
            .with_package("grpc-userip-monolith", userip_package())
            .with_package("grpc-userip-monolith-v2", userip_package())
            .with_package(
                "grpc-broken-api",
                PackageDefinition {
                    version: None,
                    modules: vec![ModuleDefinition {
                        name: "broken_pb2".into(),
                        stubs: vec![],
                    }],
                },
            );
        StubRegistry::new(Arc::new(source), &ClientSettings::default())
    }

    #[test]
    fn test_package_id_parse() {
        let id = PackageId::parse("grpc-userip-monolith").unwrap();
        assert_eq!(id.service, "userip");
        assert_eq!(id.namespace, "monolith");
        assert_eq!(id.version_key(), UNVERSIONED);

        let id = PackageId::parse("grpc-userip-monolith-v2").unwrap();
        assert_eq!(id.version.as_deref(), Some("v2"));
        assert_eq!(id.to_string(), "grpc-userip-monolith-v2");

        assert!(PackageId::parse("grpc-userip").is_err());
        assert!(PackageId::parse("grpc--monolith").is_err());
        assert!(PackageId::parse("a-b-c-d-e").is_err());
    }

    #[test]
    fn test_get_stub_indexes_only_stubs() {
        let registry = registry();
        registry.register(&["grpc-userip-monolith"]).unwrap();

        let stub = registry
            .get_stub("userip", "monolith", None, "UserIpServiceStub", None)
            .unwrap();
        assert!(stub.name.ends_with("Stub"));
        assert_eq!(stub.method_names().collect::<Vec<_>>(), vec!["GetMyIp", "WatchIp"]);

        assert_eq!(registry.entries().len(), 1);
    }

    #[test]
    fn test_get_stub_normalizes_suffix() {
        let registry = registry();
        registry.register(&["grpc-userip-monolith"]).unwrap();

        let stub = registry
            .get_stub("userip", "monolith", None, "UserIpService", Some("GetMyIp"))
            .unwrap();
        assert_eq!(stub.name, "UserIpServiceStub");
    }

    #[test]
    fn test_get_stub_errors() {
        let registry = registry();
        registry.register(&["grpc-userip-monolith"]).unwrap();

        let err = registry.get_stub("orders", "monolith", None, "X", None).unwrap_err();
        assert!(matches!(err, Error::Configuration(ConfigurationError::NotConfigured(_))));

        let err = registry.get_stub("userip", "edge", None, "X", None).unwrap_err();
        assert!(matches!(err, Error::Configuration(ConfigurationError::NotConfigured(_))));

        let err = registry
            .get_stub("userip", "monolith", Some("v9"), "UserIpService", None)
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(ConfigurationError::NotConfigured(_))));

        let err = registry.get_stub("userip", "monolith", None, "Nope", None).unwrap_err();
        assert!(matches!(
            err,
            Error::Configuration(ConfigurationError::UnknownStub { ref stub, .. }) if stub == "NopeStub"
        ));

        let err = registry
            .get_stub("userip", "monolith", None, "UserIpService", Some("Missing"))
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(ConfigurationError::UnknownMethod { .. })));
    }

    #[test]
    fn test_versioned_packages_are_separate_buckets() {
        let registry = registry();
        registry
            .register(&["grpc-userip-monolith", "grpc-userip-monolith-v2"])
            .unwrap();

        assert!(registry
            .get_stub("userip", "monolith", Some("v2"), "UserIpService", None)
            .is_ok());
        assert!(registry
            .get_stub("userip", "monolith", None, "UserIpService", None)
            .is_ok());
        assert_eq!(registry.entries().len(), 2);
    }

    #[test]
    fn test_reload_is_idempotent() {
        let registry = registry();
        registry.register(&["grpc-userip-monolith"]).unwrap();
        let first = registry
            .get_stub("userip", "monolith", None, "UserIpService", None)
            .unwrap();

        registry.register(&["grpc-userip-monolith"]).unwrap();
        let second = registry
            .get_stub("userip", "monolith", None, "UserIpService", None)
            .unwrap();

        assert_eq!(*first, *second);
        assert_eq!(registry.entries().len(), 1);
    }

    #[test]
    fn test_missing_stub_module_fails() {
        let registry = registry();
        let err = registry.load_package("grpc-broken-api").unwrap_err();
        assert!(matches!(err, Error::Configuration(ConfigurationError::PackageLoad { .. })));

        let err = registry.load_package("grpc-absent-api").unwrap_err();
        assert!(matches!(err, Error::Configuration(ConfigurationError::PackageNotFound(_))));
    }

    #[test]
    fn test_scan_and_reset() {
        let registry = registry();
        assert_eq!(
            registry.scan_available_packages(Some("userip")).unwrap(),
            vec!["grpc-userip-monolith", "grpc-userip-monolith-v2"]
        );
        assert_eq!(registry.scan_available_packages(None).unwrap().len(), 3);

        registry.register(&["grpc-userip-monolith"]).unwrap();
        assert!(!registry.is_empty());
        registry.reset();
        assert!(registry.is_empty());
    }
}
