use crate::{
    cli::commands::{DescribeCommand, PackagesCommand, ServeCommand},
    config::Settings,
    registry::{PackageSource, StaticPackageSource, StubRegistry},
    server::{InterstellarServer, ServiceDefinition},
};
use anyhow::{Context, Result};
use std::fmt::Write;
use std::sync::Arc;
use tracing::{info, warn};

pub async fn handle_serve(settings: Settings, cmd: ServeCommand) -> Result<()> {
    if !settings.server.enabled {
        warn!("Server half is disabled (server.enabled = false)");
        return Ok(());
    }

    let (host, port) = match cmd.listen.as_deref() {
        Some(listen) => parse_listen(listen)?,
        None => (settings.server.host.clone(), settings.server.port),
    };

    let server = InterstellarServer::new(&settings, &Vec::<ServiceDefinition>::new())
        .context("Failed to configure server")?;
    let addr = server
        .start(&host, port)
        .await
        .with_context(|| format!("Failed to bind {}:{}", host, port))?;
    info!("Serving {} on {}", settings.service.name, addr);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down");
    server.stop().await;

    Ok(())
}

pub fn handle_packages(settings: Settings, cmd: PackagesCommand) -> Result<()> {
    let registry = StubRegistry::new(package_source(&settings)?, &settings.client);
    let packages = registry.scan_available_packages(cmd.service.as_deref())?;
    if packages.is_empty() {
        warn!("No protocol packages found");
    }
    for package in packages {
        println!("{}", package);
    }
    Ok(())
}

pub fn handle_describe(settings: Settings, cmd: DescribeCommand) -> Result<()> {
    let registry = StubRegistry::new(package_source(&settings)?, &settings.client);
    print!("{}", describe(&registry, &cmd.packages)?);
    Ok(())
}

fn package_source(settings: &Settings) -> Result<Arc<dyn PackageSource>> {
    match &settings.client.manifest {
        Some(path) => {
            let source = StaticPackageSource::from_manifest_file(path)
                .with_context(|| format!("Failed to load manifest {}", path.display()))?;
            Ok(Arc::new(source))
        }
        None => {
            warn!("No package manifest configured (client.manifest or --manifest)");
            Ok(Arc::new(StaticPackageSource::new()))
        }
    }
}

fn parse_listen(listen: &str) -> Result<(String, u16)> {
    let (host, port) = listen
        .rsplit_once(':')
        .with_context(|| format!("Invalid listen address {:?}, expected HOST:PORT", listen))?;
    let port = port
        .parse()
        .with_context(|| format!("Invalid port in listen address {:?}", listen))?;
    Ok((host.to_string(), port))
}

fn describe(registry: &StubRegistry, packages: &[String]) -> Result<String> {
    let mut out = String::new();
    for package in packages {
        let id = registry.load_package(package)?;
        writeln!(out, "{}", id)?;

        for entry in registry.entries() {
            if entry.service != id.service || entry.namespace != id.namespace || entry.version != id.version_key() {
                continue;
            }
            writeln!(out, "  {}", entry.stub.name)?;
            for method in &entry.stub.methods {
                writeln!(
                    out,
                    "    {} {} ({} -> {}) [{}]",
                    method.name, method.path, method.request_type, method.reply_type, method.cardinality
                )?;
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Cardinality, MethodDescriptor, ModuleDefinition, PackageDefinition, StubDescriptor};

    #[test]
    fn test_parse_listen() {
        assert_eq!(parse_listen("127.0.0.1:50051").unwrap(), ("127.0.0.1".to_string(), 50051));
        assert!(parse_listen("localhost").is_err());
        assert!(parse_listen("localhost:http").is_err());
    }

    #[test]
    fn test_describe_lists_stub_methods() {
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
        let registry = StubRegistry::new(Arc::new(source), &Settings::default().client);

        let out = describe(&registry, &["grpc-userip-monolith".to_string()]).unwrap();
        assert_eq!(
            out,
            "grpc-userip-monolith\n  UserIpServiceStub\n    GetMyIp /userip.UserIpService/GetMyIp (userip.IpRequest -> userip.IpReply) [unary_unary]\n"
        );

        assert!(describe(&registry, &["grpc-missing-api".to_string()]).is_err());
    }
}
