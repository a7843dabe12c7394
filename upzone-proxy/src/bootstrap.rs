//! Turns the configuration into a zone directory backed by shared segments.

use crate::config::{Config, ServerConfig, UpstreamConfig};
use anyhow::Context;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use upzone_core::domain::Resolver;
use upzone_core::{PeerAddress, PeerRegistry, PeerSettings, Segment, Zone, ZoneDirectory};

/// Map (or create) every configured zone's segment.
///
/// The first worker to open a segment installs the registry and the
/// statically configured servers; later workers attach to what is there,
/// including peers added at runtime.
pub fn build_directory(config: &Config, resolver: &dyn Resolver) -> anyhow::Result<ZoneDirectory> {
    let zones = config
        .upstreams
        .iter()
        .map(|upstream| open_zone(config, upstream, resolver))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let directory = ZoneDirectory::new(zones)?;
    info!(zones = ?directory.display_names(), "zone directory ready");
    Ok(directory)
}

fn open_zone(
    config: &Config,
    upstream: &UpstreamConfig,
    resolver: &dyn Resolver,
) -> anyhow::Result<Zone> {
    let zone = Zone::new(upstream.name.as_str(), upstream.port);
    let (Some(zone_name), Some(path)) = (&upstream.zone, upstream.segment_path(&config.shm_dir))
    else {
        debug!(upstream = %upstream.name, "static upstream, no shared zone");
        return Ok(zone);
    };

    let peers = upstream
        .servers
        .iter()
        .map(|server| static_peer(server, resolver))
        .collect::<anyhow::Result<Vec<_>>>()
        .with_context(|| format!("upstream {:?}", upstream.name))?;

    let segment = Segment::open(&path, zone_name, upstream.zone_size, |segment| {
        let registry = PeerRegistry::install(segment)?;
        for (address, settings) in &peers {
            registry
                .add(address, settings)
                .with_context(|| format!("server {:?}", address.name()))?;
        }
        Ok::<_, anyhow::Error>(())
    })
    .with_context(|| format!("opening zone {zone_name:?} at {}", path.display()))?;

    Ok(zone.with_segment(Arc::new(segment)))
}

fn static_peer(
    server: &ServerConfig,
    resolver: &dyn Resolver,
) -> anyhow::Result<(PeerAddress, PeerSettings)> {
    let address = PeerAddress::parse(&server.address, resolver)?;
    let weight = NonZeroU32::new(server.weight)
        .with_context(|| format!("server {:?}: weight must be positive", server.address))?;

    Ok((
        address,
        PeerSettings {
            weight,
            max_fails: server.max_fails,
            fail_timeout: Duration::from_secs(server.fail_timeout),
            down: server.down,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use upzone_core::domain::LiteralResolver;

    fn config(shm_dir: &std::path::Path) -> Config {
        Config::from_toml(&format!(
            r#"
            shm_dir = "{}"

            [[upstream]]
            name = "backend"
            port = 8080
            zone = "backend_pool"
            zone_size = 16384

            [[upstream.server]]
            address = "10.0.0.1:8080"
            weight = 3

            [[upstream.server]]
            address = "10.0.0.2:8080"
            down = true

            [[upstream]]
            name = "legacy"
            "#,
            shm_dir.display()
        ))
        .unwrap()
    }

    #[test]
    fn installs_static_servers_once() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());

        let first = build_directory(&config, &LiteralResolver).unwrap();
        let registry = first.resolve("backend_pool").unwrap().registry().unwrap();
        assert_eq!(registry.len(), 2);
        assert!(registry.find("10.0.0.2:8080").unwrap().is_down());

        let runtime = PeerAddress::parse("10.0.0.3:8080", &LiteralResolver).unwrap();
        registry.add(&runtime, &PeerSettings::default()).unwrap();

        let second = build_directory(&config, &LiteralResolver).unwrap();
        let names: Vec<_> = second
            .resolve("backend_pool")
            .unwrap()
            .registry()
            .unwrap()
            .list()
            .into_iter()
            .map(|peer| peer.name)
            .collect();
        assert_eq!(names, ["10.0.0.1:8080", "10.0.0.2:8080", "10.0.0.3:8080"]);
        assert_eq!(second.display_names(), ["backend_pool:8080"]);
        assert!(second.resolve("legacy").is_err());
    }

    #[test]
    fn unresolvable_static_server_fails_startup() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.upstreams[0].servers[0].address = "nowhere.invalid".into();

        let err = build_directory(&config, &LiteralResolver).unwrap_err();
        assert!(format!("{err:#}").contains("backend"));
    }
}
