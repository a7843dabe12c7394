//! Zone directory: maps zone names to their shared segments.

use crate::domain::registry::PeerRegistry;
use crate::error::{DirectoryError, RegistryError};
use crate::shm::Segment;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// One configured upstream.
///
/// Only upstreams with a shared segment take part in dynamic operations.
#[derive(Debug, Clone)]
pub struct Zone {
    upstream: String,
    port: Option<u16>,
    segment: Option<Arc<Segment>>,
}

impl Zone {
    /// A static upstream without shared state.
    pub fn new(upstream: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            upstream: upstream.into(),
            port,
            segment: None,
        }
    }

    /// Attach the shared segment holding this upstream's registry.
    pub fn with_segment(mut self, segment: Arc<Segment>) -> Self {
        self.segment = Some(segment);
        self
    }

    /// Upstream name from the configuration.
    pub fn upstream(&self) -> &str {
        &self.upstream
    }

    /// Display port suffix.
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Name of the shared segment, if any.
    pub fn zone_name(&self) -> Option<&str> {
        self.segment.as_deref().map(Segment::name)
    }

    /// `name` or `name:port`, for zones with a non-empty segment name.
    pub fn display_name(&self) -> Option<String> {
        let name = self.zone_name().filter(|name| !name.is_empty())?;
        Some(match self.port {
            Some(port) => format!("{name}:{port}"),
            None => name.to_owned(),
        })
    }
}

/// A zone resolved by name, borrowing its segment.
#[derive(Debug, Clone, Copy)]
pub struct ZoneHandle<'a> {
    zone: &'a Zone,
    segment: &'a Segment,
}

impl<'a> ZoneHandle<'a> {
    /// The configured upstream.
    pub fn zone(&self) -> &'a Zone {
        self.zone
    }

    /// The zone's shared segment.
    pub fn segment(&self) -> &'a Segment {
        self.segment
    }

    /// The zone's registry, or [`RegistryError::NoPeerData`].
    pub fn registry(&self) -> Result<PeerRegistry<'a>, RegistryError> {
        PeerRegistry::attach(self.segment)
    }
}

/// Every upstream of one proxy instance. Immutable once built.
#[derive(Debug, Clone, Default)]
pub struct ZoneDirectory {
    zones: Vec<Zone>,
}

impl ZoneDirectory {
    /// Build the directory, rejecting duplicate upstream or zone names.
    pub fn new(zones: Vec<Zone>) -> Result<Self, DirectoryError> {
        let mut upstreams = HashSet::new();
        let mut shared = HashSet::new();

        for zone in &zones {
            if !upstreams.insert(zone.upstream()) {
                return Err(DirectoryError::DuplicateUpstream(zone.upstream().to_owned()));
            }
            if let Some(name) = zone.zone_name() {
                if !shared.insert(name) {
                    return Err(DirectoryError::DuplicateZone(name.to_owned()));
                }
            }
        }

        Ok(Self { zones })
    }

    /// All upstreams in configuration order.
    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    /// Display names of every upstream with a named shared segment.
    pub fn display_names(&self) -> Vec<String> {
        self.zones.iter().filter_map(Zone::display_name).collect()
    }

    /// Find the zone whose segment is named exactly `name`.
    pub fn resolve(&self, name: &str) -> Result<ZoneHandle<'_>, RegistryError> {
        let found = self.zones.iter().find_map(|zone| {
            let segment = zone.segment.as_deref()?;
            (segment.name().as_bytes() == name.as_bytes()).then_some(ZoneHandle { zone, segment })
        });

        debug!(zone = name, found = found.is_some(), "zone lookup");
        found.ok_or(RegistryError::ZoneNotFound)
    }
}
