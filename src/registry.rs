use std::{
    collections::HashMap,
    fmt,
    hash::{Hash, Hasher},
    sync::Arc,
};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::Clock;

/// One registered endpoint of a service.
///
/// Identity is `(scheme, host, port, context)`; `parameters` carry free-form
/// metadata and are ignored for equality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceMeta {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub context: String,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

impl InstanceMeta {
    pub fn new(scheme: &str, host: &str, port: u16, context: &str) -> Self {
        Self {
            scheme: scheme.to_string(),
            host: host.to_string(),
            port,
            context: context.to_string(),
            parameters: HashMap::new(),
        }
    }

    // Canonical URL form, also used inside heartbeat keys. Must stay stable.
    pub fn url(&self) -> String {
        format!("{}://{}:{}/{}", self.scheme, self.host, self.port, self.context)
    }
}

// Hash and Eq are implemented by hand so that `parameters` stays out of identity
impl Hash for InstanceMeta {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.scheme.hash(state);
        self.host.hash(state);
        self.port.hash(state);
        self.context.hash(state);
    }
}

impl PartialEq for InstanceMeta {
    fn eq(&self, other: &Self) -> bool {
        self.scheme == other.scheme
            && self.host == other.host
            && self.port == other.port
            && self.context == other.context
    }
}
impl Eq for InstanceMeta {}

impl fmt::Display for InstanceMeta {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.url())
    }
}

/// Immutable point-in-time copy of the whole registry state.
///
/// Self-describing: a peer (or the durable store) can restore from it without
/// any side information. Field names are part of the wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    #[serde(rename = "REGISTRY")]
    pub registry: HashMap<String, Vec<InstanceMeta>>,
    #[serde(rename = "VERSIONS")]
    pub versions: HashMap<String, u64>,
    #[serde(rename = "TIMESTAMPS")]
    pub timestamps: HashMap<String, u64>,
    pub version: u64,
    #[serde(rename = "createTime", default)]
    pub create_time: u64,
}

// Heartbeat key format: "{service}@{instance url}"
pub fn instance_key(service: &str, instance: &InstanceMeta) -> String {
    format!("{}@{}", service, instance.url())
}

struct Inner {
    services: HashMap<String, Vec<InstanceMeta>>,
    versions: HashMap<String, u64>,
    global_version: u64,
    snapshot_version: u64,
}

/// The replicated in-memory state machine.
///
/// Sole authority over the service map, per-service versions, heartbeat
/// timestamps and the global/snapshot counters. Mutations are serialized by a
/// single lock; heartbeat timestamps additionally live in a concurrent map so
/// the liveness sweeper reads them without contending with renewals.
pub struct RegistryState {
    inner: Mutex<Inner>,
    timestamps: DashMap<String, u64>,
    clock: Arc<dyn Clock>,
}

impl RegistryState {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                services: HashMap::new(),
                versions: HashMap::new(),
                global_version: 0,
                snapshot_version: 0,
            }),
            timestamps: DashMap::new(),
            clock,
        }
    }

    /// Appends the instance under the service unless an equal one is already
    /// there, in which case the stored one is returned unchanged. Does not
    /// touch versions or heartbeat timestamps.
    pub fn register(&self, service: &str, instance: InstanceMeta) -> InstanceMeta {
        let mut inner = self.inner.lock();
        let instances = inner.services.entry(service.to_string()).or_default();

        match instances.iter().find(|x| **x == instance) {
            Some(existing) => existing.clone(),
            None => {
                instances.push(instance.clone());
                instance
            }
        }
    }

    /// Removes the instance from the service. Unknown services and absent
    /// instances are silent no-ops. Versions and timestamps stay untouched.
    pub fn unregister(&self, service: &str, instance: &InstanceMeta) {
        let mut inner = self.inner.lock();
        if let Some(instances) = inner.services.get_mut(service) {
            instances.retain(|x| x != instance);
        }
    }

    /// Current instance list of the service, or `None` for services that were
    /// never registered. Returns a defensive copy.
    pub fn get_all(&self, service: &str) -> Option<Vec<InstanceMeta>> {
        self.inner.lock().services.get(service).cloned()
    }

    /// Records a heartbeat: stamps the instance key with the current time and
    /// bumps the service version and the global version by one each.
    ///
    /// Registration is deliberately not checked; a stale renewal creates a
    /// timestamp entry that the sweeper later ignores.
    pub fn renew(&self, service: &str, instance: &InstanceMeta) {
        let mut inner = self.inner.lock();
        self.timestamps
            .insert(instance_key(service, instance), self.clock.now_ms());
        *inner.versions.entry(service.to_string()).or_insert(0) += 1;
        inner.global_version += 1;
    }

    /// Batch heartbeat: per-service timestamp and version bump for every
    /// service in the batch, but a single global version bump for the call.
    pub fn renews(&self, services: &[String], instance: &InstanceMeta) {
        let mut inner = self.inner.lock();
        let now = self.clock.now_ms();
        for service in services {
            self.timestamps.insert(instance_key(service, instance), now);
            *inner.versions.entry(service.clone()).or_insert(0) += 1;
        }
        inner.global_version += 1;
    }

    pub fn version(&self, service: &str) -> u64 {
        self.inner.lock().versions.get(service).copied().unwrap_or(0)
    }

    pub fn versions(&self, services: &[String]) -> HashMap<String, u64> {
        let inner = self.inner.lock();
        services
            .iter()
            .map(|s| (s.clone(), inner.versions.get(s).copied().unwrap_or(0)))
            .collect()
    }

    pub fn global_version(&self) -> u64 {
        self.inner.lock().global_version
    }

    /// Last exported (or restored) snapshot version, without exporting.
    /// Replication uses this to gate the apply.
    pub fn snapshot_version(&self) -> u64 {
        self.inner.lock().snapshot_version
    }

    /// Heartbeat timestamps as seen right now. Lock-free with respect to
    /// mutations; the sweeper is the main consumer.
    pub fn timestamps(&self) -> HashMap<String, u64> {
        self.timestamps
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }

    /// Exports a deep copy of the whole state under a freshly bumped snapshot
    /// version. The lock is held only while copying; serialization happens at
    /// the caller.
    pub fn snapshot(&self) -> RegistrySnapshot {
        let mut inner = self.inner.lock();
        inner.snapshot_version += 1;

        RegistrySnapshot {
            registry: inner.services.clone(),
            versions: inner.versions.clone(),
            timestamps: self
                .timestamps
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            version: inner.snapshot_version,
            create_time: self.clock.now_ms(),
        }
    }

    /// Replaces the whole state with the snapshot contents. The snapshot
    /// version is adopted as-is; the global version never goes backwards.
    pub fn restore(&self, snapshot: RegistrySnapshot) {
        let mut inner = self.inner.lock();

        inner.services = snapshot.registry;
        inner.versions = snapshot.versions;
        inner.snapshot_version = snapshot.version;
        inner.global_version = inner.global_version.max(snapshot.version);

        self.timestamps.clear();
        for (key, ms) in snapshot.timestamps {
            self.timestamps.insert(key, ms);
        }
    }

    // Service and instance counts for the metrics gauges
    pub fn counts(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        let instances = inner.services.values().map(Vec::len).sum();
        (inner.services.len(), instances)
    }
}
