//! Registered transports keyed by device.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::warn;

use backhaul_protocol::{ConnVersion, DeviceKey};
use backhaul_revdial::Dialer;

use crate::session::Session;

/// A transport an agent registered.
#[derive(Debug, Clone)]
pub enum Transport {
    V1(Arc<Dialer>),
    V2(Arc<Session>),
}

impl Transport {
    pub fn version(&self) -> ConnVersion {
        match self {
            Transport::V1(_) => ConnVersion::V1,
            Transport::V2(_) => ConnVersion::V2,
        }
    }

    pub fn close(&self) {
        match self {
            Transport::V1(dialer) => dialer.close(),
            Transport::V2(session) => session.close(),
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            Transport::V1(dialer) => dialer.is_closed(),
            Transport::V2(session) => session.is_closed(),
        }
    }

    /// Resolves once the transport has shut down.
    pub async fn closed(&self) {
        match self {
            Transport::V1(dialer) => dialer.closed().await,
            Transport::V2(session) => session.closed().await,
        }
    }
}

#[derive(Clone)]
struct Entry {
    id: u64,
    transport: Transport,
}

/// Thread-safe map from device to its registered transports.
///
/// A device that reconnects before its old transport is reaped briefly has
/// two entries; the newest one is what [`load`](Self::load) returns.
/// Removal goes by entry id so a stale transport can never evict the one
/// that replaced it.
#[derive(Default)]
pub struct Connections {
    entries: Mutex<HashMap<DeviceKey, Vec<Entry>>>,
    next_id: AtomicU64,
}

impl Connections {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a transport for `key` and returns the id needed to delete it.
    pub fn store(&self, key: &DeviceKey, transport: Transport) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.lock();
        let list = entries.entry(key.clone()).or_default();
        if !list.is_empty() {
            warn!(
                key = %key,
                existing = list.len(),
                version = %transport.version(),
                "duplicate registration for device"
            );
        }
        list.push(Entry { id, transport });
        id
    }

    /// Most recently stored transport for `key`.
    pub fn load(&self, key: &DeviceKey) -> Option<Transport> {
        let entries = self.lock();
        entries.get(key)?.last().map(|e| e.transport.clone())
    }

    /// Removes the entry `id` under `key`. Returns whether it was present.
    pub fn delete(&self, key: &DeviceKey, id: u64) -> bool {
        let mut entries = self.lock();
        let Some(list) = entries.get_mut(key) else {
            return false;
        };
        let before = list.len();
        list.retain(|e| e.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            entries.remove(key);
        }
        removed
    }

    /// Number of transports stored under `key`.
    pub fn count(&self, key: &DeviceKey) -> usize {
        self.lock().get(key).map(Vec::len).unwrap_or_default()
    }

    /// Number of devices with at least one transport.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every stored transport.
    pub fn all(&self) -> Vec<(DeviceKey, Transport)> {
        self.lock()
            .iter()
            .flat_map(|(k, list)| list.iter().map(move |e| (k.clone(), e.transport.clone())))
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<DeviceKey, Vec<Entry>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}
