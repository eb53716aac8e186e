use part::PartName;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::debug;

use engine::PartStore;

use crate::ReplicationError;

/// Moves part bytes between replicas.
pub trait PartExchange: Send + Sync {
    /// The serialized `part` of `table` as held by `replica`.
    fn fetch(&self, replica: &str, table: &str, part: &PartName) -> Result<Vec<u8>, ReplicationError>;

    /// Starts serving the parts of `store` as `replica`.
    fn serve(&self, replica: &str, table: &str, store: Arc<PartStore>);

    /// Stops serving every table of `replica`.
    fn withdraw(&self, replica: &str);
}

#[derive(Default)]
struct Faults {
    unreachable: HashSet<String>,
    corrupting: HashSet<String>,
}

/// In-process exchange: replicas register their stores and peers read the
/// part files directly. Faults can be injected per source replica.
#[derive(Default)]
pub struct LocalExchange {
    stores: RwLock<HashMap<(String, String), Arc<PartStore>>>,
    faults: RwLock<Faults>,
    transfers: AtomicU64,
}

impl LocalExchange {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, replica: &str, table: &str, store: Arc<PartStore>) {
        if let Ok(mut stores) = self.stores.write() {
            stores.insert((replica.to_string(), table.to_string()), store);
        }
    }

    /// Forgets every store of `replica`, as when it shuts down.
    pub fn unregister(&self, replica: &str) {
        if let Ok(mut stores) = self.stores.write() {
            stores.retain(|(r, _), _| r != replica);
        }
    }

    /// Makes fetches from `replica` fail as if the network dropped them.
    pub fn set_unreachable(&self, replica: &str, unreachable: bool) {
        if let Ok(mut f) = self.faults.write() {
            if unreachable {
                f.unreachable.insert(replica.to_string());
            } else {
                f.unreachable.remove(replica);
            }
        }
    }

    /// Makes `replica` send damaged bytes.
    pub fn set_corrupting(&self, replica: &str, corrupting: bool) {
        if let Ok(mut f) = self.faults.write() {
            if corrupting {
                f.corrupting.insert(replica.to_string());
            } else {
                f.corrupting.remove(replica);
            }
        }
    }

    /// Successful transfers so far.
    #[must_use]
    pub fn transfers(&self) -> u64 {
        self.transfers.load(Ordering::Relaxed)
    }
}

impl PartExchange for LocalExchange {
    fn serve(&self, replica: &str, table: &str, store: Arc<PartStore>) {
        self.register(replica, table, store);
    }

    fn withdraw(&self, replica: &str) {
        self.unregister(replica);
    }

    fn fetch(&self, replica: &str, table: &str, part: &PartName) -> Result<Vec<u8>, ReplicationError> {
        let transient = |reason: String| ReplicationError::TransientFetch {
            part: part.to_string(),
            reason,
        };
        let (unreachable, corrupting) = match self.faults.read() {
            Ok(f) => (f.unreachable.contains(replica), f.corrupting.contains(replica)),
            Err(_) => (false, false),
        };
        if unreachable {
            return Err(transient(format!("replica {} is unreachable", replica)));
        }
        let store = self
            .stores
            .read()
            .ok()
            .and_then(|s| s.get(&(replica.to_string(), table.to_string())).cloned())
            .ok_or_else(|| transient(format!("replica {} does not serve table {}", replica, table)))?;

        let mut bytes = store
            .export_part(part)
            .map_err(|e| transient(format!("replica {}: {:#}", replica, e)))?;
        if corrupting {
            if let Some(b) = bytes.last_mut() {
                *b ^= 0xFF;
            }
        }
        self.transfers.fetch_add(1, Ordering::Relaxed);
        debug!(%part, from = replica, bytes = bytes.len(), "part transferred");
        Ok(bytes)
    }
}

impl std::fmt::Debug for LocalExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalExchange")
            .field("transfers", &self.transfers())
            .finish_non_exhaustive()
    }
}
