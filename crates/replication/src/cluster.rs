use config::ClusterConfig;
use consensus::{Coordination, LocalNetwork};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::exchange::{LocalExchange, PartExchange};
use crate::{Replica, ReplicationError};

/// Upper bound on sync rounds in [`LocalCluster::sync_all`].
const MAX_SYNC_ROUNDS: usize = 32;

/// Every replica of a shard in one process: a consensus group on a
/// [`LocalNetwork`] and replicas exchanging parts through a
/// [`LocalExchange`]. Replica `n` runs next to consensus node `n`.
pub struct LocalCluster {
    config: ClusterConfig,
    network: LocalNetwork,
    exchange: Arc<LocalExchange>,
    replicas: BTreeMap<u64, Option<Replica>>,
}

impl LocalCluster {
    /// Starts `config.replicas` replicas under `config.data_dir`.
    pub fn start(config: ClusterConfig) -> Result<Self, ReplicationError> {
        let network = LocalNetwork::start(
            &config.data_dir.join("raft"),
            config.replicas,
            config.consensus.clone(),
        )?;
        let exchange = Arc::new(LocalExchange::new());
        let mut cluster = Self {
            config,
            network,
            exchange,
            replicas: BTreeMap::new(),
        };
        for id in cluster.network.members() {
            let replica = cluster.open_replica(id)?;
            cluster.replicas.insert(id, Some(replica));
        }
        info!(
            replicas = cluster.replicas.len(),
            leader = ?cluster.network.leader(),
            "local cluster started"
        );
        Ok(cluster)
    }

    fn open_replica(&self, id: u64) -> Result<Replica, ReplicationError> {
        let coord: Arc<dyn Coordination> = Arc::new(self.network.handle(id));
        let exchange: Arc<dyn PartExchange> = Arc::clone(&self.exchange) as Arc<dyn PartExchange>;
        Replica::open(self.config.identity(id), self.config.clone(), coord, exchange)
    }

    #[must_use]
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    #[must_use]
    pub fn network(&self) -> &LocalNetwork {
        &self.network
    }

    #[must_use]
    pub fn exchange(&self) -> &LocalExchange {
        &self.exchange
    }

    /// Replica `n`, if it is running.
    #[must_use]
    pub fn replica(&self, n: u64) -> Option<&Replica> {
        self.replicas.get(&n).and_then(Option::as_ref)
    }

    /// Running replicas in id order.
    pub fn replicas(&self) -> impl Iterator<Item = &Replica> {
        self.replicas.values().flatten()
    }

    /// The running replica next to the consensus leader.
    #[must_use]
    pub fn leader(&self) -> Option<&Replica> {
        self.replica(self.network.leader()?)
    }

    #[must_use]
    pub fn is_online(&self, n: u64) -> bool {
        self.replica(n).is_some()
    }

    /// Stops replica `n` and its consensus node. Its disk state is kept.
    pub fn stop(&mut self, n: u64) -> Result<(), ReplicationError> {
        if let Some(replica) = self.replicas.get_mut(&n).and_then(Option::take) {
            replica.shutdown();
        }
        self.network.stop(n)?;
        info!(replica = n, "replica stopped");
        Ok(())
    }

    /// Restarts replica `n` from disk. It catches up on the next sync.
    pub fn restart(&mut self, n: u64) -> Result<(), ReplicationError> {
        if self.is_online(n) {
            return Ok(());
        }
        self.network.restart(n)?;
        let replica = self.open_replica(n)?;
        self.replicas.insert(n, Some(replica));
        info!(replica = n, "replica restarted");
        Ok(())
    }

    /// Syncs every running replica until a full round applies nothing.
    /// Returns the number of entries applied.
    pub fn sync_all(&self) -> Result<usize, ReplicationError> {
        self.network.settle()?;
        let mut total = 0;
        for round in 0..MAX_SYNC_ROUNDS {
            let mut applied = 0;
            for replica in self.replicas() {
                applied += replica.sync_all()?;
            }
            total += applied;
            if applied == 0 {
                debug!(rounds = round + 1, applied = total, "cluster in sync");
                break;
            }
        }
        Ok(total)
    }
}

impl std::fmt::Debug for LocalCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let online: Vec<u64> = self
            .replicas
            .iter()
            .filter(|(_, r)| r.is_some())
            .map(|(id, _)| *id)
            .collect();
        f.debug_struct("LocalCluster")
            .field("data_dir", &self.config.data_dir)
            .field("online", &online)
            .field("network", &self.network)
            .finish()
    }
}
