use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::exit_tree::ExitArchive;
use crate::fees::{CoinRegistry, FeeRegistry};
use crate::operators::OperatorRegistry;
use crate::state::StateTree;
use crate::types::{BatchNumber, BatchSummary};

/// Everything queries can see, as of one point of the replay. Parts are
/// shared between consecutive snapshots and copied only when they change.
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    /// Last consolidated batch, `0` before the first one.
    pub last_batch: BatchNumber,
    /// Last base-ledger block fully replayed.
    pub last_block: u64,
    pub state: Arc<StateTree>,
    pub exits: Arc<ExitArchive>,
    pub batches: Arc<BTreeMap<BatchNumber, BatchSummary>>,
    pub coins: Arc<CoinRegistry>,
    pub fees: Arc<FeeRegistry>,
    pub operators: Arc<OperatorRegistry>,
}

/// The snapshot readers currently see. Swapping it is the only point where
/// the synchronizer's progress becomes visible.
#[derive(Clone, Debug, Default)]
pub struct Published(Arc<RwLock<Arc<Snapshot>>>);

impl Published {
    pub fn new(snapshot: Snapshot) -> Self {
        Self(Arc::new(RwLock::new(Arc::new(snapshot))))
    }

    /// The current snapshot. Holding it does not block the writer.
    pub fn load(&self) -> Arc<Snapshot> {
        self.0.read().clone()
    }

    pub(crate) fn publish(&self, snapshot: Snapshot) {
        *self.0.write() = Arc::new(snapshot);
    }
}
