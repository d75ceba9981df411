//! Per-store command executor.
//!
//! Each backing store is owned by one spawned task that drains an unbounded
//! command queue in arrival order. That single consumer is what makes the
//! ordering guarantee hold: writes admitted earlier are applied before any
//! command admitted later, and a write-routed scan observes every write
//! admitted before it.

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::error::{Result, StoreError};
use crate::store::data::StoreData;
use crate::store::plan::{MutatePlan, QueryPlan, SweepPlan, TxUnit, WriteOp};
use crate::types::{Key, QueryOutput, TransactionReport};

pub(crate) mod data;
pub(crate) mod plan;

/// A command admitted to a store's queue, with its reply channel.
pub(crate) enum Command {
    Apply {
        op: WriteOp,
        reply: oneshot::Sender<Result<Vec<Key>>>,
    },
    Clear {
        table: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Commit {
        units: Vec<TxUnit>,
        reply: oneshot::Sender<Result<TransactionReport>>,
    },
    Query {
        plan: QueryPlan,
        reply: oneshot::Sender<Result<QueryOutput>>,
    },
    Mutate {
        plan: MutatePlan,
        reply: oneshot::Sender<Result<Vec<Key>>>,
    },
    Sweep {
        plan: SweepPlan,
        reply: oneshot::Sender<Result<Vec<Key>>>,
    },
}

/// Shared handle to one backing store: the command queue, the committed
/// state (readable directly for read-only scans), and the live connection
/// count used by version-change admission.
#[derive(Clone)]
pub(crate) struct StoreLink {
    pub tx: mpsc::UnboundedSender<Command>,
    pub data: Arc<RwLock<StoreData>>,
    pub connections: Arc<AtomicUsize>,
}

impl StoreLink {
    pub(crate) fn spawn(name: &str) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let data = Arc::new(RwLock::new(StoreData::new()));
        tokio::spawn(run(name.to_string(), Arc::clone(&data), rx));
        StoreLink {
            tx,
            data,
            connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn send(&self, command: Command) -> Result<()> {
        self.tx
            .send(command)
            .map_err(|_| StoreError::Disconnected.into())
    }
}

async fn run(
    name: String,
    data: Arc<RwLock<StoreData>>,
    mut rx: mpsc::UnboundedReceiver<Command>,
) {
    debug!(store = %name, "store task started");
    while let Some(command) = rx.recv().await {
        match command {
            Command::Apply { op, reply } => {
                trace!(store = %name, "apply");
                let _ = reply.send(data.write().apply(op));
            }
            Command::Clear { table, reply } => {
                trace!(store = %name, table = %table, "clear");
                let _ = reply.send(data.write().clear(&table));
            }
            Command::Commit { units, reply } => {
                trace!(store = %name, units = units.len(), "commit");
                let _ = reply.send(data.write().commit(units));
            }
            Command::Query { plan, reply } => {
                trace!(store = %name, table = %plan.table, "queued query");
                let _ = reply.send(data.read().query(&plan));
            }
            Command::Mutate { plan, reply } => {
                trace!(store = %name, table = %plan.table, "mutate");
                let _ = reply.send(data.write().mutate(plan));
            }
            Command::Sweep { plan, reply } => {
                trace!(store = %name, table = %plan.table, "sweep");
                let _ = reply.send(data.write().sweep(plan));
            }
        }
    }
    debug!(store = %name, "store task stopped");
}
