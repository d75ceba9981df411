//! The bulk delete builder.

use tokio::sync::oneshot;
use tracing::trace;

use crate::api::pending::Pending;
use crate::api::table::Table;
use crate::error::Result;
use crate::store::Command;
use crate::store::plan::{SweepPlan, ViewPredicate};
use crate::types::{Key, KeyRange, RecordView};

/// Deletes every record in a range, optionally narrowed by a predicate.
/// Obtained from [`Table::bulk_delete`]. Range methods overwrite each
/// other, as on [`BulkUpdate`](crate::BulkUpdate).
pub struct BulkDelete {
    table: Table,
    index: Option<String>,
    range: Option<KeyRange>,
    filter: Option<ViewPredicate>,
}

impl BulkDelete {
    pub(crate) fn new(table: Table) -> Self {
        BulkDelete {
            table,
            index: None,
            range: None,
            filter: None,
        }
    }

    pub fn index(mut self, name: &str) -> Self {
        self.index = Some(name.to_string());
        self
    }

    pub fn equals(mut self, key: impl Into<Key>) -> Self {
        self.range = Some(KeyRange::only(key));
        self
    }

    pub fn lower_bound(mut self, key: impl Into<Key>, open: bool) -> Self {
        self.range = Some(KeyRange::lower(key, open));
        self
    }

    pub fn upper_bound(mut self, key: impl Into<Key>, open: bool) -> Self {
        self.range = Some(KeyRange::upper(key, open));
        self
    }

    pub fn bounds(
        mut self,
        lower: impl Into<Key>,
        upper: impl Into<Key>,
        open_lower: bool,
        open_upper: bool,
    ) -> Self {
        self.range = Some(KeyRange::span(lower, upper, open_lower, open_upper));
        self
    }

    /// Narrows the pass to records matching the predicate; others in the
    /// range are left in place.
    pub fn filter(
        mut self,
        predicate: impl Fn(&RecordView<'_>) -> bool + Send + 'static,
    ) -> Self {
        self.filter = Some(Box::new(predicate));
        self
    }

    /// Admits the pass. Resolves with the deleted primary keys in cursor
    /// order.
    pub fn go(self) -> Result<Pending<Vec<Key>>> {
        self.table.ensure_open()?;
        let plan = SweepPlan {
            table: self.table.name().to_string(),
            index: self.index,
            range: self.range.unwrap_or_else(KeyRange::unbounded),
            filter: self.filter,
        };
        let guard = self.table.pending().acquire();
        let (tx, rx) = oneshot::channel();
        self.table.link().send(Command::Sweep { plan, reply: tx })?;
        trace!(table = %self.table.name(), "bulk delete admitted");
        Ok(Pending::new(rx, vec![guard]))
    }
}
