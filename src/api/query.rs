//! The query builder.
//!
//! Mutators consume and return the builder, failing at the offending call
//! when options conflict; `go` compiles the range, picks the execution
//! route, and admits the scan.

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::trace;

use crate::api::pending::Pending;
use crate::api::table::Table;
use crate::error::{Result, ValidationError};
use crate::store::Command;
use crate::store::plan::{Projection, QueryPlan, RecordPredicate};
use crate::types::{Key, KeyBound, KeyRange, QueryOutput};

/// Builder-side range accumulation: `equals` excludes both bounds, each
/// bound may be given once, and compilation happens exactly once at `go`.
#[derive(Default)]
pub(crate) struct BoundConfig {
    equals: Option<Key>,
    lower: Option<KeyBound>,
    upper: Option<KeyBound>,
}

impl BoundConfig {
    fn set_equals(&mut self, key: Key) -> Result<()> {
        if self.equals.is_some() {
            return Err(ValidationError::EqualsAlreadySet.into());
        }
        if self.lower.is_some() || self.upper.is_some() {
            return Err(ValidationError::EqualsWithBounds.into());
        }
        self.equals = Some(key);
        Ok(())
    }

    fn set_lower(&mut self, key: Key, open: bool) -> Result<()> {
        if self.equals.is_some() {
            return Err(ValidationError::EqualsWithBounds.into());
        }
        if self.lower.is_some() {
            return Err(ValidationError::BoundAlreadySet { which: "lower" }.into());
        }
        self.lower = Some(KeyBound { key, open });
        Ok(())
    }

    fn set_upper(&mut self, key: Key, open: bool) -> Result<()> {
        if self.equals.is_some() {
            return Err(ValidationError::EqualsWithBounds.into());
        }
        if self.upper.is_some() {
            return Err(ValidationError::BoundAlreadySet { which: "upper" }.into());
        }
        self.upper = Some(KeyBound { key, open });
        Ok(())
    }

    fn compile(self) -> KeyRange {
        match self.equals {
            Some(key) => KeyRange::Only(key),
            None => KeyRange::Span {
                lower: self.lower,
                upper: self.upper,
            },
        }
    }
}

/// A single-shot query over one table, optionally through a secondary
/// index. Obtained from [`Table::query`].
pub struct Query {
    table: Table,
    bounds: BoundConfig,
    index: Option<String>,
    descending: bool,
    distinct: bool,
    projection: Projection,
    counting: bool,
    cap: usize,
    filter: Option<RecordPredicate>,
}

impl Query {
    pub(crate) fn new(table: Table) -> Self {
        Query {
            table,
            bounds: BoundConfig::default(),
            index: None,
            descending: false,
            distinct: false,
            projection: Projection::Records,
            counting: false,
            cap: 0,
            filter: None,
        }
    }

    fn not_counting(&self, option: &'static str) -> Result<()> {
        if self.counting {
            return Err(ValidationError::ConflictsWithCount { option }.into());
        }
        Ok(())
    }

    /// Scans through the named secondary index instead of the primary key.
    pub fn index(mut self, name: &str) -> Self {
        self.index = Some(name.to_string());
        self
    }

    /// Exact-match range. Conflicts with itself and with either bound.
    pub fn equals(mut self, key: impl Into<Key>) -> Result<Self> {
        self.bounds.set_equals(key.into())?;
        Ok(self)
    }

    /// Lower endpoint; `open` excludes the endpoint. May be given once.
    pub fn lower_bound(mut self, key: impl Into<Key>, open: bool) -> Result<Self> {
        self.bounds.set_lower(key.into(), open)?;
        Ok(self)
    }

    /// Upper endpoint; `open` excludes the endpoint. May be given once.
    pub fn upper_bound(mut self, key: impl Into<Key>, open: bool) -> Result<Self> {
        self.bounds.set_upper(key.into(), open)?;
        Ok(self)
    }

    /// Reverses the scan direction.
    pub fn desc(mut self) -> Result<Self> {
        self.not_counting("desc")?;
        self.descending = true;
        Ok(self)
    }

    /// One hit per distinct index key: the record with the lowest primary
    /// key under each index key.
    pub fn distinct(mut self) -> Result<Self> {
        self.not_counting("distinct")?;
        self.distinct = true;
        Ok(self)
    }

    /// Caps the number of hits. Zero means unbounded.
    pub fn first(mut self, cap: usize) -> Result<Self> {
        self.not_counting("first")?;
        self.cap = cap;
        Ok(self)
    }

    /// Projects primary keys instead of records.
    pub fn keysonly(mut self) -> Result<Self> {
        self.not_counting("keysonly")?;
        self.projection = Projection::Keys;
        Ok(self)
    }

    /// Projects `{primary, index}` key pairs. Requires a selected index,
    /// checked at `go`.
    pub fn keyvalue(mut self) -> Result<Self> {
        self.not_counting("keyvalue")?;
        self.projection = Projection::Pairs;
        Ok(self)
    }

    /// Keeps only records matching the predicate. Filtered-out records do
    /// not consume the cap.
    pub fn filter(mut self, predicate: impl Fn(&Value) -> bool + Send + 'static) -> Result<Self> {
        self.not_counting("filter")?;
        self.filter = Some(Box::new(predicate));
        Ok(self)
    }

    /// Switches to count mode: resolve the number of range hits instead of
    /// iterating. Conflicts with every iteration option.
    pub fn count(mut self) -> Result<Self> {
        if self.descending
            || self.distinct
            || self.cap != 0
            || self.filter.is_some()
            || self.projection != Projection::Records
        {
            return Err(ValidationError::CountConflict.into());
        }
        self.counting = true;
        Ok(self)
    }

    /// Compiles and admits the query.
    ///
    /// If the table has pending writes the scan is routed through the
    /// store's write queue so it observes them, and iteration mode holds a
    /// write guard until it resolves; otherwise it reads the committed
    /// state immediately.
    pub fn go(self) -> Result<Pending<QueryOutput>> {
        self.table.ensure_open()?;
        if self.projection == Projection::Pairs && self.index.is_none() {
            return Err(ValidationError::KeyValueNeedsIndex.into());
        }
        let plan = QueryPlan {
            table: self.table.name().to_string(),
            index: self.index,
            range: self.bounds.compile(),
            descending: self.descending,
            distinct: self.distinct,
            projection: self.projection,
            cap: self.cap,
            count: self.counting,
            filter: self.filter,
        };
        if self.table.pending().active() {
            // Count mode routes for ordering but takes no guard.
            let guards = if self.counting {
                Vec::new()
            } else {
                vec![self.table.pending().acquire()]
            };
            let (tx, rx) = oneshot::channel();
            self.table.link().send(Command::Query { plan, reply: tx })?;
            trace!(table = %self.table.name(), "query routed through write queue");
            Ok(Pending::new(rx, guards))
        } else {
            let outcome = self.table.link().data.read().query(&plan);
            Ok(Pending::ready(outcome))
        }
    }
}
