//! latchdb: an asynchronous query/transaction engine over a versioned,
//! indexed key-value store.
//!
//! A [`Registry`] owns named backing stores; opening one with a
//! [`SchemaDescriptor`] yields a [`Database`] handle with one [`Table`]
//! handle per store table. Records are `serde_json::Value` objects keyed
//! by an explicit [`Key`] type (numbers before strings before composites).
//!
//! Every table operation is admitted synchronously and returns a
//! [`Pending`] future: per table, operations are applied in call order and
//! resolve in admission order. Queries against a table with writes still
//! in flight are routed behind those writes so they observe them; a quiet
//! table is read directly from committed state. Multi-record writes,
//! bulk passes, and multi-table [`Transaction`] commits are atomic: any
//! failure leaves the store untouched.
//!
//! ```no_run
//! use latchdb::{IndexSpec, KeySpec, Registry, SchemaDescriptor, TableSpec};
//! use serde_json::json;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> latchdb::Result<()> {
//!     let registry = Registry::new();
//!     let db = registry
//!         .open(SchemaDescriptor::new("app", 1).table(
//!             "kanji",
//!             TableSpec::new(KeySpec::path("key"))
//!                 .index(IndexSpec::new("order", "order").unique()),
//!         ))
//!         .await?;
//!
//!     let kanji = db.table("kanji").expect("declared at open");
//!     kanji.insert(json!({"key": "ichi", "order": 0}))?.await?;
//!     let hits = kanji.query().index("order").equals(0)?.go()?.await?;
//!     println!("{hits:?}");
//!     Ok(())
//! }
//! ```

mod api;
mod error;
mod store;
mod types;

pub use api::database::Database;
pub use api::delete::BulkDelete;
pub use api::pending::Pending;
pub use api::query::Query;
pub use api::registry::Registry;
pub use api::table::Table;
pub use api::transaction::Transaction;
pub use api::update::BulkUpdate;
pub use error::{Error, Result, StoreError, ValidationError};
pub use types::{
    FieldOp, IndexPair, IndexSpec, Key, KeyBound, KeyRange, KeySpec, QueryOutput, RecordView,
    SchemaDescriptor, TableOutcome, TableSpec, TransactionReport,
};
