//! Public API surface: the registry, handles, builders, and transactions.

pub(crate) mod database;
pub(crate) mod delete;
pub(crate) mod pending;
pub(crate) mod query;
pub(crate) mod registry;
pub(crate) mod table;
pub(crate) mod transaction;
pub(crate) mod update;
