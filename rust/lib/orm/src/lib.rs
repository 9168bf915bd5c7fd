//! Record engine.
//!
//! Models are declared on a [`RegistryBuilder`]: fields, layered methods
//! and mixins. [`RegistryBuilder::finalize`] freezes them into a shared
//! [`Registry`]. Work then happens in an [`Environment`] (one transaction,
//! one user, one cache) through [`RecordSet`] collections.
//!
//! ```ignore
//! let store = openerp_orm::connect(&config)?;
//! registry.sync_schema(&store)?;
//! Environment::execute(&registry, &store, uid, |env| {
//!     let tags = env.pool("Tag")?;
//!     tags.create(RecordData::new().set("Name", "rust"))?;
//!     Ok(())
//! })?;
//! ```

pub mod base;
pub mod cache;
mod compute;
pub mod condition;
mod crud;
mod depends;
pub mod environment;
pub mod field;
pub mod fields_get;
pub mod i18n;
pub mod method;
pub mod model;
pub mod onchange;
pub mod query;
pub mod recordset;
pub mod registry;
mod schema;
pub mod security;
pub mod value;

#[cfg(test)]
mod tests;

use openerp_core::{OrmError, RuntimeConfig};
use openerp_sql::SqliteStore;

pub use condition::{Condition, Operator};
pub use environment::Environment;
pub use field::{FieldDef, FieldType, OnDelete, StorageKind};
pub use fields_get::FieldInfo;
pub use i18n::{NoTranslation, StaticCatalog, Translator};
pub use method::{Payload, Super, arg};
pub use model::{Model, ModelId, ModelOptions};
pub use onchange::{OnchangeParams, OnchangeResult};
pub use query::GroupAggregateRow;
pub use recordset::RecordSet;
pub use registry::{ID_FIELD, Registry, RegistryBuilder};
pub use security::{GROUP_ADMIN, GROUP_EVERYONE, Permission, RecordRule};
pub use value::{Context, RecordData, RecordId, Value};

/// Open the store described by `config`: the SQLite file when a path is
/// set, a private in-memory database otherwise.
pub fn connect(config: &RuntimeConfig) -> Result<SqliteStore, OrmError> {
    let store = match &config.sqlite_path {
        Some(path) => SqliteStore::open(path),
        None => SqliteStore::open_in_memory(),
    };
    store.map_err(environment::sql_err)
}
