use std::cell::{Cell, Ref, RefCell, RefMut};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;
use std::sync::Arc;

use openerp_core::OrmError;
use openerp_sql::{Row, SQLError, SQLStore, SQLTransaction, Value as SqlValue};
use tracing::{debug, warn};

use crate::cache::Cache;
use crate::condition::Condition;
use crate::field::Field;
use crate::model::{Model, ModelId};
use crate::query::Dialect;
use crate::recordset::RecordSet;
use crate::registry::Registry;
use crate::security::Permission;
use crate::value::{Context, RecordId, Value};

/// Map a storage error. Constraint failures keep the driver text verbatim.
pub(crate) fn sql_err(e: SQLError) -> OrmError {
    match e {
        SQLError::Constraint(msg) => OrmError::Constraint(msg),
        other => OrmError::Storage(other.to_string()),
    }
}

/// The transaction shared by an environment and everything derived from it.
struct TxHandle {
    tx: RefCell<Option<Box<dyn SQLTransaction>>>,
    dialect: Dialect,
    queries: Cell<usize>,
    savepoints: Cell<usize>,
}

struct EnvInner {
    registry: Arc<Registry>,
    tx: Rc<TxHandle>,
    cache: Rc<RefCell<Cache>>,
    calls: Rc<RefCell<Vec<(ModelId, String)>>>,
    uid: RecordId,
    context: Context,
}

/// A unit of work: one transaction, one acting user, one context and one
/// field-value cache.
///
/// Cloning is cheap and shares everything. Environments are not `Send`;
/// concurrent work opens its own environment, hence its own transaction.
#[derive(Clone)]
pub struct Environment {
    inner: Rc<EnvInner>,
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("uid", &self.inner.uid)
            .field("context", &self.inner.context)
            .finish_non_exhaustive()
    }
}

/// Pops the method call stack when dropped.
pub(crate) struct CallGuard {
    calls: Rc<RefCell<Vec<(ModelId, String)>>>,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.calls.borrow_mut().pop();
    }
}

impl Environment {
    /// Open a transaction on `store` for user `uid`.
    pub fn begin(registry: &Arc<Registry>, store: &dyn SQLStore, uid: RecordId) -> Result<Self, OrmError> {
        let tx = store.begin().map_err(sql_err)?;
        debug!(uid, driver = store.driver_name(), "environment opened");
        Ok(Self {
            inner: Rc::new(EnvInner {
                registry: Arc::clone(registry),
                tx: Rc::new(TxHandle {
                    tx: RefCell::new(Some(tx)),
                    dialect: Dialect::from_driver(store.driver_name()),
                    queries: Cell::new(0),
                    savepoints: Cell::new(0),
                }),
                cache: Rc::new(RefCell::new(Cache::new())),
                calls: Rc::new(RefCell::new(Vec::new())),
                uid,
                context: Context::new(),
            }),
        })
    }

    /// Run `f` in a new transaction. Commits on `Ok`, rolls back on `Err`.
    pub fn execute<T, F>(registry: &Arc<Registry>, store: &dyn SQLStore, uid: RecordId, f: F) -> Result<T, OrmError>
    where
        F: FnOnce(&Environment) -> Result<T, OrmError>,
    {
        let env = Self::begin(registry, store, uid)?;
        match f(&env) {
            Ok(value) => {
                env.commit()?;
                Ok(value)
            }
            Err(e) => {
                debug!(uid, error = %e, code = e.error_code(), "rolling back environment");
                if let Err(rb) = env.rollback() {
                    warn!(error = %rb, "rollback failed");
                }
                Err(e)
            }
        }
    }

    /// Run `f` in a new transaction that is always rolled back.
    pub fn simulate<T, F>(registry: &Arc<Registry>, store: &dyn SQLStore, uid: RecordId, f: F) -> Result<T, OrmError>
    where
        F: FnOnce(&Environment) -> Result<T, OrmError>,
    {
        let env = Self::begin(registry, store, uid)?;
        let result = f(&env);
        if let Err(rb) = env.rollback() {
            warn!(error = %rb, "rollback failed");
        }
        result
    }

    fn take_tx(&self) -> Result<Box<dyn SQLTransaction>, OrmError> {
        self.inner
            .tx
            .tx
            .borrow_mut()
            .take()
            .ok_or_else(|| OrmError::Storage("transaction already closed".into()))
    }

    pub fn commit(&self) -> Result<(), OrmError> {
        self.take_tx()?.commit().map_err(sql_err)
    }

    pub fn rollback(&self) -> Result<(), OrmError> {
        self.inner.cache.borrow_mut().clear();
        self.take_tx()?.rollback().map_err(sql_err)
    }

    fn derive(&self, uid: RecordId, context: Context, cache: Rc<RefCell<Cache>>) -> Environment {
        Environment {
            inner: Rc::new(EnvInner {
                registry: Arc::clone(&self.inner.registry),
                tx: Rc::clone(&self.inner.tx),
                cache,
                calls: Rc::clone(&self.inner.calls),
                uid,
                context,
            }),
        }
    }

    /// Same transaction and cache, one more context key.
    pub fn with_context(&self, key: &str, value: impl Into<Value>) -> Environment {
        let context = self.inner.context.clone().with(key, value);
        self.derive(self.inner.uid, context, Rc::clone(&self.inner.cache))
    }

    /// Same transaction and cache, context replaced.
    pub fn with_new_context(&self, context: Context) -> Environment {
        self.derive(self.inner.uid, context, Rc::clone(&self.inner.cache))
    }

    /// Same transaction and cache, acting as the superuser.
    pub fn sudo(&self) -> Environment {
        self.with_user(self.inner.registry.config().superuser_id)
    }

    /// Same transaction and cache, acting as `uid`.
    pub fn with_user(&self, uid: RecordId) -> Environment {
        self.derive(uid, self.inner.context.clone(), Rc::clone(&self.inner.cache))
    }

    /// Same transaction, fresh and private cache.
    pub(crate) fn scratch(&self) -> Environment {
        self.derive(
            self.inner.uid,
            self.inner.context.clone(),
            Rc::new(RefCell::new(Cache::new())),
        )
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    pub fn uid(&self) -> RecordId {
        self.inner.uid
    }

    pub fn context(&self) -> &Context {
        &self.inner.context
    }

    pub fn is_superuser(&self) -> bool {
        self.inner.uid == self.inner.registry.config().superuser_id
    }

    /// Context language, or the configured default.
    pub fn lang(&self) -> String {
        let config = self.inner.registry.config();
        config
            .resolve_lang(self.inner.context.get_str("lang"))
            .to_string()
    }

    /// Empty collection of `model`.
    pub fn pool(&self, model: &str) -> Result<RecordSet, OrmError> {
        let model = self.inner.registry.model(model)?;
        if model.is_mixin() {
            return Err(OrmError::Validation(format!(
                "mixin '{}' has no records",
                model.name
            )));
        }
        Ok(RecordSet::empty(self.clone(), model.id))
    }

    /// Number of SQL statements issued in this transaction.
    pub fn sql_query_count(&self) -> usize {
        self.inner.tx.queries.get()
    }

    /// Drop every cached value.
    pub fn invalidate_cache(&self) {
        self.inner.cache.borrow_mut().clear();
    }

    // ── Storage ──

    pub(crate) fn dialect(&self) -> Dialect {
        self.inner.tx.dialect
    }

    fn log(&self, sql: &str, params: &[SqlValue]) {
        self.inner.tx.queries.set(self.inner.tx.queries.get() + 1);
        if self.inner.registry.config().log_sql {
            debug!(sql, ?params, uid = self.inner.uid, "sql");
        }
    }

    pub(crate) fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, OrmError> {
        let sql = self.dialect().placeholders(sql);
        self.log(&sql, params);
        let mut guard = self.inner.tx.tx.borrow_mut();
        let tx = guard
            .as_mut()
            .ok_or_else(|| OrmError::Storage("transaction already closed".into()))?;
        tx.query(&sql, params).map_err(sql_err)
    }

    pub(crate) fn exec(&self, sql: &str, params: &[SqlValue]) -> Result<u64, OrmError> {
        let sql = self.dialect().placeholders(sql);
        self.log(&sql, params);
        let mut guard = self.inner.tx.tx.borrow_mut();
        let tx = guard
            .as_mut()
            .ok_or_else(|| OrmError::Storage("transaction already closed".into()))?;
        tx.exec(&sql, params).map_err(sql_err)
    }

    pub(crate) fn savepoint(&self) -> Result<String, OrmError> {
        let n = self.inner.tx.savepoints.get() + 1;
        self.inner.tx.savepoints.set(n);
        let name = format!("sp_{n}");
        self.exec(&format!("SAVEPOINT {name}"), &[])?;
        Ok(name)
    }

    pub(crate) fn rollback_to(&self, name: &str) -> Result<(), OrmError> {
        self.exec(&format!("ROLLBACK TO SAVEPOINT {name}"), &[])?;
        self.exec(&format!("RELEASE SAVEPOINT {name}"), &[])?;
        Ok(())
    }

    // ── Cache ──

    pub(crate) fn cache(&self) -> RefMut<'_, Cache> {
        self.inner.cache.borrow_mut()
    }

    pub(crate) fn cache_ref(&self) -> Ref<'_, Cache> {
        self.inner.cache.borrow()
    }

    /// Cache context hash for a field: the language for translatable
    /// fields, 0 otherwise.
    pub(crate) fn ctx_hash(&self, field: &Field) -> u64 {
        if !field.translate() {
            return 0;
        }
        let mut hasher = DefaultHasher::new();
        self.lang().hash(&mut hasher);
        hasher.finish() | 1
    }

    /// Record rule filter of the acting user. `None` for the superuser.
    pub(crate) fn rule_condition(&self, model: &Model, perm: Permission) -> Option<Condition> {
        if self.is_superuser() {
            return None;
        }
        self.inner
            .registry
            .security()
            .rule_filter(self.inner.uid, &model.name, perm)
    }

    // ── Method permissions ──

    /// Innermost method currently executing.
    pub(crate) fn caller(&self) -> Option<(ModelId, String)> {
        self.inner.calls.borrow().last().cloned()
    }

    pub(crate) fn enter(&self, model: ModelId, method: &str) -> CallGuard {
        self.inner
            .calls
            .borrow_mut()
            .push((model, method.to_string()));
        CallGuard {
            calls: Rc::clone(&self.inner.calls),
        }
    }

    /// Fail unless the acting user may call `model.method` from the current
    /// call site.
    pub(crate) fn check_execution(&self, model: &Model, method: &str) -> Result<(), OrmError> {
        if self.is_superuser() {
            return Ok(());
        }
        let registry = &self.inner.registry;
        let caller = self.caller();
        let caller_names = caller
            .as_ref()
            .map(|(m, f)| (registry.model_by_id(*m).name.as_str(), f.as_str()));
        if registry
            .security()
            .is_allowed(self.inner.uid, &model.name, method, caller_names)
        {
            Ok(())
        } else {
            Err(OrmError::Permission(format!(
                "user {} is not allowed to execute {}.{method}",
                self.inner.uid, model.name
            )))
        }
    }
}
