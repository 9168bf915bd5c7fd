use std::collections::{BTreeMap, BTreeSet, HashSet};

use openerp_core::OrmError;
use openerp_sql::{Value as SqlValue, quote_ident};
use tracing::debug;

use crate::condition::Condition;
use crate::environment::Environment;
use crate::field::StorageKind;
use crate::model::ModelId;
use crate::recordset::RecordSet;
use crate::value::RecordId;

/// Worklist key: fields of lower rank are recomputed first.
type Slot = (usize, ModelId, String);

/// Recomputation of stored computed fields after a change.
///
/// Every (model, field, record) triple is computed at most once per run.
/// Related and non-stored computed fields are never cached, so they only
/// propagate the change to whatever depends on them.
pub(crate) struct Recompute {
    env: Environment,
    pending: BTreeMap<Slot, BTreeSet<RecordId>>,
    done: HashSet<(ModelId, String, RecordId)>,
}

impl Recompute {
    pub fn new(env: &Environment) -> Self {
        Self {
            env: env.sudo(),
            pending: BTreeMap::new(),
            done: HashSet::new(),
        }
    }

    /// Recompute `field` itself on `ids`.
    pub fn schedule(&mut self, model: ModelId, field: &str, ids: &[RecordId]) {
        let rank = self.env.registry().graph.rank(model, field);
        self.pending
            .entry((rank, model, field.to_string()))
            .or_default()
            .extend(ids.iter().copied().filter(|id| *id > 0));
    }

    /// Enqueue everything depending on `fields` of `ids`.
    pub fn changed<S: AsRef<str>>(&mut self, model: ModelId, ids: &[RecordId], fields: &[S]) -> Result<(), OrmError> {
        let ids: Vec<RecordId> = ids.iter().copied().filter(|id| *id > 0).collect();
        if ids.is_empty() {
            return Ok(());
        }
        let registry = self.env.registry().clone();
        for field in fields {
            for trigger in registry.graph.triggers(model, field.as_ref()) {
                if !self.matters(trigger.model, &trigger.field) {
                    continue;
                }
                let affected = if trigger.path.is_empty() {
                    ids.clone()
                } else {
                    let path = trigger.path.join(".");
                    RecordSet::empty(self.env.clone(), trigger.model)
                        .do_search(Condition::field(&path).is_in(ids.clone()))?
                        .ids()
                        .to_vec()
                };
                self.schedule(trigger.model, &trigger.field, &affected);
            }
        }
        Ok(())
    }

    /// True if `field` is stored computed or something stored depends on it.
    pub fn matters(&self, model: ModelId, field: &str) -> bool {
        let registry = self.env.registry();
        let stored = registry
            .model_by_id(model)
            .field(field)
            .is_some_and(|f| f.storage() == StorageKind::ComputedStored);
        stored
            || registry
                .graph
                .triggers(model, field)
                .iter()
                .any(|t| self.matters(t.model, &t.field))
    }

    pub fn run(mut self) -> Result<(), OrmError> {
        let registry = self.env.registry().clone();
        while let Some(((_, model_id, name), ids)) = self.pending.pop_first() {
            let ids: Vec<RecordId> = ids
                .into_iter()
                .filter(|id| self.done.insert((model_id, name.clone(), *id)))
                .collect();
            if ids.is_empty() {
                continue;
            }
            let model = registry.model_by_id(model_id);
            let field = model.must_field(&name)?;
            if field.storage() != StorageKind::ComputedStored {
                self.changed(model_id, &ids, &[name.as_str()])?;
                continue;
            }

            let column = field.column.as_deref().unwrap_or_default();
            let sql = format!(
                "UPDATE {} SET {} = ? WHERE \"id\" = ?",
                quote_ident(&model.table),
                quote_ident(column)
            );
            let ctx = self.env.ctx_hash(field);
            let records = RecordSet::from_ids(self.env.clone(), model_id, ids);
            let mut updated = Vec::new();
            for rec in records.records() {
                let id = rec.id();
                let value = rec.compute_value(field)?;
                if rec.raw_value(id, field)? == value {
                    continue;
                }
                self.env.exec(&sql, &[value.to_sql(), SqlValue::Integer(id)])?;
                self.env.cache().set(model_id, id, &field.name, ctx, value);
                updated.push(id);
            }
            debug!(model = %model.name, field = %name, updated = updated.len(), "recompute");
            self.changed(model_id, &updated, &[name.as_str()])?;
        }
        Ok(())
    }
}
