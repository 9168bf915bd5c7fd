use std::collections::HashMap;

use crate::model::ModelId;
use crate::value::{RecordId, Value};

/// Cache key: (model, record, field, context hash).
///
/// The context hash is non-zero only for translatable fields, whose value
/// depends on the environment language.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    model: ModelId,
    id: RecordId,
    field: String,
    ctx: u64,
}

/// Outcome of the READ record rules of one user on one model's records,
/// valid for as long as the rule filter renders to `rule`.
#[derive(Debug, Default)]
struct Visibility {
    rule: String,
    ids: HashMap<RecordId, bool>,
}

/// Field-value cache of one environment lineage.
///
/// Environments derived with another user share the cache, so cached
/// values say nothing about who may read them. Rule outcomes are kept
/// apart, per user.
#[derive(Debug, Default)]
pub struct Cache {
    entries: HashMap<CacheKey, Value>,
    visibility: HashMap<(RecordId, ModelId), Visibility>,
    last_new_id: RecordId,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(model: ModelId, id: RecordId, field: &str, ctx: u64) -> CacheKey {
        CacheKey {
            model,
            id,
            field: field.to_string(),
            ctx,
        }
    }

    pub fn get(&self, model: ModelId, id: RecordId, field: &str, ctx: u64) -> Option<&Value> {
        self.entries.get(&Self::key(model, id, field, ctx))
    }

    pub fn contains(&self, model: ModelId, id: RecordId, field: &str, ctx: u64) -> bool {
        self.entries.contains_key(&Self::key(model, id, field, ctx))
    }

    pub fn set(&mut self, model: ModelId, id: RecordId, field: &str, ctx: u64, value: Value) {
        self.entries.insert(Self::key(model, id, field, ctx), value);
    }

    /// Whether `uid` passes the READ rule `rule` on record `id`, if known.
    pub fn is_readable(&self, uid: RecordId, model: ModelId, rule: &str, id: RecordId) -> Option<bool> {
        self.visibility
            .get(&(uid, model))
            .filter(|v| v.rule == rule)
            .and_then(|v| v.ids.get(&id).copied())
    }

    pub fn mark_readable(
        &mut self,
        uid: RecordId,
        model: ModelId,
        rule: &str,
        ids: impl IntoIterator<Item = (RecordId, bool)>,
    ) {
        let entry = self.visibility.entry((uid, model)).or_default();
        if entry.rule != rule {
            entry.rule = rule.to_string();
            entry.ids.clear();
        }
        entry.ids.extend(ids);
    }

    /// Forget every rule outcome. Any write may move records in or out
    /// of a rule, including through relations.
    pub fn forget_readable(&mut self) {
        self.visibility.clear();
    }

    /// Drop the given fields of the given records, in every context.
    pub fn invalidate_fields(&mut self, model: ModelId, ids: &[RecordId], fields: &[&str]) {
        self.visibility.clear();
        self.entries.retain(|k, _| {
            !(k.model == model && ids.contains(&k.id) && fields.contains(&k.field.as_str()))
        });
    }

    /// Drop everything cached for the given records.
    pub fn invalidate_records(&mut self, model: ModelId, ids: &[RecordId]) {
        self.visibility.clear();
        self.entries
            .retain(|k, _| !(k.model == model && ids.contains(&k.id)));
    }

    /// Drop one field of every record of a model.
    pub fn invalidate_field(&mut self, model: ModelId, field: &str) {
        self.visibility.clear();
        self.entries
            .retain(|k, _| !(k.model == model && k.field == field));
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.visibility.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Allocate an id for an in-memory record: -1, -2, ...
    pub fn next_new_id(&mut self) -> RecordId {
        self.last_new_id -= 1;
        self.last_new_id
    }
}
