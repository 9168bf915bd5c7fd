use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

use openerp_core::OrmError;
use tracing::debug;

use crate::condition::Condition;
use crate::environment::Environment;
use crate::field::{Field, StorageKind};
use crate::model::Model;
use crate::recordset::RecordSet;
use crate::registry::ID_FIELD;
use crate::value::{RecordData, RecordId, Value};

/// Context key holding the id of the edited record while onchange hooks run.
pub const ONCHANGE_ORIGIN: &str = "onchange_origin";

/// Input of `Onchange`: the form values and the fields the user changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OnchangeParams {
    pub values: RecordData,
    pub fields: Vec<String>,
}

impl OnchangeParams {
    pub fn new(values: RecordData, fields: &[&str]) -> Self {
        Self {
            values,
            fields: fields.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Output of `Onchange`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OnchangeResult {
    /// Fields whose value differs from the submitted one. Never holds `ID`.
    pub value: RecordData,
    /// Non-empty warnings of the hooks, separated by a blank line.
    pub warning: String,
    /// Domain filters to apply to relation fields, keyed by field name.
    pub filters: BTreeMap<String, Condition>,
}

/// Run the onchange machinery of `rs` on `params`.
///
/// Everything happens inside a savepoint that is rolled back, on a private
/// cache: neither storage nor the caller's cache see any change.
pub(crate) fn onchange(rs: &RecordSet, params: &OnchangeParams) -> Result<OnchangeResult, OrmError> {
    let env = rs.env();
    let savepoint = env.savepoint()?;
    let result = simulate(rs, params);
    env.rollback_to(&savepoint)?;
    result
}

fn simulate(rs: &RecordSet, params: &OnchangeParams) -> Result<OnchangeResult, OrmError> {
    let model = rs.model();
    let mut scratch = rs.env().scratch();

    let mut submitted: Vec<(&Field, Value)> = Vec::new();
    for (key, value) in params.values.iter() {
        let field = model.must_field(key)?;
        if field.name != ID_FIELD {
            submitted.push((field, field.check_value(&model.name, value.clone())?));
        }
    }

    // Start from the stored record, or from defaults for a new one.
    let mut seed: Vec<(&Field, Value)> = Vec::new();
    match rs.ids().first().copied().filter(|id| *id > 0) {
        Some(origin) => {
            scratch = scratch.with_context(ONCHANGE_ORIGIN, origin);
            let stored = rs.with_env(scratch.clone()).do_load(&[], false)?;
            if stored.ids().contains(&origin) {
                for field in model.fields().filter(|f| f.name != ID_FIELD) {
                    if matches!(field.storage(), StorageKind::Column | StorageKind::Reverse) {
                        seed.push((field, stored.raw_value(origin, field)?));
                    }
                }
            }
        }
        None => {
            let pool = RecordSet::empty(scratch.clone(), model.id);
            for (key, value) in pool.do_default_get()?.iter() {
                seed.push((model.must_field(key)?, value.clone()));
            }
        }
    }
    seed.extend(submitted.iter().cloned());
    let record = pseudo_record(&scratch, model, seed);

    for (field, value) in &submitted {
        if let Some(inverse) = field.inverse() {
            record.call_unchecked(inverse, vec![value.clone().into()])?;
        }
    }

    let graph = &scratch.registry().graph;
    let mut todo: VecDeque<String> = VecDeque::new();
    for name in &params.fields {
        todo.push_back(model.must_field(name)?.name.clone());
    }
    let mut done: HashSet<String> = HashSet::new();
    let mut touched: BTreeSet<String> = BTreeSet::new();
    let mut warnings: Vec<String> = Vec::new();
    let mut filters = BTreeMap::new();

    while let Some(name) = todo.pop_front() {
        if !done.insert(name.clone()) {
            continue;
        }
        let field = model.must_field(&name)?;
        let mut updates: Vec<(&Field, Value)> = Vec::new();
        if let Some(method) = field.onchange() {
            let data = record.call_unchecked(method, Vec::new())?.into_data()?;
            for (key, value) in data.iter() {
                let target = model.must_field(key)?;
                updates.push((target, target.check_value(&model.name, value.clone())?));
            }
        }
        if let Some(method) = field.def.onchange_warning.as_deref() {
            let warning = record.call_unchecked(method, Vec::new())?.into_string()?;
            if !warning.is_empty() {
                warnings.push(warning);
            }
        }
        if let Some(method) = field.def.onchange_filters.as_deref() {
            filters.extend(record.call_unchecked(method, Vec::new())?.into_filters()?);
        }
        for (target, value) in updates {
            cache_value(&record, target, value);
            touched.insert(target.name.clone());
            todo.push_back(target.name.clone());
        }

        let mut dependents = graph.local_dependents(model.id, &name);
        dependents.sort_by_key(|d| graph.rank(model.id, d));
        for dep in dependents {
            let target = model.must_field(&dep)?;
            let value = record.compute_value(target)?;
            cache_value(&record, target, value);
            touched.insert(dep.clone());
            todo.push_back(dep);
        }
    }

    let mut value = RecordData::new();
    let names = submitted
        .iter()
        .map(|(f, _)| f.name.clone())
        .chain(touched)
        .collect::<BTreeSet<_>>();
    for name in names {
        let field = model.must_field(&name)?;
        let current = record.raw_value(record.id(), field)?;
        let before = submitted.iter().find(|(f, _)| f.name == name).map(|(_, v)| v);
        if !before.is_some_and(|b| same_value(field.ftype().is_relation(), b, &current)) {
            value.insert(&name, current);
        }
    }
    debug!(model = %model.name, changed = value.len(), warnings = warnings.len(), "onchange");
    Ok(OnchangeResult {
        value,
        warning: warnings.join("\n\n"),
        filters,
    })
}

/// In-memory record of the scratch environment holding `values`.
fn pseudo_record(env: &Environment, model: &Model, values: Vec<(&Field, Value)>) -> RecordSet {
    let id: RecordId = env.cache().next_new_id();
    let record = RecordSet::from_ids(env.clone(), model.id, vec![id]);
    for (field, value) in values {
        cache_value(&record, field, value);
    }
    record
}

fn cache_value(record: &RecordSet, field: &Field, value: Value) {
    let env = record.env();
    let ctx = env.ctx_hash(field);
    env.cache()
        .set(record.model_id(), record.id(), &field.name, ctx, value);
}

/// Relations compare as sets.
fn same_value(relation: bool, a: &Value, b: &Value) -> bool {
    if relation {
        let a: BTreeSet<RecordId> = a.ids().into_iter().collect();
        let b: BTreeSet<RecordId> = b.ids().into_iter().collect();
        return a == b;
    }
    a == b
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_take_field_names() {
        let params = OnchangeParams::new(RecordData::new().set("Name", "x"), &["Name"]);
        assert_eq!(params.fields, vec!["Name".to_string()]);
        assert!(params.values.has("Name"));
    }

    #[test]
    fn relations_compare_as_sets() {
        assert!(same_value(true, &Value::Ids(vec![1, 2]), &Value::Ids(vec![2, 1])));
        assert!(same_value(true, &Value::Null, &Value::Ids(Vec::new())));
        assert!(!same_value(true, &Value::Ids(vec![1]), &Value::Ids(vec![2])));
        assert!(!same_value(false, &Value::Null, &Value::Char(String::new())));
    }
}
