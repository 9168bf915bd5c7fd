use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::rc::Rc;

use openerp_core::OrmError;
use openerp_sql::{Row, Value as SqlValue, quote_ident};
use tracing::debug;

use crate::condition::{Condition, Operator};
use crate::environment::Environment;
use crate::field::{Field, FieldType, StorageKind};
use crate::fields_get::FieldInfo;
use crate::method::Payload;
use crate::model::{Model, ModelId};
use crate::onchange::{OnchangeParams, OnchangeResult};
use crate::query::{GroupAggregateRow, Query, SqlBuilder};
use crate::registry::ID_FIELD;
use crate::security::Permission;
use crate::value::{Context, RecordData, RecordId, Value};

/// An ordered set of records of one model, bound to an environment.
///
/// Collections are cheap to clone and never change their ids in place:
/// operations narrowing, re-ordering or combining them return a new
/// collection sharing the environment and its cache.
#[derive(Clone)]
pub struct RecordSet {
    env: Environment,
    model: ModelId,
    ids: Rc<[RecordId]>,
    /// Sibling ids loaded together with these on a cache miss.
    prefetch: Rc<[RecordId]>,
    query: Option<Rc<Query>>,
}

impl fmt::Debug for RecordSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:?}", self.model().name, &*self.ids)
    }
}

fn dedup(ids: impl IntoIterator<Item = RecordId>) -> Vec<RecordId> {
    let mut seen = HashSet::new();
    ids.into_iter().filter(|id| seen.insert(*id)).collect()
}

impl RecordSet {
    pub(crate) fn empty(env: Environment, model: ModelId) -> Self {
        Self::from_ids(env, model, Vec::new())
    }

    pub(crate) fn from_ids(env: Environment, model: ModelId, ids: Vec<RecordId>) -> Self {
        let ids: Rc<[RecordId]> = dedup(ids).into();
        Self {
            env,
            model,
            prefetch: Rc::clone(&ids),
            ids,
            query: None,
        }
    }

    /// Other ids of the same model, keeping the prefetch set.
    fn narrowed(&self, ids: Vec<RecordId>) -> Self {
        Self {
            env: self.env.clone(),
            model: self.model,
            ids: dedup(ids).into(),
            prefetch: Rc::clone(&self.prefetch),
            query: None,
        }
    }

    pub(crate) fn record(&self, id: RecordId) -> Self {
        self.narrowed(vec![id])
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    pub fn model(&self) -> &Model {
        self.env.registry().model_by_id(self.model)
    }

    pub fn model_name(&self) -> &str {
        &self.model().name
    }

    pub(crate) fn model_id(&self) -> ModelId {
        self.model
    }

    pub fn ids(&self) -> &[RecordId] {
        &self.ids
    }

    /// Id of the first record, 0 on an empty collection.
    pub fn id(&self) -> RecordId {
        self.ids.first().copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Same records seen from another environment.
    pub fn with_env(&self, env: Environment) -> Self {
        Self {
            env,
            model: self.model,
            ids: Rc::clone(&self.ids),
            prefetch: Rc::clone(&self.prefetch),
            query: self.query.clone(),
        }
    }

    pub fn with_context(&self, key: &str, value: impl Into<Value>) -> Self {
        self.with_env(self.env.with_context(key, value))
    }

    pub fn with_new_context(&self, context: Context) -> Self {
        self.with_env(self.env.with_new_context(context))
    }

    pub fn sudo(&self) -> Self {
        self.with_env(self.env.sudo())
    }

    // ── Dispatch ──

    /// Call `method` on this collection: permission check, then the
    /// outermost layer.
    pub fn call(&self, method: &str, args: Vec<Payload>) -> Result<Payload, OrmError> {
        let model = self.model();
        let m = model.must_method(method)?;
        self.env.check_execution(model, method)?;
        let _frame = self.env.enter(model.id, method);
        m.invoke(self, args)
    }

    /// Call an engine hook (compute, inverse, onchange, constraint)
    /// without a permission check.
    pub(crate) fn call_unchecked(&self, method: &str, args: Vec<Payload>) -> Result<Payload, OrmError> {
        let model = self.model();
        let m = model.must_method(method)?;
        let _frame = self.env.enter(model.id, method);
        m.invoke(self, args)
    }

    pub fn create(&self, data: RecordData) -> Result<RecordSet, OrmError> {
        self.call("Create", vec![data.into()])?.into_records()
    }

    pub fn write(&self, data: RecordData) -> Result<bool, OrmError> {
        self.call("Write", vec![data.into()])?.into_bool()
    }

    /// Write a single field.
    pub fn set(&self, field: &str, value: impl Into<Value>) -> Result<(), OrmError> {
        self.write(RecordData::new().set(field, value))?;
        Ok(())
    }

    /// Delete the records. Returns the number of deleted rows.
    pub fn unlink(&self) -> Result<i64, OrmError> {
        self.call("Unlink", Vec::new())?.into_i64()
    }

    /// Load `fields` (all stored fields when empty) into the cache and
    /// return the records the user may read.
    pub fn load(&self, fields: &[&str]) -> Result<RecordSet, OrmError> {
        self.call("Load", vec![Payload::Fields(to_strings(fields))])?
            .into_records()
    }

    pub fn read(&self, fields: &[&str]) -> Result<Vec<RecordData>, OrmError> {
        self.call("Read", vec![Payload::Fields(to_strings(fields))])?
            .into_data_list()
    }

    pub fn search(&self, cond: Condition) -> Result<RecordSet, OrmError> {
        self.call("Search", vec![cond.into()])?.into_records()
    }

    pub fn search_all(&self) -> Result<RecordSet, OrmError> {
        self.call("SearchAll", Vec::new())?.into_records()
    }

    pub fn search_count(&self, cond: Condition) -> Result<i64, OrmError> {
        self.call("SearchCount", vec![cond.into()])?.into_i64()
    }

    /// This collection's query grouped by the given stored fields.
    pub fn group_by(&self, fields: &[&str]) -> Result<RecordSet, OrmError> {
        self.call("GroupBy", vec![Payload::Fields(to_strings(fields))])?
            .into_records()
    }

    /// Rows of a grouped collection, ordered by group values. Numeric
    /// fields among `fields` that are not grouped on are summed.
    pub fn aggregates(&self, fields: &[&str]) -> Result<Vec<GroupAggregateRow>, OrmError> {
        self.call("Aggregates", vec![Payload::Fields(to_strings(fields))])?
            .into_groups()
    }

    pub fn browse(&self, ids: &[RecordId]) -> Result<RecordSet, OrmError> {
        self.call("Browse", vec![Value::from(ids).into()])?
            .into_records()
    }

    pub fn browse_one(&self, id: RecordId) -> Result<RecordSet, OrmError> {
        self.call("BrowseOne", vec![id.into()])?.into_records()
    }

    /// Re-run the query this collection came from, or re-read its ids.
    pub fn fetch(&self) -> Result<RecordSet, OrmError> {
        self.call("Fetch", Vec::new())?.into_records()
    }

    pub fn name_get(&self) -> Result<String, OrmError> {
        self.call("NameGet", Vec::new())?.into_string()
    }

    /// Records whose name matches `name` with `op`, within `cond`.
    /// `limit` 0 uses the configured default.
    pub fn search_by_name(
        &self,
        name: &str,
        op: Operator,
        cond: Condition,
        limit: usize,
    ) -> Result<RecordSet, OrmError> {
        self.call(
            "SearchByName",
            vec![
                name.into(),
                op.as_str().into(),
                cond.into(),
                (limit as i64).into(),
            ],
        )?
        .into_records()
    }

    pub fn fields_get(&self, fields: &[&str]) -> Result<BTreeMap<String, FieldInfo>, OrmError> {
        self.call("FieldsGet", vec![Payload::Fields(to_strings(fields))])?
            .into_field_infos()
    }

    pub fn default_get(&self) -> Result<RecordData, OrmError> {
        self.call("DefaultGet", Vec::new())?.into_data()
    }

    pub fn copy_data(&self, overrides: RecordData) -> Result<RecordData, OrmError> {
        self.call("CopyData", vec![overrides.into()])?.into_data()
    }

    pub fn copy(&self, overrides: RecordData) -> Result<RecordSet, OrmError> {
        self.call("Copy", vec![overrides.into()])?.into_records()
    }

    /// False if following `Parent` from any record loops.
    pub fn check_recursion(&self) -> Result<bool, OrmError> {
        self.call("CheckRecursion", Vec::new())?.into_bool()
    }

    pub fn get_record(&self, external_id: &str) -> Result<RecordSet, OrmError> {
        self.call("GetRecord", vec![external_id.into()])?
            .into_records()
    }

    /// Create an in-memory record. Nothing is written to storage.
    pub fn new_record(&self, data: RecordData) -> Result<RecordSet, OrmError> {
        self.call("New", vec![data.into()])?.into_records()
    }

    pub fn onchange(&self, params: OnchangeParams) -> Result<OnchangeResult, OrmError> {
        self.call("Onchange", vec![Payload::OnchangeParams(params)])?
            .into_onchange()
    }

    /// Reload every requested field from storage, dropping cached values
    /// first. Records deleted meanwhile disappear from the result.
    pub fn force_load(&self, fields: &[&str]) -> Result<RecordSet, OrmError> {
        self.env.check_execution(self.model(), "Load")?;
        self.do_load(&to_strings(fields), true)
    }

    // ── Field access ──

    /// Value of `field` on the first record, or the field's zero value on
    /// an empty collection or an unset field.
    pub fn get(&self, field: &str) -> Result<Value, OrmError> {
        let f = self.model().must_field(field)?;
        let Some(&id) = self.ids.first() else {
            return Ok(f.zero_value());
        };
        let value = self.raw_value(id, f)?;
        Ok(if value.is_null() { f.zero_value() } else { value })
    }

    /// Records referenced by a relation field of the first record.
    pub fn get_records(&self, field: &str) -> Result<RecordSet, OrmError> {
        let f = self.model().must_field(field)?;
        let target = f.relation.ok_or_else(|| {
            OrmError::Validation(format!("{}.{} is not a relation", self.model_name(), f.name))
        })?;
        let ids = self.get(field)?.ids();
        Ok(RecordSet::from_ids(self.env.clone(), target, ids))
    }

    /// Field value of record `id`, `Null` when unset.
    pub(crate) fn raw_value(&self, id: RecordId, field: &Field) -> Result<Value, OrmError> {
        if field.name == ID_FIELD {
            return Ok(Value::Integer(id));
        }
        let ctx = self.env.ctx_hash(field);
        if id < 0 {
            if let Some(v) = self.env.cache_ref().get(self.model, id, &field.name, ctx) {
                return Ok(v.clone());
            }
        }
        match field.storage() {
            StorageKind::Related => self.related_value(id, field),
            StorageKind::ComputedTransient => self.record(id).compute_value(field),
            StorageKind::ComputedStored if id < 0 => self.record(id).compute_value(field),
            _ if id < 0 => Ok(Value::Null),
            _ => {
                let cached = self.env.cache_ref().get(self.model, id, &field.name, ctx).cloned();
                if let Some(v) = cached {
                    // Another user may have filled the cache.
                    return Ok(if self.readable_ids(&[id])?.contains(&id) { v } else { Value::Null });
                }
                if self.env.caller().is_none() {
                    self.env.check_execution(self.model(), "Load")?;
                }
                // Fetch every missing column at once, x2many fields one by one.
                let names = if field.is_stored() {
                    Vec::new()
                } else {
                    vec![field.name.clone()]
                };
                self.record(id).do_load_fields(&names, false, !field.is_stored())?;
                Ok(self
                    .env
                    .cache_ref()
                    .get(self.model, id, &field.name, ctx)
                    .cloned()
                    .unwrap_or_default())
            }
        }
    }

    /// Follow a related path. Through a multi-valued hop the last record wins.
    fn related_value(&self, id: RecordId, field: &Field) -> Result<Value, OrmError> {
        let Some((last, hops)) = field.related_path.split_last() else {
            return Ok(Value::Null);
        };
        let mut current = self.record(id);
        for hop in hops {
            let next = current.get_records(hop)?;
            let Some(&last_id) = next.ids.last() else {
                return Ok(Value::Null);
            };
            current = next.record(last_id);
        }
        let target = current.model().must_field(last)?;
        match current.ids.first() {
            Some(&target_id) => current.raw_value(target_id, target),
            None => Ok(Value::Null),
        }
    }

    /// Run the compute method of `field` on this single record.
    pub(crate) fn compute_value(&self, field: &Field) -> Result<Value, OrmError> {
        let method = field.compute().ok_or_else(|| {
            OrmError::Internal(format!("field {} has no compute method", field.name))
        })?;
        let raw = match self.call_unchecked(method, Vec::new())? {
            Payload::Data(data) => data
                .get(&field.name)
                .or_else(|| data.get(&field.json))
                .cloned()
                .unwrap_or_default(),
            other => other.into_value()?,
        };
        field.check_value(self.model_name(), raw)
    }

    // ── Loading ──

    pub(crate) fn do_load(&self, fields: &[String], force: bool) -> Result<RecordSet, OrmError> {
        self.do_load_fields(fields, force, true)
    }

    /// Load missing fields for this collection and its prefetch set.
    /// Empty `fields` means every column, plus x2many fields when
    /// `with_reverse` is set.
    fn do_load_fields(&self, fields: &[String], force: bool, with_reverse: bool) -> Result<RecordSet, OrmError> {
        let model = self.model();
        let loadable = |f: &&Field| f.is_stored() || f.storage() == StorageKind::Reverse;
        let requested: Vec<&Field> = if fields.is_empty() {
            model
                .fields()
                .filter(|f| f.is_stored() || (with_reverse && f.storage() == StorageKind::Reverse))
                .collect()
        } else {
            let mut out = vec![model.must_field(ID_FIELD)?];
            for name in fields {
                out.push(model.must_field(name)?);
            }
            out.into_iter().filter(loadable).collect()
        };

        let own: Vec<RecordId> = self.ids.iter().copied().filter(|id| *id > 0).collect();
        if own.is_empty() {
            return Ok(self.clone());
        }
        if force {
            self.env.cache().invalidate_records(self.model, &own);
        }
        let missing: Vec<&Field> = requested
            .into_iter()
            .filter(|f| {
                let ctx = self.env.ctx_hash(f);
                let cache = self.env.cache_ref();
                own.iter().any(|id| !cache.contains(self.model, *id, &f.name, ctx))
            })
            .collect();
        if missing.is_empty() {
            let readable = self.readable_ids(&own)?;
            if readable.len() == own.len() {
                return Ok(self.clone());
            }
            return Ok(self.keep(|id| id < 0 || readable.contains(&id)));
        }

        let own_set: HashSet<RecordId> = own.iter().copied().collect();
        let mut batch = own.clone();
        batch.extend(
            self.prefetch
                .iter()
                .copied()
                .filter(|id| *id > 0 && !own_set.contains(id)),
        );

        let mut columns: Vec<&Field> = vec![model.must_field(ID_FIELD)?];
        columns.extend(missing.iter().copied().filter(|f| f.is_stored() && f.name != ID_FIELD));
        let names: Vec<&str> = columns.iter().filter_map(|f| f.column.as_deref()).collect();
        let rule = self.env.rule_condition(model, Permission::READ);
        let mut cond = Condition::field(ID_FIELD).is_in(batch.clone());
        if let Some(rule) = &rule {
            cond = cond.and_cond(rule.clone());
        }
        let order = [ID_FIELD.to_string()];
        let (sql, params) = SqlBuilder::new(self.env.registry(), self.env.dialect())
            .select(model, &names, &cond, &order, None, 0)?;
        let rows = self.env.query(&sql, &params)?;
        let found: HashSet<RecordId> = self.fill_cache(&columns, &rows).into_iter().collect();
        if let Some(rule) = &rule {
            let outcome = batch.iter().map(|id| (*id, found.contains(id)));
            self.env
                .cache()
                .mark_readable(self.env.uid(), self.model, &rule.to_string(), outcome);
        }

        let found_ids: Vec<RecordId> = batch.into_iter().filter(|id| found.contains(id)).collect();
        for field in missing.iter().filter(|f| f.storage() == StorageKind::Reverse) {
            self.load_x2many(field, &found_ids)?;
        }
        debug!(model = %model.name, requested = own.len(), found = found.len(), "load");

        Ok(self.keep(|id| id < 0 || found.contains(&id)))
    }

    /// This collection without the ids failing `pred`, keeping its query.
    fn keep(&self, pred: impl Fn(RecordId) -> bool) -> RecordSet {
        let ids: Vec<RecordId> = self.ids.iter().copied().filter(|id| pred(*id)).collect();
        Self {
            env: self.env.clone(),
            model: self.model,
            ids: ids.into(),
            prefetch: Rc::clone(&self.prefetch),
            query: self.query.clone(),
        }
    }

    /// Persisted ids among `ids` the acting user may read under the
    /// READ record rules. Outcomes are remembered per user until the
    /// next write.
    fn readable_ids(&self, ids: &[RecordId]) -> Result<HashSet<RecordId>, OrmError> {
        let model = self.model();
        let Some(rule) = self.env.rule_condition(model, Permission::READ) else {
            return Ok(ids.iter().copied().collect());
        };
        let uid = self.env.uid();
        let key = rule.to_string();
        let mut readable = HashSet::new();
        let mut unknown = Vec::new();
        {
            let cache = self.env.cache_ref();
            for id in ids.iter().copied().filter(|id| *id > 0) {
                match cache.is_readable(uid, self.model, &key, id) {
                    Some(true) => {
                        readable.insert(id);
                    }
                    Some(false) => {}
                    None => unknown.push(id),
                }
            }
        }
        if unknown.is_empty() {
            return Ok(readable);
        }
        let cond = Condition::field(ID_FIELD).is_in(unknown.clone()).and_cond(rule);
        let order = [ID_FIELD.to_string()];
        let (sql, params) = SqlBuilder::new(self.env.registry(), self.env.dialect())
            .select(model, &["id"], &cond, &order, None, 0)?;
        let passed: HashSet<RecordId> = self
            .env
            .query(&sql, &params)?
            .iter()
            .filter_map(|r| r.get_i64("id"))
            .collect();
        let outcome = unknown.iter().map(|id| (*id, passed.contains(id)));
        self.env.cache().mark_readable(uid, self.model, &key, outcome);
        readable.extend(passed);
        Ok(readable)
    }

    /// Cache column values of fetched rows. Returns the row ids in order.
    fn fill_cache(&self, columns: &[&Field], rows: &[Row]) -> Vec<RecordId> {
        let ctxs: Vec<u64> = columns.iter().map(|f| self.env.ctx_hash(f)).collect();
        let mut cache = self.env.cache();
        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(id) = row.get_i64("id") else { continue };
            ids.push(id);
            for (field, ctx) in columns.iter().zip(&ctxs) {
                let column = field.column.as_deref().unwrap_or_default();
                let value = row.get(column).map(|v| field.from_sql(v)).unwrap_or_default();
                cache.set(self.model, id, &field.name, *ctx, value);
            }
        }
        ids
    }

    fn load_x2many(&self, field: &Field, owners: &[RecordId]) -> Result<(), OrmError> {
        if owners.is_empty() {
            return Ok(());
        }
        let registry = self.env.registry();
        let target_id = field.relation.ok_or_else(|| {
            OrmError::Internal(format!("reverse field {} has no relation", field.name))
        })?;
        let target = registry.model_by_id(target_id);
        let mut related: HashMap<RecordId, Vec<RecordId>> = HashMap::new();

        if field.ftype() == FieldType::Many2Many {
            let link = field.link.as_ref().ok_or_else(|| {
                OrmError::Internal(format!("many2many field {} has no link table", field.name))
            })?;
            let marks = vec!["?"; owners.len()].join(", ");
            let sql = format!(
                "SELECT {ours} AS \"owner\", {theirs} AS \"target\" FROM {table} WHERE {ours} IN ({marks}) ORDER BY {theirs}",
                ours = quote_ident(&link.ours),
                theirs = quote_ident(&link.theirs),
                table = quote_ident(&link.table),
            );
            let params: Vec<SqlValue> = owners.iter().map(|id| SqlValue::Integer(*id)).collect();
            for row in self.env.query(&sql, &params)? {
                if let (Some(owner), Some(id)) = (row.get_i64("owner"), row.get_i64("target")) {
                    related.entry(owner).or_default().push(id);
                }
            }
        } else {
            let fk = target.must_field(field.reverse_fk().unwrap_or_default())?;
            let fk_column = fk.column.as_deref().ok_or_else(|| {
                OrmError::Internal(format!("reverse key {}.{} is not stored", target.name, fk.name))
            })?;
            let mut cond = Condition::field(&fk.name).is_in(owners.to_vec());
            if let Some(rule) = self.env.rule_condition(target, Permission::READ) {
                cond = cond.and_cond(rule);
            }
            let order = [ID_FIELD.to_string()];
            let (sql, params) = SqlBuilder::new(registry, self.env.dialect())
                .select(target, &["id", fk_column], &cond, &order, None, 0)?;
            for row in self.env.query(&sql, &params)? {
                if let (Some(id), Some(owner)) = (row.get_i64("id"), row.get_i64(fk_column)) {
                    related.entry(owner).or_default().push(id);
                }
            }
        }

        let ctx = self.env.ctx_hash(field);
        let mut cache = self.env.cache();
        for owner in owners {
            let ids = related.remove(owner).unwrap_or_default();
            cache.set(self.model, *owner, &field.name, ctx, Value::Ids(ids));
        }
        Ok(())
    }

    // ── Searching ──

    pub(crate) fn do_search(&self, cond: Condition) -> Result<RecordSet, OrmError> {
        self.run_query(Query {
            cond,
            ..Query::default()
        })
    }

    fn run_query(&self, query: Query) -> Result<RecordSet, OrmError> {
        let model = self.model();
        let rule = self.env.rule_condition(model, Permission::READ);
        let mut cond = query.cond.clone();
        if let Some(rule) = &rule {
            cond = cond.and_cond(rule.clone());
        }
        let columns: Vec<&Field> = model.fields().filter(|f| f.is_stored()).collect();
        let names: Vec<&str> = columns.iter().filter_map(|f| f.column.as_deref()).collect();
        let (sql, params) = SqlBuilder::new(self.env.registry(), self.env.dialect()).select(
            model,
            &names,
            &cond,
            &query.order,
            query.limit,
            query.offset,
        )?;
        let rows = self.env.query(&sql, &params)?;
        let ids: Rc<[RecordId]> = self.fill_cache(&columns, &rows).into();
        if let Some(rule) = &rule {
            let outcome = ids.iter().map(|id| (*id, true));
            self.env
                .cache()
                .mark_readable(self.env.uid(), self.model, &rule.to_string(), outcome);
        }
        debug!(model = %model.name, cond = %query.cond, found = ids.len(), "search");
        Ok(Self {
            env: self.env.clone(),
            model: self.model,
            prefetch: Rc::clone(&ids),
            ids,
            query: Some(Rc::new(query)),
        })
    }

    pub(crate) fn do_search_count(&self, cond: Condition) -> Result<i64, OrmError> {
        let model = self.model();
        let mut cond = cond;
        if let Some(rule) = self.env.rule_condition(model, Permission::READ) {
            cond = cond.and_cond(rule);
        }
        let (sql, params) = SqlBuilder::new(self.env.registry(), self.env.dialect()).count(model, &cond)?;
        let rows = self.env.query(&sql, &params)?;
        Ok(rows.first().and_then(|r| r.get_i64("count")).unwrap_or(0))
    }

    pub(crate) fn do_browse(&self, ids: Vec<RecordId>) -> RecordSet {
        RecordSet::from_ids(self.env.clone(), self.model, ids)
    }

    pub(crate) fn do_fetch(&self) -> Result<RecordSet, OrmError> {
        self.run_query(self.base_query())
    }

    /// The query behind this collection, or a lookup of its persisted ids.
    fn base_query(&self) -> Query {
        match &self.query {
            Some(q) => (**q).clone(),
            None => Query {
                cond: Condition::field(ID_FIELD).is_in(self.ids.to_vec()),
                ..Query::default()
            },
        }
    }

    /// Re-run with another order, e.g. `["Name desc", "ID"]`.
    pub fn order_by(&self, order: &[&str]) -> Result<RecordSet, OrmError> {
        let mut query = self.base_query();
        query.order = to_strings(order);
        self.run_query(query)
    }

    pub fn limit(&self, limit: usize) -> Result<RecordSet, OrmError> {
        let mut query = self.base_query();
        query.limit = Some(limit);
        self.run_query(query)
    }

    pub fn offset(&self, offset: usize) -> Result<RecordSet, OrmError> {
        let mut query = self.base_query();
        query.offset = offset;
        self.run_query(query)
    }

    /// Same records in the model's default order.
    pub fn sorted_default(&self) -> Result<RecordSet, OrmError> {
        let mut query = self.base_query();
        query.order.clear();
        self.run_query(query)
    }

    pub(crate) fn do_group_by(&self, fields: &[String]) -> Result<RecordSet, OrmError> {
        let model = self.model();
        for name in fields {
            let field = model.must_field(name)?;
            if field.storage() != StorageKind::Column || field.column.is_none() {
                return Err(OrmError::Validation(format!(
                    "cannot group {} by {}: not stored in a column",
                    model.name, field.name
                )));
            }
        }
        let mut query = self.base_query();
        query.group_by = fields.to_vec();
        Ok(Self {
            query: Some(Rc::new(query)),
            ..self.clone()
        })
    }

    pub(crate) fn do_aggregates(&self, fields: &[String]) -> Result<Vec<GroupAggregateRow>, OrmError> {
        let model = self.model();
        let query = self
            .query
            .as_deref()
            .filter(|q| !q.group_by.is_empty())
            .ok_or_else(|| {
                OrmError::Validation(format!("{} collection is not grouped", model.name))
            })?;
        let groups: Vec<&Field> = query
            .group_by
            .iter()
            .map(|name| model.must_field(name))
            .collect::<Result<_, _>>()?;
        let mut sums: Vec<&Field> = Vec::new();
        for name in fields {
            let field = model.must_field(name)?;
            if groups.iter().any(|g| g.name == field.name) || sums.iter().any(|s| s.name == field.name) {
                continue;
            }
            let numeric = matches!(field.ftype(), FieldType::Integer | FieldType::Float);
            if !numeric || field.storage() != StorageKind::Column {
                return Err(OrmError::Validation(format!(
                    "cannot aggregate {}.{}: only stored numeric fields are summed",
                    model.name, field.name
                )));
            }
            sums.push(field);
        }

        let mut cond = query.cond.clone();
        if let Some(rule) = self.env.rule_condition(model, Permission::READ) {
            cond = cond.and_cond(rule);
        }
        let (sql, params) = SqlBuilder::new(self.env.registry(), self.env.dialect())
            .aggregate(model, &groups, &sums, &cond)?;
        let rows = self.env.query(&sql, &params)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut values = RecordData::new();
            let mut condition = query.cond.clone();
            for field in &groups {
                let raw = row.get(field.column.as_deref().unwrap_or_default());
                let value = raw.map(|v| field.from_sql(v)).unwrap_or_default();
                let group = Condition::field(&field.name);
                condition = condition.and_cond(match raw {
                    None | Some(SqlValue::Null) => group.is_null(),
                    Some(_) => group.equals(value.clone()),
                });
                values.insert(&field.name, if value.is_null() { field.zero_value() } else { value });
            }
            for field in &sums {
                let value = row
                    .get(field.column.as_deref().unwrap_or_default())
                    .map(|v| field.from_sql(v))
                    .unwrap_or_default();
                values.insert(&field.name, if value.is_null() { field.zero_value() } else { value });
            }
            out.push(GroupAggregateRow {
                values,
                count: row.get_i64("__count").unwrap_or(0),
                condition,
            });
        }
        debug!(model = %model.name, groups = out.len(), by = ?query.group_by, "aggregates");
        Ok(out)
    }

    /// Every combination taking one record from this collection and one
    /// from each of `others`, each as one collection.
    pub fn cartesian_product(&self, others: &[RecordSet]) -> Result<Vec<RecordSet>, OrmError> {
        let mut out = self.records();
        for other in others {
            self.check_same_model(other, "combine")?;
            let mut next = Vec::with_capacity(out.len() * other.len());
            for left in &out {
                for right in other.records() {
                    next.push(left.union(&right)?);
                }
            }
            out = next;
        }
        Ok(out)
    }

    // ── Collection operations ──

    pub fn first(&self) -> RecordSet {
        self.narrowed(self.ids.first().copied().into_iter().collect())
    }

    /// One singleton collection per record, sharing the prefetch set.
    pub fn records(&self) -> Vec<RecordSet> {
        self.ids.iter().map(|id| self.record(*id)).collect()
    }

    pub fn ensure_one(&self) -> Result<(), OrmError> {
        if self.ids.len() == 1 {
            Ok(())
        } else {
            Err(OrmError::Validation(format!(
                "expected a single {} record, got {}",
                self.model_name(),
                self.ids.len()
            )))
        }
    }

    fn check_same_model(&self, other: &RecordSet, op: &str) -> Result<(), OrmError> {
        if self.model == other.model {
            return Ok(());
        }
        Err(OrmError::Validation(format!(
            "cannot {op} {} and {} records",
            self.model_name(),
            other.model_name()
        )))
    }

    /// Records of both collections, left ones first.
    pub fn union(&self, other: &RecordSet) -> Result<RecordSet, OrmError> {
        self.check_same_model(other, "union")?;
        let ids = self.ids.iter().chain(other.ids.iter()).copied().collect();
        let mut out = self.narrowed(ids);
        out.prefetch = dedup(self.prefetch.iter().chain(other.prefetch.iter()).copied()).into();
        Ok(out)
    }

    /// Records of this collection not in `other`, in this collection's order.
    pub fn subtract(&self, other: &RecordSet) -> Result<RecordSet, OrmError> {
        self.check_same_model(other, "subtract")?;
        let drop: HashSet<RecordId> = other.ids.iter().copied().collect();
        Ok(self.narrowed(self.ids.iter().copied().filter(|id| !drop.contains(id)).collect()))
    }

    /// Records in both collections, in this collection's order.
    pub fn intersect(&self, other: &RecordSet) -> Result<RecordSet, OrmError> {
        self.check_same_model(other, "intersect")?;
        let keep: HashSet<RecordId> = other.ids.iter().copied().collect();
        Ok(self.narrowed(self.ids.iter().copied().filter(|id| keep.contains(id)).collect()))
    }

    /// Same model and same records, in any order.
    pub fn equals(&self, other: &RecordSet) -> bool {
        if self.model != other.model || self.ids.len() != other.ids.len() {
            return false;
        }
        let ours: HashSet<RecordId> = self.ids.iter().copied().collect();
        other.ids.iter().all(|id| ours.contains(id))
    }

    pub fn filtered<F>(&self, mut keep: F) -> Result<RecordSet, OrmError>
    where
        F: FnMut(&RecordSet) -> Result<bool, OrmError>,
    {
        let mut ids = Vec::new();
        for rec in self.records() {
            if keep(&rec)? {
                ids.push(rec.id());
            }
        }
        Ok(self.narrowed(ids))
    }

    /// Sort in memory by a field value.
    pub fn sorted_by_field(&self, field: &str, reverse: bool) -> Result<RecordSet, OrmError> {
        let mut keyed = Vec::with_capacity(self.ids.len());
        for rec in self.records() {
            keyed.push((rec.get(field)?, rec.id()));
        }
        keyed.sort_by(|(a, _), (b, _)| {
            let ord = compare_values(a, b);
            if reverse { ord.reverse() } else { ord }
        });
        Ok(self.narrowed(keyed.into_iter().map(|(_, id)| id).collect()))
    }

    // ── Method bodies of the built-in mixins ──

    pub(crate) fn do_read(&self, fields: &[String]) -> Result<Vec<RecordData>, OrmError> {
        let model = self.model();
        let selected: Vec<&Field> = if fields.is_empty() {
            model.fields().collect()
        } else {
            fields
                .iter()
                .map(|f| model.must_field(f))
                .collect::<Result<_, _>>()?
        };
        let loaded = self.do_load(fields, false)?;
        let mut out = Vec::with_capacity(loaded.len());
        for rec in loaded.records() {
            let mut data = RecordData::new();
            for field in &selected {
                data.insert(&field.name, rec.get(&field.name)?);
            }
            out.push(data);
        }
        Ok(out)
    }

    pub(crate) fn do_name_get(&self) -> Result<String, OrmError> {
        let model = self.model();
        if self.is_empty() {
            return Ok(String::new());
        }
        if model.has_field("Name") {
            return Ok(match self.get("Name")? {
                Value::Char(s) => s,
                other => other.to_string(),
            });
        }
        Ok(format!("{},{}", model.name, self.id()))
    }

    pub(crate) fn do_search_by_name(
        &self,
        name: &str,
        op: Operator,
        cond: Condition,
        limit: usize,
    ) -> Result<RecordSet, OrmError> {
        let mut full = cond;
        if !name.is_empty() && self.model().has_field("Name") {
            full = full.and_cond(Condition::field("Name").op(op, name));
        }
        let limit = if limit == 0 {
            self.env.registry().config().default_limit
        } else {
            limit
        };
        self.run_query(Query {
            cond: full,
            limit: Some(limit),
            ..Query::default()
        })
    }

    pub(crate) fn do_fields_get(&self, fields: &[String]) -> Result<BTreeMap<String, FieldInfo>, OrmError> {
        let model = self.model();
        let registry = self.env.registry();
        let lang = self.env.lang();
        let selected: Vec<&Field> = if fields.is_empty() {
            model.fields().collect()
        } else {
            fields
                .iter()
                .map(|f| model.must_field(f))
                .collect::<Result<_, _>>()?
        };
        Ok(selected
            .into_iter()
            .map(|f| {
                let relation = f.relation.map(|id| registry.model_by_id(id).name.as_str());
                let info = FieldInfo::describe(model, f, relation, &lang, registry.translator());
                (f.name.clone(), info)
            })
            .collect())
    }

    /// Default values: field defaults, overridden by `default_<json>` or
    /// `default_<Name>` context keys.
    pub(crate) fn do_default_get(&self) -> Result<RecordData, OrmError> {
        let model = self.model();
        let mut data = RecordData::new();
        for field in model.fields() {
            let from_ctx = self
                .env
                .context()
                .get(&format!("default_{}", field.json))
                .or_else(|| self.env.context().get(&format!("default_{}", field.name)));
            let value = match (from_ctx, &field.def.default) {
                (Some(v), _) => v.clone(),
                (None, Some(f)) => f(&self.env),
                (None, None) => continue,
            };
            data.insert(&field.name, field.check_value(&model.name, value)?);
        }
        Ok(data)
    }

    pub(crate) fn do_copy_data(&self, overrides: &RecordData) -> Result<RecordData, OrmError> {
        self.ensure_one()?;
        let model = self.model();
        let mut data = RecordData::new();
        for field in model.fields() {
            let skip = field.name == ID_FIELD
                || field.def.no_copy
                || !field.def.copy
                || field.is_related()
                || (field.is_computed() && field.inverse().is_none())
                || overrides.has(&field.name)
                || overrides.has(&field.json);
            if skip {
                continue;
            }
            match field.ftype() {
                FieldType::One2Many => {
                    let fk = field.reverse_fk().unwrap_or_default();
                    let mut out = data;
                    for child in self.get_records(&field.name)?.records() {
                        let mut child_data = child.do_copy_data(&RecordData::new())?;
                        child_data.remove(fk);
                        out = out.create(&field.name, child_data);
                    }
                    data = out;
                }
                FieldType::Rev2One => {}
                _ => data.insert(&field.name, self.get(&field.name)?),
            }
        }
        data.merge(overrides);
        Ok(data)
    }

    pub(crate) fn do_check_recursion(&self) -> Result<bool, OrmError> {
        let model = self.model();
        let Some(parent) = model.field("Parent") else {
            return Ok(true);
        };
        if parent.relation != Some(self.model) {
            return Ok(true);
        }
        for rec in self.records() {
            let start = rec.id();
            let mut seen = HashSet::from([start]);
            let mut current = rec.get_records("Parent")?;
            while let Some(&id) = current.ids.first() {
                if !seen.insert(id) {
                    return Ok(false);
                }
                current = current.get_records("Parent")?;
            }
        }
        Ok(true)
    }

    pub(crate) fn do_get_record(&self, external_id: &str) -> Result<RecordSet, OrmError> {
        self.model().must_field("ExternalID")?;
        self.do_search(Condition::field("ExternalID").equals(external_id))
    }
}

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Ordering used by in-memory sorts. Unset values sort first.
pub(crate) fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        (Value::Char(x), Value::Char(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Ids(x), Value::Ids(y)) => x.cmp(y),
        (Value::Binary(x), Value::Binary(y)) => x.cmp(y),
        _ => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => Ordering::Equal,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_ordering() {
        assert_eq!(compare_values(&Value::Null, &Value::from("a")), Ordering::Less);
        assert_eq!(compare_values(&Value::from(2), &Value::from(1.5)), Ordering::Greater);
        assert_eq!(compare_values(&Value::from("b"), &Value::from("a")), Ordering::Greater);
    }

    #[test]
    fn dedup_keeps_first_occurrence() {
        assert_eq!(dedup([3, 1, 3, 2, 1]), vec![3, 1, 2]);
    }
}
