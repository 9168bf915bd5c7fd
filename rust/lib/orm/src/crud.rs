use indexmap::IndexMap;
use openerp_core::{OrmError, now_rfc3339};
use openerp_sql::{Value as SqlValue, quote_ident};
use tracing::debug;

use crate::compute::Recompute;
use crate::condition::Condition;
use crate::environment::Environment;
use crate::field::{Field, FieldType, StorageKind};
use crate::method::Payload;
use crate::model::{Model, ModelId};
use crate::query::SqlBuilder;
use crate::recordset::RecordSet;
use crate::registry::{ID_FIELD, Registry};
use crate::security::Permission;
use crate::value::{RecordData, RecordId, Value};

// ── Value preparation ───────────────────────────────────────────────

/// Resolve keys to field names and check values against field types.
fn resolve(model: &Model, data: &RecordData) -> Result<IndexMap<String, Value>, OrmError> {
    let mut out = IndexMap::with_capacity(data.len());
    for (key, value) in data.iter() {
        let field = model.must_field(key)?;
        if field.name == ID_FIELD {
            return Err(OrmError::Validation(format!(
                "the ID of a {} record cannot be set",
                model.name
            )));
        }
        out.insert(field.name.clone(), field.check_value(&model.name, value.clone())?);
    }
    Ok(out)
}

/// Foreign keys stored in a column must reference persisted records.
/// Ids of in-memory records are negative and exist only in the cache.
fn check_persisted_refs(model: &Model, values: &IndexMap<String, Value>) -> Result<(), OrmError> {
    for (name, value) in values {
        let field = model.must_field(name)?;
        if !field.ftype().is_fk() || field.storage() != StorageKind::Column {
            continue;
        }
        if let Some(id) = value.ids().into_iter().find(|id| *id < 0) {
            return Err(OrmError::Validation(format!(
                "{}.{} cannot reference unsaved record {id}",
                model.name, field.name
            )));
        }
    }
    Ok(())
}

/// Audit fields of models inheriting `BaseMixin`.
fn stamp(env: &Environment, model: &Model, values: &mut IndexMap<String, Value>, creating: bool) {
    let now = Value::Char(now_rfc3339());
    let uid = Value::Integer(env.uid());
    let mut audit = vec![("WriteDate", now.clone()), ("WriteUID", uid.clone())];
    if creating {
        audit.push(("CreateDate", now));
        audit.push(("CreateUID", uid));
    }
    for (name, value) in audit {
        if model.has_field(name) && !values.contains_key(name) {
            values.insert(name.to_string(), value);
        }
    }
}

fn check_required(model: &Model, values: &IndexMap<String, Value>) -> Result<(), OrmError> {
    for field in model.fields() {
        if !field.required() || !field.is_stored() || field.is_computed() {
            continue;
        }
        let missing = match values.get(&field.name) {
            None | Some(Value::Null) => true,
            Some(Value::Ids(ids)) => ids.is_empty(),
            Some(_) => false,
        };
        if missing {
            return Err(OrmError::Validation(format!(
                "field {}.{} is required",
                model.name, field.name
            )));
        }
    }
    Ok(())
}

/// Values grouped by how they are written.
#[derive(Default)]
struct Split<'m> {
    columns: Vec<(&'m Field, Value)>,
    x2many: Vec<(&'m Field, Value)>,
    related: Vec<(&'m Field, Value)>,
    inverse: Vec<(&'m Field, Value)>,
}

fn split(model: &Model, values: IndexMap<String, Value>) -> Result<Split<'_>, OrmError> {
    let mut out = Split::default();
    for (name, value) in values {
        let field = model.must_field(&name)?;
        match field.storage() {
            StorageKind::Column => out.columns.push((field, value)),
            StorageKind::Reverse => out.x2many.push((field, value)),
            StorageKind::Related => out.related.push((field, value)),
            StorageKind::ComputedStored | StorageKind::ComputedTransient => {
                if field.inverse().is_none() {
                    return Err(OrmError::Validation(format!(
                        "field {}.{} is computed and has no inverse method",
                        model.name, field.name
                    )));
                }
                out.inverse.push((field, value));
            }
        }
    }
    Ok(out)
}

fn id_marks(ids: &[RecordId], params: &mut Vec<SqlValue>) -> String {
    params.extend(ids.iter().map(|id| SqlValue::Integer(*id)));
    vec!["?"; ids.len()].join(", ")
}

/// Fail unless every id passes the record rules of `perm`.
fn check_rule(rs: &RecordSet, ids: &[RecordId], perm: Permission, op: &str) -> Result<(), OrmError> {
    let env = rs.env();
    let model = rs.model();
    let Some(rule) = env.rule_condition(model, perm) else {
        return Ok(());
    };
    let cond = Condition::field(ID_FIELD).is_in(ids.to_vec()).and_cond(rule);
    let (sql, params) = SqlBuilder::new(env.registry(), env.dialect()).count(model, &cond)?;
    let rows = env.query(&sql, &params)?;
    let allowed = rows.first().and_then(|r| r.get_i64("count")).unwrap_or(0);
    if allowed < ids.len() as i64 {
        return Err(OrmError::Permission(format!(
            "user {} cannot {op} some {} records: excluded by record rules",
            env.uid(),
            model.name
        )));
    }
    Ok(())
}

// ── Side effects ────────────────────────────────────────────────────

/// One-to-many and reverse one-to-one fields mirroring `fk` of `model`.
fn reverse_fields(registry: &Registry, model: &Model, fk: &Field) -> Vec<(ModelId, String)> {
    let Some(target_id) = fk.relation else {
        return Vec::new();
    };
    registry
        .model_by_id(target_id)
        .fields()
        .filter(|f| matches!(f.ftype(), FieldType::One2Many | FieldType::Rev2One))
        .filter(|f| f.relation == Some(model.id))
        .filter(|f| {
            f.reverse_fk()
                .and_then(|name| model.field(name))
                .is_some_and(|own| own.name == fk.name)
        })
        .map(|f| (target_id, f.name.clone()))
        .collect()
}

/// Many-to-many fields sharing the link table of `field`, other than itself.
fn mirror_fields(registry: &Registry, model: &Model, field: &Field) -> Vec<(ModelId, String)> {
    let Some(link) = &field.link else {
        return Vec::new();
    };
    registry
        .models()
        .filter(|m| !m.is_mixin())
        .flat_map(|m| m.fields().map(move |f| (m, f)))
        .filter(|(_, f)| f.link.as_ref().is_some_and(|l| l.table == link.table))
        .filter(|(m, f)| !(m.id == model.id && f.name == field.name))
        .map(|(m, f)| (m.id, f.name.clone()))
        .collect()
}

/// `fk` changed on some records: the reverse fields of `targets` changed.
fn reverse_changed(
    env: &Environment,
    model: &Model,
    fk: &Field,
    targets: &[RecordId],
    recompute: &mut Recompute,
) -> Result<(), OrmError> {
    for (target, name) in reverse_fields(env.registry(), model, fk) {
        env.cache().invalidate_field(target, &name);
        recompute.changed(target, targets, &[name.as_str()])?;
    }
    Ok(())
}

fn write_x2many(
    records: &RecordSet,
    field: &Field,
    targets: Vec<RecordId>,
    recompute: &mut Recompute,
) -> Result<(), OrmError> {
    let env = records.env();
    let model = records.model();
    let target_id = field.relation.ok_or_else(|| {
        OrmError::Internal(format!("relation field {} has no target", field.name))
    })?;
    let targets: Vec<RecordId> = targets.into_iter().filter(|id| *id > 0).collect();

    if field.ftype() == FieldType::Many2Many {
        let link = field.link.as_ref().ok_or_else(|| {
            OrmError::Internal(format!("many2many field {} has no link table", field.name))
        })?;
        let delete = format!(
            "DELETE FROM {} WHERE {} = ?",
            quote_ident(&link.table),
            quote_ident(&link.ours)
        );
        let insert = format!(
            "INSERT INTO {} ({}, {}) VALUES (?, ?)",
            quote_ident(&link.table),
            quote_ident(&link.ours),
            quote_ident(&link.theirs)
        );
        let mut touched = targets.clone();
        for owner in records.records() {
            touched.extend(owner.get(&field.name)?.ids());
            env.exec(&delete, &[SqlValue::Integer(owner.id())])?;
            for target in &targets {
                env.exec(&insert, &[SqlValue::Integer(owner.id()), SqlValue::Integer(*target)])?;
            }
        }
        let ctx = env.ctx_hash(field);
        let mirrors = mirror_fields(env.registry(), model, field);
        {
            let mut cache = env.cache();
            for owner in records.ids() {
                cache.set(model.id, *owner, &field.name, ctx, Value::Ids(targets.clone()));
            }
            for (m, name) in &mirrors {
                cache.invalidate_field(*m, name);
            }
        }
        for (m, name) in &mirrors {
            recompute.changed(*m, &touched, &[name.as_str()])?;
        }
        return Ok(());
    }

    if records.len() > 1 && !targets.is_empty() {
        return Err(OrmError::Validation(format!(
            "cannot link the same records to several {} records through {}",
            model.name, field.name
        )));
    }
    let fk = field.reverse_fk().unwrap_or_default();
    let pool = RecordSet::empty(env.clone(), target_id);
    for owner in records.records() {
        let removed: Vec<RecordId> = owner
            .get(&field.name)?
            .ids()
            .into_iter()
            .filter(|id| !targets.contains(id))
            .collect();
        if !removed.is_empty() {
            pool.do_browse(removed).write(RecordData::new().set(fk, Value::Null))?;
        }
        if !targets.is_empty() {
            pool.do_browse(targets.clone())
                .write(RecordData::new().set(fk, owner.id()))?;
        }
    }
    Ok(())
}

/// Write `value` at the end of a related path. An empty many-to-one hop
/// gets a new target record.
fn write_related(records: &RecordSet, path: &[String], value: &Value) -> Result<(), OrmError> {
    let Some((head, rest)) = path.split_first() else {
        return Ok(());
    };
    if rest.is_empty() {
        records.write(RecordData::new().set(head, value.clone()))?;
        return Ok(());
    }
    for rec in records.records() {
        let next = rec.get_records(head)?;
        if !next.is_empty() {
            write_related(&next, rest, value)?;
            continue;
        }
        let field = rec.model().must_field(head)?;
        if !field.ftype().is_fk() {
            return Err(OrmError::Validation(format!(
                "cannot write through empty {} field {}.{}",
                field.ftype(),
                rec.model_name(),
                field.name
            )));
        }
        let data = match rest {
            [last] => RecordData::new().set(last, value.clone()),
            _ => RecordData::new(),
        };
        let created = next.create(data)?;
        // Linking the new target is part of the current call.
        write(&rec, RecordData::new().set(head, created.id()))?;
        if rest.len() > 1 {
            write_related(&created, rest, value)?;
        }
    }
    Ok(())
}

fn call_inverse(records: &RecordSet, field: &Field, value: &Value) -> Result<(), OrmError> {
    let Some(method) = field.inverse() else {
        return Ok(());
    };
    for rec in records.records() {
        rec.call_unchecked(method, vec![Payload::Value(value.clone())])?;
    }
    Ok(())
}

/// Run the constraint methods of `fields` on every record.
fn check_constraints(records: &RecordSet, fields: &[String]) -> Result<(), OrmError> {
    let model = records.model();
    let mut methods: Vec<&str> = Vec::new();
    for name in fields {
        if let Some(method) = model.field(name).and_then(Field::constraint) {
            if !methods.contains(&method) {
                methods.push(method);
            }
        }
    }
    for rec in records.records() {
        for method in &methods {
            rec.call_unchecked(method, Vec::new()).map_err(|e| match e {
                OrmError::Validation(msg) => OrmError::Constraint(msg),
                other => other,
            })?;
        }
    }
    Ok(())
}

fn ensure_table(model: &Model, op: &str) -> Result<(), OrmError> {
    if model.has_table() {
        return Ok(());
    }
    Err(OrmError::Validation(format!(
        "cannot {op} {} records: the model is not backed by an engine table",
        model.name
    )))
}

// ── Create ──────────────────────────────────────────────────────────

pub(crate) fn create(rs: &RecordSet, mut data: RecordData) -> Result<RecordSet, OrmError> {
    let env = rs.env();
    let model = rs.model();
    ensure_table(model, "create")?;

    let creates = data.take_creates();
    let mut values = resolve(model, &data)?;
    check_persisted_refs(model, &values)?;
    let mut nested = Vec::new();
    for (key, subs) in creates {
        let field = model.must_field(&key)?;
        let target = field.relation.ok_or_else(|| {
            OrmError::Validation(format!("cannot create records through {}.{}", model.name, field.name))
        })?;
        let pool = RecordSet::empty(env.clone(), target);
        match field.ftype() {
            t if t.is_fk() => {
                let [sub] = <[RecordData; 1]>::try_from(subs).map_err(|subs| {
                    OrmError::Validation(format!(
                        "{}.{} accepts one record, got {}",
                        model.name,
                        field.name,
                        subs.len()
                    ))
                })?;
                values.insert(field.name.clone(), Value::Ids(vec![pool.create(sub)?.id()]));
            }
            FieldType::Many2Many => {
                let mut ids = values.get(&field.name).map(Value::ids).unwrap_or_default();
                for sub in subs {
                    ids.push(pool.create(sub)?.id());
                }
                values.insert(field.name.clone(), Value::Ids(ids));
            }
            _ => nested.push((field, pool, subs)),
        }
    }
    for (name, value) in rs.do_default_get()?.iter() {
        let taken = values.contains_key(name) || nested.iter().any(|(f, _, _)| f.name == name);
        if !taken {
            values.insert(name.to_string(), value.clone());
        }
    }
    stamp(env, model, &mut values, true);
    check_required(model, &values)?;

    let mut present: Vec<String> = values.keys().cloned().collect();
    present.extend(nested.iter().map(|(f, _, _)| f.name.clone()));
    let split = split(model, values)?;

    let id = insert(env, model, &split.columns)?;
    {
        let ctxs: Vec<(&Field, u64)> = model
            .fields()
            .filter(|f| f.is_stored() && !f.is_computed())
            .map(|f| (f, env.ctx_hash(f)))
            .collect();
        let mut cache = env.cache();
        cache.forget_readable();
        for (field, ctx) in ctxs {
            let value = if field.name == ID_FIELD {
                Value::Integer(id)
            } else {
                split
                    .columns
                    .iter()
                    .find(|(f, _)| f.name == field.name)
                    .map(|(_, v)| v.clone())
                    .unwrap_or_else(|| field.from_sql(&SqlValue::Null))
            };
            cache.set(model.id, id, &field.name, ctx, value);
        }
    }
    debug!(model = %model.name, id, "created record");

    let record = RecordSet::from_ids(env.clone(), model.id, vec![id]);
    let mut recompute = Recompute::new(env);
    for (field, value) in &split.columns {
        if field.ftype().is_fk() {
            reverse_changed(env, model, field, &value.ids(), &mut recompute)?;
        }
    }
    for (field, value) in &split.x2many {
        write_x2many(&record, field, value.ids(), &mut recompute)?;
    }
    for (field, pool, subs) in nested {
        let fk = field.reverse_fk().unwrap_or_default();
        for mut sub in subs {
            sub.insert(fk, Value::Ids(vec![id]));
            pool.create(sub)?;
        }
    }
    for (field, value) in &split.related {
        write_related(&record, &field.related_path, value)?;
    }
    for (field, value) in &split.inverse {
        call_inverse(&record, field, value)?;
    }

    for field in model.fields().filter(|f| f.storage() == StorageKind::ComputedStored) {
        recompute.schedule(model.id, &field.name, &[id]);
    }
    recompute.changed(model.id, &[id], &present)?;
    recompute.run()?;
    check_constraints(&record, &present)?;
    Ok(record)
}

fn insert(env: &Environment, model: &Model, columns: &[(&Field, Value)]) -> Result<RecordId, OrmError> {
    let table = quote_ident(&model.table);
    let sql = if columns.is_empty() {
        format!("INSERT INTO {table} DEFAULT VALUES RETURNING \"id\"")
    } else {
        let names: Vec<String> = columns
            .iter()
            .map(|(f, _)| quote_ident(f.column.as_deref().unwrap_or_default()))
            .collect();
        format!(
            "INSERT INTO {table} ({}) VALUES ({}) RETURNING \"id\"",
            names.join(", "),
            vec!["?"; columns.len()].join(", ")
        )
    };
    let params: Vec<SqlValue> = columns.iter().map(|(_, v)| v.to_sql()).collect();
    let rows = env.query(&sql, &params)?;
    rows.first()
        .and_then(|r| r.get_i64("id"))
        .ok_or_else(|| OrmError::Storage(format!("insert into {} returned no id", model.table)))
}

// ── Write ───────────────────────────────────────────────────────────

pub(crate) fn write(rs: &RecordSet, mut data: RecordData) -> Result<bool, OrmError> {
    let env = rs.env();
    let model = rs.model();
    if rs.is_empty() || data.is_empty() {
        return Ok(true);
    }
    let creates = data.take_creates();
    let mut values = resolve(model, &data)?;

    let (persisted, fresh): (Vec<RecordId>, Vec<RecordId>) =
        rs.ids().iter().copied().partition(|id| *id > 0);
    if !fresh.is_empty() {
        if !creates.is_empty() {
            return Err(OrmError::Validation(format!(
                "cannot create sub-records of unsaved {} records",
                model.name
            )));
        }
        let ctxs: Vec<u64> = values
            .keys()
            .map(|name| model.field(name).map(|f| env.ctx_hash(f)).unwrap_or(0))
            .collect();
        let mut cache = env.cache();
        for ((name, value), ctx) in values.iter().zip(ctxs) {
            for id in &fresh {
                cache.set(model.id, *id, name, ctx, value.clone());
            }
        }
    }
    if persisted.is_empty() {
        return Ok(true);
    }
    check_persisted_refs(model, &values)?;
    ensure_table(model, "write")?;
    check_rule(rs, &persisted, Permission::WRITE, "write")?;
    let records = RecordSet::from_ids(env.clone(), model.id, persisted.clone());

    let mut nested = Vec::new();
    for (key, subs) in creates {
        let field = model.must_field(&key)?;
        let target = field.relation.ok_or_else(|| {
            OrmError::Validation(format!("cannot create records through {}.{}", model.name, field.name))
        })?;
        let pool = RecordSet::empty(env.clone(), target);
        match field.ftype() {
            t if t.is_fk() => {
                for sub in subs {
                    values.insert(field.name.clone(), Value::Ids(vec![pool.create(sub)?.id()]));
                }
            }
            FieldType::Many2Many => {
                let mut ids = match values.get(&field.name) {
                    Some(v) => v.ids(),
                    None => records.get(&field.name)?.ids(),
                };
                for sub in subs {
                    ids.push(pool.create(sub)?.id());
                }
                values.insert(field.name.clone(), Value::Ids(ids));
            }
            _ => {
                records.ensure_one()?;
                nested.push((field, pool, subs));
            }
        }
    }

    // Byte-identical values of loaded records are inert.
    let columns: Vec<String> = values
        .keys()
        .filter(|k| model.field(k).is_some_and(|f| f.storage() == StorageKind::Column))
        .cloned()
        .collect();
    if !columns.is_empty() {
        records.do_load(&columns, false)?;
    }
    values.retain(|name, value| {
        let Some(field) = model.field(name) else {
            return true;
        };
        if !matches!(field.storage(), StorageKind::Column | StorageKind::Reverse) {
            return true;
        }
        let ctx = env.ctx_hash(field);
        let cache = env.cache_ref();
        persisted
            .iter()
            .any(|id| cache.get(model.id, *id, name, ctx) != Some(&*value))
    });
    if values.is_empty() && nested.is_empty() {
        return Ok(true);
    }

    stamp(env, model, &mut values, false);
    let mut present: Vec<String> = values.keys().cloned().collect();
    present.extend(nested.iter().map(|(f, _, _)| f.name.clone()));
    let split = split(model, values)?;

    let mut fk_old: Vec<(&Field, Vec<RecordId>)> = Vec::new();
    for (field, value) in split.columns.iter().filter(|(f, _)| f.ftype().is_fk()) {
        let mut touched = value.ids();
        for rec in records.records() {
            touched.extend(rec.raw_value(rec.id(), field)?.ids());
        }
        fk_old.push((field, touched));
    }

    if !split.columns.is_empty() {
        let mut params: Vec<SqlValue> = split.columns.iter().map(|(_, v)| v.to_sql()).collect();
        let sets: Vec<String> = split
            .columns
            .iter()
            .map(|(f, _)| format!("{} = ?", quote_ident(f.column.as_deref().unwrap_or_default())))
            .collect();
        let marks = id_marks(&persisted, &mut params);
        let sql = format!(
            "UPDATE {} SET {} WHERE \"id\" IN ({marks})",
            quote_ident(&model.table),
            sets.join(", ")
        );
        env.exec(&sql, &params)?;
        let ctxs: Vec<u64> = split.columns.iter().map(|(f, _)| env.ctx_hash(f)).collect();
        let mut cache = env.cache();
        cache.forget_readable();
        for ((field, value), ctx) in split.columns.iter().zip(ctxs) {
            for id in &persisted {
                cache.set(model.id, *id, &field.name, ctx, value.clone());
            }
        }
    }
    debug!(model = %model.name, records = persisted.len(), fields = ?present, "wrote records");

    let mut recompute = Recompute::new(env);
    for (field, touched) in &fk_old {
        reverse_changed(env, model, field, touched, &mut recompute)?;
    }
    for (field, value) in &split.x2many {
        write_x2many(&records, field, value.ids(), &mut recompute)?;
    }
    for (field, pool, subs) in nested {
        let fk = field.reverse_fk().unwrap_or_default();
        for mut sub in subs {
            sub.insert(fk, Value::Ids(vec![records.id()]));
            pool.create(sub)?;
        }
    }
    for (field, value) in &split.related {
        write_related(&records, &field.related_path, value)?;
    }
    for (field, value) in &split.inverse {
        call_inverse(&records, field, value)?;
    }

    recompute.changed(model.id, &persisted, &present)?;
    recompute.run()?;
    check_constraints(&records, &present)?;
    Ok(true)
}

// ── Unlink ──────────────────────────────────────────────────────────

pub(crate) fn unlink(rs: &RecordSet) -> Result<i64, OrmError> {
    let env = rs.env();
    let model = rs.model();
    let registry = env.registry().clone();
    let (persisted, fresh): (Vec<RecordId>, Vec<RecordId>) =
        rs.ids().iter().copied().partition(|id| *id > 0);
    if !fresh.is_empty() {
        env.cache().invalidate_records(model.id, &fresh);
    }
    if persisted.is_empty() {
        return Ok(0);
    }
    ensure_table(model, "unlink")?;
    check_rule(rs, &persisted, Permission::UNLINK, "unlink")?;
    let records = RecordSet::from_ids(env.clone(), model.id, persisted.clone());
    let mut recompute = Recompute::new(env);

    // Targets of our own relations, to refresh their reverse side.
    let mut own_fks: Vec<(&Field, Vec<RecordId>)> = Vec::new();
    let mut own_links: Vec<(ModelId, String, Vec<RecordId>)> = Vec::new();
    for field in model.fields() {
        if field.ftype().is_fk() && field.is_stored() {
            let mut targets = Vec::new();
            for rec in records.records() {
                targets.extend(rec.raw_value(rec.id(), field)?.ids());
            }
            own_fks.push((field, targets));
        } else if field.ftype() == FieldType::Many2Many {
            let mirrors = mirror_fields(&registry, model, field);
            if mirrors.is_empty() {
                continue;
            }
            let mut targets = Vec::new();
            for rec in records.records() {
                targets.extend(rec.get(&field.name)?.ids());
            }
            for (m, name) in mirrors {
                own_links.push((m, name, targets.clone()));
            }
        }
    }

    // Records of other models pointing at the deleted ones.
    let sudo = env.sudo();
    let mut incoming: Vec<(ModelId, String, Vec<RecordId>, bool)> = Vec::new();
    for other in registry.models().filter(|m| m.has_table()) {
        for field in other
            .fields()
            .filter(|f| f.ftype().is_fk() && f.is_stored() && f.relation == Some(model.id))
        {
            let cascade = field.def.on_delete == crate::field::OnDelete::Cascade;
            if !cascade && !recompute.matters(other.id, &field.name) {
                continue;
            }
            let referencing = RecordSet::empty(sudo.clone(), other.id)
                .do_search(Condition::field(&field.name).is_in(persisted.clone()))?;
            if !referencing.is_empty() {
                incoming.push((other.id, field.name.clone(), referencing.ids().to_vec(), cascade));
            }
        }
    }

    let mut params = Vec::with_capacity(persisted.len());
    let marks = id_marks(&persisted, &mut params);
    let sql = format!("DELETE FROM {} WHERE \"id\" IN ({marks})", quote_ident(&model.table));
    let deleted = env.exec(&sql, &params)?;
    debug!(model = %model.name, deleted, "unlinked records");

    {
        let mut cache = env.cache();
        cache.invalidate_records(model.id, &persisted);
        for other in registry.models().filter(|m| !m.is_mixin()) {
            for field in other.fields().filter(|f| f.relation == Some(model.id)) {
                cache.invalidate_field(other.id, &field.name);
            }
        }
        for (other, _, ids, cascade) in &incoming {
            if *cascade {
                cache.invalidate_records(*other, ids);
            }
        }
    }
    for (other, field, ids, cascade) in &incoming {
        if !cascade {
            recompute.changed(*other, ids, &[field.as_str()])?;
        }
    }
    for (field, targets) in &own_fks {
        reverse_changed(env, model, field, targets, &mut recompute)?;
    }
    for (m, name, targets) in &own_links {
        recompute.changed(*m, targets, &[name.as_str()])?;
    }
    recompute.run()?;
    Ok(deleted as i64)
}

// ── New ─────────────────────────────────────────────────────────────

/// In-memory record with a negative id, holding defaults and `data`.
pub(crate) fn new_record(rs: &RecordSet, data: RecordData) -> Result<RecordSet, OrmError> {
    let env = rs.env();
    let model = rs.model();
    if data.creates().next().is_some() {
        return Err(OrmError::Validation(format!(
            "cannot create sub-records of unsaved {} records",
            model.name
        )));
    }
    let mut values = resolve(model, &rs.do_default_get()?)?;
    values.extend(resolve(model, &data)?);
    let ctxs: Vec<u64> = values
        .keys()
        .map(|name| model.field(name).map(|f| env.ctx_hash(f)).unwrap_or(0))
        .collect();
    let id = env.cache().next_new_id();
    {
        let mut cache = env.cache();
        for ((name, value), ctx) in values.into_iter().zip(ctxs) {
            cache.set(model.id, id, &name, ctx, value);
        }
    }
    Ok(RecordSet::from_ids(env.clone(), model.id, vec![id]))
}
