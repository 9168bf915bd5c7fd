//! Condition → SQL translation.
//!
//! Single-valued relation hops (many-to-one, one-to-one) become one
//! `LEFT JOIN` each, shared between leaves walking the same path.
//! Multi-valued hops (one-to-many, reverse one-to-one, many-to-many)
//! become `id IN (subquery)` so that several conditions on the same
//! relation never multiply base rows. `NOT` is pushed down to the leaves.

use std::borrow::Cow;
use std::collections::HashMap;

use openerp_core::OrmError;
use openerp_sql::{Value as SqlValue, quote_ident};

use crate::condition::{Condition, Operator};
use crate::field::{Field, FieldType, StorageKind};
use crate::model::Model;
use crate::registry::{ID_FIELD, Registry};
use crate::value::{RecordData, RecordId, Value};

/// SQL dialect quirks, keyed by the store's driver name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

impl Dialect {
    pub fn from_driver(name: &str) -> Self {
        match name {
            "postgres" | "postgresql" | "pgx" => Dialect::Postgres,
            _ => Dialect::Sqlite,
        }
    }

    /// Rewrite `?` placeholders into `$1, $2, ...` where the dialect needs it.
    /// Question marks inside quoted literals are left alone.
    pub fn placeholders<'a>(self, sql: &'a str) -> Cow<'a, str> {
        if self == Dialect::Sqlite || !sql.contains('?') {
            return Cow::Borrowed(sql);
        }
        let mut out = String::with_capacity(sql.len() + 8);
        let mut n = 0;
        let mut in_quote: Option<char> = None;
        for c in sql.chars() {
            match (c, in_quote) {
                ('\'' | '"', None) => {
                    in_quote = Some(c);
                    out.push(c);
                }
                (q, Some(open)) if q == open => {
                    in_quote = None;
                    out.push(c);
                }
                ('?', None) => {
                    n += 1;
                    out.push('$');
                    out.push_str(&n.to_string());
                }
                _ => out.push(c),
            }
        }
        Cow::Owned(out)
    }

    fn contains(self, col: &str, needle: &str) -> (String, SqlValue) {
        match self {
            Dialect::Sqlite => (format!("INSTR({col}, ?) > 0"), SqlValue::Text(needle.to_string())),
            Dialect::Postgres => (
                format!("{col} LIKE ? ESCAPE '\\'"),
                SqlValue::Text(format!("%{}%", escape_like(needle))),
            ),
        }
    }

    fn icontains(self, col: &str, needle: &str) -> (String, SqlValue) {
        let pattern = SqlValue::Text(format!("%{}%", escape_like(needle)));
        match self {
            Dialect::Sqlite => (format!("LOWER({col}) LIKE LOWER(?) ESCAPE '\\'"), pattern),
            Dialect::Postgres => (format!("{col} ILIKE ? ESCAPE '\\'"), pattern),
        }
    }

    fn ilike(self, col: &str) -> String {
        match self {
            Dialect::Sqlite => format!("LOWER({col}) LIKE LOWER(?)"),
            Dialect::Postgres => format!("{col} ILIKE ?"),
        }
    }

    fn limit_offset(self, limit: Option<usize>, offset: usize) -> String {
        match (limit, offset, self) {
            (None, 0, _) => String::new(),
            (Some(l), 0, _) => format!(" LIMIT {l}"),
            (Some(l), o, _) => format!(" LIMIT {l} OFFSET {o}"),
            (None, o, Dialect::Sqlite) => format!(" LIMIT -1 OFFSET {o}"),
            (None, o, Dialect::Postgres) => format!(" OFFSET {o}"),
        }
    }
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

/// Search state kept by a record collection so it can be re-executed with
/// another order, limit or offset.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Query {
    pub cond: Condition,
    pub order: Vec<String>,
    pub limit: Option<usize>,
    pub offset: usize,
    /// Fields of a grouped query, empty when not grouped.
    pub group_by: Vec<String>,
}

/// One group of a grouped query: the group values, the sums of the
/// aggregated fields and the number of records.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupAggregateRow {
    pub values: RecordData,
    pub count: i64,
    /// Condition selecting the records of the group.
    pub condition: Condition,
}

#[derive(Debug, Default)]
struct Scope {
    joins: Vec<String>,
    aliases: HashMap<String, String>,
}

/// One-shot SQL statement builder. Parameters are collected in textual order.
pub(crate) struct SqlBuilder<'r> {
    registry: &'r Registry,
    dialect: Dialect,
    params: Vec<SqlValue>,
    seq: usize,
}

impl<'r> SqlBuilder<'r> {
    pub fn new(registry: &'r Registry, dialect: Dialect) -> Self {
        Self {
            registry,
            dialect,
            params: Vec::new(),
            seq: 0,
        }
    }

    fn alias(&mut self, prefix: char) -> String {
        self.seq += 1;
        format!("{prefix}{}", self.seq)
    }

    /// `SELECT <columns> FROM <model> WHERE <cond> ORDER BY ... LIMIT ...`
    pub fn select(
        mut self,
        model: &Model,
        columns: &[&str],
        cond: &Condition,
        order: &[String],
        limit: Option<usize>,
        offset: usize,
    ) -> Result<(String, Vec<SqlValue>), OrmError> {
        let mut scope = Scope::default();
        let where_sql = self.condition(&mut scope, model, "t0", cond, false)?;
        let order_sql = self.order_by(&mut scope, model, "t0", order)?;
        let cols: Vec<String> = columns
            .iter()
            .map(|c| format!("t0.{q} AS {q}", q = quote_ident(c)))
            .collect();
        let sql = format!(
            "SELECT {} FROM {} t0{} WHERE {} ORDER BY {}{}",
            cols.join(", "),
            quote_ident(&model.table),
            render_joins(&scope),
            where_sql,
            order_sql,
            self.dialect.limit_offset(limit, offset),
        );
        Ok((sql, self.params))
    }

    /// `SELECT COUNT(*) FROM <model> WHERE <cond>`
    pub fn count(mut self, model: &Model, cond: &Condition) -> Result<(String, Vec<SqlValue>), OrmError> {
        let mut scope = Scope::default();
        let where_sql = self.condition(&mut scope, model, "t0", cond, false)?;
        let sql = format!(
            "SELECT COUNT(*) AS \"count\" FROM {} t0{} WHERE {}",
            quote_ident(&model.table),
            render_joins(&scope),
            where_sql,
        );
        Ok((sql, self.params))
    }

    /// `SELECT <groups>, SUM(<sums>), COUNT(*) FROM <model> WHERE <cond>
    /// GROUP BY <groups>`, ordered by the group columns. Each column is
    /// aliased to itself and the count to `__count`.
    pub fn aggregate(
        mut self,
        model: &Model,
        groups: &[&Field],
        sums: &[&Field],
        cond: &Condition,
    ) -> Result<(String, Vec<SqlValue>), OrmError> {
        if groups.is_empty() {
            return Err(OrmError::Validation(format!(
                "grouped query on {} needs at least one field",
                model.name
            )));
        }
        let column = |f: &Field| {
            f.column.as_deref().map(quote_ident).ok_or_else(|| {
                OrmError::Validation(format!("{}.{} is not stored in a column", model.name, f.name))
            })
        };
        let mut keys = Vec::with_capacity(groups.len());
        let mut cols = Vec::with_capacity(groups.len() + sums.len() + 1);
        for &field in groups {
            let col = column(field)?;
            keys.push(format!("t0.{col}"));
            cols.push(format!("t0.{col} AS {col}"));
        }
        for &field in sums {
            let col = column(field)?;
            cols.push(format!("SUM(t0.{col}) AS {col}"));
        }
        cols.push("COUNT(*) AS \"__count\"".to_string());

        let mut scope = Scope::default();
        let where_sql = self.condition(&mut scope, model, "t0", cond, false)?;
        let order: Vec<String> = keys.iter().map(|k| format!("{k} ASC")).collect();
        let sql = format!(
            "SELECT {} FROM {} t0{} WHERE {} GROUP BY {} ORDER BY {}",
            cols.join(", "),
            quote_ident(&model.table),
            render_joins(&scope),
            where_sql,
            keys.join(", "),
            order.join(", "),
        );
        Ok((sql, self.params))
    }

    fn condition(
        &mut self,
        scope: &mut Scope,
        model: &Model,
        alias: &str,
        cond: &Condition,
        negate: bool,
    ) -> Result<String, OrmError> {
        match cond {
            Condition::Leaf(p) => {
                let path: Vec<String> = p.path.split('.').map(str::to_string).collect();
                self.leaf(scope, model, alias, &path, p.op, &p.arg, negate)
            }
            Condition::Not(inner) => self.condition(scope, model, alias, inner, !negate),
            Condition::And(items) | Condition::Or(items) => {
                let is_and = matches!(cond, Condition::And(_)) != negate;
                if items.is_empty() {
                    return Ok(if is_and { "1 = 1" } else { "1 = 0" }.to_string());
                }
                let mut parts = Vec::with_capacity(items.len());
                for item in items {
                    parts.push(self.condition(scope, model, alias, item, negate)?);
                }
                if parts.len() == 1 {
                    return Ok(parts.remove(0));
                }
                let sep = if is_and { " AND " } else { " OR " };
                Ok(format!("({})", parts.join(sep)))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn leaf(
        &mut self,
        scope: &mut Scope,
        model: &Model,
        alias: &str,
        path: &[String],
        op: Operator,
        arg: &Value,
        negate: bool,
    ) -> Result<String, OrmError> {
        let field = model.field(&path[0]).ok_or_else(|| {
            OrmError::Validation(format!("unknown field {}.{} in condition", model.name, path[0]))
        })?;
        let rest = &path[1..];

        if field.is_related() {
            let mut full = field.related_path.clone();
            full.extend_from_slice(rest);
            return self.leaf(scope, model, alias, &full, op, arg, negate);
        }
        if field.storage() == StorageKind::ComputedTransient {
            return Err(OrmError::Validation(format!(
                "field {}.{} is not stored and cannot be searched",
                model.name, field.name
            )));
        }

        let target = field.relation.map(|id| self.registry.model_by_id(id));

        if !rest.is_empty() {
            let target = target.ok_or_else(|| {
                OrmError::Validation(format!(
                    "{}.{} is not a relation and cannot be traversed",
                    model.name, field.name
                ))
            })?;
            if field.ftype().is_fk() {
                let joined = self.join(scope, alias, field, target);
                return self.leaf(scope, target, &joined, rest, op, arg, negate);
            }
            let sub = self.owners(field, target, Some((rest, op, arg)))?;
            let verb = if negate { "NOT IN" } else { "IN" };
            return Ok(format!("{alias}.\"id\" {verb} ({sub})"));
        }

        match (field.ftype(), target) {
            (t, Some(target)) if t.is_reverse() => self.x2many_leaf(alias, field, target, op, arg, negate),
            (t, Some(target)) if t.is_fk() => {
                if is_text_op(op) {
                    if target.has_field("Name") {
                        let name_path = vec![field.name.clone(), "Name".to_string()];
                        return self.leaf(scope, model, alias, &name_path, op, arg, negate);
                    }
                    return Err(OrmError::Validation(format!(
                        "operator '{}' not supported on {}.{}",
                        op.as_str(),
                        model.name,
                        field.name
                    )));
                }
                let col = column_ref(alias, field)?;
                if is_id_op(op) {
                    Ok(self.fk_leaf(&col, op, arg, negate))
                } else {
                    Ok(self.scalar_leaf(&col, field, op, arg, negate))
                }
            }
            _ => {
                let col = column_ref(alias, field)?;
                Ok(self.scalar_leaf(&col, field, op, arg, negate))
            }
        }
    }

    /// Join a single-valued relation once per (alias, field).
    fn join(&mut self, scope: &mut Scope, alias: &str, field: &Field, target: &Model) -> String {
        let key = format!("{alias}.{}", field.name);
        if let Some(existing) = scope.aliases.get(&key) {
            return existing.clone();
        }
        let joined = self.alias('j');
        let column = field.column.as_deref().unwrap_or_default();
        scope.joins.push(format!(
            "LEFT JOIN {} {joined} ON {joined}.\"id\" = {alias}.{}",
            quote_ident(&target.table),
            quote_ident(column)
        ));
        scope.aliases.insert(key, joined.clone());
        joined
    }

    /// Subquery yielding the ids of `field`'s owners that have at least
    /// one related record, optionally one matching `inner`.
    fn owners(
        &mut self,
        field: &Field,
        target: &Model,
        inner: Option<(&[String], Operator, &Value)>,
    ) -> Result<String, OrmError> {
        match field.ftype() {
            FieldType::One2Many | FieldType::Rev2One => {
                let fk_name = field.reverse_fk().unwrap_or_default();
                let s = self.alias('s');
                let fk_col = column_ref(&s, target.must_field(fk_name)?)?;
                let mut scope = Scope::default();
                let mut where_sql = format!("{fk_col} IS NOT NULL");
                if let Some((path, op, arg)) = inner {
                    let c = self.leaf(&mut scope, target, &s, path, op, arg, false)?;
                    where_sql = format!("{where_sql} AND {c}");
                }
                Ok(format!(
                    "SELECT {fk_col} FROM {} {s}{} WHERE {where_sql}",
                    quote_ident(&target.table),
                    render_joins(&scope)
                ))
            }
            FieldType::Many2Many => {
                let link = field.link.as_ref().ok_or_else(|| {
                    OrmError::Internal(format!("many2many field {} has no link table", field.name))
                })?;
                let l = self.alias('l');
                let ours = format!("{l}.{}", quote_ident(&link.ours));
                let Some((path, op, arg)) = inner else {
                    return Ok(format!("SELECT {ours} FROM {} {l}", quote_ident(&link.table)));
                };
                let s = self.alias('s');
                let mut scope = Scope::default();
                let c = self.leaf(&mut scope, target, &s, path, op, arg, false)?;
                Ok(format!(
                    "SELECT {ours} FROM {} {l} JOIN {} {s} ON {s}.\"id\" = {l}.{}{} WHERE {c}",
                    quote_ident(&link.table),
                    quote_ident(&target.table),
                    quote_ident(&link.theirs),
                    render_joins(&scope)
                ))
            }
            other => Err(OrmError::Internal(format!("{other} field {} has no owners", field.name))),
        }
    }

    fn x2many_leaf(
        &mut self,
        alias: &str,
        field: &Field,
        target: &Model,
        op: Operator,
        arg: &Value,
        negate: bool,
    ) -> Result<String, OrmError> {
        let (raw, ids) = persisted_ids(arg);
        // (positive membership, id filter); None filter means "any related".
        let (member, filter): (bool, Option<Vec<RecordId>>) = match op {
            Operator::IsNull => (false, None),
            Operator::IsNotNull => (true, None),
            Operator::Equals | Operator::NotEquals if raw.is_empty() => {
                (op == Operator::NotEquals, None)
            }
            Operator::Equals | Operator::In => {
                if ids.is_empty() {
                    return Ok(constant(negate, false));
                }
                (true, Some(ids))
            }
            Operator::NotEquals | Operator::NotIn => {
                if ids.is_empty() {
                    return Ok(constant(negate, true));
                }
                (false, Some(ids))
            }
            _ => {
                return Err(OrmError::Validation(format!(
                    "operator '{}' not supported on {} field {}; use a sub-field path",
                    op.as_str(),
                    field.ftype(),
                    field.name
                )));
            }
        };
        let sub = match filter {
            None => self.owners(field, target, None)?,
            Some(ids) => {
                let id_path = [ID_FIELD.to_string()];
                let ids = Value::Ids(ids);
                self.owners(field, target, Some((id_path.as_slice(), Operator::In, &ids)))?
            }
        };
        let verb = if member != negate { "IN" } else { "NOT IN" };
        Ok(format!("{alias}.\"id\" {verb} ({sub})"))
    }

    fn fk_leaf(&mut self, col: &str, op: Operator, arg: &Value, negate: bool) -> String {
        let op = if negate { op.complement().unwrap_or(op) } else { op };
        let (raw, ids) = persisted_ids(arg);
        let unsaved_only = ids.is_empty() && !raw.is_empty();
        match op {
            Operator::IsNull => format!("{col} IS NULL"),
            Operator::IsNotNull => format!("{col} IS NOT NULL"),
            Operator::Equals if unsaved_only => constant(false, false),
            Operator::NotEquals if unsaved_only => constant(false, true),
            Operator::Equals if ids.is_empty() => format!("{col} IS NULL"),
            Operator::NotEquals if ids.is_empty() => format!("{col} IS NOT NULL"),
            Operator::In if ids.is_empty() => constant(false, false),
            Operator::NotIn if ids.is_empty() => constant(false, true),
            Operator::Equals | Operator::In => {
                format!("{col} IN ({})", self.bind_ids(&ids))
            }
            _ => format!("({col} NOT IN ({}) OR {col} IS NULL)", self.bind_ids(&ids)),
        }
    }

    fn bind_ids(&mut self, ids: &[RecordId]) -> String {
        let marks: Vec<&str> = ids
            .iter()
            .map(|id| {
                self.params.push(SqlValue::Integer(*id));
                "?"
            })
            .collect();
        marks.join(", ")
    }

    fn bind(&mut self, v: &Value) -> &'static str {
        self.params.push(v.to_sql());
        "?"
    }

    fn scalar_leaf(&mut self, col: &str, field: &Field, op: Operator, arg: &Value, negate: bool) -> String {
        if negate {
            if let Some(c) = op.complement() {
                return self.scalar_leaf(col, field, c, arg, false);
            }
            let positive = self.scalar_leaf(col, field, op, arg, false);
            return format!("(NOT ({positive}) OR {col} IS NULL)");
        }

        // Unset booleans read as false.
        let bool_col;
        let expr = if field.ftype() == FieldType::Boolean && matches!(arg, Value::Bool(_)) {
            bool_col = format!("COALESCE({col}, 0)");
            bool_col.as_str()
        } else {
            col
        };
        let text = || match arg {
            Value::Char(s) => s.clone(),
            other => other.to_string(),
        };

        match op {
            Operator::IsNull => format!("{col} IS NULL"),
            Operator::IsNotNull => format!("{col} IS NOT NULL"),
            Operator::Equals if arg.is_null() => format!("{col} IS NULL"),
            Operator::NotEquals if arg.is_null() => format!("{col} IS NOT NULL"),
            Operator::Equals => format!("{expr} = {}", self.bind(arg)),
            Operator::NotEquals => format!("({expr} != {} OR {col} IS NULL)", self.bind(arg)),
            Operator::Greater => format!("{expr} > {}", self.bind(arg)),
            Operator::GreaterOrEqual => format!("{expr} >= {}", self.bind(arg)),
            Operator::Lower => format!("{expr} < {}", self.bind(arg)),
            Operator::LowerOrEqual => format!("{expr} <= {}", self.bind(arg)),
            Operator::Like => format!("{col} LIKE {}", self.bind(arg)),
            Operator::NotLike => format!("({col} NOT LIKE {} OR {col} IS NULL)", self.bind(arg)),
            Operator::ILike => {
                let sql = self.dialect.ilike(col);
                self.params.push(SqlValue::Text(text()));
                sql
            }
            Operator::Contains | Operator::NotContains => {
                let (sql, p) = self.dialect.contains(col, &text());
                self.params.push(p);
                if op == Operator::Contains {
                    sql
                } else {
                    format!("(NOT ({sql}) OR {col} IS NULL)")
                }
            }
            Operator::IContains | Operator::NotIContains => {
                let (sql, p) = self.dialect.icontains(col, &text());
                self.params.push(p);
                if op == Operator::IContains {
                    sql
                } else {
                    format!("(NOT ({sql}) OR {col} IS NULL)")
                }
            }
            Operator::In | Operator::NotIn => {
                let operands = arg.operands();
                if operands.is_empty() {
                    return constant(false, op == Operator::NotIn);
                }
                let marks: Vec<&str> = operands.iter().map(|v| self.bind(v)).collect();
                if op == Operator::In {
                    format!("{col} IN ({})", marks.join(", "))
                } else {
                    format!("({col} NOT IN ({}) OR {col} IS NULL)", marks.join(", "))
                }
            }
        }
    }

    fn order_by(
        &mut self,
        scope: &mut Scope,
        model: &Model,
        alias: &str,
        order: &[String],
    ) -> Result<String, OrmError> {
        let order: &[String] = if order.is_empty() { &model.order } else { order };
        let mut parts = Vec::new();
        let mut has_id = false;
        for item in order {
            let mut words = item.split_whitespace();
            let Some(path) = words.next() else { continue };
            let dir = match words.next().map(str::to_ascii_lowercase).as_deref() {
                None | Some("asc") => "ASC",
                Some("desc") => "DESC",
                Some(other) => {
                    return Err(OrmError::Validation(format!("invalid order direction '{other}'")));
                }
            };
            let segments: Vec<String> = path.split('.').map(str::to_string).collect();
            let (col, is_id) = self.order_column(scope, model, alias, &segments)?;
            has_id |= is_id && segments.len() == 1;
            parts.push(format!("{col} {dir}"));
        }
        if !has_id {
            parts.push(format!("{alias}.\"id\" ASC"));
        }
        Ok(parts.join(", "))
    }

    fn order_column(
        &mut self,
        scope: &mut Scope,
        model: &Model,
        alias: &str,
        path: &[String],
    ) -> Result<(String, bool), OrmError> {
        let field = model.field(&path[0]).ok_or_else(|| {
            OrmError::Validation(format!("unknown field {}.{} in order", model.name, path[0]))
        })?;
        if field.is_related() {
            let mut full = field.related_path.clone();
            full.extend_from_slice(&path[1..]);
            return self.order_column(scope, model, alias, &full);
        }
        if path.len() > 1 {
            let target = match field.relation {
                Some(id) if field.ftype().is_fk() => self.registry.model_by_id(id),
                _ => {
                    return Err(OrmError::Validation(format!(
                        "cannot order by {}.{}: not a many-to-one path",
                        model.name, field.name
                    )));
                }
            };
            let joined = self.join(scope, alias, field, target);
            return self.order_column(scope, target, &joined, &path[1..]);
        }
        Ok((column_ref(alias, field)?, field.name == ID_FIELD))
    }
}

fn render_joins(scope: &Scope) -> String {
    scope.joins.iter().map(|j| format!(" {j}")).collect()
}

fn column_ref(alias: &str, field: &Field) -> Result<String, OrmError> {
    let column = field.column.as_deref().ok_or_else(|| {
        OrmError::Validation(format!("field {} is not stored and cannot be searched", field.name))
    })?;
    Ok(format!("{alias}.{}", quote_ident(column)))
}

fn constant(negate: bool, truth: bool) -> String {
    if truth != negate { "1 = 1" } else { "1 = 0" }.to_string()
}

/// All ids of an operand and the persisted (positive) ones.
fn persisted_ids(arg: &Value) -> (Vec<RecordId>, Vec<RecordId>) {
    let raw = match arg {
        Value::List(items) => items.iter().filter_map(Value::first_id).collect(),
        other => other.ids(),
    };
    let ids = raw.iter().copied().filter(|id| *id > 0).collect();
    (raw, ids)
}

fn is_text_op(op: Operator) -> bool {
    matches!(
        op,
        Operator::Like
            | Operator::NotLike
            | Operator::ILike
            | Operator::Contains
            | Operator::NotContains
            | Operator::IContains
            | Operator::NotIContains
    )
}

fn is_id_op(op: Operator) -> bool {
    matches!(
        op,
        Operator::Equals
            | Operator::NotEquals
            | Operator::In
            | Operator::NotIn
            | Operator::IsNull
            | Operator::IsNotNull
    )
}
