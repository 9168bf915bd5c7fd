use std::fmt;
use std::sync::Arc;

use openerp_core::OrmError;
use openerp_sql::Value as SqlValue;

use crate::environment::Environment;
use crate::model::ModelId;
use crate::value::Value;

/// Semantic type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    Char,
    Text,
    Html,
    Integer,
    Float,
    Boolean,
    Date,
    DateTime,
    Binary,
    Selection,
    Uuid,
    Many2One,
    One2One,
    One2Many,
    Rev2One,
    Many2Many,
}

impl FieldType {
    pub fn is_relation(self) -> bool {
        matches!(
            self,
            FieldType::Many2One
                | FieldType::One2One
                | FieldType::One2Many
                | FieldType::Rev2One
                | FieldType::Many2Many
        )
    }

    /// Relations stored as a foreign key on this model's table.
    pub fn is_fk(self) -> bool {
        matches!(self, FieldType::Many2One | FieldType::One2One)
    }

    /// Relations stored on the other side (reverse key or link table).
    pub fn is_reverse(self) -> bool {
        matches!(
            self,
            FieldType::One2Many | FieldType::Rev2One | FieldType::Many2Many
        )
    }

    pub fn is_textual(self) -> bool {
        matches!(
            self,
            FieldType::Char
                | FieldType::Text
                | FieldType::Html
                | FieldType::Date
                | FieldType::DateTime
                | FieldType::Selection
                | FieldType::Uuid
        )
    }

    /// Column type used by `sync_schema`.
    pub fn sql_type(self) -> &'static str {
        match self {
            FieldType::Integer | FieldType::Boolean | FieldType::Many2One | FieldType::One2One => {
                "INTEGER"
            }
            FieldType::Float => "REAL",
            FieldType::Binary => "BLOB",
            _ => "TEXT",
        }
    }

    /// Value returned by `Get` on an empty collection or unset field.
    pub fn zero_value(self) -> Value {
        match self {
            FieldType::Integer => Value::Integer(0),
            FieldType::Float => Value::Float(0.0),
            FieldType::Boolean => Value::Bool(false),
            FieldType::Binary => Value::Binary(Vec::new()),
            t if t.is_relation() => Value::Ids(Vec::new()),
            _ => Value::Char(String::new()),
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::Char => "char",
            FieldType::Text => "text",
            FieldType::Html => "html",
            FieldType::Integer => "integer",
            FieldType::Float => "float",
            FieldType::Boolean => "boolean",
            FieldType::Date => "date",
            FieldType::DateTime => "datetime",
            FieldType::Binary => "binary",
            FieldType::Selection => "selection",
            FieldType::Uuid => "uuid",
            FieldType::Many2One => "many2one",
            FieldType::One2One => "one2one",
            FieldType::One2Many => "one2many",
            FieldType::Rev2One => "rev2one",
            FieldType::Many2Many => "many2many",
        };
        f.write_str(name)
    }
}

/// How a field's value is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    /// Plain column on the model's table.
    Column,
    /// Computed by a method and persisted in a column.
    ComputedStored,
    /// Computed by a method on every read.
    ComputedTransient,
    /// Proxy to a path on another model.
    Related,
    /// One-to-many, reverse one-to-one or many-to-many, stored on the other side.
    Reverse,
}

/// Action taken on a many-to-one column when the target row is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnDelete {
    #[default]
    SetNull,
    Cascade,
    Restrict,
}

impl OnDelete {
    pub(crate) fn sql(self) -> &'static str {
        match self {
            OnDelete::SetNull => "SET NULL",
            OnDelete::Cascade => "CASCADE",
            OnDelete::Restrict => "RESTRICT",
        }
    }
}

/// Default value producer, evaluated against the creating environment.
pub type DefaultFn = Arc<dyn Fn(&Environment) -> Value + Send + Sync>;

// ── FieldDef ────────────────────────────────────────────────────────

/// Field declaration passed to `RegistryBuilder::add_fields`.
///
/// ```ignore
/// FieldDef::many2one("Profile").string("User Profile").on_delete(OnDelete::Cascade)
/// ```
#[derive(Clone)]
pub struct FieldDef {
    pub(crate) ftype: FieldType,
    pub(crate) string: Option<String>,
    pub(crate) help: String,
    pub(crate) json: Option<String>,
    pub(crate) required: bool,
    pub(crate) unique: bool,
    pub(crate) index: bool,
    pub(crate) no_copy: bool,
    pub(crate) copy: bool,
    pub(crate) readonly: bool,
    pub(crate) stored: bool,
    pub(crate) translate: bool,
    pub(crate) size: Option<usize>,
    pub(crate) compute: Option<String>,
    pub(crate) depends: Vec<String>,
    pub(crate) related: Option<String>,
    pub(crate) inverse: Option<String>,
    pub(crate) onchange: Option<String>,
    pub(crate) onchange_warning: Option<String>,
    pub(crate) onchange_filters: Option<String>,
    pub(crate) constraint: Option<String>,
    pub(crate) relation: Option<String>,
    pub(crate) reverse_fk: Option<String>,
    pub(crate) link: Option<(String, String, String)>,
    pub(crate) selection: Vec<(String, String)>,
    pub(crate) default: Option<DefaultFn>,
    pub(crate) on_delete: OnDelete,
}

impl fmt::Debug for FieldDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldDef")
            .field("ftype", &self.ftype)
            .field("relation", &self.relation)
            .field("compute", &self.compute)
            .field("related", &self.related)
            .field("stored", &self.stored)
            .finish_non_exhaustive()
    }
}

impl FieldDef {
    fn of(ftype: FieldType) -> Self {
        Self {
            ftype,
            string: None,
            help: String::new(),
            json: None,
            required: false,
            unique: false,
            index: false,
            no_copy: false,
            copy: !matches!(
                ftype,
                FieldType::One2One | FieldType::One2Many | FieldType::Rev2One
            ),
            readonly: false,
            stored: false,
            translate: false,
            size: None,
            compute: None,
            depends: Vec::new(),
            related: None,
            inverse: None,
            onchange: None,
            onchange_warning: None,
            onchange_filters: None,
            constraint: None,
            relation: None,
            reverse_fk: None,
            link: None,
            selection: Vec::new(),
            default: None,
            on_delete: OnDelete::default(),
        }
    }

    pub fn char() -> Self {
        Self::of(FieldType::Char)
    }

    pub fn text() -> Self {
        Self::of(FieldType::Text)
    }

    pub fn html() -> Self {
        Self::of(FieldType::Html)
    }

    pub fn integer() -> Self {
        Self::of(FieldType::Integer)
    }

    pub fn float() -> Self {
        Self::of(FieldType::Float)
    }

    pub fn boolean() -> Self {
        Self::of(FieldType::Boolean)
    }

    pub fn date() -> Self {
        Self::of(FieldType::Date)
    }

    pub fn datetime() -> Self {
        Self::of(FieldType::DateTime)
    }

    pub fn binary() -> Self {
        Self::of(FieldType::Binary)
    }

    pub fn uuid() -> Self {
        Self::of(FieldType::Uuid)
    }

    /// Selection over `(key, label)` pairs.
    pub fn selection(options: &[(&str, &str)]) -> Self {
        let mut def = Self::of(FieldType::Selection);
        def.selection = options
            .iter()
            .map(|(k, l)| (k.to_string(), l.to_string()))
            .collect();
        def
    }

    pub fn many2one(model: &str) -> Self {
        Self::of(FieldType::Many2One).relation(model)
    }

    pub fn one2one(model: &str) -> Self {
        Self::of(FieldType::One2One).relation(model)
    }

    /// `reverse_fk` names the many-to-one field on `model` pointing back here.
    pub fn one2many(model: &str, reverse_fk: &str) -> Self {
        let mut def = Self::of(FieldType::One2Many).relation(model);
        def.reverse_fk = Some(reverse_fk.to_string());
        def
    }

    /// `reverse_fk` names the one-to-one field on `model` pointing back here.
    pub fn rev2one(model: &str, reverse_fk: &str) -> Self {
        let mut def = Self::of(FieldType::Rev2One).relation(model);
        def.reverse_fk = Some(reverse_fk.to_string());
        def
    }

    pub fn many2many(model: &str) -> Self {
        Self::of(FieldType::Many2Many).relation(model)
    }

    fn relation(mut self, model: &str) -> Self {
        self.relation = Some(model.to_string());
        self
    }

    /// Human readable label.
    pub fn string(mut self, s: &str) -> Self {
        self.string = Some(s.to_string());
        self
    }

    pub fn help(mut self, s: &str) -> Self {
        self.help = s.to_string();
        self
    }

    /// JSON/wire name. Defaults to the column name.
    pub fn json(mut self, s: &str) -> Self {
        self.json = Some(s.to_string());
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn index(mut self) -> Self {
        self.index = true;
        self
    }

    /// Excluded from `CopyData`.
    pub fn no_copy(mut self) -> Self {
        self.no_copy = true;
        self
    }

    /// Include a one-to-many field in `CopyData` by copying its records.
    pub fn copy(mut self) -> Self {
        self.copy = true;
        self
    }

    pub fn readonly(mut self) -> Self {
        self.readonly = true;
        self
    }

    /// Persist a computed field.
    pub fn stored(mut self) -> Self {
        self.stored = true;
        self
    }

    /// Values and labels depend on the context language.
    pub fn translate(mut self) -> Self {
        self.translate = true;
        self
    }

    pub fn size(mut self, n: usize) -> Self {
        self.size = Some(n);
        self
    }

    /// Method computing this field.
    pub fn compute(mut self, method: &str) -> Self {
        self.compute = Some(method.to_string());
        self
    }

    /// Dotted field paths the compute method reads.
    pub fn depends(mut self, paths: &[&str]) -> Self {
        self.depends = paths.iter().map(|p| p.to_string()).collect();
        self
    }

    /// Proxy this field to a dotted path on related models.
    pub fn related(mut self, path: &str) -> Self {
        self.related = Some(path.to_string());
        self
    }

    /// Method accepting writes to a computed field.
    pub fn inverse(mut self, method: &str) -> Self {
        self.inverse = Some(method.to_string());
        self
    }

    pub fn onchange(mut self, method: &str) -> Self {
        self.onchange = Some(method.to_string());
        self
    }

    pub fn onchange_warning(mut self, method: &str) -> Self {
        self.onchange_warning = Some(method.to_string());
        self
    }

    pub fn onchange_filters(mut self, method: &str) -> Self {
        self.onchange_filters = Some(method.to_string());
        self
    }

    /// Method validating this field after create and write.
    pub fn constraint(mut self, method: &str) -> Self {
        self.constraint = Some(method.to_string());
        self
    }

    pub fn default(mut self, f: impl Fn(&Environment) -> Value + Send + Sync + 'static) -> Self {
        self.default = Some(Arc::new(f));
        self
    }

    pub fn default_value(self, value: impl Into<Value>) -> Self {
        let value = value.into();
        self.default(move |_| value.clone())
    }

    pub fn on_delete(mut self, action: OnDelete) -> Self {
        self.on_delete = action;
        self
    }

    /// Override the many-to-many link table and its two columns.
    pub fn link_table(mut self, table: &str, ours: &str, theirs: &str) -> Self {
        self.link = Some((table.to_string(), ours.to_string(), theirs.to_string()));
        self
    }
}

// ── Field ───────────────────────────────────────────────────────────

/// Many-to-many link table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub table: String,
    pub ours: String,
    pub theirs: String,
}

/// Field descriptor of a finalized model.
#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub json: String,
    /// Column name for column-backed and stored computed fields.
    pub column: Option<String>,
    /// Model or mixin that declared the field.
    pub declared_in: String,
    pub relation: Option<ModelId>,
    pub link: Option<Link>,
    pub(crate) related_path: Vec<String>,
    pub(crate) def: FieldDef,
}

impl Field {
    pub fn ftype(&self) -> FieldType {
        self.def.ftype
    }

    pub fn storage(&self) -> StorageKind {
        if self.def.related.is_some() {
            StorageKind::Related
        } else if self.def.compute.is_some() {
            if self.def.stored {
                StorageKind::ComputedStored
            } else {
                StorageKind::ComputedTransient
            }
        } else if self.def.ftype.is_reverse() {
            StorageKind::Reverse
        } else {
            StorageKind::Column
        }
    }

    /// Persisted in this model's table.
    pub fn is_stored(&self) -> bool {
        self.column.is_some()
    }

    pub fn is_computed(&self) -> bool {
        self.def.compute.is_some()
    }

    pub fn is_related(&self) -> bool {
        self.def.related.is_some()
    }

    pub fn label(&self) -> &str {
        self.def.string.as_deref().unwrap_or(&self.name)
    }

    pub fn help(&self) -> &str {
        &self.def.help
    }

    pub fn required(&self) -> bool {
        self.def.required
    }

    pub fn unique(&self) -> bool {
        self.def.unique
    }

    pub fn translate(&self) -> bool {
        self.def.translate
    }

    pub fn readonly(&self) -> bool {
        self.def.readonly
    }

    pub fn selection(&self) -> &[(String, String)] {
        &self.def.selection
    }

    pub fn compute(&self) -> Option<&str> {
        self.def.compute.as_deref()
    }

    pub fn inverse(&self) -> Option<&str> {
        self.def.inverse.as_deref()
    }

    pub fn onchange(&self) -> Option<&str> {
        self.def.onchange.as_deref()
    }

    pub fn constraint(&self) -> Option<&str> {
        self.def.constraint.as_deref()
    }

    pub fn depends(&self) -> &[String] {
        &self.def.depends
    }

    pub fn reverse_fk(&self) -> Option<&str> {
        self.def.reverse_fk.as_deref()
    }

    pub fn zero_value(&self) -> Value {
        self.def.ftype.zero_value()
    }

    /// Check a value against the field type, normalizing where a lossless
    /// conversion exists (integer to float, bare id to id set).
    pub fn check_value(&self, model: &str, value: Value) -> Result<Value, OrmError> {
        let ftype = self.def.ftype;
        let bad = |got: &Value| {
            OrmError::Validation(format!(
                "{model}.{}: expected {ftype} value, got {got:?}",
                self.name
            ))
        };

        let value = match (ftype, value) {
            (_, Value::Null) if ftype.is_relation() => Value::Ids(Vec::new()),
            (_, Value::Null) => Value::Null,
            (_, v @ Value::List(_)) => return Err(bad(&v)),
            (t, Value::Char(s)) if t.is_textual() => {
                self.check_text(model, &s)?;
                Value::Char(s)
            }
            (FieldType::Integer, v @ Value::Integer(_)) => v,
            (FieldType::Float, Value::Integer(i)) => Value::Float(i as f64),
            (FieldType::Float, v @ Value::Float(_)) => v,
            (FieldType::Boolean, v @ Value::Bool(_)) => v,
            (FieldType::Binary, v @ Value::Binary(_)) => v,
            (t, Value::Integer(id)) if t.is_relation() => Value::Ids(vec![id]),
            (t, Value::Ids(ids)) if t.is_relation() => {
                let single = matches!(
                    t,
                    FieldType::Many2One | FieldType::One2One | FieldType::Rev2One
                );
                if single && ids.len() > 1 {
                    return Err(OrmError::Validation(format!(
                        "{model}.{}: expected at most one record, got {}",
                        self.name,
                        ids.len()
                    )));
                }
                Value::Ids(ids)
            }
            (_, v) => return Err(bad(&v)),
        };
        Ok(value)
    }

    fn check_text(&self, model: &str, s: &str) -> Result<(), OrmError> {
        if s.is_empty() {
            return Ok(());
        }
        let invalid = |what: &str| {
            OrmError::Validation(format!("{model}.{}: invalid {what} '{s}'", self.name))
        };
        match self.def.ftype {
            FieldType::Date => {
                chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| invalid("date"))?;
            }
            FieldType::DateTime => {
                let ok = chrono::DateTime::parse_from_rfc3339(s).is_ok()
                    || chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").is_ok();
                if !ok {
                    return Err(invalid("datetime"));
                }
            }
            FieldType::Uuid => {
                uuid::Uuid::parse_str(s).map_err(|_| invalid("uuid"))?;
            }
            FieldType::Selection => {
                if !self.def.selection.iter().any(|(k, _)| k == s) {
                    return Err(invalid("selection key"));
                }
            }
            _ => {}
        }
        if let Some(max) = self.def.size {
            if s.chars().count() > max {
                return Err(OrmError::Validation(format!(
                    "{model}.{}: value longer than {max} characters",
                    self.name
                )));
            }
        }
        Ok(())
    }

    /// Convert a value read from storage into a field value.
    pub(crate) fn from_sql(&self, value: &SqlValue) -> Value {
        match (self.def.ftype, value) {
            (t, SqlValue::Null) if t.is_relation() => Value::Ids(Vec::new()),
            (_, SqlValue::Null) => Value::Null,
            (FieldType::Boolean, SqlValue::Integer(i)) => Value::Bool(*i != 0),
            (FieldType::Float, SqlValue::Integer(i)) => Value::Float(*i as f64),
            (t, SqlValue::Integer(id)) if t.is_relation() => Value::Ids(vec![*id]),
            (_, SqlValue::Integer(i)) => Value::Integer(*i),
            (_, SqlValue::Real(f)) => Value::Float(*f),
            (_, SqlValue::Text(s)) => Value::Char(s.clone()),
            (_, SqlValue::Blob(b)) => Value::Binary(b.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(name: &str, def: FieldDef) -> Field {
        Field {
            name: name.to_string(),
            json: name.to_lowercase(),
            column: Some(name.to_lowercase()),
            declared_in: "Test".to_string(),
            relation: None,
            link: None,
            related_path: Vec::new(),
            def,
        }
    }

    #[test]
    fn storage_kinds() {
        assert_eq!(field("A", FieldDef::char()).storage(), StorageKind::Column);
        assert_eq!(
            field("B", FieldDef::integer().compute("ComputeB")).storage(),
            StorageKind::ComputedTransient
        );
        assert_eq!(
            field("C", FieldDef::integer().compute("ComputeC").stored()).storage(),
            StorageKind::ComputedStored
        );
        assert_eq!(
            field("D", FieldDef::float().related("Profile.Money")).storage(),
            StorageKind::Related
        );
        assert_eq!(
            field("E", FieldDef::one2many("Post", "User")).storage(),
            StorageKind::Reverse
        );
    }

    #[test]
    fn zero_values() {
        assert_eq!(FieldType::Char.zero_value(), Value::Char(String::new()));
        assert_eq!(FieldType::Integer.zero_value(), Value::Integer(0));
        assert_eq!(FieldType::Boolean.zero_value(), Value::Bool(false));
        assert_eq!(FieldType::Many2Many.zero_value(), Value::Ids(vec![]));
    }

    #[test]
    fn check_value_normalizes() {
        let rate = field("Rate", FieldDef::float());
        assert_eq!(rate.check_value("Tag", Value::Integer(5)).unwrap(), Value::Float(5.0));

        let user = field("User", FieldDef::many2one("User"));
        assert_eq!(user.check_value("Post", Value::Integer(2)).unwrap(), Value::Ids(vec![2]));
        assert_eq!(user.check_value("Post", Value::Null).unwrap(), Value::Ids(vec![]));
        assert!(user.check_value("Post", Value::Ids(vec![1, 2])).is_err());
    }

    #[test]
    fn check_value_rejects_mismatch() {
        let nums = field("Nums", FieldDef::integer());
        let err = nums.check_value("User", Value::from("x")).unwrap_err();
        assert!(err.is_validation());

        let gender = field("Gender", FieldDef::selection(&[("male", "Male"), ("female", "Female")]));
        assert!(gender.check_value("Profile", Value::from("female")).is_ok());
        assert!(gender.check_value("Profile", Value::from("other")).is_err());

        let day = field("LastRead", FieldDef::date());
        assert!(day.check_value("Post", Value::from("2016-06-01")).is_ok());
        assert!(day.check_value("Post", Value::from("01/06/2016")).is_err());

        let short = field("Code", FieldDef::char().size(3));
        assert!(short.check_value("T", Value::from("abcd")).is_err());
    }

    #[test]
    fn from_sql_conversion() {
        let active = field("Active", FieldDef::boolean());
        assert_eq!(active.from_sql(&SqlValue::Integer(1)), Value::Bool(true));
        let profile = field("Profile", FieldDef::one2one("Profile"));
        assert_eq!(profile.from_sql(&SqlValue::Null), Value::Ids(vec![]));
        assert_eq!(profile.from_sql(&SqlValue::Integer(4)), Value::Ids(vec![4]));
    }
}
