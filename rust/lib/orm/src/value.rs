use std::collections::BTreeMap;
use std::fmt;

use indexmap::IndexMap;
use openerp_sql::Value as SqlValue;

/// Record identifier. Positive ids are persisted rows, negative ids are
/// in-memory records created with `New` that were never inserted.
pub type RecordId = i64;

/// A dynamically typed field value.
///
/// Dates, datetimes, UUIDs and selection keys travel as `Char` and are
/// validated against the field type on write. `List` only appears as the
/// operand of `In`/`NotIn` conditions over scalar fields.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Char(String),
    Binary(Vec<u8>),
    Ids(Vec<RecordId>),
    List(Vec<Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Char(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Float view of a numeric value. Integers are widened.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Record ids carried by a relational value.
    ///
    /// A bare integer is a single id, `Null` is the empty set.
    pub fn ids(&self) -> Vec<RecordId> {
        match self {
            Value::Ids(ids) => ids.clone(),
            Value::Integer(id) => vec![*id],
            _ => Vec::new(),
        }
    }

    /// First id of a relational value, if any.
    pub fn first_id(&self) -> Option<RecordId> {
        match self {
            Value::Ids(ids) => ids.first().copied(),
            Value::Integer(id) => Some(*id),
            _ => None,
        }
    }

    /// Operand list of an `In`/`NotIn` condition.
    pub(crate) fn operands(&self) -> Vec<Value> {
        match self {
            Value::List(items) => items.clone(),
            Value::Ids(ids) => ids.iter().map(|id| Value::Integer(*id)).collect(),
            Value::Null => Vec::new(),
            other => vec![other.clone()],
        }
    }

    /// Convert to a storage parameter. Booleans are stored as 0/1 and a
    /// relational value as its single id.
    pub(crate) fn to_sql(&self) -> SqlValue {
        match self {
            Value::Null | Value::List(_) => SqlValue::Null,
            Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
            Value::Integer(i) => SqlValue::Integer(*i),
            Value::Float(f) => SqlValue::Real(*f),
            Value::Char(s) => SqlValue::Text(s.clone()),
            Value::Binary(b) => SqlValue::Blob(b.clone()),
            Value::Ids(ids) => match ids.first() {
                Some(id) => SqlValue::Integer(*id),
                None => SqlValue::Null,
            },
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Char(s) => write!(f, "{s}"),
            Value::Binary(b) => write!(f, "<{} bytes>", b.len()),
            Value::Ids(ids) => write!(f, "{ids:?}"),
            Value::List(items) => {
                let parts: Vec<String> = items.iter().map(|v| v.to_string()).collect();
                write!(f, "[{}]", parts.join(", "))
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Char(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Char(s)
    }
}

impl From<&String> for Value {
    fn from(s: &String) -> Self {
        Value::Char(s.clone())
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Integer(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Binary(b)
    }
}

impl From<Vec<RecordId>> for Value {
    fn from(ids: Vec<RecordId>) -> Self {
        Value::Ids(ids)
    }
}

impl From<&[RecordId]> for Value {
    fn from(ids: &[RecordId]) -> Self {
        Value::Ids(ids.to_vec())
    }
}

impl From<Vec<&str>> for Value {
    fn from(items: Vec<&str>) -> Self {
        Value::List(items.into_iter().map(Value::from).collect())
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

// ── RecordData ──────────────────────────────────────────────────────

/// Ordered field → value map used to create and write records.
///
/// Keys are field names or JSON names, resolved against the model when
/// the data is used. Nested sub-records are attached with [`RecordData::create`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordData {
    values: IndexMap<String, Value>,
    creates: IndexMap<String, Vec<RecordData>>,
}

impl RecordData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn set(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.insert(field, value);
        self
    }

    pub fn insert(&mut self, field: &str, value: impl Into<Value>) {
        self.values.insert(field.to_string(), value.into());
    }

    /// Attach a record to create along with this one, for a many-to-one,
    /// one-to-one or one-to-many field.
    pub fn create(mut self, field: &str, data: RecordData) -> Self {
        self.creates.entry(field.to_string()).or_default().push(data);
        self
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    pub fn has(&self, field: &str) -> bool {
        self.values.contains_key(field) || self.creates.contains_key(field)
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.creates.shift_remove(field);
        self.values.shift_remove(field)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn creates(&self) -> impl Iterator<Item = (&str, &[RecordData])> {
        self.creates.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.creates.is_empty()
    }

    /// Copy every entry of `other` over this data.
    pub fn merge(&mut self, other: &RecordData) {
        for (k, v) in &other.values {
            self.values.insert(k.clone(), v.clone());
        }
        for (k, v) in &other.creates {
            self.creates.insert(k.clone(), v.clone());
        }
    }

    pub(crate) fn take_creates(&mut self) -> IndexMap<String, Vec<RecordData>> {
        std::mem::take(&mut self.creates)
    }
}

impl<K: AsRef<str>, V: Into<Value>> FromIterator<(K, V)> for RecordData {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut data = RecordData::new();
        for (k, v) in iter {
            data.insert(k.as_ref(), v);
        }
        data
    }
}

// ── Context ─────────────────────────────────────────────────────────

/// Key/value map carried by an environment (`lang`, `default_*`, ...).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Context(BTreeMap<String, Value>);

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relational_views() {
        assert_eq!(Value::Ids(vec![3, 4]).ids(), vec![3, 4]);
        assert_eq!(Value::Integer(9).ids(), vec![9]);
        assert!(Value::Null.ids().is_empty());
        assert_eq!(Value::Ids(vec![]).first_id(), None);
        assert_eq!(Value::Ids(vec![5]).to_sql(), SqlValue::Integer(5));
        assert_eq!(Value::Ids(vec![]).to_sql(), SqlValue::Null);
    }

    #[test]
    fn sql_conversion() {
        assert_eq!(Value::Bool(true).to_sql(), SqlValue::Integer(1));
        assert_eq!(Value::from("x").to_sql(), SqlValue::Text("x".into()));
        assert_eq!(Value::from(2.5).to_sql(), SqlValue::Real(2.5));
        assert_eq!(Value::from(None::<i64>), Value::Null);
    }

    #[test]
    fn condition_operands() {
        assert_eq!(Value::from(vec!["a", "b"]).operands().len(), 2);
        assert_eq!(
            Value::Ids(vec![1, 2]).operands(),
            vec![Value::Integer(1), Value::Integer(2)]
        );
        assert!(Value::Null.operands().is_empty());
    }

    #[test]
    fn record_data_keeps_insertion_order() {
        let data = RecordData::new()
            .set("Name", "John")
            .set("Email", "jsmith@example.com")
            .set("Nums", 3i64)
            .create("Profile", RecordData::new().set("Age", 23i64));
        let keys: Vec<&str> = data.keys().collect();
        assert_eq!(keys, vec!["Name", "Email", "Nums"]);
        assert!(data.has("Profile"));
        assert_eq!(data.creates().count(), 1);
    }

    #[test]
    fn record_data_merge_overrides() {
        let mut base: RecordData = [("Name", "a"), ("City", "b")].into_iter().collect();
        base.merge(&RecordData::new().set("City", "c"));
        assert_eq!(base.get("City"), Some(&Value::from("c")));
        assert_eq!(base.len(), 2);
    }

    #[test]
    fn context_accessors() {
        let ctx = Context::new().with("lang", "fr_FR").with("active_test", true);
        assert_eq!(ctx.get_str("lang"), Some("fr_FR"));
        assert!(ctx.get_bool("active_test"));
        assert!(!ctx.get_bool("missing"));
    }
}
