use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use openerp_core::OrmError;

use crate::condition::Condition;
use crate::fields_get::FieldInfo;
use crate::onchange::{OnchangeParams, OnchangeResult};
use crate::query::GroupAggregateRow;
use crate::recordset::RecordSet;
use crate::value::{RecordData, Value};

/// Body of one method layer.
///
/// The [`Super`] handle reaches the layer immediately below this one.
pub type MethodFn =
    Arc<dyn Fn(&Super<'_>, &RecordSet, Vec<Payload>) -> Result<Payload, OrmError> + Send + Sync>;

/// One layer of a method stack.
#[derive(Clone)]
pub struct Layer {
    pub doc: String,
    /// Model or mixin that contributed the layer.
    pub origin: String,
    pub(crate) base: bool,
    pub(crate) func: MethodFn,
}

impl fmt::Debug for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Layer")
            .field("origin", &self.origin)
            .field("base", &self.base)
            .finish_non_exhaustive()
    }
}

/// A finalized method: layers ordered innermost first.
#[derive(Debug, Clone)]
pub struct Method {
    pub name: String,
    pub(crate) layers: Vec<Layer>,
}

impl Method {
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Documentation of the base layer.
    pub fn doc(&self) -> &str {
        self.layers.first().map(|l| l.doc.as_str()).unwrap_or("")
    }

    /// Run the outermost layer.
    pub(crate) fn invoke(&self, rs: &RecordSet, args: Vec<Payload>) -> Result<Payload, OrmError> {
        let top = self.layers.len().checked_sub(1).ok_or_else(|| {
            OrmError::Configuration(format!("method {} has no layers", self.name))
        })?;
        let sup = Super {
            method: self,
            level: top,
        };
        (self.layers[top].func)(&sup, rs, args)
    }
}

/// Handle to the layer below the running one.
pub struct Super<'a> {
    method: &'a Method,
    level: usize,
}

impl Super<'_> {
    /// Call the next layer down with possibly transformed arguments.
    ///
    /// Fails when called from the base layer.
    pub fn call(&self, rs: &RecordSet, args: Vec<Payload>) -> Result<Payload, OrmError> {
        let below = self.level.checked_sub(1).ok_or_else(|| {
            OrmError::Configuration(format!(
                "method {} has no layer below its base layer",
                self.method.name
            ))
        })?;
        let sup = Super {
            method: self.method,
            level: below,
        };
        (self.method.layers[below].func)(&sup, rs, args)
    }

    pub fn method_name(&self) -> &str {
        &self.method.name
    }

    /// Depth of the running layer, 0 for the base layer.
    pub fn level(&self) -> usize {
        self.level
    }
}

// ── Payload ─────────────────────────────────────────────────────────

/// Dynamically typed argument and return value of dispatched methods.
#[derive(Debug, Clone, Default)]
pub enum Payload {
    #[default]
    None,
    Value(Value),
    Data(RecordData),
    DataList(Vec<RecordData>),
    Records(RecordSet),
    Condition(Condition),
    Fields(Vec<String>),
    Strings(Vec<String>),
    Filters(BTreeMap<String, Condition>),
    OnchangeParams(OnchangeParams),
    Onchange(OnchangeResult),
    FieldInfos(BTreeMap<String, FieldInfo>),
    Groups(Vec<GroupAggregateRow>),
}

fn mismatch(expected: &str, got: &Payload) -> OrmError {
    OrmError::Internal(format!("expected {expected} payload, got {}", got.kind()))
}

impl Payload {
    fn kind(&self) -> &'static str {
        match self {
            Payload::None => "none",
            Payload::Value(_) => "value",
            Payload::Data(_) => "data",
            Payload::DataList(_) => "data list",
            Payload::Records(_) => "records",
            Payload::Condition(_) => "condition",
            Payload::Fields(_) => "fields",
            Payload::Strings(_) => "strings",
            Payload::Filters(_) => "filters",
            Payload::OnchangeParams(_) => "onchange params",
            Payload::Onchange(_) => "onchange result",
            Payload::FieldInfos(_) => "field infos",
            Payload::Groups(_) => "groups",
        }
    }

    pub fn into_value(self) -> Result<Value, OrmError> {
        match self {
            Payload::Value(v) => Ok(v),
            Payload::None => Ok(Value::Null),
            other => Err(mismatch("value", &other)),
        }
    }

    pub fn into_data(self) -> Result<RecordData, OrmError> {
        match self {
            Payload::Data(d) => Ok(d),
            Payload::None => Ok(RecordData::new()),
            other => Err(mismatch("data", &other)),
        }
    }

    pub fn into_data_list(self) -> Result<Vec<RecordData>, OrmError> {
        match self {
            Payload::DataList(d) => Ok(d),
            other => Err(mismatch("data list", &other)),
        }
    }

    pub fn into_records(self) -> Result<RecordSet, OrmError> {
        match self {
            Payload::Records(rs) => Ok(rs),
            other => Err(mismatch("records", &other)),
        }
    }

    pub fn into_condition(self) -> Result<Condition, OrmError> {
        match self {
            Payload::Condition(c) => Ok(c),
            Payload::None => Ok(Condition::all()),
            other => Err(mismatch("condition", &other)),
        }
    }

    /// Field names. `None` means "all fields".
    pub fn into_fields(self) -> Result<Vec<String>, OrmError> {
        match self {
            Payload::Fields(f) | Payload::Strings(f) => Ok(f),
            Payload::None => Ok(Vec::new()),
            other => Err(mismatch("fields", &other)),
        }
    }

    pub fn into_strings(self) -> Result<Vec<String>, OrmError> {
        match self {
            Payload::Strings(s) | Payload::Fields(s) => Ok(s),
            Payload::None => Ok(Vec::new()),
            other => Err(mismatch("strings", &other)),
        }
    }

    pub fn into_filters(self) -> Result<BTreeMap<String, Condition>, OrmError> {
        match self {
            Payload::Filters(f) => Ok(f),
            Payload::None => Ok(BTreeMap::new()),
            other => Err(mismatch("filters", &other)),
        }
    }

    pub fn into_onchange_params(self) -> Result<OnchangeParams, OrmError> {
        match self {
            Payload::OnchangeParams(p) => Ok(p),
            other => Err(mismatch("onchange params", &other)),
        }
    }

    pub fn into_onchange(self) -> Result<OnchangeResult, OrmError> {
        match self {
            Payload::Onchange(r) => Ok(r),
            other => Err(mismatch("onchange result", &other)),
        }
    }

    pub fn into_field_infos(self) -> Result<BTreeMap<String, FieldInfo>, OrmError> {
        match self {
            Payload::FieldInfos(f) => Ok(f),
            other => Err(mismatch("field infos", &other)),
        }
    }

    pub fn into_groups(self) -> Result<Vec<GroupAggregateRow>, OrmError> {
        match self {
            Payload::Groups(g) => Ok(g),
            other => Err(mismatch("groups", &other)),
        }
    }

    pub fn into_string(self) -> Result<String, OrmError> {
        match self {
            Payload::Value(Value::Char(s)) => Ok(s),
            Payload::Value(Value::Null) | Payload::None => Ok(String::new()),
            other => Err(mismatch("string", &other)),
        }
    }

    pub fn into_bool(self) -> Result<bool, OrmError> {
        match self {
            Payload::Value(Value::Bool(b)) => Ok(b),
            other => Err(mismatch("boolean", &other)),
        }
    }

    pub fn into_i64(self) -> Result<i64, OrmError> {
        match self {
            Payload::Value(Value::Integer(i)) => Ok(i),
            other => Err(mismatch("integer", &other)),
        }
    }
}

/// Positional argument `idx`, `Payload::None` when absent.
pub fn arg(args: &[Payload], idx: usize) -> Payload {
    args.get(idx).cloned().unwrap_or_default()
}

impl From<Value> for Payload {
    fn from(v: Value) -> Self {
        Payload::Value(v)
    }
}

impl From<RecordData> for Payload {
    fn from(d: RecordData) -> Self {
        Payload::Data(d)
    }
}

impl From<RecordSet> for Payload {
    fn from(rs: RecordSet) -> Self {
        Payload::Records(rs)
    }
}

impl From<Condition> for Payload {
    fn from(c: Condition) -> Self {
        Payload::Condition(c)
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Payload::Value(Value::from(s))
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Payload::Value(Value::Char(s))
    }
}

impl From<bool> for Payload {
    fn from(b: bool) -> Self {
        Payload::Value(Value::Bool(b))
    }
}

impl From<i64> for Payload {
    fn from(i: i64) -> Self {
        Payload::Value(Value::Integer(i))
    }
}
