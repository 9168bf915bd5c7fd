use std::fmt;
use std::ops::{BitAnd, BitOr, Not};
use std::str::FromStr;

use openerp_core::OrmError;

use crate::value::Value;

/// Comparison operator of a condition leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Equals,
    NotEquals,
    Like,
    NotLike,
    ILike,
    Contains,
    NotContains,
    IContains,
    NotIContains,
    Greater,
    GreaterOrEqual,
    Lower,
    LowerOrEqual,
    In,
    NotIn,
    IsNull,
    IsNotNull,
}

impl Operator {
    /// The operator matching exactly the complement, when one exists.
    pub(crate) fn complement(self) -> Option<Operator> {
        use Operator::*;
        Some(match self {
            Equals => NotEquals,
            NotEquals => Equals,
            Like => NotLike,
            NotLike => Like,
            Contains => NotContains,
            NotContains => Contains,
            IContains => NotIContains,
            NotIContains => IContains,
            In => NotIn,
            NotIn => In,
            IsNull => IsNotNull,
            IsNotNull => IsNull,
            ILike | Greater | GreaterOrEqual | Lower | LowerOrEqual => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        use Operator::*;
        match self {
            Equals => "=",
            NotEquals => "!=",
            Like => "=like",
            NotLike => "not like",
            ILike => "=ilike",
            Contains => "like",
            NotContains => "not contains",
            IContains => "ilike",
            NotIContains => "not ilike",
            Greater => ">",
            GreaterOrEqual => ">=",
            Lower => "<",
            LowerOrEqual => "<=",
            In => "in",
            NotIn => "not in",
            IsNull => "is null",
            IsNotNull => "is not null",
        }
    }
}

impl FromStr for Operator {
    type Err = OrmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use Operator::*;
        Ok(match s {
            "=" => Equals,
            "!=" => NotEquals,
            "=like" => Like,
            "not like" => NotLike,
            "=ilike" => ILike,
            "like" => Contains,
            "not contains" => NotContains,
            "ilike" => IContains,
            "not ilike" => NotIContains,
            ">" => Greater,
            ">=" => GreaterOrEqual,
            "<" => Lower,
            "<=" => LowerOrEqual,
            "in" => In,
            "not in" => NotIn,
            "is null" => IsNull,
            "is not null" => IsNotNull,
            other => return Err(OrmError::Validation(format!("unknown operator '{other}'"))),
        })
    }
}

/// Condition leaf: `path op arg`.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub path: String,
    pub op: Operator,
    pub arg: Value,
}

/// Boolean expression over field paths.
///
/// ```ignore
/// Condition::field("Name").equals("John")
///     .and().field("Profile.Age").greater(20i64)
///     .or().field("Tags").is_null()
/// ```
///
/// Chained builders combine left to right. An empty `And` is true and an
/// empty `Or` is false.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Leaf(Predicate),
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Not(Box<Condition>),
}

impl Default for Condition {
    fn default() -> Self {
        Condition::And(Vec::new())
    }
}

#[derive(Debug, Clone, Copy)]
enum Join {
    And,
    Or,
    AndNot,
    OrNot,
}

/// Pending field of a condition under construction.
#[must_use]
pub struct ConditionField {
    prefix: Option<(Condition, Join)>,
    path: String,
}

/// A condition waiting for the next `field(..)` after `and()`/`or()`.
#[must_use]
pub struct ConditionStart {
    prefix: Option<(Condition, Join)>,
}

impl ConditionStart {
    pub fn field(self, path: &str) -> ConditionField {
        ConditionField {
            prefix: self.prefix,
            path: path.to_string(),
        }
    }
}

impl Condition {
    /// Start a condition on a field path.
    pub fn field(path: &str) -> ConditionField {
        ConditionField {
            prefix: None,
            path: path.to_string(),
        }
    }

    /// Condition matching every record.
    pub fn all() -> Condition {
        Condition::default()
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Condition::And(items) if items.is_empty())
    }

    pub fn and(self) -> ConditionStart {
        ConditionStart {
            prefix: Some((self, Join::And)),
        }
    }

    pub fn or(self) -> ConditionStart {
        ConditionStart {
            prefix: Some((self, Join::Or)),
        }
    }

    pub fn and_not(self) -> ConditionStart {
        ConditionStart {
            prefix: Some((self, Join::AndNot)),
        }
    }

    pub fn or_not(self) -> ConditionStart {
        ConditionStart {
            prefix: Some((self, Join::OrNot)),
        }
    }

    pub fn and_cond(self, other: Condition) -> Condition {
        combine(self, other, Join::And)
    }

    pub fn or_cond(self, other: Condition) -> Condition {
        combine(self, other, Join::Or)
    }

    pub fn and_not_cond(self, other: Condition) -> Condition {
        combine(self, other, Join::AndNot)
    }

    pub fn or_not_cond(self, other: Condition) -> Condition {
        combine(self, other, Join::OrNot)
    }

    /// Every field path referenced by the condition.
    pub fn paths(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_paths(&mut out);
        out
    }

    fn collect_paths<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Condition::Leaf(p) => out.push(&p.path),
            Condition::And(items) | Condition::Or(items) => {
                for c in items {
                    c.collect_paths(out);
                }
            }
            Condition::Not(c) => c.collect_paths(out),
        }
    }
}

fn combine(left: Condition, right: Condition, join: Join) -> Condition {
    if left.is_empty() {
        return match join {
            Join::And | Join::Or => right,
            Join::AndNot | Join::OrNot => !right,
        };
    }
    match join {
        Join::And => match left {
            Condition::And(mut items) => {
                items.push(right);
                Condition::And(items)
            }
            other => Condition::And(vec![other, right]),
        },
        Join::Or => match left {
            Condition::Or(mut items) => {
                items.push(right);
                Condition::Or(items)
            }
            other => Condition::Or(vec![other, right]),
        },
        Join::AndNot => combine(left, !right, Join::And),
        Join::OrNot => combine(left, !right, Join::Or),
    }
}

impl ConditionField {
    fn leaf(self, op: Operator, arg: Value) -> Condition {
        let leaf = Condition::Leaf(Predicate {
            path: self.path,
            op,
            arg,
        });
        match self.prefix {
            None => leaf,
            Some((left, join)) => combine(left, leaf, join),
        }
    }

    pub fn equals(self, v: impl Into<Value>) -> Condition {
        self.leaf(Operator::Equals, v.into())
    }

    pub fn not_equals(self, v: impl Into<Value>) -> Condition {
        self.leaf(Operator::NotEquals, v.into())
    }

    /// SQL LIKE with a caller supplied pattern.
    pub fn like(self, pattern: &str) -> Condition {
        self.leaf(Operator::Like, Value::from(pattern))
    }

    pub fn not_like(self, pattern: &str) -> Condition {
        self.leaf(Operator::NotLike, Value::from(pattern))
    }

    /// Case-insensitive LIKE with a caller supplied pattern.
    pub fn ilike(self, pattern: &str) -> Condition {
        self.leaf(Operator::ILike, Value::from(pattern))
    }

    pub fn contains(self, s: &str) -> Condition {
        self.leaf(Operator::Contains, Value::from(s))
    }

    pub fn not_contains(self, s: &str) -> Condition {
        self.leaf(Operator::NotContains, Value::from(s))
    }

    pub fn icontains(self, s: &str) -> Condition {
        self.leaf(Operator::IContains, Value::from(s))
    }

    pub fn not_icontains(self, s: &str) -> Condition {
        self.leaf(Operator::NotIContains, Value::from(s))
    }

    pub fn greater(self, v: impl Into<Value>) -> Condition {
        self.leaf(Operator::Greater, v.into())
    }

    pub fn greater_or_equal(self, v: impl Into<Value>) -> Condition {
        self.leaf(Operator::GreaterOrEqual, v.into())
    }

    pub fn lower(self, v: impl Into<Value>) -> Condition {
        self.leaf(Operator::Lower, v.into())
    }

    pub fn lower_or_equal(self, v: impl Into<Value>) -> Condition {
        self.leaf(Operator::LowerOrEqual, v.into())
    }

    pub fn is_in(self, v: impl Into<Value>) -> Condition {
        self.leaf(Operator::In, v.into())
    }

    pub fn not_in(self, v: impl Into<Value>) -> Condition {
        self.leaf(Operator::NotIn, v.into())
    }

    pub fn is_null(self) -> Condition {
        self.leaf(Operator::IsNull, Value::Null)
    }

    pub fn is_not_null(self) -> Condition {
        self.leaf(Operator::IsNotNull, Value::Null)
    }

    /// Leaf with an operator chosen at runtime.
    pub fn op(self, op: Operator, v: impl Into<Value>) -> Condition {
        self.leaf(op, v.into())
    }
}

impl Not for Condition {
    type Output = Condition;

    fn not(self) -> Condition {
        match self {
            Condition::Not(inner) => *inner,
            other => Condition::Not(Box::new(other)),
        }
    }
}

impl BitAnd for Condition {
    type Output = Condition;

    fn bitand(self, rhs: Condition) -> Condition {
        self.and_cond(rhs)
    }
}

impl BitOr for Condition {
    type Output = Condition;

    fn bitor(self, rhs: Condition) -> Condition {
        self.or_cond(rhs)
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Leaf(p) => write!(f, "{} {} {}", p.path, p.op.as_str(), p.arg),
            Condition::And(items) if items.is_empty() => write!(f, "TRUE"),
            Condition::Or(items) if items.is_empty() => write!(f, "FALSE"),
            Condition::And(items) | Condition::Or(items) => {
                let sep = if matches!(self, Condition::And(_)) { " AND " } else { " OR " };
                let parts: Vec<String> = items.iter().map(|c| format!("({c})")).collect();
                write!(f, "{}", parts.join(sep))
            }
            Condition::Not(c) => write!(f, "NOT ({c})"),
        }
    }
}
