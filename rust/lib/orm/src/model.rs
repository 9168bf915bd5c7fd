use std::collections::HashMap;

use bitflags::bitflags;
use indexmap::IndexMap;
use openerp_core::OrmError;

use crate::field::Field;
use crate::method::Method;

/// Stable index of a model in the registry arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelId(pub(crate) usize);

bitflags! {
    /// Model kind flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ModelOptions: u8 {
        /// Records are short-lived wizard data.
        const TRANSIENT = 1;
        /// Bundle of fields and methods merged into other models. No table.
        const MIXIN = 1 << 1;
        /// Backed by a view maintained outside the engine. No DDL.
        const MANUAL = 1 << 2;
        /// Declared by the engine itself.
        const SYSTEM = 1 << 3;
    }
}

/// Named `CHECK` constraint on a model's table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlConstraint {
    pub name: String,
    pub check: String,
}

/// A finalized model.
#[derive(Debug)]
pub struct Model {
    pub id: ModelId,
    pub name: String,
    pub table: String,
    pub options: ModelOptions,
    /// Mixins as declared, and the full merge order (mixins first, self last).
    pub mixins: Vec<String>,
    pub linearization: Vec<String>,
    pub sql_constraints: Vec<SqlConstraint>,
    pub order: Vec<String>,
    pub(crate) fields: IndexMap<String, Field>,
    pub(crate) json_index: HashMap<String, String>,
    pub(crate) methods: IndexMap<String, Method>,
}

impl Model {
    pub fn is_mixin(&self) -> bool {
        self.options.contains(ModelOptions::MIXIN)
    }

    pub fn is_manual(&self) -> bool {
        self.options.contains(ModelOptions::MANUAL)
    }

    pub fn is_transient(&self) -> bool {
        self.options.contains(ModelOptions::TRANSIENT)
    }

    /// Has a table managed by the engine.
    pub fn has_table(&self) -> bool {
        !self.options.intersects(ModelOptions::MIXIN | ModelOptions::MANUAL)
    }

    /// Look a field up by name or JSON name.
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.get(name).or_else(|| {
            self.json_index
                .get(name)
                .and_then(|n| self.fields.get(n.as_str()))
        })
    }

    pub fn must_field(&self, name: &str) -> Result<&Field, OrmError> {
        self.field(name)
            .ok_or_else(|| OrmError::NotFound(format!("unknown field {}.{name}", self.name)))
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    pub fn fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.values()
    }

    pub fn method(&self, name: &str) -> Option<&Method> {
        self.methods.get(name)
    }

    pub fn must_method(&self, name: &str) -> Result<&Method, OrmError> {
        self.method(name)
            .ok_or_else(|| OrmError::NotFound(format!("unknown method {}.{name}", self.name)))
    }

    pub fn methods(&self) -> impl Iterator<Item = &Method> {
        self.methods.values()
    }

    /// True if the model includes `mixin` directly or transitively.
    pub fn inherits(&self, mixin: &str) -> bool {
        self.linearization.iter().any(|m| m == mixin)
    }
}
