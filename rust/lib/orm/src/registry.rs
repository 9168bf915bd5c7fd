use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};

use indexmap::IndexMap;
use openerp_core::{OrmError, RuntimeConfig, to_snake_case};
use tracing::{debug, info};

use crate::base;
use crate::depends::DependencyGraph;
use crate::field::{Field, FieldDef, FieldType, Link};
use crate::i18n::{NoTranslation, Translator};
use crate::method::{Layer, Method, MethodFn, Payload, Super};
use crate::model::{Model, ModelId, ModelOptions, SqlConstraint};
use crate::recordset::RecordSet;
use crate::security::{GROUP_EVERYONE, RecordRule, SecurityRegistry};

static GLOBAL: OnceLock<Arc<Registry>> = OnceLock::new();

/// Name of the implicit primary key field.
pub const ID_FIELD: &str = "ID";

// ── Builder ─────────────────────────────────────────────────────────

#[derive(Debug)]
struct ModelDecl {
    options: ModelOptions,
    fields: IndexMap<String, FieldDef>,
    methods: IndexMap<String, Vec<Layer>>,
    mixins: Vec<String>,
    sql_constraints: Vec<SqlConstraint>,
    order: Vec<String>,
}

impl ModelDecl {
    fn new(options: ModelOptions, mixins: &[&str]) -> Self {
        Self {
            options,
            fields: IndexMap::new(),
            methods: IndexMap::new(),
            mixins: mixins.iter().map(|s| s.to_string()).collect(),
            sql_constraints: Vec::new(),
            order: Vec::new(),
        }
    }
}

#[derive(Debug)]
struct GrantDecl {
    model: String,
    method: String,
    group: String,
    caller: Option<(String, String)>,
}

/// Startup phase of the registry: declare models, fields, methods, mixins
/// and grants, then [`RegistryBuilder::finalize`].
///
/// ```ignore
/// let mut b = RegistryBuilder::new(RuntimeConfig::default());
/// b.declare_model("Tag")?;
/// b.add_fields("Tag", [("Name", FieldDef::char().required())])?;
/// b.add_method("Tag", "Greet", "Greet returns a greeting", |_, rs, _| {
///     Ok(format!("Hello {}", rs.get("Name")?).into())
/// })?;
/// let registry = b.finalize()?;
/// ```
pub struct RegistryBuilder {
    config: RuntimeConfig,
    decls: IndexMap<String, ModelDecl>,
    grants: Vec<GrantDecl>,
    groups: Vec<(String, String, Vec<String>)>,
    translator: Arc<dyn Translator>,
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

impl RegistryBuilder {
    /// New builder with the built-in mixins already declared.
    pub fn new(config: RuntimeConfig) -> Self {
        let mut builder = Self {
            config,
            decls: IndexMap::new(),
            grants: Vec::new(),
            groups: Vec::new(),
            translator: Arc::new(NoTranslation),
        };
        base::declare_builtins(&mut builder);
        builder
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn set_translator(&mut self, translator: Arc<dyn Translator>) {
        self.translator = translator;
    }

    fn declare(&mut self, name: &str, decl: ModelDecl) -> Result<(), OrmError> {
        if self.decls.contains_key(name) {
            return Err(OrmError::DuplicateModel(name.to_string()));
        }
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(OrmError::Configuration(format!("invalid model name '{name}'")));
        }
        debug!(model = name, "declare model");
        self.decls.insert(name.to_string(), decl);
        Ok(())
    }

    /// Declare a regular model backed by a table. Inherits `ModelMixin`.
    pub fn declare_model(&mut self, name: &str) -> Result<(), OrmError> {
        self.declare(name, ModelDecl::new(ModelOptions::empty(), &[base::MODEL_MIXIN]))
    }

    /// Declare a mixin: fields and methods merged into inheriting models.
    pub fn declare_mixin_model(&mut self, name: &str) -> Result<(), OrmError> {
        self.declare(name, ModelDecl::new(ModelOptions::MIXIN, &[]))
    }

    /// Declare a model backed by a view created outside the engine.
    pub fn declare_manual_model(&mut self, name: &str) -> Result<(), OrmError> {
        self.declare(name, ModelDecl::new(ModelOptions::MANUAL, &[base::BASE_MIXIN]))
    }

    /// Declare a model for short-lived wizard records.
    pub fn declare_transient_model(&mut self, name: &str) -> Result<(), OrmError> {
        self.declare(name, ModelDecl::new(ModelOptions::TRANSIENT, &[base::BASE_MIXIN]))
    }

    pub(crate) fn declare_system_mixin(&mut self, name: &str, mixins: &[&str]) {
        self.decls.insert(
            name.to_string(),
            ModelDecl::new(ModelOptions::MIXIN | ModelOptions::SYSTEM, mixins),
        );
    }

    fn system_decl(&mut self, mixin: &str) -> &mut ModelDecl {
        self.decls
            .entry(mixin.to_string())
            .or_insert_with(|| ModelDecl::new(ModelOptions::MIXIN | ModelOptions::SYSTEM, &[]))
    }

    /// Base layer of a built-in method. Later declarations replace earlier ones.
    pub(crate) fn system_method<F>(&mut self, mixin: &str, name: &str, doc: &str, f: F)
    where
        F: Fn(&Super<'_>, &RecordSet, Vec<Payload>) -> Result<Payload, OrmError>
            + Send
            + Sync
            + 'static,
    {
        self.system_decl(mixin)
            .methods
            .insert(name.to_string(), vec![layer(mixin, doc, true, Arc::new(f))]);
    }

    /// Built-in scalar fields. They carry no relation, so nothing needs checking.
    pub(crate) fn system_fields<'a>(
        &mut self,
        mixin: &str,
        fields: impl IntoIterator<Item = (&'a str, FieldDef)>,
    ) {
        let decl = self.system_decl(mixin);
        for (name, def) in fields {
            decl.fields.insert(name.to_string(), def);
        }
    }

    fn decl_mut(&mut self, model: &str) -> Result<&mut ModelDecl, OrmError> {
        self.decls
            .get_mut(model)
            .ok_or_else(|| OrmError::Configuration(format!("unknown model '{model}'")))
    }

    /// Add fields to a model. Relation targets must already be declared.
    pub fn add_fields<'a>(
        &mut self,
        model: &str,
        fields: impl IntoIterator<Item = (&'a str, FieldDef)>,
    ) -> Result<(), OrmError> {
        let known: HashSet<String> = self.decls.keys().cloned().collect();
        let decl = self.decl_mut(model)?;
        for (name, def) in fields {
            check_field_decl(model, name, &def, &known)?;
            if decl.fields.contains_key(name) {
                return Err(OrmError::invalid_field(model, name, "field already declared"));
            }
            decl.fields.insert(name.to_string(), def);
        }
        Ok(())
    }

    /// Declare a method: its first layer on this model.
    pub fn add_method<F>(&mut self, model: &str, name: &str, doc: &str, f: F) -> Result<(), OrmError>
    where
        F: Fn(&Super<'_>, &RecordSet, Vec<Payload>) -> Result<Payload, OrmError>
            + Send
            + Sync
            + 'static,
    {
        let decl = self.decl_mut(model)?;
        if decl.methods.contains_key(name) {
            return Err(OrmError::Configuration(format!(
                "method {model}.{name} is already declared"
            )));
        }
        decl.methods
            .insert(name.to_string(), vec![layer(model, doc, true, Arc::new(f))]);
        Ok(())
    }

    /// Add an outer layer to a method declared on this model or one of its mixins.
    pub fn extend<F>(&mut self, model: &str, name: &str, doc: &str, f: F) -> Result<(), OrmError>
    where
        F: Fn(&Super<'_>, &RecordSet, Vec<Payload>) -> Result<Payload, OrmError>
            + Send
            + Sync
            + 'static,
    {
        let decl = self.decl_mut(model)?;
        decl.methods
            .entry(name.to_string())
            .or_default()
            .push(layer(model, doc, false, Arc::new(f)));
        Ok(())
    }

    /// Merge a mixin's fields and methods into `model`. Later mixins win.
    pub fn inherit_model(&mut self, model: &str, mixin: &str) -> Result<(), OrmError> {
        let is_mixin = self
            .decls
            .get(mixin)
            .map(|d| d.options.contains(ModelOptions::MIXIN))
            .ok_or_else(|| OrmError::Configuration(format!("unknown mixin '{mixin}'")))?;
        if !is_mixin {
            return Err(OrmError::Configuration(format!(
                "'{mixin}' is not a mixin and cannot be inherited"
            )));
        }
        let decl = self.decl_mut(model)?;
        if !decl.mixins.iter().any(|m| m == mixin) {
            decl.mixins.push(mixin.to_string());
        }
        Ok(())
    }

    /// Named `CHECK` constraint emitted by `sync_schema`.
    pub fn add_sql_constraint(&mut self, model: &str, name: &str, check: &str) -> Result<(), OrmError> {
        self.decl_mut(model)?.sql_constraints.push(SqlConstraint {
            name: name.to_string(),
            check: check.to_string(),
        });
        Ok(())
    }

    /// Default order of searches, e.g. `["Name", "ID desc"]`.
    pub fn set_order(&mut self, model: &str, order: &[&str]) -> Result<(), OrmError> {
        self.decl_mut(model)?.order = order.iter().map(|s| s.to_string()).collect();
        Ok(())
    }

    pub fn register_group(&mut self, id: &str, name: &str, inherits: &[&str]) {
        self.groups.push((
            id.to_string(),
            name.to_string(),
            inherits.iter().map(|s| s.to_string()).collect(),
        ));
    }

    /// Grant `group` the right to call `model.method`, optionally only when
    /// called from within `caller` (model, method).
    pub fn allow_group(
        &mut self,
        model: &str,
        method: &str,
        group: &str,
        caller: Option<(&str, &str)>,
    ) -> Result<(), OrmError> {
        self.decl_mut(model)?;
        self.grants.push(GrantDecl {
            model: model.to_string(),
            method: method.to_string(),
            group: group.to_string(),
            caller: caller.map(|(m, f)| (m.to_string(), f.to_string())),
        });
        Ok(())
    }

    // ── Finalize ──

    /// Resolve mixins, relations, dependency paths and grants, and freeze.
    pub fn finalize(self) -> Result<Arc<Registry>, OrmError> {
        let ids: HashMap<String, ModelId> = self
            .decls
            .keys()
            .enumerate()
            .map(|(i, name)| (name.clone(), ModelId(i)))
            .collect();

        let mut models = Vec::with_capacity(self.decls.len());
        for (i, (name, decl)) in self.decls.iter().enumerate() {
            let linearization = self.linearize(name)?;
            let fields = self.merge_fields(name, &linearization, &ids)?;
            let methods = self.merge_methods(name, &linearization)?;
            let json_index = fields
                .values()
                .filter(|f| f.json != f.name)
                .map(|f| (f.json.clone(), f.name.clone()))
                .collect();
            models.push(Model {
                id: ModelId(i),
                name: name.clone(),
                table: to_snake_case(name),
                options: decl.options,
                mixins: decl.mixins.clone(),
                linearization,
                sql_constraints: decl.sql_constraints.clone(),
                order: decl.order.clone(),
                fields,
                json_index,
                methods,
            });
        }

        for model in models.iter().filter(|m| !m.is_mixin()) {
            validate_model(model, &models)?;
        }

        let graph = DependencyGraph::build(&models)?;
        let security = SecurityRegistry::new();
        for (id, name, inherits) in &self.groups {
            let inherits: Vec<&str> = inherits.iter().map(String::as_str).collect();
            security
                .register_group(id, name, &inherits)
                .map_err(|e| OrmError::Configuration(e.to_string()))?;
        }

        let by_name: HashMap<String, ModelId> = ids;
        for model in models.iter().filter(|m| !m.is_mixin()) {
            for method in base::PUBLIC_METHODS {
                if model.method(method).is_some() {
                    security.allow_group(&model.name, method, GROUP_EVERYONE, None);
                }
            }
        }
        for g in &self.grants {
            let model = &models[by_name[&g.model].0];
            check_grant(model, &g.method, g.caller.as_ref(), &by_name, &models)?;
            if security.group(&g.group).is_none() {
                return Err(OrmError::Configuration(format!("unknown group '{}'", g.group)));
            }
            let caller = g.caller.as_ref().map(|(m, f)| (m.as_str(), f.as_str()));
            security.allow_group(&g.model, &g.method, &g.group, caller);
        }

        info!(
            models = models.iter().filter(|m| !m.is_mixin()).count(),
            mixins = models.iter().filter(|m| m.is_mixin()).count(),
            "registry finalized"
        );
        Ok(Arc::new(Registry {
            models,
            by_name,
            graph,
            security,
            config: self.config,
            translator: self.translator,
        }))
    }

    /// Merge order of a model: mixins depth first, each once, self last.
    fn linearize(&self, name: &str) -> Result<Vec<String>, OrmError> {
        fn visit(
            b: &RegistryBuilder,
            name: &str,
            stack: &mut Vec<String>,
            out: &mut Vec<String>,
        ) -> Result<(), OrmError> {
            if stack.iter().any(|s| s == name) {
                stack.push(name.to_string());
                return Err(OrmError::Configuration(format!(
                    "cyclic mixin inheritance: {}",
                    stack.join(" -> ")
                )));
            }
            let decl = b
                .decls
                .get(name)
                .ok_or_else(|| OrmError::Configuration(format!("unknown mixin '{name}'")))?;
            stack.push(name.to_string());
            for mixin in &decl.mixins {
                visit(b, mixin, stack, out)?;
            }
            stack.pop();
            if !out.iter().any(|o| o == name) {
                out.push(name.to_string());
            }
            Ok(())
        }

        let mut out = Vec::new();
        visit(self, name, &mut Vec::new(), &mut out)?;
        Ok(out)
    }

    fn merge_fields(
        &self,
        model: &str,
        linearization: &[String],
        ids: &HashMap<String, ModelId>,
    ) -> Result<IndexMap<String, Field>, OrmError> {
        let mut merged: IndexMap<String, (FieldDef, String)> = IndexMap::new();
        merged.insert(
            ID_FIELD.to_string(),
            (FieldDef::integer().string("ID").readonly(), model.to_string()),
        );
        for source in linearization {
            if let Some(decl) = self.decls.get(source) {
                for (name, def) in &decl.fields {
                    merged.insert(name.clone(), (def.clone(), source.clone()));
                }
            }
        }

        let model_snake = to_snake_case(model);
        let mut fields = IndexMap::with_capacity(merged.len());
        for (name, (def, declared_in)) in merged {
            let relation = match &def.relation {
                Some(target) => Some(*ids.get(target).ok_or_else(|| {
                    OrmError::invalid_field(model, &name, format!("unknown relation model '{target}'"))
                })?),
                None => None,
            };
            let column_name = if name == ID_FIELD {
                "id".to_string()
            } else if def.ftype.is_fk() {
                format!("{}_id", to_snake_case(&name))
            } else {
                to_snake_case(&name)
            };
            let stored = def.related.is_none()
                && !def.ftype.is_reverse()
                && (def.compute.is_none() || def.stored);
            let link = if def.ftype == FieldType::Many2Many {
                let target = def.relation.as_deref().unwrap_or_default();
                Some(match &def.link {
                    Some((table, ours, theirs)) => Link {
                        table: table.clone(),
                        ours: ours.clone(),
                        theirs: theirs.clone(),
                    },
                    None => default_link(&model_snake, &to_snake_case(target)),
                })
            } else {
                None
            };
            let field = Field {
                json: def.json.clone().unwrap_or_else(|| column_name.clone()),
                column: stored.then_some(column_name),
                declared_in,
                relation,
                link,
                related_path: def
                    .related
                    .as_deref()
                    .map(|p| p.split('.').map(str::to_string).collect())
                    .unwrap_or_default(),
                def,
                name: name.clone(),
            };
            fields.insert(name, field);
        }
        Ok(fields)
    }

    fn merge_methods(
        &self,
        model: &str,
        linearization: &[String],
    ) -> Result<IndexMap<String, Method>, OrmError> {
        let mut merged: IndexMap<String, Vec<Layer>> = IndexMap::new();
        for source in linearization {
            if let Some(decl) = self.decls.get(source) {
                for (name, layers) in &decl.methods {
                    merged.entry(name.clone()).or_default().extend(layers.iter().cloned());
                }
            }
        }
        let mut methods = IndexMap::with_capacity(merged.len());
        for (name, layers) in merged {
            if !layers.first().is_some_and(|l| l.base) {
                return Err(OrmError::Configuration(format!(
                    "method {model}.{name} is extended but never declared"
                )));
            }
            methods.insert(name.clone(), Method { name, layers });
        }
        Ok(methods)
    }
}

fn layer(origin: &str, doc: &str, base: bool, func: MethodFn) -> Layer {
    Layer {
        doc: doc.to_string(),
        origin: origin.to_string(),
        base,
        func,
    }
}

fn default_link(ours: &str, theirs: &str) -> Link {
    let mut names = [ours, theirs];
    names.sort();
    let table = format!("{}_{}_rel", names[0], names[1]);
    if ours == theirs {
        Link {
            table,
            ours: format!("{ours}1_id"),
            theirs: format!("{theirs}2_id"),
        }
    } else {
        Link {
            table,
            ours: format!("{ours}_id"),
            theirs: format!("{theirs}_id"),
        }
    }
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn check_path(model: &str, field: &str, path: &str) -> Result<(), OrmError> {
    if path.split('.').all(is_identifier) {
        Ok(())
    } else {
        Err(OrmError::invalid_field(model, field, format!("malformed field path '{path}'")))
    }
}

/// Static checks run when a field is added.
fn check_field_decl(
    model: &str,
    name: &str,
    def: &FieldDef,
    known: &HashSet<String>,
) -> Result<(), OrmError> {
    if !is_identifier(name) || name == ID_FIELD {
        return Err(OrmError::invalid_field(model, name, "invalid field name"));
    }
    if let Some(target) = &def.relation {
        if !known.contains(target) {
            return Err(OrmError::invalid_field(
                model,
                name,
                format!("unknown relation model '{target}'"),
            ));
        }
    }
    if def.compute.is_some() && def.related.is_some() {
        return Err(OrmError::invalid_field(model, name, "field cannot be both computed and related"));
    }
    if def.stored && def.compute.is_none() && def.related.is_none() {
        return Err(OrmError::invalid_field(model, name, "only computed fields can be marked stored"));
    }
    if def.stored && def.related.is_some() {
        return Err(OrmError::invalid_field(model, name, "related fields are never stored"));
    }
    if def.ftype.is_reverse() && def.compute.is_some() && def.stored {
        return Err(OrmError::invalid_field(model, name, "reverse relations cannot be stored"));
    }
    for path in def.depends.iter().chain(def.related.iter()) {
        check_path(model, name, path)?;
    }
    Ok(())
}

/// Checks that need every model resolved: reverse keys, related paths
/// and hook methods.
fn validate_model(model: &Model, models: &[Model]) -> Result<(), OrmError> {
    for field in model.fields() {
        let invalid = |reason: String| OrmError::invalid_field(&model.name, &field.name, reason);

        if let Some(target_id) = field.relation {
            let target = &models[target_id.0];
            if target.is_mixin() {
                return Err(invalid(format!("relation target '{}' is a mixin", target.name)));
            }
            if let Some(fk) = field.reverse_fk() {
                let expected = match field.ftype() {
                    FieldType::Rev2One => FieldType::One2One,
                    _ => FieldType::Many2One,
                };
                let ok = target
                    .field(fk)
                    .is_some_and(|f| f.ftype() == expected && f.relation == Some(model.id));
                if !ok {
                    return Err(invalid(format!(
                        "'{}.{fk}' is not a {expected} field pointing to '{}'",
                        target.name, model.name
                    )));
                }
            }
        }

        if field.is_related() {
            let mut current = model;
            let last = field.related_path.len() - 1;
            for (i, seg) in field.related_path.iter().enumerate() {
                let f = current
                    .field(seg)
                    .ok_or_else(|| invalid(format!("unknown field '{seg}' in related path")))?;
                if i < last {
                    let next = f
                        .relation
                        .ok_or_else(|| invalid(format!("'{seg}' in related path is not a relation")))?;
                    current = &models[next.0];
                } else {
                    if f.ftype() != field.ftype() && !(f.ftype().is_fk() && field.ftype().is_fk()) {
                        return Err(invalid(format!(
                            "related field type {} does not match {} of '{seg}'",
                            field.ftype(),
                            f.ftype()
                        )));
                    }
                    if field.ftype().is_relation() && f.relation != field.relation {
                        return Err(invalid(format!("'{seg}' points to another model")));
                    }
                }
            }
        }

        let hooks = [
            field.def.compute.as_deref(),
            field.def.inverse.as_deref(),
            field.def.onchange.as_deref(),
            field.def.onchange_warning.as_deref(),
            field.def.onchange_filters.as_deref(),
            field.def.constraint.as_deref(),
        ];
        for hook in hooks.into_iter().flatten() {
            if model.method(hook).is_none() {
                return Err(invalid(format!("unknown method '{hook}'")));
            }
        }
    }
    Ok(())
}

fn check_grant(
    model: &Model,
    method: &str,
    caller: Option<&(String, String)>,
    by_name: &HashMap<String, ModelId>,
    models: &[Model],
) -> Result<(), OrmError> {
    if model.method(method).is_none() {
        return Err(OrmError::Configuration(format!(
            "cannot grant unknown method {}.{method}",
            model.name
        )));
    }
    if let Some((cm, cf)) = caller {
        let known = by_name
            .get(cm)
            .is_some_and(|id| models[id.0].method(cf).is_some());
        if !known {
            return Err(OrmError::Configuration(format!("unknown caller method {cm}.{cf}")));
        }
    }
    Ok(())
}

// ── Registry ────────────────────────────────────────────────────────

/// Finalized, immutable model registry.
///
/// Only access control (groups, grants, record rules) stays mutable, behind
/// its own lock.
pub struct Registry {
    models: Vec<Model>,
    by_name: HashMap<String, ModelId>,
    pub(crate) graph: DependencyGraph,
    security: SecurityRegistry,
    config: RuntimeConfig,
    translator: Arc<dyn Translator>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("models", &self.by_name.len())
            .finish_non_exhaustive()
    }
}

impl Registry {
    /// Install as the process-wide registry. Fails if one is installed.
    pub fn install_global(registry: Arc<Registry>) -> Result<(), OrmError> {
        GLOBAL
            .set(registry)
            .map_err(|_| OrmError::Configuration("global registry already installed".into()))
    }

    pub fn global() -> Option<Arc<Registry>> {
        GLOBAL.get().cloned()
    }

    pub fn model(&self, name: &str) -> Result<&Model, OrmError> {
        self.by_name
            .get(name)
            .map(|id| &self.models[id.0])
            .ok_or_else(|| OrmError::NotFound(format!("unknown model '{name}'")))
    }

    pub fn model_by_id(&self, id: ModelId) -> &Model {
        &self.models[id.0]
    }

    pub fn models(&self) -> impl Iterator<Item = &Model> {
        self.models.iter()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn security(&self) -> &SecurityRegistry {
        &self.security
    }

    pub fn translator(&self) -> &dyn Translator {
        self.translator.as_ref()
    }

    /// Grant at runtime. Takes effect on the next call of any environment.
    pub fn allow_group(
        &self,
        model: &str,
        method: &str,
        group: &str,
        caller: Option<(&str, &str)>,
    ) -> Result<(), OrmError> {
        let m = self.model(model)?;
        m.must_method(method)?;
        if let Some((cm, cf)) = caller {
            self.model(cm)?.must_method(cf)?;
        }
        if self.security.group(group).is_none() {
            return Err(OrmError::NotFound(format!("unknown group '{group}'")));
        }
        self.security.allow_group(model, method, group, caller);
        Ok(())
    }

    pub fn revoke_group(&self, model: &str, method: &str, group: &str) -> Result<(), OrmError> {
        self.model(model)?.must_method(method)?;
        self.security.revoke_group(model, method, group);
        Ok(())
    }

    /// Add a record rule after checking its condition's first path segments.
    pub fn add_record_rule(&self, model: &str, rule: RecordRule) -> Result<(), OrmError> {
        let m = self.model(model)?;
        for path in rule.condition.paths() {
            let head = path.split('.').next().unwrap_or(path);
            m.must_field(head)?;
        }
        if let Some(group) = &rule.group {
            if self.security.group(group).is_none() {
                return Err(OrmError::NotFound(format!("unknown group '{group}'")));
            }
        }
        self.security.add_record_rule(model, rule);
        Ok(())
    }

    pub fn remove_record_rule(&self, model: &str, name: &str) -> Result<(), OrmError> {
        self.model(model)?;
        self.security.remove_record_rule(model, name);
        Ok(())
    }
}
