use std::collections::{BTreeSet, HashMap, VecDeque};

use openerp_core::OrmError;

use crate::model::{Model, ModelId};

/// Node of the dependency graph: a field of a model.
pub(crate) type FieldKey = (ModelId, String);

/// A computed or related field to revisit when a source field changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Trigger {
    pub model: ModelId,
    pub field: String,
    /// Relation path from `model` to the model owning the source field.
    /// Empty when the source lives on `model` itself.
    pub path: Vec<String>,
}

/// Reverse index from source fields to the computed fields reading them,
/// with a topological rank per computed field.
#[derive(Debug, Default)]
pub(crate) struct DependencyGraph {
    triggers: HashMap<FieldKey, Vec<Trigger>>,
    rank: HashMap<FieldKey, usize>,
}

impl DependencyGraph {
    /// Build the graph from resolved models. Fails on a cycle.
    pub fn build(models: &[Model]) -> Result<Self, OrmError> {
        let mut graph = DependencyGraph::default();

        for model in models.iter().filter(|m| !m.is_mixin()) {
            for field in model.fields() {
                let paths: Vec<String> = if field.is_related() {
                    vec![field.related_path.join(".")]
                } else if field.is_computed() {
                    field.depends().to_vec()
                } else {
                    continue;
                };
                for path in paths.iter().filter(|p| !p.is_empty()) {
                    graph.add_path(models, model, &field.name, path)?;
                }
            }
        }

        graph.rank = graph.topological_rank(models)?;
        Ok(graph)
    }

    fn add_path(
        &mut self,
        models: &[Model],
        target: &Model,
        target_field: &str,
        path: &str,
    ) -> Result<(), OrmError> {
        let segments: Vec<&str> = path.split('.').collect();
        let mut current = target;
        let mut prefix: Vec<String> = Vec::new();

        for (i, seg) in segments.iter().enumerate() {
            let field = current.field(seg).ok_or_else(|| {
                OrmError::invalid_field(
                    &target.name,
                    target_field,
                    format!("unknown field '{seg}' in dependency path '{path}'"),
                )
            })?;
            let trigger = Trigger {
                model: target.id,
                field: target_field.to_string(),
                path: prefix.clone(),
            };
            let list = self.triggers.entry((current.id, field.name.clone())).or_default();
            if !list.contains(&trigger) {
                list.push(trigger);
            }

            if i + 1 < segments.len() {
                let next = field.relation.ok_or_else(|| {
                    OrmError::invalid_field(
                        &target.name,
                        target_field,
                        format!("'{seg}' in dependency path '{path}' is not a relation"),
                    )
                })?;
                prefix.push(field.name.clone());
                current = &models[next.0];
            }
        }
        Ok(())
    }

    /// Kahn's algorithm over the field nodes. Rank 0 for fields nothing
    /// depends on before them.
    fn topological_rank(&self, models: &[Model]) -> Result<HashMap<FieldKey, usize>, OrmError> {
        let mut indegree: HashMap<FieldKey, usize> = HashMap::new();
        for (source, triggers) in &self.triggers {
            indegree.entry(source.clone()).or_insert(0);
            for t in triggers {
                *indegree.entry((t.model, t.field.clone())).or_insert(0) += 1;
            }
        }

        let mut queue: VecDeque<FieldKey> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(k, _)| k.clone())
            .collect();
        let mut rank: HashMap<FieldKey, usize> = HashMap::new();
        for key in &queue {
            rank.insert(key.clone(), 0);
        }

        while let Some(node) = queue.pop_front() {
            let node_rank = rank.get(&node).copied().unwrap_or(0);
            for t in self.triggers.get(&node).into_iter().flatten() {
                let key = (t.model, t.field.clone());
                let r = rank.entry(key.clone()).or_insert(0);
                *r = (*r).max(node_rank + 1);
                if let Some(d) = indegree.get_mut(&key) {
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(key);
                    }
                }
            }
        }

        let cyclic: BTreeSet<String> = indegree
            .iter()
            .filter(|(_, d)| **d > 0)
            .map(|((m, f), _)| format!("{}.{f}", models[m.0].name))
            .collect();
        if !cyclic.is_empty() {
            let names: Vec<String> = cyclic.into_iter().collect();
            return Err(OrmError::Configuration(format!(
                "cyclic field dependencies between {}",
                names.join(", ")
            )));
        }
        Ok(rank)
    }

    /// Fields to revisit when `field` of `model` changes.
    pub fn triggers(&self, model: ModelId, field: &str) -> &[Trigger] {
        self.triggers
            .get(&(model, field.to_string()))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn rank(&self, model: ModelId, field: &str) -> usize {
        self.rank
            .get(&(model, field.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Computed fields of `model` reading `field` of the same record.
    pub fn local_dependents(&self, model: ModelId, field: &str) -> Vec<String> {
        self.triggers(model, field)
            .iter()
            .filter(|t| t.model == model && t.path.is_empty())
            .map(|t| t.field.clone())
            .collect()
    }
}
