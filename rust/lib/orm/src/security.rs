use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use bitflags::bitflags;
use openerp_core::OrmError;
use tracing::debug;

use crate::condition::Condition;
use crate::value::RecordId;

/// Group every user belongs to.
pub const GROUP_EVERYONE: &str = "everyone";
/// Administrators. Receives no implicit grants beyond what is declared.
pub const GROUP_ADMIN: &str = "admin";

bitflags! {
    /// Operations a record rule applies to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Permission: u8 {
        const READ = 1;
        const WRITE = 1 << 1;
        const UNLINK = 1 << 2;
        const ALL = Self::READ.bits() | Self::WRITE.bits() | Self::UNLINK.bits();
    }
}

/// A user group. `inherits` lists groups implied by membership of this one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub id: String,
    pub name: String,
    pub inherits: Vec<String>,
}

/// Row-level filter of a model.
///
/// Rules scoped to a group are ORed together for members of those groups.
/// Rules with no group apply to everybody and are ANDed.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordRule {
    pub name: String,
    pub group: Option<String>,
    pub condition: Condition,
    pub perms: Permission,
}

impl RecordRule {
    pub fn new(name: &str, group: &str, condition: Condition, perms: Permission) -> Self {
        Self {
            name: name.to_string(),
            group: Some(group.to_string()),
            condition,
            perms,
        }
    }

    pub fn global(name: &str, condition: Condition, perms: Permission) -> Self {
        Self {
            name: name.to_string(),
            group: None,
            condition,
            perms,
        }
    }
}

/// Method grant: members of `group` may call the method, only from inside
/// `caller` (model, method) when one is set.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Grant {
    group: String,
    caller: Option<(String, String)>,
}

#[derive(Debug, Default)]
struct SecurityState {
    groups: BTreeMap<String, Group>,
    memberships: HashMap<RecordId, BTreeSet<String>>,
    grants: HashMap<(String, String), Vec<Grant>>,
    rules: HashMap<String, Vec<RecordRule>>,
}

/// Runtime-mutable access control: groups, memberships, method grants and
/// record rules.
///
/// Readers take a shared lock per check, so a grant or revocation is seen
/// by the next call of any environment. Nothing is cached between checks.
#[derive(Debug)]
pub struct SecurityRegistry {
    state: RwLock<SecurityState>,
}

impl Default for SecurityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SecurityRegistry {
    pub fn new() -> Self {
        let mut state = SecurityState::default();
        for (id, name) in [(GROUP_EVERYONE, "Everyone"), (GROUP_ADMIN, "Administrators")] {
            state.groups.insert(
                id.to_string(),
                Group {
                    id: id.to_string(),
                    name: name.to_string(),
                    inherits: Vec::new(),
                },
            );
        }
        Self {
            state: RwLock::new(state),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, SecurityState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, SecurityState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    // ── Groups ──

    /// Register a group, or update its name and implied groups.
    pub fn register_group(&self, id: &str, name: &str, inherits: &[&str]) -> Result<(), OrmError> {
        let mut state = self.write();
        for parent in inherits {
            if !state.groups.contains_key(*parent) {
                return Err(OrmError::NotFound(format!("unknown group '{parent}'")));
            }
            if *parent == id || implies(&state, parent, id) {
                return Err(OrmError::Validation(format!(
                    "cycle detected: group '{id}' would imply itself through '{parent}'"
                )));
            }
        }
        state.groups.insert(
            id.to_string(),
            Group {
                id: id.to_string(),
                name: name.to_string(),
                inherits: inherits.iter().map(|s| s.to_string()).collect(),
            },
        );
        Ok(())
    }

    /// Remove a group with its memberships, grants and rules.
    pub fn unregister_group(&self, id: &str) -> Result<(), OrmError> {
        if id == GROUP_EVERYONE || id == GROUP_ADMIN {
            return Err(OrmError::Validation(format!("group '{id}' is built in")));
        }
        let mut state = self.write();
        state.groups.remove(id);
        for group in state.groups.values_mut() {
            group.inherits.retain(|g| g != id);
        }
        for groups in state.memberships.values_mut() {
            groups.remove(id);
        }
        for grants in state.grants.values_mut() {
            grants.retain(|g| g.group != id);
        }
        for rules in state.rules.values_mut() {
            rules.retain(|r| r.group.as_deref() != Some(id));
        }
        Ok(())
    }

    pub fn group(&self, id: &str) -> Option<Group> {
        self.read().groups.get(id).cloned()
    }

    pub fn add_membership(&self, uid: RecordId, group: &str) -> Result<(), OrmError> {
        let mut state = self.write();
        if !state.groups.contains_key(group) {
            return Err(OrmError::NotFound(format!("unknown group '{group}'")));
        }
        state
            .memberships
            .entry(uid)
            .or_default()
            .insert(group.to_string());
        Ok(())
    }

    pub fn remove_membership(&self, uid: RecordId, group: &str) {
        if let Some(groups) = self.write().memberships.get_mut(&uid) {
            groups.remove(group);
        }
    }

    /// Groups of a user: direct memberships, their implied groups and `everyone`.
    pub fn user_groups(&self, uid: RecordId) -> BTreeSet<String> {
        expand_groups(&self.read(), uid)
    }

    pub fn has_group(&self, uid: RecordId, group: &str) -> bool {
        self.user_groups(uid).contains(group)
    }

    // ── Method grants ──

    pub fn allow_group(&self, model: &str, method: &str, group: &str, caller: Option<(&str, &str)>) {
        let grant = Grant {
            group: group.to_string(),
            caller: caller.map(|(m, f)| (m.to_string(), f.to_string())),
        };
        let mut state = self.write();
        let grants = state
            .grants
            .entry((model.to_string(), method.to_string()))
            .or_default();
        if !grants.contains(&grant) {
            grants.push(grant);
        }
    }

    /// Remove every grant of `group` on the method, delegated or not.
    pub fn revoke_group(&self, model: &str, method: &str, group: &str) {
        if let Some(grants) = self
            .write()
            .grants
            .get_mut(&(model.to_string(), method.to_string()))
        {
            grants.retain(|g| g.group != group);
        }
    }

    /// Whether `uid` may call `model.method`, given the innermost method
    /// currently executing (`caller`).
    pub fn is_allowed(
        &self,
        uid: RecordId,
        model: &str,
        method: &str,
        caller: Option<(&str, &str)>,
    ) -> bool {
        let state = self.read();
        let Some(grants) = state.grants.get(&(model.to_string(), method.to_string())) else {
            return false;
        };
        let groups = expand_groups(&state, uid);
        let allowed = grants.iter().any(|g| {
            if !groups.contains(&g.group) {
                return false;
            }
            match (&g.caller, caller) {
                (None, _) => true,
                (Some((cm, cf)), Some((m, f))) => cm == m && cf == f,
                (Some(_), None) => false,
            }
        });
        if !allowed {
            debug!(uid, model, method, "method permission denied");
        }
        allowed
    }

    // ── Record rules ──

    /// Add or replace (by name) a rule on a model.
    pub fn add_record_rule(&self, model: &str, rule: RecordRule) {
        let mut state = self.write();
        let rules = state.rules.entry(model.to_string()).or_default();
        rules.retain(|r| r.name != rule.name);
        rules.push(rule);
    }

    pub fn remove_record_rule(&self, model: &str, name: &str) {
        if let Some(rules) = self.write().rules.get_mut(model) {
            rules.retain(|r| r.name != name);
        }
    }

    pub fn record_rules(&self, model: &str) -> Vec<RecordRule> {
        self.read().rules.get(model).cloned().unwrap_or_default()
    }

    /// Effective row filter for `uid` on `model` under `perm`.
    ///
    /// `None` means no restriction. Group rules matching the user's groups
    /// are ORed, global rules ANDed on top.
    pub fn rule_filter(&self, uid: RecordId, model: &str, perm: Permission) -> Option<Condition> {
        let state = self.read();
        let rules = state.rules.get(model)?;
        let groups = expand_groups(&state, uid);

        let mut global = Vec::new();
        let mut scoped = Vec::new();
        for rule in rules.iter().filter(|r| r.perms.intersects(perm)) {
            match &rule.group {
                None => global.push(rule.condition.clone()),
                Some(g) if groups.contains(g) => scoped.push(rule.condition.clone()),
                Some(_) => {}
            }
        }

        let mut parts = global;
        match scoped.len() {
            0 => {}
            1 => parts.extend(scoped),
            _ => parts.push(Condition::Or(scoped)),
        }
        match parts.len() {
            0 => None,
            1 => parts.pop(),
            _ => Some(Condition::And(parts)),
        }
    }
}

fn expand_groups(state: &SecurityState, uid: RecordId) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    let mut stack: Vec<String> = vec![GROUP_EVERYONE.to_string()];
    if let Some(direct) = state.memberships.get(&uid) {
        stack.extend(direct.iter().cloned());
    }
    while let Some(g) = stack.pop() {
        if !out.insert(g.clone()) {
            continue;
        }
        if let Some(group) = state.groups.get(&g) {
            stack.extend(group.inherits.iter().cloned());
        }
    }
    out
}

/// True if `from` implies `target` through `inherits` links.
fn implies(state: &SecurityState, from: &str, target: &str) -> bool {
    let mut seen = BTreeSet::new();
    let mut stack = vec![from.to_string()];
    while let Some(g) = stack.pop() {
        if g == target {
            return true;
        }
        if !seen.insert(g.clone()) {
            continue;
        }
        if let Some(group) = state.groups.get(&g) {
            stack.extend(group.inherits.iter().cloned());
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grants_follow_membership() {
        let sec = SecurityRegistry::new();
        sec.register_group("group1", "Group 1", &[]).unwrap();
        assert!(!sec.is_allowed(2, "User", "Create", None));

        sec.add_membership(2, "group1").unwrap();
        sec.allow_group("User", "Create", "group1", None);
        assert!(sec.is_allowed(2, "User", "Create", None));

        sec.revoke_group("User", "Create", "group1");
        assert!(!sec.is_allowed(2, "User", "Create", None));
    }

    #[test]
    fn delegated_grant_requires_caller() {
        let sec = SecurityRegistry::new();
        sec.allow_group("Resume", "Create", GROUP_EVERYONE, Some(("User", "Create")));
        assert!(!sec.is_allowed(5, "Resume", "Create", None));
        assert!(!sec.is_allowed(5, "Resume", "Create", Some(("User", "Write"))));
        assert!(sec.is_allowed(5, "Resume", "Create", Some(("User", "Create"))));
    }

    #[test]
    fn implied_groups_are_expanded() {
        let sec = SecurityRegistry::new();
        sec.register_group("base", "Base", &[]).unwrap();
        sec.register_group("manager", "Manager", &["base"]).unwrap();
        sec.add_membership(3, "manager").unwrap();
        let groups = sec.user_groups(3);
        assert!(groups.contains("base"));
        assert!(groups.contains(GROUP_EVERYONE));
        assert!(!groups.contains(GROUP_ADMIN));

        let err = sec.register_group("base", "Base", &["manager"]).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn unregister_drops_grants() {
        let sec = SecurityRegistry::new();
        sec.register_group("tmp", "Tmp", &[]).unwrap();
        sec.add_membership(4, "tmp").unwrap();
        sec.allow_group("Post", "Write", "tmp", None);
        sec.unregister_group("tmp").unwrap();
        assert!(!sec.is_allowed(4, "Post", "Write", None));
        assert!(sec.unregister_group(GROUP_EVERYONE).is_err());
    }

    #[test]
    fn rule_filter_combination() {
        let sec = SecurityRegistry::new();
        sec.register_group("g1", "G1", &[]).unwrap();
        sec.register_group("g2", "G2", &[]).unwrap();
        sec.add_membership(2, "g1").unwrap();
        sec.add_membership(2, "g2").unwrap();

        assert!(sec.rule_filter(2, "User", Permission::READ).is_none());

        let a = Condition::field("Email").not_equals("jane.smith@example.com");
        let b = Condition::field("Name").equals("Will");
        sec.add_record_rule("User", RecordRule::new("a", "g1", a.clone(), Permission::READ));
        sec.add_record_rule("User", RecordRule::new("b", "g2", b.clone(), Permission::ALL));
        assert_eq!(
            sec.rule_filter(2, "User", Permission::READ),
            Some(Condition::Or(vec![a.clone(), b.clone()]))
        );
        assert_eq!(sec.rule_filter(2, "User", Permission::WRITE), Some(b.clone()));
        assert!(sec.rule_filter(7, "User", Permission::READ).is_none());

        let g = Condition::field("IsActive").equals(true);
        sec.add_record_rule("User", RecordRule::global("active", g.clone(), Permission::READ));
        assert_eq!(
            sec.rule_filter(7, "User", Permission::READ),
            Some(g.clone())
        );

        sec.remove_record_rule("User", "a");
        sec.remove_record_rule("User", "active");
        assert_eq!(sec.rule_filter(2, "User", Permission::READ), Some(b));
    }
}
