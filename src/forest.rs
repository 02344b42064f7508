//! The in-memory forest of namespaces.
//!
//! Every reconciler and validator reads and writes the same forest under one
//! exclusive lock. The forest is never persisted; it is rebuilt from the
//! store on startup, so everything here is plain data. Parent links are kept
//! as names rather than references and every walk carries a visited set, so
//! transiently-created cycles degrade into conditions instead of hangs.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::api::{Code, Condition, TypeKey};

pub type SharedForest = Arc<Mutex<Forest>>;

pub fn shared() -> SharedForest {
    Arc::new(Mutex::new(Forest::default()))
}

/// A source object held by a namespace, reduced to the content its copies
/// must carry. `body` is the cleaned object; the writer fills in the target
/// namespace and the provenance label.
#[derive(Clone, Debug, PartialEq)]
pub struct SourceObject {
    pub name: String,
    pub body: serde_json::Value,
    /// False when the source carries finalizers or belongs to a class that
    /// is never propagated; copies are withheld.
    pub can_propagate: bool,
}

#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
struct LocalCondition {
    code: Code,
    message: String,
}

/// One namespace as the forest sees it. Nodes are created lazily on first
/// reference, possibly before the namespace exists in the store.
#[derive(Debug, Default)]
pub struct Namespace {
    parent: Option<String>,
    children: BTreeSet<String>,
    pub exists: bool,
    /// Value of the subnamespace-of annotation; `Some` makes this a
    /// subnamespace whose lifecycle is owned by an anchor in that parent.
    pub owner: Option<String>,
    pub allow_cascading_delete: bool,
    pub deleting: bool,
    conditions: BTreeMap<String, BTreeSet<LocalCondition>>,
    source_objects: HashMap<TypeKey, BTreeMap<String, SourceObject>>,
    anchors: BTreeSet<String>,
}

impl Namespace {
    fn is_discardable(&self) -> bool {
        !self.exists
            && self.parent.is_none()
            && self.children.is_empty()
            && self.conditions.is_empty()
            && self.source_objects.is_empty()
            && self.anchors.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct Forest {
    namespaces: HashMap<String, Namespace>,
}

/// Serializable view of one node, exposed on the debug endpoint.
#[derive(Clone, Debug, Serialize)]
pub struct NamespaceSummary {
    pub name: String,
    pub parent: Option<String>,
    pub children: Vec<String>,
    pub exists: bool,
    pub owner: Option<String>,
    pub conditions: Vec<Condition>,
}

impl Forest {
    fn ensure(&mut self, name: &str) -> &mut Namespace {
        self.namespaces.entry(name.to_string()).or_default()
    }

    /// Drops the node again if nothing references it anymore.
    fn collect(&mut self, name: &str) {
        if self.namespaces.get(name).is_some_and(Namespace::is_discardable) {
            self.namespaces.remove(name);
        }
    }

    pub fn node(&self, name: &str) -> Option<&Namespace> {
        self.namespaces.get(name)
    }

    pub fn node_mut(&mut self, name: &str) -> &mut Namespace {
        self.ensure(name)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.namespaces.get(name).is_some_and(|n| n.exists)
    }

    pub fn set_exists(&mut self, name: &str, exists: bool) {
        self.ensure(name).exists = exists;
        if !exists {
            self.collect(name);
        }
    }

    pub fn namespace_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.namespaces.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn parent(&self, name: &str) -> Option<String> {
        self.namespaces.get(name).and_then(|n| n.parent.clone())
    }

    pub fn children(&self, name: &str) -> Vec<String> {
        self.namespaces
            .get(name)
            .map(|n| n.children.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Updates the parent link and the derived child sets. Cycles are not
    /// rejected here; callers check `can_set_parent` first and fall back to
    /// `cycle_names` when the store forced an illegal state on us.
    pub fn set_parent(&mut self, name: &str, parent: Option<&str>) {
        let old = self.ensure(name).parent.take();
        if let Some(old) = old.as_deref() {
            self.ensure(old).children.remove(name);
            self.collect(old);
        }
        self.ensure(name).parent = parent.map(str::to_string);
        if let Some(parent) = parent {
            self.ensure(parent).children.insert(name.to_string());
        }
        self.collect(name);
    }

    /// `None` when the assignment is legal, otherwise the reason it is not.
    /// O(depth of the proposed parent).
    pub fn can_set_parent(&self, name: &str, parent: Option<&str>) -> Option<String> {
        let parent = parent?;
        if parent == name {
            return Some(format!("\"{name}\" cannot be its own parent"));
        }
        let ancestors = self.ancestry_names(parent, None);
        if ancestors.iter().any(|a| a == name) {
            return Some(format!(
                "\"{}\" is already an ancestor of \"{}\" ({})",
                name,
                parent,
                ancestors.join(" -> ")
            ));
        }
        None
    }

    /// The chain from the root (or `to`, if given) down to `name`, ending at
    /// `name`. Cycle-safe: when the walk revisits a namespace the repeated
    /// name shows up twice, once of them at the head of the list.
    pub fn ancestry_names(&self, name: &str, to: Option<&str>) -> Vec<String> {
        let mut path: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut current = name.to_string();
        loop {
            let repeated = !seen.insert(current.clone());
            path.push(current.clone());
            if repeated || Some(current.as_str()) == to {
                break;
            }
            match self.namespaces.get(&current).and_then(|n| n.parent.clone()) {
                Some(parent) => current = parent,
                None => break,
            }
        }
        path.reverse();
        path
    }

    /// The cycle `name` belongs to, rotated so the lexicographically
    /// smallest member appears first and last. Empty when `name` is not in
    /// a cycle, even if one exists further up its ancestry.
    pub fn cycle_names(&self, name: &str) -> Vec<String> {
        let mut members = vec![name.to_string()];
        let mut current = name.to_string();
        loop {
            match self.namespaces.get(&current).and_then(|n| n.parent.clone()) {
                Some(parent) if parent == name => break,
                Some(parent) => {
                    if members.contains(&parent) {
                        return Vec::new();
                    }
                    members.push(parent.clone());
                    current = parent;
                }
                None => return Vec::new(),
            }
        }
        let smallest = members
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| a.cmp(b))
            .map(|(i, _)| i)
            .unwrap_or(0);
        members.rotate_left(smallest);
        members.push(members[0].clone());
        members
    }

    /// All proper descendants, alphabetically sorted, each listed once even
    /// when cycles are present.
    pub fn descendant_names(&self, name: &str) -> Vec<String> {
        let mut found: BTreeSet<String> = BTreeSet::new();
        let mut queue: Vec<String> = self.children(name);
        while let Some(next) = queue.pop() {
            if next != name && found.insert(next.clone()) {
                queue.extend(self.children(&next));
            }
        }
        found.into_iter().collect()
    }

    /// Whether `ancestor` is a strict ancestor of `name`. Callers must have
    /// ruled cycles out; the walk still terminates if they have not.
    pub fn is_ancestor(&self, ancestor: &str, name: &str) -> bool {
        let mut seen: HashSet<String> = HashSet::new();
        let mut current = name.to_string();
        while let Some(parent) = self.namespaces.get(&current).and_then(|n| n.parent.clone()) {
            if parent == ancestor {
                return true;
            }
            if !seen.insert(parent.clone()) {
                return false;
            }
            current = parent;
        }
        false
    }

    /// Most-recent common ancestor of `a` and `b` over the currently
    /// existing ancestry; namespaces the store has never shown us are
    /// skipped, since nobody can be authorized on them.
    pub fn mrca(&self, a: &str, b: &str) -> Option<String> {
        let chain_a: Vec<String> = self
            .ancestry_names(a, None)
            .into_iter()
            .filter(|n| self.exists(n))
            .collect();
        let chain_b: Vec<String> = self
            .ancestry_names(b, None)
            .into_iter()
            .filter(|n| self.exists(n))
            .collect();
        chain_a
            .iter()
            .zip(chain_b.iter())
            .take_while(|(x, y)| x == y)
            .last()
            .map(|(x, _)| x.clone())
    }

    // ---- conditions ----

    /// Records a condition keyed by the affected object (empty key means the
    /// namespace itself). Returns whether anything changed, so callers know
    /// to enqueue dependents.
    pub fn set_condition(
        &mut self,
        name: &str,
        affected: &str,
        code: Code,
        message: impl Into<String>,
    ) -> bool {
        self.ensure(name)
            .conditions
            .entry(affected.to_string())
            .or_default()
            .insert(LocalCondition {
                code,
                message: message.into(),
            })
    }

    /// Clears conditions for one affected object, or all of them when
    /// `affected` is empty. Returns whether anything was cleared.
    pub fn clear_conditions(&mut self, name: &str, affected: &str) -> bool {
        let Some(node) = self.namespaces.get_mut(name) else {
            return false;
        };
        let changed = if affected.is_empty() {
            let had = !node.conditions.is_empty();
            node.conditions.clear();
            had
        } else {
            node.conditions.remove(affected).is_some()
        };
        self.collect(name);
        changed
    }

    /// All conditions of one namespace, grouped per code with the affected
    /// objects folded in, in a stable order.
    pub fn conditions(&self, name: &str) -> Vec<Condition> {
        let Some(node) = self.namespaces.get(name) else {
            return Vec::new();
        };
        let mut grouped: BTreeMap<(Code, String), Vec<String>> = BTreeMap::new();
        for (affected, conds) in &node.conditions {
            for cond in conds {
                let affects = grouped
                    .entry((cond.code, cond.message.clone()))
                    .or_default();
                if !affected.is_empty() {
                    affects.push(affected.clone());
                }
            }
        }
        grouped
            .into_iter()
            .map(|((code, message), affects)| Condition {
                code,
                message,
                affects,
            })
            .collect()
    }

    pub fn has_local_crit(&self, name: &str) -> bool {
        self.namespaces.get(name).is_some_and(|n| {
            n.conditions
                .values()
                .flatten()
                .any(|c| c.code.is_critical())
        })
    }

    /// True when this namespace or any strict ancestor carries a critical
    /// condition; propagation halts in the whole subtree underneath.
    pub fn has_crit(&self, name: &str) -> bool {
        self.ancestry_names(name, None)
            .iter()
            .any(|n| self.has_local_crit(n))
    }

    /// Aggregated view for the configuration singleton status: code to the
    /// sorted list of namespaces carrying it.
    pub fn conditions_by_code(&self) -> BTreeMap<Code, Vec<String>> {
        let mut out: BTreeMap<Code, BTreeSet<String>> = BTreeMap::new();
        for (name, node) in &self.namespaces {
            for cond in node.conditions.values().flatten() {
                out.entry(cond.code).or_default().insert(name.clone());
            }
        }
        out.into_iter()
            .map(|(code, names)| (code, names.into_iter().collect()))
            .collect()
    }

    // ---- source object caches ----

    /// Refreshes one cached source. Returns whether the content changed,
    /// which is the signal to resync the whole subtree.
    pub fn set_source_object(&mut self, ns: &str, type_key: &TypeKey, obj: SourceObject) -> bool {
        let sources = self
            .ensure(ns)
            .source_objects
            .entry(type_key.clone())
            .or_default();
        if sources.get(&obj.name) == Some(&obj) {
            return false;
        }
        sources.insert(obj.name.clone(), obj);
        true
    }

    pub fn remove_source_object(&mut self, ns: &str, type_key: &TypeKey, name: &str) -> bool {
        let removed = self
            .namespaces
            .get_mut(ns)
            .and_then(|n| n.source_objects.get_mut(type_key))
            .and_then(|sources| sources.remove(name))
            .is_some();
        if let Some(node) = self.namespaces.get_mut(ns) {
            node.source_objects.retain(|_, sources| !sources.is_empty());
        }
        self.collect(ns);
        removed
    }

    /// Drops every cached source of one kind, cluster-wide. Used when a type
    /// is retired.
    pub fn clear_source_objects(&mut self, type_key: &TypeKey) {
        let names: Vec<String> = self.namespaces.keys().cloned().collect();
        for name in names {
            if let Some(node) = self.namespaces.get_mut(&name) {
                node.source_objects.remove(type_key);
            }
            self.collect(&name);
        }
    }

    pub fn source_object(&self, ns: &str, type_key: &TypeKey, name: &str) -> Option<&SourceObject> {
        self.namespaces
            .get(ns)?
            .source_objects
            .get(type_key)?
            .get(name)
    }

    pub fn source_names(&self, ns: &str, type_key: &TypeKey) -> Vec<String> {
        self.namespaces
            .get(ns)
            .and_then(|n| n.source_objects.get(type_key))
            .map(|sources| sources.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn num_source_objects(&self, type_key: &TypeKey) -> usize {
        self.namespaces
            .values()
            .filter_map(|n| n.source_objects.get(type_key))
            .map(BTreeMap::len)
            .sum()
    }

    /// The nearest strict ancestor holding a source of this kind and name.
    /// Ties cannot happen: the walk stops at the first hit.
    pub fn ancestor_source(
        &self,
        ns: &str,
        type_key: &TypeKey,
        name: &str,
    ) -> Option<(String, &SourceObject)> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut current = self.parent(ns)?;
        loop {
            if let Some(obj) = self.source_object(&current, type_key, name) {
                return Some((current, obj));
            }
            if !seen.insert(current.clone()) {
                return None;
            }
            current = self.parent(&current)?;
        }
    }

    /// Every source of this kind that should project into `ns`, keyed by
    /// object name with the nearest ancestor winning.
    pub fn ancestor_sources(&self, ns: &str, type_key: &TypeKey) -> Vec<(String, SourceObject)> {
        let mut out: BTreeMap<String, (String, SourceObject)> = BTreeMap::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut current = self.parent(ns);
        while let Some(ancestor) = current {
            if !seen.insert(ancestor.clone()) {
                break;
            }
            if let Some(sources) = self
                .namespaces
                .get(&ancestor)
                .and_then(|n| n.source_objects.get(type_key))
            {
                for (name, obj) in sources {
                    out.entry(name.clone())
                        .or_insert_with(|| (ancestor.clone(), obj.clone()));
                }
            }
            current = self.parent(&ancestor);
        }
        out.into_values().collect()
    }

    // ---- anchors ----

    /// Replaces the set of anchors known to live in `ns`, returning which
    /// ones appeared and which disappeared so they can be enqueued.
    pub fn set_anchors(&mut self, ns: &str, anchors: BTreeSet<String>) -> (Vec<String>, Vec<String>) {
        let node = self.ensure(ns);
        let appeared = anchors.difference(&node.anchors).cloned().collect();
        let disappeared = node.anchors.difference(&anchors).cloned().collect();
        node.anchors = anchors;
        self.collect(ns);
        (appeared, disappeared)
    }

    pub fn anchors(&self, ns: &str) -> Vec<String> {
        self.namespaces
            .get(ns)
            .map(|n| n.anchors.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_anchors(&self, ns: &str) -> bool {
        self.namespaces.get(ns).is_some_and(|n| !n.anchors.is_empty())
    }

    // ---- debug surface ----

    pub fn snapshot(&self) -> Vec<NamespaceSummary> {
        let mut out: Vec<NamespaceSummary> = self
            .namespaces
            .iter()
            .map(|(name, node)| NamespaceSummary {
                name: name.clone(),
                parent: node.parent.clone(),
                children: node.children.iter().cloned().collect(),
                exists: node.exists,
                owner: node.owner.clone(),
                conditions: self.conditions(name),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}
