//! The reconcilers and the plumbing they share.

pub mod anchor;
pub mod hierarchy;
pub mod object;
pub mod typeconfig;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use kube::Client;

use crate::api::TypeKey;
use crate::forest::SharedForest;
use crate::settings::Settings;
use crate::workqueue::WorkQueue;
use self::object::ObjectReconciler;

/// Key of a namespaced record on a work queue.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

impl NamespacedName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        NamespacedName {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// State shared by every reconciler: the store client, the forest, the
/// queues they enqueue each other through, and the per-kind reconcilers.
pub struct Context {
    pub client: Client,
    pub forest: SharedForest,
    pub excluded: HashSet<String>,
    pub workers: usize,
    pub service_account: String,
    pub hierarchy_queue: Arc<WorkQueue<String>>,
    pub anchor_queue: Arc<WorkQueue<NamespacedName>>,
    pub config_queue: Arc<WorkQueue<String>>,
    pub types: TypeRegistry,
}

impl Context {
    pub fn new(client: Client, forest: SharedForest, settings: &Settings) -> Arc<Self> {
        Arc::new(Context {
            client,
            forest,
            excluded: settings.excluded(),
            workers: settings.max_concurrent_reconciles,
            service_account: settings.service_account.clone(),
            hierarchy_queue: WorkQueue::new("hierarchy"),
            anchor_queue: WorkQueue::new("anchors"),
            config_queue: WorkQueue::new("configuration"),
            types: TypeRegistry::default(),
        })
    }

    pub fn is_excluded(&self, namespace: &str) -> bool {
        self.excluded.contains(namespace)
    }
}

/// The set of per-kind object reconcilers currently constructed. Entries are
/// never removed; a retired type's reconciler is switched to `Ignore` and
/// kept around with its bookkeeping.
#[derive(Clone, Default)]
pub struct TypeRegistry {
    inner: Arc<Mutex<HashMap<TypeKey, Arc<ObjectReconciler>>>>,
}

impl TypeRegistry {
    pub fn get(&self, key: &TypeKey) -> Option<Arc<ObjectReconciler>> {
        self.inner.lock().unwrap().get(key).cloned()
    }

    pub fn insert(&self, key: TypeKey, reconciler: Arc<ObjectReconciler>) {
        self.inner.lock().unwrap().insert(key, reconciler);
    }

    pub fn all(&self) -> Vec<(TypeKey, Arc<ObjectReconciler>)> {
        let mut out: Vec<_> = self
            .inner
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();
        out.sort_by(|(a, _), (b, _)| a.cmp(b));
        out
    }

    /// Asks every active kind to resync one namespace; called by the
    /// hierarchy reconciler after structural changes, outside the forest
    /// lock.
    pub fn sync_namespace(&self, namespace: &str) {
        for (_, reconciler) in self.all() {
            reconciler.sync_namespace(namespace);
        }
    }
}
