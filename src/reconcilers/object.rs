//! Propagates one kind of object down the tree.
//!
//! Each instance owns a dynamic watcher, a queue and a worker pool for a
//! single (apiVersion, kind) pair. The type-configuration reconciler
//! constructs instances and retunes their mode; a retired instance is
//! switched to `Ignore` and stays inert rather than being torn down.

use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use futures::StreamExt;
use kube::api::{ApiResource, DeleteParams, DynamicObject, Patch, PatchParams};
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Client, ResourceExt};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::{Code, SyncMode, TypeKey};
use crate::error::{Error, Result};
use crate::forest::{Forest, SharedForest, SourceObject};
use crate::metadata::{INHERITED_FROM, SA_TOKEN_SECRET};
use crate::reconcilers::NamespacedName;
use crate::workqueue::{WorkQueue, spawn_workers};

/// Field manager for server-side applies of propagated copies.
const FIELD_MANAGER: &str = "arbor";

pub struct ObjectReconciler {
    type_key: TypeKey,
    resource: ApiResource,
    client: Client,
    forest: SharedForest,
    excluded: HashSet<String>,
    mode: RwLock<SyncMode>,
    queue: Arc<WorkQueue<NamespacedName>>,
    propagated: Mutex<BTreeSet<NamespacedName>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// What the store told us about one object, precomputed outside the forest
/// lock.
pub(crate) struct Observed {
    inherited_from: Option<String>,
    body: Value,
    can_propagate: bool,
    cannot_reason: String,
}

/// The store write chosen under the lock.
#[derive(Debug, PartialEq)]
pub(crate) enum Action {
    Nop,
    Write { src_ns: String, body: Value },
    Remove,
}

impl ObjectReconciler {
    /// Builds the reconciler and starts its watcher and workers. The caller
    /// sets the initial mode afterwards, which triggers the first full sync.
    pub fn start(
        type_key: TypeKey,
        resource: ApiResource,
        client: Client,
        forest: SharedForest,
        excluded: HashSet<String>,
        workers: usize,
    ) -> Arc<Self> {
        let queue: Arc<WorkQueue<NamespacedName>> = WorkQueue::new("objects");
        let reconciler = Arc::new(ObjectReconciler {
            type_key,
            resource,
            client,
            forest,
            excluded,
            mode: RwLock::new(SyncMode::Ignore),
            queue: Arc::clone(&queue),
            propagated: Mutex::new(BTreeSet::new()),
            tasks: Mutex::new(Vec::new()),
        });

        let mut tasks = Vec::new();
        {
            let api: Api<DynamicObject> =
                Api::all_with(reconciler.client.clone(), &reconciler.resource);
            let queue = Arc::clone(&queue);
            let type_key = reconciler.type_key.clone();
            tasks.push(tokio::spawn(async move {
                watcher(api, watcher::Config::default())
                    .default_backoff()
                    .touched_objects()
                    .for_each(|event| {
                        let queue = &queue;
                        let type_key = &type_key;
                        async move {
                            match event {
                                Ok(obj) => {
                                    if let Some(ns) = obj.namespace() {
                                        queue.add(NamespacedName::new(ns, obj.name_any()));
                                    }
                                }
                                Err(err) => {
                                    warn!(%type_key, %err, "object watch error")
                                }
                            }
                        }
                    })
                    .await;
            }));
        }
        {
            let handler_rec = Arc::clone(&reconciler);
            tasks.extend(spawn_workers(queue, workers, move |key: NamespacedName| {
                let rec = Arc::clone(&handler_rec);
                async move { rec.reconcile(&key).await }
            }));
        }
        *reconciler.tasks.lock().unwrap() = tasks;
        reconciler
    }

    pub fn type_key(&self) -> &TypeKey {
        &self.type_key
    }

    pub fn mode(&self) -> SyncMode {
        *self.mode.read().unwrap()
    }

    pub fn num_propagated_objects(&self) -> usize {
        self.propagated.lock().unwrap().len()
    }

    /// Retunes the mode. Entering `Remove` sweeps the copies this instance
    /// knows it wrote; entering `Propagate` re-reads the world, sources
    /// first so the caches are warm before copies are judged.
    pub async fn set_mode(&self, mode: SyncMode) -> Result<()> {
        let previous = {
            let mut current = self.mode.write().unwrap();
            std::mem::replace(&mut *current, mode)
        };
        if previous == mode {
            return Ok(());
        }
        info!(type_key = %self.type_key, from = %previous, to = %mode, "sync mode changed");
        match mode {
            SyncMode::Ignore => {
                let mut forest = self.forest.lock().unwrap();
                forest.clear_source_objects(&self.type_key);
            }
            SyncMode::Remove => {
                {
                    let mut forest = self.forest.lock().unwrap();
                    forest.clear_source_objects(&self.type_key);
                }
                for key in self.propagated.lock().unwrap().iter() {
                    self.queue.add(key.clone());
                }
            }
            SyncMode::Propagate => self.resync_all().await?,
        }
        Ok(())
    }

    /// Lists every object of this kind and enqueues sources before copies.
    async fn resync_all(&self) -> Result<()> {
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &self.resource);
        let listed = api.list(&Default::default()).await?;
        let (copies, sources): (Vec<_>, Vec<_>) = listed
            .items
            .into_iter()
            .filter(|o| o.namespace().is_some())
            .partition(|o| o.labels().contains_key(INHERITED_FROM));
        for obj in sources.into_iter().chain(copies) {
            let ns = obj.namespace().unwrap_or_default();
            self.queue.add(NamespacedName::new(ns, obj.name_any()));
        }
        Ok(())
    }

    /// Enqueues everything in one namespace that this kind may need to add,
    /// update or remove there. Called after structural changes.
    pub fn sync_namespace(&self, namespace: &str) {
        if self.mode() == SyncMode::Ignore || self.excluded.contains(namespace) {
            return;
        }
        let mut keys: BTreeSet<NamespacedName> = BTreeSet::new();
        {
            let forest = self.forest.lock().unwrap();
            for name in forest.source_names(namespace, &self.type_key) {
                keys.insert(NamespacedName::new(namespace, name));
            }
            for (_, source) in forest.ancestor_sources(namespace, &self.type_key) {
                keys.insert(NamespacedName::new(namespace, source.name));
            }
        }
        for key in self.propagated.lock().unwrap().iter() {
            if key.namespace == namespace {
                keys.insert(key.clone());
            }
        }
        for key in keys {
            self.queue.add(key);
        }
    }

    pub async fn reconcile(&self, key: &NamespacedName) -> Result<()> {
        let mode = self.mode();
        if mode == SyncMode::Ignore || self.excluded.contains(&key.namespace) {
            return Ok(());
        }
        debug!(type_key = %self.type_key, %key, "reconciling object");

        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), &key.namespace, &self.resource);
        let obj = api.get_opt(&key.name).await?;

        if mode == SyncMode::Remove {
            if obj.as_ref().is_some_and(|o| o.labels().contains_key(INHERITED_FROM)) {
                self.delete_copy(&api, key).await?;
            }
            return Ok(());
        }

        let observed = obj.map(|o| observe(&o, &self.type_key)).transpose()?;
        let (action, resync) = {
            let mut forest = self.forest.lock().unwrap();
            decide(&mut forest, &self.type_key, key, observed.as_ref())
        };

        match action {
            Action::Nop => {}
            Action::Write { src_ns, body } => self.write_copy(&api, key, &src_ns, body).await?,
            Action::Remove => self.delete_copy(&api, key).await?,
        }
        for key in resync {
            self.queue.add(key);
        }
        Ok(())
    }

    async fn write_copy(
        &self,
        api: &Api<DynamicObject>,
        key: &NamespacedName,
        src_ns: &str,
        body: Value,
    ) -> Result<()> {
        let desired = copy_for(&body, &key.namespace, src_ns)?;
        let params = PatchParams::apply(FIELD_MANAGER).force();
        match api.patch(&key.name, &params, &Patch::Apply(&desired)).await {
            Ok(_) => {
                debug!(type_key = %self.type_key, %key, source = src_ns, "propagated");
                self.propagated.lock().unwrap().insert(key.clone());
                Ok(())
            }
            Err(err) => {
                self.note_write_failure(key, &err);
                Err(err.into())
            }
        }
    }

    async fn delete_copy(&self, api: &Api<DynamicObject>, key: &NamespacedName) -> Result<()> {
        match api.delete(&key.name, &DeleteParams::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(ref ae)) if ae.code == 404 => {}
            Err(err) => {
                self.note_write_failure(key, &err);
                return Err(err.into());
            }
        }
        self.propagated.lock().unwrap().remove(key);
        Ok(())
    }

    fn note_write_failure(&self, key: &NamespacedName, err: &kube::Error) {
        let mut forest = self.forest.lock().unwrap();
        forest.set_condition(
            &key.namespace,
            &key.name,
            Code::CannotUpdate,
            format!("could not update propagated copy: {err}"),
        );
    }

    pub fn shutdown(&self) {
        self.queue.shutdown();
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

/// Reduces a store object to the parts the propagation contract cares
/// about. Pure; runs outside the forest lock.
pub(crate) fn observe(obj: &DynamicObject, type_key: &TypeKey) -> Result<Observed> {
    let inherited_from = obj.labels().get(INHERITED_FROM).cloned();
    let has_finalizers = !obj.finalizers().is_empty();
    let sa_token = type_key.kind == "Secret"
        && obj.data.get("type").and_then(Value::as_str) == Some(SA_TOKEN_SECRET);
    let (can_propagate, cannot_reason) = if has_finalizers {
        (false, "the object has finalizers".to_string())
    } else if sa_token {
        (false, "service account token secrets are never propagated".to_string())
    } else {
        (true, String::new())
    };
    Ok(Observed {
        inherited_from,
        body: clean(obj)?,
        can_propagate,
        cannot_reason,
    })
}

/// The decision table for one object, run under the forest lock.
pub(crate) fn decide(
    forest: &mut Forest,
    type_key: &TypeKey,
    key: &NamespacedName,
    observed: Option<&Observed>,
) -> (Action, Vec<NamespacedName>) {
    let ns = key.namespace.as_str();
    let name = key.name.as_str();
    if forest.has_crit(ns) {
        // Left alone until the condition clears; the hierarchy reconciler
        // requests a resync then.
        return (Action::Nop, Vec::new());
    }

    let descendant_keys = |forest: &Forest| {
        forest
            .descendant_names(ns)
            .into_iter()
            .map(|d| NamespacedName::new(d, name))
            .collect::<Vec<_>>()
    };

    match observed {
        // A source living here.
        Some(obs) if obs.inherited_from.is_none() => {
            if obs.can_propagate {
                forest.clear_conditions(ns, name);
            } else {
                forest.set_condition(ns, name, Code::CannotPropagate, obs.cannot_reason.clone());
            }
            let changed = forest.set_source_object(
                ns,
                type_key,
                SourceObject {
                    name: name.to_string(),
                    body: obs.body.clone(),
                    can_propagate: obs.can_propagate,
                },
            );
            let resync = if changed {
                descendant_keys(forest)
            } else {
                Vec::new()
            };
            (Action::Nop, resync)
        }
        // A propagated copy; keep it aligned with the nearest source.
        Some(obs) => {
            match forest.ancestor_source(ns, type_key, name) {
                None => (Action::Remove, Vec::new()),
                Some((_, source)) if !source.can_propagate => (Action::Remove, Vec::new()),
                Some((src_ns, source)) => {
                    let aligned =
                        obs.inherited_from.as_deref() == Some(src_ns.as_str())
                            && obs.body == source.body;
                    if aligned {
                        (Action::Nop, Vec::new())
                    } else {
                        let body = source.body.clone();
                        (Action::Write { src_ns, body }, Vec::new())
                    }
                }
            }
        }
        // Nothing in the store.
        None => {
            let was_source = forest.remove_source_object(ns, type_key, name);
            forest.clear_conditions(ns, name);
            if was_source {
                (Action::Nop, descendant_keys(forest))
            } else {
                match forest.ancestor_source(ns, type_key, name) {
                    Some((src_ns, source)) if source.can_propagate => {
                        let body = source.body.clone();
                        (Action::Write { src_ns, body }, Vec::new())
                    }
                    _ => (Action::Nop, Vec::new()),
                }
            }
        }
    }
}

/// Strips server-populated metadata so sources and copies compare equal
/// when, and only when, they agree on content.
fn clean(obj: &DynamicObject) -> Result<Value> {
    let mut value = serde_json::to_value(obj)?;
    if let Some(meta) = value.get_mut("metadata").and_then(Value::as_object_mut) {
        for field in [
            "uid",
            "resourceVersion",
            "generation",
            "creationTimestamp",
            "deletionTimestamp",
            "deletionGracePeriodSeconds",
            "managedFields",
            "ownerReferences",
            "selfLink",
            "namespace",
            "finalizers",
        ] {
            meta.remove(field);
        }
        if let Some(labels) = meta.get_mut("labels").and_then(Value::as_object_mut) {
            labels.remove(INHERITED_FROM);
            if labels.is_empty() {
                meta.remove("labels");
            }
        }
    }
    if let Some(root) = value.as_object_mut() {
        root.remove("status");
    }
    Ok(value)
}

/// Builds the copy to write into `namespace`, marked as inherited from
/// `src_ns`.
fn copy_for(body: &Value, namespace: &str, src_ns: &str) -> Result<DynamicObject> {
    let mut value = body.clone();
    let meta = value
        .as_object_mut()
        .and_then(|root| root.get_mut("metadata"))
        .and_then(Value::as_object_mut);
    if let Some(meta) = meta {
        meta.insert("namespace".to_string(), Value::String(namespace.to_string()));
        let labels = meta
            .entry("labels")
            .or_insert_with(|| Value::Object(Default::default()));
        if let Some(labels) = labels.as_object_mut() {
            labels.insert(
                INHERITED_FROM.to_string(),
                Value::String(src_ns.to_string()),
            );
        }
    }
    Ok(serde_json::from_value(value)?)
}
