//! Keeps the forest aligned with one namespace's hierarchy record, and the
//! record aligned with the forest.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use k8s_openapi::api::core::v1::Namespace;
use kube::api::{ListParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::{Api, ResourceExt};
use serde_json::json;
use tracing::{debug, info};

use crate::api::{
    Code, HierarchyConfiguration, HierarchyConfigurationSpec, HierarchyConfigurationStatus,
    SubnamespaceAnchor,
};
use crate::error::Result;
use crate::metadata::{
    ANCHORS_PRESENT_FINALIZER, HIERARCHY_SINGLETON, SUBNAMESPACE_OF, depth_label, is_depth_label,
};
use crate::reconcilers::{Context, NamespacedName};

pub struct HierarchyReconciler {
    ctx: Arc<Context>,
}

/// Everything decided under the forest lock, applied to the store after it
/// is released.
#[derive(Debug, Default)]
struct Outcome {
    create_record: bool,
    spec: HierarchyConfigurationSpec,
    spec_changed: bool,
    status: HierarchyConfigurationStatus,
    status_changed: bool,
    finalizers: Vec<String>,
    finalizers_changed: bool,
    /// Depth-label edits for the namespace record; `None` values remove.
    label_ops: BTreeMap<String, Option<String>>,
    enqueue: BTreeSet<String>,
    anchors_appeared: Vec<String>,
    anchors_disappeared: Vec<String>,
}

impl HierarchyReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        HierarchyReconciler { ctx }
    }

    pub async fn reconcile(&self, name: &str) -> Result<()> {
        if self.ctx.is_excluded(name) {
            return Ok(());
        }
        debug!(namespace = name, "reconciling hierarchy");

        let ns_api: Api<Namespace> = Api::all(self.ctx.client.clone());
        let Some(ns) = ns_api.get_opt(name).await? else {
            self.on_namespace_gone(name);
            return Ok(());
        };
        let terminating = ns.metadata.deletion_timestamp.is_some();

        let hc_api: Api<HierarchyConfiguration> =
            Api::namespaced(self.ctx.client.clone(), name);
        let record = hc_api.get_opt(HIERARCHY_SINGLETON).await?;

        let anchor_api: Api<SubnamespaceAnchor> = Api::namespaced(self.ctx.client.clone(), name);
        let anchors: BTreeSet<String> = anchor_api
            .list(&ListParams::default())
            .await?
            .items
            .iter()
            .map(ResourceExt::name_any)
            .collect();

        let owner = ns
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(SUBNAMESPACE_OF))
            .cloned();
        let ns_labels = ns.metadata.labels.clone().unwrap_or_default();

        let outcome = self.update_forest(name, &record, anchors, owner, terminating, &ns_labels);

        if !terminating {
            self.write_record(&hc_api, name, &record, &outcome).await?;
            self.write_namespace_labels(&ns_api, name, &outcome).await?;
        }

        for relative in &outcome.enqueue {
            self.ctx.hierarchy_queue.add(relative.clone());
        }
        for anchor in outcome
            .anchors_appeared
            .iter()
            .chain(&outcome.anchors_disappeared)
        {
            self.ctx
                .anchor_queue
                .add(NamespacedName::new(name, anchor.clone()));
        }
        if !terminating {
            self.ctx.types.sync_namespace(name);
        }
        Ok(())
    }

    /// The namespace is no longer in the store: keep the node only as far as
    /// relatives still reference it, and let them react.
    fn on_namespace_gone(&self, name: &str) {
        let relatives = {
            let mut forest = self.ctx.forest.lock().unwrap();
            let mut relatives = forest.descendant_names(name);
            if let Some(parent) = forest.parent(name) {
                relatives.push(parent);
            }
            forest.clear_conditions(name, "");
            forest.set_anchors(name, BTreeSet::new());
            let node = forest.node_mut(name);
            node.owner = None;
            node.deleting = false;
            forest.set_exists(name, false);
            relatives
        };
        info!(namespace = name, "namespace gone, notifying relatives");
        for relative in relatives {
            self.ctx.hierarchy_queue.add(relative);
        }
    }

    /// The in-memory phase. Holds the forest lock and does no I/O.
    fn update_forest(
        &self,
        name: &str,
        record: &Option<HierarchyConfiguration>,
        anchors: BTreeSet<String>,
        owner: Option<String>,
        terminating: bool,
        ns_labels: &BTreeMap<String, String>,
    ) -> Outcome {
        let mut out = Outcome::default();
        let mut forest = self.ctx.forest.lock().unwrap();

        let was_existing = forest.exists(name);
        let had_crit = forest.has_crit(name);
        forest.clear_conditions(name, "");

        let observed_spec = record
            .as_ref()
            .map(|r| r.spec.clone())
            .unwrap_or_default();
        {
            let node = forest.node_mut(name);
            node.exists = true;
            node.deleting = terminating;
            node.owner = owner.clone();
            node.allow_cascading_delete = observed_spec.allow_cascading_delete;
        }

        // The owner wins over whatever the record says.
        out.spec = observed_spec.clone();
        if let Some(owner) = &owner {
            if out.spec.parent.as_deref() != Some(owner.as_str()) {
                info!(
                    namespace = name,
                    owner = %owner,
                    "subnamespace parent snapped back to its owner"
                );
                out.spec.parent = Some(owner.clone());
            }
            if self.ctx.is_excluded(owner) || !forest.exists(owner) {
                forest.set_condition(
                    name,
                    "",
                    Code::SubnamespaceConflict,
                    format!("owner namespace \"{owner}\" is missing or not managed"),
                );
            }
        }

        let old_parent = forest.parent(name);
        let wanted_parent = out.spec.parent.clone();
        if wanted_parent != old_parent {
            match forest.can_set_parent(name, wanted_parent.as_deref()) {
                Some(reason) => {
                    forest.set_condition(name, "", Code::CritParentInvalid, reason);
                }
                None => forest.set_parent(name, wanted_parent.as_deref()),
            }
        }
        let parent = forest.parent(name);
        if let Some(parent) = &parent {
            if !forest.exists(parent) {
                forest.set_condition(
                    name,
                    "",
                    Code::CritParentMissing,
                    format!("parent \"{parent}\" does not exist"),
                );
            }
        }

        let cycle = forest.cycle_names(name);
        if !cycle.is_empty() {
            forest.set_condition(
                name,
                "",
                Code::CritCycle,
                format!("namespace is a member of the cycle: {}", cycle.join(" <- ")),
            );
            // Other members tag themselves.
            out.enqueue.extend(cycle.into_iter().filter(|m| m.as_str() != name));
        }

        let (appeared, disappeared) = forest.set_anchors(name, anchors.clone());
        out.anchors_appeared = appeared;
        out.anchors_disappeared = disappeared;

        // A subnamespace child whose anchor vanished from this namespace.
        for child in forest.children(name) {
            let owned = forest
                .node(&child)
                .is_some_and(|n| n.exists && n.owner.as_deref() == Some(name));
            if owned && !anchors.contains(&child) {
                forest.set_condition(
                    name,
                    &child,
                    Code::HNSMissing,
                    format!("subnamespace \"{child}\" has no anchor in this namespace"),
                );
            }
        }

        let chain = forest.ancestry_names(name, None);
        let ancestor_crit = chain[..chain.len() - 1]
            .iter()
            .filter(|a| a.as_str() != name)
            .any(|a| forest.has_local_crit(a));
        if ancestor_crit {
            forest.set_condition(
                name,
                "",
                Code::CritAncestor,
                "an ancestor namespace has a critical condition",
            );
        }
        let crit = forest.has_local_crit(name);

        // Depth labels are fully rewritten on every pass; a namespace in a
        // critical or terminating state carries none.
        let mut desired_depths: BTreeMap<String, String> = BTreeMap::new();
        if !crit && !terminating {
            let chain = forest.ancestry_names(name, None);
            for (depth, ancestor) in chain.iter().rev().enumerate() {
                desired_depths.insert(depth_label(ancestor), depth.to_string());
            }
        }
        for key in ns_labels.keys().filter(|k| is_depth_label(k)) {
            if !desired_depths.contains_key(key) {
                out.label_ops.insert(key.clone(), None);
            }
        }
        for (key, value) in desired_depths {
            if ns_labels.get(&key) != Some(&value) {
                out.label_ops.insert(key, Some(value));
            }
        }

        // Record writes.
        out.status = HierarchyConfigurationStatus {
            children: forest.children(name),
            conditions: forest.conditions(name),
        };
        let observed_status = record
            .as_ref()
            .and_then(|r| r.status.clone())
            .unwrap_or_default();
        out.status_changed = out.status != observed_status;
        out.spec_changed = out.spec != observed_spec;

        let observed_finalizers = record
            .as_ref()
            .and_then(|r| r.metadata.finalizers.clone())
            .unwrap_or_default();
        let record_deleting = record
            .as_ref()
            .is_some_and(|r| r.metadata.deletion_timestamp.is_some());
        let want_finalizer = !anchors.is_empty() && !(record_deleting && !terminating);
        out.finalizers = observed_finalizers
            .iter()
            .filter(|f| f.as_str() != ANCHORS_PRESENT_FINALIZER)
            .cloned()
            .collect();
        if want_finalizer {
            out.finalizers.push(ANCHORS_PRESENT_FINALIZER.to_string());
        }
        out.finalizers_changed = out.finalizers != observed_finalizers;

        out.create_record = record.is_none()
            && (out.spec != HierarchyConfigurationSpec::default()
                || out.status != HierarchyConfigurationStatus::default()
                || want_finalizer);

        // Relatives to revisit. A namespace seen for the first time may have
        // children that were waiting for it.
        if !was_existing {
            out.enqueue.extend(forest.children(name));
        }
        if parent != old_parent {
            out.enqueue.extend(old_parent);
            out.enqueue.extend(parent);
            out.enqueue.extend(forest.descendant_names(name));
        } else if forest.has_crit(name) != had_crit {
            out.enqueue.extend(forest.descendant_names(name));
        }
        out.enqueue.remove(name);

        out
    }

    async fn write_record(
        &self,
        api: &Api<HierarchyConfiguration>,
        name: &str,
        record: &Option<HierarchyConfiguration>,
        out: &Outcome,
    ) -> Result<()> {
        if record.is_none() {
            if !out.create_record {
                return Ok(());
            }
            let mut fresh = HierarchyConfiguration::new(HIERARCHY_SINGLETON, out.spec.clone());
            fresh.metadata = ObjectMeta {
                name: Some(HIERARCHY_SINGLETON.to_string()),
                namespace: Some(name.to_string()),
                finalizers: (!out.finalizers.is_empty()).then(|| out.finalizers.clone()),
                ..Default::default()
            };
            api.create(&PostParams::default(), &fresh).await?;
        } else if out.spec_changed || out.finalizers_changed {
            let patch = json!({
                "metadata": { "finalizers": out.finalizers },
                "spec": {
                    "parent": out.spec.parent,
                    "allowCascadingDelete": out.spec.allow_cascading_delete,
                },
            });
            api.patch(
                HIERARCHY_SINGLETON,
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await?;
        }
        if out.status_changed {
            api.patch_status(
                HIERARCHY_SINGLETON,
                &PatchParams::default(),
                &Patch::Merge(&json!({ "status": out.status })),
            )
            .await?;
        }
        Ok(())
    }

    async fn write_namespace_labels(
        &self,
        api: &Api<Namespace>,
        name: &str,
        out: &Outcome,
    ) -> Result<()> {
        if out.label_ops.is_empty() {
            return Ok(());
        }
        let patch = json!({ "metadata": { "labels": out.label_ops } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}
