//! Self-serve namespace creation: reconciles anchors against the namespaces
//! they declare.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Namespace;
use kube::api::{DeleteParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::{Api, ResourceExt};
use serde_json::json;
use tracing::{debug, info};

use crate::api::{AnchorState, SubnamespaceAnchor, SubnamespaceAnchorStatus};
use crate::error::Result;
use crate::metadata::{SUBNAMESPACE_FINALIZER, SUBNAMESPACE_OF};
use crate::reconcilers::{Context, NamespacedName};

pub struct AnchorReconciler {
    ctx: Arc<Context>,
}

impl AnchorReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        AnchorReconciler { ctx }
    }

    pub async fn reconcile(&self, key: &NamespacedName) -> Result<()> {
        let parent = key.namespace.as_str();
        let child = key.name.as_str();
        debug!(%key, "reconciling anchor");

        let api: Api<SubnamespaceAnchor> = Api::namespaced(self.ctx.client.clone(), parent);
        let Some(anchor) = api.get_opt(child).await? else {
            // Deleted; the parent recomputes its registry and finalizer.
            self.ctx.hierarchy_queue.add(parent.to_string());
            return Ok(());
        };

        let ns_api: Api<Namespace> = Api::all(self.ctx.client.clone());
        let child_ns = ns_api.get_opt(child).await?;

        if anchor.metadata.deletion_timestamp.is_some() {
            self.finalize(&api, &ns_api, &anchor, parent, child, child_ns.as_ref())
                .await?;
            self.ctx.hierarchy_queue.add(parent.to_string());
            return Ok(());
        }

        self.ensure_finalizer(&api, &anchor, child).await?;

        let state = if self.ctx.is_excluded(parent) {
            AnchorState::Forbidden
        } else {
            match &child_ns {
                None => {
                    self.create_child(&ns_api, parent, child).await?;
                    AnchorState::Missing
                }
                Some(ns) if owner_of(ns).as_deref() == Some(parent) => AnchorState::Ok,
                Some(_) => AnchorState::Conflict,
            }
        };

        let observed = anchor.status.clone().unwrap_or_default();
        if observed.state != state {
            info!(%key, ?state, "anchor state changed");
            let status = SubnamespaceAnchorStatus { state };
            api.patch_status(
                child,
                &PatchParams::default(),
                &Patch::Merge(&json!({ "status": status })),
            )
            .await?;
        }

        self.ctx.hierarchy_queue.add(parent.to_string());
        Ok(())
    }

    async fn ensure_finalizer(
        &self,
        api: &Api<SubnamespaceAnchor>,
        anchor: &SubnamespaceAnchor,
        child: &str,
    ) -> Result<()> {
        if anchor
            .finalizers()
            .iter()
            .any(|f| f == SUBNAMESPACE_FINALIZER)
        {
            return Ok(());
        }
        let mut finalizers = anchor.finalizers().to_vec();
        finalizers.push(SUBNAMESPACE_FINALIZER.to_string());
        api.patch(
            child,
            &PatchParams::default(),
            &Patch::Merge(&json!({ "metadata": { "finalizers": finalizers } })),
        )
        .await?;
        Ok(())
    }

    async fn create_child(&self, ns_api: &Api<Namespace>, parent: &str, child: &str) -> Result<()> {
        info!(namespace = child, owner = parent, "creating subnamespace");
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(child.to_string()),
                annotations: Some(
                    [(SUBNAMESPACE_OF.to_string(), parent.to_string())]
                        .into_iter()
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        };
        ns_api.create(&PostParams::default(), &ns).await?;
        self.ctx.hierarchy_queue.add(child.to_string());
        Ok(())
    }

    /// An admitted anchor deletion cascades to the child namespace; the
    /// finalizer holds the anchor until the child is verifiably not ours or
    /// gone. Safe to re-run at any point.
    async fn finalize(
        &self,
        api: &Api<SubnamespaceAnchor>,
        ns_api: &Api<Namespace>,
        anchor: &SubnamespaceAnchor,
        parent: &str,
        child: &str,
        child_ns: Option<&Namespace>,
    ) -> Result<()> {
        if let Some(ns) = child_ns {
            if owner_of(ns).as_deref() == Some(parent) {
                // The validator enforces the cascading-delete gate, but a
                // bypassed webhook must not take the namespace with it.
                let allowed = {
                    let forest = self.ctx.forest.lock().unwrap();
                    forest.node(child).is_some_and(|n| n.allow_cascading_delete)
                };
                if !allowed {
                    info!(
                        namespace = child,
                        "anchor deleted without cascading delete, orphaning the subnamespace"
                    );
                } else if ns.metadata.deletion_timestamp.is_none() {
                    info!(namespace = child, "cascading anchor deletion to subnamespace");
                    ns_api.delete(child, &DeleteParams::default()).await?;
                    return Ok(());
                } else {
                    // Wait for the namespace to disappear; the namespace
                    // watcher re-enqueues this anchor when it does.
                    return Ok(());
                }
            }
        }
        if anchor
            .finalizers()
            .iter()
            .any(|f| f == SUBNAMESPACE_FINALIZER)
        {
            let finalizers: Vec<String> = anchor
                .finalizers()
                .iter()
                .filter(|f| f.as_str() != SUBNAMESPACE_FINALIZER)
                .cloned()
                .collect();
            api.patch(
                child,
                &PatchParams::default(),
                &Patch::Merge(&json!({ "metadata": { "finalizers": finalizers } })),
            )
            .await?;
        }
        Ok(())
    }
}

fn owner_of(ns: &Namespace) -> Option<String> {
    ns.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(SUBNAMESPACE_OF))
        .cloned()
}
