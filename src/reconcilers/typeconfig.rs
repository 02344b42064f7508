//! Consumes the cluster-wide configuration singleton and keeps the set of
//! per-kind object reconcilers in step with it.

use std::collections::HashSet;
use std::sync::Arc;

use kube::api::{Patch, PatchParams, PostParams};
use kube::core::GroupVersionKind;
use kube::discovery::Scope;
use kube::Api;
use serde_json::json;
use tracing::{info, warn};

use crate::api::{
    ArborConfiguration, ArborConfigurationSpec, ArborConfigurationStatus, Code, Condition,
    NamespaceCondition, SyncMode, TypeKey, TypeStatus,
};
use crate::error::{Error, Result};
use crate::metadata::{CONFIG_SINGLETON, RBAC_TYPES};
use crate::reconcilers::Context;
use crate::reconcilers::object::ObjectReconciler;

pub struct TypeConfigReconciler {
    ctx: Arc<Context>,
}

impl TypeConfigReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        TypeConfigReconciler { ctx }
    }

    pub async fn reconcile(&self, name: &str) -> Result<()> {
        let api: Api<ArborConfiguration> = Api::all(self.ctx.client.clone());
        if name != CONFIG_SINGLETON {
            return self.flag_misnamed(&api, name).await;
        }

        let config = match api.get_opt(CONFIG_SINGLETON).await? {
            Some(config) => config,
            None => {
                info!("creating default configuration singleton");
                let fresh = ArborConfiguration::new(
                    CONFIG_SINGLETON,
                    ArborConfigurationSpec::default_types(),
                );
                api.create(&PostParams::default(), &fresh).await?
            }
        };

        let (modes, mut conditions) = effective_modes(&config.spec);

        // Construct or retune reconcilers; a failed activation is recorded
        // and retried with backoff.
        let mut retry: Option<Error> = None;
        for (key, mode) in &modes {
            let reconciler = match self.ctx.types.get(key) {
                Some(reconciler) => Some(reconciler),
                None => match self.activate(key).await {
                    Ok(reconciler) => Some(reconciler),
                    Err(err) => {
                        conditions.push(Condition::new(
                            Code::ObjectReconcilerCreationFailed,
                            format!("could not activate {key}: {err}"),
                        ));
                        if err.is_retryable() && retry.is_none() {
                            retry = Some(err);
                        }
                        None
                    }
                },
            };
            if let Some(reconciler) = reconciler {
                reconciler.set_mode(*mode).await?;
            }
        }

        // Types that left the list become inert; their copies are reaped
        // only when the user explicitly configures Remove.
        let active: HashSet<TypeKey> = modes.iter().map(|(k, _)| k.clone()).collect();
        for (key, reconciler) in self.ctx.types.all() {
            if !active.contains(&key) {
                reconciler.set_mode(SyncMode::Ignore).await?;
            }
        }

        self.publish_status(&api, &config, &modes, conditions).await?;
        match retry {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn flag_misnamed(&self, api: &Api<ArborConfiguration>, name: &str) -> Result<()> {
        let Some(config) = api.get_opt(name).await? else {
            return Ok(());
        };
        let status = ArborConfigurationStatus {
            conditions: vec![Condition::new(
                Code::CritSingletonNameInvalid,
                format!("the configuration singleton must be named \"{CONFIG_SINGLETON}\""),
            )],
            ..Default::default()
        };
        if config.status.as_ref() != Some(&status) {
            api.patch_status(
                name,
                &PatchParams::default(),
                &Patch::Merge(&json!({ "status": status })),
            )
            .await?;
        }
        Ok(())
    }

    async fn activate(&self, key: &TypeKey) -> Result<Arc<ObjectReconciler>> {
        let (group, version) = key.group_version();
        let gvk = GroupVersionKind::gvk(group, version, &key.kind);
        let (resource, capabilities) =
            kube::discovery::pinned_kind(&self.ctx.client, &gvk).await?;
        if capabilities.scope != Scope::Namespaced {
            return Err(Error::UnknownResource {
                type_key: key.clone(),
                reason: "cluster-scoped kinds cannot be propagated".to_string(),
            });
        }
        info!(type_key = %key, "activating object reconciler");
        let reconciler = ObjectReconciler::start(
            key.clone(),
            resource,
            self.ctx.client.clone(),
            Arc::clone(&self.ctx.forest),
            self.ctx.excluded.clone(),
            self.ctx.workers,
        );
        self.ctx.types.insert(key.clone(), Arc::clone(&reconciler));
        Ok(reconciler)
    }

    async fn publish_status(
        &self,
        api: &Api<ArborConfiguration>,
        config: &ArborConfiguration,
        modes: &[(TypeKey, SyncMode)],
        conditions: Vec<Condition>,
    ) -> Result<()> {
        let mut types = Vec::new();
        {
            let forest = self.ctx.forest.lock().unwrap();
            for (key, wanted) in modes {
                let (mode, num_propagated) = match self.ctx.types.get(key) {
                    Some(reconciler) => (reconciler.mode(), reconciler.num_propagated_objects()),
                    None => (*wanted, 0),
                };
                types.push(TypeStatus {
                    api_version: key.api_version.clone(),
                    kind: key.kind.clone(),
                    mode: mode.to_string(),
                    num_source_objects: (mode == SyncMode::Propagate)
                        .then(|| forest.num_source_objects(key)),
                    num_propagated_objects: num_propagated,
                });
            }
        }
        let namespace_conditions: Vec<NamespaceCondition> = {
            let forest = self.ctx.forest.lock().unwrap();
            forest
                .conditions_by_code()
                .into_iter()
                .map(|(code, namespaces)| NamespaceCondition { code, namespaces })
                .collect()
        };
        let status = ArborConfigurationStatus {
            types,
            conditions,
            namespace_conditions,
        };
        if config.status.as_ref() != Some(&status) {
            api.patch_status(
                CONFIG_SINGLETON,
                &PatchParams::default(),
                &Patch::Merge(&json!({ "status": status })),
            )
            .await?;
        }
        Ok(())
    }
}

/// Resolves the configured type list into the modes to run: duplicates are
/// dropped with a condition, the RBAC kinds are forced to `Propagate` and
/// auto-inserted when missing, and unknown modes run as `Ignore`.
pub(crate) fn effective_modes(
    spec: &ArborConfigurationSpec,
) -> (Vec<(TypeKey, SyncMode)>, Vec<Condition>) {
    let mut modes: Vec<(TypeKey, SyncMode)> = Vec::new();
    let mut conditions = Vec::new();
    let mut seen: HashSet<TypeKey> = HashSet::new();

    for entry in &spec.types {
        let key = entry.type_key();
        if !seen.insert(key.clone()) {
            conditions.push(Condition::new(
                Code::MultipleConfigurationsForOneType,
                format!("duplicate configuration for {key} ignored"),
            ));
            continue;
        }
        let mut mode = match entry.mode.as_deref() {
            None if key.is_rbac() => SyncMode::Propagate,
            None => SyncMode::Ignore,
            Some(raw) => SyncMode::parse(raw).unwrap_or_else(|| {
                warn!(type_key = %key, mode = raw, "unknown sync mode, treating as Ignore");
                SyncMode::Ignore
            }),
        };
        if key.is_rbac() && mode != SyncMode::Propagate {
            warn!(type_key = %key, %mode, "mode overridden to Propagate");
            mode = SyncMode::Propagate;
        }
        modes.push((key, mode));
    }

    for (api_version, kind) in RBAC_TYPES {
        let key = TypeKey::new(api_version, kind);
        if seen.insert(key.clone()) {
            modes.push((key, SyncMode::Propagate));
        }
    }
    (modes, conditions)
}
