//! Watch streams feeding the work queues. The watchers carry no state of
//! their own: every event is reduced to a key and the owning reconciler
//! re-reads the store on its turn.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Namespace;
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, ResourceExt};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::api::{ArborConfiguration, HierarchyConfiguration, SubnamespaceAnchor};
use crate::metadata::{CONFIG_SINGLETON, SUBNAMESPACE_OF};
use crate::reconcilers::{Context, NamespacedName};

/// How often the configuration status counts are refreshed even without
/// configuration changes.
const STATUS_REFRESH: Duration = Duration::from_secs(60);

pub fn spawn(ctx: &Arc<Context>) -> Vec<JoinHandle<()>> {
    let mut tasks = Vec::new();

    {
        let api: Api<Namespace> = Api::all(ctx.client.clone());
        let ctx = Arc::clone(ctx);
        tasks.push(tokio::spawn(async move {
            watcher(api, watcher::Config::default())
                .default_backoff()
                .touched_objects()
                .for_each(|event| {
                    let ctx = &ctx;
                    async move {
                        match event {
                            Ok(ns) => {
                                let name = ns.name_any();
                                // A deleted subnamespace unblocks its
                                // anchor's finalizer.
                                if let Some(owner) = ns
                                    .metadata
                                    .annotations
                                    .as_ref()
                                    .and_then(|a| a.get(SUBNAMESPACE_OF))
                                {
                                    ctx.anchor_queue
                                        .add(NamespacedName::new(owner.clone(), name.clone()));
                                }
                                ctx.hierarchy_queue.add(name);
                            }
                            Err(err) => warn!(%err, "namespace watch error"),
                        }
                    }
                })
                .await;
        }));
    }

    {
        let api: Api<HierarchyConfiguration> = Api::all(ctx.client.clone());
        let ctx = Arc::clone(ctx);
        tasks.push(tokio::spawn(async move {
            watcher(api, watcher::Config::default())
                .default_backoff()
                .touched_objects()
                .for_each(|event| {
                    let ctx = &ctx;
                    async move {
                        match event {
                            Ok(record) => {
                                if let Some(ns) = record.namespace() {
                                    ctx.hierarchy_queue.add(ns);
                                }
                            }
                            Err(err) => warn!(%err, "hierarchy watch error"),
                        }
                    }
                })
                .await;
        }));
    }

    {
        let api: Api<SubnamespaceAnchor> = Api::all(ctx.client.clone());
        let ctx = Arc::clone(ctx);
        tasks.push(tokio::spawn(async move {
            watcher(api, watcher::Config::default())
                .default_backoff()
                .touched_objects()
                .for_each(|event| {
                    let ctx = &ctx;
                    async move {
                        match event {
                            Ok(anchor) => {
                                if let Some(ns) = anchor.namespace() {
                                    ctx.anchor_queue
                                        .add(NamespacedName::new(ns, anchor.name_any()));
                                }
                            }
                            Err(err) => warn!(%err, "anchor watch error"),
                        }
                    }
                })
                .await;
        }));
    }

    {
        let api: Api<ArborConfiguration> = Api::all(ctx.client.clone());
        let ctx = Arc::clone(ctx);
        tasks.push(tokio::spawn(async move {
            watcher(api, watcher::Config::default())
                .default_backoff()
                .touched_objects()
                .for_each(|event| {
                    let ctx = &ctx;
                    async move {
                        match event {
                            Ok(config) => ctx.config_queue.add(config.name_any()),
                            Err(err) => warn!(%err, "configuration watch error"),
                        }
                    }
                })
                .await;
        }));
    }

    // Keeps the published object counts current.
    {
        let ctx = Arc::clone(ctx);
        tasks.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(STATUS_REFRESH);
            loop {
                tick.tick().await;
                ctx.config_queue.add(CONFIG_SINGLETON.to_string());
            }
        }));
    }

    tasks
}
