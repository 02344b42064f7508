use std::net::SocketAddr;
use std::sync::Arc;

use kube::Client;
use tracing::info;

use crate::authz::SubjectAccessReviewChecker;
use crate::forest;
use crate::metadata::CONFIG_SINGLETON;
use crate::reconcilers::anchor::AnchorReconciler;
use crate::reconcilers::hierarchy::HierarchyReconciler;
use crate::reconcilers::typeconfig::TypeConfigReconciler;
use crate::reconcilers::{Context, NamespacedName};
use crate::settings::Settings;
use crate::validators::ValidatorState;
use crate::workqueue::spawn_workers;
use crate::{router, watch};

pub struct Server {
    pub settings: Settings,
    pub ctx: Arc<Context>,
    pub addr: SocketAddr,
    listener: tokio::net::TcpListener,
    router: axum::Router,
}

impl Server {
    pub async fn new(settings: Settings) -> Result<Self, Box<dyn std::error::Error>> {
        let client = Client::try_default().await?;
        Self::new_with_client(settings, client).await
    }

    pub async fn new_with_client(
        settings: Settings,
        client: Client,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let forest = forest::shared();
        let ctx = Context::new(client.clone(), Arc::clone(&forest), &settings);
        let validators = ValidatorState {
            forest,
            excluded: Arc::new(settings.excluded()),
            admin: Arc::new(SubjectAccessReviewChecker::new(client.clone())),
            client: Some(client),
            service_account: settings.service_account.clone(),
        };
        let router = router::new_router(validators).await;
        let listener = tokio::net::TcpListener::bind(&settings.bind_addr).await?;
        let addr = listener.local_addr()?;

        Ok(Server {
            settings,
            ctx,
            addr,
            listener,
            router,
        })
    }

    /// Starts the reconciler pools and the watchers, then serves HTTP until
    /// the shutdown signal.
    pub async fn serve(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ctx = self.ctx;

        let hierarchy = Arc::new(HierarchyReconciler::new(Arc::clone(&ctx)));
        spawn_workers(
            Arc::clone(&ctx.hierarchy_queue),
            ctx.workers,
            move |ns: String| {
                let reconciler = Arc::clone(&hierarchy);
                async move { reconciler.reconcile(&ns).await }
            },
        );

        let anchors = Arc::new(AnchorReconciler::new(Arc::clone(&ctx)));
        spawn_workers(
            Arc::clone(&ctx.anchor_queue),
            ctx.workers,
            move |key: NamespacedName| {
                let reconciler = Arc::clone(&anchors);
                async move { reconciler.reconcile(&key).await }
            },
        );

        // The singleton needs no parallelism.
        let typeconfig = Arc::new(TypeConfigReconciler::new(Arc::clone(&ctx)));
        spawn_workers(
            Arc::clone(&ctx.config_queue),
            1,
            move |name: String| {
                let reconciler = Arc::clone(&typeconfig);
                async move { reconciler.reconcile(&name).await }
            },
        );

        let _watchers = watch::spawn(&ctx);
        // Creates the default configuration when the cluster has none yet.
        ctx.config_queue.add(CONFIG_SINGLETON.to_string());

        info!(addr = %self.addr, "serving");
        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(shutdown_signal(Arc::clone(&ctx)))
            .await?;
        Ok(())
    }
}

async fn shutdown_signal(ctx: Arc<Context>) {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
    info!("shutting down, draining queues");
    ctx.hierarchy_queue.shutdown();
    ctx.anchor_queue.shutdown();
    ctx.config_queue.shutdown();
    for (_, reconciler) in ctx.types.all() {
        reconciler.shutdown();
    }
}
