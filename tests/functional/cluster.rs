use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::PostParams;
use kube::{Api, Client, Config, CustomResourceExt};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::k3s::K3s;
use tokio::time::{Duration, sleep};

use arbor::api::{ArborConfiguration, HierarchyConfiguration, SubnamespaceAnchor};

pub struct TestCluster {
    pub container: ContainerAsync<K3s>,
    pub client: Client,
}

impl TestCluster {
    /// Boots a k3s container and installs the arbor CRDs.
    pub async fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let temp_dir = std::env::temp_dir().join(format!("k3s-test-{}", std::process::id()));
        std::fs::create_dir_all(&temp_dir)?;

        let container = K3s::default()
            .with_conf_mount(&temp_dir)
            .with_privileged(true)
            .start()
            .await?;

        let kubeconfig_yaml = container.image().read_kube_config()?;
        let mut kubeconfig: kube::config::Kubeconfig = serde_yaml::from_str(&kubeconfig_yaml)?;

        let kube_port = container.get_host_port_ipv4(6443).await?;
        let server_url = format!("https://127.0.0.1:{}", kube_port);

        if let Some(cluster) = kubeconfig.clusters.first_mut() {
            cluster.cluster.as_mut().unwrap().server = Some(server_url);
        }

        let client = Client::try_from(
            Config::from_custom_kubeconfig(kubeconfig, &Default::default()).await?,
        )?;

        let cluster = TestCluster { container, client };
        cluster.install_crds().await?;
        Ok(cluster)
    }

    async fn install_crds(&self) -> Result<(), Box<dyn std::error::Error>> {
        let api: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        for crd in [
            HierarchyConfiguration::crd(),
            SubnamespaceAnchor::crd(),
            ArborConfiguration::crd(),
        ] {
            api.create(&PostParams::default(), &crd).await?;
        }
        // Give the apiserver a moment to start serving the new groups.
        for _ in 0..30 {
            let established = api
                .list(&Default::default())
                .await?
                .items
                .iter()
                .filter(|crd| {
                    crd.spec.group == "arbor.dev"
                        && crd.status.as_ref().is_some_and(|s| {
                            s.conditions.as_ref().is_some_and(|conds| {
                                conds
                                    .iter()
                                    .any(|c| c.type_ == "Established" && c.status == "True")
                            })
                        })
                })
                .count();
            if established == 3 {
                return Ok(());
            }
            sleep(Duration::from_secs(1)).await;
        }
        Err("arbor CRDs never became established".into())
    }

    pub async fn cleanup(&self) -> Result<(), Box<dyn std::error::Error>> {
        self.container.stop().await?;
        Ok(())
    }
}
