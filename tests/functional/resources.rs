use std::collections::BTreeMap;
use std::future::Future;

use k8s_openapi::api::core::v1::{ConfigMap, Namespace};
use kube::api::{DeleteParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::{Api, Client};
use serde_json::json;
use tokio::time::{Duration, sleep};

use arbor::api::{
    ArborConfiguration, HierarchyConfiguration, HierarchyConfigurationSpec, SubnamespaceAnchor,
    SubnamespaceAnchorSpec,
};
use arbor::metadata::{CONFIG_SINGLETON, HIERARCHY_SINGLETON};

pub struct TestResources {
    pub client: Client,
}

impl TestResources {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn create_namespace(&self, name: &str) -> Result<(), Box<dyn std::error::Error>> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        namespaces.create(&PostParams::default(), &ns).await?;
        Ok(())
    }

    pub async fn namespace(
        &self,
        name: &str,
    ) -> Result<Option<Namespace>, Box<dyn std::error::Error>> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        Ok(namespaces.get_opt(name).await?)
    }

    pub async fn hierarchy(
        &self,
        ns: &str,
    ) -> Result<Option<HierarchyConfiguration>, Box<dyn std::error::Error>> {
        let api: Api<HierarchyConfiguration> = Api::namespaced(self.client.clone(), ns);
        Ok(api.get_opt(HIERARCHY_SINGLETON).await?)
    }

    pub async fn set_parent(
        &self,
        ns: &str,
        parent: Option<&str>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let api: Api<HierarchyConfiguration> = Api::namespaced(self.client.clone(), ns);
        if api.get_opt(HIERARCHY_SINGLETON).await?.is_none() {
            let record = HierarchyConfiguration::new(
                HIERARCHY_SINGLETON,
                HierarchyConfigurationSpec {
                    parent: parent.map(str::to_string),
                    allow_cascading_delete: false,
                },
            );
            api.create(&PostParams::default(), &record).await?;
        } else {
            api.patch(
                HIERARCHY_SINGLETON,
                &PatchParams::default(),
                &Patch::Merge(&json!({ "spec": { "parent": parent } })),
            )
            .await?;
        }
        Ok(())
    }

    pub async fn set_allow_cascading_delete(
        &self,
        ns: &str,
        value: bool,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let api: Api<HierarchyConfiguration> = Api::namespaced(self.client.clone(), ns);
        if api.get_opt(HIERARCHY_SINGLETON).await?.is_none() {
            let record = HierarchyConfiguration::new(
                HIERARCHY_SINGLETON,
                HierarchyConfigurationSpec {
                    parent: None,
                    allow_cascading_delete: value,
                },
            );
            api.create(&PostParams::default(), &record).await?;
        } else {
            api.patch(
                HIERARCHY_SINGLETON,
                &PatchParams::default(),
                &Patch::Merge(&json!({ "spec": { "allowCascadingDelete": value } })),
            )
            .await?;
        }
        Ok(())
    }

    pub async fn create_anchor(
        &self,
        parent: &str,
        name: &str,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let api: Api<SubnamespaceAnchor> = Api::namespaced(self.client.clone(), parent);
        let anchor = SubnamespaceAnchor::new(name, SubnamespaceAnchorSpec::default());
        api.create(&PostParams::default(), &anchor).await?;
        Ok(())
    }

    pub async fn anchor(
        &self,
        parent: &str,
        name: &str,
    ) -> Result<Option<SubnamespaceAnchor>, Box<dyn std::error::Error>> {
        let api: Api<SubnamespaceAnchor> = Api::namespaced(self.client.clone(), parent);
        Ok(api.get_opt(name).await?)
    }

    pub async fn delete_anchor(
        &self,
        parent: &str,
        name: &str,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let api: Api<SubnamespaceAnchor> = Api::namespaced(self.client.clone(), parent);
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    pub async fn create_config_map(
        &self,
        ns: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), ns);
        let mut data = BTreeMap::new();
        data.insert(key.to_string(), value.to_string());
        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        };
        api.create(&PostParams::default(), &cm).await?;
        Ok(())
    }

    pub async fn config_map(
        &self,
        ns: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, Box<dyn std::error::Error>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), ns);
        Ok(api.get_opt(name).await?)
    }

    /// Sets the mode of one type in the configuration singleton, appending
    /// the entry when it is not configured yet.
    pub async fn configure_type(
        &self,
        api_version: &str,
        kind: &str,
        mode: &str,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let api: Api<ArborConfiguration> = Api::all(self.client.clone());
        let Some(config) = api.get_opt(CONFIG_SINGLETON).await? else {
            return Err("configuration singleton is missing".into());
        };
        let mut types = config.spec.types.clone();
        match types
            .iter_mut()
            .find(|t| t.api_version == api_version && t.kind == kind)
        {
            Some(entry) => entry.mode = Some(mode.to_string()),
            None => types.push(arbor::api::TypeEntry {
                api_version: api_version.to_string(),
                kind: kind.to_string(),
                mode: Some(mode.to_string()),
            }),
        }
        api.patch(
            CONFIG_SINGLETON,
            &PatchParams::default(),
            &Patch::Merge(&json!({ "spec": { "types": types } })),
        )
        .await?;
        Ok(())
    }

    /// Polls until the condition holds, failing the test after a minute.
    pub async fn wait_until<F, Fut>(
        &self,
        what: &str,
        condition: F,
    ) -> Result<(), Box<dyn std::error::Error>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..60 {
            if condition().await {
                return Ok(());
            }
            sleep(Duration::from_secs(1)).await;
        }
        Err(format!("timed out waiting for: {what}").into())
    }
}
