use crate::{TestCluster, TestResources};
use clap::Parser;

use arbor::metadata::INHERITED_FROM;
use arbor::server::Server;
use arbor::settings::Settings;

async fn start_controller(
    cluster: &TestCluster,
) -> Result<String, Box<dyn std::error::Error>> {
    let settings = Settings::parse_from(["arbor", "--bind-addr", "127.0.0.1:0"]);
    let server = Server::new_with_client(settings, cluster.client.clone()).await?;
    let url = format!("http://{}", server.addr);
    tokio::spawn(async move { server.serve().await });
    Ok(url)
}

#[cfg(feature = "functional-tests")]
#[tokio::test]
async fn test_config_map_propagation_and_removal() -> Result<(), Box<dyn std::error::Error>> {
    let cluster = TestCluster::new().await?;
    let resources = TestResources::new(cluster.client.clone());
    let url = start_controller(&cluster).await?;

    // p with subnamespaces q and r.
    resources.create_namespace("p").await?;
    resources.create_anchor("p", "q").await?;
    resources.create_anchor("p", "r").await?;
    resources
        .wait_until("the tree is built", || async {
            matches!(resources.namespace("q").await, Ok(Some(_)))
                && matches!(resources.namespace("r").await, Ok(Some(_)))
        })
        .await?;

    resources
        .wait_until("the default configuration exists", || async {
            let api: kube::Api<arbor::api::ArborConfiguration> =
                kube::Api::all(resources.client.clone());
            matches!(api.get_opt("config").await, Ok(Some(_)))
        })
        .await?;
    resources.configure_type("v1", "ConfigMap", "Propagate").await?;
    resources.create_config_map("p", "shared", "team", "acme").await?;

    resources
        .wait_until("the config map reaches every descendant", || async {
            for ns in ["q", "r"] {
                match resources.config_map(ns, "shared").await {
                    Ok(Some(cm)) => {
                        let labeled = cm
                            .metadata
                            .labels
                            .as_ref()
                            .and_then(|l| l.get(INHERITED_FROM))
                            .map(String::as_str)
                            == Some("p");
                        let carried =
                            cm.data.as_ref().and_then(|d| d.get("team")).map(String::as_str)
                                == Some("acme");
                        if !labeled || !carried {
                            return false;
                        }
                    }
                    _ => return false,
                }
            }
            true
        })
        .await?;

    // The debug surface sees the tree.
    let snapshot: serde_json::Value = reqwest::get(format!("{url}/forest")).await?.json().await?;
    let p = snapshot
        .as_array()
        .and_then(|nodes| {
            nodes
                .iter()
                .find(|n| n["name"].as_str() == Some("p"))
                .cloned()
        })
        .expect("p in the forest snapshot");
    assert_eq!(p["children"].as_array().map(Vec::len), Some(2));

    // Switching to Remove reaps the copies and leaves the source.
    resources.configure_type("v1", "ConfigMap", "Remove").await?;
    resources
        .wait_until("the copies are removed", || async {
            matches!(resources.config_map("q", "shared").await, Ok(None))
                && matches!(resources.config_map("r", "shared").await, Ok(None))
                && matches!(resources.config_map("p", "shared").await, Ok(Some(_)))
        })
        .await?;

    cluster.cleanup().await?;
    Ok(())
}
