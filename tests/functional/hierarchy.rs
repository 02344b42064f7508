use crate::{TestCluster, TestResources};
use clap::Parser;
use kube::ResourceExt;

use arbor::api::Code;
use arbor::metadata::SUBNAMESPACE_OF;
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

fn has_condition(record: &arbor::api::HierarchyConfiguration, code: Code) -> bool {
    record
        .status
        .as_ref()
        .is_some_and(|s| s.conditions.iter().any(|c| c.code == code))
}

#[cfg(feature = "functional-tests")]
#[tokio::test]
async fn test_missing_ancestors_surface_and_clear() -> Result<(), Box<dyn std::error::Error>> {
    let cluster = TestCluster::new().await?;
    let resources = TestResources::new(cluster.client.clone());
    let _url = start_controller(&cluster).await?;

    resources.create_namespace("a").await?;
    resources.create_namespace("b").await?;
    resources.set_parent("a", Some("b")).await?;
    resources.set_parent("b", Some("c")).await?;

    resources
        .wait_until("b reports its missing parent", || async {
            matches!(resources.hierarchy("b").await, Ok(Some(record))
                if has_condition(&record, Code::CritParentMissing))
        })
        .await?;
    resources
        .wait_until("a reports the ancestor condition", || async {
            matches!(resources.hierarchy("a").await, Ok(Some(record))
                if has_condition(&record, Code::CritAncestor))
        })
        .await?;

    resources.create_namespace("c").await?;

    resources
        .wait_until("conditions clear and depth labels appear", || async {
            let record = match resources.hierarchy("a").await {
                Ok(Some(record)) => record,
                _ => return false,
            };
            if record
                .status
                .as_ref()
                .is_some_and(|s| !s.conditions.is_empty())
            {
                return false;
            }
            let ns = match resources.namespace("a").await {
                Ok(Some(ns)) => ns,
                _ => return false,
            };
            let labels = ns.labels();
            labels.get("a.tree.arbor.dev/depth").map(String::as_str) == Some("0")
                && labels.get("b.tree.arbor.dev/depth").map(String::as_str) == Some("1")
                && labels.get("c.tree.arbor.dev/depth").map(String::as_str) == Some("2")
        })
        .await?;

    cluster.cleanup().await?;
    Ok(())
}

#[cfg(feature = "functional-tests")]
#[tokio::test]
async fn test_subnamespace_self_serve() -> Result<(), Box<dyn std::error::Error>> {
    let cluster = TestCluster::new().await?;
    let resources = TestResources::new(cluster.client.clone());
    let _url = start_controller(&cluster).await?;

    resources.create_namespace("p").await?;
    resources.create_anchor("p", "foo").await?;

    resources
        .wait_until("the subnamespace exists and is wired up", || async {
            let ns = match resources.namespace("foo").await {
                Ok(Some(ns)) => ns,
                _ => return false,
            };
            let owned = ns.annotations().get(SUBNAMESPACE_OF).map(String::as_str) == Some("p");
            let anchored = matches!(resources.anchor("p", "foo").await, Ok(Some(anchor))
                if anchor.status.as_ref().map(|s| s.state) == Some(arbor::api::AnchorState::Ok));
            let child_listed = matches!(resources.hierarchy("p").await, Ok(Some(record))
                if record.status.as_ref().is_some_and(|s| s.children.contains(&"foo".to_string())));
            let parent_set = matches!(resources.hierarchy("foo").await, Ok(Some(record))
                if record.spec.parent.as_deref() == Some("p"));
            owned && anchored && child_listed && parent_set
        })
        .await?;

    // A manual reparent of a subnamespace snaps back to the owner.
    resources.create_namespace("q").await?;
    resources.set_parent("foo", Some("q")).await?;
    resources
        .wait_until("the parent snaps back to the owner", || async {
            matches!(resources.hierarchy("foo").await, Ok(Some(record))
                if record.spec.parent.as_deref() == Some("p"))
        })
        .await?;

    cluster.cleanup().await?;
    Ok(())
}

#[cfg(feature = "functional-tests")]
#[tokio::test]
async fn test_cascading_delete() -> Result<(), Box<dyn std::error::Error>> {
    let cluster = TestCluster::new().await?;
    let resources = TestResources::new(cluster.client.clone());
    let _url = start_controller(&cluster).await?;

    resources.create_namespace("p").await?;
    resources.create_anchor("p", "bar").await?;
    resources
        .wait_until("the subnamespace exists", || async {
            matches!(resources.namespace("bar").await, Ok(Some(_)))
        })
        .await?;

    resources.set_allow_cascading_delete("bar", true).await?;
    resources.delete_anchor("p", "bar").await?;

    resources
        .wait_until("the subnamespace is removed", || async {
            match resources.namespace("bar").await {
                Ok(None) => true,
                Ok(Some(ns)) => ns.metadata.deletion_timestamp.is_some(),
                Err(_) => false,
            }
        })
        .await?;

    cluster.cleanup().await?;
    Ok(())
}
