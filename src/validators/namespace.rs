//! Polices namespace deletion: subnamespaces go away through their anchor,
//! and a namespace with subnamespace children only goes away when cascading
//! delete has been opted into.

use axum::Json;
use axum::extract::State;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};

use crate::error::Result;
use crate::validators::{ValidatorState, Verdict, respond};

pub async fn handle(
    State(state): State<ValidatorState>,
    Json(review): Json<AdmissionReview<Namespace>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<Namespace> = match review.try_into() {
        Ok(req) => req,
        Err(err) => return Json(AdmissionResponse::invalid(err.to_string()).into_review()),
    };
    let verdict = if state.is_controller(&req) {
        Ok(Verdict::Allow)
    } else {
        check(&state, &req)
    };
    Json(respond(&req, verdict, false).into_review())
}

pub(crate) fn check(state: &ValidatorState, req: &AdmissionRequest<Namespace>) -> Result<Verdict> {
    if !matches!(req.operation, Operation::Delete) {
        return Ok(Verdict::Allow);
    }
    let name = req.name.as_str();
    if state.is_excluded(name) {
        return Ok(Verdict::Allow);
    }

    let forest = state.forest.lock().unwrap();
    if let Some(owner) = forest.node(name).and_then(|n| n.owner.clone()) {
        return Ok(Verdict::deny(format!(
            "\"{name}\" is a subnamespace; delete the anchor in \"{owner}\" instead"
        )));
    }

    let allows_cascade = forest.node(name).is_some_and(|n| n.allow_cascading_delete);
    if allows_cascade {
        return Ok(Verdict::Allow);
    }
    let blocking: Vec<String> = forest
        .children(name)
        .into_iter()
        .filter(|child| {
            forest.node(child).is_some_and(|n| {
                n.exists && n.owner.as_deref() == Some(name) && !n.allow_cascading_delete
            })
        })
        .collect();
    if !blocking.is_empty() {
        return Ok(Verdict::deny(format!(
            "namespace has subnamespace children without allowCascadingDelete: {}",
            blocking.join(", ")
        )));
    }
    Ok(Verdict::Allow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::validators::hierarchy::tests::{FakeAdmin, state_with};

    fn delete_request(name: &str) -> AdmissionRequest<Namespace> {
        let review: AdmissionReview<Namespace> = serde_json::from_value(json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "test",
                "kind": {"group": "", "version": "v1", "kind": "Namespace"},
                "resource": {"group": "", "version": "v1", "resource": "namespaces"},
                "operation": "DELETE",
                "userInfo": {"username": "alice"},
                "name": name,
                "oldObject": {
                    "apiVersion": "v1",
                    "kind": "Namespace",
                    "metadata": {"name": name},
                },
            },
        }))
        .unwrap();
        review.try_into().unwrap()
    }

    #[test]
    fn subnamespaces_are_deleted_through_their_anchor() {
        let state = state_with(FakeAdmin::on([]));
        {
            let mut forest = state.forest.lock().unwrap();
            forest.set_exists("foo", true);
            forest.node_mut("foo").owner = Some("p".to_string());
        }
        match check(&state, &delete_request("foo")).unwrap() {
            Verdict::Deny(reason) => assert!(reason.contains("anchor"), "{reason}"),
            Verdict::Allow => panic!("expected denial"),
        }
    }

    #[test]
    fn subnamespace_children_block_deletion_until_opted_in() {
        let state = state_with(FakeAdmin::on([]));
        {
            let mut forest = state.forest.lock().unwrap();
            for ns in ["p", "foo"] {
                forest.set_exists(ns, true);
            }
            forest.set_parent("foo", Some("p"));
            forest.node_mut("foo").owner = Some("p".to_string());
        }
        assert!(matches!(
            check(&state, &delete_request("p")).unwrap(),
            Verdict::Deny(_)
        ));

        // Opting in on the parent is enough.
        state
            .forest
            .lock()
            .unwrap()
            .node_mut("p")
            .allow_cascading_delete = true;
        assert_eq!(check(&state, &delete_request("p")).unwrap(), Verdict::Allow);
    }

    #[test]
    fn opting_in_on_every_child_also_unblocks() {
        let state = state_with(FakeAdmin::on([]));
        {
            let mut forest = state.forest.lock().unwrap();
            for ns in ["p", "foo"] {
                forest.set_exists(ns, true);
            }
            forest.set_parent("foo", Some("p"));
            let foo = forest.node_mut("foo");
            foo.owner = Some("p".to_string());
            foo.allow_cascading_delete = true;
        }
        assert_eq!(check(&state, &delete_request("p")).unwrap(), Verdict::Allow);
    }

    #[test]
    fn plain_namespaces_delete_freely() {
        let state = state_with(FakeAdmin::on([]));
        {
            let mut forest = state.forest.lock().unwrap();
            forest.set_exists("plain", true);
        }
        assert_eq!(
            check(&state, &delete_request("plain")).unwrap(),
            Verdict::Allow
        );
    }
}
