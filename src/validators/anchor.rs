//! Polices anchor lifecycle: creation in excluded namespaces, name
//! collisions with namespaces that are not ours, and deletion of anchors
//! whose child has not opted into cascading delete.

use axum::Json;
use axum::extract::State;
use kube::ResourceExt;
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};

use crate::api::SubnamespaceAnchor;
use crate::error::Result;
use crate::validators::{ValidatorState, Verdict, respond};

pub async fn handle(
    State(state): State<ValidatorState>,
    Json(review): Json<AdmissionReview<SubnamespaceAnchor>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<SubnamespaceAnchor> = match review.try_into() {
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

pub(crate) fn check(
    state: &ValidatorState,
    req: &AdmissionRequest<SubnamespaceAnchor>,
) -> Result<Verdict> {
    let Some(parent) = req.namespace.as_deref() else {
        return Ok(Verdict::deny("anchors are namespaced"));
    };
    let child = match (&req.object, &req.old_object) {
        (Some(anchor), _) | (_, Some(anchor)) => anchor.name_any(),
        _ => req.name.clone(),
    };

    match req.operation {
        Operation::Create => {
            if state.is_excluded(parent) {
                return Ok(Verdict::deny(format!(
                    "namespace \"{parent}\" is excluded and cannot host subnamespaces"
                )));
            }
            let forest = state.forest.lock().unwrap();
            let taken = forest.exists(&child)
                && forest
                    .node(&child)
                    .is_none_or(|n| n.owner.as_deref() != Some(parent));
            if taken {
                return Ok(Verdict::deny(format!(
                    "a namespace named \"{child}\" already exists and is not a subnamespace of \"{parent}\""
                )));
            }
            Ok(Verdict::Allow)
        }
        Operation::Delete => {
            let forest = state.forest.lock().unwrap();
            let blocked = forest.exists(&child)
                && forest.node(&child).is_some_and(|n| {
                    n.owner.as_deref() == Some(parent) && !n.allow_cascading_delete
                });
            if blocked {
                return Ok(Verdict::deny(format!(
                    "deleting this anchor would delete namespace \"{child}\", which has not set allowCascadingDelete"
                )));
            }
            Ok(Verdict::Allow)
        }
        _ => Ok(Verdict::Allow),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::validators::hierarchy::tests::{FakeAdmin, state_with};

    fn request(op: &str, parent: &str, child: &str) -> AdmissionRequest<SubnamespaceAnchor> {
        let anchor = json!({
            "apiVersion": "arbor.dev/v1alpha1",
            "kind": "SubnamespaceAnchor",
            "metadata": {"name": child, "namespace": parent},
            "spec": {},
        });
        let (object, old_object) = if op == "DELETE" {
            (json!(null), anchor)
        } else {
            (anchor, json!(null))
        };
        let review: AdmissionReview<SubnamespaceAnchor> = serde_json::from_value(json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "test",
                "kind": {"group": "arbor.dev", "version": "v1alpha1", "kind": "SubnamespaceAnchor"},
                "resource": {"group": "arbor.dev", "version": "v1alpha1", "resource": "subnamespaceanchors"},
                "operation": op,
                "userInfo": {"username": "alice"},
                "name": child,
                "namespace": parent,
                "object": object,
                "oldObject": old_object,
            },
        }))
        .unwrap();
        review.try_into().unwrap()
    }

    #[test]
    fn creation_in_excluded_namespaces_is_rejected() {
        let state = state_with(FakeAdmin::on([]));
        assert!(matches!(
            check(&state, &request("CREATE", "kube-system", "team")).unwrap(),
            Verdict::Deny(_)
        ));
    }

    #[test]
    fn name_collisions_are_rejected() {
        let state = state_with(FakeAdmin::on([]));
        {
            let mut forest = state.forest.lock().unwrap();
            forest.set_exists("taken", true);
        }
        assert!(matches!(
            check(&state, &request("CREATE", "p", "taken")).unwrap(),
            Verdict::Deny(_)
        ));
        // Re-creating the anchor for our own subnamespace is fine.
        {
            let mut forest = state.forest.lock().unwrap();
            forest.node_mut("taken").owner = Some("p".to_string());
        }
        assert_eq!(
            check(&state, &request("CREATE", "p", "taken")).unwrap(),
            Verdict::Allow
        );
    }

    #[test]
    fn deletion_is_gated_on_cascading_delete() {
        let state = state_with(FakeAdmin::on([]));
        {
            let mut forest = state.forest.lock().unwrap();
            forest.set_exists("foo", true);
            forest.node_mut("foo").owner = Some("p".to_string());
        }
        assert!(matches!(
            check(&state, &request("DELETE", "p", "foo")).unwrap(),
            Verdict::Deny(_)
        ));

        state
            .forest
            .lock()
            .unwrap()
            .node_mut("foo")
            .allow_cascading_delete = true;
        assert_eq!(
            check(&state, &request("DELETE", "p", "foo")).unwrap(),
            Verdict::Allow
        );
    }

    #[test]
    fn deleting_an_anchor_without_a_child_is_allowed() {
        let state = state_with(FakeAdmin::on([]));
        assert_eq!(
            check(&state, &request("DELETE", "p", "never-created")).unwrap(),
            Verdict::Allow
        );
    }
}
