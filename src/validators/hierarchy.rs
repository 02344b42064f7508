//! Polices edits to hierarchy records: excluded or cyclic parents are
//! rejected outright, subnamespace parents are pinned to their owner, and
//! structural moves demand administration rights on the most-recent common
//! ancestor of the two endpoints.

use axum::Json;
use axum::extract::State;
use kube::ResourceExt;
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};

use crate::api::HierarchyConfiguration;
use crate::error::{Error, Result};
use crate::metadata::HIERARCHY_SINGLETON;
use crate::validators::{ValidatorState, Verdict, respond};

pub async fn handle(
    State(state): State<ValidatorState>,
    Json(review): Json<AdmissionReview<HierarchyConfiguration>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<HierarchyConfiguration> = match review.try_into() {
        Ok(req) => req,
        Err(err) => return Json(AdmissionResponse::invalid(err.to_string()).into_review()),
    };
    let verdict = if state.is_controller(&req) {
        Ok(Verdict::Allow)
    } else {
        check(&state, &req).await
    };
    Json(respond(&req, verdict, false).into_review())
}

pub(crate) async fn check(
    state: &ValidatorState,
    req: &AdmissionRequest<HierarchyConfiguration>,
) -> Result<Verdict> {
    if !matches!(req.operation, Operation::Create | Operation::Update) {
        return Ok(Verdict::Allow);
    }
    let Some(ns) = req.namespace.as_deref() else {
        return Ok(Verdict::deny("hierarchy records are namespaced"));
    };
    let record = req.object.as_ref().ok_or(Error::MissingAdmissionRequest)?;
    if record.name_any() != HIERARCHY_SINGLETON {
        return Ok(Verdict::deny(format!(
            "hierarchy records must be named \"{HIERARCHY_SINGLETON}\""
        )));
    }
    if state.is_excluded(ns) {
        return Ok(Verdict::deny(format!(
            "namespace \"{ns}\" is excluded from hierarchy management"
        )));
    }

    let wanted = record.spec.parent.clone();
    let targets = {
        let forest = state.forest.lock().unwrap();
        let current = forest.parent(ns);
        if wanted == current {
            // Not a structural change; nothing to authorize.
            return Ok(Verdict::Allow);
        }
        if let Some(owner) = forest.node(ns).and_then(|n| n.owner.clone()) {
            if wanted.as_deref() != Some(owner.as_str()) {
                return Ok(Verdict::deny(format!(
                    "\"{ns}\" is a subnamespace; its parent is managed by the anchor in \"{owner}\""
                )));
            }
        }
        if let Some(parent) = wanted.as_deref() {
            if state.is_excluded(parent) {
                return Ok(Verdict::deny(format!(
                    "\"{parent}\" is excluded and cannot be a parent"
                )));
            }
            if let Some(reason) = forest.can_set_parent(ns, Some(parent)) {
                return Ok(Verdict::Deny(reason));
            }
        }

        let mut targets: Vec<String> = Vec::new();
        match (current.as_deref(), wanted.as_deref()) {
            (None, None) => {}
            (Some(old), None) => targets.push(old.to_string()),
            (None, Some(new)) => targets.push(new.to_string()),
            (Some(old), Some(new)) => match forest.mrca(old, new) {
                Some(mrca) => targets.push(mrca),
                None => {
                    targets.push(old.to_string());
                    targets.push(new.to_string());
                }
            },
        }
        // A parent the store has never seen cannot be covered by the MRCA;
        // the mover needs rights on it directly.
        if let Some(new) = wanted.as_deref() {
            if !forest.exists(new) && !targets.iter().any(|t| t == new) {
                targets.push(new.to_string());
            }
        }
        targets
    };

    for target in targets {
        if !state.admin.is_admin(&req.user_info, &target).await? {
            return Ok(Verdict::deny(format!(
                "moving \"{ns}\" requires hierarchy administration rights on \"{target}\""
            )));
        }
    }
    Ok(Verdict::Allow)
}
