//! Protects propagated copies: nobody but the controller may create, label,
//! or edit them, status excepted. Fails open so a webhook outage cannot
//! block user workloads.

use axum::Json;
use axum::extract::State;
use kube::ResourceExt;
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use serde_json::Value;

use crate::error::Result;
use crate::metadata::INHERITED_FROM;
use crate::validators::{ValidatorState, Verdict, respond};

pub async fn handle(
    State(state): State<ValidatorState>,
    Json(review): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<DynamicObject> = match review.try_into() {
        Ok(req) => req,
        Err(err) => return Json(AdmissionResponse::invalid(err.to_string()).into_review()),
    };
    let verdict = if state.is_controller(&req) {
        Ok(Verdict::Allow)
    } else {
        check(&req)
    };
    Json(respond(&req, verdict, true).into_review())
}

pub(crate) fn check(req: &AdmissionRequest<DynamicObject>) -> Result<Verdict> {
    match req.operation {
        Operation::Create => {
            let created = req.object.as_ref();
            if created.is_some_and(|o| o.labels().contains_key(INHERITED_FROM)) {
                return Ok(Verdict::deny(format!(
                    "only the controller may create objects carrying the \"{INHERITED_FROM}\" label"
                )));
            }
            Ok(Verdict::Allow)
        }
        Operation::Update => {
            let (Some(old), Some(new)) = (req.old_object.as_ref(), req.object.as_ref()) else {
                return Ok(Verdict::Allow);
            };
            let old_label = old.labels().get(INHERITED_FROM);
            let new_label = new.labels().get(INHERITED_FROM);
            if old_label != new_label {
                return Ok(Verdict::deny(format!(
                    "the \"{INHERITED_FROM}\" label is managed by the controller and cannot be changed"
                )));
            }
            if old_label.is_some() && comparable(old)? != comparable(new)? {
                let source = old_label.cloned().unwrap_or_default();
                return Ok(Verdict::deny(format!(
                    "this object is propagated from \"{source}\"; edit it there instead"
                )));
            }
            Ok(Verdict::Allow)
        }
        _ => Ok(Verdict::Allow),
    }
}

/// The parts of an object a user is not allowed to change on a propagated
/// copy: everything except status and server-maintained metadata.
fn comparable(obj: &DynamicObject) -> Result<Value> {
    let mut value = serde_json::to_value(obj)?;
    if let Some(root) = value.as_object_mut() {
        root.remove("status");
    }
    if let Some(meta) = value.get_mut("metadata").and_then(Value::as_object_mut) {
        for field in ["resourceVersion", "generation", "managedFields"] {
            meta.remove(field);
        }
    }
    Ok(value)
}
