//! Polices the configuration singleton: its name, its type list, and the
//! existence of every kind it references.

use axum::Json;
use axum::extract::State;
use kube::api::DynamicObject;
use kube::core::GroupVersionKind;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use kube::discovery::Scope;

use crate::api::{ArborConfiguration, ArborConfigurationSpec, SyncMode, TypeKey};
use crate::error::{Error, Result};
use crate::metadata::CONFIG_SINGLETON;
use crate::validators::{ValidatorState, Verdict, respond};

pub async fn handle(
    State(state): State<ValidatorState>,
    Json(review): Json<AdmissionReview<ArborConfiguration>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<ArborConfiguration> = match review.try_into() {
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
    req: &AdmissionRequest<ArborConfiguration>,
) -> Result<Verdict> {
    match req.operation {
        Operation::Delete => {
            if req.name == CONFIG_SINGLETON {
                return Ok(Verdict::deny(
                    "the configuration singleton cannot be deleted",
                ));
            }
            Ok(Verdict::Allow)
        }
        Operation::Create | Operation::Update => {
            let config = req.object.as_ref().ok_or(Error::MissingAdmissionRequest)?;
            if req.name != CONFIG_SINGLETON {
                return Ok(Verdict::deny(format!(
                    "the configuration singleton must be named \"{CONFIG_SINGLETON}\""
                )));
            }
            if let Some(reason) = check_spec(&config.spec) {
                return Ok(Verdict::Deny(reason));
            }
            // Every referenced kind must be served by the cluster.
            let Some(client) = state.client.clone() else {
                return Ok(Verdict::deny("store client unavailable"));
            };
            for entry in &config.spec.types {
                let key = entry.type_key();
                let (group, version) = key.group_version();
                let gvk = GroupVersionKind::gvk(group, version, &key.kind);
                match kube::discovery::pinned_kind(&client, &gvk).await {
                    Ok((_, capabilities)) if capabilities.scope == Scope::Namespaced => {}
                    Ok(_) => {
                        return Ok(Verdict::deny(format!(
                            "{key} is cluster-scoped and cannot be propagated"
                        )));
                    }
                    Err(err) => {
                        return Ok(Verdict::deny(format!(
                            "{key} is not served by this cluster: {err}"
                        )));
                    }
                }
            }
            Ok(Verdict::Allow)
        }
        _ => Ok(Verdict::Allow),
    }
}

/// The store-independent part of the check.
pub(crate) fn check_spec(spec: &ArborConfigurationSpec) -> Option<String> {
    let mut seen: Vec<TypeKey> = Vec::new();
    for entry in &spec.types {
        let key = entry.type_key();
        if seen.contains(&key) {
            return Some(format!("{key} is configured more than once"));
        }
        let mode = match entry.mode.as_deref() {
            None => None,
            Some(raw) => match SyncMode::parse(raw) {
                Some(mode) => Some(mode),
                None => return Some(format!("unknown sync mode \"{raw}\" for {key}")),
            },
        };
        if key.is_rbac() && mode.is_some_and(|m| m != SyncMode::Propagate) {
            return Some(format!("{key} must use the Propagate mode"));
        }
        seen.push(key);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::TypeEntry;

    fn entry(api_version: &str, kind: &str, mode: Option<&str>) -> TypeEntry {
        TypeEntry {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            mode: mode.map(str::to_string),
        }
    }

    #[test]
    fn duplicate_entries_are_rejected() {
        let spec = ArborConfigurationSpec {
            types: vec![
                entry("v1", "Secret", Some("Propagate")),
                entry("v1", "Secret", Some("Ignore")),
            ],
        };
        assert!(check_spec(&spec).unwrap().contains("more than once"));
    }

    #[test]
    fn unknown_modes_are_rejected() {
        let spec = ArborConfigurationSpec {
            types: vec![entry("v1", "ConfigMap", Some("Sideways"))],
        };
        assert!(check_spec(&spec).unwrap().contains("unknown sync mode"));
    }

    #[test]
    fn rbac_kinds_must_propagate() {
        let spec = ArborConfigurationSpec {
            types: vec![entry("rbac.authorization.k8s.io/v1", "Role", Some("Remove"))],
        };
        assert!(check_spec(&spec).unwrap().contains("Propagate"));

        let ok = ArborConfigurationSpec {
            types: vec![entry(
                "rbac.authorization.k8s.io/v1",
                "Role",
                Some("Propagate"),
            )],
        };
        assert!(check_spec(&ok).is_none());
    }

    #[test]
    fn well_formed_specs_pass() {
        let spec = ArborConfigurationSpec {
            types: vec![
                entry("v1", "Secret", Some("Propagate")),
                entry("v1", "ConfigMap", None),
            ],
        };
        assert!(check_spec(&spec).is_none());
    }
}
