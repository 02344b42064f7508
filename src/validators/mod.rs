//! Admission-time enforcement of the hierarchy invariants.
//!
//! Every check here is mirrored by reconciler behavior, so the system still
//! converges when a webhook is bypassed; the validators exist to stop bad
//! states before they land. All of them fail closed except the object
//! validator, which fails open so a webhook outage cannot wedge workloads.

pub mod anchor;
pub mod hierarchy;
pub mod namespace;
pub mod object;
pub mod typeconfig;

use std::collections::HashSet;
use std::sync::Arc;

use kube::Client;
use kube::core::admission::AdmissionRequest;

use crate::authz::AdminChecker;
use crate::forest::SharedForest;

/// Outcome of one admission check.
#[derive(Debug, PartialEq)]
pub enum Verdict {
    Allow,
    Deny(String),
}

impl Verdict {
    pub fn deny(reason: impl Into<String>) -> Self {
        Verdict::Deny(reason.into())
    }
}

/// Everything the validators read. Cheap to clone into axum handlers.
#[derive(Clone)]
pub struct ValidatorState {
    pub forest: SharedForest,
    pub excluded: Arc<HashSet<String>>,
    pub admin: Arc<dyn AdminChecker>,
    /// Absent only in tests; the configuration validator fails closed
    /// without it.
    pub client: Option<Client>,
    pub service_account: String,
}

impl ValidatorState {
    pub fn is_excluded(&self, namespace: &str) -> bool {
        self.excluded.contains(namespace)
    }

    /// The controller's own writes are never second-guessed.
    pub fn is_controller<T: kube::Resource>(&self, req: &AdmissionRequest<T>) -> bool {
        req.user_info.username.as_deref() == Some(self.service_account.as_str())
    }
}

/// Maps a check outcome onto the wire response. `fail_open` is true only
/// for the object validator.
pub(crate) fn respond<T: kube::Resource>(
    req: &kube::core::admission::AdmissionRequest<T>,
    verdict: crate::error::Result<Verdict>,
    fail_open: bool,
) -> kube::core::admission::AdmissionResponse {
    use kube::core::admission::AdmissionResponse;
    match verdict {
        Ok(Verdict::Allow) => AdmissionResponse::from(req),
        Ok(Verdict::Deny(reason)) => AdmissionResponse::from(req).deny(reason),
        Err(err) if fail_open => {
            tracing::warn!(%err, "validator error, admitting anyway");
            AdmissionResponse::from(req)
        }
        Err(err) => AdmissionResponse::from(req).deny(format!("validation unavailable: {err}")),
    }
}
