//! Record types owned by the controller, served from the `arbor.dev` group.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::metadata::RBAC_TYPES;

/// Machine-readable condition codes surfaced in record statuses.
///
/// Codes starting with `Crit` halt propagation into and within the affected
/// subtree; everything else is informational.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    Hash,
    JsonSchema,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub enum Code {
    #[default]
    CritParentMissing,
    CritParentInvalid,
    CritCycle,
    CritAncestor,
    CritSingletonNameInvalid,
    SubnamespaceConflict,
    CannotUpdate,
    CannotPropagate,
    HNSMissing,
    ObjectReconcilerCreationFailed,
    MultipleConfigurationsForOneType,
}

impl Code {
    pub fn is_critical(self) -> bool {
        matches!(
            self,
            Code::CritParentMissing
                | Code::CritParentInvalid
                | Code::CritCycle
                | Code::CritAncestor
                | Code::CritSingletonNameInvalid
        )
    }
}

impl std::fmt::Display for Code {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub code: Code,
    pub message: String,
    /// Names of the objects this condition is about, when it is not about
    /// the namespace as a whole.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub affects: Vec<String>,
}

impl Condition {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Condition {
            code,
            message: message.into(),
            affects: Vec::new(),
        }
    }
}

/// The per-namespace hierarchy record, fixed name `hierarchy`.
#[derive(Clone, CustomResource, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "arbor.dev",
    version = "v1alpha1",
    kind = "HierarchyConfiguration",
    namespaced,
    status = "HierarchyConfigurationStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct HierarchyConfigurationSpec {
    /// Name of the parent namespace, or unset for a root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Allows this namespace and its subnamespace descendants to be deleted
    /// as a unit.
    #[serde(default)]
    pub allow_cascading_delete: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HierarchyConfigurationStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Declares that a subnamespace with this anchor's name should exist as a
/// child of the namespace the anchor lives in.
#[derive(Clone, CustomResource, Debug, Default, Deserialize, JsonSchema, Serialize)]
#[kube(
    group = "arbor.dev",
    version = "v1alpha1",
    kind = "SubnamespaceAnchor",
    namespaced,
    status = "SubnamespaceAnchorStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct SubnamespaceAnchorSpec {}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
pub enum AnchorState {
    /// The child namespace has not been observed yet.
    #[default]
    Missing,
    Ok,
    /// A namespace of the child's name exists but is not ours.
    Conflict,
    /// The anchor lives in an excluded namespace.
    Forbidden,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubnamespaceAnchorStatus {
    #[serde(default)]
    pub state: AnchorState,
}

/// How one kind of object is synchronized down the tree.
#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
pub enum SyncMode {
    /// Sources are copied into every descendant and kept in sync.
    Propagate,
    /// The reconciler is inert.
    Ignore,
    /// Existing propagated copies are deleted; sources are left alone.
    Remove,
}

impl SyncMode {
    /// Strict parse; unknown strings are the caller's problem (the
    /// configuration validator rejects them, the reconciler maps them to
    /// `Ignore`).
    pub fn parse(raw: &str) -> Option<SyncMode> {
        match raw {
            "Propagate" => Some(SyncMode::Propagate),
            "Ignore" => Some(SyncMode::Ignore),
            "Remove" => Some(SyncMode::Remove),
            _ => None,
        }
    }
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Identity of a configured object kind.
#[derive(Clone, Debug, Deserialize, Eq, Hash, JsonSchema, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeKey {
    pub api_version: String,
    pub kind: String,
}

impl TypeKey {
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        TypeKey {
            api_version: api_version.into(),
            kind: kind.into(),
        }
    }

    /// Role and RoleBinding are forced to `Propagate` by policy.
    pub fn is_rbac(&self) -> bool {
        RBAC_TYPES
            .iter()
            .any(|(av, k)| *av == self.api_version && *k == self.kind)
    }

    /// Group and version halves of `apiVersion`.
    pub fn group_version(&self) -> (&str, &str) {
        match self.api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", self.api_version.as_str()),
        }
    }
}

impl std::fmt::Display for TypeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.api_version, self.kind)
    }
}

/// One entry in the configuration singleton's type list.
#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeEntry {
    pub api_version: String,
    pub kind: String,
    /// One of `Propagate`, `Ignore`, `Remove`. Unset means `Propagate` for
    /// the RBAC kinds and `Ignore` for everything else.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

impl TypeEntry {
    pub fn type_key(&self) -> TypeKey {
        TypeKey::new(&self.api_version, &self.kind)
    }
}

/// The cluster-wide configuration singleton, fixed name `config`.
#[derive(Clone, CustomResource, Debug, Default, Deserialize, JsonSchema, Serialize)]
#[kube(
    group = "arbor.dev",
    version = "v1alpha1",
    kind = "ArborConfiguration",
    status = "ArborConfigurationStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ArborConfigurationSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub types: Vec<TypeEntry>,
}

impl ArborConfigurationSpec {
    /// The spec written at startup when the singleton does not exist.
    pub fn default_types() -> Self {
        ArborConfigurationSpec {
            types: RBAC_TYPES
                .iter()
                .map(|(api_version, kind)| TypeEntry {
                    api_version: (*api_version).to_string(),
                    kind: (*kind).to_string(),
                    mode: Some(SyncMode::Propagate.to_string()),
                })
                .collect(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeStatus {
    pub api_version: String,
    pub kind: String,
    pub mode: String,
    /// Only reported while the type is in `Propagate` mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_source_objects: Option<usize>,
    pub num_propagated_objects: usize,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceCondition {
    pub code: Code,
    pub namespaces: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArborConfigurationStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub types: Vec<TypeStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespace_conditions: Vec<NamespaceCondition>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_serialize_to_their_names() {
        let json = serde_json::to_string(&Code::CritParentMissing).unwrap();
        assert_eq!(json, "\"CritParentMissing\"");
        assert!(Code::CritAncestor.is_critical());
        assert!(!Code::CannotPropagate.is_critical());
    }

    #[test]
    fn sync_mode_parsing() {
        assert_eq!(SyncMode::parse("Propagate"), Some(SyncMode::Propagate));
        assert_eq!(SyncMode::parse("Remove"), Some(SyncMode::Remove));
        assert_eq!(SyncMode::parse("propagate"), None);
        assert_eq!(SyncMode::parse("AllowPropagate"), None);
    }

    #[test]
    fn rbac_types_are_recognized() {
        assert!(TypeKey::new("rbac.authorization.k8s.io/v1", "Role").is_rbac());
        assert!(!TypeKey::new("v1", "ConfigMap").is_rbac());
        assert_eq!(
            TypeKey::new("rbac.authorization.k8s.io/v1", "Role").group_version(),
            ("rbac.authorization.k8s.io", "v1")
        );
        assert_eq!(TypeKey::new("v1", "Secret").group_version(), ("", "v1"));
    }

    #[test]
    fn default_singleton_spec_covers_rbac() {
        let spec = ArborConfigurationSpec::default_types();
        assert_eq!(spec.types.len(), 2);
        assert!(spec.types.iter().all(|t| t.mode.as_deref() == Some("Propagate")));
    }
}
