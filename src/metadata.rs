//! Well-known names shared between the reconcilers, the validators and the
//! records they manage.

/// API group of every record this controller owns.
pub const API_GROUP: &str = "arbor.dev";

/// Fixed name of the per-namespace hierarchy record.
pub const HIERARCHY_SINGLETON: &str = "hierarchy";

/// Fixed name of the cluster-wide configuration singleton.
pub const CONFIG_SINGLETON: &str = "config";

/// Annotation on a namespace naming the parent that owns its lifecycle.
/// Presence of this annotation is what makes a namespace a subnamespace.
pub const SUBNAMESPACE_OF: &str = "arbor.dev/subnamespace-of";

/// Label on a propagated copy naming the namespace its source lives in.
pub const INHERITED_FROM: &str = "arbor.dev/inherited-from";

/// Finalizer on a hierarchy record while its namespace hosts anchors.
pub const ANCHORS_PRESENT_FINALIZER: &str = "arbor.dev/anchors-present";

/// Finalizer on an anchor so an admitted deletion can cascade to the child.
pub const SUBNAMESPACE_FINALIZER: &str = "arbor.dev/subnamespace";

/// Secrets of this type are never propagated.
pub const SA_TOKEN_SECRET: &str = "kubernetes.io/service-account-token";

const DEPTH_SUFFIX: &str = ".tree.arbor.dev/depth";

/// Namespaces the controller refuses to touch unless overridden.
pub const DEFAULT_EXCLUDED_NAMESPACES: [&str; 4] =
    ["kube-system", "kube-public", "arbor-system", "cert-manager"];

/// Kinds that must always propagate, regardless of the configuration.
pub const RBAC_TYPES: [(&str, &str); 2] = [
    ("rbac.authorization.k8s.io/v1", "Role"),
    ("rbac.authorization.k8s.io/v1", "RoleBinding"),
];

/// Label key recording the distance from a namespace to `ancestor`.
pub fn depth_label(ancestor: &str) -> String {
    format!("{ancestor}{DEPTH_SUFFIX}")
}

pub fn is_depth_label(key: &str) -> bool {
    key.ends_with(DEPTH_SUFFIX)
}
