//! Declared Kubernetes resources
//!
//! Resources are stored next to the cluster document and applied by the
//! `resource-apply` operator once the control plane is up. Each definition
//! carries a revision; the applied revision is recorded on the live object
//! as an annotation so the prober can compare the two.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Annotation carrying the applied revision on live objects
pub const REVISION_ANNOTATION: &str = "cke.cybozu.com/revision";

/// One declared Kubernetes resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDefinition {
    /// Kubernetes kind, e.g. `ServiceAccount`
    pub kind: String,

    /// Namespace; `None` for cluster-scoped kinds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Object name
    pub name: String,

    /// Monotonic revision bumped by the administrator on every edit
    pub revision: i64,

    /// YAML or JSON manifest
    pub manifest: String,
}

impl ResourceDefinition {
    /// Stable key: `<kind>/<namespace>/<name>` (namespace empty when cluster-scoped)
    pub fn key(&self) -> String {
        format!(
            "{}/{}/{}",
            self.kind,
            self.namespace.as_deref().unwrap_or(""),
            self.name
        )
    }
}

/// Declared resources keyed by `ResourceDefinition::key`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    /// Definitions in key order
    pub definitions: BTreeMap<String, ResourceDefinition>,
}

impl Resources {
    /// Definitions in deterministic (key) order
    pub fn iter(&self) -> impl Iterator<Item = &ResourceDefinition> {
        self.definitions.values()
    }

    /// Number of definitions
    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    /// Whether there are no definitions
    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

impl FromIterator<ResourceDefinition> for Resources {
    fn from_iter<I: IntoIterator<Item = ResourceDefinition>>(iter: I) -> Self {
        Self {
            definitions: iter.into_iter().map(|d| (d.key(), d)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(kind: &str, namespace: Option<&str>, name: &str) -> ResourceDefinition {
        ResourceDefinition {
            kind: kind.to_string(),
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
            revision: 1,
            manifest: String::new(),
        }
    }

    #[test]
    fn test_key_includes_empty_namespace_for_cluster_scoped() {
        assert_eq!(definition("ClusterRole", None, "admin").key(), "ClusterRole//admin");
        assert_eq!(
            definition("ServiceAccount", Some("kube-system"), "dns").key(),
            "ServiceAccount/kube-system/dns"
        );
    }

    #[test]
    fn test_iteration_is_key_ordered() {
        let resources: Resources = vec![
            definition("ServiceAccount", Some("kube-system"), "dns"),
            definition("ClusterRole", None, "admin"),
        ]
        .into_iter()
        .collect();
        let kinds: Vec<&str> = resources.iter().map(|d| d.kind.as_str()).collect();
        assert_eq!(kinds, vec!["ClusterRole", "ServiceAccount"]);
    }
}
