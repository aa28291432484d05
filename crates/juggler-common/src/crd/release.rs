//! Flux release resources (what gets deployed from a source)

use kube::CustomResource;
use serde::{Deserialize, Serialize};

use super::FluxStatus;

/// Reference to a source object, possibly in another namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CrossNamespaceObjectReference {
    /// API version of the referent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    /// Kind of the referent (HelmRepository, GitRepository, OCIRepository)
    #[serde(default)]
    pub kind: String,
    /// Name of the referent
    #[serde(default)]
    pub name: String,
    /// Namespace of the referent, defaults to the release's namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Chart lookup inside a Helm source
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HelmChartTemplateSpec {
    /// Chart name
    #[serde(default)]
    pub chart: String,
    /// Chart version or SemVer range
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Source the chart is fetched from
    #[serde(default)]
    pub source_ref: CrossNamespaceObjectReference,
    /// Interval at which the chart source is checked for updates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
}

/// Chart template wrapper (`spec.chart.spec`)
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HelmChartTemplate {
    /// Chart template spec
    #[serde(default)]
    pub spec: HelmChartTemplateSpec,
}

/// Remediation policy for failed install or upgrade actions
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Remediation {
    /// Number of retries; a negative value retries forever
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<i64>,
}

/// Install configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HelmInstall {
    /// Create the target namespace if missing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_namespace: Option<bool>,
    /// CRD policy (Skip, Create, CreateReplace)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crds: Option<String>,
    /// Remediation on install failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<Remediation>,
}

/// Upgrade configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HelmUpgrade {
    /// CRD policy (Skip, Create, CreateReplace)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crds: Option<String>,
    /// Remediation on upgrade failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<Remediation>,
}

/// Helm release managed by the Flux helm-controller
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "helm.toolkit.fluxcd.io",
    version = "v2",
    kind = "HelmRelease",
    plural = "helmreleases",
    namespaced,
    status = "FluxStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct HelmReleaseSpec {
    /// Chart template (mutually exclusive with `chart_ref`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart: Option<HelmChartTemplate>,

    /// Direct reference to an OCIRepository or HelmChart source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart_ref: Option<CrossNamespaceObjectReference>,

    /// Reconcile interval
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,

    /// Helm release name, defaults to `<targetNamespace>-<name>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_name: Option<String>,

    /// Namespace the chart is installed into
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_namespace: Option<String>,

    /// Install configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install: Option<HelmInstall>,

    /// Upgrade configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade: Option<HelmUpgrade>,

    /// Chart values
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<serde_json::Value>,

    /// Stop reconciling this release
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspend: Option<bool>,
}

/// Kustomization managed by the Flux kustomize-controller
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "kustomize.toolkit.fluxcd.io",
    version = "v1",
    kind = "Kustomization",
    plural = "kustomizations",
    namespaced,
    status = "FluxStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct KustomizationSpec {
    /// Source holding the manifests
    #[serde(default)]
    pub source_ref: CrossNamespaceObjectReference,

    /// Path inside the source artifact
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Reconcile interval
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,

    /// Garbage-collect objects removed from the source
    #[serde(default)]
    pub prune: bool,

    /// Override namespace of all applied objects
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_namespace: Option<String>,

    /// Wait for all applied objects to become ready
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait: Option<bool>,

    /// Stop reconciling this kustomization
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspend: Option<bool>,
}
