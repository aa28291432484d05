//! Flux source-controller resources (artifact repositories)
//!
//! Only the fields the engine writes or reads are modelled. The CRDs are
//! installed by Flux itself, so no schema is generated here.

use k8s_openapi::api::core::v1::LocalObjectReference;
use kube::CustomResource;
use serde::{Deserialize, Serialize};

use super::FluxStatus;

/// Helm chart repository (HTTP index or OCI registry)
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "source.toolkit.fluxcd.io",
    version = "v1",
    kind = "HelmRepository",
    plural = "helmrepositories",
    namespaced,
    status = "FluxStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct HelmRepositorySpec {
    /// Repository URL (`https://` index or `oci://` registry)
    #[serde(default)]
    pub url: String,

    /// Repository type: `default` or `oci`
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,

    /// Reconcile interval (Flux duration, e.g. "1m0s")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,

    /// Timeout for index download operations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,

    /// Secret with registry or basic-auth credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<LocalObjectReference>,

    /// Cloud provider used for OCI authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    /// Allow plain-HTTP registries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insecure: Option<bool>,

    /// Stop reconciling this repository
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspend: Option<bool>,
}

/// Git reference to check out
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GitRepositoryRef {
    /// Branch name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// Tag name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    /// SemVer range over tags
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semver: Option<String>,
    /// Exact commit SHA
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
}

/// Git repository source
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "source.toolkit.fluxcd.io",
    version = "v1",
    kind = "GitRepository",
    plural = "gitrepositories",
    namespaced,
    status = "FluxStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct GitRepositorySpec {
    /// Clone URL
    #[serde(default)]
    pub url: String,

    /// Reference to check out
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub ref_: Option<GitRepositoryRef>,

    /// Reconcile interval
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,

    /// Timeout for git operations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,

    /// Secret with SSH or HTTPS credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<LocalObjectReference>,

    /// Paths to exclude from the artifact (gitignore format)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ignore: Option<String>,

    /// Stop reconciling this repository
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspend: Option<bool>,
}

/// OCI artifact reference
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OciRepositoryRef {
    /// Image tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    /// SemVer range over tags
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semver: Option<String>,
    /// Image digest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

/// OCI artifact source
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "source.toolkit.fluxcd.io",
    version = "v1beta2",
    kind = "OCIRepository",
    plural = "ocirepositories",
    namespaced,
    status = "FluxStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct OCIRepositorySpec {
    /// Artifact URL (`oci://`)
    #[serde(default)]
    pub url: String,

    /// Reference to pull
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub ref_: Option<OciRepositoryRef>,

    /// Reconcile interval
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,

    /// Timeout for pull operations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,

    /// Secret with registry credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<LocalObjectReference>,

    /// Cloud provider used for authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    /// Allow plain-HTTP registries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insecure: Option<bool>,

    /// Stop reconciling this repository
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspend: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::Resource;

    #[test]
    fn test_helm_repository_wire_format() {
        let mut repo = HelmRepository::new(
            "crossplane",
            HelmRepositorySpec {
                url: "oci://xpkg.upbound.io/crossplane".to_string(),
                type_: Some("oci".to_string()),
                ..Default::default()
            },
        );
        repo.meta_mut().namespace = Some("flux-system".to_string());

        let json = serde_json::to_value(&repo).unwrap();
        assert_eq!(json["apiVersion"], "source.toolkit.fluxcd.io/v1");
        assert_eq!(json["kind"], "HelmRepository");
        assert_eq!(json["spec"]["type"], "oci");
        assert!(json["spec"].get("suspend").is_none());
    }

    #[test]
    fn test_git_repository_ref_field_name() {
        let spec = GitRepositorySpec {
            url: "https://github.com/org/platform.git".to_string(),
            ref_: Some(GitRepositoryRef {
                branch: Some("main".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["ref"]["branch"], "main");
    }

    #[test]
    fn test_oci_repository_api_version() {
        assert_eq!(
            OCIRepository::api_version(&()),
            "source.toolkit.fluxcd.io/v1beta2"
        );
        assert_eq!(OCIRepository::plural(&()), "ocirepositories");
    }
}
