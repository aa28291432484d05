//! Resource types used by the engine
//!
//! Flux source and release kinds the `FluxReconciler` writes, plus the
//! condition type component results are converted into.

mod release;
mod source;
mod types;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition as MetaCondition;
use serde::{Deserialize, Serialize};

pub use release::{
    CrossNamespaceObjectReference, HelmChartTemplate, HelmChartTemplateSpec, HelmInstall,
    HelmRelease, HelmReleaseSpec, HelmUpgrade, Kustomization, KustomizationSpec, Remediation,
};
pub use source::{
    GitRepository, GitRepositoryRef, GitRepositorySpec, HelmRepository, HelmRepositorySpec,
    OCIRepository, OCIRepositorySpec, OciRepositoryRef,
};
pub use types::{set_condition, Condition, ConditionStatus};

/// Condition type Flux controllers use to report readiness
pub const FLUX_READY_CONDITION: &str = "Ready";

/// Status shared by all Flux kinds the engine reads
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FluxStatus {
    /// Last generation the controller acted on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Standard conditions (Ready, Reconciling, Stalled, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<MetaCondition>>,
}

impl FluxStatus {
    /// The `Ready` condition, if reported
    pub fn ready_condition(&self) -> Option<&MetaCondition> {
        self.conditions
            .as_ref()
            .and_then(|conds| conds.iter().find(|c| c.type_ == FLUX_READY_CONDITION))
    }

    /// Whether the controller reports `Ready=True` for the given generation
    ///
    /// A status older than `generation` still describes the previous spec and
    /// does not count.
    pub fn is_ready_for(&self, generation: Option<i64>) -> bool {
        let ready = self
            .ready_condition()
            .map(|c| c.status == "True")
            .unwrap_or(false);
        let current = match (self.observed_generation, generation) {
            (Some(observed), Some(generation)) => observed >= generation,
            _ => true,
        };
        ready && current
    }
}
