//! Reconciliation strategy contract
//!
//! A `ComponentReconciler` drives one family of components (Flux releases,
//! plain objects, ...). The Juggler routes each component to the single
//! reconciler whose `known_kinds` contains the component's kind.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::client::ClusterClient;
use crate::component::{Component, ComponentKind, HookPhase};
use crate::status::ComponentObservation;
use juggler_common::Error;

/// Strategy that knows how to observe, install, update and uninstall
/// components of particular kinds
#[async_trait]
pub trait ComponentReconciler: Send + Sync {
    /// Kinds this reconciler handles
    fn known_kinds(&self) -> BTreeSet<ComponentKind>;

    /// Read the component's resources from the cluster
    async fn observe(&self, component: &dyn Component) -> Result<ComponentObservation, Error>;

    /// Create the component's resources
    async fn install(&self, component: &dyn Component) -> Result<(), Error>;

    /// Converge existing resources; must be idempotent
    async fn update(&self, component: &dyn Component) -> Result<(), Error>;

    /// Remove the component's resources
    async fn uninstall(&self, component: &dyn Component) -> Result<(), Error>;

    /// Run the component's PreInstall hook
    async fn pre_install(&self, component: &dyn Component) -> Result<(), Error>;

    /// Run the component's PreUpdate hook
    async fn pre_update(&self, component: &dyn Component) -> Result<(), Error>;

    /// Run the component's PreUninstall hook
    async fn pre_uninstall(&self, component: &dyn Component) -> Result<(), Error>;

    /// Orphan detection, for reconcilers that support it
    fn as_orphan_detector(&self) -> Option<&dyn OrphanDetector> {
        None
    }
}

/// Finds installed components that are no longer configured
#[async_trait]
pub trait OrphanDetector: Send + Sync {
    /// Components present in the cluster with no counterpart in `configured`
    async fn detect_orphaned_components(
        &self,
        configured: &[Arc<dyn Component>],
    ) -> Result<Vec<Arc<dyn Component>>, Error>;
}

/// Run a component's hook for `phase` with the given client
///
/// A component without a hook for the phase is a no-op. Hook errors come
/// back wrapped in `Error::Hook`.
pub async fn run_hook(
    component: &dyn Component,
    phase: HookPhase,
    client: Arc<dyn ClusterClient>,
) -> Result<(), Error> {
    let hooks = component.hooks();
    let Some(hook) = hooks.get(phase) else {
        return Ok(());
    };

    debug!(component = %component.name(), phase = %phase, "running hook");
    hook(client)
        .await
        .map_err(|e| Error::hook(phase.to_string(), e))
}
