//! Juggler: dependency-aware component reconciliation
//!
//! The engine converges a set of components (Helm releases, single API
//! objects, ...) toward their enabled or disabled state in one pass:
//!
//! - [`Component`] describes one installable unit
//! - [`ComponentReconciler`] is a strategy that observes and changes the
//!   cluster for some component kinds ([`FluxReconciler`], [`ObjectReconciler`])
//! - [`Juggler`] routes components to reconcilers, runs the state machine and
//!   collects one [`ComponentResult`] per component
//!
//! All cluster access goes through [`ClusterClient`].

#![deny(missing_docs)]

pub mod client;
pub mod component;
pub mod conditions;
pub mod flux;
pub mod juggler;
pub mod object;
pub mod reconciler;
pub mod status;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{
    create_or_update, ClusterClient, KubeClusterClient, ListOptions, ObjectKey, OperationResult,
};
pub use component::{
    hook, Component, ComponentHooks, ComponentKind, Hook, HookPhase, StatusVisibility,
};
pub use flux::{FluxComponent, FluxReconciler, FluxResource, LabelFunc};
pub use juggler::Juggler;
pub use object::{DetectorContext, ObjectComponent, ObjectIdentity, ObjectReconciler};
pub use reconciler::{run_hook, ComponentReconciler, OrphanDetector};
pub use status::{ComponentObservation, ComponentResult, ComponentStatus, EventClass, Healthiness};

pub use juggler_common::{Error, JugglerConfig, Result};
