//! The Juggler: routes components to reconcilers and runs the install /
//! update / uninstall state machine for each of them
//!
//! One `Juggler` lives for one reconcile pass. The outer controller registers
//! the configured components and the reconcilers, optionally asks for orphaned
//! components, then calls [`Juggler::reconcile`] and converts the results into
//! status conditions.
//!
//! Per component, in order:
//!
//! 1. route to exactly one reconciler by kind
//! 2. observe
//! 3. existing + disabled: PreUninstall, Uninstall (or keep in place)
//! 4. absent + disabled: nothing to do
//! 5. installability check
//! 6. dependency check
//! 7. absent: PreInstall, Install
//! 8. existing: PreUpdate, Update, observe again for health
//!
//! A failure only ends the pass for its own component.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::api::rbac::v1::PolicyRule;
use kube::runtime::events::EventType;
use tracing::{debug, info, instrument, warn};

use crate::component::{Component, ComponentKind};
use crate::reconciler::ComponentReconciler;
use crate::status::{ComponentResult, ComponentStatus, EventClass};
use juggler_common::events::{EventPublisher, NoopEventPublisher};
use juggler_common::{Error, JugglerConfig};

/// Component reconciliation engine for one pass
pub struct Juggler {
    config: JugglerConfig,
    components: Vec<Arc<dyn Component>>,
    reconcilers: Vec<Arc<dyn ComponentReconciler>>,
    events: Arc<dyn EventPublisher>,
    event_target: ObjectReference,
}

impl Juggler {
    /// Create an engine that publishes no events
    pub fn new(config: JugglerConfig) -> Self {
        Self {
            config,
            components: Vec::new(),
            reconcilers: Vec::new(),
            events: Arc::new(NoopEventPublisher),
            event_target: ObjectReference::default(),
        }
    }

    /// Publish one event per component result on `target`
    pub fn with_events(mut self, events: Arc<dyn EventPublisher>, target: ObjectReference) -> Self {
        self.events = events;
        self.event_target = target;
        self
    }

    /// Add a component; reconcile order follows registration order
    pub fn register_component(&mut self, component: Arc<dyn Component>) {
        debug!(component = %component.name(), kind = %component.kind(), "registered component");
        self.components.push(component);
    }

    /// Add several components
    pub fn register_components(&mut self, components: impl IntoIterator<Item = Arc<dyn Component>>) {
        for component in components {
            self.register_component(component);
        }
    }

    /// Add a reconciler
    ///
    /// A kind claimed by more than one reconciler is logged here; components
    /// of that kind end up `ReconcilerNotFound` at reconcile time.
    pub fn register_reconciler(&mut self, reconciler: Arc<dyn ComponentReconciler>) {
        let claimed: BTreeSet<ComponentKind> = self
            .reconcilers
            .iter()
            .flat_map(|r| r.known_kinds())
            .collect();
        for kind in reconciler.known_kinds() {
            if claimed.contains(&kind) {
                warn!(kind = %kind, "kind is claimed by more than one reconciler");
            }
        }
        self.reconcilers.push(reconciler);
    }

    /// Registered components in reconcile order
    pub fn components(&self) -> &[Arc<dyn Component>] {
        &self.components
    }

    /// Kinds claimed by more than one registered reconciler
    pub fn ambiguous_kinds(&self) -> BTreeSet<ComponentKind> {
        let mut claims: BTreeMap<ComponentKind, usize> = BTreeMap::new();
        for reconciler in &self.reconcilers {
            for kind in reconciler.known_kinds() {
                *claims.entry(kind).or_default() += 1;
            }
        }
        claims
            .into_iter()
            .filter(|(_, count)| *count > 1)
            .map(|(kind, _)| kind)
            .collect()
    }

    /// RBAC rules contributed by the enabled components
    pub fn policy_rules(&self) -> Vec<PolicyRule> {
        let mut rules: Vec<PolicyRule> = Vec::new();
        for component in self.components.iter().filter(|c| c.is_enabled()) {
            for rule in component.policy_rules() {
                if !rules.contains(&rule) {
                    rules.push(rule);
                }
            }
        }
        rules
    }

    /// Ask every orphan-detecting reconciler for installed components that are
    /// no longer configured, and register them (they are disabled, so the pass
    /// removes them)
    ///
    /// Detection continues past a failing reconciler. Whatever was found is
    /// registered; the failures are then returned together.
    pub async fn register_orphaned_components(&mut self) -> Result<usize, Error> {
        let mut orphans: Vec<Arc<dyn Component>> = Vec::new();
        let mut failures: Vec<String> = Vec::new();

        for reconciler in &self.reconcilers {
            let Some(detector) = reconciler.as_orphan_detector() else {
                continue;
            };
            match detector.detect_orphaned_components(&self.components).await {
                Ok(found) => orphans.extend(found),
                Err(e) => {
                    warn!(error = %e, "orphan detection failed");
                    failures.push(e.to_string());
                }
            }
        }

        let count = orphans.len();
        for orphan in orphans {
            info!(component = %orphan.name(), kind = %orphan.kind(), "registering orphaned component");
            self.register_component(orphan);
        }

        if failures.is_empty() {
            Ok(count)
        } else {
            Err(Error::internal_with_context("orphans", failures.join("; ")))
        }
    }

    /// Reconcile every registered component once, in registration order
    #[instrument(skip(self), fields(components = self.components.len()))]
    pub async fn reconcile(&self) -> Vec<ComponentResult> {
        let mut results = Vec::with_capacity(self.components.len());
        for component in &self.components {
            let result = self.reconcile_component(component).await;
            self.publish(&result).await;
            results.push(result);
        }

        let ready = results.iter().filter(|r| r.is_ready()).count();
        info!(ready, total = results.len(), "reconcile pass finished");
        results
    }

    #[instrument(skip_all, fields(component = %component.name(), kind = %component.kind()))]
    async fn reconcile_component(&self, component: &Arc<dyn Component>) -> ComponentResult {
        let (status, message) = self.converge(component.as_ref()).await;
        if status.is_ready() {
            debug!(status = %status, "component converged");
        } else {
            warn!(status = %status, message = %message, "component not ready");
        }
        ComponentResult::new(component.clone(), status, message)
    }

    async fn converge(&self, component: &dyn Component) -> (ComponentStatus, String) {
        let name = component.name();

        let reconciler = match self.route(component.kind()) {
            Ok(reconciler) => reconciler,
            Err(message) => return (ComponentStatus::ReconcilerNotFound, message),
        };

        let observation = match reconciler.observe(component).await {
            Ok(observation) => observation,
            Err(e) => return (ComponentStatus::ObservationFailed, e.to_string()),
        };

        if !component.is_enabled() {
            if !observation.resource_exists {
                return (ComponentStatus::Disabled, format!("{} is disabled.", name));
            }
            return self.remove(reconciler, component).await;
        }

        match component.is_installable().await {
            Ok(true) => {}
            Ok(false) => {
                return (
                    ComponentStatus::ComponentNotAllowed,
                    format!("{} is not allowed to be installed.", name),
                )
            }
            Err(e) => return (ComponentStatus::InstallFailed, e.to_string()),
        }

        if let Err(message) = self.check_dependencies(component) {
            return (ComponentStatus::DependencyCheckFailed, message);
        }

        if !observation.resource_exists {
            if let Err(e) = reconciler.pre_install(component).await {
                return (ComponentStatus::InstallFailed, e.to_string());
            }
            if let Err(e) = reconciler.install(component).await {
                return (ComponentStatus::InstallFailed, e.to_string());
            }
            return (
                ComponentStatus::Installed,
                format!("{} has been installed successfully.", name),
            );
        }

        if let Err(e) = reconciler.pre_update(component).await {
            return (ComponentStatus::UpdateFailed, e.to_string());
        }
        if let Err(e) = reconciler.update(component).await {
            return (ComponentStatus::UpdateFailed, e.to_string());
        }
        match reconciler.observe(component).await {
            Ok(observation) if observation.healthiness.healthy => {
                (ComponentStatus::Healthy, observation.healthiness.message)
            }
            Ok(observation) => (ComponentStatus::Unhealthy, observation.healthiness.message),
            Err(e) => (ComponentStatus::ObservationFailed, e.to_string()),
        }
    }

    async fn remove(
        &self,
        reconciler: &dyn ComponentReconciler,
        component: &dyn Component,
    ) -> (ComponentStatus, String) {
        let name = component.name();

        if component.keep_on_uninstall() && self.config.honor_keep_on_uninstall {
            info!("keeping resources of disabled component");
            return (
                ComponentStatus::Uninstalled,
                format!(
                    "{} has been marked as uninstalled; its resources are kept in place.",
                    name
                ),
            );
        }

        if let Err(e) = reconciler.pre_uninstall(component).await {
            return (ComponentStatus::UninstallFailed, e.to_string());
        }
        if let Err(e) = reconciler.uninstall(component).await {
            return (ComponentStatus::UninstallFailed, e.to_string());
        }
        (
            ComponentStatus::Uninstalled,
            format!("{} has been uninstalled successfully.", name),
        )
    }

    fn route(&self, kind: ComponentKind) -> Result<&dyn ComponentReconciler, String> {
        let mut matches = self
            .reconcilers
            .iter()
            .filter(|r| r.known_kinds().contains(&kind));

        match (matches.next(), matches.count()) {
            (None, _) => Err(format!("no reconciler registered for kind {}", kind)),
            (Some(reconciler), 0) => Ok(reconciler.as_ref()),
            (Some(_), others) => Err(format!(
                "ambiguous reconciler for kind {}: claimed by {} reconcilers",
                kind,
                others + 1
            )),
        }
    }

    fn check_dependencies(&self, component: &dyn Component) -> Result<(), String> {
        for dependency in component.dependencies() {
            match self.components.iter().find(|c| c.kind() == dependency) {
                None => return Err(format!("dependency {} is not registered", dependency)),
                Some(found) if !found.is_enabled() => {
                    return Err(format!(
                        "dependency {} ({}) is not enabled",
                        dependency,
                        found.name()
                    ))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    async fn publish(&self, result: &ComponentResult) {
        let type_ = match result.status.event_class() {
            EventClass::None => return,
            EventClass::Normal => EventType::Normal,
            EventClass::Warning => EventType::Warning,
        };
        let reason = format!("{}{}", result.component.name(), result.status);
        let note = (!result.message.is_empty()).then(|| result.message.clone());
        self.events
            .publish(
                &self.event_target,
                type_,
                &reason,
                &self.config.event_action,
                note,
            )
            .await;
    }
}
