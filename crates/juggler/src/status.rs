//! Per-component results of a reconcile pass

use std::fmt;
use std::sync::Arc;

use crate::component::Component;

/// Terminal status of one component after a pass
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ComponentStatus {
    /// No reconciler (or more than one) claims the component's kind
    ReconcilerNotFound,
    /// Reading the component's resources failed
    ObservationFailed,
    /// PreUninstall or Uninstall failed
    UninstallFailed,
    /// The component was removed (or marked removed)
    Uninstalled,
    /// Disabled and nothing is installed
    Disabled,
    /// The component reported it may not be installed
    ComponentNotAllowed,
    /// A dependency is missing or disabled
    DependencyCheckFailed,
    /// PreInstall or Install failed
    InstallFailed,
    /// Freshly installed
    Installed,
    /// PreUpdate or Update failed
    UpdateFailed,
    /// Installed but not healthy
    Unhealthy,
    /// Installed and healthy
    Healthy,
}

/// How a status is surfaced as a Kubernetes Event
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventClass {
    /// Steady state, no event
    None,
    /// Normal event
    Normal,
    /// Warning event
    Warning,
}

impl ComponentStatus {
    /// Status name as used in condition reasons and event reasons
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReconcilerNotFound => "ReconcilerNotFound",
            Self::ObservationFailed => "ObservationFailed",
            Self::UninstallFailed => "UninstallFailed",
            Self::Uninstalled => "Uninstalled",
            Self::Disabled => "Disabled",
            Self::ComponentNotAllowed => "ComponentNotAllowed",
            Self::DependencyCheckFailed => "DependencyCheckFailed",
            Self::InstallFailed => "InstallFailed",
            Self::Installed => "Installed",
            Self::UpdateFailed => "UpdateFailed",
            Self::Unhealthy => "Unhealthy",
            Self::Healthy => "Healthy",
        }
    }

    /// Whether the component counts as converged
    pub fn is_ready(&self) -> bool {
        matches!(
            self,
            Self::Uninstalled | Self::Disabled | Self::Installed | Self::Healthy
        )
    }

    /// Event class of the status
    pub fn event_class(&self) -> EventClass {
        match self {
            Self::Disabled | Self::Healthy => EventClass::None,
            Self::Uninstalled | Self::Installed => EventClass::Normal,
            Self::ReconcilerNotFound
            | Self::ObservationFailed
            | Self::UninstallFailed
            | Self::ComponentNotAllowed
            | Self::DependencyCheckFailed
            | Self::InstallFailed
            | Self::UpdateFailed
            | Self::Unhealthy => EventClass::Warning,
        }
    }
}

impl fmt::Display for ComponentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health verdict with a human-readable explanation
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Healthiness {
    /// Whether the resources are healthy
    pub healthy: bool,
    /// Why not, when unhealthy
    pub message: String,
}

impl Healthiness {
    /// Healthy, no message
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            message: String::new(),
        }
    }

    /// Unhealthy with a reason
    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            healthy: false,
            message: message.into(),
        }
    }

    /// Conjunction of two verdicts; non-empty messages are joined by newlines
    pub fn and(self, other: Healthiness) -> Self {
        let message = match (self.message.is_empty(), other.message.is_empty()) {
            (true, _) => other.message,
            (false, true) => self.message,
            (false, false) => format!("{}\n{}", self.message, other.message),
        };
        Self {
            healthy: self.healthy && other.healthy,
            message,
        }
    }
}

/// What a reconciler saw when it looked at a component's resources
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComponentObservation {
    /// Whether any of the component's resources exist
    pub resource_exists: bool,
    /// Health of the resources (meaningless when nothing exists)
    pub healthiness: Healthiness,
}

impl ComponentObservation {
    /// Resources exist with the given health
    pub fn exists(healthiness: Healthiness) -> Self {
        Self {
            resource_exists: true,
            healthiness,
        }
    }

    /// Nothing is installed
    pub fn absent() -> Self {
        Self {
            resource_exists: false,
            healthiness: Healthiness::unhealthy("not found"),
        }
    }
}

/// Outcome for one component in a pass
#[derive(Clone)]
pub struct ComponentResult {
    /// The component reconciled
    pub component: Arc<dyn Component>,
    /// Terminal status
    pub status: ComponentStatus,
    /// Human-readable detail (error text, health message, ...)
    pub message: String,
}

impl ComponentResult {
    /// Build a result
    pub fn new(
        component: Arc<dyn Component>,
        status: ComponentStatus,
        message: impl Into<String>,
    ) -> Self {
        Self {
            component,
            status,
            message: message.into(),
        }
    }

    /// Whether the component counts as converged
    pub fn is_ready(&self) -> bool {
        self.status.is_ready()
    }
}

impl fmt::Debug for ComponentResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentResult")
            .field("component", &self.component.name())
            .field("status", &self.status)
            .field("message", &self.message)
            .finish()
    }
}
