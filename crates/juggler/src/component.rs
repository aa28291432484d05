//! Component model
//!
//! A component is one installable sub-system (a Helm release, a copied
//! secret, an admission policy, ...). The outer controller builds the list of
//! components for a pass; the Juggler converges each one toward its
//! enabled/disabled state.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use k8s_openapi::api::rbac::v1::PolicyRule;

use crate::client::ClusterClient;
use crate::flux::FluxComponent;
use crate::object::ObjectComponent;
use juggler_common::Error;

/// Identifier of a concrete component type
///
/// Reconcilers claim kinds, dependencies name kinds, and orphan detection
/// compares components of the same kind only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentKind(&'static str);

impl ComponentKind {
    /// Declare a kind
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    /// The kind identifier
    pub const fn as_str(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Whether a component's status condition is part of the public API
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StatusVisibility {
    /// Reported as `<Name>Ready`
    #[default]
    External,
    /// Reported as `<name>Ready` (first letter lowercased)
    Internal,
}

/// Lifecycle hook phases
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookPhase {
    /// Before the first install
    PreInstall,
    /// Before every update of an existing installation
    PreUpdate,
    /// Before uninstalling
    PreUninstall,
}

impl fmt::Display for HookPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PreInstall => write!(f, "PreInstall"),
            Self::PreUpdate => write!(f, "PreUpdate"),
            Self::PreUninstall => write!(f, "PreUninstall"),
        }
    }
}

/// A lifecycle hook. It receives the reconciler's own cluster client.
pub type Hook =
    Arc<dyn Fn(Arc<dyn ClusterClient>) -> BoxFuture<'static, Result<(), Error>> + Send + Sync>;

/// Wrap an async function as a [`Hook`]
pub fn hook<F, Fut>(f: F) -> Hook
where
    F: Fn(Arc<dyn ClusterClient>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Error>> + Send + 'static,
{
    Arc::new(move |client| Box::pin(f(client)))
}

/// Hooks a component declares; unset hooks are no-ops
#[derive(Clone, Default)]
pub struct ComponentHooks {
    /// Runs before install
    pub pre_install: Option<Hook>,
    /// Runs before update
    pub pre_update: Option<Hook>,
    /// Runs before uninstall
    pub pre_uninstall: Option<Hook>,
}

impl ComponentHooks {
    /// Set the pre-install hook
    pub fn with_pre_install<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<dyn ClusterClient>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        self.pre_install = Some(hook(f));
        self
    }

    /// Set the pre-update hook
    pub fn with_pre_update<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<dyn ClusterClient>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        self.pre_update = Some(hook(f));
        self
    }

    /// Set the pre-uninstall hook
    pub fn with_pre_uninstall<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<dyn ClusterClient>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        self.pre_uninstall = Some(hook(f));
        self
    }

    /// The hook for a phase, if declared
    pub fn get(&self, phase: HookPhase) -> Option<&Hook> {
        match phase {
            HookPhase::PreInstall => self.pre_install.as_ref(),
            HookPhase::PreUpdate => self.pre_update.as_ref(),
            HookPhase::PreUninstall => self.pre_uninstall.as_ref(),
        }
    }
}

impl fmt::Debug for ComponentHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentHooks")
            .field("pre_install", &self.pre_install.is_some())
            .field("pre_update", &self.pre_update.is_some())
            .field("pre_uninstall", &self.pre_uninstall.is_some())
            .finish()
    }
}

/// A unit of desired state the engine converges toward or away from
///
/// Optional capabilities have defaults, so a component only overrides what it
/// supports. Strategy-specific behavior is exposed through `as_flux` and
/// `as_object`.
#[async_trait]
pub trait Component: Send + Sync {
    /// Display name, also used for condition types and event reasons
    fn name(&self) -> &str;

    /// Concrete kind of this component
    fn kind(&self) -> ComponentKind;

    /// Kinds that must be registered and enabled before this one installs
    fn dependencies(&self) -> Vec<ComponentKind> {
        Vec::new()
    }

    /// Whether the component should be installed (true) or removed (false)
    fn is_enabled(&self) -> bool;

    /// Lifecycle hooks
    fn hooks(&self) -> ComponentHooks {
        ComponentHooks::default()
    }

    /// Whether the component may be installed right now
    async fn is_installable(&self) -> Result<bool, Error> {
        Ok(true)
    }

    /// Leave installed resources in place when the component is disabled
    fn keep_on_uninstall(&self) -> bool {
        false
    }

    /// Visibility of the component's status condition
    fn status_visibility(&self) -> StatusVisibility {
        StatusVisibility::External
    }

    /// RBAC rules the operator needs while this component is enabled
    fn policy_rules(&self) -> Vec<PolicyRule> {
        Vec::new()
    }

    /// Flux view of this component
    fn as_flux(&self) -> Option<&dyn FluxComponent> {
        None
    }

    /// Object view of this component
    fn as_object(&self) -> Option<&dyn ObjectComponent> {
        None
    }
}

impl fmt::Debug for dyn Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Component")
            .field("name", &self.name())
            .field("kind", &self.kind())
            .field("enabled", &self.is_enabled())
            .finish()
    }
}
