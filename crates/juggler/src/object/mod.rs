//! Object reconciliation strategy
//!
//! An object component owns exactly one API object (a copied Secret, an
//! admission policy, a ConfigMap, ...). The component names the object and
//! fills in its content; the reconciler does the get / create / update /
//! delete plumbing and stamps ownership labels (managed-by, component name
//! and component kind).

mod orphan;

pub use orphan::{same_object_identity, ConvertFn, DetectorContext, OrphanedObject, SameFn};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use kube::{Resource, ResourceExt};
use tracing::{debug, info};

use crate::client::{create_or_update, ClusterClient, ObjectKey};
use crate::component::{Component, ComponentKind, HookPhase};
use crate::reconciler::{run_hook, ComponentReconciler, OrphanDetector};
use crate::status::{ComponentObservation, Healthiness};
use juggler_common::error::ignore_missing;
use juggler_common::{Error, JugglerConfig, LABEL_MANAGED_BY};

/// Type and namespaced name of the object a component owns
#[derive(Clone, Debug)]
pub struct ObjectIdentity {
    /// API resource of the object's kind
    pub api_resource: ApiResource,
    /// Namespace and name
    pub key: ObjectKey,
}

impl ObjectIdentity {
    /// Identity from an API resource and key
    pub fn new(api_resource: ApiResource, key: ObjectKey) -> Self {
        Self { api_resource, key }
    }

    /// Identity of a typed object
    pub fn of<K: Resource<DynamicType = ()>>(key: ObjectKey) -> Self {
        Self::new(ApiResource::erase::<K>(&()), key)
    }

    /// An object with only this identity set
    pub fn shell(&self) -> DynamicObject {
        let mut obj = DynamicObject::new(&self.key.name, &self.api_resource);
        obj.metadata.namespace = self.key.namespace.clone();
        obj
    }

    /// Whether both identities name the same object
    pub fn same_as(&self, other: &ObjectIdentity) -> bool {
        self.api_resource.api_version == other.api_resource.api_version
            && self.api_resource.kind == other.api_resource.kind
            && self.key == other.key
    }
}

/// Component that owns a single API object
#[async_trait]
pub trait ObjectComponent: Component {
    /// Which object this component owns
    fn build_object_to_reconcile(&self) -> Result<ObjectIdentity, Error>;

    /// Bring `obj` to the desired content
    ///
    /// Called with the current object, or with an identity-only shell when the
    /// object does not exist yet. Must not change name or namespace.
    async fn reconcile_object(&self, obj: &mut DynamicObject) -> Result<(), Error>;

    /// Health of the object as it exists in the cluster
    fn is_object_healthy(&self, obj: &DynamicObject) -> Healthiness;
}

/// `ComponentReconciler` for object components, with optional orphan
/// detection per kind
pub struct ObjectReconciler {
    client: Arc<dyn ClusterClient>,
    config: JugglerConfig,
    kinds: BTreeMap<ComponentKind, Option<DetectorContext>>,
}

impl ObjectReconciler {
    /// Reconciler with no kinds
    pub fn new(client: Arc<dyn ClusterClient>, config: &JugglerConfig) -> Self {
        Self {
            client,
            config: config.clone(),
            kinds: BTreeMap::new(),
        }
    }

    /// Claim a component kind without orphan detection
    pub fn with_kind(mut self, kind: ComponentKind) -> Self {
        self.kinds.entry(kind).or_insert(None);
        self
    }

    /// Claim a component kind and detect its orphans with `detector`
    pub fn with_orphan_detection(mut self, kind: ComponentKind, detector: DetectorContext) -> Self {
        self.kinds.insert(kind, Some(detector));
        self
    }

    fn object_view<'a>(&self, component: &'a dyn Component) -> Result<&'a dyn ObjectComponent, Error> {
        component.as_object().ok_or_else(|| {
            Error::component(component.name(), "does not support the object strategy")
        })
    }

    async fn apply(&self, component: &dyn Component) -> Result<(), Error> {
        let object = self.object_view(component)?;
        let identity = object.build_object_to_reconcile()?;
        let managed_by = self.config.managed_by.clone();
        let component_key = self.config.component_label_key.clone();
        let kind_key = self.config.component_kind_label_key.clone();
        let name = component.name().to_string();
        let kind = component.kind();

        let result = create_or_update(
            self.client.as_ref(),
            &identity.api_resource,
            identity.shell(),
            |mut obj| async move {
                let labels = obj.labels_mut();
                labels.insert(LABEL_MANAGED_BY.to_string(), managed_by);
                labels.insert(component_key, name);
                labels.insert(kind_key, kind.to_string());
                object.reconcile_object(&mut obj).await?;
                Ok(obj)
            },
        )
        .await?;

        debug!(
            kind = %identity.api_resource.kind,
            object = %identity.key,
            result = ?result,
            "reconciled object"
        );
        Ok(())
    }
}

#[async_trait]
impl ComponentReconciler for ObjectReconciler {
    fn known_kinds(&self) -> BTreeSet<ComponentKind> {
        self.kinds.keys().copied().collect()
    }

    async fn observe(&self, component: &dyn Component) -> Result<ComponentObservation, Error> {
        let object = self.object_view(component)?;
        let identity = object.build_object_to_reconcile()?;

        match self.client.get(&identity.api_resource, &identity.key).await {
            Ok(Some(actual)) => Ok(ComponentObservation::exists(
                object.is_object_healthy(&actual),
            )),
            Ok(None) => Ok(ComponentObservation::absent()),
            Err(e) if e.is_kind_not_found() => {
                debug!(kind = %identity.api_resource.kind, "kind not served, treating object as absent");
                Ok(ComponentObservation::absent())
            }
            Err(e) => Err(e),
        }
    }

    async fn install(&self, component: &dyn Component) -> Result<(), Error> {
        info!(component = %component.name(), "installing object component");
        self.apply(component).await
    }

    async fn update(&self, component: &dyn Component) -> Result<(), Error> {
        self.apply(component).await
    }

    async fn uninstall(&self, component: &dyn Component) -> Result<(), Error> {
        let object = self.object_view(component)?;
        let identity = object.build_object_to_reconcile()?;
        info!(component = %component.name(), object = %identity.key, "uninstalling object component");
        let result = self
            .client
            .delete(&identity.api_resource, &identity.key)
            .await;
        ignore_missing(result)
    }

    async fn pre_install(&self, component: &dyn Component) -> Result<(), Error> {
        run_hook(component, HookPhase::PreInstall, self.client.clone()).await
    }

    async fn pre_update(&self, component: &dyn Component) -> Result<(), Error> {
        run_hook(component, HookPhase::PreUpdate, self.client.clone()).await
    }

    async fn pre_uninstall(&self, component: &dyn Component) -> Result<(), Error> {
        run_hook(component, HookPhase::PreUninstall, self.client.clone()).await
    }

    fn as_orphan_detector(&self) -> Option<&dyn OrphanDetector> {
        if self.kinds.values().any(Option::is_some) {
            Some(self)
        } else {
            None
        }
    }
}

#[async_trait]
impl OrphanDetector for ObjectReconciler {
    async fn detect_orphaned_components(
        &self,
        configured: &[Arc<dyn Component>],
    ) -> Result<Vec<Arc<dyn Component>>, Error> {
        let mut orphans: Vec<Arc<dyn Component>> = Vec::new();

        for (kind, detector) in &self.kinds {
            let Some(detector) = detector else {
                continue;
            };

            let existing = match self
                .client
                .list(&detector.list_type, &detector.filter)
                .await
            {
                Ok(existing) => existing,
                Err(e) if e.is_kind_not_found() => {
                    debug!(kind = %kind, "kind not served, no orphans");
                    continue;
                }
                Err(e) => return Err(e),
            };

            let candidates = (detector.convert)(existing)?;
            let same_kind: Vec<&Arc<dyn Component>> =
                configured.iter().filter(|c| c.kind() == *kind).collect();

            for candidate in candidates {
                let configured = same_kind
                    .iter()
                    .any(|c| (detector.same)(c.as_ref(), candidate.as_ref()));
                if !configured {
                    debug!(kind = %kind, component = %candidate.name(), "found orphaned component");
                    orphans.push(candidate);
                }
            }
        }

        Ok(orphans)
    }
}
