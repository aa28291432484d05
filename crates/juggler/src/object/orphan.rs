//! Orphan detection for object components
//!
//! An orphan is a managed object whose component is no longer configured.
//! Detection lists candidates by label, turns them into components, and drops
//! every candidate that matches a configured component of the same kind. The
//! survivors are disabled components, so registering them makes the next
//! pass delete their objects.

use std::sync::Arc;

use async_trait::async_trait;
use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use kube::ResourceExt;

use super::{ObjectComponent, ObjectIdentity};
use crate::client::{ListOptions, ObjectKey};
use crate::component::{Component, ComponentKind};
use crate::status::Healthiness;
use juggler_common::{Error, JugglerConfig};

/// Turns listed objects into candidate components
pub type ConvertFn =
    Arc<dyn Fn(Vec<DynamicObject>) -> Result<Vec<Arc<dyn Component>>, Error> + Send + Sync>;

/// Whether a configured component and a candidate describe the same thing
pub type SameFn = Arc<dyn Fn(&dyn Component, &dyn Component) -> bool + Send + Sync>;

/// How to find orphans of one component kind
#[derive(Clone)]
pub struct DetectorContext {
    /// Narrows the list to managed, labeled candidates
    pub filter: ListOptions,
    /// Type of object to list
    pub list_type: ApiResource,
    /// Candidate conversion
    pub convert: ConvertFn,
    /// Structural equality between configured and candidate components
    pub same: SameFn,
}

impl DetectorContext {
    /// Detector from its parts
    pub fn new(filter: ListOptions, list_type: ApiResource, convert: ConvertFn, same: SameFn) -> Self {
        Self {
            filter,
            list_type,
            convert,
            same,
        }
    }

    /// Standard detector: objects of `list_type` labeled as managed under
    /// `config` and stamped with component kind `kind`, compared by object
    /// identity
    pub fn managed_by(config: &JugglerConfig, kind: ComponentKind, list_type: ApiResource) -> Self {
        let filter = ListOptions::with_selector(config.kind_selector(kind.as_str()));
        let component_key = config.component_label_key.clone();
        let object_type = list_type.clone();

        let convert: ConvertFn = Arc::new(move |objects: Vec<DynamicObject>| {
            objects
                .into_iter()
                .map(|obj| -> Result<Arc<dyn Component>, Error> {
                    let orphan = OrphanedObject::from_object(kind, &object_type, &component_key, &obj)?;
                    Ok(Arc::new(orphan))
                })
                .collect::<Result<Vec<_>, Error>>()
        });

        Self::new(filter, list_type, convert, Arc::new(same_object_identity))
    }

    /// Restrict the search to one namespace
    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.filter = self.filter.in_namespace(namespace);
        self
    }
}

impl std::fmt::Debug for DetectorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectorContext")
            .field("filter", &self.filter)
            .field("list_type", &self.list_type.kind)
            .finish()
    }
}

/// Compare two object components by the object they own
pub fn same_object_identity(configured: &dyn Component, candidate: &dyn Component) -> bool {
    let (Some(configured), Some(candidate)) = (configured.as_object(), candidate.as_object()) else {
        return false;
    };
    match (
        configured.build_object_to_reconcile(),
        candidate.build_object_to_reconcile(),
    ) {
        (Ok(a), Ok(b)) => a.same_as(&b),
        _ => false,
    }
}

/// A managed object with no configured component
///
/// Always disabled. Named after its component label, or the object name when
/// the label is missing.
#[derive(Clone, Debug)]
pub struct OrphanedObject {
    name: String,
    kind: ComponentKind,
    identity: ObjectIdentity,
}

impl OrphanedObject {
    /// Orphan owning `identity`
    pub fn new(name: impl Into<String>, kind: ComponentKind, identity: ObjectIdentity) -> Self {
        Self {
            name: name.into(),
            kind,
            identity,
        }
    }

    fn from_object(
        kind: ComponentKind,
        list_type: &ApiResource,
        component_key: &str,
        obj: &DynamicObject,
    ) -> Result<Self, Error> {
        let key = ObjectKey::of(obj)?;
        let name = obj
            .labels()
            .get(component_key)
            .cloned()
            .unwrap_or_else(|| key.name.clone());
        Ok(Self::new(name, kind, ObjectIdentity::new(list_type.clone(), key)))
    }

    /// The object this orphan owns
    pub fn identity(&self) -> &ObjectIdentity {
        &self.identity
    }
}

impl Component for OrphanedObject {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ComponentKind {
        self.kind
    }

    fn is_enabled(&self) -> bool {
        false
    }

    fn as_object(&self) -> Option<&dyn ObjectComponent> {
        Some(self)
    }
}

#[async_trait]
impl ObjectComponent for OrphanedObject {
    fn build_object_to_reconcile(&self) -> Result<ObjectIdentity, Error> {
        Ok(self.identity.clone())
    }

    async fn reconcile_object(&self, _obj: &mut DynamicObject) -> Result<(), Error> {
        Ok(())
    }

    fn is_object_healthy(&self, _obj: &DynamicObject) -> Healthiness {
        Healthiness::healthy()
    }
}
