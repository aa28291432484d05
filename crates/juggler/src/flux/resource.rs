//! Adapters between typed Flux resources and the reconciler
//!
//! `FluxResource` is the object-safe view the `FluxReconciler` works with.
//! `FluxAdapter<K>` implements it for any Flux kind through the small
//! `FluxObject` trait, so adding a kind is one macro line.

use std::collections::BTreeMap;
use std::fmt;

use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::client::ObjectKey;
use crate::status::Healthiness;
use juggler_common::crd::{
    FluxStatus, GitRepository, GitRepositorySpec, HelmRelease, HelmReleaseSpec, HelmRepository,
    HelmRepositorySpec, Kustomization, KustomizationSpec, OCIRepository, OCIRepositorySpec,
};
use juggler_common::Error;

/// Reconcile interval written on every Flux object
pub const DEFAULT_INTERVAL: &str = "1m0s";

/// Retry count meaning "retry forever" for Helm remediation
pub const RETRY_FOREVER: i64 = -1;

/// Source provider the API server fills in when none is set
pub const DEFAULT_PROVIDER: &str = "generic";

/// Source timeout the API server fills in when none is set
pub const DEFAULT_SOURCE_TIMEOUT: &str = "60s";

/// Typed access to the parts of a Flux kind the adapter touches
pub trait FluxObject:
    Resource<DynamicType = ()> + Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Spec type
    type Spec: Clone + Default + Serialize + DeserializeOwned + Send + Sync;

    /// Build an object with a name and spec
    fn with_spec(name: &str, spec: Self::Spec) -> Self;

    /// The spec
    fn spec(&self) -> &Self::Spec;

    /// The spec, mutably
    fn spec_mut(&mut self) -> &mut Self::Spec;

    /// `spec.suspend`
    fn suspend(&self) -> Option<bool>;

    /// Set `spec.suspend`
    fn set_suspend(&mut self, suspend: Option<bool>);

    /// Status reported by the Flux controller
    fn flux_status(&self) -> Option<&FluxStatus>;

    /// Force the engine's policy defaults onto the spec and fill unset
    /// fields the CRD would default, so a converged object reads back
    /// unchanged
    fn apply_defaults(&mut self);
}

macro_rules! flux_object {
    ($kind:ident, $spec:ident) => {
        flux_object!($kind, $spec, |_spec| {});
    };
    ($kind:ident, $spec:ident, |$s:ident| $extra:block) => {
        impl FluxObject for $kind {
            type Spec = $spec;

            fn with_spec(name: &str, spec: $spec) -> Self {
                $kind::new(name, spec)
            }

            fn spec(&self) -> &$spec {
                &self.spec
            }

            fn spec_mut(&mut self) -> &mut $spec {
                &mut self.spec
            }

            fn suspend(&self) -> Option<bool> {
                self.spec.suspend
            }

            fn set_suspend(&mut self, suspend: Option<bool>) {
                self.spec.suspend = suspend;
            }

            fn flux_status(&self) -> Option<&FluxStatus> {
                self.status.as_ref()
            }

            fn apply_defaults(&mut self) {
                let $s = &mut self.spec;
                $s.interval = Some(DEFAULT_INTERVAL.to_string());
                $extra
            }
        }
    };
}

flux_object!(HelmRepository, HelmRepositorySpec, |spec| {
    spec.provider.get_or_insert_with(|| DEFAULT_PROVIDER.to_string());
});
flux_object!(GitRepository, GitRepositorySpec, |spec| {
    spec.timeout.get_or_insert_with(|| DEFAULT_SOURCE_TIMEOUT.to_string());
});
flux_object!(OCIRepository, OCIRepositorySpec, |spec| {
    spec.provider.get_or_insert_with(|| DEFAULT_PROVIDER.to_string());
    spec.timeout.get_or_insert_with(|| DEFAULT_SOURCE_TIMEOUT.to_string());
});
flux_object!(Kustomization, KustomizationSpec);
flux_object!(HelmRelease, HelmReleaseSpec, |spec| {
    let install = spec.install.get_or_insert_with(Default::default);
    install.create_namespace = Some(true);
    install.remediation.get_or_insert_with(Default::default).retries = Some(RETRY_FOREVER);

    let upgrade = spec.upgrade.get_or_insert_with(Default::default);
    upgrade.remediation.get_or_insert_with(Default::default).retries = Some(RETRY_FOREVER);
});

/// Object-safe view of one Flux resource (a source or a manifesto)
pub trait FluxResource: fmt::Debug + Send + Sync {
    /// API resource of the kind
    fn api_resource(&self) -> ApiResource;

    /// Namespace and name
    fn object_key(&self) -> ObjectKey;

    /// The resource as a dynamic object
    fn to_object(&self) -> Result<DynamicObject, Error>;

    /// Health derived from the `Ready` condition
    fn healthiness(&self) -> Healthiness;

    /// A resource of the same kind and identity with a default spec
    fn empty(&self) -> Box<dyn FluxResource>;

    /// Replace this resource with an object read from the cluster
    fn load(&mut self, obj: DynamicObject) -> Result<(), Error>;

    /// Take the spec of `desired`, keeping this resource's `suspend` flag
    fn reconcile(&mut self, desired: &dyn FluxResource) -> Result<(), Error>;

    /// Force policy defaults
    fn apply_defaults(&mut self);

    /// Labels, created if missing
    fn labels_mut(&mut self) -> &mut BTreeMap<String, String>;
}

/// `FluxResource` implementation for a typed Flux kind
#[derive(Clone, Debug)]
pub struct FluxAdapter<K: FluxObject> {
    inner: K,
}

/// HelmRepository source
pub type HelmRepositoryAdapter = FluxAdapter<HelmRepository>;
/// GitRepository source
pub type GitRepositoryAdapter = FluxAdapter<GitRepository>;
/// OCIRepository source
pub type OciRepositoryAdapter = FluxAdapter<OCIRepository>;
/// HelmRelease manifesto
pub type HelmReleaseAdapter = FluxAdapter<HelmRelease>;
/// Kustomization manifesto
pub type KustomizationAdapter = FluxAdapter<Kustomization>;

impl<K: FluxObject> FluxAdapter<K> {
    /// Wrap a typed object
    pub fn new(inner: K) -> Self {
        Self { inner }
    }

    /// Wrap a typed object as a boxed `FluxResource`
    pub fn boxed(inner: K) -> Box<dyn FluxResource> {
        Box::new(Self::new(inner))
    }

    /// The typed object
    pub fn inner(&self) -> &K {
        &self.inner
    }

    /// Unwrap the typed object
    pub fn into_inner(self) -> K {
        self.inner
    }

    fn parse(obj: DynamicObject) -> Result<K, Error> {
        let mut value = serde_json::to_value(obj)?;
        if value.get("spec").is_none() {
            value["spec"] = serde_json::to_value(K::Spec::default())?;
        }
        serde_json::from_value(value)
            .map_err(|e| Error::serialization_for_kind(K::kind(&()).to_string(), e.to_string()))
    }
}

impl<K: FluxObject> From<K> for FluxAdapter<K> {
    fn from(inner: K) -> Self {
        Self::new(inner)
    }
}

impl<K: FluxObject> FluxResource for FluxAdapter<K> {
    fn api_resource(&self) -> ApiResource {
        ApiResource::erase::<K>(&())
    }

    fn object_key(&self) -> ObjectKey {
        let meta = self.inner.meta();
        ObjectKey {
            namespace: meta.namespace.clone(),
            name: meta.name.clone().unwrap_or_default(),
        }
    }

    fn to_object(&self) -> Result<DynamicObject, Error> {
        let value = serde_json::to_value(&self.inner)?;
        Ok(serde_json::from_value(value)?)
    }

    fn healthiness(&self) -> Healthiness {
        let generation = self.inner.meta().generation;
        let status = self.inner.flux_status();
        if status.is_some_and(|s| s.is_ready_for(generation)) {
            return Healthiness::healthy();
        }

        let reason = match status.and_then(|s| s.ready_condition()) {
            Some(c) if c.status == "True" => format!(
                "generation {} not yet observed",
                generation.unwrap_or_default()
            ),
            Some(c) if !c.message.is_empty() => c.message.clone(),
            _ => "no Ready condition reported".to_string(),
        };
        Healthiness::unhealthy(format!(
            "{} {} is not ready: {}",
            K::kind(&()),
            self.object_key(),
            reason
        ))
    }

    fn empty(&self) -> Box<dyn FluxResource> {
        let key = self.object_key();
        let mut shell = K::with_spec(&key.name, K::Spec::default());
        shell.meta_mut().namespace = key.namespace;
        Self::boxed(shell)
    }

    fn load(&mut self, obj: DynamicObject) -> Result<(), Error> {
        self.inner = Self::parse(obj)?;
        Ok(())
    }

    fn reconcile(&mut self, desired: &dyn FluxResource) -> Result<(), Error> {
        let desired_ar = desired.api_resource();
        if desired_ar.kind != K::kind(&()) {
            return Err(Error::internal_with_context(
                "flux",
                format!(
                    "cannot reconcile {} {} from a {}",
                    K::kind(&()),
                    self.object_key(),
                    desired_ar.kind
                ),
            ));
        }

        let desired = Self::parse(desired.to_object()?)?;
        let suspend = self.inner.suspend();
        *self.inner.spec_mut() = desired.spec().clone();
        self.inner.set_suspend(suspend);
        Ok(())
    }

    fn apply_defaults(&mut self) {
        self.inner.apply_defaults();
    }

    fn labels_mut(&mut self) -> &mut BTreeMap<String, String> {
        self.inner.labels_mut()
    }
}
