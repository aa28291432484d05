//! Flux reconciliation strategy
//!
//! A Flux component is deployed as a pair of Flux objects: a source (where the
//! artifact lives, e.g. a HelmRepository) and a manifesto (what gets deployed
//! from it, e.g. a HelmRelease). The Flux controllers do the actual
//! deployment; this reconciler keeps both objects in the desired shape and
//! reads health back from their `Ready` conditions.

mod resource;

pub use resource::{
    FluxAdapter, FluxObject, FluxResource, GitRepositoryAdapter, HelmReleaseAdapter,
    HelmRepositoryAdapter, KustomizationAdapter, OciRepositoryAdapter, DEFAULT_INTERVAL,
    DEFAULT_PROVIDER, DEFAULT_SOURCE_TIMEOUT, RETRY_FOREVER,
};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::client::{create_or_update, ClusterClient};
use crate::component::{Component, ComponentKind, HookPhase};
use crate::reconciler::{run_hook, ComponentReconciler};
use crate::status::{ComponentObservation, Healthiness};
use juggler_common::error::ignore_missing;
use juggler_common::{Error, JugglerConfig, LABEL_MANAGED_BY};

/// Component deployed as a Flux source + manifesto pair
#[async_trait]
pub trait FluxComponent: Component {
    /// Desired source object (HelmRepository, GitRepository, OCIRepository)
    async fn build_source_repository(&self) -> Result<Box<dyn FluxResource>, Error>;

    /// Desired manifesto object (HelmRelease, Kustomization)
    async fn build_manifesto(&self) -> Result<Box<dyn FluxResource>, Error>;
}

/// Computes the labels stamped on a component's Flux objects
pub type LabelFunc = Arc<dyn Fn(&dyn Component) -> BTreeMap<String, String> + Send + Sync>;

/// Default labels: `managed-by=<value>`, `<component label key>=<name>` and
/// `<component kind label key>=<kind>`
pub fn managed_labels(config: &JugglerConfig) -> LabelFunc {
    let managed_by = config.managed_by.clone();
    let component_key = config.component_label_key.clone();
    let kind_key = config.component_kind_label_key.clone();
    Arc::new(move |component: &dyn Component| {
        BTreeMap::from([
            (LABEL_MANAGED_BY.to_string(), managed_by.clone()),
            (component_key.clone(), component.name().to_string()),
            (kind_key.clone(), component.kind().to_string()),
        ])
    })
}

/// `ComponentReconciler` for Flux components
pub struct FluxReconciler {
    client: Arc<dyn ClusterClient>,
    kinds: BTreeSet<ComponentKind>,
    labels: LabelFunc,
}

impl FluxReconciler {
    /// Reconciler with the default labels and no kinds
    pub fn new(client: Arc<dyn ClusterClient>, config: &JugglerConfig) -> Self {
        Self {
            client,
            kinds: BTreeSet::new(),
            labels: managed_labels(config),
        }
    }

    /// Claim a component kind
    pub fn with_kind(mut self, kind: ComponentKind) -> Self {
        self.kinds.insert(kind);
        self
    }

    /// Replace the label function
    pub fn with_label_func(mut self, labels: LabelFunc) -> Self {
        self.labels = labels;
        self
    }

    fn flux_view<'a>(&self, component: &'a dyn Component) -> Result<&'a dyn FluxComponent, Error> {
        component.as_flux().ok_or_else(|| {
            Error::component(component.name(), "does not support the Flux strategy")
        })
    }

    async fn desired_pair(
        &self,
        component: &dyn Component,
    ) -> Result<[Box<dyn FluxResource>; 2], Error> {
        let flux = self.flux_view(component)?;
        let source = flux.build_source_repository().await?;
        let manifesto = flux.build_manifesto().await?;
        Ok([source, manifesto])
    }

    async fn observe_one(&self, desired: &dyn FluxResource) -> Result<(bool, Healthiness), Error> {
        let ar = desired.api_resource();
        let key = desired.object_key();
        let found = match self.client.get(&ar, &key).await {
            Ok(found) => found,
            Err(e) if e.is_kind_not_found() => None,
            Err(e) => return Err(e),
        };

        match found {
            None => Ok((
                false,
                Healthiness::unhealthy(format!("{} {} not found", ar.kind, key)),
            )),
            Some(obj) => {
                let mut actual = desired.empty();
                actual.load(obj)?;
                Ok((true, actual.healthiness()))
            }
        }
    }

    async fn upsert(&self, component: &dyn Component, desired: &dyn FluxResource) -> Result<(), Error> {
        let ar = desired.api_resource();
        let key = desired.object_key();
        let labels = (self.labels)(component);
        let shell = desired.empty().to_object()?;

        let result = create_or_update(self.client.as_ref(), &ar, shell, |obj| async move {
            let mut current = desired.empty();
            current.load(obj.clone())?;
            let before = serde_json::to_value(current.to_object()?)?;

            current.reconcile(desired)?;
            current.apply_defaults();
            current.labels_mut().extend(labels);
            let after = current.to_object()?;

            // Fields the API server defaults but the typed specs do not model
            // exist only in `obj`; judge changes on the modeled fields alone.
            if serde_json::to_value(&after)? == before {
                return Ok(obj);
            }
            Ok(after)
        })
        .await?;

        debug!(kind = %ar.kind, object = %key, result = ?result, "upserted flux object");
        Ok(())
    }

    async fn apply(&self, component: &dyn Component) -> Result<(), Error> {
        for desired in self.desired_pair(component).await? {
            self.upsert(component, desired.as_ref()).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ComponentReconciler for FluxReconciler {
    fn known_kinds(&self) -> BTreeSet<ComponentKind> {
        self.kinds.clone()
    }

    async fn observe(&self, component: &dyn Component) -> Result<ComponentObservation, Error> {
        let [source, manifesto] = self.desired_pair(component).await?;
        let (source_exists, source_health) = self.observe_one(source.as_ref()).await?;
        let (manifesto_exists, manifesto_health) = self.observe_one(manifesto.as_ref()).await?;

        Ok(ComponentObservation {
            resource_exists: source_exists || manifesto_exists,
            healthiness: source_health.and(manifesto_health),
        })
    }

    async fn install(&self, component: &dyn Component) -> Result<(), Error> {
        info!(component = %component.name(), "installing flux component");
        self.apply(component).await
    }

    async fn update(&self, component: &dyn Component) -> Result<(), Error> {
        self.apply(component).await
    }

    async fn uninstall(&self, component: &dyn Component) -> Result<(), Error> {
        info!(component = %component.name(), "uninstalling flux component");
        let [source, manifesto] = self.desired_pair(component).await?;
        // Release first so the helm-controller can still fetch the chart while
        // it tears the release down
        for half in [manifesto, source] {
            let result = self
                .client
                .delete(&half.api_resource(), &half.object_key())
                .await;
            ignore_missing(result)?;
        }
        Ok(())
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{MockClusterClient, ObjectKey};
    use crate::testing::MemoryClient;
    use juggler_common::crd::{
        CrossNamespaceObjectReference, HelmChartTemplate, HelmChartTemplateSpec, HelmRelease,
        HelmReleaseSpec, HelmRepository, HelmRepositorySpec, FLUX_READY_CONDITION,
    };
    use juggler_common::FLUX_SYSTEM_NAMESPACE;
    use kube::discovery::ApiResource;
    use serde_json::json;

    const PODINFO: ComponentKind = ComponentKind::new("Podinfo");

    struct Podinfo {
        enabled: bool,
        version: &'static str,
    }

    impl Podinfo {
        fn new(version: &'static str) -> Self {
            Self {
                enabled: true,
                version,
            }
        }
    }

    impl Component for Podinfo {
        fn name(&self) -> &str {
            "Podinfo"
        }
        fn kind(&self) -> ComponentKind {
            PODINFO
        }
        fn is_enabled(&self) -> bool {
            self.enabled
        }
        fn as_flux(&self) -> Option<&dyn FluxComponent> {
            Some(self)
        }
    }

    #[async_trait]
    impl FluxComponent for Podinfo {
        async fn build_source_repository(&self) -> Result<Box<dyn FluxResource>, Error> {
            let mut repo = HelmRepository::new(
                "podinfo",
                HelmRepositorySpec {
                    url: "https://stefanprodan.github.io/podinfo".to_string(),
                    ..Default::default()
                },
            );
            repo.metadata.namespace = Some(FLUX_SYSTEM_NAMESPACE.to_string());
            Ok(HelmRepositoryAdapter::boxed(repo))
        }

        async fn build_manifesto(&self) -> Result<Box<dyn FluxResource>, Error> {
            let mut release = HelmRelease::new(
                "podinfo",
                HelmReleaseSpec {
                    chart: Some(HelmChartTemplate {
                        spec: HelmChartTemplateSpec {
                            chart: "podinfo".to_string(),
                            version: Some(self.version.to_string()),
                            source_ref: CrossNamespaceObjectReference {
                                kind: "HelmRepository".to_string(),
                                name: "podinfo".to_string(),
                                ..Default::default()
                            },
                            interval: None,
                        },
                    }),
                    target_namespace: Some("apps".to_string()),
                    ..Default::default()
                },
            );
            release.metadata.namespace = Some(FLUX_SYSTEM_NAMESPACE.to_string());
            Ok(HelmReleaseAdapter::boxed(release))
        }
    }

    struct NotFlux;

    impl Component for NotFlux {
        fn name(&self) -> &str {
            "NotFlux"
        }
        fn kind(&self) -> ComponentKind {
            PODINFO
        }
        fn is_enabled(&self) -> bool {
            true
        }
    }

    fn repo_resource() -> ApiResource {
        ApiResource::erase::<HelmRepository>(&())
    }

    fn release_resource() -> ApiResource {
        ApiResource::erase::<HelmRelease>(&())
    }

    fn key() -> ObjectKey {
        ObjectKey::namespaced(FLUX_SYSTEM_NAMESPACE, "podinfo")
    }

    fn reconciler(client: &Arc<MemoryClient>) -> FluxReconciler {
        FluxReconciler::new(client.clone(), &JugglerConfig::default()).with_kind(PODINFO)
    }

    fn mark_ready(client: &MemoryClient, ar: &ApiResource) {
        client.modify(ar, &key(), |obj| {
            obj.data["status"] = json!({
                "conditions": [{
                    "type": FLUX_READY_CONDITION,
                    "status": "True",
                    "reason": "Succeeded",
                    "message": "ok",
                    "lastTransitionTime": "2024-01-01T00:00:00Z"
                }]
            });
        });
    }

    /// Story: install creates the labeled, defaulted pair and health follows
    /// the Flux controllers
    #[tokio::test]
    async fn story_install_then_become_healthy() {
        let client = Arc::new(MemoryClient::new());
        let reconciler = reconciler(&client);
        let podinfo = Podinfo::new("6.0.0");

        let before = reconciler.observe(&podinfo).await.unwrap();
        assert!(!before.resource_exists);

        reconciler.install(&podinfo).await.unwrap();
        assert_eq!(client.creates(), 2);

        let release = client.stored(&release_resource(), &key()).unwrap();
        assert_eq!(release.data["spec"]["interval"], "1m0s");
        assert_eq!(release.data["spec"]["install"]["createNamespace"], true);
        assert_eq!(release.data["spec"]["upgrade"]["remediation"]["retries"], -1);
        let labels = release.metadata.labels.unwrap();
        assert_eq!(labels["app.kubernetes.io/managed-by"], "juggler");
        assert_eq!(labels["juggler.dev/component"], "Podinfo");
        assert_eq!(labels["juggler.dev/component-kind"], "Podinfo");

        // Flux has not reported anything yet
        let pending = reconciler.observe(&podinfo).await.unwrap();
        assert!(pending.resource_exists);
        assert!(!pending.healthiness.healthy);
        assert_eq!(pending.healthiness.message.lines().count(), 2);

        mark_ready(&client, &repo_resource());
        mark_ready(&client, &release_resource());
        let ready = reconciler.observe(&podinfo).await.unwrap();
        assert!(ready.healthiness.healthy);
    }

    #[tokio::test]
    async fn test_update_on_converged_pair_writes_nothing() {
        let client = Arc::new(MemoryClient::new());
        let reconciler = reconciler(&client);
        let podinfo = Podinfo::new("6.0.0");
        reconciler.install(&podinfo).await.unwrap();
        mark_ready(&client, &release_resource());
        let writes = client.write_count();

        reconciler.update(&podinfo).await.unwrap();
        reconciler.update(&podinfo).await.unwrap();

        assert_eq!(client.write_count(), writes);
        let release = client.stored(&release_resource(), &key()).unwrap();
        assert_eq!(release.data["status"]["conditions"][0]["status"], "True");
    }

    /// Story: the API server fills in defaults the typed specs do not model;
    /// converged updates still write nothing, and a real change keeps going
    /// through
    #[tokio::test]
    async fn story_server_defaults_do_not_trigger_writes() {
        let client = Arc::new(MemoryClient::new());
        let reconciler = reconciler(&client);
        reconciler.install(&Podinfo::new("6.0.0")).await.unwrap();

        client.modify(&release_resource(), &key(), |obj| {
            obj.data["spec"]["chart"]["spec"]["reconcileStrategy"] = json!("ChartVersion");
        });
        let repo = client.stored(&repo_resource(), &key()).unwrap();
        assert_eq!(repo.data["spec"]["provider"], "generic");
        let writes = client.write_count();

        reconciler.update(&Podinfo::new("6.0.0")).await.unwrap();
        assert_eq!(client.write_count(), writes);
        let release = client.stored(&release_resource(), &key()).unwrap();
        assert_eq!(
            release.data["spec"]["chart"]["spec"]["reconcileStrategy"],
            "ChartVersion"
        );

        reconciler.update(&Podinfo::new("6.1.0")).await.unwrap();
        assert_eq!(client.write_count(), writes + 1);
        let release = client.stored(&release_resource(), &key()).unwrap();
        assert_eq!(release.data["spec"]["chart"]["spec"]["version"], "6.1.0");
    }

    /// Story: an operator suspends the release by hand, then a new chart
    /// version is rolled out; the release picks up the version but stays
    /// suspended
    #[tokio::test]
    async fn story_manual_suspend_survives_update() {
        let client = Arc::new(MemoryClient::new());
        let reconciler = reconciler(&client);
        reconciler.install(&Podinfo::new("6.0.0")).await.unwrap();

        client.modify(&release_resource(), &key(), |obj| {
            obj.data["spec"]["suspend"] = json!(true);
        });

        reconciler.update(&Podinfo::new("6.1.0")).await.unwrap();

        let release = client.stored(&release_resource(), &key()).unwrap();
        assert_eq!(release.data["spec"]["suspend"], true);
        assert_eq!(release.data["spec"]["chart"]["spec"]["version"], "6.1.0");
    }

    #[tokio::test]
    async fn test_uninstall_removes_both_and_tolerates_missing() {
        let client = Arc::new(MemoryClient::new());
        let reconciler = reconciler(&client);
        let podinfo = Podinfo::new("6.0.0");
        reconciler.install(&podinfo).await.unwrap();

        reconciler.uninstall(&podinfo).await.unwrap();
        assert_eq!(client.count(&repo_resource()), 0);
        assert_eq!(client.count(&release_resource()), 0);
        assert!(!reconciler.observe(&podinfo).await.unwrap().resource_exists);

        reconciler.uninstall(&podinfo).await.unwrap();
    }

    #[tokio::test]
    async fn test_half_present_pair_exists_but_is_unhealthy() {
        let client = Arc::new(MemoryClient::new());
        let reconciler = reconciler(&client);
        let podinfo = Podinfo::new("6.0.0");
        reconciler.install(&podinfo).await.unwrap();
        mark_ready(&client, &repo_resource());
        client
            .delete(&release_resource(), &key())
            .await
            .unwrap();

        let observation = reconciler.observe(&podinfo).await.unwrap();
        assert!(observation.resource_exists);
        assert!(!observation.healthiness.healthy);
        assert!(observation.healthiness.message.contains("not found"));
    }

    #[tokio::test]
    async fn test_missing_flux_crds_read_as_absent() {
        let client = Arc::new(
            MemoryClient::new()
                .without_kind("HelmRepository")
                .without_kind("HelmRelease"),
        );
        let reconciler = reconciler(&client);

        let observation = reconciler.observe(&Podinfo::new("6.0.0")).await.unwrap();
        assert!(!observation.resource_exists);

        let err = reconciler.install(&Podinfo::new("6.0.0")).await.unwrap_err();
        assert!(err.is_kind_not_found());
    }

    #[tokio::test]
    async fn test_custom_label_func() {
        let client = Arc::new(MemoryClient::new());
        let reconciler = reconciler(&client).with_label_func(Arc::new(|c: &dyn Component| {
            BTreeMap::from([("team".to_string(), c.name().to_lowercase())])
        }));
        reconciler.install(&Podinfo::new("6.0.0")).await.unwrap();

        let repo = client.stored(&repo_resource(), &key()).unwrap();
        let labels = repo.metadata.labels.unwrap();
        assert_eq!(labels["team"], "podinfo");
        assert!(!labels.contains_key("app.kubernetes.io/managed-by"));
    }

    #[tokio::test]
    async fn test_component_without_flux_view_is_rejected() {
        let client = Arc::new(MemoryClient::new());
        let err = reconciler(&client).observe(&NotFlux).await.unwrap_err();
        assert!(err.to_string().contains("Flux strategy"));
    }

    #[tokio::test]
    async fn test_api_error_on_get_propagates() {
        let mut mock = MockClusterClient::new();
        mock.expect_get()
            .returning(|_, _| Err(Error::internal("connection refused")));
        let reconciler =
            FluxReconciler::new(Arc::new(mock), &JugglerConfig::default()).with_kind(PODINFO);

        let err = reconciler.observe(&Podinfo::new("6.0.0")).await.unwrap_err();
        assert!(err.to_string().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_uninstall_deletes_release_before_source() {
        let mut mock = MockClusterClient::new();
        let mut seq = mockall::Sequence::new();
        mock.expect_delete()
            .withf(|ar, _| ar.kind == "HelmRelease")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        mock.expect_delete()
            .withf(|ar, _| ar.kind == "HelmRepository")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|ar, key| Err(Error::not_found(&ar.kind, key.to_string())));
        let reconciler =
            FluxReconciler::new(Arc::new(mock), &JugglerConfig::default()).with_kind(PODINFO);

        reconciler.uninstall(&Podinfo::new("6.0.0")).await.unwrap();
    }
}
