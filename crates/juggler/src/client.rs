//! Cluster access for reconcilers and hooks
//!
//! Reconcilers never talk to `kube::Client` directly. They go through the
//! `ClusterClient` trait so strategies can be exercised against an in-memory
//! store or a mock, while production uses `KubeClusterClient`.
//!
//! Objects travel as `DynamicObject` + `ApiResource`: one engine pass touches
//! Flux kinds, core kinds and arbitrary CRDs through the same seam.

use std::fmt;
use std::future::Future;

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, PostParams};
use kube::discovery::ApiResource;
use kube::Client;
use tracing::{debug, trace};

#[cfg(test)]
use mockall::automock;

use juggler_common::error::classify_kube_error;
use juggler_common::{Error, JugglerConfig};

/// Namespace and name of an object
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Namespace, `None` for cluster-scoped objects
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    /// Key of a namespaced object
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Key of a cluster-scoped object
    pub fn cluster_scoped(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Key of an existing object; fails if the object has no name
    pub fn of(obj: &DynamicObject) -> Result<Self, Error> {
        let name = obj
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::internal_with_context("object-key", "object has no name"))?;
        Ok(Self {
            namespace: obj.metadata.namespace.clone(),
            name,
        })
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Query options for `ClusterClient::list`
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListOptions {
    /// Restrict to one namespace; `None` lists across all namespaces
    pub namespace: Option<String>,
    /// Label selector (e.g. `app.kubernetes.io/managed-by=juggler,juggler.dev/component`)
    pub label_selector: Option<String>,
    /// Page size for requests to the API server
    ///
    /// `list` still returns every matching object; it follows continue
    /// tokens until the last page.
    pub limit: Option<u32>,
}

impl ListOptions {
    /// Options selecting by label
    pub fn with_selector(selector: impl Into<String>) -> Self {
        Self {
            label_selector: Some(selector.into()),
            ..Default::default()
        }
    }

    /// Restrict to a namespace
    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Fetch results in pages of `limit` objects
    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// CRUD + list access to the managed cluster
///
/// `get` reports a missing object as `Ok(None)`. A resource type the server
/// does not serve is reported as `Error::KindNotFound` by every method;
/// `delete` reports a missing object as `Error::NotFound`.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetch an object
    async fn get(&self, ar: &ApiResource, key: &ObjectKey)
        -> Result<Option<DynamicObject>, Error>;

    /// Create an object
    async fn create(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject, Error>;

    /// Replace an existing object
    async fn update(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject, Error>;

    /// Delete an object
    async fn delete(&self, ar: &ApiResource, key: &ObjectKey) -> Result<(), Error>;

    /// List objects of a type
    async fn list(
        &self,
        ar: &ApiResource,
        options: &ListOptions,
    ) -> Result<Vec<DynamicObject>, Error>;
}

/// `ClusterClient` backed by a real API server
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
    post_params: PostParams,
}

impl KubeClusterClient {
    /// Wrap a kube client; writes are attributed to `config.field_manager`
    pub fn new(client: Client, config: &JugglerConfig) -> Self {
        Self {
            client,
            post_params: write_params(config),
        }
    }

    fn api(&self, ar: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, ar),
            None => Api::all_with(self.client.clone(), ar),
        }
    }
}

fn write_params(config: &JugglerConfig) -> PostParams {
    PostParams {
        field_manager: Some(config.field_manager.clone()),
        ..Default::default()
    }
}

/// Drain a paginated list, passing each page's continue token to the next
/// fetch
async fn collect_pages<T, F, Fut>(mut fetch: F) -> Result<Vec<T>, Error>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<(Vec<T>, Option<String>), Error>>,
{
    let mut items = Vec::new();
    let mut token = None;
    loop {
        let (page, next) = fetch(token.take()).await?;
        items.extend(page);
        match next.filter(|t| !t.is_empty()) {
            Some(next) => token = Some(next),
            None => return Ok(items),
        }
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get(
        &self,
        ar: &ApiResource,
        key: &ObjectKey,
    ) -> Result<Option<DynamicObject>, Error> {
        let api = self.api(ar, key.namespace.as_deref());
        match api.get(&key.name).await {
            Ok(obj) => Ok(Some(obj)),
            Err(e) => match classify_kube_error(e, &ar.api_version, &ar.kind, &key.to_string()) {
                Error::NotFound { .. } => Ok(None),
                other => Err(other),
            },
        }
    }

    async fn create(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject, Error> {
        let key = ObjectKey::of(obj)?;
        let api = self.api(ar, key.namespace.as_deref());
        let created = api
            .create(&self.post_params, obj)
            .await
            .map_err(|e| classify_kube_error(e, &ar.api_version, &ar.kind, &key.to_string()))?;
        debug!(kind = %ar.kind, object = %key, "created object");
        Ok(created)
    }

    async fn update(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject, Error> {
        let key = ObjectKey::of(obj)?;
        let api = self.api(ar, key.namespace.as_deref());
        let updated = api
            .replace(&key.name, &self.post_params, obj)
            .await
            .map_err(|e| classify_kube_error(e, &ar.api_version, &ar.kind, &key.to_string()))?;
        debug!(kind = %ar.kind, object = %key, "updated object");
        Ok(updated)
    }

    async fn delete(&self, ar: &ApiResource, key: &ObjectKey) -> Result<(), Error> {
        let api = self.api(ar, key.namespace.as_deref());
        api.delete(&key.name, &DeleteParams::background())
            .await
            .map_err(|e| classify_kube_error(e, &ar.api_version, &ar.kind, &key.to_string()))?;
        debug!(kind = %ar.kind, object = %key, "deleted object");
        Ok(())
    }

    async fn list(
        &self,
        ar: &ApiResource,
        options: &ListOptions,
    ) -> Result<Vec<DynamicObject>, Error> {
        let api = self.api(ar, options.namespace.as_deref());
        let mut base = ListParams::default();
        if let Some(selector) = &options.label_selector {
            base = base.labels(selector);
        }
        if let Some(limit) = options.limit {
            base = base.limit(limit);
        }

        let items = collect_pages(|token| {
            let api = api.clone();
            let params = match token {
                Some(token) => base.clone().continue_token(&token),
                None => base.clone(),
            };
            async move {
                let list = api
                    .list(&params)
                    .await
                    .map_err(|e| classify_kube_error(e, &ar.api_version, &ar.kind, "*"))?;
                Ok((list.items, list.metadata.continue_))
            }
        })
        .await?;
        trace!(kind = %ar.kind, count = items.len(), "listed objects");
        Ok(items)
    }
}

/// Outcome of `create_or_update`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationResult {
    /// The object did not exist and was created
    Created,
    /// The object existed and the mutation changed it
    Updated,
    /// The object existed and was already in the desired state; nothing was written
    Unchanged,
}

/// Fetch an object (or start from `shell` if it is missing), apply `mutate`,
/// then create or update it.
///
/// `mutate` receives the current object and returns the desired one. It must
/// not change the object's name or namespace. The `status` of an existing
/// object is carried over untouched, and no write happens when the mutation
/// leaves the object as it was.
pub async fn create_or_update<F, Fut>(
    client: &dyn ClusterClient,
    ar: &ApiResource,
    shell: DynamicObject,
    mutate: F,
) -> Result<OperationResult, Error>
where
    F: FnOnce(DynamicObject) -> Fut,
    Fut: Future<Output = Result<DynamicObject, Error>>,
{
    let key = ObjectKey::of(&shell)?;

    match client.get(ar, &key).await? {
        None => {
            let desired = mutate(shell).await?;
            ensure_identity(&key, &desired)?;
            client.create(ar, &desired).await?;
            Ok(OperationResult::Created)
        }
        Some(existing) => {
            let before = serde_json::to_value(&existing)?;
            let status = existing.data.get("status").cloned();

            let mut desired = mutate(existing).await?;
            ensure_identity(&key, &desired)?;
            match status {
                Some(status) => {
                    if let Some(map) = desired.data.as_object_mut() {
                        map.insert("status".to_string(), status);
                    }
                }
                None => {
                    if let Some(map) = desired.data.as_object_mut() {
                        map.remove("status");
                    }
                }
            }

            if serde_json::to_value(&desired)? == before {
                trace!(kind = %ar.kind, object = %key, "object unchanged");
                return Ok(OperationResult::Unchanged);
            }
            client.update(ar, &desired).await?;
            Ok(OperationResult::Updated)
        }
    }
}

fn ensure_identity(key: &ObjectKey, obj: &DynamicObject) -> Result<(), Error> {
    let actual = ObjectKey::of(obj)?;
    if &actual != key {
        return Err(Error::internal_with_context(
            "create-or-update",
            format!("mutation changed object identity from {} to {}", key, actual),
        ));
    }
    Ok(())
}
