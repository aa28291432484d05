//! In-memory `ClusterClient` for tests

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use kube::api::DynamicObject;
use kube::discovery::ApiResource;

use crate::client::{ClusterClient, ListOptions, ObjectKey};
use juggler_common::Error;

type StoreKey = (String, String, ObjectKey);

/// Object store keyed by apiVersion, kind and namespaced name
#[derive(Default)]
pub struct MemoryClient {
    objects: Mutex<BTreeMap<StoreKey, DynamicObject>>,
    missing_kinds: Mutex<BTreeSet<String>>,
    creates: AtomicUsize,
    updates: AtomicUsize,
    deletes: AtomicUsize,
}

fn store_key(ar: &ApiResource, key: &ObjectKey) -> StoreKey {
    (ar.api_version.clone(), ar.kind.clone(), key.clone())
}

impl MemoryClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend the server does not serve this kind
    pub fn without_kind(self, kind: &str) -> Self {
        self.missing_kinds.lock().unwrap().insert(kind.to_string());
        self
    }

    /// Seed an object without counting it as a write
    pub fn insert(&self, ar: &ApiResource, mut obj: DynamicObject) {
        obj.types = Some(kube::api::TypeMeta {
            api_version: ar.api_version.clone(),
            kind: ar.kind.clone(),
        });
        let key = ObjectKey::of(&obj).unwrap();
        self.objects
            .lock()
            .unwrap()
            .insert(store_key(ar, &key), obj);
    }

    /// Current stored copy of an object
    pub fn stored(&self, ar: &ApiResource, key: &ObjectKey) -> Option<DynamicObject> {
        self.objects
            .lock()
            .unwrap()
            .get(&store_key(ar, key))
            .cloned()
    }

    /// Change a stored object in place without counting it as a write
    pub fn modify(&self, ar: &ApiResource, key: &ObjectKey, f: impl FnOnce(&mut DynamicObject)) {
        let mut objects = self.objects.lock().unwrap();
        let obj = objects.get_mut(&store_key(ar, key)).expect("object to modify");
        f(obj);
    }

    pub fn count(&self, ar: &ApiResource) -> usize {
        self.objects
            .lock()
            .unwrap()
            .keys()
            .filter(|(v, k, _)| v == &ar.api_version && k == &ar.kind)
            .count()
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn updates(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    pub fn write_count(&self) -> usize {
        self.creates() + self.updates() + self.deletes()
    }

    fn check_kind(&self, ar: &ApiResource) -> Result<(), Error> {
        if self.missing_kinds.lock().unwrap().contains(&ar.kind) {
            return Err(Error::kind_not_found(&ar.api_version, &ar.kind));
        }
        Ok(())
    }
}

/// Minimal label selector evaluation: `k=v`, `k!=v`, `k`, `!k`, comma-joined
pub fn selector_matches(selector: &str, labels: &BTreeMap<String, String>) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| {
            if let Some((k, v)) = term.split_once("!=") {
                labels.get(k.trim()).map(String::as_str) != Some(v.trim())
            } else if let Some((k, v)) = term.split_once('=') {
                labels.get(k.trim()).map(String::as_str) == Some(v.trim().trim_start_matches('='))
            } else if let Some(k) = term.strip_prefix('!') {
                !labels.contains_key(k.trim())
            } else {
                labels.contains_key(term)
            }
        })
}

#[async_trait]
impl ClusterClient for MemoryClient {
    async fn get(
        &self,
        ar: &ApiResource,
        key: &ObjectKey,
    ) -> Result<Option<DynamicObject>, Error> {
        self.check_kind(ar)?;
        Ok(self.stored(ar, key))
    }

    async fn create(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject, Error> {
        self.check_kind(ar)?;
        let key = ObjectKey::of(obj)?;
        let mut objects = self.objects.lock().unwrap();
        let store_key = store_key(ar, &key);
        if objects.contains_key(&store_key) {
            return Err(Error::internal_with_context(
                "memory-client",
                format!("{} {} already exists", ar.kind, key),
            ));
        }
        objects.insert(store_key, obj.clone());
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(obj.clone())
    }

    async fn update(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject, Error> {
        self.check_kind(ar)?;
        let key = ObjectKey::of(obj)?;
        let mut objects = self.objects.lock().unwrap();
        match objects.get_mut(&store_key(ar, &key)) {
            Some(stored) => {
                *stored = obj.clone();
                self.updates.fetch_add(1, Ordering::SeqCst);
                Ok(obj.clone())
            }
            None => Err(Error::not_found(&ar.kind, key.to_string())),
        }
    }

    async fn delete(&self, ar: &ApiResource, key: &ObjectKey) -> Result<(), Error> {
        self.check_kind(ar)?;
        match self.objects.lock().unwrap().remove(&store_key(ar, key)) {
            Some(_) => {
                self.deletes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => Err(Error::not_found(&ar.kind, key.to_string())),
        }
    }

    async fn list(
        &self,
        ar: &ApiResource,
        options: &ListOptions,
    ) -> Result<Vec<DynamicObject>, Error> {
        self.check_kind(ar)?;
        let objects = self.objects.lock().unwrap();
        let empty = BTreeMap::new();
        let items = objects
            .iter()
            .filter(|((v, k, key), _)| {
                v == &ar.api_version
                    && k == &ar.kind
                    && options
                        .namespace
                        .as_ref()
                        .map_or(true, |ns| key.namespace.as_ref() == Some(ns))
            })
            .map(|(_, obj)| obj)
            .filter(|obj| {
                options.label_selector.as_deref().map_or(true, |sel| {
                    selector_matches(sel, obj.metadata.labels.as_ref().unwrap_or(&empty))
                })
            })
            .cloned()
            .collect();
        Ok(items)
    }
}

pub fn config_map_resource() -> ApiResource {
    ApiResource {
        group: String::new(),
        version: "v1".to_string(),
        api_version: "v1".to_string(),
        kind: "ConfigMap".to_string(),
        plural: "configmaps".to_string(),
    }
}

pub fn secret_resource() -> ApiResource {
    ApiResource {
        group: String::new(),
        version: "v1".to_string(),
        api_version: "v1".to_string(),
        kind: "Secret".to_string(),
        plural: "secrets".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_matches() {
        let labels: BTreeMap<String, String> = [
            ("app.kubernetes.io/managed-by", "juggler"),
            ("juggler.dev/component", "Apps"),
            ("juggler.dev/component-kind", "SecretCopy"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        assert!(selector_matches("app.kubernetes.io/managed-by=juggler", &labels));
        assert!(selector_matches(
            "app.kubernetes.io/managed-by=juggler,juggler.dev/component",
            &labels
        ));
        assert!(selector_matches("juggler.dev/component==Apps", &labels));
        assert!(selector_matches(
            "app.kubernetes.io/managed-by=juggler,juggler.dev/component,juggler.dev/component-kind=SecretCopy",
            &labels
        ));
        assert!(!selector_matches("juggler.dev/component-kind=Other", &labels));
        assert!(!selector_matches("juggler.dev/component=Other", &labels));
        assert!(selector_matches("juggler.dev/component!=Other", &labels));
        assert!(!selector_matches("!juggler.dev/component", &labels));
        assert!(!selector_matches("missing", &labels));
    }
}
