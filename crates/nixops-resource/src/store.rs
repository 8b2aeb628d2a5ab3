//! C1: typed read/update of the two custom kinds, their status subresource,
//! watch streams, and secret/event access — spec §4.1.

use std::collections::BTreeMap;
use std::fmt::Debug;

use futures::Stream;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Patch, PatchParams};
use kube::core::NamespaceResourceScope;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::runtime::watcher;
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

const MAX_PATCH_CONFLICT_RETRIES: u32 = 5;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0} {1} not found")]
    NotFound(&'static str, String),
    #[error("status patch for {0} {1} conflicted {2} times in a row")]
    Conflict(&'static str, String, u32),
    #[error("secret {0}/{1} not found")]
    SecretMissing(String, String),
    #[error("secret {0}/{1} has no key {2}")]
    SecretKeyMissing(String, String, String),
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
}

/// Thin typed wrapper over a `kube::Client`. Holds no resource-kind-specific
/// state; every method is generic over the `kube::Resource` it's called
/// with, the way a real controller keeps one `Client` and builds `Api<T>`
/// handles on demand.
#[derive(Clone)]
pub struct ResourceStore {
    client: Client,
    reporter: Reporter,
}

impl ResourceStore {
    pub fn new(client: Client, reporter_name: impl Into<String>) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: reporter_name.into(),
                instance: None,
            },
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn api<T>(&self, namespace: &str) -> Api<T>
    where
        T: Resource<Scope = NamespaceResourceScope>,
        <T as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    pub async fn get<T>(&self, api: &Api<T>, name: &str) -> Result<T, StoreError>
    where
        T: Clone + DeserializeOwned + Debug,
    {
        match api.get(name).await {
            Ok(obj) => Ok(obj),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                Err(StoreError::NotFound(std::any::type_name::<T>(), name.to_owned()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn list<T>(&self, api: &Api<T>) -> Result<Vec<T>, StoreError>
    where
        T: Clone + DeserializeOwned + Debug,
    {
        Ok(api.list(&Default::default()).await?.items)
    }

    /// Watch stream of `(added|modified|deleted, object)` events, spec
    /// §4.1. Backed by `kube::runtime::watcher`'s default reflector-free
    /// event stream; callers fold it into reconcile triggers (C10).
    pub fn watch<T>(
        &self,
        api: Api<T>,
    ) -> impl Stream<Item = Result<watcher::Event<T>, watcher::Error>>
    where
        T: Clone + Debug + Send + DeserializeOwned + 'static + k8s_openapi::Metadata<Ty = k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta>,
    {
        watcher::watcher(api, watcher::Config::default())
    }

    /// Merge-patches `status`, retrying on resourceVersion conflicts up to
    /// `MAX_PATCH_CONFLICT_RETRIES` times before surfacing `Conflict` (spec
    /// §4.1 contract). Never swallows 404.
    pub async fn patch_status<T>(
        &self,
        api: &Api<T>,
        name: &str,
        status: serde_json::Value,
    ) -> Result<T, StoreError>
    where
        T: Clone + DeserializeOwned + Serialize + Debug,
    {
        let patch = serde_json::json!({ "status": status });
        let mut attempts = 0;
        loop {
            match api
                .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
            {
                Ok(obj) => return Ok(obj),
                Err(kube::Error::Api(e)) if e.code == 404 => {
                    return Err(StoreError::NotFound(std::any::type_name::<T>(), name.to_owned()))
                }
                Err(kube::Error::Api(e)) if e.code == 409 => {
                    attempts += 1;
                    if attempts >= MAX_PATCH_CONFLICT_RETRIES {
                        return Err(StoreError::Conflict(
                            std::any::type_name::<T>(),
                            name.to_owned(),
                            attempts,
                        ));
                    }
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub async fn add_finalizer<T>(
        &self,
        api: &Api<T>,
        name: &str,
        finalizer: &str,
    ) -> Result<(), StoreError>
    where
        T: Clone + DeserializeOwned + Serialize + Debug + ResourceExt,
    {
        let obj = self.get(api, name).await?;
        if obj.finalizers().iter().any(|f| f == finalizer) {
            return Ok(());
        }
        let mut finalizers = obj.finalizers().to_vec();
        finalizers.push(finalizer.to_owned());
        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    pub async fn remove_finalizer<T>(
        &self,
        api: &Api<T>,
        name: &str,
        finalizer: &str,
    ) -> Result<(), StoreError>
    where
        T: Clone + DeserializeOwned + Serialize + Debug + ResourceExt,
    {
        let obj = self.get(api, name).await?;
        let finalizers: Vec<String> = obj
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != finalizer)
            .cloned()
            .collect();
        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    /// Fire-and-forget event emission (spec §4.1: "failures to emit are
    /// logged, never propagated").
    pub async fn emit_event<T>(&self, obj: &T, type_: EventType, reason: &str, message: &str)
    where
        T: Resource,
        <T as Resource>::DynamicType: Default,
    {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone());
        let event = Event {
            type_,
            reason: reason.to_owned(),
            note: Some(message.to_owned()),
            action: reason.to_owned(),
            secondary: None,
        };
        if let Err(e) = recorder.publish(&event, &obj.object_ref(&Default::default())).await {
            warn!(error = %e, reason, "failed to emit event, continuing");
        }
    }

    /// Reads every key of a Secret, already base64-decoded by the API
    /// client (spec §6: SSH key and Git credential secrets).
    pub async fn read_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, Vec<u8>>, StoreError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = match api.get(name).await {
            Ok(s) => s,
            Err(kube::Error::Api(e)) if e.code == 404 => {
                return Err(StoreError::SecretMissing(namespace.to_owned(), name.to_owned()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(secret
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, v.0))
            .collect())
    }

    pub async fn read_secret_key(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<Vec<u8>, StoreError> {
        let data = self.read_secret(namespace, name).await?;
        data.get(key).cloned().ok_or_else(|| {
            StoreError::SecretKeyMissing(namespace.to_owned(), name.to_owned(), key.to_owned())
        })
    }
}
