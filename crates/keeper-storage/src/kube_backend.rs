//! Kubernetes `Secret` backed store.
//!
//! Each named secret maps to one `v1/Secret` object. Writes are JSON merge
//! patches of a single `data` key, so concurrent writers of different keys do
//! not clobber each other. A missing secret is created on first write.

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use tracing::debug;

use crate::{SecretStore, StoreError};

/// Secret store backed by Kubernetes `Secret` objects.
#[derive(Clone)]
pub struct KubeSecretStore {
    client: Client,
}

impl KubeSecretStore {
    /// Wrap an existing Kubernetes client.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn patch_key(
        &self,
        api: &Api<Secret>,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<(), kube::Error> {
        let patch = serde_json::json!({
            "data": { key: BASE64.encode(value.as_bytes()) }
        });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for KubeSecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeSecretStore").finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl SecretStore for KubeSecretStore {
    async fn get(
        &self,
        name: &str,
        key: &str,
        namespace: &str,
    ) -> Result<Option<String>, StoreError> {
        let secret = self
            .api(namespace)
            .get_opt(name)
            .await
            .map_err(|e| StoreError::Read {
                namespace: namespace.to_owned(),
                name: name.to_owned(),
                key: key.to_owned(),
                reason: e.to_string(),
            })?;

        let Some(bytes) = secret.and_then(|s| s.data).and_then(|mut d| d.remove(key)) else {
            return Ok(None);
        };

        String::from_utf8(bytes.0)
            .map(Some)
            .map_err(|_| StoreError::Decode {
                namespace: namespace.to_owned(),
                name: name.to_owned(),
                key: key.to_owned(),
            })
    }

    async fn put(
        &self,
        name: &str,
        key: &str,
        value: &str,
        namespace: &str,
    ) -> Result<(), StoreError> {
        let write_err = |e: kube::Error| StoreError::Write {
            namespace: namespace.to_owned(),
            name: name.to_owned(),
            key: key.to_owned(),
            reason: e.to_string(),
        };

        let api = self.api(namespace);
        match self.patch_key(&api, name, key, value).await {
            Ok(()) => {
                debug!(namespace, name, key, "secret key patched");
                return Ok(());
            }
            Err(kube::Error::Api(err)) if err.code == 404 => {}
            Err(e) => return Err(write_err(e)),
        }

        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                namespace: Some(namespace.to_owned()),
                ..ObjectMeta::default()
            },
            data: Some(BTreeMap::from([(
                key.to_owned(),
                ByteString(value.as_bytes().to_vec()),
            )])),
            ..Secret::default()
        };

        match api.create(&PostParams::default(), &secret).await {
            Ok(_) => {
                debug!(namespace, name, key, "secret created");
                Ok(())
            }
            // Lost a create race with another writer; the secret exists now.
            Err(kube::Error::Api(err)) if err.code == 409 => self
                .patch_key(&api, name, key, value)
                .await
                .map_err(write_err),
            Err(e) => Err(write_err(e)),
        }
    }
}
