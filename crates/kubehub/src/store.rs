use curlme_core::{ObjectKey, RemoteStore, Resource, StoreError};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{
    api::{Patch, PatchParams},
    Api, Client,
};
use serde_json::{json, Value as Json};
use tracing::debug;

use crate::resource_from;

/// ConfigMap store backed by the API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self { Self { client } }

    fn api(&self, namespace: &str) -> Api<ConfigMap> { Api::namespaced(self.client.clone(), namespace) }
}

/// Merge patch writing the full data map, guarded by the resource version the
/// change was computed from. Keys are added or overwritten; the server answers
/// 409 if the object moved on in the meantime.
pub fn merge_patch_body(resource: &Resource) -> Json {
    let mut body = json!({ "data": resource.data });
    if let Some(rv) = &resource.resource_version {
        body["metadata"] = json!({ "resourceVersion": rv });
    }
    body
}

/// Classify a kube error, keeping optimistic-concurrency conflicts apart.
pub fn store_error(key: &ObjectKey, e: kube::Error) -> StoreError {
    match e {
        kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict(format!("{}: {}", key, ae.message)),
        kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound(format!("{}: {}", key, ae.message)),
        other => StoreError::Other(format!("{}: {}", key, other)),
    }
}

#[async_trait::async_trait]
impl RemoteStore for KubeStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<Resource>, StoreError> {
        let obj = self.api(key.namespace()).get_opt(key.name()).await.map_err(|e| store_error(key, e))?;
        match obj {
            Some(cm) => resource_from(&cm).map(Some).map_err(|e| StoreError::Other(e.to_string())),
            None => Ok(None),
        }
    }

    async fn update(&self, resource: &Resource) -> Result<Resource, StoreError> {
        let key = resource.key();
        let body = merge_patch_body(resource);
        let pp = PatchParams::default();
        let cm = self
            .api(key.namespace())
            .patch(key.name(), &pp, &Patch::Merge(&body))
            .await
            .map_err(|e| store_error(&key, e))?;
        debug!(key = %key, rv = ?cm.metadata.resource_version, "configmap patched");
        resource_from(&cm).map_err(|e| StoreError::Other(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_err(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: "the object has been modified".into(),
            reason: "Conflict".into(),
            code,
        })
    }

    #[test]
    fn patch_carries_data_and_resource_version() {
        let r = Resource::new("ns", "cm1").with_resource_version("41").with_data("greeting", "hi");
        let body = merge_patch_body(&r);
        assert_eq!(body["data"]["greeting"], "hi");
        assert_eq!(body["metadata"]["resourceVersion"], "41");
    }

    #[test]
    fn patch_without_version_has_no_precondition() {
        let body = merge_patch_body(&Resource::new("ns", "cm1").with_data("k", "v"));
        assert!(body.get("metadata").is_none());
    }

    #[test]
    fn conflicts_and_not_found_are_classified() {
        let key = ObjectKey::new("ns", "cm1");
        assert!(matches!(store_error(&key, api_err(409)), StoreError::Conflict(_)));
        assert!(matches!(store_error(&key, api_err(404)), StoreError::NotFound(_)));
        assert!(matches!(store_error(&key, api_err(500)), StoreError::Other(_)));
    }
}
