//! curlme kubehub: ConfigMap list/watch feed, remote store and event
//! recorder on top of kube-rs.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use curlme_core::Resource;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::Client;

mod feed;
mod recorder;
mod store;

pub use feed::ConfigMapFeed;
pub use recorder::{KubeRecorder, MAX_REASON_LEN};
pub use store::{merge_patch_body, store_error, KubeStore};

/// Client from the ambient kubeconfig or in-cluster service account.
pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("building kube client (KUBECONFIG or in-cluster config)")
}

/// Shape a ConfigMap into the engine's resource model.
pub fn resource_from(cm: &ConfigMap) -> Result<Resource> {
    let meta = &cm.metadata;
    let name = meta.name.clone().ok_or_else(|| anyhow!("object missing metadata.name"))?;
    let namespace = meta
        .namespace
        .clone()
        .ok_or_else(|| anyhow!("object {} missing metadata.namespace", name))?;
    Ok(Resource {
        namespace,
        name,
        resource_version: meta.resource_version.clone(),
        uid: meta.uid.clone(),
        annotations: meta.annotations.clone().unwrap_or_default(),
        data: cm.data.clone().unwrap_or_default(),
    })
}
