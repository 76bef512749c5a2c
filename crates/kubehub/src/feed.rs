use anyhow::Result;
use curlme_core::{ChangeEvent, ChangeFeed};
use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Api, Client,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::resource_from;

/// List+watch of ConfigMaps, cluster-wide or in one namespace.
#[derive(Clone)]
pub struct ConfigMapFeed {
    api: Api<ConfigMap>,
    namespace: Option<String>,
}

impl ConfigMapFeed {
    pub fn new(client: Client, namespace: Option<&str>) -> Self {
        let api = match namespace {
            Some(ns) => Api::namespaced(client, ns),
            None => Api::all(client),
        };
        Self { api, namespace: namespace.map(str::to_string) }
    }
}

#[async_trait::async_trait]
impl ChangeFeed for ConfigMapFeed {
    async fn run(&self, tx: mpsc::Sender<ChangeEvent>) -> Result<()> {
        let stream = watcher::watcher(self.api.clone(), watcher::Config::default()).default_backoff();
        futures::pin_mut!(stream);
        info!(ns = ?self.namespace, "configmap watcher started");
        while let Some(ev) = stream.next().await {
            let change = match ev {
                Ok(Event::Applied(cm)) => match resource_from(&cm) {
                    Ok(r) => ChangeEvent::Applied(r),
                    Err(e) => {
                        warn!(error = %e, "skipping unusable object");
                        continue;
                    }
                },
                Ok(Event::Deleted(cm)) => match resource_from(&cm) {
                    Ok(r) => ChangeEvent::Deleted(r.key()),
                    Err(e) => {
                        warn!(error = %e, "skipping unusable object");
                        continue;
                    }
                },
                Ok(Event::Restarted(list)) => {
                    debug!(count = list.len(), "watch restart");
                    let items = list
                        .iter()
                        .filter_map(|cm| match resource_from(cm) {
                            Ok(r) => Some(r),
                            Err(e) => {
                                warn!(error = %e, "skipping unusable object");
                                None
                            }
                        })
                        .collect();
                    ChangeEvent::Restarted(items)
                }
                Err(e) => {
                    // default_backoff spaces out retries; the stream keeps going.
                    warn!(error = %e, "watch error");
                    metrics::counter!("watch_errors_total", 1u64);
                    continue;
                }
            };
            if tx.send(change).await.is_err() {
                debug!("change receiver dropped; stopping watcher");
                return Ok(());
            }
        }
        warn!("watcher stream ended");
        Ok(())
    }
}
