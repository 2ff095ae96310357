//! Dev-mode port-forward to the in-cluster storage service.

use std::net::SocketAddr;

use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::ListParams;
use kube::{Api, Client};
use tokio::net::TcpListener;
use tracing::{debug, warn};

use crate::error::StorageError;

fn transient(err: impl std::fmt::Display) -> StorageError {
    StorageError::Transient(err.to_string())
}

/// Bind a local listener and bridge every accepted connection to one of the
/// service's pods via the kube port-forward API. Returns the local address.
pub(crate) async fn forward_service(
    client: Client,
    namespace: &str,
    name: &str,
    port: u16,
) -> Result<SocketAddr, StorageError> {
    let services: Api<Service> = Api::namespaced(client.clone(), namespace);
    let service = services.get(name).await.map_err(transient)?;
    let selector = service
        .spec
        .and_then(|s| s.selector)
        .ok_or_else(|| transient(format!("service {}/{} has no selector", namespace, name)))?;
    let label_selector = selector
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",");

    let pods: Api<Pod> = Api::namespaced(client, namespace);
    let pod_list = pods
        .list(&ListParams::default().labels(&label_selector))
        .await
        .map_err(transient)?;
    let pod_name = pod_list
        .items
        .into_iter()
        .filter_map(|p| {
            let running = p
                .status
                .as_ref()
                .and_then(|s| s.phase.as_deref())
                .is_some_and(|phase| phase == "Running");
            running.then(|| p.metadata.name).flatten()
        })
        .next()
        .ok_or_else(|| transient(format!("no running pod behind {}/{}", namespace, name)))?;

    let listener = TcpListener::bind(("127.0.0.1", 0)).await.map_err(transient)?;
    let addr = listener.local_addr().map_err(transient)?;
    debug!(%addr, pod = %pod_name, "Port-forward established");

    tokio::spawn(async move {
        loop {
            let Ok((mut conn, _)) = listener.accept().await else {
                break;
            };
            let pods = pods.clone();
            let pod_name = pod_name.clone();
            tokio::spawn(async move {
                match pods.portforward(&pod_name, &[port]).await {
                    Ok(mut pf) => {
                        let Some(mut upstream) = pf.take_stream(port) else {
                            warn!(pod = %pod_name, port, "Port-forward stream unavailable");
                            return;
                        };
                        let _ = tokio::io::copy_bidirectional(&mut conn, &mut upstream).await;
                    }
                    Err(e) => warn!(pod = %pod_name, error = %e, "Port-forward failed"),
                }
            });
        }
    });

    Ok(addr)
}
