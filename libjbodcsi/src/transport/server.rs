//! QUIC server that runs on each worker node and dispatches incoming CSI
//! requests to the node service.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quinn::crypto::rustls::QuicServerConfig;
use tracing::{debug, error, info, instrument, warn};

use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::message::CsiMessage;
use crate::node::CsiNode;

/// Largest request or response accepted on a stream.
pub(crate) const MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;

/// A CSI server that accepts QUIC connections and dispatches
/// [`CsiMessage`] requests to a [`CsiIdentity`] + [`CsiNode`]
/// implementation.
pub struct CsiServer<T> {
    endpoint: quinn::Endpoint,
    handler: Arc<T>,
    request_timeout: Duration,
}

impl<T> CsiServer<T>
where
    T: CsiIdentity + CsiNode + 'static,
{
    /// Create a new server bound to `addr`.
    ///
    /// Each request must complete within `request_timeout`; an expired
    /// request is answered with [`CsiError::DeadlineExceeded`].
    pub fn new(
        addr: SocketAddr,
        tls_config: rustls::ServerConfig,
        handler: Arc<T>,
        request_timeout: Duration,
    ) -> Result<Self, CsiError> {
        let quic_server_config = QuicServerConfig::try_from(tls_config)
            .map_err(|e| CsiError::TransportError(format!("invalid TLS config: {e}")))?;
        let server_config = quinn::ServerConfig::with_crypto(Arc::new(quic_server_config));
        let endpoint = quinn::Endpoint::server(server_config, addr).map_err(CsiError::transport)?;
        info!(%addr, "CSI QUIC server listening");
        Ok(Self {
            endpoint,
            handler,
            request_timeout,
        })
    }

    /// Accept connections in a loop until the endpoint is closed.
    ///
    /// Each accepted connection spawns a Tokio task, and each bi-stream
    /// within a connection is handled concurrently.
    pub async fn serve(&self) -> Result<(), CsiError> {
        while let Some(incoming) = self.endpoint.accept().await {
            let handler = Arc::clone(&self.handler);
            let timeout = self.request_timeout;
            tokio::spawn(async move {
                match incoming.await {
                    Ok(conn) => {
                        let remote = conn.remote_address();
                        debug!(%remote, "CSI connection accepted");
                        if let Err(e) = Self::handle_connection(conn, handler, timeout).await {
                            warn!(%remote, error = %e, "CSI connection error");
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "CSI incoming connection failed");
                    }
                }
            });
        }
        Ok(())
    }

    /// Handle all bi-streams on a single connection.
    async fn handle_connection(
        conn: quinn::Connection,
        handler: Arc<T>,
        timeout: Duration,
    ) -> Result<(), CsiError> {
        loop {
            let (send, recv) = match conn.accept_bi().await {
                Ok(stream) => stream,
                Err(quinn::ConnectionError::ApplicationClosed(_)) => return Ok(()),
                Err(e) => return Err(CsiError::transport(e)),
            };

            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                if let Err(e) = Self::handle_stream(send, recv, &handler, timeout).await {
                    error!(error = %e, "CSI stream handler error");
                }
            });
        }
    }

    /// Process a single bi-stream: read request → dispatch → write response.
    #[instrument(skip_all)]
    async fn handle_stream(
        mut send: quinn::SendStream,
        mut recv: quinn::RecvStream,
        handler: &T,
        timeout: Duration,
    ) -> Result<(), CsiError> {
        let buf = recv
            .read_to_end(MAX_MESSAGE_BYTES)
            .await
            .map_err(CsiError::transport)?;

        let response = match serde_json::from_slice::<CsiMessage>(&buf) {
            Ok(request) => {
                debug!(%request, "CSI request received");
                dispatch_with_deadline(handler, request, timeout).await
            }
            Err(e) => CsiMessage::Error(CsiError::InvalidArgument(format!(
                "malformed request: {e}"
            ))),
        };

        let payload = serde_json::to_vec(&response).map_err(CsiError::internal)?;
        send.write_all(&payload)
            .await
            .map_err(CsiError::transport)?;
        send.finish().map_err(CsiError::transport)?;
        Ok(())
    }

    /// Return a reference to the underlying QUIC endpoint, useful for
    /// obtaining the local address or shutting down.
    pub fn endpoint(&self) -> &quinn::Endpoint {
        &self.endpoint
    }
}

/// Run [`dispatch`] under a deadline.
///
/// On expiry the in-flight call is dropped; node operations record state
/// only after their mount work succeeds, so the caller can simply retry.
pub(crate) async fn dispatch_with_deadline<T>(
    handler: &T,
    request: CsiMessage,
    timeout: Duration,
) -> CsiMessage
where
    T: CsiIdentity + CsiNode,
{
    let label = request.to_string();
    match tokio::time::timeout(timeout, dispatch(handler, request)).await {
        Ok(response) => response,
        Err(_) => {
            warn!(request = %label, ?timeout, "CSI request deadline exceeded");
            CsiMessage::Error(CsiError::DeadlineExceeded(label))
        }
    }
}

/// Map a [`CsiMessage`] request to the correct trait method call and wrap
/// the result in a response [`CsiMessage`].
pub(crate) async fn dispatch<T>(handler: &T, request: CsiMessage) -> CsiMessage
where
    T: CsiIdentity + CsiNode,
{
    let result = match request {
        // --- Identity -------------------------------------------------------
        CsiMessage::Probe => handler.probe().await.map(CsiMessage::ProbeResult),
        CsiMessage::GetPluginInfo => handler
            .get_plugin_info()
            .await
            .map(CsiMessage::PluginInfoResponse),
        CsiMessage::GetPluginCapabilities => handler
            .get_plugin_capabilities()
            .await
            .map(CsiMessage::PluginCapabilitiesResponse),

        // --- Node -----------------------------------------------------------
        CsiMessage::GetNodeInfo => handler.get_info().await.map(CsiMessage::NodeInfoResponse),
        CsiMessage::GetNodeCapabilities => handler
            .get_capabilities()
            .await
            .map(CsiMessage::NodeCapabilitiesResponse),
        CsiMessage::StageVolume(req) => handler.stage_volume(req).await.map(|()| CsiMessage::Ok),
        CsiMessage::UnstageVolume {
            volume_id,
            staging_target_path,
        } => handler
            .unstage_volume(&volume_id, &staging_target_path)
            .await
            .map(|()| CsiMessage::Ok),
        CsiMessage::PublishVolume(req) => {
            handler.publish_volume(req).await.map(|()| CsiMessage::Ok)
        }
        CsiMessage::UnpublishVolume {
            volume_id,
            target_path,
        } => handler
            .unpublish_volume(&volume_id, &target_path)
            .await
            .map(|()| CsiMessage::Ok),
        CsiMessage::GetVolumeStats {
            volume_id,
            volume_path,
        } => handler
            .get_volume_stats(&volume_id, &volume_path)
            .await
            .map(CsiMessage::VolumeStatsResponse),

        // --- Response variants should never arrive as requests --------------
        other => {
            warn!(msg = %other, "unexpected message variant received as request");
            Err(CsiError::InvalidArgument(format!(
                "unexpected message: {other}"
            )))
        }
    };

    result.unwrap_or_else(|e| {
        debug!(code = %e.code(), error = %e, "CSI request failed");
        CsiMessage::Error(e)
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use super::*;
    use crate::backend::JbodNode;
    use crate::config::NodeConfig;
    use crate::error::StatusCode;
    use crate::mounter::fake::FakeMounter;
    use crate::registry::VolumeRegistry;
    use crate::types::*;

    async fn node(delay: Option<Duration>) -> JbodNode {
        let registry = Arc::new(VolumeRegistry::new());
        registry
            .upsert(Volume::new("v1", "/dev/sdb", AccessFlags::BOTH))
            .await
            .unwrap();
        let mounter = Arc::new(FakeMounter {
            delay,
            ..Default::default()
        });
        JbodNode::new(&NodeConfig::new("node-01"), registry, mounter)
    }

    fn stage() -> CsiMessage {
        CsiMessage::StageVolume(NodeStageVolumeRequest {
            volume_id: "v1".into(),
            staging_target_path: "/staging/v1".into(),
            volume_capability: Some(RequestedCapability::mount(
                AccessMode::ReadWriteOnce,
                "xfs",
                &[],
            )),
            volume_context: HashMap::new(),
        })
    }

    #[tokio::test]
    async fn dispatches_node_requests() {
        let node = node(None).await;
        assert!(matches!(dispatch(&node, stage()).await, CsiMessage::Ok));
        assert!(matches!(
            dispatch(&node, CsiMessage::GetNodeInfo).await,
            CsiMessage::NodeInfoResponse(info) if info.node_id == "node-01"
        ));
        assert!(matches!(
            dispatch(&node, CsiMessage::Probe).await,
            CsiMessage::ProbeResult(true)
        ));
    }

    #[tokio::test]
    async fn errors_become_error_responses() {
        let node = node(None).await;
        let response = dispatch(
            &node,
            CsiMessage::UnpublishVolume {
                volume_id: "missing".into(),
                target_path: "/pods/p1".into(),
            },
        )
        .await;
        let CsiMessage::Error(err) = response else {
            panic!("expected error response");
        };
        assert_eq!(err.code(), StatusCode::NotFound);
    }

    #[tokio::test]
    async fn response_variant_as_request_is_rejected() {
        let node = node(None).await;
        let response = dispatch(&node, CsiMessage::Ok).await;
        assert!(matches!(
            response,
            CsiMessage::Error(CsiError::InvalidArgument(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_request_hits_deadline_without_recording() {
        let node = node(Some(Duration::from_secs(60))).await;
        let response = dispatch_with_deadline(&node, stage(), Duration::from_secs(1)).await;
        assert!(matches!(
            response,
            CsiMessage::Error(CsiError::DeadlineExceeded(_))
        ));
        let vol = node.registry().lookup(&"v1".into()).await.unwrap();
        assert!(!vol.is_staged());
    }
}
