//! UDP discovery of gateways on the local network.

use crate::config::{ClientConfig, DiscoveryConfig};
use crate::error::ClientError;
use comfoconnect_protocol::message::SearchGatewayResponse;
use comfoconnect_protocol::{format_uuid, MessageCodec, ProtobufCodec};
use serde::Serialize;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span};
use uuid::Uuid;

/// Capacity of the discovery event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Largest datagram accepted as a discovery response.
const MAX_DATAGRAM_SIZE: usize = 1500;

/// A gateway that answered a discovery request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredDevice {
    pub address: String,
    pub port: u16,
    pub uuid: Uuid,
    pub version: u32,
    /// MAC address, taken from the low six bytes of the UUID.
    pub mac: String,
}

impl DiscoveredDevice {
    fn from_response(response: SearchGatewayResponse, from: SocketAddr, port: u16) -> Self {
        let address = if response.address.is_empty() {
            from.ip().to_string()
        } else {
            response.address
        };
        let mac = response.uuid.as_bytes()[10..]
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(":");
        Self {
            address,
            port,
            uuid: response.uuid,
            version: response.version,
            mac,
        }
    }

    /// Returns a client configuration for this gateway.
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig::new(self.address.clone(), self.uuid).with_port(self.port)
    }
}

/// Events raised during a discovery run.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    Discovered(DiscoveredDevice),
    /// The run failed and is being aborted.
    Error(String),
}

/// Discovers gateways by UDP broadcast.
pub struct Discovery {
    config: DiscoveryConfig,
    codec: Arc<dyn MessageCodec>,
    span: Span,
    in_progress: AtomicBool,
    events: broadcast::Sender<DiscoveryEvent>,
}

/// Clears the in-progress flag when a run ends, including when its future is dropped.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Discovery {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self::with_codec(
            config,
            Arc::new(ProtobufCodec::new()),
            tracing::info_span!("discovery"),
        )
    }

    pub fn with_codec(config: DiscoveryConfig, codec: Arc<dyn MessageCodec>, span: Span) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            codec,
            span,
            in_progress: AtomicBool::new(false),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.events.subscribe()
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// Broadcasts discovery requests until the timeout, the device limit or
    /// cancellation, and returns the distinct gateways found.
    ///
    /// Cancellation rejects with [`ClientError::Aborted`]; a malformed
    /// response aborts the whole run.
    pub async fn discover(
        &self,
        cancel: CancellationToken,
    ) -> Result<Vec<DiscoveredDevice>, ClientError> {
        if self.in_progress.swap(true, Ordering::SeqCst) {
            return Err(ClientError::AlreadyInProgress);
        }
        let _guard = RunGuard(&self.in_progress);

        self.run(cancel).instrument(self.span.clone()).await
    }

    async fn run(&self, cancel: CancellationToken) -> Result<Vec<DiscoveredDevice>, ClientError> {
        let socket = UdpSocket::bind(self.config.bind_addr).await?;
        socket.set_broadcast(true)?;
        let request = self.codec.encode_discovery_request();

        let deadline = tokio::time::sleep(self.config.timeout());
        tokio::pin!(deadline);
        let mut ticker = tokio::time::interval(self.config.broadcast_interval());

        let mut devices = Vec::new();
        let mut seen = HashSet::new();
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        tracing::debug!(
            targets = self.config.broadcast_addresses.len(),
            port = self.config.port,
            "discovery started"
        );

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    tracing::debug!("discovery cancelled");
                    return Err(ClientError::Aborted);
                }
                _ = &mut deadline => {
                    tracing::debug!(found = devices.len(), "discovery timed out");
                    break;
                }
                received = socket.recv_from(&mut buf) => {
                    let (n, from) = received?;
                    let response = match self.codec.decode_discovery_response(&buf[..n]) {
                        Ok(response) => response,
                        Err(source) => {
                            let err = ClientError::MalformedDiscoveryResponse { from, source };
                            tracing::warn!(error = %err, "aborting discovery");
                            let _ = self.events.send(DiscoveryEvent::Error(err.to_string()));
                            return Err(err);
                        }
                    };

                    if !seen.insert(response.uuid) {
                        continue;
                    }

                    let device = DiscoveredDevice::from_response(response, from, self.config.port);
                    tracing::info!(
                        address = %device.address,
                        uuid = %format_uuid(&device.uuid),
                        "gateway discovered"
                    );
                    let _ = self.events.send(DiscoveryEvent::Discovered(device.clone()));
                    devices.push(device);

                    if self.config.limit.is_some_and(|limit| devices.len() >= limit) {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    for address in &self.config.broadcast_addresses {
                        let target = SocketAddr::new(*address, self.config.port);
                        if let Err(e) = socket.send_to(&request, target).await {
                            tracing::warn!(%target, error = %e, "discovery broadcast failed");
                        }
                    }
                }
            }
        }

        Ok(devices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use comfoconnect_protocol::parse_uuid;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    /// Binds a fake gateway that answers every request with `replies`.
    async fn responder(replies: Vec<Bytes>) -> u16 {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            while let Ok((_, from)) = socket.recv_from(&mut buf).await {
                for reply in &replies {
                    let _ = socket.send_to(reply, from).await;
                }
            }
        });
        port
    }

    fn reply(uuid: &str, address: &str) -> Bytes {
        ProtobufCodec::new().encode_discovery_response(&SearchGatewayResponse {
            address: address.to_string(),
            uuid: parse_uuid(uuid).unwrap(),
            version: 1,
        })
    }

    fn config(port: u16) -> DiscoveryConfig {
        DiscoveryConfig::new()
            .with_broadcast_addresses(vec![IpAddr::V4(Ipv4Addr::LOCALHOST)])
            .with_bind_addr("127.0.0.1:0".parse().unwrap())
            .with_port(port)
            .with_broadcast_interval(Duration::from_millis(50))
            .with_timeout(Duration::from_millis(300))
    }

    #[tokio::test]
    async fn test_dedup_across_sources() {
        // One gateway answering from two source addresses
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        let other = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let answer = reply("0000000000251010800170b3d54264b4", "192.168.1.213");
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            while let Ok((_, from)) = socket.recv_from(&mut buf).await {
                let _ = socket.send_to(&answer, from).await;
                let _ = other.send_to(&answer, from).await;
            }
        });
        let discovery = Discovery::new(config(port));
        let mut events = discovery.subscribe();

        let devices = discovery.discover(CancellationToken::new()).await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].address, "192.168.1.213");
        assert_eq!(devices[0].port, port);
        assert_eq!(devices[0].mac, "70:b3:d5:42:64:b4");
        assert!(!discovery.is_in_progress());

        let mut discovered = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, DiscoveryEvent::Discovered(_)) {
                discovered += 1;
            }
        }
        assert_eq!(discovered, 1);
    }

    #[tokio::test]
    async fn test_limit_ends_run() {
        let port = responder(vec![reply("a1", "10.0.0.1"), reply("a2", "10.0.0.2")]).await;
        let discovery = Discovery::new(config(port).with_limit(1).with_timeout(Duration::from_secs(30)));
        let mut events = discovery.subscribe();

        let devices = tokio::time::timeout(
            Duration::from_secs(5),
            discovery.discover(CancellationToken::new()),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(devices.len(), 1);
        assert!(matches!(
            events.recv().await.unwrap(),
            DiscoveryEvent::Discovered(_)
        ));
    }

    #[tokio::test]
    async fn test_missing_address_uses_sender() {
        let port = responder(vec![reply("a1", "")]).await;
        let discovery = Discovery::new(config(port).with_limit(1));

        let devices = discovery.discover(CancellationToken::new()).await.unwrap();
        assert_eq!(devices[0].address, "127.0.0.1");
        assert_eq!(devices[0].client_config().address, "127.0.0.1");
    }

    #[tokio::test]
    async fn test_malformed_response_aborts() {
        let port = responder(vec![Bytes::from_static(&[0xff, 0xff, 0xff])]).await;
        let discovery = Discovery::new(config(port));
        let mut events = discovery.subscribe();

        let err = discovery
            .discover(CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::MalformedDiscoveryResponse { .. }));
        assert!(matches!(
            events.recv().await.unwrap(),
            DiscoveryEvent::Error(_)
        ));
        assert!(!discovery.is_in_progress());
    }

    #[tokio::test]
    async fn test_cancel_and_single_run() {
        let port = responder(Vec::new()).await;
        let discovery = Arc::new(Discovery::new(
            config(port).with_timeout(Duration::from_secs(30)),
        ));
        let cancel = CancellationToken::new();

        let run = {
            let discovery = discovery.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { discovery.discover(cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(discovery.is_in_progress());
        assert!(matches!(
            discovery.discover(CancellationToken::new()).await,
            Err(ClientError::AlreadyInProgress)
        ));

        cancel.cancel();
        assert!(matches!(run.await.unwrap(), Err(ClientError::Aborted)));
        assert!(!discovery.is_in_progress());
    }
}
