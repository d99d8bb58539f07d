//! TCP transport to a single gateway.
//!
//! The transport owns the socket, frames outgoing messages into envelopes,
//! reassembles inbound envelopes and hands them to its owner over an
//! unbounded channel. It knows nothing about sessions or correlation.

use crate::config::ClientConfig;
use crate::error::ClientError;
use bytes::Bytes;
use comfoconnect_protocol::{Envelope, EnvelopeDecoder, MessageCodec, Opcode, Operation, Payload};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{Instrument, Span};

/// Read buffer size for socket reads (8 KiB).
const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Disconnected,
    Connecting,
    Connected,
}

/// A decoded inbound envelope.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub operation: Operation,
    /// Raw message body; decoding is left to the receiver.
    pub payload: Bytes,
}

/// Events raised by the transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Message(InboundMessage),
    /// The connection ended. Raised once per connection.
    Disconnected,
}

/// Background tasks of one live connection.
struct Link {
    generation: u64,
    reader: JoinHandle<()>,
    keep_alive: JoinHandle<()>,
}

/// A TCP connection to a gateway.
pub struct Transport {
    config: ClientConfig,
    codec: Arc<dyn MessageCodec>,
    span: Span,
    state: Mutex<TransportState>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    link: Mutex<Option<Link>>,
    next_id: AtomicU32,
    generation: AtomicU64,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl Transport {
    /// Creates a transport (not yet connected) and the receiver of its events.
    pub fn new(
        config: ClientConfig,
        codec: Arc<dyn MessageCodec>,
        span: Span,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            config,
            codec,
            span,
            state: Mutex::new(TransportState::Disconnected),
            writer: tokio::sync::Mutex::new(None),
            link: Mutex::new(None),
            next_id: AtomicU32::new(1),
            generation: AtomicU64::new(0),
            events,
        });
        (transport, rx)
    }

    pub fn state(&self) -> TransportState {
        *self.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == TransportState::Connected
    }

    /// Opens the TCP connection and starts the read and keep-alive tasks.
    pub async fn connect(self: &Arc<Self>) -> Result<(), ClientError> {
        {
            let mut state = self.state.lock();
            match *state {
                TransportState::Connecting => return Err(ClientError::AlreadyConnecting),
                TransportState::Connected => return Err(ClientError::AlreadyConnected),
                TransportState::Disconnected => *state = TransportState::Connecting,
            }
        }

        let address = self.config.address.as_str();
        let port = self.config.port;
        tracing::debug!(parent: &self.span, address, port, "connecting");

        let stream = match tokio::time::timeout(
            self.config.connect_timeout(),
            TcpStream::connect((address, port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                tracing::debug!(parent: &self.span, error = %e, "connect failed");
                *self.state.lock() = TransportState::Disconnected;
                return Err(ClientError::Io(e));
            }
            Err(_) => {
                tracing::debug!(parent: &self.span, "connect timeout");
                *self.state.lock() = TransportState::Disconnected;
                return Err(ClientError::Timeout);
            }
        };

        stream.set_nodelay(true).ok();
        let (read_half, write_half) = stream.into_split();
        *self.writer.lock().await = Some(write_half);

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        {
            // Hold the link slot while spawning so a read loop that ends
            // immediately still finds its link to tear down.
            let mut link = self.link.lock();
            let reader = tokio::spawn(
                read_loop(
                    Arc::downgrade(self),
                    read_half,
                    self.codec.clone(),
                    self.events.clone(),
                    generation,
                )
                .instrument(self.span.clone()),
            );
            let keep_alive = tokio::spawn(
                keep_alive_loop(Arc::downgrade(self), self.config.keep_alive_interval())
                    .instrument(self.span.clone()),
            );
            *link = Some(Link {
                generation,
                reader,
                keep_alive,
            });
            *self.state.lock() = TransportState::Connected;
        }

        tracing::debug!(parent: &self.span, generation, "connected");
        Ok(())
    }

    /// Reserves the next message id.
    ///
    /// Ids start at 1 and increase monotonically per transport; 0 is skipped
    /// on wrap-around.
    pub fn reserve_id(&self) -> u32 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            if id != 0 {
                return id;
            }
        }
    }

    /// Sends a message under a fresh id and returns the id.
    pub async fn send(&self, opcode: Opcode, payload: &Payload) -> Result<u32, ClientError> {
        if !self.is_connected() {
            return Err(ClientError::Disconnected);
        }
        let id = self.reserve_id();
        self.send_with_id(id, opcode, payload).await?;
        Ok(id)
    }

    /// Sends a message under a previously reserved id.
    ///
    /// Resolves once the whole envelope is written to the socket.
    pub async fn send_with_id(
        &self,
        id: u32,
        opcode: Opcode,
        payload: &Payload,
    ) -> Result<(), ClientError> {
        if !self.is_connected() {
            return Err(ClientError::Disconnected);
        }

        let operation = self.codec.encode_operation(&Operation::new(opcode, id))?;
        let body = self.codec.encode_payload(opcode, payload)?;
        let frame = Envelope::to_bytes(
            self.config.client_uuid,
            self.config.device_uuid,
            &operation,
            &body,
        )?;

        let written = {
            let mut writer = self.writer.lock().await;
            let writer = writer.as_mut().ok_or(ClientError::Disconnected)?;
            writer.write_all(&frame).await
        };

        match written {
            Ok(()) => {
                tracing::debug!(parent: &self.span, id, %opcode, bytes = frame.len(), "sent");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(parent: &self.span, id, %opcode, error = %e, "write failed");
                self.teardown(None).await;
                Err(ClientError::Io(e))
            }
        }
    }

    /// Closes the connection. Does nothing when already disconnected.
    pub async fn disconnect(&self) {
        self.teardown(None).await;
    }

    /// Tears down the live connection, if any, and raises `Disconnected`.
    ///
    /// With a generation, only that connection is torn down; a read loop
    /// from an earlier connection cannot close a newer one.
    async fn teardown(&self, generation: Option<u64>) {
        let link = {
            let mut slot = self.link.lock();
            let current = slot
                .as_ref()
                .is_some_and(|link| generation.map_or(true, |g| g == link.generation));
            if current {
                slot.take()
            } else {
                None
            }
        };
        let Some(link) = link else {
            return;
        };

        *self.state.lock() = TransportState::Disconnected;
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }

        tracing::debug!(parent: &self.span, generation = link.generation, "disconnected");
        let _ = self.events.send(TransportEvent::Disconnected);

        // Either task may be the caller; aborting last keeps the work above intact.
        link.keep_alive.abort();
        link.reader.abort();
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Some(link) = self.link.get_mut().take() {
            link.reader.abort();
            link.keep_alive.abort();
        }
    }
}

async fn read_loop(
    transport: Weak<Transport>,
    mut reader: OwnedReadHalf,
    codec: Arc<dyn MessageCodec>,
    events: mpsc::UnboundedSender<TransportEvent>,
    generation: u64,
) {
    let mut decoder = EnvelopeDecoder::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                tracing::debug!("connection closed by gateway");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(error = %e, "read failed");
                break;
            }
        };

        tracing::trace!(bytes = n, "received");
        decoder.extend(&buf[..n]);

        loop {
            match decoder.decode_envelope() {
                Ok(Some(envelope)) => match codec.decode_operation(&envelope.operation) {
                    Ok(operation) => {
                        tracing::debug!(
                            id = operation.id,
                            opcode = %operation.opcode,
                            bytes = envelope.payload.len(),
                            "received message"
                        );
                        let _ = events.send(TransportEvent::Message(InboundMessage {
                            operation,
                            payload: envelope.payload,
                        }));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "dropping envelope with malformed operation");
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        discarded = decoder.buffered(),
                        "dropping malformed envelope data"
                    );
                    decoder.clear();
                    break;
                }
            }
        }
    }

    if let Some(transport) = transport.upgrade() {
        transport.teardown(Some(generation)).await;
    }
}

async fn keep_alive_loop(transport: Weak<Transport>, period: std::time::Duration) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(transport) = transport.upgrade() else {
            break;
        };
        if let Err(e) = transport.send(Opcode::KeepAlive, &Payload::Empty).await {
            tracing::warn!(error = %e, "keep-alive failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use comfoconnect_protocol::{parse_uuid, ProtobufCodec, HEADER_SIZE};
    use std::time::Duration;
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, ClientConfig) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = ClientConfig::new("127.0.0.1", parse_uuid("2").unwrap())
            .with_client_uuid(parse_uuid("1").unwrap())
            .with_port(port);
        (listener, config)
    }

    fn transport(config: ClientConfig) -> (Arc<Transport>, mpsc::UnboundedReceiver<TransportEvent>) {
        Transport::new(config, Arc::new(ProtobufCodec::new()), Span::none())
    }

    async fn read_envelope(socket: &mut TcpStream) -> Envelope {
        let mut header = [0u8; HEADER_SIZE];
        socket.read_exact(&mut header).await.unwrap();
        let parsed = comfoconnect_protocol::Header::parse(&header).unwrap();
        let mut rest = vec![0u8; parsed.length() - HEADER_SIZE];
        socket.read_exact(&mut rest).await.unwrap();
        let mut frame = header.to_vec();
        frame.extend_from_slice(&rest);
        Envelope::decode(&frame, 0).unwrap().0
    }

    #[tokio::test]
    async fn test_send_while_disconnected() {
        let (_listener, config) = listener().await;
        let (transport, _events) = transport(config);

        let err = transport
            .send(Opcode::KeepAlive, &Payload::Empty)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Disconnected));
        assert_eq!(transport.state(), TransportState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_and_send() {
        let (listener, config) = listener().await;
        let (transport, _events) = transport(config);

        transport.connect().await.unwrap();
        assert_eq!(transport.state(), TransportState::Connected);
        assert!(matches!(
            transport.connect().await,
            Err(ClientError::AlreadyConnected)
        ));

        let (mut socket, _) = listener.accept().await.unwrap();
        let first = transport
            .send(Opcode::VersionRequest, &Payload::Empty)
            .await
            .unwrap();
        let second = transport
            .send(Opcode::KeepAlive, &Payload::Empty)
            .await
            .unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 2);

        let codec = ProtobufCodec::new();
        let envelope = read_envelope(&mut socket).await;
        assert_eq!(envelope.sender(), parse_uuid("1").unwrap());
        assert_eq!(envelope.receiver(), parse_uuid("2").unwrap());
        let operation = codec.decode_operation(&envelope.operation).unwrap();
        assert_eq!(operation.opcode, Opcode::VersionRequest);
        assert_eq!(operation.id, 1);

        let envelope = read_envelope(&mut socket).await;
        let operation = codec.decode_operation(&envelope.operation).unwrap();
        assert_eq!(operation.opcode, Opcode::KeepAlive);
        assert_eq!(operation.id, 2);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let (listener, config) = listener().await;
        drop(listener);
        let (transport, _events) = transport(config);

        assert!(transport.connect().await.is_err());
        assert_eq!(transport.state(), TransportState::Disconnected);
    }

    #[tokio::test]
    async fn test_partial_envelopes_are_reassembled() {
        let (listener, config) = listener().await;
        let (transport, mut events) = transport(config);
        transport.connect().await.unwrap();
        let (mut socket, _) = listener.accept().await.unwrap();

        let codec = ProtobufCodec::new();
        let operation = codec
            .encode_operation(&Operation::new(Opcode::GatewayNotification, 9))
            .unwrap();
        let frame = Envelope::to_bytes(
            parse_uuid("2").unwrap(),
            parse_uuid("1").unwrap(),
            &operation,
            b"abc",
        )
        .unwrap();

        socket.write_all(&frame[..20]).await.unwrap();
        socket.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        socket.write_all(&frame[20..]).await.unwrap();

        match events.recv().await.unwrap() {
            TransportEvent::Message(message) => {
                assert_eq!(message.operation.opcode, Opcode::GatewayNotification);
                assert_eq!(message.operation.id, 9);
                assert_eq!(message.payload.as_ref(), b"abc");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_disconnect_raised_once() {
        let (listener, config) = listener().await;
        let (transport, mut events) = transport(config);
        transport.connect().await.unwrap();
        let (socket, _) = listener.accept().await.unwrap();

        drop(socket);
        assert!(matches!(
            events.recv().await.unwrap(),
            TransportEvent::Disconnected
        ));
        assert_eq!(transport.state(), TransportState::Disconnected);

        // Explicit disconnect after the fact raises nothing further
        transport.disconnect().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(events.try_recv().is_err());

        // Reconnecting starts a fresh link
        transport.connect().await.unwrap();
        let (_socket, _) = listener.accept().await.unwrap();
        assert_eq!(transport.reserve_id(), 1);
        transport.disconnect().await;
        assert!(matches!(
            events.recv().await.unwrap(),
            TransportEvent::Disconnected
        ));
    }
}
