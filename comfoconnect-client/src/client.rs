//! Session client.
//!
//! [`Client`] drives one gateway: it connects the transport on demand,
//! registers and starts a session, correlates requests with their confirms
//! and dispatches unsolicited notifications.

use crate::completion::Completion;
use crate::config::ClientConfig;
use crate::error::{rmi_error_description, ClientError};
use crate::property::{
    PropertyDescriptor, PropertyListener, PropertySubscription, PropertyUpdate, RmiProperty,
};
use crate::transport::{InboundMessage, Transport, TransportEvent, TransportState};
use bytes::Bytes;
use comfoconnect_protocol::message::*;
use comfoconnect_protocol::{
    format_uuid, property, MessageCodec, Opcode, Operation, Payload, PropertyValue, ProtobufCodec,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{Instrument, Span};
use uuid::Uuid;

/// Capacity of the client event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    None,
    Registering,
    Active,
}

/// A confirm or notification with its decoded body.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub operation: Operation,
    pub payload: Payload,
}

/// A node seen on the gateway's bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NodeInfo {
    pub node_id: u32,
    pub product_id: u32,
    pub zone_id: u32,
    pub mode: NodeMode,
}

impl From<&CnNodeNotification> for NodeInfo {
    fn from(node: &CnNodeNotification) -> Self {
        Self {
            node_id: node.node_id,
            product_id: node.product_id,
            zone_id: node.zone_id,
            mode: node.mode,
        }
    }
}

/// Events broadcast to [`Client::subscribe_events`] receivers.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The gateway closed the session.
    SessionClosed,
    NodeUpdated(NodeInfo),
    Alarm(CnAlarmNotification),
    GatewayNotification(GatewayNotification),
    /// The transport lost its connection.
    Disconnected,
}

/// Callback for notifications of a given opcode.
pub type NotificationHandler = Arc<dyn Fn(&Response) + Send + Sync>;

struct PendingRequest {
    opcode: Opcode,
    expected: Opcode,
    completion: Completion<Response>,
}

/// Removes a pending entry when its request ends, however it ends.
struct PendingEntry<'a> {
    pending: &'a Mutex<HashMap<u32, PendingRequest>>,
    id: u32,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

struct ClientInner {
    config: ClientConfig,
    codec: Arc<dyn MessageCodec>,
    transport: Arc<Transport>,
    span: Span,
    state: Mutex<SessionState>,
    /// Serializes session transitions started through the API.
    lifecycle: tokio::sync::Mutex<()>,
    /// Serializes on-demand connects.
    connecting: tokio::sync::Mutex<()>,
    pending: Mutex<HashMap<u32, PendingRequest>>,
    subscriptions: Mutex<HashMap<u32, PropertySubscription>>,
    handlers: Mutex<HashMap<Opcode, Vec<NotificationHandler>>>,
    nodes: Mutex<BTreeMap<u32, NodeInfo>>,
    events: broadcast::Sender<ClientEvent>,
    next_listener: AtomicU64,
}

/// Client for a single ComfoConnect gateway.
pub struct Client {
    inner: Arc<ClientInner>,
    dispatcher: JoinHandle<()>,
}

impl Client {
    /// Creates a client using the protobuf codec. Must be called within a
    /// tokio runtime.
    pub fn new(config: ClientConfig) -> Self {
        let span = tracing::info_span!(
            "comfoconnect",
            gateway = %format_uuid(&config.device_uuid)
        );
        Self::with_codec(config, Arc::new(ProtobufCodec::new()), span)
    }

    /// Creates a client with an explicit message codec and logging span.
    pub fn with_codec(config: ClientConfig, codec: Arc<dyn MessageCodec>, span: Span) -> Self {
        let (transport, transport_events) =
            Transport::new(config.clone(), codec.clone(), span.clone());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let inner = Arc::new(ClientInner {
            config,
            codec,
            transport,
            span: span.clone(),
            state: Mutex::new(SessionState::None),
            lifecycle: tokio::sync::Mutex::new(()),
            connecting: tokio::sync::Mutex::new(()),
            pending: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            handlers: Mutex::new(HashMap::new()),
            nodes: Mutex::new(BTreeMap::new()),
            events,
            next_listener: AtomicU64::new(1),
        });

        let dispatcher =
            tokio::spawn(dispatch_loop(inner.clone(), transport_events).instrument(span));

        Self { inner, dispatcher }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.transport.state() == TransportState::Connected
    }

    /// Subscribes to client events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    /// Registers a handler run after the built-in handling of `opcode`.
    pub fn on_notification(
        &self,
        opcode: Opcode,
        handler: impl Fn(&Response) + Send + Sync + 'static,
    ) {
        self.inner
            .handlers
            .lock()
            .entry(opcode)
            .or_default()
            .push(Arc::new(handler));
    }

    /// Returns the nodes reported by the gateway, ordered by node id.
    pub fn nodes(&self) -> Vec<NodeInfo> {
        self.inner.nodes.lock().values().copied().collect()
    }

    // =========================================================================
    // Connection and session
    // =========================================================================

    /// Connects the transport.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.inner.transport.connect().await
    }

    /// Registers with the gateway and starts a session.
    pub async fn start_session(&self) -> Result<(), ClientError> {
        let _guard = self.inner.lifecycle.lock().await;
        if *self.inner.state.lock() != SessionState::None {
            return Err(ClientError::AlreadyActive);
        }
        self.inner.handshake().await
    }

    /// Closes the session, keeping the connection open.
    pub async fn close_session(&self) -> Result<(), ClientError> {
        let _guard = self.inner.lifecycle.lock().await;
        if *self.inner.state.lock() == SessionState::None {
            return Ok(());
        }
        let result = self
            .inner
            .request(Opcode::CloseSessionRequest, &Payload::Empty)
            .await;
        *self.inner.state.lock() = SessionState::None;
        for subscription in self.inner.subscriptions.lock().values_mut() {
            subscription.registered = false;
        }
        tracing::info!(parent: &self.inner.span, "session closed");
        result.map(|_| ())
    }

    /// Closes the session, if any, and the connection.
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        if self.state() == SessionState::Active && self.is_connected() {
            if let Err(e) = self.close_session().await {
                tracing::warn!(parent: &self.inner.span, error = %e, "close session failed");
            }
        }
        self.inner.transport.disconnect().await;
        Ok(())
    }

    /// Sends a message, connecting and starting the session as needed.
    ///
    /// Returns the confirm for opcodes that have one, `None` otherwise.
    pub async fn send(
        &self,
        opcode: Opcode,
        payload: Payload,
    ) -> Result<Option<Response>, ClientError> {
        self.inner.send(opcode, &payload).await
    }

    // =========================================================================
    // Properties
    // =========================================================================

    /// Adds a listener for pushed updates of `descriptor` and requests the
    /// subscription from the gateway.
    ///
    /// If the request fails the listener is removed again; the subscription
    /// itself is kept so later listeners reuse it.
    pub async fn register_property_listener(
        &self,
        descriptor: PropertyDescriptor,
        listener: impl Fn(&PropertyUpdate) + Send + Sync + 'static,
    ) -> Result<(), ClientError> {
        let pdid = descriptor.id;
        self.inner
            .subscriptions
            .lock()
            .entry(pdid)
            .or_insert_with(|| PropertySubscription::new(descriptor.clone()))
            .claims += 1;

        let result = self.subscribe(descriptor, Arc::new(listener)).await;

        if let Some(subscription) = self.inner.subscriptions.lock().get_mut(&pdid) {
            subscription.claims = subscription.claims.saturating_sub(1);
        }
        result
    }

    /// Requests a claimed subscription; the resubscription pass skips it
    /// while the claim is held.
    async fn subscribe(
        &self,
        descriptor: PropertyDescriptor,
        listener: PropertyListener,
    ) -> Result<(), ClientError> {
        let pdid = descriptor.id;
        self.inner.ensure_connected().await?;
        self.inner.ensure_session().await?;

        let key = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        let request = {
            let mut subscriptions = self.inner.subscriptions.lock();
            let subscription = subscriptions
                .entry(pdid)
                .or_insert_with(|| PropertySubscription::new(descriptor));
            subscription.add_listener(key, listener);
            CnRpdoRequest::new(pdid, subscription.descriptor.data_type.code().into())
        };

        match self
            .inner
            .request(Opcode::CnRpdoRequest, &Payload::RpdoRequest(request))
            .await
        {
            Ok(_) => {
                if let Some(subscription) = self.inner.subscriptions.lock().get_mut(&pdid) {
                    subscription.registered = true;
                }
                tracing::debug!(parent: &self.inner.span, pdid, "property subscribed");
                Ok(())
            }
            Err(e) => {
                if let Some(subscription) = self.inner.subscriptions.lock().get_mut(&pdid) {
                    subscription.remove_listener(key);
                }
                Err(e)
            }
        }
    }

    /// Reads a property through RMI.
    pub async fn read_property(&self, property: &RmiProperty) -> Result<PropertyValue, ClientError> {
        let response = self
            .inner
            .rmi(property.node_id, property.read_command())
            .await?;
        Ok(property::decode(property.data_type, &response.message)?)
    }

    /// Writes a property through RMI.
    pub async fn write_property(
        &self,
        property: &RmiProperty,
        value: &PropertyValue,
    ) -> Result<(), ClientError> {
        if !property.writable {
            return Err(ClientError::ReadOnlyProperty(property.name.clone()));
        }
        let command = property.write_command(value)?;
        self.inner.rmi(property.node_id, command).await?;
        Ok(())
    }

    /// Sends a raw RMI command to a node and returns the device's reply.
    pub async fn rmi_request(&self, node_id: u32, message: Bytes) -> Result<Bytes, ClientError> {
        Ok(self.inner.rmi(node_id, message).await?.message)
    }

    // =========================================================================
    // Gateway operations
    // =========================================================================

    pub async fn version(&self) -> Result<VersionConfirm, ClientError> {
        match self.inner.call(Opcode::VersionRequest, Payload::Empty).await? {
            Payload::VersionConfirm(version) => Ok(version),
            other => Err(unexpected(Opcode::VersionConfirm, &other)),
        }
    }

    /// Returns the gateway clock, in seconds since 2000-01-01.
    pub async fn gateway_time(&self) -> Result<u32, ClientError> {
        let request = Payload::TimeRequest(CnTimeRequest::default());
        match self.inner.call(Opcode::CnTimeRequest, request).await? {
            Payload::TimeConfirm(time) => Ok(time.current_time),
            other => Err(unexpected(Opcode::CnTimeConfirm, &other)),
        }
    }

    pub async fn list_registered_devices(&self) -> Result<Vec<RegisteredDevice>, ClientError> {
        match self
            .inner
            .call(Opcode::ListRegisteredDevicesRequest, Payload::Empty)
            .await?
        {
            Payload::ListRegisteredDevicesConfirm(list) => Ok(list.devices),
            other => Err(unexpected(Opcode::ListRegisteredDevicesConfirm, &other)),
        }
    }

    pub async fn deregister_device(&self, uuid: Uuid) -> Result<(), ClientError> {
        let request = Payload::DeregisterDevice(DeregisterDeviceRequest { uuid });
        self.inner
            .call(Opcode::DeregisterDeviceRequest, request)
            .await?;
        Ok(())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

fn unexpected(opcode: Opcode, payload: &Payload) -> ClientError {
    ClientError::UnexpectedPayload {
        opcode,
        kind: payload.kind(),
    }
}

impl ClientInner {
    async fn send(
        self: &Arc<Self>,
        opcode: Opcode,
        payload: &Payload,
    ) -> Result<Option<Response>, ClientError> {
        self.ensure_connected().await?;
        if !opcode.is_session_exempt() {
            self.ensure_session().await?;
        }
        self.request(opcode, payload).await
    }

    /// Sends a request that has a confirm and returns the confirm body.
    async fn call(self: &Arc<Self>, opcode: Opcode, payload: Payload) -> Result<Payload, ClientError> {
        match self.send(opcode, &payload).await? {
            Some(response) => Ok(response.payload),
            None => Ok(Payload::Empty),
        }
    }

    async fn rmi(self: &Arc<Self>, node_id: u32, message: Bytes) -> Result<CnRmiResponse, ClientError> {
        let request = Payload::RmiRequest(CnRmiRequest { node_id, message });
        match self.call(Opcode::CnRmiRequest, request).await? {
            Payload::RmiResponse(response) if response.result != 0 => Err(ClientError::RmiError {
                code: response.result,
                description: rmi_error_description(response.result),
            }),
            Payload::RmiResponse(response) => Ok(response),
            other => Err(unexpected(Opcode::CnRmiResponse, &other)),
        }
    }

    async fn ensure_connected(&self) -> Result<(), ClientError> {
        if self.transport.state() == TransportState::Connected {
            return Ok(());
        }
        let _guard = self.connecting.lock().await;
        match self.transport.connect().await {
            Ok(()) | Err(ClientError::AlreadyConnected) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn ensure_session(self: &Arc<Self>) -> Result<(), ClientError> {
        if *self.state.lock() == SessionState::Active {
            return Ok(());
        }
        let _guard = self.lifecycle.lock().await;
        if *self.state.lock() == SessionState::Active {
            return Ok(());
        }
        self.handshake().await
    }

    /// Registers and starts a session. Callers hold the lifecycle lock.
    async fn handshake(self: &Arc<Self>) -> Result<(), ClientError> {
        *self.state.lock() = SessionState::Registering;
        tracing::debug!(parent: &self.span, "registering");

        let result = async {
            self.ensure_connected().await?;
            let register = Payload::RegisterDevice(RegisterDeviceRequest {
                uuid: self.config.client_uuid,
                pin: self.config.pin,
                device_name: self.config.device_name.clone(),
            });
            self.request(Opcode::RegisterDeviceRequest, &register).await?;

            let start = Payload::StartSession(StartSessionRequest { takeover: true });
            self.request(Opcode::StartSessionRequest, &start).await
        }
        .await;

        match result {
            Ok(_) => {
                *self.state.lock() = SessionState::Active;
                tracing::info!(parent: &self.span, "session active");
                self.spawn_resubscribe();
                Ok(())
            }
            Err(e) => {
                *self.state.lock() = SessionState::None;
                tracing::warn!(parent: &self.span, error = %e, "session start failed");
                Err(e)
            }
        }
    }

    /// Sends one message without any session handling.
    async fn request(&self, opcode: Opcode, payload: &Payload) -> Result<Option<Response>, ClientError> {
        if !opcode.expects_confirm() {
            self.transport.send(opcode, payload).await?;
            return Ok(None);
        }

        // Register before writing so a fast confirm cannot miss its entry.
        let id = self.transport.reserve_id();
        let (completion, waiter) = Completion::new();
        self.pending.lock().insert(
            id,
            PendingRequest {
                opcode,
                expected: opcode.confirm(),
                completion,
            },
        );
        let _entry = PendingEntry {
            pending: &self.pending,
            id,
        };

        self.transport.send_with_id(id, opcode, payload).await?;

        match tokio::time::timeout(self.config.request_timeout(), waiter).await {
            Ok(result) => result.map(Some),
            Err(_) => {
                tracing::warn!(parent: &self.span, id, %opcode, "request timed out");
                Err(ClientError::GatewayTimeout { opcode, id })
            }
        }
    }

    fn spawn_resubscribe(self: &Arc<Self>) {
        let targets: Vec<CnRpdoRequest> = self
            .subscriptions
            .lock()
            .values()
            .filter(|s| s.needs_resubscribe())
            .map(|s| CnRpdoRequest::new(s.descriptor.id, s.descriptor.data_type.code().into()))
            .collect();
        if targets.is_empty() {
            return;
        }

        let inner = self.clone();
        tokio::spawn(
            async move {
                tracing::debug!(count = targets.len(), "resubscribing properties");
                for request in targets {
                    let pdid = request.pdid;
                    let payload = Payload::RpdoRequest(request);
                    match inner.request(Opcode::CnRpdoRequest, &payload).await {
                        Ok(_) => {
                            if let Some(s) = inner.subscriptions.lock().get_mut(&pdid) {
                                s.registered = true;
                            }
                        }
                        Err(e) => tracing::warn!(pdid, error = %e, "resubscribe failed"),
                    }
                }
            }
            .instrument(self.span.clone()),
        );
    }

    // =========================================================================
    // Inbound dispatch
    // =========================================================================

    async fn handle_message(&self, message: InboundMessage) {
        let InboundMessage { operation, payload } = message;

        let pending = self.pending.lock().remove(&operation.id);
        if let Some(pending) = pending {
            self.complete(pending, operation, &payload);
            return;
        }

        self.handle_notification(operation, &payload).await;
    }

    fn complete(&self, pending: PendingRequest, operation: Operation, raw: &[u8]) {
        let id = operation.id;
        let outcome = if operation.opcode != pending.expected {
            Err(ClientError::UnexpectedResponseOpcode {
                id,
                expected: pending.expected,
                actual: operation.opcode,
            })
        } else if let Some(result) = operation.result.filter(|r| !r.is_ok()) {
            Err(ClientError::GatewayError {
                opcode: pending.opcode,
                result,
                description: operation.description.clone(),
            })
        } else {
            self.codec
                .decode_payload(operation.opcode, raw)
                .map(|payload| Response { operation, payload })
                .map_err(ClientError::from)
        };

        let settled = match outcome {
            Ok(response) => pending.completion.resolve(response),
            Err(e) => {
                tracing::debug!(parent: &self.span, id, error = %e, "request failed");
                pending.completion.reject(e)
            }
        };
        if settled.is_err() {
            tracing::debug!(parent: &self.span, id, "confirm for settled request");
        }
    }

    async fn handle_notification(&self, operation: Operation, raw: &[u8]) {
        let opcode = operation.opcode;
        let payload = match self.codec.decode_payload(opcode, raw) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(parent: &self.span, %opcode, error = %e, "dropping malformed notification");
                return;
            }
        };
        let response = Response { operation, payload };

        match (opcode, &response.payload) {
            (Opcode::CloseSessionRequest, _) => {
                tracing::info!(parent: &self.span, "session closed by gateway");
                *self.state.lock() = SessionState::None;
                let _ = self.events.send(ClientEvent::SessionClosed);
                self.transport.disconnect().await;
            }
            (Opcode::CnNodeNotification, Payload::NodeNotification(node)) => {
                let info = NodeInfo::from(node);
                self.nodes.lock().insert(info.node_id, info);
                tracing::debug!(parent: &self.span, node_id = info.node_id, "node updated");
                let _ = self.events.send(ClientEvent::NodeUpdated(info));
            }
            (Opcode::CnRpdoNotification, Payload::RpdoNotification(notification)) => {
                self.handle_property_update(notification);
            }
            (Opcode::GatewayNotification, Payload::GatewayNotification(notification)) => {
                tracing::debug!(parent: &self.span, "gateway notification");
                let _ = self
                    .events
                    .send(ClientEvent::GatewayNotification(notification.clone()));
            }
            (Opcode::CnAlarmNotification, Payload::AlarmNotification(alarm)) => {
                tracing::warn!(
                    parent: &self.span,
                    node_id = alarm.node_id,
                    error_id = alarm.error_id,
                    errors = %hex::encode(&alarm.errors),
                    "alarm"
                );
                let _ = self.events.send(ClientEvent::Alarm(alarm.clone()));
            }
            _ => {
                tracing::debug!(parent: &self.span, %opcode, id = response.operation.id, "unhandled message");
            }
        }

        let handlers = self.handlers.lock().get(&opcode).cloned().unwrap_or_default();
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&response))).is_err() {
                tracing::warn!(parent: &self.span, %opcode, "notification handler panicked");
            }
        }
    }

    fn handle_property_update(&self, notification: &CnRpdoNotification) {
        let pdid = notification.pdid;
        let (update, listeners) = {
            let subscriptions = self.subscriptions.lock();
            let Some(subscription) = subscriptions.get(&pdid) else {
                tracing::debug!(parent: &self.span, pdid, "update for unsubscribed property");
                return;
            };
            // The descriptor's convert hook is caller code and runs here.
            let update = catch_unwind(AssertUnwindSafe(|| {
                subscription.update(notification.data.clone())
            }));
            (update, subscription.listeners())
        };

        let update = match update {
            Ok(Ok(update)) => update,
            Ok(Err(e)) => {
                tracing::warn!(parent: &self.span, pdid, error = %e, "undecodable property update");
                return;
            }
            Err(_) => {
                tracing::warn!(parent: &self.span, pdid, "property conversion panicked");
                return;
            }
        };

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&update))).is_err() {
                tracing::warn!(parent: &self.span, pdid, "property listener panicked");
            }
        }
    }

    fn handle_disconnect(&self) {
        *self.state.lock() = SessionState::None;
        for subscription in self.subscriptions.lock().values_mut() {
            subscription.registered = false;
        }

        let pending: Vec<PendingRequest> = self.pending.lock().drain().map(|(_, p)| p).collect();
        tracing::info!(parent: &self.span, rejected = pending.len(), "connection lost");
        for request in pending {
            let _ = request.completion.reject(ClientError::ConnectionClosed);
        }

        let _ = self.events.send(ClientEvent::Disconnected);
    }
}

async fn dispatch_loop(inner: Arc<ClientInner>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Message(message) => inner.handle_message(message).await,
            TransportEvent::Disconnected => {
                if catch_unwind(AssertUnwindSafe(|| inner.handle_disconnect())).is_err() {
                    tracing::error!("disconnect handling panicked");
                }
            }
        }
    }
}
