//! The transport-agnostic connection manager: one instance per connected
//! device, parameterized by a [`Transport`] adapter.
//!
//! The manager owns the connection state machine, the outgoing message
//! queue with MTU-aware chunking, and the liveness check. It is driven from
//! a single task per device (the `Device` driver), so the flush re-entrancy
//! guard is a plain boolean, not a lock.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::sync::{mpsc, watch};

use crate::error::{DeviceError, StateError, TransportError};
use crate::message::{chunk_encoded, decode_messages, encode_message, TxMessage, MTU_RESERVED};
use crate::registry::MessageRegistry;

// ── Transport contract ────────────────────────────────────────────────────────

/// What the core requires from a concrete transport: open/close the link,
/// write one chunk, report link state and sizing, and push raw inbound
/// bytes into the channel handed over via [`Transport::take_inbound`].
///
/// Implementations live at the edge of the crate (see the `ble` and `udp`
/// modules) or outside it entirely; the core never looks past this trait.
#[async_trait]
pub trait Transport: Send {
    /// Establish the link. Resolves when the transport confirms.
    async fn open(&mut self) -> Result<(), TransportError>;

    /// Tear the link down. Resolves when the transport confirms.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Write one chunk; resolves when the transport accepts it. Chunks are
    /// never larger than `mtu() - MTU_RESERVED` bytes.
    async fn write(&mut self, chunk: &[u8]) -> Result<(), TransportError>;

    /// Whether the link is currently up, as far as the transport knows.
    fn is_open(&self) -> bool;

    /// Current maximum write size: the negotiated value while open, or the
    /// transport's fixed default otherwise.
    fn mtu(&self) -> usize;

    /// Whether [`ConnectionManager::reconnect`] may re-open this transport.
    fn supports_reconnect(&self) -> bool {
        false
    }

    /// Hand over the receiver of raw inbound bytes. Called once at manager
    /// construction; later calls return `None`.
    fn take_inbound(&mut self) -> Option<mpsc::UnboundedReceiver<Vec<u8>>>;
}

// ── Status ────────────────────────────────────────────────────────────────────

/// Connection lifecycle state. Transitions are strictly sequential; see the
/// state machine on [`ConnectionManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    NotConnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Tunables for one connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// How often the liveness check runs while connected.
    pub liveness_interval: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            liveness_interval: Duration::from_millis(5000),
        }
    }
}

/// An inbound typed message, owned for channel transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxPacket {
    pub name: String,
    pub payload: Vec<u8>,
}

/// The receivers handed to whoever drives a [`ConnectionManager`] (normally
/// the `Device` driver task).
pub struct ConnectionEvents {
    /// Status transitions, including liveness-forced drops.
    pub status: watch::Receiver<ConnectionStatus>,
    /// Decoded data-path messages (sensor data, vibration acks, …).
    pub messages: mpsc::UnboundedReceiver<RxPacket>,
    /// Decoded device-meta messages (battery, name, type, firmware).
    pub meta: mpsc::UnboundedReceiver<RxPacket>,
    /// Raw inbound bytes from the transport; feed them back through
    /// [`ConnectionManager::parse_incoming`].
    pub inbound: mpsc::UnboundedReceiver<Vec<u8>>,
}

// ── Manager ───────────────────────────────────────────────────────────────────

/// State machine:
///
/// ```text
/// NotConnected --connect()--> Connecting --(transport confirms)--> Connected
/// Connected --disconnect()--> Disconnecting --(confirms)--> NotConnected
/// ```
///
/// Redundant `connect`/`disconnect` calls return a [`StateError`] instead of
/// panicking, because callers routinely race UI actions against async
/// confirms. A liveness-forced drop jumps straight to `NotConnected` with no
/// `Disconnecting` stop — downstream, that absence is the only difference
/// from a user-initiated disconnect.
pub struct ConnectionManager {
    transport: Box<dyn Transport>,
    registry: Arc<MessageRegistry>,
    status_tx: watch::Sender<ConnectionStatus>,
    pending: VecDeque<TxMessage>,
    flushing: bool,
    mtu: usize,
    messages_tx: mpsc::UnboundedSender<RxPacket>,
    meta_tx: mpsc::UnboundedSender<RxPacket>,
    config: ConnectionConfig,
}

impl ConnectionManager {
    pub fn new(
        mut transport: Box<dyn Transport>,
        registry: Arc<MessageRegistry>,
        config: ConnectionConfig,
    ) -> (Self, ConnectionEvents) {
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::NotConnected);
        let (messages_tx, messages_rx) = mpsc::unbounded_channel();
        let (meta_tx, meta_rx) = mpsc::unbounded_channel();
        let inbound = transport
            .take_inbound()
            .expect("transport inbound receiver already taken");
        let mtu = transport.mtu();
        (
            Self {
                transport,
                registry,
                status_tx,
                pending: VecDeque::new(),
                flushing: false,
                mtu,
                messages_tx,
                meta_tx,
                config,
            },
            ConnectionEvents {
                status: status_rx,
                messages: messages_rx,
                meta: meta_rx,
                inbound,
            },
        )
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status_tx.borrow()
    }

    pub fn liveness_interval(&self) -> Duration {
        self.config.liveness_interval
    }

    /// Current effective MTU.
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Override the negotiated MTU (e.g. after a transport-level exchange).
    /// Reset to the transport default whenever the connection leaves
    /// `Connected`.
    pub fn set_mtu(&mut self, mtu: usize) {
        self.mtu = mtu;
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        let previous = self.status();
        if previous == status {
            return;
        }
        if previous == ConnectionStatus::Connected {
            // Any exit from Connected forgets the negotiated MTU.
            self.mtu = self.transport.mtu();
        }
        if status == ConnectionStatus::Connected {
            self.mtu = self.transport.mtu();
        }
        debug!("connection status {previous:?} -> {status:?}");
        let _ = self.status_tx.send(status);
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Open the transport. From any state but `NotConnected` this is a
    /// no-op reporting [`StateError::AlreadyConnected`].
    pub async fn connect(&mut self) -> Result<(), DeviceError> {
        if self.status() != ConnectionStatus::NotConnected {
            return Err(StateError::AlreadyConnected.into());
        }
        self.set_status(ConnectionStatus::Connecting);
        match self.transport.open().await {
            Ok(()) => {
                self.set_status(ConnectionStatus::Connected);
                Ok(())
            }
            Err(e) => {
                self.set_status(ConnectionStatus::NotConnected);
                Err(e.into())
            }
        }
    }

    /// Close the transport. Queued messages are discarded — there is no
    /// partial-send guarantee across a disconnect. From any state but
    /// `Connected` this is a no-op reporting
    /// [`StateError::AlreadyDisconnected`].
    pub async fn disconnect(&mut self) -> Result<(), DeviceError> {
        if self.status() != ConnectionStatus::Connected {
            return Err(StateError::AlreadyDisconnected.into());
        }
        self.set_status(ConnectionStatus::Disconnecting);
        self.pending.clear();
        let result = self.transport.close().await;
        self.set_status(ConnectionStatus::NotConnected);
        result.map_err(Into::into)
    }

    /// Re-enter the connect sequence. Permitted only from `NotConnected`
    /// and only when the transport declares itself reconnect-capable.
    pub async fn reconnect(&mut self) -> Result<(), DeviceError> {
        if self.status() != ConnectionStatus::NotConnected {
            return Err(StateError::AlreadyConnected.into());
        }
        if !self.transport.supports_reconnect() {
            return Err(StateError::ReconnectUnsupported.into());
        }
        self.connect().await
    }

    /// One liveness tick: when the transport silently dropped underneath a
    /// `Connected` state, force the state machine to `NotConnected`.
    pub fn check_liveness(&mut self) {
        if self.status() == ConnectionStatus::Connected && !self.transport.is_open() {
            warn!("transport dropped without a disconnect; forcing NotConnected");
            self.pending.clear();
            self.set_status(ConnectionStatus::NotConnected);
        }
    }

    // ── Outgoing path ────────────────────────────────────────────────────────

    /// Append `messages` to the outgoing FIFO and, when `flush_now`, drain
    /// the queue to the transport.
    ///
    /// With `flush_now == false` the call returns immediately; a later
    /// flush picks the messages up (used to batch logically-related
    /// messages into one radio packet). When a flush is already in
    /// progress the call also returns immediately — the in-progress flush
    /// drains anything enqueued before it finishes, so nothing is
    /// stranded.
    pub async fn send_messages(
        &mut self,
        messages: Vec<TxMessage>,
        flush_now: bool,
    ) -> Result<(), DeviceError> {
        self.pending.extend(messages);
        if !flush_now || self.flushing {
            return Ok(());
        }
        self.flush().await
    }

    /// Drain the pending queue: encode every message, partition the frames
    /// into `MTU − 3`-byte groups without splitting any frame, and write
    /// the groups in order, each completing before the next starts. The
    /// drain loops until the queue stays empty, covering messages enqueued
    /// while writes were in flight.
    ///
    /// On failure the un-sent batch is pushed back to the queue front, so
    /// the next flush retries it.
    async fn flush(&mut self) -> Result<(), DeviceError> {
        self.flushing = true;
        while !self.pending.is_empty() {
            let batch: Vec<TxMessage> = self.pending.drain(..).collect();
            if let Err(e) = self.send_batch(&batch).await {
                for message in batch.into_iter().rev() {
                    self.pending.push_front(message);
                }
                self.flushing = false;
                return Err(e);
            }
        }
        self.flushing = false;
        Ok(())
    }

    async fn send_batch(&mut self, batch: &[TxMessage]) -> Result<(), DeviceError> {
        let encoded = batch
            .iter()
            .map(|m| encode_message(&self.registry, m))
            .collect::<Result<Vec<_>, _>>()?;
        let max = self.mtu.saturating_sub(MTU_RESERVED);
        let chunks = chunk_encoded(encoded, max)?;
        for chunk in chunks {
            self.transport.write(&chunk).await?;
        }
        Ok(())
    }

    // ── Inbound path ─────────────────────────────────────────────────────────

    /// Decode every message in `buffer` and dispatch each onto the data or
    /// meta channel. Protocol errors abort the rest of the buffer and
    /// propagate to the caller.
    pub fn parse_incoming(&self, buffer: &[u8]) -> Result<(), DeviceError> {
        for message in decode_messages(&self.registry, buffer) {
            let message = message?;
            let packet = RxPacket {
                name: message.name.to_owned(),
                payload: message.payload.to_vec(),
            };
            if self.registry.is_meta(message.name) {
                let _ = self.meta_tx.send(packet);
            } else {
                let _ = self.messages_tx.send(packet);
            }
        }
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::ProtocolError;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// A scripted transport: records every write, exposes a switchable
    /// link-state flag, and lets tests inject inbound bytes.
    pub(crate) struct MockTransport {
        pub open: Arc<AtomicBool>,
        pub writes: Arc<Mutex<Vec<Vec<u8>>>>,
        pub inbound_tx: mpsc::UnboundedSender<Vec<u8>>,
        inbound_rx: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
        mtu: usize,
        reconnectable: bool,
        pub fail_writes: Arc<AtomicBool>,
    }

    impl MockTransport {
        pub(crate) fn new(mtu: usize) -> Self {
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            Self {
                open: Arc::new(AtomicBool::new(false)),
                writes: Arc::new(Mutex::new(Vec::new())),
                inbound_tx,
                inbound_rx: Some(inbound_rx),
                mtu,
                reconnectable: true,
                fail_writes: Arc::new(AtomicBool::new(false)),
            }
        }

        pub(crate) fn not_reconnectable(mut self) -> Self {
            self.reconnectable = false;
            self
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn open(&mut self) -> Result<(), TransportError> {
            self.open.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            self.open.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn write(&mut self, chunk: &[u8]) -> Result<(), TransportError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(TransportError::Backend("scripted write failure".into()));
            }
            self.writes.lock().unwrap().push(chunk.to_vec());
            Ok(())
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        fn mtu(&self) -> usize {
            self.mtu
        }

        fn supports_reconnect(&self) -> bool {
            self.reconnectable
        }

        fn take_inbound(&mut self) -> Option<mpsc::UnboundedReceiver<Vec<u8>>> {
            self.inbound_rx.take()
        }
    }

    fn manager_with(mtu: usize) -> (ConnectionManager, ConnectionEvents, Arc<Mutex<Vec<Vec<u8>>>>, Arc<AtomicBool>) {
        let transport = MockTransport::new(mtu);
        let writes = transport.writes.clone();
        let open = transport.open.clone();
        let (manager, events) = ConnectionManager::new(
            Box::new(transport),
            Arc::new(MessageRegistry::default()),
            ConnectionConfig::default(),
        );
        (manager, events, writes, open)
    }

    #[tokio::test]
    async fn state_machine_walks_the_full_cycle() {
        let (mut m, events, _, _) = manager_with(64);
        assert_eq!(m.status(), ConnectionStatus::NotConnected);
        m.connect().await.unwrap();
        assert_eq!(m.status(), ConnectionStatus::Connected);
        m.disconnect().await.unwrap();
        assert_eq!(m.status(), ConnectionStatus::NotConnected);
        drop(events);
    }

    #[tokio::test]
    async fn redundant_transitions_fail_without_changing_state() {
        let (mut m, _events, _, _) = manager_with(64);
        // disconnect from NotConnected
        assert!(matches!(
            m.disconnect().await,
            Err(DeviceError::State(StateError::AlreadyDisconnected))
        ));
        m.connect().await.unwrap();
        // connect from Connected
        assert!(matches!(
            m.connect().await,
            Err(DeviceError::State(StateError::AlreadyConnected))
        ));
        assert_eq!(m.status(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn reconnect_requires_capability_and_idle_state() {
        let transport = MockTransport::new(64).not_reconnectable();
        let (mut m, _events) = ConnectionManager::new(
            Box::new(transport),
            Arc::new(MessageRegistry::default()),
            ConnectionConfig::default(),
        );
        assert!(matches!(
            m.reconnect().await,
            Err(DeviceError::State(StateError::ReconnectUnsupported))
        ));

        let (mut m, _events, _, _) = manager_with(64);
        m.connect().await.unwrap();
        assert!(matches!(
            m.reconnect().await,
            Err(DeviceError::State(StateError::AlreadyConnected))
        ));
        m.disconnect().await.unwrap();
        m.reconnect().await.unwrap();
        assert_eq!(m.status(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn flush_chunks_writes_at_mtu_minus_reserved() {
        // MTU 23 → 20 usable bytes. Frames are payload + 3 header bytes:
        // 7 + 7 = 20 fills the first write exactly, 2 lands in the second.
        let (mut m, _events, writes, _) = manager_with(23);
        m.connect().await.unwrap();
        let messages = vec![
            TxMessage::with_payload("sensorData", vec![1; 7]),
            TxMessage::with_payload("sensorData", vec![2; 7]),
            TxMessage::with_payload("sensorData", vec![3; 2]),
        ];
        m.send_messages(messages.clone(), true).await.unwrap();

        let writes = writes.lock().unwrap();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].len(), 20);
        assert_eq!(writes[1].len(), 5);

        // Concatenating all writes and decoding yields the original set.
        let stream: Vec<u8> = writes.concat();
        let registry = MessageRegistry::default();
        let decoded: Vec<_> = decode_messages(&registry, &stream)
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(decoded.len(), 3);
        for (rx, tx) in decoded.iter().zip(&messages) {
            assert_eq!(rx.payload, tx.payload.as_deref().unwrap());
        }
    }

    #[tokio::test]
    async fn unflushed_messages_wait_for_the_next_flush() {
        let (mut m, _events, writes, _) = manager_with(64);
        m.connect().await.unwrap();
        m.send_messages(vec![TxMessage::new("batteryLevel")], false)
            .await
            .unwrap();
        assert!(writes.lock().unwrap().is_empty());
        m.send_messages(vec![TxMessage::new("getName")], true)
            .await
            .unwrap();
        // Both messages travel in one write, queue order preserved.
        let writes = writes.lock().unwrap();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0][0], 0); // batteryLevel index first
    }

    #[tokio::test]
    async fn oversized_message_is_fatal_and_retained() {
        let (mut m, _events, writes, _) = manager_with(23);
        m.connect().await.unwrap();
        let err = m
            .send_messages(
                vec![TxMessage::with_payload("sensorData", vec![0; 30])],
                true,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DeviceError::Protocol(ProtocolError::MessageTooLarge { .. })
        ));
        assert!(writes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_write_leaves_queue_intact_for_retry() {
        let transport = MockTransport::new(64);
        let writes = transport.writes.clone();
        let fail = transport.fail_writes.clone();
        let (mut m, _events) = ConnectionManager::new(
            Box::new(transport),
            Arc::new(MessageRegistry::default()),
            ConnectionConfig::default(),
        );
        m.connect().await.unwrap();

        fail.store(true, Ordering::SeqCst);
        let err = m
            .send_messages(vec![TxMessage::new("batteryLevel")], true)
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::Transport(_)));

        fail.store(false, Ordering::SeqCst);
        m.send_messages(vec![], true).await.unwrap();
        assert_eq!(writes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn liveness_forces_not_connected_when_link_drops() {
        let (mut m, events, _, open) = manager_with(64);
        m.connect().await.unwrap();
        m.set_mtu(100);
        assert_eq!(m.mtu(), 100);

        // Nothing wrong yet: tick is a no-op.
        m.check_liveness();
        assert_eq!(m.status(), ConnectionStatus::Connected);

        // Link silently drops.
        open.store(false, Ordering::SeqCst);
        m.check_liveness();
        assert_eq!(m.status(), ConnectionStatus::NotConnected);
        // Negotiated MTU was forgotten on the way out.
        assert_eq!(m.mtu(), 64);
        assert_eq!(*events.status.borrow(), ConnectionStatus::NotConnected);
    }

    #[tokio::test]
    async fn inbound_messages_split_between_data_and_meta_channels() {
        let (m, mut events, _, _) = manager_with(64);
        let registry = MessageRegistry::default();
        let mut buffer = Vec::new();
        buffer.extend(
            encode_message(&registry, &TxMessage::with_payload("batteryLevel", vec![87])).unwrap(),
        );
        buffer.extend(
            encode_message(&registry, &TxMessage::with_payload("sensorData", vec![1, 2])).unwrap(),
        );
        m.parse_incoming(&buffer).unwrap();

        let meta = events.meta.recv().await.unwrap();
        assert_eq!(meta.name, "batteryLevel");
        assert_eq!(meta.payload, vec![87]);
        let data = events.messages.recv().await.unwrap();
        assert_eq!(data.name, "sensorData");
    }

    #[tokio::test]
    async fn disconnect_discards_the_queue() {
        let (mut m, _events, writes, _) = manager_with(64);
        m.connect().await.unwrap();
        m.send_messages(vec![TxMessage::new("batteryLevel")], false)
            .await
            .unwrap();
        m.disconnect().await.unwrap();
        m.connect().await.unwrap();
        m.send_messages(vec![], true).await.unwrap();
        assert!(writes.lock().unwrap().is_empty());
    }
}
