//! The TCP host: owns every connection and listener on one IPv4 address,
//! demultiplexes incoming datagrams to them, allocates ephemeral ports, and
//! generates initial sequence numbers.
//!
//! The host is driven from a single thread. Datagrams come up from the IP
//! layer through [`Tcp::bottom`], go back down through [`Tcp::poll_transmit`],
//! and time advances through [`Tcp::advance_time`]. Everything observable —
//! accepted connections, delivered data, disconnects — surfaces through
//! [`Tcp::poll_event`] in the order it happened.

use crate::{
    endpoint::{Endpoint, Endpoints, Ipv4Address},
    message::Message,
    wire::{PacketError, TcpHeader},
    FxHashMap,
};
use std::{
    collections::VecDeque,
    hash::{Hash, Hasher},
    time::Duration,
};

pub mod seq;

pub mod state;
pub use state::State;

mod segment;
pub use segment::Segment;

mod write_queue;
pub use write_queue::WriteQueue;

mod rttm;
pub use rttm::RoundTripTimer;

mod congestion;
pub use congestion::Reno;

mod tcb;
pub use tcb::{
    segment_arrives_closed, segment_arrives_listen, AdvanceTimeResult, CloseResult, ConnEvent,
    ConnectionRecord, Disconnect, Initiation, ListenResult, ReceiveSequenceSpace,
    SegmentArrivesResult, SendResult, SendSequenceSpace, Tcb,
};

/// Host-wide TCP configuration. The defaults suit an Ethernet-sized MTU.
#[derive(Debug, Clone, Copy)]
pub struct TcpConfig {
    /// The MSS we advertise in our SYN.
    pub mss: u16,
    /// Receive buffer capacity per connection; bounds RCV.WND.
    pub window: u32,
    /// Maximum segment lifetime. TIME-WAIT holds for twice this.
    pub msl: Duration,
    /// The window-scale shift to offer, or `None` to not offer the option.
    pub window_scale: Option<u8>,
    /// Whether to offer RFC 7323 timestamps.
    pub timestamps: bool,
    /// The delayed-ACK coalescing timeout. `None` acknowledges immediately.
    pub delayed_ack: Option<Duration>,
    /// Retransmission attempts before a connection is aborted.
    pub rtx_limit: u32,
    /// Bytes of unsent plus unacknowledged data a connection will buffer.
    pub writeq_limit: usize,
    /// Half-open connections a listener will hold.
    pub syn_queue_limit: usize,
    /// The ephemeral port range, probed from a moving cursor.
    pub ephemeral_start: u16,
    pub ephemeral_end: u16,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            mss: 1460,
            window: 65535,
            msl: Duration::from_secs(30),
            window_scale: Some(5),
            timestamps: true,
            delayed_ack: Some(Duration::from_millis(40)),
            rtx_limit: 15,
            writeq_limit: 256 * 1024,
            syn_queue_limit: 64,
            ephemeral_start: 1024,
            ephemeral_end: u16::MAX,
        }
    }
}

/// The per-connection slice of [`TcpConfig`], snapshotted when the block is
/// created.
#[derive(Debug, Clone, Copy)]
pub struct ConnSettings {
    pub mss: u16,
    pub recv_capacity: u32,
    pub msl: Duration,
    pub window_scale: Option<u8>,
    pub timestamps: bool,
    pub delayed_ack: Option<Duration>,
    pub rtx_limit: u32,
    pub writeq_limit: usize,
}

impl Default for ConnSettings {
    fn default() -> Self {
        TcpConfig::default().conn_settings()
    }
}

impl TcpConfig {
    pub fn conn_settings(&self) -> ConnSettings {
        ConnSettings {
            mss: self.mss,
            recv_capacity: self.window,
            msl: self.msl,
            window_scale: self.window_scale,
            timestamps: self.timestamps,
            delayed_ack: self.delayed_ack,
            rtx_limit: self.rtx_limit,
            writeq_limit: self.writeq_limit,
        }
    }
}

/// A TCP segment wrapped with the addresses the IP layer needs. Outgoing
/// datagrams transfer ownership to the caller; incoming ones are consumed
/// by [`Tcp::bottom`].
#[derive(Debug, Clone)]
pub struct Datagram {
    pub src: Ipv4Address,
    pub dst: Ipv4Address,
    pub payload: Message,
}

/// Something observable happened on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpEvent {
    pub id: Endpoints,
    pub kind: TcpEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpEventKind {
    /// An active open completed its handshake.
    Connected,
    /// A listener's half-open connection completed its handshake.
    Incoming,
    /// In-order data is buffered and ready for `receive`.
    DataReceived { push: bool },
    /// The connection is coming apart.
    Disconnected { reason: Disconnect },
    /// The retransmission timer fired.
    RtxTimeout { attempt: u32 },
    /// The connection is gone from the host's table.
    Closed,
}

/// Error returned by [`Tcp::listen`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ListenError {
    #[error("Port {0} is already bound")]
    PortBound(u16),
}

/// Error returned by [`Tcp::connect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    #[error("The ephemeral port range is exhausted")]
    NoPorts,
    #[error("A connection to this destination already exists")]
    Existing,
}

/// Error returned by [`Tcp::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("No such connection")]
    NoConnection,
    #[error("The connection is closing")]
    Closing,
    #[error("The transmit queue is full")]
    QueueFull,
}

/// Error returned by [`Tcp::receive`] and friends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RecvError {
    #[error("No such connection")]
    NoConnection,
}

/// Error returned by [`Tcp::bottom`] for datagrams that never reached a
/// connection. Always drop-only: no state changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DemuxError {
    #[error("Malformed segment: {0}")]
    Header(#[from] PacketError),
}

/// A passive-open binding: the local port plus its half-open queue.
#[derive(Debug, Default)]
struct Listener {
    syn_queue: Vec<Endpoints>,
}

/// A TCP host bound to one IPv4 address.
pub struct Tcp {
    address: Ipv4Address,
    config: TcpConfig,
    connections: FxHashMap<Endpoints, Tcb>,
    listeners: FxHashMap<u16, Listener>,
    outbox: VecDeque<Datagram>,
    events: VecDeque<TcpEvent>,
    ephemeral: u16,
    /// Mixed into the ISS hash so sequence numbers are not predictable
    /// across hosts.
    iss_secret: u64,
    clock: Duration,
}

impl Tcp {
    pub fn new(address: Ipv4Address, config: TcpConfig) -> Self {
        Self {
            address,
            config,
            connections: FxHashMap::default(),
            listeners: FxHashMap::default(),
            outbox: VecDeque::new(),
            events: VecDeque::new(),
            ephemeral: config.ephemeral_start,
            iss_secret: rand::random(),
            clock: Duration::ZERO,
        }
    }

    pub fn address(&self) -> Ipv4Address {
        self.address
    }

    pub fn config(&self) -> &TcpConfig {
        &self.config
    }

    /// The number of live connections, half-open and TIME-WAIT included.
    pub fn open_connections(&self) -> usize {
        self.connections.len()
    }

    pub fn open_ports(&self) -> usize {
        self.listeners.len()
    }

    // === User interface ===

    /// Binds a listener to a local port. Completed handshakes surface as
    /// [`TcpEventKind::Incoming`] events.
    pub fn listen(&mut self, port: u16) -> Result<(), ListenError> {
        if self.listeners.contains_key(&port) {
            return Err(ListenError::PortBound(port));
        }
        self.listeners.insert(port, Listener::default());
        tracing::debug!(%port, "Listening");
        Ok(())
    }

    /// Unbinds a listener, aborting whatever half-open connections it still
    /// holds.
    pub fn unlisten(&mut self, port: u16) {
        if let Some(listener) = self.listeners.remove(&port) {
            for id in listener.syn_queue {
                if let Some(tcb) = self.connections.get_mut(&id) {
                    tcb.abort();
                }
                self.finish(id);
            }
        }
    }

    /// Opens a connection to the remote socket from a fresh ephemeral port.
    /// The returned 4-tuple is the connection's handle from here on;
    /// success arrives later as a [`TcpEventKind::Connected`] event.
    pub fn connect(&mut self, remote: Endpoint) -> Result<Endpoints, ConnectError> {
        let port = self.free_port(remote)?;
        let id = Endpoints::new(Endpoint::new(self.address, port), remote);
        let iss = self.generate_iss(id);
        let tcb = Tcb::open(id, iss, self.config.conn_settings());
        self.connections.insert(id, tcb);
        tracing::debug!(%id, "Connecting");
        self.finish(id);
        Ok(id)
    }

    /// Queues data on a connection.
    pub fn send(&mut self, id: Endpoints, chunk: Message) -> Result<(), SendError> {
        let tcb = self.connections.get_mut(&id).ok_or(SendError::NoConnection)?;
        let result = tcb.send(chunk);
        self.finish(id);
        match result {
            SendResult::Ok => Ok(()),
            SendResult::ClosingConnection => Err(SendError::Closing),
            SendResult::QueueFull => Err(SendError::QueueFull),
        }
    }

    /// Takes all in-order data buffered on a connection.
    pub fn receive(&mut self, id: Endpoints) -> Result<Message, RecvError> {
        let tcb = self.connections.get_mut(&id).ok_or(RecvError::NoConnection)?;
        let taken = tcb.receive();
        self.finish(id);
        Ok(taken)
    }

    /// Takes up to `max` bytes of buffered data. What is left behind holds
    /// the advertised window down, pacing the peer.
    pub fn receive_up_to(&mut self, id: Endpoints, max: usize) -> Result<Message, RecvError> {
        let tcb = self.connections.get_mut(&id).ok_or(RecvError::NoConnection)?;
        let taken = tcb.receive_up_to(max);
        self.finish(id);
        Ok(taken)
    }

    /// Begins a graceful close. Idempotent.
    pub fn close(&mut self, id: Endpoints) {
        if let Some(tcb) = self.connections.get_mut(&id) {
            let _ = tcb.close();
            self.finish(id);
        }
    }

    /// Resets the connection and deletes it.
    pub fn abort(&mut self, id: Endpoints) {
        if let Some(tcb) = self.connections.get_mut(&id) {
            tcb.abort();
            self.finish(id);
        }
    }

    pub fn is_connected(&self, id: Endpoints) -> bool {
        self.connections
            .get(&id)
            .map(Tcb::is_connected)
            .unwrap_or(false)
    }

    pub fn connection_state(&self, id: Endpoints) -> Option<State> {
        self.connections.get(&id).map(Tcb::state)
    }

    /// How much more data [`Tcp::send`] will accept for this connection.
    pub fn transmit_queue_available(&self, id: Endpoints) -> usize {
        self.connections
            .get(&id)
            .map(Tcb::transmit_queue_available)
            .unwrap_or(0)
    }

    /// Bytes of in-order data waiting in the connection's receive buffer.
    pub fn buffered(&self, id: Endpoints) -> usize {
        self.connections.get(&id).map(Tcb::buffered).unwrap_or(0)
    }

    // === Live update ===

    /// Snapshots a connection for live-update.
    pub fn export_connection(&self, id: Endpoints) -> Option<ConnectionRecord> {
        self.connections.get(&id).map(Tcb::export)
    }

    /// Rehydrates a connection from a live-update record.
    pub fn import_connection(&mut self, record: ConnectionRecord) {
        let tcb = Tcb::from_record(record, self.config.conn_settings());
        self.connections.insert(record.id, tcb);
    }

    // === Driver interface ===

    /// Receives a datagram from the IP layer: verify, demultiplex,
    /// dispatch.
    pub fn bottom(&mut self, datagram: Datagram) -> Result<(), DemuxError> {
        let Datagram { src, dst, payload } = datagram;
        let (header, data_offset) = match TcpHeader::from_message(&payload, src, dst) {
            Ok(parsed) => parsed,
            Err(error) => {
                tracing::debug!(%error, "Dropping malformed segment");
                return Err(error.into());
            }
        };

        let id = Endpoints {
            local: Endpoint {
                address: dst,
                port: header.dst_port,
            },
            remote: Endpoint {
                address: src,
                port: header.src_port,
            },
        };

        let mut text = payload;
        text.remove_front(data_offset);
        let segment = Segment::new(header, text);

        if let Some(tcb) = self.connections.get_mut(&id) {
            let _ = tcb.segment_arrives(segment);
            self.finish(id);
            return Ok(());
        }

        if !self.listeners.contains_key(&id.local.port) {
            // No connection, no listener: answer per the CLOSED rules.
            if let Some(response) = segment_arrives_closed(
                &segment.header,
                segment.text.len() as u32,
                id.local.address,
                id.remote.address,
            ) {
                self.transmit(id, response, Message::default());
            }
            return Ok(());
        }

        if segment.header.ctl.syn()
            && self.listeners[&id.local.port].syn_queue.len() >= self.config.syn_queue_limit
        {
            tracing::debug!(%id, "Half-open queue full, dropping SYN");
            return Ok(());
        }

        let iss = self.generate_iss(id);
        match segment_arrives_listen(
            segment,
            id.local.address,
            id.remote.address,
            iss,
            self.config.conn_settings(),
        ) {
            Some(ListenResult::Tcb(tcb)) => {
                self.listeners
                    .get_mut(&id.local.port)
                    .expect("listener just looked up")
                    .syn_queue
                    .push(id);
                self.connections.insert(id, *tcb);
                self.finish(id);
            }
            Some(ListenResult::Response(response)) => {
                self.transmit(id, response, Message::default());
            }
            None => {}
        }
        Ok(())
    }

    /// Advances every connection's clock, firing retransmission,
    /// delayed-ACK and TIME-WAIT timers as the delta covers them.
    pub fn advance_time(&mut self, delta: Duration) {
        self.clock += delta;
        let ids: Vec<Endpoints> = self.connections.keys().copied().collect();
        for id in ids {
            if let Some(tcb) = self.connections.get_mut(&id) {
                let _ = tcb.advance_time(delta);
                self.finish(id);
            }
        }
    }

    /// The next datagram bound for the IP layer, if any.
    pub fn poll_transmit(&mut self) -> Option<Datagram> {
        self.outbox.pop_front()
    }

    /// The next observable event, in the order it happened.
    pub fn poll_event(&mut self) -> Option<TcpEvent> {
        self.events.pop_front()
    }

    // === Internals ===

    /// Drains a connection's outgoing segments and events after any
    /// operation, then deletes the block if it reached CLOSED.
    fn finish(&mut self, id: Endpoints) {
        let Some(tcb) = self.connections.get_mut(&id) else {
            return;
        };
        let initiation = tcb.initiation();
        let segments = tcb.segments();
        let conn_events = tcb.take_events();
        let closed = tcb.state() == State::Closed;

        for segment in segments {
            let (header, text) = segment.into_inner();
            self.transmit(id, header, text);
        }

        for event in conn_events {
            let kind = match event {
                ConnEvent::Connected => {
                    if initiation == Initiation::Listen {
                        self.promote_half_open(id);
                        TcpEventKind::Incoming
                    } else {
                        TcpEventKind::Connected
                    }
                }
                ConnEvent::DataReceived { push } => TcpEventKind::DataReceived { push },
                ConnEvent::Disconnected(reason) => TcpEventKind::Disconnected { reason },
                ConnEvent::RtxTimeout { attempt } => TcpEventKind::RtxTimeout { attempt },
                ConnEvent::Closed => TcpEventKind::Closed,
            };
            self.events.push_back(TcpEvent { id, kind });
        }

        if closed {
            self.promote_half_open(id);
            self.connections.remove(&id);
            tracing::debug!(%id, "Connection deleted");
        }
    }

    /// Serializes a segment into the outbox.
    fn transmit(&mut self, id: Endpoints, header: TcpHeader, text: Message) {
        let mut payload = text;
        payload.header(header.serialize());
        self.outbox.push_back(Datagram {
            src: id.local.address,
            dst: id.remote.address,
            payload,
        });
    }

    /// Removes a connection from its listener's half-open queue, if it is
    /// there.
    fn promote_half_open(&mut self, id: Endpoints) {
        if let Some(listener) = self.listeners.get_mut(&id.local.port) {
            listener.syn_queue.retain(|&half_open| half_open != id);
        }
    }

    /// Finds an unused (local port, remote) combination, probing forward
    /// from a cursor that starts at the bottom of the ephemeral range.
    fn free_port(&mut self, remote: Endpoint) -> Result<u16, ConnectError> {
        let range = self.config.ephemeral_start..=self.config.ephemeral_end;
        for _ in 0..=(*range.end() - *range.start()) as u32 {
            let port = self.ephemeral;
            self.ephemeral = if self.ephemeral >= *range.end() {
                *range.start()
            } else {
                self.ephemeral + 1
            };
            let id = Endpoints::new(Endpoint::new(self.address, port), remote);
            if !self.connections.contains_key(&id) && !self.listeners.contains_key(&port) {
                return Ok(port);
            }
        }
        tracing::warn!("Ephemeral port range exhausted");
        Err(ConnectError::NoPorts)
    }

    /// Mixes the host clock, the 4-tuple and a per-host secret into an
    /// initial sequence number.
    fn generate_iss(&self, id: Endpoints) -> u32 {
        let mut hasher = rustc_hash::FxHasher::default();
        id.hash(&mut hasher);
        self.iss_secret.hash(&mut hasher);
        let hash = hasher.finish();
        let mixed = (hash as u32) ^ ((hash >> 32) as u32);
        // The RFC 793 clock: one increment every four microseconds.
        mixed.wrapping_add((self.clock.as_micros() / 4) as u32)
    }
}

#[cfg(test)]
mod host_tests {
    use super::*;

    const CLIENT_ADDR: Ipv4Address = Ipv4Address::new([10, 0, 0, 1]);
    const SERVER_ADDR: Ipv4Address = Ipv4Address::new([10, 0, 0, 2]);
    const SERVER_PORT: u16 = 6000;

    fn pair() -> (Tcp, Tcp) {
        let config = TcpConfig {
            msl: Duration::from_millis(50),
            delayed_ack: None,
            ..TcpConfig::default()
        };
        (Tcp::new(CLIENT_ADDR, config), Tcp::new(SERVER_ADDR, config))
    }

    /// Carries datagrams between two hosts until both go quiet.
    fn shuttle(a: &mut Tcp, b: &mut Tcp) {
        loop {
            let mut moved = false;
            while let Some(datagram) = a.poll_transmit() {
                moved = true;
                let _ = b.bottom(datagram);
            }
            while let Some(datagram) = b.poll_transmit() {
                moved = true;
                let _ = a.bottom(datagram);
            }
            if !moved {
                break;
            }
        }
    }

    fn events(tcp: &mut Tcp) -> Vec<TcpEvent> {
        let mut out = Vec::new();
        while let Some(event) = tcp.poll_event() {
            out.push(event);
        }
        out
    }

    #[test]
    fn handshake_send_and_close() {
        let (mut client, mut server) = pair();
        server.listen(SERVER_PORT).unwrap();

        let id = client
            .connect(Endpoint::new(SERVER_ADDR, SERVER_PORT))
            .unwrap();
        shuttle(&mut client, &mut server);

        assert!(client.is_connected(id));
        let server_id = id.reverse();
        assert!(server.is_connected(server_id));
        assert!(events(&mut client)
            .iter()
            .any(|e| e.kind == TcpEventKind::Connected));
        assert!(events(&mut server)
            .iter()
            .any(|e| e.kind == TcpEventKind::Incoming));

        client.send(id, Message::new(b"HELLO")).unwrap();
        shuttle(&mut client, &mut server);
        assert_eq!(server.receive(server_id).unwrap().to_vec(), b"HELLO");

        client.close(id);
        shuttle(&mut client, &mut server);
        server.close(server_id);
        shuttle(&mut client, &mut server);

        // The passive closer is gone as soon as its FIN is acknowledged;
        // the active closer lingers in TIME-WAIT for 2 MSL.
        assert_eq!(server.open_connections(), 0);
        assert_eq!(client.connection_state(id), Some(State::TimeWait));
        client.advance_time(Duration::from_millis(101));
        assert_eq!(client.open_connections(), 0);
    }

    #[test]
    fn syn_to_unbound_port_draws_rst() {
        let (mut client, mut server) = pair();
        let id = client.connect(Endpoint::new(SERVER_ADDR, 7777)).unwrap();
        shuttle(&mut client, &mut server);
        let disconnected = events(&mut client).iter().any(|e| {
            e.kind
                == TcpEventKind::Disconnected {
                    reason: Disconnect::Refused,
                }
        });
        assert!(disconnected);
        assert_eq!(client.connection_state(id), None);
    }

    #[test]
    fn corrupted_datagram_is_dropped() {
        let (mut client, mut server) = pair();
        server.listen(SERVER_PORT).unwrap();
        client
            .connect(Endpoint::new(SERVER_ADDR, SERVER_PORT))
            .unwrap();
        let mut datagram = client.poll_transmit().unwrap();
        let mut bytes = datagram.payload.to_vec();
        bytes[7] ^= 0xff;
        datagram.payload = Message::new(bytes);
        assert!(matches!(
            server.bottom(datagram),
            Err(DemuxError::Header(PacketError::InvalidChecksum { .. }))
        ));
        assert_eq!(server.open_connections(), 0);
    }

    #[test]
    fn ephemeral_ports_are_unique_and_exhaustible() {
        let config = TcpConfig {
            ephemeral_start: 1024,
            ephemeral_end: 1027,
            ..TcpConfig::default()
        };
        let mut client = Tcp::new(CLIENT_ADDR, config);
        let remote = Endpoint::new(SERVER_ADDR, SERVER_PORT);
        let mut ports = Vec::new();
        for _ in 0..4 {
            let id = client.connect(remote).unwrap();
            assert!(!ports.contains(&id.local.port));
            ports.push(id.local.port);
        }
        assert_eq!(client.connect(remote), Err(ConnectError::NoPorts));
    }

    #[test]
    fn iss_depends_on_tuple_and_clock() {
        let (client, _) = pair();
        let a = Endpoints::new(
            Endpoint::new(CLIENT_ADDR, 1024),
            Endpoint::new(SERVER_ADDR, 80),
        );
        let b = Endpoints::new(
            Endpoint::new(CLIENT_ADDR, 1025),
            Endpoint::new(SERVER_ADDR, 80),
        );
        assert_ne!(client.generate_iss(a), client.generate_iss(b));
        let mut later = Tcp::new(CLIENT_ADDR, *client.config());
        later.iss_secret = client.iss_secret;
        later.clock = Duration::from_secs(1);
        assert_ne!(client.generate_iss(a), later.generate_iss(a));
    }

    #[test]
    fn live_update_record_round_trips() {
        let (mut client, mut server) = pair();
        server.listen(SERVER_PORT).unwrap();
        let id = client
            .connect(Endpoint::new(SERVER_ADDR, SERVER_PORT))
            .unwrap();
        shuttle(&mut client, &mut server);

        let record = client.export_connection(id).unwrap();
        assert_eq!(record.state, State::Established);

        // A fresh host takes over the connection and traffic still flows.
        let mut reborn = Tcp::new(CLIENT_ADDR, *client.config());
        reborn.import_connection(record);
        assert!(reborn.is_connected(id));
        reborn.send(id, Message::new(b"still here")).unwrap();
        shuttle(&mut reborn, &mut server);
        assert_eq!(
            server.receive(id.reverse()).unwrap().to_vec(),
            b"still here"
        );
    }
}
