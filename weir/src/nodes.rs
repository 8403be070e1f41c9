//! Backend nodes, their warm upstream pools, and the session table.
//!
//! A [`Node`] is one backend: an address, a pool of pre-established
//! connections, and a liveness probe that keeps dead backends out of
//! rotation. [`Nodes`] owns the fleet plus the session slots that pair a
//! client connection with an upstream one. Sessions are stored in a slot
//! vector with a free list, so a session index stays valid for as long as
//! the session lives and slots are reused in O(1).

use std::time::Duration;
use weir_core::{endpoint::Endpoint, tcp::ConnectError, Endpoints, FxHashMap, Message, Tcp};

/// Most bytes a client may accumulate while waiting for an upstream.
pub const MAX_READQ_PER_NODE: usize = 8192;
/// Per-read ceiling when forwarding toward a client.
pub const READQ_PER_CLIENT: usize = 4096;
/// Per-read ceiling when forwarding toward a backend.
pub const READQ_FOR_NODES: usize = 8192;
/// Most outbound connect attempts dispatched per pool-change signal.
pub const MAX_OUTGOING_ATTEMPTS: usize = 100;

/// Delay before re-probing a backend that just failed.
pub const ACTIVE_INITIAL_PERIOD: Duration = Duration::from_secs(8);
/// Probe period while a backend stays inactive.
pub const ACTIVE_CHECK_PERIOD: Duration = Duration::from_secs(30);
/// How long an outbound connect may stay half-open before it is abandoned.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Backoff after `connect()` fails outright (ephemeral-port exhaustion).
pub const CONNECT_THROW_PERIOD: Duration = Duration::from_secs(20);
/// Idle timeout for a session that has never carried traffic.
pub const INITIAL_SESSION_TIMEOUT: Duration = Duration::from_secs(5);
/// Idle timeout once a session has carried traffic, reset on every read.
pub const ROLLING_SESSION_TIMEOUT: Duration = Duration::from_secs(60);

/// One backend.
#[derive(Debug)]
pub struct Node {
    addr: Endpoint,
    /// Warm established connections, most recently added last.
    pool: Vec<Endpoints>,
    /// In-flight connect attempts, each with its abandon countdown.
    connecting: FxHashMap<Endpoints, Duration>,
    active: bool,
    /// Countdown to the next liveness probe. `None` while the node is
    /// active, since a live pool is proof enough.
    probe_timer: Option<Duration>,
}

impl Node {
    pub fn new(addr: Endpoint) -> Self {
        Self {
            addr,
            pool: Vec::new(),
            connecting: FxHashMap::default(),
            active: false,
            // The first check runs on the first tick.
            probe_timer: Some(Duration::ZERO),
        }
    }

    pub fn address(&self) -> Endpoint {
        self.addr
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn pool_size(&self) -> usize {
        self.pool.len()
    }

    pub fn connection_attempts(&self) -> usize {
        self.connecting.len()
    }

    /// Opens one more upstream connection toward this backend.
    fn connect(&mut self, netout: &mut Tcp) -> Result<(), ConnectError> {
        let id = netout.connect(self.addr)?;
        self.connecting.insert(id, CONNECT_TIMEOUT);
        Ok(())
    }

    /// Advances probe and connect-attempt countdowns. Returns true when the
    /// pool may have changed.
    fn tick(&mut self, delta: Duration, netout: &mut Tcp) -> bool {
        let mut signal = false;

        // Abandon connects that have dragged past the timeout.
        let expired: Vec<Endpoints> = self
            .connecting
            .iter()
            .filter(|(_, left)| delta >= **left)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            tracing::debug!(backend = %self.addr, %id, "Connect attempt timed out");
            netout.abort(id);
            self.connecting.remove(&id);
            self.restart_active_check();
            signal = true;
        }
        for left in self.connecting.values_mut() {
            *left = left.saturating_sub(delta);
        }

        if let Some(left) = self.probe_timer {
            if delta >= left {
                self.probe_timer = Some(ACTIVE_CHECK_PERIOD);
                // The probe is an ordinary connect; if it lands, it joins
                // the pool and proves the backend alive.
                if self.connect(netout).is_err() {
                    // Likely ephemeral-port exhaustion; the next probe
                    // period retries.
                }
            } else {
                self.probe_timer = Some(left - delta);
            }
        }

        signal
    }

    /// A connect attempt completed its handshake. Returns true when it was
    /// one of ours.
    fn on_connected(&mut self, id: Endpoints) -> bool {
        if self.connecting.remove(&id).is_some() {
            tracing::debug!(backend = %self.addr, pool = self.pool.len() + 1, "Upstream connected");
            self.pool.push(id);
            self.stop_active_check();
            true
        } else {
            false
        }
    }

    /// A connect attempt or pooled connection went away. Returns true when
    /// it was one of ours.
    fn on_gone(&mut self, id: Endpoints) -> bool {
        if self.connecting.remove(&id).is_some() {
            tracing::debug!(backend = %self.addr, "Upstream connect failed");
            self.restart_active_check();
            true
        } else if let Some(at) = self.pool.iter().position(|&pooled| pooled == id) {
            self.pool.remove(at);
            true
        } else {
            false
        }
    }

    fn restart_active_check(&mut self) {
        self.active = false;
        if self.probe_timer.is_none() {
            self.probe_timer = Some(ACTIVE_INITIAL_PERIOD);
        }
    }

    fn stop_active_check(&mut self) {
        self.active = true;
        self.probe_timer = None;
    }

    /// Pops the most recently pooled connection that is still connected.
    /// A backend may have closed a pooled connection between push and
    /// acquire, so every candidate is checked.
    fn get_connection(&mut self, netout: &mut Tcp) -> Option<Endpoints> {
        while let Some(conn) = self.pool.pop() {
            if netout.is_connected(conn) {
                return Some(conn);
            }
            netout.close(conn);
        }
        None
    }
}

/// A paired client and upstream connection with a shared lifetime.
#[derive(Debug)]
pub struct Session {
    pub(crate) index: usize,
    pub(crate) incoming: Endpoints,
    pub(crate) outgoing: Endpoints,
    /// Idle countdown; disarmed when the session closes.
    pub(crate) timeout: Option<Duration>,
    pub(crate) alive: bool,
    /// Bytes are waiting in a receive buffer because the other side's
    /// transmit queue was full; retried each step.
    pub(crate) pending_to_upstream: bool,
    pub(crate) pending_to_client: bool,
}

impl Session {
    /// The session's slot in the table; stable for its whole life.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn incoming(&self) -> Endpoints {
        self.incoming
    }

    pub fn outgoing(&self) -> Endpoints {
        self.outgoing
    }
}

/// The backend fleet and the session table.
#[derive(Debug)]
pub struct Nodes {
    nodes: Vec<Node>,
    pool_target: usize,
    session_total: u64,
    session_cnt: usize,
    session_timeouts: u64,
    /// Rotation cursor for dispatching outbound connects.
    conn_iterator: usize,
    /// Rotation cursor for assigning clients to backends.
    algo_iterator: usize,
    sessions: Vec<Session>,
    free_sessions: Vec<usize>,
    by_client: FxHashMap<Endpoints, usize>,
    by_upstream: FxHashMap<Endpoints, usize>,
}

impl Nodes {
    pub fn new(backends: Vec<Endpoint>, pool_target: usize) -> Self {
        Self {
            nodes: backends.into_iter().map(Node::new).collect(),
            pool_target,
            session_total: 0,
            session_cnt: 0,
            session_timeouts: 0,
            conn_iterator: 0,
            algo_iterator: 0,
            sessions: Vec::new(),
            free_sessions: Vec::new(),
            by_client: FxHashMap::default(),
            by_upstream: FxHashMap::default(),
        }
    }

    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Warm connections available across the fleet.
    pub fn pool_size(&self) -> usize {
        self.nodes.iter().map(Node::pool_size).sum()
    }

    /// Connect attempts in flight across the fleet.
    pub fn pool_connecting(&self) -> usize {
        self.nodes.iter().map(Node::connection_attempts).sum()
    }

    /// How many connects warming would dispatch right now.
    pub fn pool_deficit(&self) -> usize {
        self.nodes
            .iter()
            .filter(|node| node.is_active())
            .map(|node| {
                self.pool_target
                    .saturating_sub(node.pool_size() + node.connection_attempts())
            })
            .sum()
    }

    pub fn open_sessions(&self) -> usize {
        self.session_cnt
    }

    pub fn total_sessions(&self) -> u64 {
        self.session_total
    }

    pub fn timed_out_sessions(&self) -> u64 {
        self.session_timeouts
    }

    pub(crate) fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// The sessions currently alive, in slot order.
    pub fn live_sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions.iter().filter(|session| session.alive)
    }

    pub(crate) fn session(&self, index: usize) -> &Session {
        &self.sessions[index]
    }

    pub(crate) fn session_mut(&mut self, index: usize) -> &mut Session {
        &mut self.sessions[index]
    }

    pub fn session_for_client(&self, id: Endpoints) -> Option<usize> {
        self.by_client.get(&id).copied()
    }

    pub fn session_for_upstream(&self, id: Endpoints) -> Option<usize> {
        self.by_upstream.get(&id).copied()
    }

    /// Advances node probes and connect timeouts. Returns true when a pool
    /// changed and the wait queue deserves another look.
    pub(crate) fn tick(&mut self, delta: Duration, netout: &mut Tcp) -> bool {
        let mut signal = false;
        for node in &mut self.nodes {
            signal |= node.tick(delta, netout);
        }
        signal
    }

    /// Advances session idle timers, closing the ones that expire.
    pub(crate) fn tick_sessions(&mut self, delta: Duration, netin: &mut Tcp, netout: &mut Tcp) {
        for index in 0..self.sessions.len() {
            if !self.sessions[index].alive {
                continue;
            }
            match self.sessions[index].timeout {
                Some(left) if delta >= left => {
                    tracing::debug!(index, "Session idle timeout");
                    self.close_session(index, true, netin, netout);
                }
                Some(left) => self.sessions[index].timeout = Some(left - delta),
                None => {}
            }
        }
    }

    /// Dispatches up to `total` outbound connects round-robin over active
    /// nodes that are below the pool target. An error aborts the sweep so
    /// the caller can back off.
    pub(crate) fn create_connections(
        &mut self,
        netout: &mut Tcp,
        total: usize,
    ) -> Result<(), ConnectError> {
        for _ in 0..total {
            // Look for the next active node below target, up to size times.
            let mut chosen = None;
            for _ in 0..self.nodes.len() {
                self.conn_iterator = (self.conn_iterator + 1) % self.nodes.len();
                let node = &self.nodes[self.conn_iterator];
                if node.is_active()
                    && node.pool_size() + node.connection_attempts() < self.pool_target
                {
                    chosen = Some(self.conn_iterator);
                    break;
                }
            }
            match chosen {
                Some(index) => self.nodes[index].connect(netout)?,
                None => break,
            }
        }
        Ok(())
    }

    /// Tries to pair a client with a warm upstream, rotating over the
    /// backends. On success the client's queued bytes are spliced into the
    /// upstream and a session is created.
    pub(crate) fn assign(
        &mut self,
        netout: &mut Tcp,
        client: Endpoints,
        readq: &mut Vec<Message>,
    ) -> bool {
        for _ in 0..self.nodes.len() {
            let index = self.algo_iterator;
            self.algo_iterator = (self.algo_iterator + 1) % self.nodes.len();
            if let Some(outgoing) = self.nodes[index].get_connection(netout) {
                let talked = !readq.is_empty();
                let session = self.create_session(talked, client, outgoing);
                tracing::debug!(session, %client, %outgoing, "Client assigned");
                for chunk in readq.drain(..) {
                    if let Err(error) = netout.send(outgoing, chunk) {
                        tracing::debug!(%error, "Dropped queued client bytes");
                    }
                }
                return true;
            }
        }
        false
    }

    /// Creates a session in a free slot. `talk` marks a client that already
    /// sent bytes while waiting; such sessions start on the rolling timeout.
    pub(crate) fn create_session(
        &mut self,
        talk: bool,
        incoming: Endpoints,
        outgoing: Endpoints,
    ) -> usize {
        let timeout = if talk {
            ROLLING_SESSION_TIMEOUT
        } else {
            INITIAL_SESSION_TIMEOUT
        };
        let index = match self.free_sessions.pop() {
            Some(index) => {
                self.sessions[index] = Session {
                    index,
                    incoming,
                    outgoing,
                    timeout: Some(timeout),
                    alive: true,
                    pending_to_upstream: false,
                    pending_to_client: false,
                };
                index
            }
            None => {
                let index = self.sessions.len();
                self.sessions.push(Session {
                    index,
                    incoming,
                    outgoing,
                    timeout: Some(timeout),
                    alive: true,
                    pending_to_upstream: false,
                    pending_to_client: false,
                });
                index
            }
        };
        self.by_client.insert(incoming, index);
        self.by_upstream.insert(outgoing, index);
        self.session_total += 1;
        self.session_cnt += 1;
        index
    }

    /// Rearms a session's idle timer after traffic in either direction.
    pub(crate) fn touch(&mut self, index: usize) {
        let session = &mut self.sessions[index];
        if session.alive {
            session.timeout = Some(ROLLING_SESSION_TIMEOUT);
        }
    }

    /// Tears a session down exactly once: disarm the timer, release both
    /// connections, free the slot.
    pub(crate) fn close_session(
        &mut self,
        index: usize,
        timed_out: bool,
        netin: &mut Tcp,
        netout: &mut Tcp,
    ) {
        let session = &mut self.sessions[index];
        if !session.alive {
            return;
        }
        session.alive = false;
        session.timeout = None;
        session.pending_to_upstream = false;
        session.pending_to_client = false;
        let incoming = session.incoming;
        let outgoing = session.outgoing;

        self.by_client.remove(&incoming);
        self.by_upstream.remove(&outgoing);
        netin.close(incoming);
        netout.close(outgoing);

        if timed_out {
            self.session_timeouts += 1;
        }
        self.free_sessions.push(index);
        self.session_cnt -= 1;
        tracing::debug!(index, open = self.session_cnt, "Session closed");
    }

    /// Routes an upstream handshake completion to its node. Returns true
    /// when a pool changed.
    pub(crate) fn on_upstream_connected(&mut self, id: Endpoints) -> bool {
        self.nodes
            .iter_mut()
            .any(|node| node.addr == id.remote && node.on_connected(id))
    }

    /// Routes a dead upstream connection to its node. Returns true when a
    /// pool or attempt count changed.
    pub(crate) fn on_upstream_gone(&mut self, id: Endpoints) -> bool {
        self.nodes
            .iter_mut()
            .any(|node| node.addr == id.remote && node.on_gone(id))
    }
}
