//! The balancer proper: admission, the wait queue, session steering, and
//! the connect-failure backoff.
//!
//! [`Balancer::step`] is the only entry point the driver needs besides
//! moving datagrams in and out of the two TCP instances. One call advances
//! the clocks, drains both instances' events, retries stalled forwarding,
//! and services the wait queue.

use crate::{
    config::{Config, ConfigError},
    nodes::{
        Nodes, CONNECT_THROW_PERIOD, MAX_OUTGOING_ATTEMPTS, MAX_READQ_PER_NODE, READQ_FOR_NODES,
        READQ_PER_CLIENT,
    },
};
use std::{collections::VecDeque, mem, time::Duration};
use weir_core::{
    endpoint::Endpoint,
    tcp::{ListenError, TcpEvent, TcpEventKind},
    Endpoints, Message, Tcp,
};

/// A client that has been accepted but not yet paired with an upstream.
/// Bytes it sends meanwhile are parked here, with a running total that
/// guards against buffer bloat.
#[derive(Debug)]
pub struct Waiting {
    pub conn: Endpoints,
    pub readq: Vec<Message>,
    pub total: usize,
}

impl Waiting {
    fn new(conn: Endpoints) -> Self {
        Self {
            conn,
            readq: Vec::new(),
            total: 0,
        }
    }
}

/// The reverse-proxy load balancer.
pub struct Balancer {
    /// The client-facing TCP instance.
    pub(crate) netin: Tcp,
    /// The backend-facing TCP instance.
    pub(crate) netout: Tcp,
    pub(crate) nodes: Nodes,
    queue: VecDeque<Waiting>,
    waitq_limit: usize,
    session_limit: usize,
    /// Countdown armed when `connect()` failed outright; never stacked.
    throw_retry_timer: Option<Duration>,
    throw_counter: u64,
    /// Set when a pool changed or a client arrived; drained once per step.
    signal: bool,
}

impl Balancer {
    /// Builds a balancer listening on `port` of `netin` and steering toward
    /// `backends` through `netout`.
    pub fn new(
        mut netin: Tcp,
        port: u16,
        netout: Tcp,
        backends: Vec<Endpoint>,
        pool_target: usize,
        waitq_limit: usize,
        session_limit: usize,
    ) -> Result<Self, ListenError> {
        netin.listen(port)?;
        tracing::info!(%port, backends = backends.len(), "Balancer up");
        Ok(Self {
            netin,
            netout,
            nodes: Nodes::new(backends, pool_target),
            queue: VecDeque::new(),
            waitq_limit,
            session_limit,
            throw_retry_timer: None,
            throw_counter: 0,
            signal: false,
        })
    }

    /// Builds a balancer from a parsed configuration document.
    pub fn from_config(netin: Tcp, netout: Tcp, config: &Config) -> Result<Self, BalancerError> {
        let backends = config.node_sockets()?;
        Ok(Self::new(
            netin,
            config.clients.port,
            netout,
            backends,
            config.nodes.pool_target,
            config.clients.waitq_limit,
            config.clients.session_limit,
        )?)
    }

    pub fn client_network(&mut self) -> &mut Tcp {
        &mut self.netin
    }

    pub fn nodes_network(&mut self) -> &mut Tcp {
        &mut self.netout
    }

    pub fn nodes(&self) -> &Nodes {
        &self.nodes
    }

    /// Clients currently parked in the wait queue.
    pub fn wait_queue(&self) -> usize {
        self.queue.len()
    }

    /// How many times `connect()` has failed outright.
    pub fn connect_throws(&self) -> u64 {
        self.throw_counter
    }

    pub fn open_sessions(&self) -> usize {
        self.nodes.open_sessions()
    }

    pub fn total_sessions(&self) -> u64 {
        self.nodes.total_sessions()
    }

    pub fn timed_out_sessions(&self) -> u64 {
        self.nodes.timed_out_sessions()
    }

    /// One turn of the crank: advance clocks and timers, drain events,
    /// retry stalled forwarding, service the wait queue.
    pub fn step(&mut self, delta: Duration) {
        self.netin.advance_time(delta);
        self.netout.advance_time(delta);
        self.tick_timers(delta);
        self.pump_events();
        self.flush_sessions();
        if mem::take(&mut self.signal) {
            self.handle_queue();
        }
    }

    fn tick_timers(&mut self, delta: Duration) {
        if let Some(left) = self.throw_retry_timer {
            if delta >= left {
                self.throw_retry_timer = None;
                self.handle_connections();
            } else {
                self.throw_retry_timer = Some(left - delta);
            }
        }

        if self.nodes.tick(delta, &mut self.netout) {
            self.signal = true;
        }
        self.nodes
            .tick_sessions(delta, &mut self.netin, &mut self.netout);
    }

    fn pump_events(&mut self) {
        while let Some(event) = self.netin.poll_event() {
            self.on_client_event(event);
        }
        while let Some(event) = self.netout.poll_event() {
            self.on_node_event(event);
        }
    }

    /// Events on the public side: accepted clients, client traffic, client
    /// departures.
    fn on_client_event(&mut self, event: TcpEvent) {
        let id = event.id;
        match event.kind {
            TcpEventKind::Incoming => self.incoming(id),

            TcpEventKind::DataReceived { .. } => {
                if let Some(index) = self.nodes.session_for_client(id) {
                    self.nodes.touch(index);
                    let outgoing = self.nodes.session(index).outgoing;
                    let pending =
                        forward(&mut self.netin, id, &mut self.netout, outgoing, READQ_FOR_NODES);
                    self.nodes.session_mut(index).pending_to_upstream = pending;
                } else if let Some(at) = self.queue.iter().position(|waiting| waiting.conn == id) {
                    let chunk = match self.netin.receive(id) {
                        Ok(chunk) => chunk,
                        Err(_) => return,
                    };
                    let waiting = &mut self.queue[at];
                    waiting.total += chunk.len();
                    if waiting.total > MAX_READQ_PER_NODE {
                        // Buffer bloat guard: the client keeps talking with
                        // nowhere to steer it.
                        tracing::warn!(%id, total = waiting.total, "Aborting bloated waiting client");
                        let _ = self.queue.remove(at);
                        self.netin.abort(id);
                    } else {
                        waiting.readq.push(chunk);
                    }
                }
            }

            TcpEventKind::Disconnected { .. } | TcpEventKind::Closed => {
                if let Some(index) = self.nodes.session_for_client(id) {
                    self.nodes
                        .close_session(index, false, &mut self.netin, &mut self.netout);
                }
                // A client that went away while waiting is dropped silently.
                self.queue.retain(|waiting| waiting.conn != id);
            }

            TcpEventKind::Connected | TcpEventKind::RtxTimeout { .. } => {}
        }
    }

    /// Events on the backend side: pool arrivals and departures, upstream
    /// traffic.
    fn on_node_event(&mut self, event: TcpEvent) {
        let id = event.id;
        match event.kind {
            TcpEventKind::Connected => {
                if self.nodes.on_upstream_connected(id) {
                    self.signal = true;
                }
            }

            TcpEventKind::DataReceived { .. } => {
                if let Some(index) = self.nodes.session_for_upstream(id) {
                    self.nodes.touch(index);
                    let incoming = self.nodes.session(index).incoming;
                    let pending =
                        forward(&mut self.netout, id, &mut self.netin, incoming, READQ_PER_CLIENT);
                    self.nodes.session_mut(index).pending_to_client = pending;
                }
            }

            TcpEventKind::Disconnected { .. } | TcpEventKind::Closed => {
                if let Some(index) = self.nodes.session_for_upstream(id) {
                    self.nodes
                        .close_session(index, false, &mut self.netin, &mut self.netout);
                } else if self.nodes.on_upstream_gone(id) {
                    self.signal = true;
                }
            }

            TcpEventKind::Incoming | TcpEventKind::RtxTimeout { .. } => {}
        }
    }

    /// A client finished its handshake. Queue it and look for an upstream
    /// on this very step.
    fn incoming(&mut self, id: Endpoints) {
        if self.queue.len() >= self.waitq_limit {
            tracing::warn!(%id, "Wait queue full, turning client away");
            self.netin.abort(id);
            return;
        }
        self.queue.push_back(Waiting::new(id));
        tracing::debug!(%id, queued = self.queue.len(), "Client queued");
        self.signal = true;
    }

    /// Pairs waiting clients with pooled upstreams while both are on hand,
    /// then tops the pools back up.
    fn handle_queue(&mut self) {
        while self.nodes.pool_size() > 0
            && !self.queue.is_empty()
            && self.nodes.open_sessions() < self.session_limit
        {
            let conn = self.queue.front().map(|waiting| waiting.conn);
            let Some(conn) = conn else { break };
            if !self.netin.is_connected(conn) {
                self.queue.pop_front();
                continue;
            }
            let assigned = {
                let waiting = self.queue.front_mut().expect("checked non-empty");
                self.nodes
                    .assign(&mut self.netout, conn, &mut waiting.readq)
            };
            if assigned {
                self.queue.pop_front();
            } else {
                break;
            }
        }
        self.handle_connections();
    }

    /// Tops the warm pools up to their target, backing off when the stack
    /// runs out of ephemeral ports.
    fn handle_connections(&mut self) {
        // Any de-facto retry cancels the backoff timer.
        self.throw_retry_timer = None;

        let estimate = self.nodes.pool_deficit().min(MAX_OUTGOING_ATTEMPTS);
        if estimate == 0 {
            return;
        }
        if let Err(error) = self.nodes.create_connections(&mut self.netout, estimate) {
            // Assume the failure is ephemeral-port exhaustion and retry
            // once the ports have had time to drain.
            tracing::warn!(%error, "Outbound connect failed, backing off");
            self.throw_counter += 1;
            self.throw_retry_timer = Some(CONNECT_THROW_PERIOD);
        }
    }

    /// Retries forwarding for sessions that stalled on a full transmit
    /// queue.
    fn flush_sessions(&mut self) {
        for index in 0..self.nodes.session_count() {
            let session = self.nodes.session(index);
            if !session.alive {
                continue;
            }
            let (incoming, outgoing) = (session.incoming, session.outgoing);
            if session.pending_to_upstream {
                let pending = forward(
                    &mut self.netin,
                    incoming,
                    &mut self.netout,
                    outgoing,
                    READQ_FOR_NODES,
                );
                self.nodes.session_mut(index).pending_to_upstream = pending;
            }
            let session = self.nodes.session(index);
            if session.alive && session.pending_to_client {
                let pending = forward(
                    &mut self.netout,
                    outgoing,
                    &mut self.netin,
                    incoming,
                    READQ_PER_CLIENT,
                );
                self.nodes.session_mut(index).pending_to_client = pending;
            }
        }
    }
}

/// Moves buffered bytes from one connection to its pair, taking no more
/// than the destination's transmit queue can hold. Returns true when bytes
/// remain behind, which keeps the source's advertised window small and so
/// paces the far sender.
fn forward(
    src_tcp: &mut Tcp,
    src: Endpoints,
    dst_tcp: &mut Tcp,
    dst: Endpoints,
    cap: usize,
) -> bool {
    let room = dst_tcp.transmit_queue_available(dst).min(cap);
    if room > 0 {
        if let Ok(chunk) = src_tcp.receive_up_to(src, room) {
            if !chunk.is_empty() {
                if let Err(error) = dst_tcp.send(dst, chunk) {
                    tracing::debug!(%error, "Dropped forwarded bytes");
                }
            }
        }
    }
    src_tcp.buffered(src) > 0
}

/// The balancer could not be brought up.
#[derive(Debug, thiserror::Error)]
pub enum BalancerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Listen(#[from] ListenError),
}
