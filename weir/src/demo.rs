//! A self-contained demonstration: the balancer, a fleet of echo backends,
//! and a crowd of clients, all wired through an in-memory network.
//!
//! Nothing here touches a real NIC. Datagrams are carried between the TCP
//! instances by [`Demo::route`], which makes the run fully deterministic
//! and lets the binary double as a smoke test for the whole stack.

use crate::{balancer::Balancer, config::Config};
use std::time::Duration;
use weir_core::{
    endpoint::Endpoint, tcp::TcpEventKind, Endpoints, FxHashMap, Ipv4Address, Message, Tcp,
    TcpConfig,
};

const CLIENT_NET_ADDR: Ipv4Address = Ipv4Address::new([10, 0, 0, 1]);
const NODE_NET_ADDR: Ipv4Address = Ipv4Address::new([10, 0, 1, 1]);
const CLIENT_HOST_ADDR: Ipv4Address = Ipv4Address::new([10, 0, 0, 100]);

/// Where one demo client is in its send-echo-close exchange.
#[derive(Debug, Clone)]
enum ClientState {
    Connecting,
    AwaitingEcho { sent: Vec<u8>, got: Vec<u8> },
    Done,
}

/// The demo world: a balancer between one client host and a fleet of echo
/// backends.
pub struct Demo {
    balancer: Balancer,
    clients: Tcp,
    backends: Vec<Tcp>,
    states: FxHashMap<Endpoints, ClientState>,
    target: usize,
    completed: usize,
}

impl Demo {
    /// Builds the world and issues every client connect up front.
    pub fn new(config: &Config, clients: usize) -> Result<Self, Box<dyn std::error::Error>> {
        let tcp_config = TcpConfig::default();
        let balancer = Balancer::from_config(
            Tcp::new(CLIENT_NET_ADDR, tcp_config),
            Tcp::new(NODE_NET_ADDR, tcp_config),
            config,
        )?;

        let mut backends = Vec::new();
        for socket in config.node_sockets()? {
            let mut backend = Tcp::new(socket.address, tcp_config);
            backend.listen(socket.port)?;
            backends.push(backend);
        }

        let mut client_host = Tcp::new(CLIENT_HOST_ADDR, tcp_config);
        let mut states = FxHashMap::default();
        let service = Endpoint::new(CLIENT_NET_ADDR, config.clients.port);
        for index in 0..clients {
            match client_host.connect(service) {
                Ok(id) => {
                    states.insert(id, ClientState::Connecting);
                }
                Err(error) => tracing::warn!(%error, index, "Client connect failed"),
            }
        }

        Ok(Self {
            balancer,
            clients: client_host,
            backends,
            target: clients,
            completed: 0,
            states,
        })
    }

    /// One turn of the world. Returns true once every client finished its
    /// exchange.
    pub fn tick(&mut self, delta: Duration) -> bool {
        self.balancer.step(delta);
        self.clients.advance_time(delta);
        for backend in &mut self.backends {
            backend.advance_time(delta);
        }
        // Several passes so that a datagram sent in reaction to another one
        // still lands within this tick.
        for _ in 0..4 {
            self.route();
            self.drive_backends();
            self.drive_clients();
        }
        self.completed == self.target
    }

    pub fn completed(&self) -> usize {
        self.completed
    }

    pub fn report(&self) {
        tracing::info!(
            completed = self.completed,
            open_sessions = self.balancer.open_sessions(),
            total_sessions = self.balancer.total_sessions(),
            timed_out = self.balancer.timed_out_sessions(),
            waiting = self.balancer.wait_queue(),
            "Demo state"
        );
    }

    /// Carries datagrams between the instances until the wires go quiet.
    fn route(&mut self) {
        loop {
            let mut moved = false;

            while let Some(datagram) = self.balancer.client_network().poll_transmit() {
                moved = true;
                if datagram.dst == CLIENT_HOST_ADDR {
                    let _ = self.clients.bottom(datagram);
                }
            }
            while let Some(datagram) = self.clients.poll_transmit() {
                moved = true;
                if datagram.dst == CLIENT_NET_ADDR {
                    let _ = self.balancer.client_network().bottom(datagram);
                }
            }

            while let Some(datagram) = self.balancer.nodes_network().poll_transmit() {
                moved = true;
                if let Some(backend) = self
                    .backends
                    .iter_mut()
                    .find(|backend| backend.address() == datagram.dst)
                {
                    let _ = backend.bottom(datagram);
                }
            }
            for backend in &mut self.backends {
                while let Some(datagram) = backend.poll_transmit() {
                    moved = true;
                    if datagram.dst == NODE_NET_ADDR {
                        let _ = self.balancer.nodes_network().bottom(datagram);
                    }
                }
            }

            if !moved {
                break;
            }
        }
    }

    /// Each backend echoes whatever arrives back to its sender.
    fn drive_backends(&mut self) {
        for backend in &mut self.backends {
            while let Some(event) = backend.poll_event() {
                if let TcpEventKind::DataReceived { .. } = event.kind {
                    if let Ok(bytes) = backend.receive(event.id) {
                        if !bytes.is_empty() {
                            let _ = backend.send(event.id, bytes);
                        }
                    }
                }
            }
        }
    }

    /// Clients greet once connected and close once the echo comes back.
    fn drive_clients(&mut self) {
        while let Some(event) = self.clients.poll_event() {
            let id = event.id;
            match event.kind {
                TcpEventKind::Connected => {
                    let greeting = format!("hello from {id}").into_bytes();
                    if self
                        .clients
                        .send(id, Message::new(greeting.clone()))
                        .is_ok()
                    {
                        self.states.insert(
                            id,
                            ClientState::AwaitingEcho {
                                sent: greeting,
                                got: Vec::new(),
                            },
                        );
                    }
                }
                TcpEventKind::DataReceived { .. } => {
                    let bytes = match self.clients.receive(id) {
                        Ok(bytes) => bytes.to_vec(),
                        Err(_) => continue,
                    };
                    if let Some(ClientState::AwaitingEcho { sent, got }) = self.states.get_mut(&id)
                    {
                        got.extend_from_slice(&bytes);
                        if got == sent {
                            self.states.insert(id, ClientState::Done);
                            self.completed += 1;
                            self.clients.close(id);
                        }
                    }
                }
                TcpEventKind::Disconnected { reason } => {
                    if let Some(ClientState::Connecting | ClientState::AwaitingEcho { .. }) =
                        self.states.get(&id)
                    {
                        tracing::warn!(%id, %reason, "Client lost before its echo");
                    }
                }
                _ => {}
            }
        }
    }
}
