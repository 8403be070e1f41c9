//! End-to-end exercises for the balancer: a client host and a fleet of
//! echo backends wired to the two TCP instances through an in-memory
//! network.

use std::{collections::HashMap, time::Duration};
use weir::{
    liveupdate::Storage,
    nodes::{ACTIVE_CHECK_PERIOD, CONNECT_TIMEOUT},
    Balancer,
};
use weir_core::{
    endpoint::{Endpoint, Ipv4Address},
    tcp::{Disconnect, TcpEventKind},
    Endpoints, Message, Tcp, TcpConfig,
};

const CLIENT_NET_ADDR: Ipv4Address = Ipv4Address::new([10, 0, 0, 1]);
const NODE_NET_ADDR: Ipv4Address = Ipv4Address::new([10, 0, 1, 1]);
const CLIENT_HOST_ADDR: Ipv4Address = Ipv4Address::new([10, 0, 0, 100]);
const SERVICE_PORT: u16 = 80;
const BACKEND_PORT: u16 = 6001;
const TICK: Duration = Duration::from_millis(10);

fn backend_addr(index: usize) -> Endpoint {
    Endpoint::new(Ipv4Address::new([10, 0, 1, 101 + index as u8]), BACKEND_PORT)
}

/// The test world. `configured` backends are known to the balancer;
/// only the first `live` of them actually exist on the wire.
struct World {
    balancer: Balancer,
    clients: Tcp,
    backends: Vec<Tcp>,
    echoes: HashMap<Endpoints, Vec<u8>>,
}

impl World {
    fn new(configured: usize, live: usize, pool_target: usize) -> Self {
        let tcp_config = TcpConfig::default();
        let backends_cfg: Vec<Endpoint> = (0..configured).map(backend_addr).collect();
        let balancer = Balancer::new(
            Tcp::new(CLIENT_NET_ADDR, tcp_config),
            SERVICE_PORT,
            Tcp::new(NODE_NET_ADDR, tcp_config),
            backends_cfg,
            pool_target,
            1000,
            1000,
        )
        .unwrap();

        let mut backends = Vec::new();
        for index in 0..live {
            let socket = backend_addr(index);
            let mut backend = Tcp::new(socket.address, tcp_config);
            backend.listen(socket.port).unwrap();
            backends.push(backend);
        }

        Self {
            balancer,
            clients: Tcp::new(CLIENT_HOST_ADDR, tcp_config),
            backends,
            echoes: HashMap::new(),
        }
    }

    fn connect_client(&mut self) -> Endpoints {
        self.clients
            .connect(Endpoint::new(CLIENT_NET_ADDR, SERVICE_PORT))
            .unwrap()
    }

    fn step(&mut self, delta: Duration) {
        self.balancer.step(delta);
        self.clients.advance_time(delta);
        for backend in &mut self.backends {
            backend.advance_time(delta);
        }
        for _ in 0..4 {
            self.route();
            self.echo_backends();
        }
    }

    fn settle(&mut self, steps: usize) {
        for _ in 0..steps {
            self.step(TICK);
        }
    }

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

    /// Backends echo whatever arrives.
    fn echo_backends(&mut self) {
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

    /// Collects everything the client host has heard back, per connection.
    fn collect_client_events(&mut self) -> Vec<(Endpoints, TcpEventKind)> {
        let mut kinds = Vec::new();
        while let Some(event) = self.clients.poll_event() {
            if let TcpEventKind::DataReceived { .. } = event.kind {
                if let Ok(bytes) = self.clients.receive(event.id) {
                    self.echoes.entry(event.id).or_default().extend(bytes.iter());
                }
            }
            kinds.push((event.id, event.kind));
        }
        kinds
    }

    /// Sessions per backend address.
    fn sessions_by_backend(&self) -> HashMap<Ipv4Address, usize> {
        let mut counts = HashMap::new();
        for session in self.balancer.nodes().live_sessions() {
            *counts
                .entry(session.outgoing().remote.address)
                .or_insert(0usize) += 1;
        }
        counts
    }
}

#[test]
fn round_robin_across_three_backends() {
    let mut world = World::new(3, 3, 4);
    // Let the probes land and the pools warm.
    world.settle(20);
    assert!(world.balancer.nodes().nodes().iter().all(|n| n.is_active()));

    let clients: Vec<Endpoints> = (0..12).map(|_| world.connect_client()).collect();
    world.settle(40);

    assert_eq!(world.balancer.open_sessions(), 12);
    assert_eq!(world.balancer.wait_queue(), 0);
    let counts = world.sessions_by_backend();
    assert_eq!(counts.len(), 3);
    for (backend, count) in counts {
        assert_eq!(count, 4, "backend {backend} should carry 4 sessions");
    }

    // Traffic flows end to end: every client gets its own echo back.
    world.collect_client_events();
    for (index, &client) in clients.iter().enumerate() {
        let greeting = format!("hello {index}").into_bytes();
        world
            .clients
            .send(client, Message::new(greeting.clone()))
            .unwrap();
    }
    world.settle(40);
    world.collect_client_events();
    for (index, client) in clients.iter().enumerate() {
        let expected = format!("hello {index}").into_bytes();
        assert_eq!(world.echoes.get(client), Some(&expected), "client {index}");
    }
    // Conservation: open == total - closed.
    assert_eq!(world.balancer.total_sessions(), 12);
    assert_eq!(world.balancer.open_sessions(), 12);
}

#[test]
fn bufferbloat_guard_aborts_waiting_client() {
    // One configured backend that does not exist: clients queue up with
    // nowhere to go.
    let mut world = World::new(1, 0, 4);
    world.settle(5);

    let client = world.connect_client();
    world.settle(5);
    assert_eq!(world.balancer.wait_queue(), 1);

    // 8193 bytes while waiting crosses the 8 KiB guard.
    world
        .clients
        .send(client, Message::new(vec![0xaa; 8193]))
        .unwrap();
    world.settle(10);

    assert_eq!(world.balancer.wait_queue(), 0);
    let events = world.collect_client_events();
    assert!(events.iter().any(|(id, kind)| {
        *id == client
            && *kind
                == TcpEventKind::Disconnected {
                    reason: Disconnect::Reset,
                }
    }));
}

#[test]
fn waiting_bytes_are_spliced_to_the_upstream() {
    // The backend comes up only after the client has talked.
    let mut world = World::new(1, 0, 2);
    world.settle(2);

    let client = world.connect_client();
    world.settle(5);
    world
        .clients
        .send(client, Message::new(b"early bytes".as_slice()))
        .unwrap();
    world.settle(5);
    assert_eq!(world.balancer.wait_queue(), 1);

    // Bring the backend up; the next probe finds it.
    let socket = backend_addr(0);
    let mut backend = Tcp::new(socket.address, TcpConfig::default());
    backend.listen(socket.port).unwrap();
    world.backends.push(backend);
    for _ in 0..5 {
        world.step(ACTIVE_CHECK_PERIOD / 4);
    }
    world.settle(20);

    assert_eq!(world.balancer.wait_queue(), 0);
    assert_eq!(world.balancer.open_sessions(), 1);
    world.collect_client_events();
    assert_eq!(
        world.echoes.get(&client).map(Vec::as_slice),
        Some(b"early bytes".as_slice())
    );
}

#[test]
fn dead_backend_is_probed_not_used() {
    let mut world = World::new(2, 1, 2);
    // Long enough for the connect attempts toward the dead backend to be
    // abandoned.
    for _ in 0..8 {
        world.step(CONNECT_TIMEOUT / 4);
    }
    world.settle(10);

    let nodes = world.balancer.nodes().nodes();
    assert!(nodes[0].is_active());
    assert!(!nodes[1].is_active());

    let clients: Vec<Endpoints> = (0..4).map(|_| world.connect_client()).collect();
    world.settle(40);
    assert_eq!(world.balancer.open_sessions(), clients.len());
    for session in world.balancer.nodes().live_sessions() {
        assert_eq!(session.outgoing().remote, backend_addr(0));
    }
}

#[test]
fn session_idle_timeout_reaps_quiet_sessions() {
    let mut world = World::new(1, 1, 2);
    world.settle(20);
    let _client = world.connect_client();
    world.settle(20);
    assert_eq!(world.balancer.open_sessions(), 1);

    // A session that never carries traffic dies at the initial timeout.
    for _ in 0..6 {
        world.step(Duration::from_secs(1));
    }
    assert_eq!(world.balancer.open_sessions(), 0);
    assert_eq!(world.balancer.timed_out_sessions(), 1);
}

#[test]
fn live_update_preserves_sessions() {
    let mut world = World::new(3, 3, 4);
    world.settle(20);
    let clients: Vec<Endpoints> = (0..10).map(|_| world.connect_client()).collect();
    world.settle(40);
    assert_eq!(world.balancer.open_sessions(), 10);

    // Serialize, cross the "restart", deserialize into a fresh balancer
    // with fresh TCP instances.
    let mut store = Storage::new();
    world.balancer.serialize(&mut store);
    let bytes = store.to_bytes();

    let reborn = Balancer::new(
        Tcp::new(CLIENT_NET_ADDR, TcpConfig::default()),
        SERVICE_PORT,
        Tcp::new(NODE_NET_ADDR, TcpConfig::default()),
        (0..3).map(backend_addr).collect(),
        4,
        1000,
        1000,
    )
    .unwrap();
    world.balancer = reborn;

    let mut restore = Storage::from_bytes(&bytes).unwrap().restore();
    let restored = world.balancer.deserialize(&mut restore).unwrap();
    assert_eq!(restored, 10);
    assert_eq!(world.balancer.open_sessions(), 10);

    // The restored pairs still forward end to end: the peers kept their
    // TCBs and the balancer rehydrated its own.
    world.settle(10);
    world.collect_client_events();
    for (index, &client) in clients.iter().enumerate() {
        let greeting = format!("after the restart {index}").into_bytes();
        world
            .clients
            .send(client, Message::new(greeting))
            .unwrap();
    }
    world.settle(40);
    world.collect_client_events();
    for (index, client) in clients.iter().enumerate() {
        let expected = format!("after the restart {index}").into_bytes();
        assert_eq!(
            world.echoes.get(client),
            Some(&expected),
            "client {index} after restart"
        );
    }
}
