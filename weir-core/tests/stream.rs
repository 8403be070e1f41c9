//! Host-level exercises over an imperfect wire: datagrams are dropped on a
//! fixed cadence and the stream must still arrive intact, in order, and
//! exactly once.

use std::time::Duration;
use weir_core::{
    endpoint::{Endpoint, Ipv4Address},
    tcp::TcpEventKind,
    Datagram, Message, Tcp, TcpConfig,
};

const CLIENT_ADDR: Ipv4Address = Ipv4Address::new([192, 168, 0, 1]);
const SERVER_ADDR: Ipv4Address = Ipv4Address::new([192, 168, 0, 2]);
const PORT: u16 = 9000;

/// A wire that deterministically drops every `drop_every`-th datagram.
struct LossyWire {
    drop_every: usize,
    carried: usize,
}

impl LossyWire {
    fn new(drop_every: usize) -> Self {
        Self {
            drop_every,
            carried: 0,
        }
    }

    fn carry(&mut self, datagram: Datagram) -> Option<Datagram> {
        self.carried += 1;
        if self.drop_every != 0 && self.carried % self.drop_every == 0 {
            None
        } else {
            Some(datagram)
        }
    }
}

fn pair() -> (Tcp, Tcp) {
    let config = TcpConfig {
        msl: Duration::from_millis(100),
        ..TcpConfig::default()
    };
    let mut server = Tcp::new(SERVER_ADDR, config);
    server.listen(PORT).unwrap();
    (Tcp::new(CLIENT_ADDR, config), server)
}

fn exchange(a: &mut Tcp, b: &mut Tcp, wire: &mut LossyWire) {
    loop {
        let mut moved = false;
        while let Some(datagram) = a.poll_transmit() {
            moved = true;
            if let Some(datagram) = wire.carry(datagram) {
                let _ = b.bottom(datagram);
            }
        }
        while let Some(datagram) = b.poll_transmit() {
            moved = true;
            if let Some(datagram) = wire.carry(datagram) {
                let _ = a.bottom(datagram);
            }
        }
        if !moved {
            break;
        }
    }
}

fn drain_data(tcp: &mut Tcp, into: &mut Vec<u8>) {
    let mut ids = Vec::new();
    while let Some(event) = tcp.poll_event() {
        if let TcpEventKind::DataReceived { .. } = event.kind {
            ids.push(event.id);
        }
    }
    for id in ids {
        if let Ok(bytes) = tcp.receive(id) {
            into.extend(bytes.iter());
        }
    }
}

#[test]
fn stream_survives_a_lossy_wire() {
    let (mut client, mut server) = pair();
    let mut wire = LossyWire::new(7);

    let id = client.connect(Endpoint::new(SERVER_ADDR, PORT)).unwrap();
    let expected: Vec<u8> = (0..50_000u32).map(|i| (i * 7) as u8).collect();

    let mut offered = expected.clone();
    let mut received = Vec::new();
    let mut rounds = 0;
    while received.len() < expected.len() {
        if client.is_connected(id) && !offered.is_empty() {
            let take = offered.len().min(8192);
            let chunk: Vec<u8> = offered.drain(..take).collect();
            if client.send(id, Message::new(chunk.clone())).is_err() {
                // Queue full; put it back and try again later.
                let mut rest = chunk;
                rest.extend(offered.drain(..));
                offered = rest;
            }
        }
        exchange(&mut client, &mut server, &mut wire);
        drain_data(&mut server, &mut received);
        exchange(&mut client, &mut server, &mut wire);
        client.advance_time(Duration::from_millis(500));
        server.advance_time(Duration::from_millis(500));
        rounds += 1;
        assert!(rounds < 5000, "transfer stalled at {} bytes", received.len());
    }

    assert_eq!(received.len(), expected.len());
    assert_eq!(received, expected);
}

#[test]
fn clean_wire_round_trips_both_directions() {
    let (mut client, mut server) = pair();
    let mut wire = LossyWire::new(0);

    let id = client.connect(Endpoint::new(SERVER_ADDR, PORT)).unwrap();
    exchange(&mut client, &mut server, &mut wire);
    assert!(client.is_connected(id));

    client.send(id, Message::new(b"marco".as_slice())).unwrap();
    exchange(&mut client, &mut server, &mut wire);

    let mut at_server = Vec::new();
    drain_data(&mut server, &mut at_server);
    assert_eq!(at_server, b"marco");
    server
        .send(id.reverse(), Message::new(b"polo".as_slice()))
        .unwrap();
    exchange(&mut client, &mut server, &mut wire);

    let mut at_client = Vec::new();
    drain_data(&mut client, &mut at_client);
    assert_eq!(at_client, b"polo");

    // A full close on both sides leaves no connections behind once the
    // active closer's TIME-WAIT runs out.
    client.close(id);
    exchange(&mut client, &mut server, &mut wire);
    server.close(id.reverse());
    exchange(&mut client, &mut server, &mut wire);
    assert_eq!(server.open_connections(), 0);
    client.advance_time(Duration::from_millis(201));
    assert_eq!(client.open_connections(), 0);
}
