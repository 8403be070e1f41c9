//! Live-update persistence: carrying sessions across a process restart.
//!
//! State is written into a typed key-value [`Storage`] whose slots are
//! stable across versions: slot 100 holds the session count, and each
//! session contributes one slot-101 (incoming) and one slot-102 (outgoing)
//! connection record. The store round-trips through bytes, so the driver
//! can park it wherever survives the restart. Wait-queue contents are
//! deliberately not preserved; unpaired clients simply reconnect.

use crate::balancer::Balancer;
use std::collections::VecDeque;
use weir_core::{
    endpoint::{Endpoint, Endpoints, Ipv4Address},
    tcp::{ConnectionRecord, ReceiveSequenceSpace, SendSequenceSpace, State},
};

/// Slot holding the number of serialized sessions.
pub const SLOT_SESSION_COUNT: u16 = 100;
/// Slot holding a session's client-side connection record.
pub const SLOT_INCOMING: u16 = 101;
/// Slot holding a session's backend-side connection record.
pub const SLOT_OUTGOING: u16 = 102;

const TAG_U64: u8 = 0;
const TAG_CONNECTION: u8 = 1;

/// One value in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    U64(u64),
    Connection(ConnectionRecord),
}

/// A typed key-value store under construction.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Storage {
    entries: Vec<(u16, Entry)>,
}

/// The store could not be read back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("The store ended early")]
    Truncated,
    #[error("Unknown entry tag {0}")]
    BadTag(u8),
    #[error("Unknown connection state {0}")]
    BadState(u8),
    #[error("Expected slot {expected}, found {found}")]
    UnexpectedSlot { expected: u16, found: u16 },
    #[error("Expected slot {0}, but the store is empty")]
    Empty(u16),
    #[error("Slot {0} holds a value of the wrong type")]
    WrongType(u16),
}

impl Storage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn add_u64(&mut self, id: u16, value: u64) {
        self.entries.push((id, Entry::U64(value)));
    }

    pub fn add_connection(&mut self, id: u16, record: ConnectionRecord) {
        self.entries.push((id, Entry::Connection(record)));
    }

    /// Serializes the store for the restart boundary.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (id, entry) in &self.entries {
            out.extend_from_slice(&id.to_be_bytes());
            match entry {
                Entry::U64(value) => {
                    out.push(TAG_U64);
                    out.extend_from_slice(&value.to_be_bytes());
                }
                Entry::Connection(record) => {
                    out.push(TAG_CONNECTION);
                    write_record(&mut out, record);
                }
            }
        }
        out
    }

    /// Reads a store back from its serialized form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StoreError> {
        let mut reader = Reader(bytes);
        let mut entries = Vec::new();
        while !reader.0.is_empty() {
            let id = reader.u16()?;
            let entry = match reader.u8()? {
                TAG_U64 => Entry::U64(reader.u64()?),
                TAG_CONNECTION => Entry::Connection(read_record(&mut reader)?),
                tag => return Err(StoreError::BadTag(tag)),
            };
            entries.push((id, entry));
        }
        Ok(Self { entries })
    }

    /// Turns the store into a reader for restoration.
    pub fn restore(self) -> Restore {
        Restore {
            entries: self.entries.into(),
        }
    }
}

/// Reads entries back out of a [`Storage`] in order, enforcing the
/// expected slot ids.
#[derive(Debug)]
pub struct Restore {
    entries: VecDeque<(u16, Entry)>,
}

impl Restore {
    pub fn take_u64(&mut self, id: u16) -> Result<u64, StoreError> {
        match self.take(id)? {
            Entry::U64(value) => Ok(value),
            _ => Err(StoreError::WrongType(id)),
        }
    }

    pub fn take_connection(&mut self, id: u16) -> Result<ConnectionRecord, StoreError> {
        match self.take(id)? {
            Entry::Connection(record) => Ok(record),
            _ => Err(StoreError::WrongType(id)),
        }
    }

    fn take(&mut self, id: u16) -> Result<Entry, StoreError> {
        match self.entries.pop_front() {
            Some((found, entry)) if found == id => Ok(entry),
            Some((found, _)) => Err(StoreError::UnexpectedSlot {
                expected: id,
                found,
            }),
            None => Err(StoreError::Empty(id)),
        }
    }
}

impl Balancer {
    /// Persists every live session: the count, then an (incoming, outgoing)
    /// record pair per session.
    pub fn serialize(&self, store: &mut Storage) {
        let mut pairs = Vec::new();
        for index in 0..self.nodes.session_count() {
            let session = self.nodes.session(index);
            if !session.is_alive() {
                continue;
            }
            let incoming = self.netin.export_connection(session.incoming());
            let outgoing = self.netout.export_connection(session.outgoing());
            match (incoming, outgoing) {
                (Some(incoming), Some(outgoing)) => pairs.push((incoming, outgoing)),
                _ => tracing::error!(index, "Live session lost a connection, not serializing it"),
            }
        }

        tracing::info!(sessions = pairs.len(), "Serializing for live update");
        store.add_u64(SLOT_SESSION_COUNT, pairs.len() as u64);
        for (incoming, outgoing) in pairs {
            store.add_connection(SLOT_INCOMING, incoming);
            store.add_connection(SLOT_OUTGOING, outgoing);
        }
    }

    /// Rebuilds sessions from a serialized store, rehydrating both
    /// connections into the balancer's TCP instances. Restored sessions
    /// start over on the pre-traffic idle timeout.
    pub fn deserialize(&mut self, store: &mut Restore) -> Result<usize, StoreError> {
        let count = store.take_u64(SLOT_SESSION_COUNT)?;
        for _ in 0..count {
            let incoming = store.take_connection(SLOT_INCOMING)?;
            let outgoing = store.take_connection(SLOT_OUTGOING)?;
            self.netin.import_connection(incoming);
            self.netout.import_connection(outgoing);
            self.nodes.create_session(false, incoming.id, outgoing.id);
        }
        tracing::info!(sessions = count, "Restored from live update");
        Ok(count as usize)
    }
}

fn write_record(out: &mut Vec<u8>, record: &ConnectionRecord) {
    write_endpoint(out, record.id.local);
    write_endpoint(out, record.id.remote);
    out.push(state_to_u8(record.state));
    out.extend_from_slice(&record.snd.una.to_be_bytes());
    out.extend_from_slice(&record.snd.nxt.to_be_bytes());
    out.extend_from_slice(&record.snd.wnd.to_be_bytes());
    out.extend_from_slice(&record.snd.up.to_be_bytes());
    out.extend_from_slice(&record.snd.wl1.to_be_bytes());
    out.extend_from_slice(&record.snd.wl2.to_be_bytes());
    out.extend_from_slice(&record.snd.iss.to_be_bytes());
    out.extend_from_slice(&record.snd.mss.to_be_bytes());
    out.push(record.snd.wind_shift);
    out.push(record.snd.ts_ok as u8);
    out.extend_from_slice(&record.rcv.irs.to_be_bytes());
    out.extend_from_slice(&record.rcv.nxt.to_be_bytes());
    out.extend_from_slice(&record.rcv.wnd.to_be_bytes());
    out.extend_from_slice(&record.rcv.up.to_be_bytes());
    out.push(record.rcv.wind_shift);
    out.extend_from_slice(&record.cwnd.to_be_bytes());
    out.extend_from_slice(&record.ssthresh.to_be_bytes());
    out.extend_from_slice(&record.ts_recent.to_be_bytes());
}

fn read_record(reader: &mut Reader) -> Result<ConnectionRecord, StoreError> {
    Ok(ConnectionRecord {
        id: Endpoints {
            local: read_endpoint(reader)?,
            remote: read_endpoint(reader)?,
        },
        state: state_from_u8(reader.u8()?)?,
        snd: SendSequenceSpace {
            una: reader.u32()?,
            nxt: reader.u32()?,
            wnd: reader.u32()?,
            up: reader.u16()?,
            wl1: reader.u32()?,
            wl2: reader.u32()?,
            iss: reader.u32()?,
            mss: reader.u16()?,
            wind_shift: reader.u8()?,
            ts_ok: reader.u8()? != 0,
        },
        rcv: ReceiveSequenceSpace {
            irs: reader.u32()?,
            nxt: reader.u32()?,
            wnd: reader.u32()?,
            up: reader.u16()?,
            wind_shift: reader.u8()?,
        },
        cwnd: reader.u32()?,
        ssthresh: reader.u32()?,
        ts_recent: reader.u32()?,
    })
}

fn write_endpoint(out: &mut Vec<u8>, endpoint: Endpoint) {
    out.extend_from_slice(&endpoint.address.octets());
    out.extend_from_slice(&endpoint.port.to_be_bytes());
}

fn read_endpoint(reader: &mut Reader) -> Result<Endpoint, StoreError> {
    let address = Ipv4Address::new([reader.u8()?, reader.u8()?, reader.u8()?, reader.u8()?]);
    let port = reader.u16()?;
    Ok(Endpoint::new(address, port))
}

fn state_to_u8(state: State) -> u8 {
    match state {
        State::Closed => 0,
        State::Listen => 1,
        State::SynSent => 2,
        State::SynReceived => 3,
        State::Established => 4,
        State::FinWait1 => 5,
        State::FinWait2 => 6,
        State::CloseWait => 7,
        State::Closing => 8,
        State::LastAck => 9,
        State::TimeWait => 10,
    }
}

fn state_from_u8(value: u8) -> Result<State, StoreError> {
    Ok(match value {
        0 => State::Closed,
        1 => State::Listen,
        2 => State::SynSent,
        3 => State::SynReceived,
        4 => State::Established,
        5 => State::FinWait1,
        6 => State::FinWait2,
        7 => State::CloseWait,
        8 => State::Closing,
        9 => State::LastAck,
        10 => State::TimeWait,
        other => return Err(StoreError::BadState(other)),
    })
}

struct Reader<'a>(&'a [u8]);

impl Reader<'_> {
    fn u8(&mut self) -> Result<u8, StoreError> {
        let (&first, rest) = self.0.split_first().ok_or(StoreError::Truncated)?;
        self.0 = rest;
        Ok(first)
    }

    fn u16(&mut self) -> Result<u16, StoreError> {
        Ok(u16::from_be_bytes([self.u8()?, self.u8()?]))
    }

    fn u32(&mut self) -> Result<u32, StoreError> {
        Ok(u32::from_be_bytes([
            self.u8()?,
            self.u8()?,
            self.u8()?,
            self.u8()?,
        ]))
    }

    fn u64(&mut self) -> Result<u64, StoreError> {
        Ok(u64::from_be_bytes([
            self.u8()?,
            self.u8()?,
            self.u8()?,
            self.u8()?,
            self.u8()?,
            self.u8()?,
            self.u8()?,
            self.u8()?,
        ]))
    }
}
