//! The Transmission Control Block: the per-connection state machine.
//!
//! [`Tcb`] implements the RFC 793 segment-arrival processing for every state
//! past LISTEN, the RFC 6298 retransmission timer, and Reno/NewReno loss
//! recovery. It is deliberately free of I/O and clocks: segments go out
//! through [`Tcb::segments`], observable effects through [`Tcb::take_events`],
//! and time through [`Tcb::advance_time`], so that a pair of blocks can be
//! exercised against each other in ordinary unit tests.

use super::{
    congestion::{DupAck, NewAck, Reno},
    rttm::{RoundTripTimer, RTO_AFTER_SYN_RTX},
    seq::{seq_geq, seq_gt, seq_in_window, seq_leq, seq_lt, seq_within},
    state::State,
    write_queue::WriteQueue,
    ConnSettings, Segment,
};
use crate::{
    endpoint::{Endpoint, Endpoints, Ipv4Address},
    message::Message,
    wire::{TcpHeader, TcpHeaderBuilder},
};
use std::{collections::VecDeque, mem, time::Duration};


/// The send sequence space (RFC 793 section 3.2).
///
/// ```text
///      1         2          3          4
/// ----------|----------|----------|----------
///        SND.UNA    SND.NXT    SND.UNA
///                             +SND.WND
/// ```
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub struct SendSequenceSpace {
    /// Oldest unacknowledged sequence number
    pub una: u32,
    /// Next sequence number to be sent
    pub nxt: u32,
    /// The remote window, already descaled to bytes
    pub wnd: u32,
    /// Send urgent pointer
    pub up: u16,
    /// Segment sequence number used for the last window update
    pub wl1: u32,
    /// Segment acknowledgment number used for the last window update
    pub wl2: u32,
    /// Initial send sequence number
    pub iss: u32,
    /// The MSS advertised by the peer
    pub mss: u16,
    /// The shift count the peer asked us to apply to its window field
    pub wind_shift: u8,
    /// Whether both sides agreed to carry timestamps
    pub ts_ok: bool,
}

/// The receive sequence space (RFC 793 section 3.2).
///
/// ```text
///      1          2          3
/// ----------|----------|----------
///        RCV.NXT    RCV.NXT
///                   +RCV.WND
/// ```
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub struct ReceiveSequenceSpace {
    /// Initial receive sequence number
    pub irs: u32,
    /// Next sequence number expected on an incoming segment
    pub nxt: u32,
    /// The number of bytes we can still buffer
    pub wnd: u32,
    /// Receive urgent pointer
    pub up: u16,
    /// The shift count we apply to our advertised window field
    pub wind_shift: u8,
}

/// Countdown timers, decremented by [`Tcb::advance_time`]. `None` is the
/// cancelled state, so a cancelled timer cannot fire.
#[derive(Debug, Default, Clone, Copy)]
struct Timeouts {
    retransmission: Option<Duration>,
    delayed_ack: Option<Duration>,
    time_wait: Option<Duration>,
}

/// How the connection came to exist locally.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Initiation {
    /// Created by a listener answering a SYN
    Listen,
    /// Created by an active open to a remote TCP
    Open,
}

/// Why a connection came apart. Carried by [`ConnEvent::Disconnected`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Disconnect {
    #[error("The remote closed the connection")]
    Closing,
    #[error("The connection was reset")]
    Reset,
    #[error("The remote refused the connection")]
    Refused,
    #[error("The retransmission limit was reached")]
    TimedOut,
    #[error("The remote violated the protocol")]
    ProtocolViolation,
}

/// An observable side effect of segment or timer processing. Drained by the
/// host with [`Tcb::take_events`] in the order they occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnEvent {
    /// The three-way handshake completed.
    Connected,
    /// In-order text was delivered to the receive buffer and is ready to be
    /// taken, either because the buffer filled or a PSH closed a run.
    DataReceived { push: bool },
    /// The connection is coming apart; the reason says how.
    Disconnected(Disconnect),
    /// The retransmission timer fired.
    RtxTimeout { attempt: u32 },
    /// The block reached CLOSED and should be deleted by the host.
    Closed,
}

/// The result of a segment arriving on the block.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentArrivesResult {
    /// The segment was processed.
    Ok,
    /// The block closed; the host should delete it.
    Close,
}

/// The result of a call to [`Tcb::send`].
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    Ok,
    /// The connection is closing and takes no more data.
    ClosingConnection,
    /// The transmit queue is full. Retry after some of it drains.
    QueueFull,
}

/// The result of a call to [`Tcb::close`].
#[must_use]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum CloseResult {
    Ok,
    /// SYN-SENT goes straight to CLOSED; the host should delete the block.
    CloseConnection,
}

/// The result of advancing the block's clock.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceTimeResult {
    Ignore,
    /// The block closed (TIME-WAIT elapsed or retransmission gave out) and
    /// the host should delete it.
    CloseConnection,
}

/// The outcome of processing one segment, internal to the block.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessResult {
    Success,
    DiscardSegment,
    InvalidAck,
    ConnectionReset,
    ConnectionRefused,
    ProtocolViolation,
    FinalizeClose,
}

impl ProcessResult {
    fn should_delete_tcb(self) -> bool {
        matches!(
            self,
            ProcessResult::ConnectionReset
                | ProcessResult::ConnectionRefused
                | ProcessResult::ProtocolViolation
                | ProcessResult::FinalizeClose
        )
    }
}

/// The Transmission Control Block.
#[derive(Debug)]
pub struct Tcb {
    id: Endpoints,
    initiation: Initiation,
    state: State,
    settings: ConnSettings,
    snd: SendSequenceSpace,
    rcv: ReceiveSequenceSpace,
    reno: Reno,
    rttm: RoundTripTimer,
    writeq: WriteQueue,
    /// In-order segment text awaiting a `receive` call.
    recv_buffer: Message,
    /// Segments built and ready for the host to serialize.
    outgoing: VecDeque<Segment>,
    events: Vec<ConnEvent>,
    timeouts: Timeouts,
    /// Monotonic per-connection clock, fed by `advance_time`.
    clock: Duration,
    /// The sequence number our FIN occupies, once close() has assigned one.
    fin_seq: Option<u32>,
    /// True when close() ran before the write queue drained; the FIN goes
    /// out with the final data segment.
    fin_pending: bool,
    ts_recent: u32,
    last_ack_sent: u32,
    rtx_attempt: u32,
    /// Full-sized segments received since the last ACK we sent; at two, the
    /// delayed ACK collapses to an immediate one.
    segs_unacked: u32,
}

impl Tcb {
    /// Opens a connection actively: the block starts in SYN-SENT with its
    /// SYN queued.
    pub fn open(id: Endpoints, iss: u32, settings: ConnSettings) -> Self {
        let mut tcb = Self::new(
            id,
            Initiation::Open,
            State::SynSent,
            SendSequenceSpace {
                iss,
                una: iss,
                nxt: iss.wrapping_add(1),
                mss: settings.mss,
                ..Default::default()
            },
            ReceiveSequenceSpace::default(),
            settings,
        );
        let syn = tcb.syn_builder(iss);
        tcb.push_segment(syn, Message::default());
        tcb
    }

    fn new(
        id: Endpoints,
        initiation: Initiation,
        state: State,
        snd: SendSequenceSpace,
        rcv: ReceiveSequenceSpace,
        settings: ConnSettings,
    ) -> Self {
        let reno = Reno::new(settings.mss as u32, settings.recv_capacity);
        let rcv = ReceiveSequenceSpace {
            wnd: settings.recv_capacity,
            ..rcv
        };
        Self {
            id,
            initiation,
            state,
            snd,
            rcv,
            reno,
            rttm: RoundTripTimer::default(),
            writeq: WriteQueue::default(),
            recv_buffer: Message::default(),
            outgoing: VecDeque::new(),
            events: Vec::new(),
            timeouts: Timeouts::default(),
            clock: Duration::ZERO,
            fin_seq: None,
            fin_pending: false,
            ts_recent: 0,
            last_ack_sent: 0,
            rtx_attempt: 0,
            segs_unacked: 0,
            settings,
        }
    }

    pub fn id(&self) -> Endpoints {
        self.id
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == State::Established
    }

    /// Bytes sent but not yet acknowledged, control bits included.
    pub fn flight_size(&self) -> u32 {
        self.snd.nxt.wrapping_sub(self.snd.una)
    }

    /// How many more bytes `send` will accept before reporting `QueueFull`.
    pub fn transmit_queue_available(&self) -> usize {
        self.settings
            .writeq_limit
            .saturating_sub(self.writeq.in_flight() + self.writeq.remaining())
    }

    /// Bytes of in-order text waiting for a `receive` call.
    pub fn buffered(&self) -> usize {
        self.recv_buffer.len()
    }

    pub fn congestion(&self) -> &Reno {
        &self.reno
    }

    pub fn round_trip(&self) -> &RoundTripTimer {
        &self.rttm
    }

    /// Queues user data for transmission. Data is accepted while the local
    /// side has not initiated a close.
    pub fn send(&mut self, chunk: Message) -> SendResult {
        if !self.state.is_writable() {
            return SendResult::ClosingConnection;
        }
        if chunk.len() > self.transmit_queue_available() {
            return SendResult::QueueFull;
        }
        // Segmentization happens lazily in `segments`, so a close() that
        // follows a send() can still fold its FIN into the final segment.
        self.writeq.push(chunk);
        SendResult::Ok
    }

    /// Takes all buffered in-order text.
    pub fn receive(&mut self) -> Message {
        let buffered = self.recv_buffer.len();
        self.receive_up_to(buffered)
    }

    /// Takes up to `max` bytes of buffered in-order text. Bytes left behind
    /// keep the advertised window small, which is how the stack applies
    /// backpressure to the peer.
    pub fn receive_up_to(&mut self, max: usize) -> Message {
        let threshold = self.smss() as u32;
        let window_was_closed = self.rcv.wnd < threshold;
        let taken = self.recv_buffer.cut(max.min(self.recv_buffer.len()));
        self.update_rcv_wnd();
        if window_was_closed && self.rcv.wnd >= threshold && self.state.is_synchronized() {
            // The window reopened; tell the peer rather than waiting for it
            // to probe.
            self.ack_now();
        }
        taken
    }

    /// Initiates a graceful close. Idempotent: calling it on a closing
    /// connection does nothing.
    pub fn close(&mut self) -> CloseResult {
        match self.state {
            State::SynSent => {
                self.state = State::Closed;
                self.events.push(ConnEvent::Closed);
                CloseResult::CloseConnection
            }
            State::SynReceived | State::Established => {
                self.state = State::FinWait1;
                self.queue_fin();
                CloseResult::Ok
            }
            State::CloseWait => {
                self.state = State::LastAck;
                self.queue_fin();
                CloseResult::Ok
            }
            _ => CloseResult::Ok,
        }
    }

    /// Closes immediately: sends RST, purges the queues, and signals the
    /// user. The host should delete the block afterwards.
    pub fn abort(&mut self) {
        self.abort_with(Disconnect::Reset);
    }

    fn abort_with(&mut self, reason: Disconnect) {
        if self.state.is_synchronized() || self.state == State::SynReceived {
            let rst = self.header_builder(self.snd.nxt).rst();
            self.push_segment(rst, Message::default());
        }
        self.teardown(reason);
    }

    /// Purges queues and timers and marks the block CLOSED.
    fn teardown(&mut self, reason: Disconnect) {
        self.writeq.reset();
        self.timeouts = Timeouts::default();
        self.state = State::Closed;
        self.events.push(ConnEvent::Disconnected(reason));
        self.events.push(ConnEvent::Closed);
    }

    /// Drains the events recorded since the last call.
    pub fn take_events(&mut self) -> Vec<ConnEvent> {
        mem::take(&mut self.events)
    }

    /// Advances the block's clock, firing any timers the delta covers.
    pub fn advance_time(&mut self, delta: Duration) -> AdvanceTimeResult {
        self.clock += delta;

        if let Some(left) = self.timeouts.delayed_ack {
            if delta >= left {
                self.timeouts.delayed_ack = None;
                self.ack_now();
            } else {
                self.timeouts.delayed_ack = Some(left - delta);
            }
        }

        if let Some(left) = self.timeouts.retransmission {
            if delta >= left {
                self.timeouts.retransmission = None;
                self.rtx_timeout();
                if self.state == State::Closed {
                    return AdvanceTimeResult::CloseConnection;
                }
            } else {
                self.timeouts.retransmission = Some(left - delta);
            }
        }

        if let Some(left) = self.timeouts.time_wait {
            if delta >= left {
                self.timeouts.time_wait = None;
                self.state = State::Closed;
                self.events.push(ConnEvent::Closed);
                return AdvanceTimeResult::CloseConnection;
            }
            self.timeouts.time_wait = Some(left - delta);
        }

        AdvanceTimeResult::Ignore
    }

    /// Gets the segments ready for delivery to the remote TCP. Queued user
    /// data is segmentized as far as the send and congestion windows allow.
    pub fn segments(&mut self) -> Vec<Segment> {
        // Queued data still drains after close(): FIN-WAIT-1 and LAST-ACK
        // carry the tail of the stream, with the FIN on its final segment.
        if matches!(
            self.state,
            State::Established | State::CloseWait | State::FinWait1 | State::LastAck
        ) {
            self.send_much();
        }
        self.outgoing.drain(..).collect()
    }

    // === Segment arrival ===

    /// Processes one incoming segment. This is the entry point from the
    /// host's demultiplexer and implements the RFC 793 "segment arrives"
    /// rules for every state past LISTEN.
    pub fn segment_arrives(&mut self, segment: Segment) -> SegmentArrivesResult {
        let (seg, text) = segment.into_inner();

        let result = if self.state == State::SynSent {
            self.on_segment_syn_sent(seg, text)
        } else {
            self.on_segment(seg, text)
        };

        if result.should_delete_tcb() {
            let reason = match result {
                ProcessResult::ConnectionReset => Some(Disconnect::Reset),
                ProcessResult::ConnectionRefused => Some(Disconnect::Refused),
                ProcessResult::ProtocolViolation => Some(Disconnect::ProtocolViolation),
                _ => None,
            };
            match reason {
                Some(reason) => self.teardown(reason),
                None => {
                    self.state = State::Closed;
                    self.events.push(ConnEvent::Closed);
                }
            }
            SegmentArrivesResult::Close
        } else {
            SegmentArrivesResult::Ok
        }
    }

    /// RFC 793 segment processing in SYN-SENT (3.9, "If the state is
    /// SYN-SENT").
    fn on_segment_syn_sent(&mut self, seg: TcpHeader, text: Message) -> ProcessResult {
        let acceptable_ack = if seg.ctl.ack() {
            if !seq_within(self.snd.una, seg.ack, self.snd.nxt) {
                if seg.ctl.rst() {
                    return ProcessResult::DiscardSegment;
                }
                let rst = self.header_builder(seg.ack).rst();
                self.push_segment(rst, Message::default());
                return ProcessResult::InvalidAck;
            }
            true
        } else {
            false
        };

        if seg.ctl.rst() {
            return if acceptable_ack {
                tracing::debug!(id = %self.id, "Connection refused");
                ProcessResult::ConnectionRefused
            } else {
                ProcessResult::DiscardSegment
            };
        }

        if !seg.ctl.syn() {
            return ProcessResult::DiscardSegment;
        }

        self.rcv.irs = seg.seq;
        self.rcv.nxt = seg.seq.wrapping_add(1);
        self.negotiate_options(&seg);
        // The window field of a SYN is never scaled.
        self.snd.wnd = seg.wnd as u32;
        self.snd.wl1 = seg.seq;
        self.snd.wl2 = seg.ack;

        if acceptable_ack {
            // SYN,ACK: our SYN is acknowledged.
            self.snd.una = seg.ack;
            self.rttm.ack(seg.ack, self.clock);
            self.stop_rtx();
            self.state = State::Established;
            self.events.push(ConnEvent::Connected);
            self.ack_now();
            self.process_text(&seg, text);
            self.send_much();
        } else {
            // Simultaneous open.
            self.state = State::SynReceived;
            let syn_ack = self.syn_builder(self.snd.iss).ack(self.rcv.nxt);
            self.push_segment(syn_ack, Message::default());
        }
        ProcessResult::Success
    }

    /// RFC 793 segment processing for synchronized states, in the order the
    /// spec prescribes: sequence check, RST, SYN, ACK, text, FIN.
    fn on_segment(&mut self, seg: TcpHeader, text: Message) -> ProcessResult {
        // First: sequence acceptability.
        if !self.is_seq_ok(text.len() as u32, seg.seq, seg.ctl.syn(), seg.ctl.fin()) {
            if seg.ctl.rst() {
                return ProcessResult::DiscardSegment;
            }
            tracing::trace!(id = %self.id, seq = seg.seq, "Unacceptable segment");
            self.ack_now();
            return ProcessResult::DiscardSegment;
        }

        // Second: RST. An acceptable reset tears the connection down and
        // signals the user, whatever state the close sequence had reached.
        if seg.ctl.rst() {
            return match self.state {
                State::SynReceived if self.initiation == Initiation::Open => {
                    tracing::debug!(id = %self.id, "Connection refused");
                    ProcessResult::ConnectionRefused
                }
                _ => {
                    tracing::debug!(id = %self.id, "Connection reset by peer");
                    ProcessResult::ConnectionReset
                }
            };
        }

        // Third: a SYN this late is a protocol violation. Reset the peer.
        if seg.ctl.syn() {
            tracing::debug!(id = %self.id, "SYN received on a synchronized connection");
            let rst = self.header_builder(self.snd.nxt).rst();
            self.push_segment(rst, Message::default());
            return ProcessResult::ProtocolViolation;
        }

        // Fourth: segments without ACK carry nothing further for us.
        if !seg.ctl.ack() {
            return ProcessResult::DiscardSegment;
        }

        if self.state == State::SynReceived {
            if seq_within(self.snd.una, seg.ack, self.snd.nxt) {
                self.state = State::Established;
                self.snd.wnd = (seg.wnd as u32) << self.snd.wind_shift;
                self.snd.wl1 = seg.seq;
                self.snd.wl2 = seg.ack;
                self.stop_rtx();
                self.events.push(ConnEvent::Connected);
            } else {
                let rst = self.header_builder(seg.ack).rst();
                self.push_segment(rst, Message::default());
                return ProcessResult::InvalidAck;
            }
        }

        self.note_timestamps(&seg);

        // Fifth: ACK processing, including congestion control.
        match self.handle_ack(&seg, text.len()) {
            AckOutcome::Continue => {}
            AckOutcome::Drop => return ProcessResult::Success,
            AckOutcome::Invalid => return ProcessResult::InvalidAck,
        }

        // State transitions driven by our FIN being acknowledged.
        match self.state {
            State::FinWait1 if self.is_fin_acked() => {
                self.state = State::FinWait2;
            }
            State::Closing if self.is_fin_acked() => {
                self.enter_time_wait();
            }
            State::LastAck if self.is_fin_acked() => {
                self.events.push(ConnEvent::Disconnected(Disconnect::Closing));
                return ProcessResult::FinalizeClose;
            }
            State::TimeWait => {
                // Only a retransmission of the remote FIN arrives here.
                // Acknowledge it and restart the 2 MSL timeout.
                self.ack_now();
                self.restart_time_wait();
            }
            _ => {}
        }

        // Sixth: segment text.
        let text_len = text.len() as u32;
        self.process_text(&seg, text);

        // Seventh: FIN.
        if seg.ctl.fin() {
            self.process_fin(&seg, text_len);
        }

        ProcessResult::Success
    }

    /// ACK handling shared by the synchronized states: duplicate-ACK
    /// detection, window updates, and Reno.
    fn handle_ack(&mut self, seg: &TcpHeader, text_len: usize) -> AckOutcome {
        let true_win = (seg.wnd as u32) << self.snd.wind_shift;

        // A duplicate: same ACK as SND.UNA, data in flight, no payload, no
        // window change, no control bits.
        if seg.ack == self.snd.una
            && self.flight_size() > 0
            && text_len == 0
            && self.snd.wnd == true_win
            && !seg.ctl.syn()
            && !seg.ctl.fin()
        {
            match self.reno.on_dup_ack(self.snd.una, self.snd.nxt, self.flight_size()) {
                DupAck::Ignore => {}
                DupAck::LimitedTransmit => {
                    if self.reno.may_limited_transmit(self.snd.wnd, self.flight_size())
                        && self.writeq.has_remaining()
                    {
                        self.limited_tx();
                    }
                }
                DupAck::FastRetransmit => {
                    tracing::debug!(id = %self.id, una = self.snd.una, "Fast retransmit");
                    self.retransmit();
                }
            }
            return AckOutcome::Drop;
        }

        // Acknowledges something we never sent.
        if seq_gt(seg.ack, self.snd.nxt) {
            self.ack_now();
            return AckOutcome::Invalid;
        }

        if seq_geq(seg.ack, self.snd.una) {
            // RFC 793 window update rule.
            if seq_lt(self.snd.wl1, seg.seq)
                || (self.snd.wl1 == seg.seq && seq_leq(self.snd.wl2, seg.ack))
            {
                self.snd.wnd = true_win;
                self.snd.wl1 = seg.seq;
                self.snd.wl2 = seg.ack;
            }

            let bytes_acked = seg.ack.wrapping_sub(self.snd.una);
            if bytes_acked == 0 {
                return AckOutcome::Continue;
            }

            self.reno.register_ack(self.snd.una, seg.ack);
            self.snd.una = seg.ack;
            // Control bits occupy sequence space but not queue bytes; the
            // queue clamps for us.
            self.writeq.acknowledge(bytes_acked as usize);
            self.rttm.ack(seg.ack, self.clock);

            // RFC 6298 5.2 and 5.3.
            self.rtx_attempt = 0;
            if self.snd.una == self.snd.nxt {
                self.stop_rtx();
            } else {
                self.restart_rtx();
            }

            match self
                .reno
                .on_new_ack(seg.ack, bytes_acked, self.flight_size(), self.snd.nxt)
            {
                NewAck::Open => {
                    if text_len == 0 {
                        self.send_much();
                    }
                }
                NewAck::PartialAck { reset_rtx } => {
                    self.retransmit();
                    if reset_rtx {
                        self.restart_rtx();
                    }
                    if self.can_send() {
                        self.limited_tx();
                    }
                }
                NewAck::FullAck => {}
            }
        }
        AckOutcome::Continue
    }

    /// Segment text processing. In-order text is appended to the receive
    /// buffer; out-of-order text is dropped and answered with an immediate
    /// duplicate ACK so the peer's fast retransmit can do its work.
    fn process_text(&mut self, seg: &TcpHeader, mut text: Message) {
        if text.is_empty() {
            return;
        }
        if !matches!(
            self.state,
            State::Established | State::FinWait1 | State::FinWait2
        ) {
            return;
        }

        let text_len = text.len() as u32;
        let first = seg.seq.wrapping_add(seg.ctl.syn() as u32);

        if seq_gt(first, self.rcv.nxt) {
            // A hole precedes this segment. This design keeps no reassembly
            // queue; the sender will retransmit from RCV.NXT.
            tracing::trace!(id = %self.id, seq = seg.seq, "Out-of-order segment dropped");
            self.ack_now();
            return;
        }

        let already_received = self.rcv.nxt.wrapping_sub(first);
        if already_received >= text_len {
            // Nothing new; still tell the peer where we are.
            self.ack_now();
            return;
        }

        let unreceived = text_len - already_received;
        let space_available = self.rcv.wnd;
        let accept = unreceived.min(space_available);
        text.remove_front(already_received as usize);
        let accepted = text.cut(accept as usize);
        self.rcv.nxt = self.rcv.nxt.wrapping_add(accept);
        self.recv_buffer.concatenate(accepted);
        self.update_rcv_wnd();

        let buffer_full = self.rcv.wnd == 0;
        if seg.ctl.psh() || buffer_full {
            self.events.push(ConnEvent::DataReceived {
                push: seg.ctl.psh(),
            });
        }

        if accept < unreceived {
            // We ran out of buffer; make the peer aware immediately.
            self.ack_now();
        } else {
            self.ack_delayed();
        }
    }

    /// FIN processing. The FIN consumes its sequence number only after
    /// every text byte before it has been accepted; otherwise the sender
    /// retransmits and we handle it then.
    fn process_fin(&mut self, seg: &TcpHeader, text_len: u32) {
        let last_text_byte = seg
            .seq
            .wrapping_add(seg.ctl.syn() as u32)
            .wrapping_add(text_len);
        if self.rcv.nxt != last_text_byte && self.rcv.nxt != last_text_byte.wrapping_add(1) {
            return;
        }

        if self.rcv.nxt == last_text_byte {
            // Advance over the FIN and acknowledge it.
            self.rcv.nxt = last_text_byte.wrapping_add(1);
            self.ack_now();
        }

        match self.state {
            State::SynReceived | State::Established => {
                self.state = State::CloseWait;
                self.events.push(ConnEvent::Disconnected(Disconnect::Closing));
            }
            State::FinWait1 => {
                if self.is_fin_acked() {
                    self.enter_time_wait();
                } else {
                    self.state = State::Closing;
                }
                self.events.push(ConnEvent::Disconnected(Disconnect::Closing));
            }
            State::FinWait2 => {
                self.enter_time_wait();
                self.events.push(ConnEvent::Disconnected(Disconnect::Closing));
            }
            State::TimeWait => {
                self.restart_time_wait();
            }
            _ => {}
        }
    }

    fn is_fin_acked(&self) -> bool {
        match self.fin_seq {
            Some(fin_seq) => self.snd.una == fin_seq.wrapping_add(1),
            None => false,
        }
    }

    // === Transmission ===

    /// Segmentizes queued user data as far as the usable window allows,
    /// setting PSH on the last segment of the burst and folding in a
    /// pending FIN when the queue drains.
    fn send_much(&mut self) {
        while self.can_send() {
            let max = (self.smss() as usize)
                .min(self.usable_window() as usize)
                .min(self.writeq.remaining());
            let text = self.writeq.advance(max);
            let seq = self.snd.nxt;
            self.snd.nxt = self.snd.nxt.wrapping_add(text.len() as u32);

            let mut builder = self.header_builder(seq).ack(self.rcv.nxt);
            if !self.can_send() {
                // End of the burst, either because the queue drained or the
                // window closed.
                builder = builder.psh();
            }
            if self.fin_pending && !self.writeq.has_remaining() {
                self.fin_pending = false;
                self.fin_seq = Some(self.snd.nxt);
                self.snd.nxt = self.snd.nxt.wrapping_add(1);
                builder = builder.fin();
            }
            self.push_segment(builder, text);
        }

        // A FIN with no data left to carry it goes out on its own.
        if self.fin_pending && !self.writeq.has_remaining() {
            self.emit_fin();
        }

        // With the window shut and nothing in flight, no ACK is coming to
        // restart the conversation; a lost window update would wedge the
        // stream for good. Arm the timer so the expiry path sends a probe.
        if self.flight_size() == 0
            && self.writeq.has_remaining()
            && self.usable_window() == 0
            && self.timeouts.retransmission.is_none()
        {
            self.restart_rtx();
        }
    }

    /// Sends a single segment of new data without regard for the congestion
    /// window (RFC 5681 limited transmit; also used for the one allowed
    /// segment per partial ACK during recovery).
    fn limited_tx(&mut self) {
        let max = (self.smss() as usize).min(self.writeq.remaining());
        if max == 0 {
            return;
        }
        let text = self.writeq.advance(max);
        let seq = self.snd.nxt;
        self.snd.nxt = self.snd.nxt.wrapping_add(text.len() as u32);
        let mut builder = self.header_builder(seq).ack(self.rcv.nxt).psh();
        if self.fin_pending && !self.writeq.has_remaining() {
            self.fin_pending = false;
            self.fin_seq = Some(self.snd.nxt);
            self.snd.nxt = self.snd.nxt.wrapping_add(1);
            builder = builder.fin();
        }
        self.push_segment(builder, text);
    }

    /// Retransmits the earliest unacknowledged segment, starting at
    /// SND.UNA. SYN and FIN retransmissions are rebuilt from state; data
    /// comes back out of the write queue.
    fn retransmit(&mut self) {
        match self.state {
            State::SynSent => {
                let syn = self.syn_builder(self.snd.una);
                self.push_segment(syn, Message::default());
            }
            State::SynReceived => {
                let syn_ack = self.syn_builder(self.snd.una).ack(self.rcv.nxt);
                self.push_segment(syn_ack, Message::default());
            }
            _ => {
                if self.writeq.in_flight() > 0 {
                    let text = self.writeq.una_chunk(self.smss() as usize);
                    let end = self.snd.una.wrapping_add(text.len() as u32);
                    let mut builder = self.header_builder(self.snd.una).ack(self.rcv.nxt).psh();
                    if self.fin_seq == Some(end) {
                        builder = builder.fin();
                    }
                    self.push_segment(builder, text);
                } else if self.fin_seq == Some(self.snd.una) {
                    let fin = self.header_builder(self.snd.una).ack(self.rcv.nxt).fin();
                    self.push_segment(fin, Message::default());
                }
            }
        }
        // Karn: a retransmitted segment can never produce an unambiguous
        // round-trip sample.
        self.rttm.invalidate();
    }

    /// The retransmission timer fired (RFC 6298 section 5.4 through 5.7).
    fn rtx_timeout(&mut self) {
        self.rtx_attempt += 1;
        self.events.push(ConnEvent::RtxTimeout {
            attempt: self.rtx_attempt,
        });
        tracing::debug!(id = %self.id, attempt = self.rtx_attempt, "Retransmission timeout");

        if self.rtx_attempt > self.settings.rtx_limit {
            tracing::warn!(id = %self.id, "Retransmission limit reached, aborting");
            self.abort_with(Disconnect::TimedOut);
            return;
        }

        if self.flight_size() == 0 && self.writeq.has_remaining() {
            self.window_probe();
        } else {
            self.retransmit();
        }

        if self.snd.una == self.snd.iss {
            // Retransmitting the SYN itself: RFC 6298 5.7 floors the RTO at
            // three seconds once data transmission begins.
            self.rttm.set_rto(RTO_AFTER_SYN_RTX);
        } else {
            self.rttm.back_off();
        }

        self.reno
            .on_rtx_timeout(self.flight_size(), self.snd.nxt, self.rtx_attempt == 1);
        self.restart_rtx();
    }

    /// Sends one byte past a closed window so the peer answers with a bare
    /// ACK carrying its current window.
    fn window_probe(&mut self) {
        let text = self.writeq.advance(1);
        let seq = self.snd.nxt;
        self.snd.nxt = self.snd.nxt.wrapping_add(text.len() as u32);
        let probe = self.header_builder(seq).ack(self.rcv.nxt).psh();
        self.push_segment(probe, text);
    }

    /// Queues our FIN, either immediately or, when unsent data remains, to
    /// ride out with the final data segment.
    fn queue_fin(&mut self) {
        if self.writeq.has_remaining() {
            self.fin_pending = true;
        } else {
            self.emit_fin();
        }
    }

    fn emit_fin(&mut self) {
        self.fin_pending = false;
        let seq = self.snd.nxt;
        self.fin_seq = Some(seq);
        self.snd.nxt = self.snd.nxt.wrapping_add(1);
        let fin = self.header_builder(seq).ack(self.rcv.nxt).fin();
        self.push_segment(fin, Message::default());
    }

    /// Emits a bare acknowledgment of RCV.NXT immediately, cancelling any
    /// pending delayed ACK.
    fn ack_now(&mut self) {
        let ack = self.header_builder(self.snd.nxt).ack(self.rcv.nxt);
        self.push_segment(ack, Message::default());
    }

    /// Schedules an acknowledgment: delayed when the host configured a DACK
    /// timeout and we are not already two full segments behind, immediate
    /// otherwise.
    fn ack_delayed(&mut self) {
        self.segs_unacked += 1;
        match self.settings.delayed_ack {
            Some(timeout) if self.segs_unacked < 2 => {
                if self.timeouts.delayed_ack.is_none() {
                    self.timeouts.delayed_ack = Some(timeout);
                }
            }
            _ => self.ack_now(),
        }
    }

    /// Builds a SYN or SYN,ACK header carrying our options.
    fn syn_builder(&self, seq: u32) -> TcpHeaderBuilder {
        let mut builder = TcpHeaderBuilder::new(self.id.local.port, self.id.remote.port, seq)
            .syn()
            // The window field of a SYN is never scaled.
            .wnd(self.rcv.wnd.min(u16::MAX as u32) as u16)
            .mss(self.settings.mss);
        if let Some(shift) = self.settings.window_scale {
            builder = builder.window_scale(shift);
        }
        if self.settings.timestamps {
            builder = builder.timestamps(self.ts_value(), self.ts_recent);
        }
        builder
    }

    /// Builds a plain header for the connection with the current advertised
    /// window and, when negotiated, a timestamp option.
    fn header_builder(&self, seq: u32) -> TcpHeaderBuilder {
        let mut builder = TcpHeaderBuilder::new(self.id.local.port, self.id.remote.port, seq)
            .wnd(self.advertised_window());
        if self.snd.ts_ok {
            builder = builder.timestamps(self.ts_value(), self.ts_recent);
        }
        builder
    }

    /// Finishes a header and queues the segment for the host to pick up,
    /// maintaining the retransmission timer, the round-trip measurement,
    /// and the delayed-ACK bookkeeping.
    fn push_segment(&mut self, builder: TcpHeaderBuilder, text: Message) {
        let header = match builder.build(
            self.id.local.address,
            self.id.remote.address,
            text.iter(),
            text.len(),
        ) {
            Ok(header) => header,
            // Unreachable in practice: segments are bounded by the MSS.
            Err(error) => {
                tracing::error!(id = %self.id, %error, "Failed to build segment");
                return;
            }
        };

        let segment = Segment::new(header, text);
        let should_rtx = segment.seg_len() > 0;
        let end = segment
            .header
            .seq
            .wrapping_add(segment.seg_len() as u32);

        if should_rtx {
            if self.timeouts.retransmission.is_none() {
                self.restart_rtx();
            }
            if end == self.snd.nxt {
                // Fresh data at the right edge: start a round-trip sample.
                self.rttm.start(end, self.clock);
            }
        }
        if segment.header.ctl.ack() {
            self.last_ack_sent = self.rcv.nxt;
            self.timeouts.delayed_ack = None;
            self.segs_unacked = 0;
        }

        self.outgoing.push_back(segment);
    }

    // === Windows and guards ===

    /// The sender MSS: the smaller of our configured MSS and what the peer
    /// advertised.
    fn smss(&self) -> u16 {
        if self.snd.mss == 0 {
            self.settings.mss
        } else {
            self.settings.mss.min(self.snd.mss)
        }
    }

    fn usable_window(&self) -> u32 {
        self.reno
            .cwnd()
            .min(self.snd.wnd)
            .saturating_sub(self.flight_size())
    }

    fn can_send(&self) -> bool {
        self.writeq.has_remaining() && self.usable_window() > 0
    }

    fn update_rcv_wnd(&mut self) {
        self.rcv.wnd = self
            .settings
            .recv_capacity
            .saturating_sub(self.recv_buffer.len() as u32);
    }

    /// The window field for an outgoing non-SYN segment, scaled down by our
    /// shift count.
    fn advertised_window(&self) -> u16 {
        (self.rcv.wnd >> self.rcv.wind_shift).min(u16::MAX as u32) as u16
    }

    fn ts_value(&self) -> u32 {
        self.clock.as_millis() as u32
    }

    // === Timers ===

    fn stop_rtx(&mut self) {
        self.timeouts.retransmission = None;
    }

    fn restart_rtx(&mut self) {
        self.timeouts.retransmission = Some(self.rttm.rto());
    }

    fn enter_time_wait(&mut self) {
        self.state = State::TimeWait;
        self.stop_rtx();
        self.timeouts.time_wait = Some(2 * self.settings.msl);
    }

    fn restart_time_wait(&mut self) {
        self.timeouts.time_wait = Some(2 * self.settings.msl);
    }

    // === Sequence and option plumbing ===

    /// Segment acceptability against the receive window (RFC 793 p. 26).
    fn is_seq_ok(&self, text_len: u32, seq: u32, syn: bool, fin: bool) -> bool {
        let seg_len = text_len + syn as u32 + fin as u32;
        let wnd_end = self.rcv.nxt.wrapping_add(self.rcv.wnd);
        if seg_len == 0 {
            if self.rcv.wnd == 0 {
                seq == self.rcv.nxt
            } else {
                seq_in_window(self.rcv.nxt, seq, wnd_end)
            }
        } else if self.rcv.wnd == 0 {
            false
        } else {
            seq_in_window(self.rcv.nxt, seq, wnd_end)
                || seq_in_window(
                    self.rcv.nxt,
                    seq.wrapping_add(seg_len).wrapping_sub(1),
                    wnd_end,
                )
        }
    }

    /// Applies the MSS, window-scale and timestamp options of a SYN.
    fn negotiate_options(&mut self, seg: &TcpHeader) {
        if let Some(mss) = seg.mss() {
            self.snd.mss = mss;
        }
        if let (Some(our_shift), Some(peer_shift)) =
            (self.settings.window_scale, seg.window_scale())
        {
            self.snd.wind_shift = peer_shift.min(14);
            self.rcv.wind_shift = our_shift;
        }
        if self.settings.timestamps {
            if let Some((value, _)) = seg.timestamps() {
                self.snd.ts_ok = true;
                self.ts_recent = value;
            }
        }
        self.reno.set_smss(self.smss() as u32);
    }

    /// Updates TS.Recent from a non-SYN segment (RFC 7323's last-ACK test).
    fn note_timestamps(&mut self, seg: &TcpHeader) {
        if !self.snd.ts_ok {
            return;
        }
        if let Some((value, _)) = seg.timestamps() {
            if seq_geq(value, self.ts_recent) && seq_leq(seg.seq, self.last_ack_sent) {
                self.ts_recent = value;
            }
        }
    }
}

/// The outcome of ACK processing, internal to [`Tcb`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckOutcome {
    Continue,
    Drop,
    Invalid,
}


/// The result of a segment arriving on a listening port.
#[must_use]
#[derive(Debug)]
pub enum ListenResult {
    /// The connection attempt was accepted and a block created for it.
    Tcb(Box<Tcb>),
    /// The attempt was answered with a response header instead.
    Response(TcpHeader),
}

impl ListenResult {
    pub fn response(self) -> Option<TcpHeader> {
        match self {
            ListenResult::Response(response) => Some(response),
            ListenResult::Tcb(_) => None,
        }
    }

    pub fn tcb(self) -> Option<Tcb> {
        match self {
            ListenResult::Response(_) => None,
            ListenResult::Tcb(tcb) => Some(*tcb),
        }
    }
}

/// Handles the arrival of a segment for a bound port with no matching
/// connection (RFC 793, "If the state is LISTEN"). A SYN creates a block in
/// SYN-RECEIVED with the SYN,ACK queued; a stray ACK is answered with RST;
/// anything else is dropped.
pub fn segment_arrives_listen(
    segment: Segment,
    local: Ipv4Address,
    remote: Ipv4Address,
    iss: u32,
    settings: ConnSettings,
) -> Option<ListenResult> {
    let (seg, _text) = segment.into_inner();

    if seg.ctl.rst() {
        return None;
    }

    if seg.ctl.ack() {
        let response = TcpHeaderBuilder::new(seg.dst_port, seg.src_port, seg.ack)
            .rst()
            .build(local, remote, [].into_iter(), 0)
            .ok()?;
        return Some(ListenResult::Response(response));
    }

    if !seg.ctl.syn() {
        return None;
    }

    let id = Endpoints {
        local: Endpoint {
            address: local,
            port: seg.dst_port,
        },
        remote: Endpoint {
            address: remote,
            port: seg.src_port,
        },
    };
    let rcv_nxt = seg.seq.wrapping_add(1);
    let mut tcb = Tcb::new(
        id,
        Initiation::Listen,
        State::SynReceived,
        SendSequenceSpace {
            iss,
            una: iss,
            nxt: iss.wrapping_add(1),
            // The window field of a SYN is never scaled.
            wnd: seg.wnd as u32,
            wl1: seg.seq,
            wl2: seg.ack,
            mss: settings.mss,
            ..Default::default()
        },
        ReceiveSequenceSpace {
            irs: seg.seq,
            nxt: rcv_nxt,
            ..Default::default()
        },
        settings,
    );
    tcb.negotiate_options(&seg);
    let syn_ack = tcb.syn_builder(iss).ack(rcv_nxt);
    tcb.push_segment(syn_ack, Message::default());
    Some(ListenResult::Tcb(Box::new(tcb)))
}

/// Handles the arrival of a segment when no connection or listener exists
/// (RFC 793, "If the state is CLOSED"). Produces the RST to send back, if
/// any.
pub fn segment_arrives_closed(
    seg: &TcpHeader,
    text_len: u32,
    local: Ipv4Address,
    remote: Ipv4Address,
) -> Option<TcpHeader> {
    if seg.ctl.rst() {
        return None;
    }

    if seg.ctl.ack() {
        TcpHeaderBuilder::new(seg.dst_port, seg.src_port, seg.ack).rst()
    } else {
        let seg_len = text_len + seg.ctl.syn() as u32 + seg.ctl.fin() as u32;
        TcpHeaderBuilder::new(seg.dst_port, seg.src_port, 0)
            .rst()
            .ack(seg.seq.wrapping_add(seg_len))
    }
    .build(local, remote, [].into_iter(), 0)
    .ok()
}

/// A snapshot of a connection's identifying state, used by live-update to
/// carry established connections across a process restart. Queued data and
/// in-flight timers are not part of the record: the peers' retransmission
/// recovers anything lost around the restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionRecord {
    pub id: Endpoints,
    pub state: State,
    pub snd: SendSequenceSpace,
    pub rcv: ReceiveSequenceSpace,
    pub cwnd: u32,
    pub ssthresh: u32,
    pub ts_recent: u32,
}

impl Tcb {
    pub fn initiation(&self) -> Initiation {
        self.initiation
    }

    /// Exports the connection for live-update.
    pub fn export(&self) -> ConnectionRecord {
        ConnectionRecord {
            id: self.id,
            state: self.state,
            snd: self.snd,
            rcv: self.rcv,
            cwnd: self.reno.cwnd(),
            ssthresh: self.reno.ssthresh(),
            ts_recent: self.ts_recent,
        }
    }

    /// Rebuilds a connection from an exported record. Queues come back
    /// empty and every timer starts from idle.
    pub fn from_record(record: ConnectionRecord, settings: ConnSettings) -> Self {
        let mut tcb = Self::new(
            record.id,
            Initiation::Open,
            record.state,
            record.snd,
            record.rcv,
            settings,
        );
        tcb.reno = Reno::restore(
            tcb.smss() as u32,
            record.cwnd,
            record.ssthresh,
            record.snd.nxt,
        );
        tcb.ts_recent = record.ts_recent;
        tcb.last_ack_sent = record.rcv.nxt;
        tcb.fin_seq = match record.state {
            State::FinWait1 | State::Closing | State::LastAck => {
                Some(record.snd.nxt.wrapping_sub(1))
            }
            _ => None,
        };
        if record.state == State::TimeWait {
            tcb.restart_time_wait();
        }
        tcb
    }
}
