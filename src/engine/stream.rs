//! Per-connection state machine.
//!
//! Kept intentionally small: a fixed-size congestion window and a doubling
//! retransmission timeout stand in for uTP's LEDBAT congestion control,
//! which the spec places out of scope for this adaptation layer.

use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use super::packet::{Header, PacketType, HEADER_LEN};

/// Maximum bytes of payload per outbound packet.
pub const MSS: usize = 1400 - HEADER_LEN;
/// Fixed send/receive window, standing in for real congestion control.
pub const WINDOW: u32 = 64 * 1024;
const INITIAL_RTO: Duration = Duration::from_millis(1000);
const MAX_RTO: Duration = Duration::from_secs(16);
/// After this many consecutive unacked retransmissions of the same
/// packet, the connection is considered dead.
const MAX_RETRIES: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Locally created, SYN not yet sent (no remote known yet).
    Idle,
    SynSent,
    SynRecv,
    Connected,
    FinSent,
    /// Our FIN has been acked, or the peer reset us; nothing left to do
    /// but report `Destroying` once and forget the stream.
    Closed,
}

struct Unacked {
    seq: u16,
    data: Vec<u8>,
    is_fin: bool,
    sent_at: Instant,
    retries: u32,
}

pub struct Stream {
    pub state: StreamState,
    pub peer: SocketAddr,
    pub conn_id_send: u16,
    pub conn_id_recv: u16,
    seq_nr: u16,
    ack_nr: u16,
    peer_wnd: u32,
    unacked: VecDeque<Unacked>,
    reorder: BTreeMap<u16, Vec<u8>>,
    rto: Duration,
    last_sent_ack: u16,
    /// Set once we've delivered `Eof` to the context so we don't repeat it.
    pub eof_delivered: bool,
    /// In-order bytes delivered but not yet drained by the context.
    recv_buffer: Vec<u8>,
}

pub enum Delivery {
    /// Data ready to hand the context, in order.
    Data(Vec<u8>),
    /// The peer's FIN was observed; no more data will ever follow.
    Eof,
    /// Nothing to deliver (a pure ack, a retransmit of something already
    /// seen, or an out-of-order packet stored for later).
    None,
}

impl Stream {
    pub fn outbound(peer: SocketAddr, conn_id_recv: u16) -> Stream {
        Stream {
            state: StreamState::Idle,
            peer,
            conn_id_send: conn_id_recv.wrapping_add(1),
            conn_id_recv,
            seq_nr: 1,
            ack_nr: 0,
            peer_wnd: WINDOW,
            unacked: VecDeque::new(),
            reorder: BTreeMap::new(),
            rto: INITIAL_RTO,
            last_sent_ack: 0,
            eof_delivered: false,
            recv_buffer: Vec::new(),
        }
    }

    pub fn inbound(peer: SocketAddr, syn: &Header) -> Stream {
        Stream {
            state: StreamState::SynRecv,
            peer,
            conn_id_send: syn.connection_id,
            conn_id_recv: syn.connection_id.wrapping_add(1),
            seq_nr: 1,
            ack_nr: syn.seq_nr,
            peer_wnd: WINDOW,
            unacked: VecDeque::new(),
            reorder: BTreeMap::new(),
            rto: INITIAL_RTO,
            last_sent_ack: syn.seq_nr,
            eof_delivered: false,
            recv_buffer: Vec::new(),
        }
    }

    pub fn push_received(&mut self, data: Vec<u8>) {
        self.recv_buffer.extend_from_slice(&data);
    }

    pub fn has_buffered(&self) -> bool {
        !self.recv_buffer.is_empty()
    }

    pub fn drain_received(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.recv_buffer)
    }

    pub fn bytes_in_flight(&self) -> u32 {
        self.unacked.iter().map(|u| u.data.len() as u32).sum()
    }

    pub fn window_available(&self) -> u32 {
        self.peer_wnd.saturating_sub(self.bytes_in_flight())
    }

    fn make_header(&self, packet_type: PacketType, seq_nr: u16, now: Instant, epoch: Instant) -> Header {
        Header {
            packet_type,
            connection_id: match packet_type {
                PacketType::Syn => self.conn_id_recv,
                _ => self.conn_id_send,
            },
            timestamp_micros: now.duration_since(epoch).as_micros() as u32,
            timestamp_diff_micros: 0,
            wnd_size: WINDOW,
            seq_nr,
            ack_nr: self.ack_nr,
        }
    }

    /// Builds the SYN packet and records it as unacked.
    pub fn build_syn(&mut self, now: Instant, epoch: Instant) -> Vec<u8> {
        self.state = StreamState::SynSent;
        let header = self.make_header(PacketType::Syn, self.seq_nr, now, epoch);
        let bytes = header.encode().to_vec();
        self.unacked.push_back(Unacked {
            seq: self.seq_nr,
            data: Vec::new(),
            is_fin: false,
            sent_at: now,
            retries: 0,
        });
        self.seq_nr = self.seq_nr.wrapping_add(1);
        bytes
    }

    /// Builds a pure ST_STATE ack for the current `ack_nr`.
    pub fn build_ack(&mut self, now: Instant, epoch: Instant) -> Vec<u8> {
        self.last_sent_ack = self.ack_nr;
        self.make_header(PacketType::State, self.seq_nr, now, epoch).encode().to_vec()
    }

    pub fn needs_ack(&self) -> bool {
        self.last_sent_ack != self.ack_nr
    }

    /// Accepts up to `window_available()` bytes of `buf`, chunking into
    /// MSS-sized ST_DATA packets. Returns the encoded packets to send and
    /// the number of bytes consumed from `buf`.
    pub fn push_data(&mut self, buf: &[u8], now: Instant, epoch: Instant) -> (Vec<Vec<u8>>, usize) {
        let mut consumed = 0;
        let mut packets = Vec::new();
        let mut budget = self.window_available() as usize;
        while consumed < buf.len() && budget > 0 {
            let take = MSS.min(buf.len() - consumed).min(budget);
            if take == 0 {
                break;
            }
            let chunk = buf[consumed..consumed + take].to_vec();
            let header = self.make_header(PacketType::Data, self.seq_nr, now, epoch);
            let mut packet = header.encode().to_vec();
            packet.extend_from_slice(&chunk);
            self.unacked.push_back(Unacked {
                seq: self.seq_nr,
                data: chunk,
                is_fin: false,
                sent_at: now,
                retries: 0,
            });
            self.seq_nr = self.seq_nr.wrapping_add(1);
            consumed += take;
            budget -= take;
            packets.push(packet);
        }
        (packets, consumed)
    }

    pub fn build_fin(&mut self, now: Instant, epoch: Instant) -> Vec<u8> {
        self.state = StreamState::FinSent;
        let header = self.make_header(PacketType::Fin, self.seq_nr, now, epoch);
        let bytes = header.encode().to_vec();
        self.unacked.push_back(Unacked {
            seq: self.seq_nr,
            data: Vec::new(),
            is_fin: true,
            sent_at: now,
            retries: 0,
        });
        self.seq_nr = self.seq_nr.wrapping_add(1);
        bytes
    }

    pub fn build_reset(&self, now: Instant, epoch: Instant) -> Vec<u8> {
        self.make_header(PacketType::Reset, self.seq_nr, now, epoch).encode().to_vec()
    }

    /// Applies a cumulative ack: every unacked packet with `seq <=
    /// ack_nr` (mod 16-bit wraparound aware only loosely, acceptable for
    /// this minimal engine) is considered delivered.
    pub fn apply_ack(&mut self, ack_nr: u16) {
        self.unacked.retain(|u| seq_gt(u.seq, ack_nr));
        if self.state == StreamState::FinSent && self.unacked.is_empty() {
            self.state = StreamState::Closed;
        }
    }

    pub fn fin_acked(&self) -> bool {
        self.state == StreamState::Closed
    }

    /// Handles an inbound ST_DATA payload, returning data ready for
    /// in-order delivery (possibly draining previously-reordered bytes).
    pub fn receive_data(&mut self, seq_nr: u16, payload: &[u8]) -> Delivery {
        let expected = self.ack_nr.wrapping_add(1);
        if seq_nr == expected {
            self.ack_nr = seq_nr;
            let mut out = payload.to_vec();
            while let Some(next) = self.reorder.remove(&self.ack_nr.wrapping_add(1)) {
                self.ack_nr = self.ack_nr.wrapping_add(1);
                out.extend_from_slice(&next);
            }
            Delivery::Data(out)
        } else if seq_gt(seq_nr, expected) {
            self.reorder.entry(seq_nr).or_insert_with(|| payload.to_vec());
            Delivery::None
        } else {
            // already delivered, a duplicate retransmit; just re-ack
            Delivery::None
        }
    }

    pub fn receive_fin(&mut self, seq_nr: u16) -> Delivery {
        if seq_nr == self.ack_nr.wrapping_add(1) {
            self.ack_nr = seq_nr;
        }
        if self.eof_delivered {
            Delivery::None
        } else {
            self.eof_delivered = true;
            Delivery::Eof
        }
    }

    pub fn on_remote_window(&mut self, wnd_size: u32) {
        self.peer_wnd = wnd_size.max(MSS as u32);
    }

    /// Returns packets due for retransmission (their RTO has elapsed),
    /// doubling the timeout for next time, and reports whether the
    /// connection should be considered dead (too many retries).
    pub fn due_retransmits(&mut self, now: Instant, epoch: Instant) -> (Vec<Vec<u8>>, bool) {
        let mut packets = Vec::new();
        let mut dead = false;
        let rto = self.rto;
        let conn_id_send = self.conn_id_send;
        let conn_id_recv = self.conn_id_recv;
        let ack_nr = self.ack_nr;
        for u in self.unacked.iter_mut() {
            if now.duration_since(u.sent_at) < rto {
                continue;
            }
            if u.retries >= MAX_RETRIES {
                dead = true;
                continue;
            }
            u.retries += 1;
            u.sent_at = now;
            let packet_type = if u.is_fin { PacketType::Fin } else if u.data.is_empty() && u.seq == 1 {
                PacketType::Syn
            } else {
                PacketType::Data
            };
            // Same id mapping as `make_header`: a SYN always carries
            // `conn_id_recv`, everything else `conn_id_send`.
            let connection_id = match packet_type {
                PacketType::Syn => conn_id_recv,
                _ => conn_id_send,
            };
            let header = Header {
                packet_type,
                connection_id,
                timestamp_micros: now.duration_since(epoch).as_micros() as u32,
                timestamp_diff_micros: 0,
                wnd_size: WINDOW,
                seq_nr: u.seq,
                ack_nr,
            };
            let mut packet = header.encode().to_vec();
            packet.extend_from_slice(&u.data);
            packets.push(packet);
        }
        if !packets.is_empty() {
            self.rto = (self.rto * 2).min(MAX_RTO);
        }
        (packets, dead)
    }

    pub fn has_unacked(&self) -> bool {
        !self.unacked.is_empty()
    }
}

/// Sequence-number comparison tolerant of 16-bit wraparound: true if `a`
/// is strictly ahead of `b`.
fn seq_gt(a: u16, b: u16) -> bool {
    a.wrapping_sub(b) != 0 && a.wrapping_sub(b) < 0x8000
}
