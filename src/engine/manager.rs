//! Connection table and event dispatcher.
//!
//! One `Manager` backs one `Context`: it owns every `Stream` multiplexed
//! onto that context's shared UDP endpoint, keyed by the peer address and
//! uTP connection id pair read off the wire. Its public methods return
//! tagged [`EngineEvent`]s rather than invoking callbacks directly, so the
//! caller (`ContextInner::drain_events`) is the one and only place that
//! touches a `SocketImpl`, keeping the re-entrancy story simple.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::Instant;

use rand::Rng as _;
use slab::Slab;

use super::packet::{Header, PacketType};
use super::stream::{Delivery, Stream, StreamState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(usize);

#[derive(Debug)]
pub enum EngineEvent {
    /// Outbound connect's SYN was answered; `connect`'s completion can
    /// fire.
    Connected(StreamId),
    /// A previously empty reception buffer now has bytes in it.
    DataReady(StreamId),
    /// The peer half-closed: no more data will ever arrive.
    Eof(StreamId),
    /// The stream has torn down completely (reset, both FINs acked, or
    /// the retransmission budget was exhausted) and can be forgotten.
    Destroying(StreamId),
    /// The peer acknowledged enough in-flight data to free up send
    /// window; a parked `write_some` can resume.
    Writable(StreamId),
    /// A SYN passed the firewall predicate and is waiting in
    /// `Manager::pop_accepted`.
    IncomingConnection(StreamId, SocketAddr),
}

/// Outbound wire traffic the caller must hand to the multiplexer. Kept
/// separate from `EngineEvent` since sends don't need `drain_events`
/// dispatch, just a socket write.
pub type Outbox = Vec<(Vec<u8>, SocketAddr)>;

pub struct Manager {
    local: SocketAddr,
    epoch: Instant,
    streams: Slab<Stream>,
    by_key: HashMap<(SocketAddr, u16), StreamId>,
}

impl Manager {
    pub fn new(local: SocketAddr, epoch: Instant) -> Manager {
        Manager {
            local,
            epoch,
            streams: Slab::new(),
            by_key: HashMap::new(),
        }
    }

    pub fn local_endpoint(&self) -> SocketAddr {
        self.local
    }

    fn fresh_conn_id(&self) -> u16 {
        let mut rng = rand::rng();
        loop {
            let id: u16 = rng.random();
            if id != 0 {
                return id;
            }
        }
    }

    /// Registers a new outbound stream to `peer`. Does not send anything
    /// yet; call [`Manager::syn_packet`] to get the SYN bytes.
    pub fn create_outbound(&mut self, peer: SocketAddr) -> StreamId {
        let conn_id = self.fresh_conn_id();
        let stream = Stream::outbound(peer, conn_id);
        let recv_key = (peer, stream.conn_id_recv);
        let id = StreamId(self.streams.insert(stream));
        self.by_key.insert(recv_key, id);
        id
    }

    pub fn syn_packet(&mut self, id: StreamId, now: Instant) -> Vec<u8> {
        let epoch = self.epoch;
        self.streams[id.0].build_syn(now, epoch)
    }

    pub fn peer(&self, id: StreamId) -> SocketAddr {
        self.streams[id.0].peer
    }

    pub fn state(&self, id: StreamId) -> StreamState {
        self.streams[id.0].state
    }

    /// Feeds one inbound datagram (already known to be addressed to this
    /// context's local endpoint) into the connection table. `firewall` is
    /// consulted only for unsolicited SYNs: returning `false` answers
    /// with ST_RESET instead of creating a stream, mirroring the source's
    /// `on_firewall` hook. Returns the events produced and any wire bytes
    /// (acks, resets, SYN-ACKs) that must be sent back.
    pub fn process_udp(
        &mut self,
        data: &[u8],
        from: SocketAddr,
        now: Instant,
        firewall: impl Fn(SocketAddr) -> bool,
    ) -> (Vec<EngineEvent>, Outbox) {
        let mut events = Vec::new();
        let mut outbox = Outbox::new();
        let (header, offset) = match Header::decode(data) {
            Ok(v) => v,
            Err(e) => {
                log::debug!("dropping malformed uTP packet from {}: {}", from, e);
                return (events, outbox);
            }
        };
        let payload = &data[offset..];

        if header.packet_type == PacketType::Syn {
            self.handle_syn(&header, from, now, &firewall, &mut events, &mut outbox);
            return (events, outbox);
        }

        let key = (from, header.connection_id);
        let id = match self.by_key.get(&key).copied() {
            Some(id) => id,
            None => {
                // Unknown connection: answer with a reset, mirroring the
                // original's behaviour for stray traffic instead of
                // silently dropping it.
                let reset = Header {
                    packet_type: PacketType::Reset,
                    connection_id: header.connection_id,
                    timestamp_micros: micros_since(self.epoch, now),
                    timestamp_diff_micros: 0,
                    wnd_size: 0,
                    seq_nr: 0,
                    ack_nr: header.seq_nr,
                };
                outbox.push((reset.encode().to_vec(), from));
                return (events, outbox);
            }
        };

        match header.packet_type {
            PacketType::Reset => {
                events.push(EngineEvent::Destroying(id));
                self.forget(id);
                return (events, outbox);
            }
            PacketType::State => {
                let stream = &mut self.streams[id.0];
                let was_syn_sent = stream.state == StreamState::SynSent;
                let in_flight_before = stream.bytes_in_flight();
                stream.apply_ack(header.ack_nr);
                stream.on_remote_window(header.wnd_size);
                if was_syn_sent && stream.state != StreamState::Closed {
                    stream.state = StreamState::Connected;
                    events.push(EngineEvent::Connected(id));
                }
                if stream.bytes_in_flight() < in_flight_before && stream.window_available() > 0 {
                    events.push(EngineEvent::Writable(id));
                }
                if stream.fin_acked() {
                    events.push(EngineEvent::Destroying(id));
                    self.forget(id);
                }
            }
            PacketType::Data => {
                let stream = &mut self.streams[id.0];
                let had_buffered = stream.has_buffered();
                match stream.receive_data(header.seq_nr, payload) {
                    Delivery::Data(bytes) if !bytes.is_empty() => {
                        stream.push_received(bytes);
                        if !had_buffered {
                            events.push(EngineEvent::DataReady(id));
                        }
                    }
                    _ => {}
                }
                outbox.push((stream.build_ack(now, self.epoch), from));
            }
            PacketType::Fin => {
                let stream = &mut self.streams[id.0];
                if let Delivery::Eof = stream.receive_fin(header.seq_nr) {
                    events.push(EngineEvent::Eof(id));
                }
                outbox.push((stream.build_ack(now, self.epoch), from));
            }
            PacketType::Syn => unreachable!("handled above"),
        }

        (events, outbox)
    }

    fn handle_syn(
        &mut self,
        header: &Header,
        from: SocketAddr,
        now: Instant,
        firewall: &impl Fn(SocketAddr) -> bool,
        events: &mut Vec<EngineEvent>,
        outbox: &mut Outbox,
    ) {
        let key = (from, header.connection_id.wrapping_add(1));
        if self.by_key.contains_key(&key) {
            return; // retransmitted SYN for an already-known connection
        }
        if !firewall(from) {
            let reset = Header {
                packet_type: PacketType::Reset,
                connection_id: header.connection_id,
                timestamp_micros: micros_since(self.epoch, now),
                timestamp_diff_micros: 0,
                wnd_size: 0,
                seq_nr: 0,
                ack_nr: header.seq_nr,
            };
            outbox.push((reset.encode().to_vec(), from));
            return;
        }
        let stream = Stream::inbound(from, header);
        let id = StreamId(self.streams.insert(stream));
        self.by_key.insert(key, id);
        outbox.push((self.streams[id.0].build_ack(now, self.epoch), from));
        events.push(EngineEvent::IncomingConnection(id, from));
    }

    /// Accepts up to `window_available()` bytes of `buf` for sending on
    /// `id`, returning the number of bytes consumed and the encoded
    /// packets to hand to the multiplexer.
    pub fn write(&mut self, id: StreamId, buf: &[u8], now: Instant) -> (usize, Outbox) {
        let epoch = self.epoch;
        let peer = self.streams[id.0].peer;
        let (packets, consumed) = self.streams[id.0].push_data(buf, now, epoch);
        (consumed, packets.into_iter().map(|p| (p, peer)).collect())
    }

    pub fn read_drained(&mut self, id: StreamId) -> Vec<u8> {
        self.streams[id.0].drain_received()
    }

    pub fn eof_delivered(&self, id: StreamId) -> bool {
        self.streams[id.0].eof_delivered
    }

    /// Begins a graceful close: sends FIN, keeps the stream around until
    /// it's acked (or its retries are exhausted) so `check_timeouts` can
    /// still retransmit it.
    pub fn close(&mut self, id: StreamId, now: Instant) -> Outbox {
        let epoch = self.epoch;
        if let Some(stream) = self.streams.get_mut(id.0) {
            if stream.state == StreamState::FinSent || stream.state == StreamState::Closed {
                return Outbox::new();
            }
            let peer = stream.peer;
            let fin = stream.build_fin(now, epoch);
            vec![(fin, peer)]
        } else {
            Outbox::new()
        }
    }

    /// Sends an immediate reset and forgets the stream, used when a
    /// socket is dropped abruptly rather than closed gracefully.
    pub fn reset(&mut self, id: StreamId, now: Instant) -> Outbox {
        let epoch = self.epoch;
        if let Some(stream) = self.streams.get(id.0) {
            let peer = stream.peer;
            let bytes = stream.build_reset(now, epoch);
            self.forget(id);
            vec![(bytes, peer)]
        } else {
            Outbox::new()
        }
    }

    fn forget(&mut self, id: StreamId) {
        if self.streams.contains(id.0) {
            let peer = self.streams[id.0].peer;
            let conn_id_recv = self.streams[id.0].conn_id_recv;
            self.by_key.remove(&(peer, conn_id_recv));
            self.streams.remove(id.0);
        }
    }

    /// Walks every live stream, retransmitting anything past its RTO and
    /// flushing any acks the last `process_udp`/`write` call owed. Returns
    /// the packets to send plus `Destroying` events for connections whose
    /// retransmission budget ran out.
    pub fn check_timeouts(&mut self, now: Instant) -> (Outbox, Vec<EngineEvent>) {
        let mut outbox = Outbox::new();
        let mut events = Vec::new();
        let epoch = self.epoch;
        let dead: Vec<StreamId> = self
            .streams
            .iter_mut()
            .filter_map(|(key, stream)| {
                let peer = stream.peer;
                let (packets, dead) = stream.due_retransmits(now, epoch);
                for p in packets {
                    outbox.push((p, peer));
                }
                if stream.needs_ack() {
                    outbox.push((stream.build_ack(now, epoch), peer));
                }
                if dead {
                    Some(StreamId(key))
                } else {
                    None
                }
            })
            .collect();
        for id in dead {
            events.push(EngineEvent::Destroying(id));
            self.forget(id);
        }
        (outbox, events)
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }
}

fn micros_since(epoch: Instant, now: Instant) -> u32 {
    now.duration_since(epoch).as_micros() as u32
}
