//! One connection: a reliable multiplex of streams over a single channel.
//!
//! The connection owns the channel on the datagram layer, performs the
//! channel-id handshake, stamps every outgoing packet with channel sequence
//! numbers, runs a packet-count congestion window, and demultiplexes
//! inbound stream packets to the streams it owns. Handshake packets are the
//! only data retransmitted at this level; everything else is re-queued by
//! the streams above when their own timeouts fire.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use rand::RngExt;
use tokio::time::Instant;

use crate::datagram::DatagramLayer;
use crate::endpoint::{Endpoint, EndpointId};
use crate::error::{Result, SstError};
use crate::manager::ConnectionVariables;
use crate::packet::{ChannelHeader, StreamHeader, StreamPacketType, FLAG_CONTINUES};
use crate::rtt::RtoEstimator;
use crate::strand::ServiceTimer;
use crate::stream::{
    Lsid, Stream, StreamListenCallback, StreamReturnCallback, Usid,
};

/// Largest payload carried by one channel packet.
pub(crate) const MAX_PAYLOAD_SIZE: usize = 1300;
/// Largest payload carried by one datagram fragment.
pub(crate) const MAX_DATAGRAM_SIZE: usize = 1000;
/// Channel send-queue budget in segments.
pub(crate) const MAX_QUEUED_SEGMENTS: usize = 3000;
/// Handshake packet retransmission cap.
const HANDSHAKE_RETRY_LIMIT: u32 = 5;
/// Initial reserve for the variable-size datagram header, and the increment
/// applied when a serialized fragment still comes out oversized.
const DATAGRAM_HEADER_RESERVE: usize = 28;
const DATAGRAM_HEADER_RESERVE_STEP: usize = 10;
/// How often the connection checks whether any streams are left.
const LIVENESS_INTERVAL: Duration = Duration::from_secs(300);

/// One-shot callback reporting the outcome of a connection attempt.
pub type ConnectionReturnCallback<E> =
    Box<dyn FnOnce(std::result::Result<Arc<Connection<E>>, SstError>) + Send>;
/// Callback invoked with each complete datagram received on a port.
pub type ReadDatagramCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;
/// Completion callback for `Connection::datagram`; gets the outcome and the
/// buffer back.
pub type DatagramSendDoneCallback =
    Box<dyn FnOnce(std::result::Result<(), SstError>, Bytes) + Send>;

/// Connection state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No network connectivity: never connected, or fully torn down.
    Disconnected,
    /// Initiator side of the channel handshake in progress.
    PendingConnect,
    /// Acceptor received the channel request; negotiation not finished.
    PendingReceiveConnect,
    /// Connected to the remote endpoint.
    Connected,
    /// Graceful disconnect in progress.
    PendingDisconnect,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::PendingConnect => write!(f, "PendingConnect"),
            ConnectionState::PendingReceiveConnect => write!(f, "PendingReceiveConnect"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::PendingDisconnect => write!(f, "PendingDisconnect"),
        }
    }
}

/// One channel packet, queued and then in flight.
pub(crate) struct ChannelSegment {
    payload: Bytes,
    channel_seq: u64,
    ack_seq: u64,
    transmit_time: Mutex<Option<Instant>>,
    ack_time: Mutex<Option<Instant>>,
}

impl ChannelSegment {
    fn new(payload: Bytes, channel_seq: u64, ack_seq: u64) -> Self {
        Self {
            payload,
            channel_seq,
            ack_seq,
            transmit_time: Mutex::new(None),
            ack_time: Mutex::new(None),
        }
    }
}

struct ChannelTx {
    queued: VecDeque<Arc<ChannelSegment>>,
    transmit_seq: u64,
}

struct ChannelFlight {
    outstanding: VecDeque<Arc<ChannelSegment>>,
    /// Congestion window in packets, never below 1.
    cwnd: u32,
    rto: RtoEstimator,
    /// Handshake packet send attempts (initiator only).
    init_attempts: u32,
}

struct StreamTables<E: EndpointId> {
    outgoing: BTreeMap<Lsid, Arc<Stream<E>>>,
    incoming: BTreeMap<Lsid, Arc<Stream<E>>>,
    listening: HashMap<u16, StreamListenCallback<E>>,
    datagram_readers: HashMap<u16, Vec<ReadDatagramCallback>>,
    /// CONTINUES fragments buffered per datagram LSID.
    partial_datagrams: HashMap<Lsid, Vec<Bytes>>,
    next_lsid: Lsid,
}

struct ServiceSlot<E: EndpointId> {
    strong: Option<Arc<Connection<E>>>,
    is_async: bool,
}

/// A reliable multiplex of many [`Stream`]s over one channel.
pub struct Connection<E: EndpointId> {
    local_endpoint: Endpoint<E>,
    remote_endpoint: Mutex<Endpoint<E>>,
    vars: Arc<ConnectionVariables<E>>,
    layer: Arc<dyn DatagramLayer<E>>,

    state: Mutex<ConnectionState>,
    local_channel: AtomicU32,
    remote_channel: AtomicU32,
    /// Last transmit seqno received from the peer that was fully handled.
    last_received_seq: AtomicU64,
    in_sending_mode: AtomicBool,
    listener_registered: AtomicBool,

    tx: Mutex<ChannelTx>,
    flight: Mutex<ChannelFlight>,
    streams: Mutex<StreamTables<E>>,

    sched: Mutex<ServiceSlot<E>>,
    service_timer: Arc<ServiceTimer>,
    alive_timer: Arc<ServiceTimer>,
    weak_self: Weak<Connection<E>>,
}

impl<E: EndpointId> Connection<E> {
    fn create(
        vars: &Arc<ConnectionVariables<E>>,
        local_endpoint: Endpoint<E>,
        remote_endpoint: Endpoint<E>,
    ) -> Result<Arc<Self>> {
        let layer = vars
            .datagram_layer(&local_endpoint.id)
            .ok_or(SstError::NoDatagramLayer)?;
        let strand = vars.strand();

        let conn = Arc::new_cyclic(|weak: &Weak<Connection<E>>| Connection {
            local_endpoint,
            remote_endpoint: Mutex::new(remote_endpoint),
            vars: Arc::clone(vars),
            layer,
            state: Mutex::new(ConnectionState::Disconnected),
            local_channel: AtomicU32::new(0),
            remote_channel: AtomicU32::new(0),
            last_received_seq: AtomicU64::new(1),
            in_sending_mode: AtomicBool::new(true),
            listener_registered: AtomicBool::new(false),
            tx: Mutex::new(ChannelTx {
                queued: VecDeque::new(),
                transmit_seq: 1,
            }),
            flight: Mutex::new(ChannelFlight {
                outstanding: VecDeque::new(),
                cwnd: 1,
                rto: RtoEstimator::new(),
                init_attempts: 0,
            }),
            streams: Mutex::new(StreamTables {
                outgoing: BTreeMap::new(),
                incoming: BTreeMap::new(),
                listening: HashMap::new(),
                datagram_readers: HashMap::new(),
                partial_datagrams: HashMap::new(),
                next_lsid: 0,
            }),
            sched: Mutex::new(ServiceSlot {
                strong: None,
                is_async: false,
            }),
            service_timer: ServiceTimer::new(Arc::clone(&strand)),
            alive_timer: ServiceTimer::new(strand),
            weak_self: weak.clone(),
        });

        let weak = conn.weak_self.clone();
        conn.service_timer.set_callback(move || {
            if let Some(c) = weak.upgrade() {
                c.service();
            }
        });
        let weak = conn.weak_self.clone();
        conn.alive_timer.set_callback(move || {
            if let Some(c) = weak.upgrade() {
                c.check_alive();
            }
        });

        let weak = conn.weak_self.clone();
        let listened = conn.layer.listen(
            &conn.local_endpoint,
            Box::new(move |_src, data| {
                if let Some(c) = weak.upgrade() {
                    c.receive_raw(data);
                }
            }),
        );
        if !listened {
            return Err(SstError::EndpointInUse(conn.local_endpoint.to_string()));
        }
        conn.listener_registered.store(true, Ordering::Release);
        conn.alive_timer.wait(LIVENESS_INTERVAL);

        Ok(conn)
    }

    /// Initiate a connection to `remote_endpoint`: allocate a local channel
    /// id and send it to the peer's setup channel, retrying with backoff.
    /// The callback fires once the handshake completes or is given up on.
    pub(crate) fn create_connection(
        vars: &Arc<ConnectionVariables<E>>,
        local_endpoint: Endpoint<E>,
        remote_endpoint: Endpoint<E>,
        cb: ConnectionReturnCallback<E>,
    ) -> Result<()> {
        let occupied = {
            let tables = vars.tables.lock();
            tables.connections.contains_key(&local_endpoint)
        };
        if occupied {
            tracing::warn!(endpoint = %local_endpoint, "local endpoint already has a connection");
            cb(Err(SstError::EndpointInUse(local_endpoint.to_string())));
            return Err(SstError::EndpointInUse(local_endpoint.to_string()));
        }

        if vars.datagram_layer(&local_endpoint.id).is_none() {
            cb(Err(SstError::NoDatagramLayer));
            return Err(SstError::NoDatagramLayer);
        }

        let channel = vars.available_channel(&local_endpoint.id);
        if channel == 0 {
            cb(Err(SstError::NoChannelAvailable));
            return Err(SstError::NoChannelAvailable);
        }

        let conn = match Connection::create(vars, local_endpoint.clone(), remote_endpoint) {
            Ok(conn) => conn,
            Err(e) => {
                vars.release_channel(&local_endpoint.id, u32::from(channel));
                cb(Err(SstError::EndpointInUse(local_endpoint.to_string())));
                return Err(e);
            }
        };

        {
            let mut tables = vars.tables.lock();
            tables
                .connections
                .insert(local_endpoint.clone(), Arc::clone(&conn));
            tables.connection_callbacks.insert(local_endpoint, cb);
        }

        *conn.state.lock() = ConnectionState::PendingConnect;
        conn.local_channel.store(u32::from(channel), Ordering::Release);

        let mut payload = BytesMut::with_capacity(4);
        payload.put_u32(u32::from(channel));
        conn.send_data_with_auto_ack(payload.freeze());
        Ok(())
    }

    /// Inbound dispatch for datagrams arriving at a listened endpoint:
    /// route to the owning connection, or run the accept half of the
    /// channel handshake for setup-channel packets.
    pub(crate) fn handle_receive(
        vars: &Arc<ConnectionVariables<E>>,
        remote_endpoint: Endpoint<E>,
        local_endpoint: Endpoint<E>,
        data: &[u8],
    ) {
        let header = match ChannelHeader::decode(data) {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!(error = %e, "dropping undecodable channel packet");
                return;
            }
        };

        let existing = {
            let tables = vars.tables.lock();
            tables.connections.get(&local_endpoint).cloned()
        };
        if let Some(conn) = existing {
            if header.channel_id == 0 {
                tracing::info!(endpoint = %local_endpoint, "setup request for an occupied endpoint");
                return;
            }
            conn.receive_message(&header);
            return;
        }

        if header.channel_id != 0 {
            return;
        }

        // New channel negotiation request: allocate a channel, pick the
        // local port to match it, and reply with both.
        let listen_cb = {
            let tables = vars.tables.lock();
            tables.listening.get(&local_endpoint).cloned()
        };
        let Some(listen_cb) = listen_cb else {
            tracing::warn!(endpoint = %local_endpoint, "no listener for incoming connection");
            return;
        };

        let channel = vars.available_channel(&local_endpoint.id);
        if channel == 0 {
            tracing::warn!(endpoint = %local_endpoint, "no free channel for incoming connection");
            return;
        }
        // The channel id is unique within the same 16-bit space as ports,
        // so it doubles as the local port.
        let new_local = Endpoint::new(local_endpoint.id.clone(), channel);

        let conn = match Connection::create(vars, new_local.clone(), remote_endpoint) {
            Ok(conn) => conn,
            Err(e) => {
                vars.release_channel(&local_endpoint.id, u32::from(channel));
                tracing::warn!(error = %e, "failed to set up accepted connection");
                return;
            }
        };

        conn.listen_stream(new_local.port, listen_cb);
        {
            let mut tables = vars.tables.lock();
            tables.connections.insert(new_local.clone(), Arc::clone(&conn));
        }

        conn.local_channel.store(u32::from(channel), Ordering::Release);
        if header.payload.len() >= 4 {
            let remote_channel = (&header.payload[0..4]).get_u32();
            conn.remote_channel.store(remote_channel, Ordering::Release);
        }
        *conn.state.lock() = ConnectionState::PendingReceiveConnect;

        let mut payload = BytesMut::with_capacity(8);
        payload.put_u32(u32::from(channel));
        payload.put_u32(u32::from(new_local.port));
        conn.send_data(payload.freeze(), false, header.transmit_seq);
    }

    // ------------------------------------------------------------------
    // Public API
    // ------------------------------------------------------------------

    /// Open a top-level stream on this connection, queuing `initial` with
    /// the stream handshake. Returns the number of bytes buffered; the
    /// callback reports the created stream or the failure.
    pub fn open_stream(
        self: &Arc<Self>,
        initial: &[u8],
        local_port: u16,
        remote_port: u16,
        cb: Option<StreamReturnCallback<E>>,
    ) -> usize {
        self.open_substream(initial, local_port, remote_port, 0, cb)
    }

    pub(crate) fn open_substream(
        self: &Arc<Self>,
        initial: &[u8],
        local_port: u16,
        remote_port: u16,
        parent_lsid: Lsid,
        cb: Option<StreamReturnCallback<E>>,
    ) -> usize {
        let usid = new_usid();
        let lsid = self.next_lsid();
        let stream = Stream::create(
            parent_lsid,
            self,
            local_port,
            remote_port,
            usid,
            lsid,
            cb,
            Arc::clone(&self.vars),
        );
        let buffered = stream.init(initial, false, 0, 0);
        self.streams.lock().outgoing.insert(lsid, stream);
        buffered
    }

    /// Send a best-effort datagram, fragmented as needed. Fragments ride the
    /// normal channel queue but are not retransmitted; delivery is not
    /// guaranteed. The callback reports whether the datagram was queued.
    pub fn datagram(
        self: &Arc<Self>,
        data: Bytes,
        src_port: u16,
        dst_port: u16,
        cb: Option<DatagramSendDoneCallback>,
    ) -> Result<()> {
        let state = *self.state.lock();
        if state == ConnectionState::Disconnected || state == ConnectionState::PendingDisconnect {
            if let Some(cb) = cb {
                cb(Err(SstError::ConnectionClosed), data);
            }
            return Err(SstError::ConnectionClosed);
        }

        let lsid = self.next_lsid();
        let mut offset = 0usize;
        while offset < data.len() {
            // The header is variable size, so the fragment budget is a
            // guess. Start with the usual reserve and shrink the payload if
            // the serialized packet still comes out over the limit.
            let mut header_reserve = DATAGRAM_HEADER_RESERVE;
            loop {
                let room = (MAX_PAYLOAD_SIZE - header_reserve).min(MAX_DATAGRAM_SIZE);
                let remaining = data.len() - offset;
                let (fragment_len, continues) = if remaining > room {
                    (room, true)
                } else {
                    (remaining, false)
                };

                let header = StreamHeader {
                    lsid,
                    packet_type: StreamPacketType::Datagram,
                    flags: if continues { FLAG_CONTINUES } else { 0 },
                    window: 10,
                    src_port,
                    dest_port: dst_port,
                    psid: 0,
                    rsid: 0,
                    bsn: 0,
                    payload: data.slice(offset..offset + fragment_len),
                };
                let encoded = header.encode();
                if encoded.len() > MAX_PAYLOAD_SIZE {
                    header_reserve += DATAGRAM_HEADER_RESERVE_STEP;
                    continue;
                }

                self.send_data_with_auto_ack(encoded);
                offset += fragment_len;
                break;
            }
        }

        if let Some(cb) = cb {
            cb(Ok(()), data);
        }
        Ok(())
    }

    /// Register a callback for datagrams addressed to `port`. Multiple
    /// readers per port are allowed; each gets every datagram.
    pub fn register_datagram_reader(&self, port: u16, cb: ReadDatagramCallback) {
        self.streams
            .lock()
            .datagram_readers
            .entry(port)
            .or_default()
            .push(cb);
    }

    /// Accept streams that connect to `port` on this connection.
    pub fn listen_stream(&self, port: u16, cb: StreamListenCallback<E>) {
        self.streams.lock().listening.insert(port, cb);
    }

    pub fn unlisten_stream(&self, port: u16) {
        self.streams.lock().listening.remove(&port);
    }

    pub fn local_endpoint(&self) -> Endpoint<E> {
        self.local_endpoint.clone()
    }

    pub fn remote_endpoint(&self) -> Endpoint<E> {
        self.remote_endpoint.lock().clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Close the connection.
    ///
    /// With `force` the connection is torn down immediately; otherwise it
    /// drains queued packets first. Returns without synchronizing with the
    /// remote endpoint either way.
    pub fn close(&self, force: bool) {
        let mut tables = self.vars.tables.lock();
        let dropped = self.i_close(force, &mut tables);
        drop(tables);
        drop(dropped);
    }

    /// Non-locking half of `close`; the registry lock is held by the
    /// caller. Returns the registry's reference so the caller can drop it
    /// after releasing the lock.
    fn i_close(
        &self,
        force: bool,
        tables: &mut crate::manager::RegistryTables<E>,
    ) -> Option<Arc<Connection<E>>> {
        self.alive_timer.cancel();

        let mut dropped = None;
        if force && *self.state.lock() != ConnectionState::Disconnected {
            dropped = tables.connections.remove(&self.local_endpoint);
        }
        *self.state.lock() = if force {
            ConnectionState::Disconnected
        } else {
            ConnectionState::PendingDisconnect
        };
        dropped
    }

    /// Quiescent shutdown: ask every stream to stop and drop the liveness
    /// timer. Not a close; the service keeps running until streams drain.
    pub(crate) fn stop(&self) {
        let streams: Vec<Arc<Stream<E>>> = {
            let tables = self.streams.lock();
            tables
                .incoming
                .values()
                .chain(tables.outgoing.values())
                .cloned()
                .collect()
        };
        // A stream can appear in both maps; stopping twice is harmless.
        for stream in streams {
            stream.stop();
        }
        self.alive_timer.cancel();
    }

    /// Tear-down bookkeeping shared by every shutdown path: release the
    /// endpoint, and for a connection that never got connected, fail the
    /// pending creation callback.
    pub(crate) fn cleanup(conn: Arc<Connection<E>>) {
        conn.alive_timer.cancel();
        conn.unlisten_self();

        let state = *conn.state.lock();
        if state == ConnectionState::PendingConnect || state == ConnectionState::Disconnected {
            let (cb, registry_ref) = {
                let mut tables = conn.vars.tables.lock();
                let cb = tables.connection_callbacks.remove(&conn.local_endpoint);
                let registry_ref = tables.connections.remove(&conn.local_endpoint);
                (cb, registry_ref)
            };
            if state == ConnectionState::PendingConnect {
                if let Some(cb) = cb {
                    cb(Err(SstError::HandshakeFailed));
                }
            }
            *conn.state.lock() = ConnectionState::Disconnected;
            drop(registry_ref);
        }
    }

    // ------------------------------------------------------------------
    // Internals shared with Stream
    // ------------------------------------------------------------------

    pub(crate) fn next_lsid(&self) -> Lsid {
        let mut tables = self.streams.lock();
        tables.next_lsid += 1;
        tables.next_lsid
    }

    /// Queue a packet with ack info pointing at the last fully handled
    /// inbound seqno. Returns the channel seqno consumed.
    pub(crate) fn send_data_with_auto_ack(self: &Arc<Self>, data: Bytes) -> u64 {
        let ack_seq = self.last_received_seq.load(Ordering::Acquire);
        self.send_data(data, false, ack_seq)
    }

    /// Send or queue one channel payload. Acks bypass the queue and go out
    /// immediately; anything else is queued for the service loop, and
    /// silently dropped when the queue budget is exhausted (the stream
    /// layer's retransmission recovers the data). Every call consumes a
    /// channel seqno.
    pub(crate) fn send_data(self: &Arc<Self>, data: Bytes, is_ack: bool, ack_seq: u64) -> u64 {
        debug_assert!(data.len() <= MAX_PAYLOAD_SIZE);
        let mut tx = self.tx.lock();
        let seq = tx.transmit_seq;
        let mut queued = false;

        if is_ack {
            let header = ChannelHeader {
                channel_id: self.remote_channel.load(Ordering::Acquire),
                transmit_seq: seq,
                ack_count: 1,
                ack_seq,
                payload: data,
            };
            self.send_channel_packet(&header);
        } else if tx.queued.len() < MAX_QUEUED_SEGMENTS {
            tx.queued
                .push_back(Arc::new(ChannelSegment::new(data, seq, ack_seq)));
            queued = true;
        }
        tx.transmit_seq += 1;
        drop(tx);

        if queued {
            // Only kick servicing when the window has room; otherwise the
            // running timeout cycle will pick the packet up.
            let can_send = {
                let flight = self.flight.lock();
                flight.outstanding.len() as u32 <= flight.cwnd
            };
            if can_send {
                self.in_sending_mode.store(true, Ordering::Release);
                self.schedule_service_now();
            }
        }
        seq
    }

    /// Remove a stream that has disconnected; the connection force-closes
    /// once its last stream is gone.
    pub(crate) fn erase_disconnected_stream(&self, lsid: Lsid, remote_lsid: Option<Lsid>) {
        let now_empty = {
            let mut tables = self.streams.lock();
            tables.outgoing.remove(&lsid);
            if let Some(remote) = remote_lsid {
                tables.incoming.remove(&remote);
            }
            tables.outgoing.is_empty() && tables.incoming.is_empty()
        };
        if now_empty {
            self.close(true);
        }
    }

    // ------------------------------------------------------------------
    // Inbound path
    // ------------------------------------------------------------------

    fn receive_raw(self: &Arc<Self>, data: &[u8]) {
        match ChannelHeader::decode(data) {
            Ok(header) => self.receive_message(&header),
            Err(e) => tracing::warn!(error = %e, "dropping undecodable channel packet"),
        }
    }

    pub(crate) fn receive_message(self: &Arc<Self>, header: &ChannelHeader) {
        self.mark_acknowledged_packet(header.ack_seq);

        let seq = header.transmit_seq;
        let state = *self.state.lock();
        let mut handled = false;

        match state {
            ConnectionState::PendingConnect => {
                *self.state.lock() = ConnectionState::Connected;

                if header.payload.len() >= 8 {
                    let mut payload = &header.payload[..];
                    let remote_channel = payload.get_u32();
                    let remote_port = payload.get_u32();
                    self.remote_channel.store(remote_channel, Ordering::Release);
                    self.remote_endpoint.lock().port = remote_port as u16;
                }

                // Ack the reply with an empty packet so the acceptor can
                // finish its half of the handshake.
                self.send_data(Bytes::new(), false, seq);

                let (cb, conn) = {
                    let mut tables = self.vars.tables.lock();
                    let cb = tables.connection_callbacks.remove(&self.local_endpoint);
                    let conn = tables.connections.get(&self.local_endpoint).cloned();
                    (cb, conn)
                };
                if let (Some(cb), Some(conn)) = (cb, conn) {
                    cb(Ok(conn));
                }
                handled = true;
            }
            ConnectionState::PendingReceiveConnect => {
                *self.state.lock() = ConnectionState::Connected;
                handled = true;
            }
            ConnectionState::Connected => {
                handled = if header.payload.is_empty() {
                    true
                } else {
                    self.parse_packet(header)
                };
            }
            _ => {}
        }

        // Only advance the acked seqno for fully handled packets, so we
        // never acknowledge data the peer would then be obliged to forget
        // (e.g. a data packet dropped for falling outside the window).
        if handled {
            self.last_received_seq.store(seq, Ordering::Release);
        }
    }

    fn parse_packet(self: &Arc<Self>, header: &ChannelHeader) -> bool {
        let stream_header = match StreamHeader::decode(&header.payload) {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!(error = %e, "dropping undecodable stream packet");
                return false;
            }
        };
        match stream_header.packet_type {
            StreamPacketType::Init => {
                self.handle_init_packet(header, &stream_header);
                true
            }
            StreamPacketType::Reply => {
                self.handle_reply_packet(header, &stream_header);
                true
            }
            StreamPacketType::Data => self.handle_data_packet(header, &stream_header),
            StreamPacketType::Ack => {
                self.handle_ack_packet(header, &stream_header);
                true
            }
            StreamPacketType::Datagram => {
                self.handle_datagram(header, &stream_header);
                true
            }
        }
    }

    fn handle_init_packet(self: &Arc<Self>, header: &ChannelHeader, stream_header: &StreamHeader) {
        let incoming_lsid = stream_header.lsid;

        let existing = self.streams.lock().incoming.get(&incoming_lsid).cloned();
        if let Some(stream) = existing {
            // Retransmitted INIT for a stream we already accepted: the peer
            // missed our REPLY, so repeat it without payload.
            stream.send_reply_packet(&[], incoming_lsid, header.transmit_seq);
            return;
        }

        let listen_cb = self
            .streams
            .lock()
            .listening
            .get(&stream_header.dest_port)
            .cloned();
        let Some(listen_cb) = listen_cb else {
            tracing::warn!(
                endpoint = %self.local_endpoint,
                port = stream_header.dest_port,
                "not listening for streams on this port"
            );
            return;
        };

        let usid = new_usid();
        let lsid = self.next_lsid();
        let stream = Stream::create(
            stream_header.psid,
            self,
            stream_header.dest_port,
            stream_header.src_port,
            usid,
            lsid,
            None,
            Arc::clone(&self.vars),
        );
        stream.init(&[], true, incoming_lsid, header.transmit_seq);

        {
            let mut tables = self.streams.lock();
            tables.outgoing.insert(lsid, Arc::clone(&stream));
            tables.incoming.insert(incoming_lsid, Arc::clone(&stream));
        }

        listen_cb(Ok(Arc::clone(&stream)));

        stream.receive_data(stream_header, header.transmit_seq);
        stream.receive_ack(stream_header, header.ack_seq);
    }

    fn handle_reply_packet(&self, header: &ChannelHeader, stream_header: &StreamHeader) {
        let incoming_lsid = stream_header.lsid;
        {
            let tables = self.streams.lock();
            if tables.incoming.contains_key(&incoming_lsid) {
                return;
            }
        }

        let initiating_lsid = stream_header.rsid;
        let stream = self.streams.lock().outgoing.get(&initiating_lsid).cloned();
        let Some(stream) = stream else {
            tracing::debug!(lsid = initiating_lsid, "reply for unknown stream");
            return;
        };

        self.streams
            .lock()
            .incoming
            .insert(incoming_lsid, Arc::clone(&stream));
        stream.init_remote_lsid(incoming_lsid);

        if let Some(cb) = stream.take_creation_callback() {
            cb(Ok(Arc::clone(&stream)));
            stream.receive_data(stream_header, header.transmit_seq);
            stream.receive_ack(stream_header, header.ack_seq);
        }
    }

    fn handle_data_packet(&self, header: &ChannelHeader, stream_header: &StreamHeader) -> bool {
        let stream = self
            .streams
            .lock()
            .incoming
            .get(&stream_header.lsid)
            .cloned();
        match stream {
            Some(stream) => {
                let stored = stream.receive_data(stream_header, header.transmit_seq);
                stream.receive_ack(stream_header, header.ack_seq);
                stored
            }
            // Data for a stream we know nothing about: treat as handled so
            // the connection keeps making progress.
            None => true,
        }
    }

    fn handle_ack_packet(&self, header: &ChannelHeader, stream_header: &StreamHeader) {
        let stream = self
            .streams
            .lock()
            .incoming
            .get(&stream_header.lsid)
            .cloned();
        if let Some(stream) = stream {
            stream.receive_ack(stream_header, header.ack_seq);
        }
    }

    fn handle_datagram(self: &Arc<Self>, header: &ChannelHeader, stream_header: &StreamHeader) {
        if stream_header.flags & FLAG_CONTINUES != 0 {
            // More fragments coming; buffer this one under the datagram's
            // LSID.
            self.streams
                .lock()
                .partial_datagrams
                .entry(stream_header.lsid)
                .or_default()
                .push(stream_header.payload.clone());
        } else {
            let (readers, partial) = {
                let mut tables = self.streams.lock();
                let readers = tables
                    .datagram_readers
                    .get(&stream_header.dest_port)
                    .cloned()
                    .unwrap_or_default();
                let partial = tables.partial_datagrams.remove(&stream_header.lsid);
                (readers, partial)
            };

            let payload: Bytes = match partial {
                Some(fragments) => {
                    let total = fragments.iter().map(Bytes::len).sum::<usize>()
                        + stream_header.payload.len();
                    let mut assembled = BytesMut::with_capacity(total);
                    for fragment in &fragments {
                        assembled.put_slice(fragment);
                    }
                    assembled.put_slice(&stream_header.payload);
                    assembled.freeze()
                }
                None => stream_header.payload.clone(),
            };

            for reader in &readers {
                reader(&payload);
            }
        }

        // Ack the fragment directly; datagrams have no stream to do it.
        let mut tx = self.tx.lock();
        let ack = ChannelHeader {
            channel_id: self.remote_channel.load(Ordering::Acquire),
            transmit_seq: tx.transmit_seq,
            ack_count: 1,
            ack_seq: header.transmit_seq,
            payload: Bytes::new(),
        };
        self.send_channel_packet(&ack);
        tx.transmit_seq += 1;
    }

    /// Match an inbound ack against the in-flight list: sample the RTO,
    /// grow the window with probability 1/cwnd, and resume sending if
    /// anything is queued.
    fn mark_acknowledged_packet(self: &Arc<Self>, acked_seq: u64) {
        let now = Instant::now();
        let mut flight = self.flight.lock();

        let Some(index) = flight
            .outstanding
            .iter()
            .position(|s| s.channel_seq == acked_seq)
        else {
            return;
        };
        let segment = flight
            .outstanding
            .remove(index)
            .expect("index from position");
        *segment.ack_time.lock() = Some(now);

        let transmit_time = *segment.transmit_time.lock();
        if let Some(t) = transmit_time {
            flight.rto.sample(now.duration_since(t));
        }

        let cwnd = flight.cwnd;
        if rand::rng().random_range(0..cwnd) == 0 {
            flight.cwnd += 1;
        }
        drop(flight);

        // Window space freed; push more data if any is waiting.
        if !self.tx.lock().queued.is_empty() {
            self.in_sending_mode.store(true, Ordering::Release);
            self.schedule_service_now();
        }
    }

    // ------------------------------------------------------------------
    // Service loop
    // ------------------------------------------------------------------

    fn service(self: &Arc<Self>) {
        let Some(conn) = self.starting_service() else {
            return;
        };
        let now = Instant::now();
        let mut flight = self.flight.lock();
        let state = *self.state.lock();

        // During setup the handshake packet stays queued and we never leave
        // sending mode, so outstanding copies of it are just noise.
        if state == ConnectionState::PendingConnect {
            flight.outstanding.clear();
        }

        if state == ConnectionState::Disconnected {
            drop(flight);
            Connection::cleanup(conn);
            return;
        }
        if state == ConnectionState::PendingDisconnect {
            let queue_empty = self.tx.lock().queued.is_empty();
            if queue_empty {
                *self.state.lock() = ConnectionState::Disconnected;
                drop(flight);
                Connection::cleanup(conn);
                return;
            }
        }

        // Two modes: sending (queue has packets and the window has room) or
        // waiting for acks. In the latter, the only interesting event is a
        // timeout telling us the in-flight packets are probably gone.
        if self.in_sending_mode.load(Ordering::Acquire) {
            let mut tx = self.tx.lock();
            while !tx.queued.is_empty() && flight.outstanding.len() as u32 <= flight.cwnd {
                // Setup retries exhausted: stop resending and let the
                // timeout path report the unreachable endpoint.
                if state == ConnectionState::PendingConnect
                    && flight.init_attempts >= HANDSHAKE_RETRY_LIMIT
                {
                    self.in_sending_mode.store(false, Ordering::Release);
                    tx.queued.pop_front();
                    break;
                }

                let segment = Arc::clone(tx.queued.front().expect("non-empty queue"));
                let header = ChannelHeader {
                    channel_id: self.remote_channel.load(Ordering::Acquire),
                    transmit_seq: segment.channel_seq,
                    ack_count: 1,
                    ack_seq: segment.ack_seq,
                    payload: segment.payload.clone(),
                };
                self.send_channel_packet(&header);

                *segment.transmit_time.lock() = Some(now);
                flight.outstanding.push_back(segment);

                // During setup the handshake packet is left at the head of
                // the queue so the timeout path resends it; the attempt
                // counter caps how long that goes on.
                if state != ConnectionState::PendingConnect {
                    self.in_sending_mode.store(false, Ordering::Release);
                    tx.queued.pop_front();
                }
                if state == ConnectionState::PendingConnect {
                    flight.init_attempts += 1;
                    break;
                }
            }
            drop(tx);

            let rto = flight.rto.rto();
            let attempts = flight.init_attempts;
            drop(flight);

            if state == ConnectionState::PendingConnect {
                if self.in_sending_mode.load(Ordering::Acquire) {
                    // Backoff for RTTs longer than the initial guess; the
                    // counter was already incremented, so attempt n waits
                    // RTO * 2^(n-1).
                    let factor = 2u32.pow(attempts.saturating_sub(1).min(16));
                    self.schedule_service(rto * factor);
                } else {
                    // All attempts used; fail the connect without waiting
                    // out another backoff period.
                    self.schedule_service_now();
                }
            } else {
                self.schedule_service(rto * 2);
            }
        } else {
            // A timeout got us here.
            if state == ConnectionState::PendingConnect {
                // Setup retries exhausted; the other endpoint is
                // unreachable.
                drop(flight);
                Connection::cleanup(conn);
                return;
            }

            if !flight.outstanding.is_empty() {
                flight.cwnd = (flight.cwnd / 2).max(1);
                // The data is not lost: streams re-queue their unacked
                // buffers on their own timeout.
                flight.outstanding.clear();
            }
            drop(flight);

            if !self.tx.lock().queued.is_empty() {
                self.in_sending_mode.store(true, Ordering::Release);
                self.schedule_service_now();
            }
        }
    }

    fn check_alive(self: &Arc<Self>) {
        let no_streams = {
            let tables = self.streams.lock();
            tables.outgoing.is_empty() && tables.incoming.is_empty()
        };
        if no_streams {
            self.close(true);
            return;
        }
        self.alive_timer.wait(LIVENESS_INTERVAL);
    }

    fn send_channel_packet(&self, header: &ChannelHeader) {
        if *self.state.lock() == ConnectionState::Disconnected {
            return;
        }
        let remote = self.remote_endpoint.lock().clone();
        self.layer.send(&self.local_endpoint, &remote, &header.encode());
    }

    fn unlisten_self(&self) {
        if self.listener_registered.swap(false, Ordering::AcqRel) {
            self.layer.unlisten(&self.local_endpoint);
        }
    }

    // ------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------

    pub(crate) fn schedule_service_now(self: &Arc<Self>) {
        self.schedule_service(Duration::ZERO);
    }

    /// Coalescing scheduler: at most one servicing pending, rescheduling
    /// earlier cancels and rearms, rescheduling later is a no-op. A strong
    /// self-reference is parked for the duration so the connection cannot
    /// be freed with servicing outstanding.
    fn schedule_service(self: &Arc<Self>, after: Duration) {
        let mut sched = self.sched.lock();
        let mut needs_scheduling = sched.strong.is_none();
        if !needs_scheduling && !sched.is_async {
            if let Some(expires) = self.service_timer.expires_in() {
                if expires > after {
                    self.service_timer.cancel();
                    needs_scheduling = true;
                }
            }
        }
        if needs_scheduling {
            sched.strong = Some(Arc::clone(self));
            if after.is_zero() {
                sched.is_async = true;
                let this = Arc::clone(self);
                self.vars.strand().post(move || this.service());
            } else {
                self.service_timer.wait(after);
            }
        }
    }

    fn starting_service(&self) -> Option<Arc<Connection<E>>> {
        let mut sched = self.sched.lock();
        let conn = sched.strong.take();
        sched.is_async = false;
        if conn.is_none() {
            tracing::error!(
                endpoint = %self.local_endpoint,
                "connection serviced without a scheduled reference"
            );
        }
        conn
    }
}

impl<E: EndpointId> Drop for Connection<E> {
    fn drop(&mut self) {
        self.unlisten_self();
        if *self.state.lock() != ConnectionState::Disconnected {
            self.alive_timer.cancel();
            *self.state.lock() = ConnectionState::Disconnected;
        }
        let channel = self.local_channel.load(Ordering::Acquire);
        if channel != 0 {
            self.vars.release_channel(&self.local_endpoint.id, channel);
        }
    }
}

fn new_usid() -> Usid {
    rand::random::<u128>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_display() {
        assert_eq!(ConnectionState::PendingConnect.to_string(), "PendingConnect");
        assert_eq!(
            ConnectionState::PendingReceiveConnect.to_string(),
            "PendingReceiveConnect"
        );
    }

    #[test]
    fn usids_are_unique() {
        let a = new_usid();
        let b = new_usid();
        assert_ne!(a, b);
    }

    #[test]
    fn channel_segment_records_seqnos() {
        let segment = ChannelSegment::new(Bytes::from_static(b"x"), 7, 3);
        assert_eq!(segment.channel_seq, 7);
        assert_eq!(segment.ack_seq, 3);
        assert!(segment.transmit_time.lock().is_none());
        assert!(segment.ack_time.lock().is_none());
    }
}
