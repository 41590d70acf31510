//! A single reliable, ordered byte stream within a connection.
//!
//! Streams own their send queue, in-flight map, reassembly buffer, and
//! flow-control windows. Data is fragmented into stream packets, handed to
//! the owning connection for channel-level sequencing, and reassembled on
//! the far side in offset order. Streams form a tree: any stream can create
//! child streams without a new connection.
//!
//! A stream holds only a weak reference back to its connection; the
//! connection keeps the strong references. Every operation that needs the
//! connection upgrades the weak reference for its duration.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::connection::Connection;
use crate::endpoint::{Endpoint, EndpointId};
use crate::error::{Result, SstError};
use crate::manager::ConnectionVariables;
use crate::packet::{StreamHeader, StreamPacketType};
use crate::rtt::RtoEstimator;
use crate::strand::ServiceTimer;

/// Local stream id, assigned per connection side.
pub type Lsid = u32;
/// Globally unique stream id chosen by the initiator.
pub type Usid = u128;

/// Largest payload carried by one stream packet.
pub(crate) const MAX_PAYLOAD_SIZE: usize = 1000;
/// Send-queue budget in bytes.
pub(crate) const MAX_QUEUE_LENGTH: usize = 4_000_000;
/// How many times the INIT packet is retransmitted before the stream fails.
pub(crate) const MAX_INIT_RETRANSMISSIONS: u32 = 5;
/// Keepalive write interval.
pub(crate) const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);
/// Receive silence after which the stream force-closes.
pub(crate) const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// One-shot callback reporting the outcome of a stream creation.
pub type StreamReturnCallback<E> =
    Box<dyn FnOnce(std::result::Result<Arc<Stream<E>>, SstError>) + Send>;
/// Accept callback invoked for every stream that connects to a listened
/// port. Shared, so it can fire any number of times.
pub type StreamListenCallback<E> =
    Arc<dyn Fn(std::result::Result<Arc<Stream<E>>, SstError>) + Send + Sync>;
/// Delivery callback for in-order stream bytes.
pub type ReadCallback = Box<dyn FnMut(&[u8]) + Send>;

/// Stream state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Initiator waiting for the REPLY to its INIT.
    PendingConnect,
    /// Stream is exchanging data.
    Connected,
    /// Graceful close requested; draining queued and in-flight data.
    PendingDisconnect,
    /// Stream is gone.
    Disconnected,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamState::PendingConnect => write!(f, "PendingConnect"),
            StreamState::Connected => write!(f, "Connected"),
            StreamState::PendingDisconnect => write!(f, "PendingDisconnect"),
            StreamState::Disconnected => write!(f, "Disconnected"),
        }
    }
}

/// One queued or in-flight chunk of stream data.
///
/// The ack time is shared mutable state on purpose: a buffer can sit in the
/// resend queue while a late ack lands, and the send loop checks the ack
/// time to avoid retransmitting bytes the peer already has.
pub(crate) struct StreamBuffer {
    pub data: Bytes,
    pub offset: u64,
    pub transmit_time: Mutex<Option<Instant>>,
    pub ack_time: Mutex<Option<Instant>>,
}

impl StreamBuffer {
    fn new(data: Bytes, offset: u64) -> Self {
        Self {
            data,
            offset,
            transmit_time: Mutex::new(None),
            ack_time: Mutex::new(None),
        }
    }

    fn len(&self) -> u32 {
        self.data.len() as u32
    }

    /// Same portion of the stream, regardless of contents.
    fn same_range(&self, other: &Self) -> bool {
        self.offset == other.offset && self.data.len() == other.data.len()
    }
}

struct StreamTx {
    queued: VecDeque<Arc<StreamBuffer>>,
    queue_len: usize,
    /// Offset assigned to the next written byte.
    bytes_sent: u64,
    /// In-flight buffers keyed by the channel seqno they were sent under.
    /// Cleared wholesale on resend; only ever tracks the latest seqno.
    waiting_for_acks: BTreeMap<u64, Arc<StreamBuffer>>,
    /// Buffers whose ack timed out, keyed by their old channel seqno. A late
    /// ack found here still counts: the buffer is marked acked so a requeued
    /// copy is not sent again. Late acks are useless for RTT and window
    /// updates, so those only happen on the normal path.
    unacked_graveyard: BTreeMap<u64, Arc<StreamBuffer>>,
    rto: RtoEstimator,
    last_send: Option<Instant>,
}

struct StreamRx {
    /// Reassembly buffer, allocated lazily at the full receive window.
    buffer: Option<Box<[u8]>>,
    segments: crate::segment::ReceivedSegmentList,
    next_byte_expected: i64,
    last_contiguous_byte: i64,
    last_receive: Option<Instant>,
}

struct InitState {
    data: Bytes,
    retransmissions: u32,
}

struct ServiceSlot<E: EndpointId> {
    strong: Option<Arc<Stream<E>>>,
    /// The connection is pinned alongside so it cannot die under a pending
    /// servicing.
    strong_conn: Option<Arc<Connection<E>>>,
    is_async: bool,
}

/// A reliable ordered byte stream multiplexed over a [`Connection`].
pub struct Stream<E: EndpointId> {
    lsid: Lsid,
    usid: Usid,
    parent_lsid: Lsid,
    local_port: u16,
    remote_port: u16,
    local_endpoint: Endpoint<E>,
    remote_endpoint: Endpoint<E>,
    connection: Weak<Connection<E>>,
    vars: Arc<ConnectionVariables<E>>,

    state: Mutex<StreamState>,
    connected: AtomicBool,
    /// Peer's LSID for this stream; 0 until the handshake resolves it.
    remote_lsid: AtomicU32,

    max_receive_window: u32,
    transmit_window: AtomicU32,
    receive_window: AtomicU32,
    outstanding_bytes: AtomicU32,

    tx: Mutex<StreamTx>,
    rx: Mutex<StreamRx>,
    read_cb: Mutex<Option<Arc<Mutex<ReadCallback>>>>,
    creation_cb: Mutex<Option<StreamReturnCallback<E>>>,
    init: Mutex<InitState>,

    keepalive_timer: Arc<ServiceTimer>,
    service_timer: Arc<ServiceTimer>,
    sched: Mutex<ServiceSlot<E>>,
    weak_self: Weak<Stream<E>>,
}

impl<E: EndpointId> Stream<E> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn create(
        parent_lsid: Lsid,
        conn: &Arc<Connection<E>>,
        local_port: u16,
        remote_port: u16,
        usid: Usid,
        lsid: Lsid,
        creation_cb: Option<StreamReturnCallback<E>>,
        vars: Arc<ConnectionVariables<E>>,
    ) -> Arc<Self> {
        let strand = vars.strand();
        let max_receive_window = vars.config().receive_window;
        let local_endpoint = Endpoint::new(conn.local_endpoint().id, local_port);
        let remote_endpoint = Endpoint::new(conn.remote_endpoint().id, remote_port);

        let stream = Arc::new_cyclic(|weak: &Weak<Stream<E>>| Stream {
            lsid,
            usid,
            parent_lsid,
            local_port,
            remote_port,
            local_endpoint,
            remote_endpoint,
            connection: Arc::downgrade(conn),
            vars,
            state: Mutex::new(StreamState::PendingConnect),
            connected: AtomicBool::new(false),
            remote_lsid: AtomicU32::new(0),
            max_receive_window,
            transmit_window: AtomicU32::new(max_receive_window),
            receive_window: AtomicU32::new(max_receive_window),
            outstanding_bytes: AtomicU32::new(0),
            tx: Mutex::new(StreamTx {
                queued: VecDeque::new(),
                queue_len: 0,
                bytes_sent: 0,
                waiting_for_acks: BTreeMap::new(),
                unacked_graveyard: BTreeMap::new(),
                rto: RtoEstimator::new(),
                last_send: None,
            }),
            rx: Mutex::new(StreamRx {
                buffer: None,
                segments: crate::segment::ReceivedSegmentList::new(),
                next_byte_expected: 0,
                last_contiguous_byte: -1,
                last_receive: None,
            }),
            read_cb: Mutex::new(None),
            creation_cb: Mutex::new(creation_cb),
            init: Mutex::new(InitState {
                data: Bytes::new(),
                retransmissions: 0,
            }),
            keepalive_timer: ServiceTimer::new(Arc::clone(&strand)),
            service_timer: ServiceTimer::new(strand),
            sched: Mutex::new(ServiceSlot {
                strong: None,
                strong_conn: None,
                is_async: false,
            }),
            weak_self: weak.clone(),
        });

        let weak = stream.weak_self.clone();
        stream.service_timer.set_callback(move || {
            if let Some(s) = weak.upgrade() {
                s.service();
            }
        });
        let weak = stream.weak_self.clone();
        stream.keepalive_timer.set_callback(move || {
            if let Some(s) = weak.upgrade() {
                s.send_keepalive();
            }
        });

        stream
    }

    /// Finish construction: queue the INIT (initiator) or REPLY (acceptor)
    /// carrying as much of `initial` as fits, write the remainder, and start
    /// the keepalive. Returns the number of bytes buffered.
    pub(crate) fn init(
        self: &Arc<Self>,
        initial: &[u8],
        remotely_initiated: bool,
        remote_lsid: Lsid,
        ack_seq: u64,
    ) -> usize {
        self.init.lock().retransmissions = 1;
        if remotely_initiated {
            self.remote_lsid.store(remote_lsid, Ordering::Release);
            self.connected.store(true, Ordering::Release);
            *self.state.lock() = StreamState::Connected;
        } else {
            self.connected.store(false, Ordering::Release);
            *self.state.lock() = StreamState::PendingConnect;
        }

        let head_len = initial.len().min(MAX_PAYLOAD_SIZE);
        let head = Bytes::copy_from_slice(&initial[..head_len]);
        self.init.lock().data = head.clone();

        if remotely_initiated {
            self.send_reply_packet(&head, remote_lsid, ack_seq);
        } else {
            self.send_init_packet();
        }

        self.tx.lock().bytes_sent = head_len as u64;

        let mut buffered = head_len;
        if initial.len() > head_len {
            if let Ok(n) = self.write(&initial[head_len..]) {
                buffered += n;
            }
        }

        if self.connection.upgrade().is_some() {
            self.keepalive_timer.wait(KEEPALIVE_INTERVAL);
        }

        buffered
    }

    /// Queue bytes for transmission, fragmenting as needed.
    ///
    /// Returns how many bytes were actually enqueued, which is less than
    /// `data.len()` when the queue budget fills up. A zero-length write
    /// queues a keepalive probe.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        let state = *self.state.lock();
        if state == StreamState::Disconnected || state == StreamState::PendingDisconnect {
            return Err(SstError::StreamClosed);
        }

        let mut tx = self.tx.lock();
        // Servicing only needs a kick when the queue goes empty to
        // non-empty; otherwise a send cycle is already in progress.
        let was_empty = tx.queued.is_empty();
        let mut written = 0usize;

        if data.is_empty() {
            let offset = tx.bytes_sent;
            tx.queued
                .push_back(Arc::new(StreamBuffer::new(Bytes::new(), offset)));
            drop(tx);
            if was_empty {
                self.schedule_service_now();
            }
            return Ok(0);
        }

        for chunk in data.chunks(MAX_PAYLOAD_SIZE) {
            if tx.queue_len + chunk.len() > MAX_QUEUE_LENGTH {
                break;
            }
            let offset = tx.bytes_sent;
            tx.queued.push_back(Arc::new(StreamBuffer::new(
                Bytes::copy_from_slice(chunk),
                offset,
            )));
            tx.queue_len += chunk.len();
            tx.bytes_sent += chunk.len() as u64;
            written += chunk.len();
        }
        drop(tx);

        if was_empty && written > 0 {
            self.schedule_service_now();
        }
        Ok(written)
    }

    /// Gathering write: each slice is written in turn, stopping early when
    /// the queue budget is reached. Returns the total bytes enqueued.
    pub fn writev(&self, bufs: &[&[u8]]) -> Result<usize> {
        let mut total = 0usize;
        for buf in bufs {
            let n = self.write(buf)?;
            total += n;
            if n < buf.len() {
                break;
            }
        }
        Ok(total)
    }

    /// Install the delivery callback and immediately drain anything already
    /// deliverable.
    pub fn read_callback(&self, cb: impl FnMut(&[u8]) + Send + 'static) {
        *self.read_cb.lock() = Some(Arc::new(Mutex::new(Box::new(cb))));
        let ready = {
            let mut rx = self.rx.lock();
            self.take_ready(&mut rx, 0)
        };
        if let Some(bytes) = ready {
            self.invoke_read_callback(&bytes);
        }
    }

    /// Close this stream.
    ///
    /// With `force` the stream is dropped immediately and in-flight data may
    /// be lost. Without it the stream drains its queue first; the state
    /// moves to `Disconnected` once everything queued has been sent and
    /// acknowledged. Either way the call returns without waiting on the
    /// remote end, and keepalives stop.
    pub fn close(&self, force: bool) -> bool {
        let conn = self.connection.upgrade();
        if force {
            self.connected.store(false, Ordering::Release);
            *self.state.lock() = StreamState::Disconnected;
            if let Some(conn) = conn {
                conn.erase_disconnected_stream(self.lsid, self.remote_lsid());
            }
            self.keepalive_timer.cancel();
        } else {
            *self.state.lock() = StreamState::PendingDisconnect;
            self.schedule_service_now();
            self.keepalive_timer.cancel();
        }
        true
    }

    /// Quiescent shutdown request: start a clean, graceful stop.
    pub(crate) fn stop(&self) {
        self.close(false);
    }

    /// Open a child stream under this one. Initial data is queued with the
    /// stream handshake; the callback reports the outcome.
    pub fn create_child_stream(
        &self,
        initial: &[u8],
        local_port: u16,
        remote_port: u16,
        cb: StreamReturnCallback<E>,
    ) -> Result<usize> {
        let Some(conn) = self.connection.upgrade() else {
            return Err(SstError::ConnectionClosed);
        };
        Ok(conn.open_substream(initial, local_port, remote_port, self.lsid, Some(cb)))
    }

    /// Accept child streams that connect to `port` on this connection.
    pub fn listen_substream(&self, port: u16, cb: StreamListenCallback<E>) {
        match self.connection.upgrade() {
            Some(conn) => conn.listen_stream(port, cb),
            None => cb(Err(SstError::ConnectionClosed)),
        }
    }

    pub fn unlisten_substream(&self, port: u16) {
        if let Some(conn) = self.connection.upgrade() {
            conn.unlisten_stream(port);
        }
    }

    pub fn local_endpoint(&self) -> Endpoint<E> {
        self.local_endpoint.clone()
    }

    pub fn remote_endpoint(&self) -> Endpoint<E> {
        self.remote_endpoint.clone()
    }

    pub fn state(&self) -> StreamState {
        *self.state.lock()
    }

    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn lsid(&self) -> Lsid {
        self.lsid
    }

    pub fn usid(&self) -> Usid {
        self.usid
    }

    /// The connection this stream runs over, if it is still alive.
    pub fn connection(&self) -> Option<Arc<Connection<E>>> {
        self.connection.upgrade()
    }

    pub(crate) fn remote_lsid(&self) -> Option<Lsid> {
        match self.remote_lsid.load(Ordering::Acquire) {
            0 => None,
            other => Some(other),
        }
    }

    pub(crate) fn init_remote_lsid(&self, lsid: Lsid) {
        self.remote_lsid.store(lsid, Ordering::Release);
    }

    pub(crate) fn take_creation_callback(&self) -> Option<StreamReturnCallback<E>> {
        self.creation_cb.lock().take()
    }

    // ------------------------------------------------------------------
    // Inbound path (called by the owning connection, on the strand)
    // ------------------------------------------------------------------

    /// Handle the data-bearing part of an INIT, REPLY, or DATA packet.
    /// Returns whether the packet was fully handled; out-of-window data is
    /// dropped unhandled so the peer is not led to believe it was stored.
    pub(crate) fn receive_data(&self, hdr: &StreamHeader, ack_seq: u64) -> bool {
        let now = Instant::now();
        self.rx.lock().last_receive = Some(now);

        if hdr.packet_type == StreamPacketType::Reply {
            self.connected.store(true, Ordering::Release);
            return true;
        }
        debug_assert!(matches!(
            hdr.packet_type,
            StreamPacketType::Data | StreamPacketType::Init
        ));

        self.update_transmit_window(hdr.window);

        let offset = hdr.bsn as i64;
        let len = hdr.payload.len() as i64;
        let mut rx = self.rx.lock();

        // Everything at or before the delivery point has been seen already
        // (retries, duplicated packets); this also covers a zero-length
        // keepalive at exactly the next expected byte. Ack so the peer
        // stops resending.
        if offset + len <= rx.next_byte_expected {
            drop(rx);
            self.send_ack_packet(ack_seq);
            return true;
        }

        let offset_in_buffer = offset - rx.next_byte_expected;
        if offset_in_buffer < 0 {
            // A packet straddling the delivery point would mean the sender
            // re-segmented data, which the current sender never does.
            debug_assert!(false, "re-segmented stream data");
            return false;
        }

        if len > 0 && offset_in_buffer + len <= self.max_receive_window as i64 {
            self.receive_window.fetch_sub(len as u32, Ordering::AcqRel);
            let max_window = self.max_receive_window as usize;
            let buffer = rx
                .buffer
                .get_or_insert_with(|| vec![0u8; max_window].into_boxed_slice());
            let start = offset_in_buffer as usize;
            buffer[start..start + len as usize].copy_from_slice(&hdr.payload);
            rx.segments.insert(offset, len);

            let ready = if offset == rx.next_byte_expected {
                self.take_ready(&mut rx, len)
            } else {
                // A hole remains; buffer without advancing delivery.
                None
            };
            drop(rx);
            if let Some(bytes) = ready {
                self.invoke_read_callback(&bytes);
            }
            self.send_ack_packet(ack_seq);
            return true;
        }

        if len > 0 {
            // Outside the receive window. Deliver whatever is pending to
            // open the window back up, but do not ack: the sender will
            // retransmit after its timeout.
            let ready = self.take_ready(&mut rx, 0);
            drop(rx);
            if let Some(bytes) = ready {
                self.invoke_read_callback(&bytes);
            }
            return false;
        }

        false
    }

    /// Handle an ack for one channel seqno.
    pub(crate) fn receive_ack(&self, hdr: &StreamHeader, channel_seq: u64) {
        let now = Instant::now();
        let mut tx = self.tx.lock();

        let mut normal_ack = false;
        let acked = if let Some(buf) = tx.waiting_for_acks.remove(&channel_seq) {
            normal_ack = true;
            Some(buf)
        } else if let Some(buf) = tx.unacked_graveyard.remove(&channel_seq) {
            // The ack beat the resend; drop the copy still waiting under a
            // fresh seqno so it is not counted twice. Only the graveyard
            // path pays for this scan -- the normal case purges below.
            let stale = tx
                .waiting_for_acks
                .iter()
                .find(|(_, b)| b.same_range(&buf))
                .map(|(k, _)| *k);
            if let Some(k) = stale {
                tx.waiting_for_acks.remove(&k);
            }
            Some(buf)
        } else {
            None
        };

        let Some(buf) = acked else { return };

        *buf.ack_time.lock() = Some(now);
        // The bytes stop being outstanding even on a graveyard ack: the
        // newer in-flight copy of this buffer just became unackable, so this
        // is the only chance to clear them.
        let len = buf.len();
        let out = self.outstanding_bytes.load(Ordering::Acquire);
        self.outstanding_bytes
            .store(out.saturating_sub(len), Ordering::Release);

        if normal_ack {
            let transmit_time = *buf.transmit_time.lock();
            if let Some(t) = transmit_time {
                tx.rto.sample(now.duration_since(t));
            }
            self.update_transmit_window(hdr.window);
        }

        // Retransmits leave duplicates of this buffer in the graveyard
        // under other seqnos; purge them all.
        let duplicates: Vec<u64> = tx
            .unacked_graveyard
            .iter()
            .filter(|(_, b)| b.same_range(&buf))
            .map(|(k, _)| *k)
            .collect();
        for k in duplicates {
            tx.unacked_graveyard.remove(&k);
        }

        let have_queued = !tx.queued.is_empty();
        drop(tx);
        // The ack freed window space; resume sending if anything is waiting.
        if have_queued {
            self.schedule_service_now();
        }
    }

    // ------------------------------------------------------------------
    // Service loop
    // ------------------------------------------------------------------

    fn service(self: &Arc<Self>) {
        let Some((_strm, conn)) = self.starting_service() else {
            return;
        };
        let now = Instant::now();

        let idle = {
            let rx = self.rx.lock();
            rx.last_receive
                .map_or(false, |t| now.duration_since(t) > IDLE_TIMEOUT)
        };
        if idle {
            self.close(true);
            return;
        }

        let state = *self.state.lock();
        if state == StreamState::Disconnected {
            return;
        }

        if state != StreamState::Connected && state != StreamState::PendingDisconnect {
            let attempts = self.init.lock().retransmissions;
            if !self.connected.load(Ordering::Acquire) && attempts < MAX_INIT_RETRANSMISSIONS {
                self.send_init_packet();
                self.tx.lock().last_send = Some(now);
                self.init.lock().retransmissions += 1;
                return;
            }

            self.init.lock().data = Bytes::new();

            if !self.connected.load(Ordering::Acquire) {
                // Out of retries: fail the creation and, for the root
                // stream, take the whole connection down with it.
                self.vars
                    .remove_pending_stream_callback(&conn.local_endpoint());
                if self.parent_lsid == 0 {
                    conn.close(true);
                    Connection::cleanup(Arc::clone(&conn));
                }
                if let Some(cb) = self.take_creation_callback() {
                    cb(Err(SstError::StreamSetupFailed));
                }
                conn.erase_disconnected_stream(self.lsid, self.remote_lsid());
                *self.state.lock() = StreamState::Disconnected;
                return;
            }

            *self.state.lock() = StreamState::Connected;
            // Data may have been written while the handshake was pending.
            self.schedule_service_now();
            return;
        }

        // Waiting on acks for more than two RTOs means the packets (or the
        // acks) are gone; stick them back on the queue. The send loop below
        // reschedules servicing, so this converges.
        let needs_resend = {
            let tx = self.tx.lock();
            tx.last_send.map_or(false, |t| {
                now.duration_since(t).as_micros() as i64 >= 2 * tx.rto.rto_micros()
            })
        };
        if needs_resend {
            self.resend_unacked();
            self.tx.lock().last_send = Some(now);
        }

        let mut tx = self.tx.lock();

        if state == StreamState::PendingDisconnect
            && tx.queued.is_empty()
            && tx.waiting_for_acks.is_empty()
        {
            *self.state.lock() = StreamState::Disconnected;
            drop(tx);
            conn.erase_disconnected_stream(self.lsid, self.remote_lsid());
            return;
        }

        let mut sent_something = false;
        loop {
            let Some(buffer) = tx.queued.front().cloned() else {
                break;
            };

            // A late ack may have landed after this buffer was requeued for
            // a retry. The ack time is only ever set on a real ack, so it
            // tells us the peer has these bytes.
            if buffer.ack_time.lock().is_some() {
                tx.queued.pop_front();
                tx.queue_len = tx.queue_len.saturating_sub(buffer.data.len());
                continue;
            }

            if self.transmit_window.load(Ordering::Acquire) < buffer.len() {
                break;
            }

            let channel_seq = self.send_data_packet(&conn, &buffer);
            *buffer.transmit_time.lock() = Some(now);
            sent_something = true;

            debug_assert!(!tx.waiting_for_acks.contains_key(&channel_seq));
            tx.waiting_for_acks.insert(channel_seq, Arc::clone(&buffer));

            tx.queued.pop_front();
            tx.queue_len = tx.queue_len.saturating_sub(buffer.data.len());
            tx.last_send = Some(now);

            let window = self.transmit_window.load(Ordering::Acquire);
            self.transmit_window
                .store(window.saturating_sub(buffer.len()), Ordering::Release);
            self.outstanding_bytes
                .fetch_add(buffer.len(), Ordering::AcqRel);
        }

        // Sent something, or stalled on the window with data still queued:
        // either way arm the retransmit probe, adjusting for time already
        // elapsed since the last send.
        if sent_something || !tx.queued.is_empty() {
            let rto2 = Duration::from_micros((2 * tx.rto.rto_micros()).max(0) as u64);
            let elapsed = tx
                .last_send
                .map_or(Duration::ZERO, |t| now.duration_since(t));
            drop(tx);
            self.schedule_service(rto2.saturating_sub(elapsed));
        }
    }

    /// Requeue all in-flight buffers, oldest first, remembering each under
    /// its old seqno in the graveyard so a late ack still lands.
    fn resend_unacked(&self) {
        let mut tx = self.tx.lock();

        let entries: Vec<(u64, Arc<StreamBuffer>)> = tx
            .waiting_for_acks
            .iter()
            .map(|(k, v)| (*k, Arc::clone(v)))
            .collect();
        for (seq, buf) in entries.iter().rev() {
            tx.queued.push_front(Arc::clone(buf));
            tx.queue_len += buf.data.len();
            tx.unacked_graveyard.insert(*seq, Arc::clone(buf));
        }

        // Make sure the first requeued buffer can actually go out.
        if let Some(front) = tx.queued.front() {
            let len = front.len();
            if self.transmit_window.load(Ordering::Acquire) < len {
                self.transmit_window.store(len, Ordering::Release);
            }
        }
        self.outstanding_bytes.store(0, Ordering::Release);

        if !tx.waiting_for_acks.is_empty() {
            // No acks at all: the RTT estimate may be far too low. Grow it
            // so the estimate can eventually correct itself.
            tx.rto.backoff();
            tx.waiting_for_acks.clear();
        }
    }

    fn send_keepalive(self: &Arc<Self>) {
        let state = *self.state.lock();
        if state == StreamState::Disconnected || state == StreamState::PendingDisconnect {
            self.close(true);
            return;
        }
        let _ = self.write(&[]);
        self.keepalive_timer.wait(KEEPALIVE_INTERVAL);
    }

    // ------------------------------------------------------------------
    // Delivery
    // ------------------------------------------------------------------

    /// Pop the deliverable prefix out of the reassembly buffer, moving the
    /// window forward. Bails (without consuming the ready range) when no
    /// read callback is installed. Returns the bytes to hand to the
    /// application; the caller invokes the callback after dropping `rx`.
    fn take_ready(&self, rx: &mut StreamRx, skip_len: i64) -> Option<Bytes> {
        self.read_cb.lock().as_ref()?;

        let ready = rx.segments.ready_range(rx.next_byte_expected, skip_len);
        let len = ready.length;
        if len == 0 {
            return None;
        }

        let buffer = rx.buffer.as_mut()?;
        let len_usize = len as usize;
        let bytes = Bytes::copy_from_slice(&buffer[..len_usize]);

        rx.last_contiguous_byte += len;
        rx.next_byte_expected = rx.last_contiguous_byte + 1;
        buffer.copy_within(len_usize.., 0);
        self.receive_window.fetch_add(len as u32, Ordering::AcqRel);

        Some(bytes)
    }

    fn invoke_read_callback(&self, bytes: &Bytes) {
        let cb = self.read_cb.lock().clone();
        if let Some(cb) = cb {
            (cb.lock())(bytes);
        }
    }

    fn update_transmit_window(&self, window_log2: u8) {
        let advertised = 1u64 << u32::from(window_log2.min(31));
        let outstanding = u64::from(self.outstanding_bytes.load(Ordering::Acquire));
        let window = advertised.saturating_sub(outstanding);
        self.transmit_window
            .store(window.min(u64::from(u32::MAX)) as u32, Ordering::Release);
    }

    // ------------------------------------------------------------------
    // Outbound packets
    // ------------------------------------------------------------------

    fn send_init_packet(&self) {
        let (payload, attempts) = {
            let init = self.init.lock();
            (init.data.clone(), init.retransmissions)
        };
        let header = StreamHeader {
            lsid: self.lsid,
            packet_type: StreamPacketType::Init,
            flags: 0,
            window: self.window_log2(),
            src_port: self.local_port,
            dest_port: self.remote_port,
            psid: self.parent_lsid,
            rsid: 0,
            bsn: 0,
            payload,
        };
        let Some(conn) = self.connection.upgrade() else {
            return;
        };
        conn.send_data_with_auto_ack(header.encode());

        // Exponential backoff between INIT attempts: the RTO is still the
        // initial guess here.
        let rto = Duration::from_micros(self.tx.lock().rto.rto_micros().max(0) as u64);
        self.schedule_service(rto * 2u32.pow(attempts.min(16)));
    }

    pub(crate) fn send_reply_packet(&self, payload: &[u8], remote_lsid: Lsid, ack_seq: u64) {
        let header = StreamHeader {
            lsid: self.lsid,
            packet_type: StreamPacketType::Reply,
            flags: 0,
            window: self.window_log2(),
            src_port: self.local_port,
            dest_port: self.remote_port,
            psid: 0,
            rsid: remote_lsid,
            bsn: 0,
            payload: Bytes::copy_from_slice(payload),
        };
        let Some(conn) = self.connection.upgrade() else {
            return;
        };
        conn.send_data(header.encode(), false, ack_seq);
    }

    fn send_ack_packet(&self, ack_seq: u64) {
        let header = StreamHeader {
            lsid: self.lsid,
            packet_type: StreamPacketType::Ack,
            flags: 0,
            window: self.window_log2(),
            src_port: self.local_port,
            dest_port: self.remote_port,
            psid: 0,
            rsid: 0,
            bsn: 0,
            payload: Bytes::new(),
        };
        let Some(conn) = self.connection.upgrade() else {
            return;
        };
        conn.send_data(header.encode(), true, ack_seq);
    }

    fn send_data_packet(&self, conn: &Arc<Connection<E>>, buffer: &StreamBuffer) -> u64 {
        let header = StreamHeader {
            lsid: self.lsid,
            packet_type: StreamPacketType::Data,
            flags: 0,
            window: self.window_log2(),
            src_port: self.local_port,
            dest_port: self.remote_port,
            psid: 0,
            rsid: 0,
            bsn: buffer.offset,
            payload: buffer.data.clone(),
        };
        conn.send_data_with_auto_ack(header.encode())
    }

    fn window_log2(&self) -> u8 {
        window_log2(self.receive_window.load(Ordering::Acquire))
    }

    // ------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------

    pub(crate) fn schedule_service_now(&self) {
        self.schedule_service(Duration::ZERO);
    }

    /// Coalescing scheduler: at most one servicing is ever pending. An
    /// earlier request cancels and rearms the timer; a later one is a no-op.
    /// The pending slot holds strong references to the stream and its
    /// connection so neither can be freed out from under the service call.
    fn schedule_service(&self, after: Duration) {
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        let Some(conn) = self.connection.upgrade() else {
            return;
        };

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
            sched.strong = Some(Arc::clone(&this));
            sched.strong_conn = Some(conn);
            if after.is_zero() {
                sched.is_async = true;
                self.vars.strand().post(move || this.service());
            } else {
                self.service_timer.wait(after);
            }
        }
    }

    /// Clear the pending-service slot on entry so the next schedule can be
    /// installed, handing back the pinned references.
    fn starting_service(&self) -> Option<(Arc<Stream<E>>, Arc<Connection<E>>)> {
        let mut sched = self.sched.lock();
        let strm = sched.strong.take();
        let conn = sched.strong_conn.take();
        sched.is_async = false;
        match (strm, conn) {
            (Some(s), Some(c)) => Some((s, c)),
            _ => {
                tracing::error!(lsid = self.lsid, "stream serviced without a scheduled reference");
                None
            }
        }
    }
}

/// log2 of the advertised receive window, truncated to an integer. The
/// precision loss is tolerated by design; a zero window advertises as 0.
pub(crate) fn window_log2(window: u32) -> u8 {
    if window == 0 {
        0
    } else {
        (31 - window.leading_zeros()) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_buffer_same_range_ignores_contents() {
        let a = StreamBuffer::new(Bytes::from_static(b"aaaa"), 16);
        let b = StreamBuffer::new(Bytes::from_static(b"bbbb"), 16);
        let c = StreamBuffer::new(Bytes::from_static(b"aaaa"), 20);
        assert!(a.same_range(&b));
        assert!(!a.same_range(&c));
    }

    #[test]
    fn window_log2_truncates() {
        assert_eq!(window_log2(0), 0);
        assert_eq!(window_log2(1), 0);
        assert_eq!(window_log2(2), 1);
        assert_eq!(window_log2(65536), 16);
        assert_eq!(window_log2(65535), 15);
    }

    #[test]
    fn state_display() {
        assert_eq!(StreamState::PendingConnect.to_string(), "PendingConnect");
        assert_eq!(StreamState::Disconnected.to_string(), "Disconnected");
    }
}
