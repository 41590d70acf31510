//! In-process datagram substrate with fault injection.
//!
//! A `MemoryNetwork` routes datagrams between endpoints of the same process,
//! delivering each one as a posted strand task so inbound handling stays
//! serialized. The fault plan can drop, duplicate, and reorder packets,
//! and tests can intercept individual packets to hold them back and release
//! them later (e.g. to produce a late ack).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::datagram::{DataCallback, DatagramLayer};
use crate::endpoint::{Endpoint, EndpointId};
use crate::strand::Strand;

/// What to do with an intercepted packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultVerdict {
    Deliver,
    Drop,
    /// Park the packet until `MemoryNetwork::release_held` is called.
    Hold,
}

/// Deterministic fault injection knobs. The default plan delivers
/// everything untouched over a 1 ms link.
#[derive(Debug, Clone)]
pub struct FaultPlan {
    /// Drop every nth packet (1-based count over all packets).
    pub drop_every_nth: Option<u64>,
    /// Probability of swapping a packet with the next one sent.
    pub reorder_probability: f64,
    /// Probability of delivering a packet twice.
    pub duplicate_probability: f64,
    /// One-way delivery delay. Keep this non-zero so round-trip times are
    /// measurable and timeout arithmetic has something to work with.
    pub latency: Duration,
    /// Seed for the fault RNG, so lossy runs are reproducible.
    pub seed: u64,
}

impl Default for FaultPlan {
    fn default() -> Self {
        Self {
            drop_every_nth: None,
            reorder_probability: 0.0,
            duplicate_probability: 0.0,
            latency: Duration::from_millis(1),
            seed: 0,
        }
    }
}

type Listener<E> = Arc<Mutex<DataCallback<E>>>;
type Packet<E> = (Endpoint<E>, Endpoint<E>, Vec<u8>);

struct NetworkState<E: EndpointId> {
    listeners: HashMap<Endpoint<E>, Listener<E>>,
    used_ports: HashMap<E, HashSet<u16>>,
    layers: HashMap<E, Arc<MemoryDatagramLayer<E>>>,
    rng: StdRng,
    packet_count: u64,
    /// A packet parked by the reorder fault, waiting to swap with the next.
    reorder_stash: Option<Packet<E>>,
    held: Vec<Packet<E>>,
    intercept: Option<Box<dyn FnMut(&[u8]) -> FaultVerdict + Send>>,
}

/// An in-process network shared by every endpoint of a test or demo.
pub struct MemoryNetwork<E: EndpointId> {
    strand: Arc<Strand>,
    faults: FaultPlan,
    state: Mutex<NetworkState<E>>,
    /// Delayed packets drain through one pump task, so link latency never
    /// reorders what the fault plan did not.
    delivery_tx: mpsc::UnboundedSender<(Instant, Packet<E>)>,
}

impl<E: EndpointId> MemoryNetwork<E> {
    pub fn new(strand: Arc<Strand>, faults: FaultPlan) -> Arc<Self> {
        let rng = StdRng::seed_from_u64(faults.seed);
        let (delivery_tx, mut delivery_rx) =
            mpsc::unbounded_channel::<(Instant, Packet<E>)>();
        let net = Arc::new(Self {
            strand,
            faults,
            state: Mutex::new(NetworkState {
                listeners: HashMap::new(),
                used_ports: HashMap::new(),
                layers: HashMap::new(),
                rng,
                packet_count: 0,
                reorder_stash: None,
                held: Vec::new(),
                intercept: None,
            }),
            delivery_tx,
        });

        let weak = Arc::downgrade(&net);
        let _ = tokio::spawn(async move {
            while let Some((deadline, (src, dst, data))) = delivery_rx.recv().await {
                tokio::time::sleep_until(deadline).await;
                let Some(net) = weak.upgrade() else { break };
                net.deliver_now(src, dst, data);
            }
        });

        net
    }

    /// Get or create the datagram layer for one endpoint id.
    pub fn layer(self: &Arc<Self>, id: E) -> Arc<MemoryDatagramLayer<E>> {
        let mut state = self.state.lock();
        if let Some(layer) = state.layers.get(&id) {
            return Arc::clone(layer);
        }
        let layer = Arc::new(MemoryDatagramLayer {
            net: Arc::clone(self),
            valid: AtomicBool::new(true),
        });
        state.layers.insert(id, Arc::clone(&layer));
        layer
    }

    /// Install a per-packet interceptor consulted before the fault plan.
    pub fn set_intercept(&self, f: impl FnMut(&[u8]) -> FaultVerdict + Send + 'static) {
        self.state.lock().intercept = Some(Box::new(f));
    }

    /// Deliver every packet parked by [`FaultVerdict::Hold`].
    pub fn release_held(&self) {
        let held = std::mem::take(&mut self.state.lock().held);
        for packet in held {
            self.deliver(packet);
        }
    }

    fn route(&self, src: &Endpoint<E>, dst: &Endpoint<E>, data: &[u8]) {
        let mut deliveries: Vec<Packet<E>> = Vec::new();
        {
            let mut state = self.state.lock();

            match state.intercept.as_mut().map(|f| f(data)) {
                Some(FaultVerdict::Drop) => return,
                Some(FaultVerdict::Hold) => {
                    state.held.push((src.clone(), dst.clone(), data.to_vec()));
                    return;
                }
                _ => {}
            }

            state.packet_count += 1;
            if let Some(n) = self.faults.drop_every_nth {
                if state.packet_count % n == 0 {
                    return;
                }
            }

            let packet = (src.clone(), dst.clone(), data.to_vec());
            if state.reorder_stash.is_none()
                && self.faults.reorder_probability > 0.0
                && state.rng.random_bool(self.faults.reorder_probability)
            {
                state.reorder_stash = Some(packet);
                return;
            }

            if self.faults.duplicate_probability > 0.0
                && state.rng.random_bool(self.faults.duplicate_probability)
            {
                deliveries.push(packet.clone());
            }
            deliveries.push(packet);
            if let Some(stashed) = state.reorder_stash.take() {
                deliveries.push(stashed);
            }
        }
        for packet in deliveries {
            self.deliver(packet);
        }
    }

    fn deliver(&self, packet: Packet<E>) {
        let latency = self.faults.latency;
        if latency.is_zero() {
            let (src, dst, data) = packet;
            self.deliver_now(src, dst, data);
        } else {
            let _ = self.delivery_tx.send((Instant::now() + latency, packet));
        }
    }

    fn deliver_now(&self, src: Endpoint<E>, dst: Endpoint<E>, data: Vec<u8>) {
        let listener = self.state.lock().listeners.get(&dst).cloned();
        let Some(listener) = listener else {
            tracing::trace!(dst = %dst, "dropping datagram for unlistened endpoint");
            return;
        };
        self.strand.post(move || {
            (listener.lock())(src, &data);
        });
    }
}

/// One endpoint's handle onto a [`MemoryNetwork`].
pub struct MemoryDatagramLayer<E: EndpointId> {
    net: Arc<MemoryNetwork<E>>,
    valid: AtomicBool,
}

impl<E: EndpointId> DatagramLayer<E> for MemoryDatagramLayer<E> {
    fn unused_port(&self, id: &E) -> u16 {
        let mut state = self.net.state.lock();
        let used = state.used_ports.entry(id.clone()).or_default();
        // Port 0 is "unassigned" and channel 0 is the setup channel, so
        // allocation starts at 1.
        for port in 1..u16::MAX {
            if !used.contains(&port) {
                used.insert(port);
                return port;
            }
        }
        0
    }

    fn listen(&self, ep: &Endpoint<E>, cb: DataCallback<E>) -> bool {
        let mut state = self.net.state.lock();
        if state.listeners.contains_key(ep) {
            return false;
        }
        state
            .used_ports
            .entry(ep.id.clone())
            .or_default()
            .insert(ep.port);
        state.listeners.insert(ep.clone(), Arc::new(Mutex::new(cb)));
        true
    }

    fn unlisten(&self, ep: &Endpoint<E>) {
        let mut state = self.net.state.lock();
        state.listeners.remove(ep);
        if let Some(used) = state.used_ports.get_mut(&ep.id) {
            used.remove(&ep.port);
        }
    }

    fn send(&self, src: &Endpoint<E>, dst: &Endpoint<E>, data: &[u8]) {
        if !self.valid.load(Ordering::Acquire) {
            return;
        }
        self.net.route(src, dst, data);
    }

    fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn ep(id: u64, port: u16) -> Endpoint<u64> {
        Endpoint::new(id, port)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn loopback_delivery() {
        let net = MemoryNetwork::new(Strand::new(), FaultPlan::default());
        let layer = net.layer(1);
        let got = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&got);
        assert!(layer.listen(
            &ep(1, 10),
            Box::new(move |src, data| {
                sink.lock().push((src, data.to_vec()));
            }),
        ));
        layer.send(&ep(2, 5), &ep(1, 10), b"hello");
        settle().await;
        let got = got.lock();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0], (ep(2, 5), b"hello".to_vec()));
    }

    #[tokio::test(start_paused = true)]
    async fn unused_ports_are_distinct_and_skip_listened() {
        let net = MemoryNetwork::new(Strand::new(), FaultPlan::default());
        let layer = net.layer(1);
        assert!(layer.listen(&ep(1, 1), Box::new(|_, _| {})));
        let a = layer.unused_port(&1);
        let b = layer.unused_port(&1);
        assert_ne!(a, 1);
        assert_ne!(a, b);
        layer.unlisten(&ep(1, 1));
        // Port 1 is free again.
        assert_eq!(layer.unused_port(&1), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn drop_every_nth_drops() {
        let net = MemoryNetwork::new(
            Strand::new(),
            FaultPlan {
                drop_every_nth: Some(2),
                ..FaultPlan::default()
            },
        );
        let layer = net.layer(1);
        let count = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&count);
        layer.listen(
            &ep(1, 10),
            Box::new(move |_, _| {
                sink.fetch_add(1, Ordering::SeqCst);
            }),
        );
        for _ in 0..10 {
            layer.send(&ep(2, 5), &ep(1, 10), b"x");
        }
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn held_packets_release_later() {
        let net = MemoryNetwork::new(Strand::new(), FaultPlan::default());
        net.set_intercept(|_| FaultVerdict::Hold);
        let layer = net.layer(1);
        let count = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&count);
        layer.listen(
            &ep(1, 10),
            Box::new(move |_, _| {
                sink.fetch_add(1, Ordering::SeqCst);
            }),
        );
        layer.send(&ep(2, 5), &ep(1, 10), b"x");
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        net.set_intercept(|_| FaultVerdict::Deliver);
        net.release_held();
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn invalidated_layer_stops_sending() {
        let net = MemoryNetwork::new(Strand::new(), FaultPlan::default());
        let layer = net.layer(1);
        let count = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&count);
        layer.listen(
            &ep(1, 10),
            Box::new(move |_, _| {
                sink.fetch_add(1, Ordering::SeqCst);
            }),
        );
        layer.invalidate();
        layer.send(&ep(2, 5), &ep(1, 10), b"x");
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
