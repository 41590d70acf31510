//! The unreliable datagram substrate the transport runs over.
//!
//! This module only fixes the interface; real deployments provide their own
//! adapter (UDP sockets, an object-message bus, ...). The in-process
//! [`memory`] adapter backs the test suite and doubles as the reference
//! implementation.

pub mod memory;

use crate::endpoint::{Endpoint, EndpointId};

/// Invoked with (source endpoint, datagram bytes) for every datagram that
/// arrives at a listened endpoint. Runs on the strand.
pub type DataCallback<E> = Box<dyn FnMut(Endpoint<E>, &[u8]) + Send>;

/// Best-effort, unordered, unreliable datagram transport keyed on endpoints.
pub trait DatagramLayer<E: EndpointId>: Send + Sync {
    /// Reserve and return a port not currently in use at `id`, or 0 when the
    /// port space is exhausted.
    fn unused_port(&self, id: &E) -> u16;

    /// Start delivering datagrams addressed to `ep` to `cb`. Returns false
    /// if the endpoint is already being listened on.
    fn listen(&self, ep: &Endpoint<E>, cb: DataCallback<E>) -> bool;

    /// Stop listening on `ep` and release its port.
    fn unlisten(&self, ep: &Endpoint<E>);

    /// Send one datagram. Best effort: may be dropped, duplicated, or
    /// reordered in transit.
    fn send(&self, src: &Endpoint<E>, dst: &Endpoint<E>, data: &[u8]);

    /// Stop all further sends through this layer.
    fn invalidate(&self);
}
