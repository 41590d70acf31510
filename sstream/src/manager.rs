//! Connection manager: the per-process registry.
//!
//! Everything that creates top-level streams, listens on endpoints, or
//! builds datagram layers goes through here. One instance per process,
//! passed explicitly to whatever needs it — there is no singleton.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::connection::{Connection, ConnectionReturnCallback};
use crate::datagram::DatagramLayer;
use crate::endpoint::{Endpoint, EndpointId};
use crate::error::{Result, SstError};
use crate::strand::Strand;
use crate::stream::{StreamListenCallback, StreamReturnCallback};

/// Transport-wide tunables.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Per-stream receive window in bytes. Advertised as its log2 on the
    /// wire, so powers of two avoid wasting window.
    pub receive_window: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            receive_window: 65536,
        }
    }
}

/// Registry tables shared by every connection of one manager, all behind a
/// single lock. The lock is always released before user callbacks run.
pub(crate) struct RegistryTables<E: EndpointId> {
    pub connections: HashMap<Endpoint<E>, Arc<Connection<E>>>,
    pub connection_callbacks: HashMap<Endpoint<E>, ConnectionReturnCallback<E>>,
    /// Accept callbacks for endpoints listening for new connections.
    pub listening: HashMap<Endpoint<E>, StreamListenCallback<E>>,
    /// Creation callbacks for connect_stream calls whose handshake is still
    /// in flight, keyed by the local endpoint.
    pub pending_streams: HashMap<Endpoint<E>, StreamReturnCallback<E>>,
}

/// State shared between the manager and its connections: the strand, the
/// datagram-layer cache, and the registry tables.
pub struct ConnectionVariables<E: EndpointId> {
    strand: Arc<Strand>,
    config: TransportConfig,
    layers: Mutex<HashMap<E, Arc<dyn DatagramLayer<E>>>>,
    pub(crate) tables: Mutex<RegistryTables<E>>,
}

impl<E: EndpointId> ConnectionVariables<E> {
    fn new(config: TransportConfig) -> Arc<Self> {
        Arc::new(Self {
            strand: Strand::new(),
            config,
            layers: Mutex::new(HashMap::new()),
            tables: Mutex::new(RegistryTables {
                connections: HashMap::new(),
                connection_callbacks: HashMap::new(),
                listening: HashMap::new(),
                pending_streams: HashMap::new(),
            }),
        })
    }

    pub(crate) fn strand(&self) -> Arc<Strand> {
        Arc::clone(&self.strand)
    }

    pub(crate) fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub(crate) fn datagram_layer(&self, id: &E) -> Option<Arc<dyn DatagramLayer<E>>> {
        self.layers.lock().get(id).cloned()
    }

    pub(crate) fn add_datagram_layer(&self, id: E, layer: Arc<dyn DatagramLayer<E>>) {
        self.layers.lock().insert(id, layer);
    }

    pub(crate) fn remove_datagram_layer(&self, id: &E) {
        if self.layers.lock().remove(id).is_none() {
            tracing::error!("invalidating a datagram layer that was never registered");
        }
    }

    /// Lowest free channel id at `id`, or 0 when none is available.
    pub(crate) fn available_channel(&self, id: &E) -> u16 {
        match self.datagram_layer(id) {
            Some(layer) => layer.unused_port(id),
            None => 0,
        }
    }

    /// Release a channel id back to the datagram layer.
    pub(crate) fn release_channel(&self, id: &E, channel: u32) {
        if let Some(layer) = self.datagram_layer(id) {
            let ep = Endpoint::new(id.clone(), channel as u16);
            layer.unlisten(&ep);
        }
    }

    pub(crate) fn remove_pending_stream_callback(&self, ep: &Endpoint<E>) {
        self.tables.lock().pending_streams.remove(ep);
    }
}

/// Factory and registry for connections, listeners, and datagram layers.
pub struct ConnectionManager<E: EndpointId> {
    vars: Arc<ConnectionVariables<E>>,
}

impl<E: EndpointId> ConnectionManager<E> {
    /// Create a manager with default tunables. Must be called from within a
    /// tokio runtime; the strand driver is spawned here.
    pub fn new() -> Self {
        Self::with_config(TransportConfig::default())
    }

    pub fn with_config(config: TransportConfig) -> Self {
        Self {
            vars: ConnectionVariables::new(config),
        }
    }

    /// The strand this manager's protocol work runs on. Datagram adapters
    /// need it to serialize their delivery callbacks.
    pub fn strand(&self) -> Arc<Strand> {
        self.vars.strand()
    }

    /// Register (or look up) the datagram layer for one endpoint id.
    pub fn create_datagram_layer(
        &self,
        id: E,
        layer: Arc<dyn DatagramLayer<E>>,
    ) -> Arc<dyn DatagramLayer<E>> {
        if let Some(existing) = self.vars.datagram_layer(&id) {
            return existing;
        }
        self.vars.add_datagram_layer(id, Arc::clone(&layer));
        layer
    }

    pub fn datagram_layer(&self, id: &E) -> Option<Arc<dyn DatagramLayer<E>>> {
        self.vars.datagram_layer(id)
    }

    /// Drop the datagram layer for `id`, invalidating it first.
    pub fn invalidate_datagram_layer(&self, id: &E) {
        if let Some(layer) = self.vars.datagram_layer(id) {
            layer.invalidate();
        }
        self.vars.remove_datagram_layer(id);
    }

    /// Open a connection to `remote` and a top-level stream on it. The
    /// callback fires with the stream once both handshakes complete, or
    /// with the error once setup fails; construction failures invoke it
    /// before this returns.
    pub fn connect_stream(
        &self,
        local: Endpoint<E>,
        remote: Endpoint<E>,
        cb: StreamReturnCallback<E>,
    ) -> Result<()> {
        let mut local = local;
        if local.port == 0 {
            let Some(layer) = self.vars.datagram_layer(&local.id) else {
                tracing::error!(
                    "connect_stream without a datagram layer for the local endpoint"
                );
                cb(Err(SstError::NoDatagramLayer));
                return Err(SstError::NoDatagramLayer);
            };
            local.port = layer.unused_port(&local.id);
            if local.port == 0 {
                cb(Err(SstError::NoChannelAvailable));
                return Err(SstError::NoChannelAvailable);
            }
        }

        {
            let mut tables = self.vars.tables.lock();
            if tables.pending_streams.contains_key(&local) {
                drop(tables);
                cb(Err(SstError::ConnectPending));
                return Err(SstError::ConnectPending);
            }
            tables.pending_streams.insert(local.clone(), cb);
        }

        let vars = Arc::clone(&self.vars);
        let callback_key = local.clone();
        let connection_cb: ConnectionReturnCallback<E> = Box::new(move |result| {
            let cb = vars.tables.lock().pending_streams.remove(&callback_key);
            match result {
                Ok(conn) => {
                    if let Some(cb) = cb {
                        // The remote port was learned during the handshake.
                        let remote_port = conn.remote_endpoint().port;
                        let local_port = conn.local_endpoint().port;
                        conn.open_stream(&[], local_port, remote_port, Some(cb));
                    }
                }
                Err(e) => {
                    if let Some(cb) = cb {
                        cb(Err(e));
                    }
                }
            }
        });

        Connection::create_connection(&self.vars, local, remote, connection_cb)
    }

    /// Accept top-level streams at `ep`: every new connection's root stream
    /// is handed to `cb`.
    pub fn listen(&self, cb: StreamListenCallback<E>, ep: Endpoint<E>) -> Result<()> {
        let layer = self
            .vars
            .datagram_layer(&ep.id)
            .ok_or(SstError::NoDatagramLayer)?;

        {
            let mut tables = self.vars.tables.lock();
            if tables.listening.contains_key(&ep) {
                return Err(SstError::EndpointInUse(ep.to_string()));
            }
            tables.listening.insert(ep.clone(), cb);
        }

        let vars = Arc::clone(&self.vars);
        let local = ep.clone();
        layer.listen(
            &ep,
            Box::new(move |src, data| {
                Connection::handle_receive(&vars, src, local.clone(), data);
            }),
        );
        Ok(())
    }

    pub fn unlisten(&self, ep: &Endpoint<E>) {
        self.vars.tables.lock().listening.remove(ep);
        if let Some(layer) = self.vars.datagram_layer(&ep.id) {
            layer.unlisten(ep);
        }
    }

    /// Quiescent shutdown: every connection is asked to stop cleanly.
    pub fn stop(&self) {
        let connections: Vec<Arc<Connection<E>>> = self
            .vars
            .tables
            .lock()
            .connections
            .values()
            .cloned()
            .collect();
        for conn in connections {
            conn.stop();
        }
    }

    /// Drain the connection table, closing each connection in turn.
    ///
    /// One connection at a time, and the registry lock is released before
    /// the reference is dropped: a connection's teardown mutates the table
    /// itself, and holding the lock across the drop would deadlock.
    pub fn close_all(&self) {
        loop {
            let saved = {
                let mut tables = self.vars.tables.lock();
                let Some(key) = tables.connections.keys().next().cloned() else {
                    break;
                };
                tables.connections.remove(&key)
            };
            if let Some(conn) = saved {
                conn.close(false);
            }
        }
    }

    pub fn active_connections(&self) -> usize {
        self.vars.tables.lock().connections.len()
    }
}

impl<E: EndpointId> Default for ConnectionManager<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: EndpointId> Drop for ConnectionManager<E> {
    fn drop(&mut self) {
        self.close_all();
    }
}
