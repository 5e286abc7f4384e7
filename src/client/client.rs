use std::{
    cmp::min,
    collections::HashMap,
    io::ErrorKind,
    net::{IpAddr, SocketAddr},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, Ordering},
    },
    time::{Duration, Instant},
};
use tokio::{
    io, select,
    sync::{Notify, OnceCell},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    client::{
        Channel, ChannelState, SearcherBuilder, Subscription,
        channel::ChannelShared,
        circuit::Circuit,
        searcher::{CouldNotFindError, Searcher},
    },
    dbr::{DbrValue, DecodeError},
    messages::{CAMessage, ErrorCondition, RsrvIsUp},
    utils::{
        get_default_beacon_port, get_default_connection_timeout, get_default_max_search_interval,
        get_default_server_port, new_reusable_udp_socket, seconds,
    },
};

/// How long operations on channels wait, unless told otherwise
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
/// First wait before searching again for a name nobody answered
const INITIAL_RESEARCH_DELAY: Duration = Duration::from_secs(1);

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("{0}")]
    IO(#[from] io::Error),
    #[error("{0}")]
    PVNotFoundError(#[from] CouldNotFindError),
    #[error("Failed to parse message from server")]
    ServerSentInvalidMessage,
    #[error("Could not decode value from server: {0}")]
    Decode(#[from] DecodeError),
    #[error("The server version ({0}) was incompatible")]
    ServerVersionMismatch(u16),
    #[error("The Client is closing or has closed")]
    ClientClosed,
    #[error("The channel lost its connection to the server")]
    Disconnected,
    #[error("The channel has been disposed")]
    ChannelDisposed,
    #[error("Channel creation failed")]
    ChannelCreateFailed,
    #[error("Timed out waiting for the server")]
    Timeout,
    #[error("No read access to the channel")]
    NoReadAccess,
    #[error("No write access to the channel")]
    NoWriteAccess,
    #[error("Could not convert the value to the requested type")]
    NoConvert,
    #[error("Server returned error: {message}")]
    ServerError {
        condition: ErrorCondition,
        message: String,
    },
}

pub struct ClientBuilder {
    search_port: u16,
    beacon_port: Option<u16>,
    broadcast_addresses: Option<Vec<SocketAddr>>,
    timeout: Duration,
    connection_timeout: Duration,
    client_name: Option<String>,
    host_name: Option<String>,
    request_not_found: bool,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        ClientBuilder {
            search_port: get_default_server_port(),
            beacon_port: Some(get_default_beacon_port()),
            broadcast_addresses: None,
            timeout: DEFAULT_TIMEOUT,
            connection_timeout: seconds(get_default_connection_timeout()),
            client_name: None,
            host_name: None,
            request_not_found: false,
        }
    }
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }
    /// The port that searches are sent to
    pub fn search_port(mut self, port: u16) -> Self {
        self.search_port = port;
        self
    }
    /// Port to watch for server beacons on, or `None` to not watch
    pub fn beacon_port(mut self, port: Option<u16>) -> Self {
        self.beacon_port = port;
        self
    }
    /// Send searches to exactly these addresses, instead of the environment
    pub fn broadcast_to(mut self, addresses: Vec<SocketAddr>) -> Self {
        self.broadcast_addresses = Some(addresses);
        self
    }
    /// How long channel operations wait before failing with [`ClientError::Timeout`]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
    /// Silence on a circuit for half of this sends an echo; the whole of it disconnects
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }
    pub fn client_name(mut self, name: &str) -> Self {
        self.client_name = Some(name.to_owned());
        self
    }
    pub fn host_name(mut self, name: &str) -> Self {
        self.host_name = Some(name.to_owned());
        self
    }
    /// Ask servers to say when they do not have a PV
    ///
    /// Channels then fail with [`ClientError::PVNotFoundError`] instead of
    /// timing out. Only useful when every server searched can answer for
    /// every name, such as a single server or a name server.
    pub fn request_not_found(mut self, request: bool) -> Self {
        self.request_not_found = request;
        self
    }

    pub async fn start(self) -> Result<Client, io::Error> {
        let cancel = CancellationToken::new();
        let searcher = SearcherBuilder::new()
            .search_port(self.search_port)
            .timeout(Some(self.timeout))
            .request_not_found(self.request_not_found)
            .stop_token(cancel.clone());
        let searcher = match self.broadcast_addresses {
            Some(addresses) => searcher.broadcast_to(addresses),
            None => searcher,
        }
        .start()
        .await?;

        let context = Arc::new(ClientContext {
            searcher,
            circuits: Default::default(),
            channels: Default::default(),
            next_cid: AtomicU32::new(1),
            cancel,
            observed_beacons: Default::default(),
            beacon_anomaly: Notify::new(),
            timeout: self.timeout,
            connection_timeout: self.connection_timeout,
            client_name: self.client_name.unwrap_or_else(whoami::username),
            host_name: self
                .host_name
                .or_else(|| whoami::fallible::hostname().ok())
                .unwrap_or_else(|| "localhost".to_string()),
        });
        if let Some(port) = self.beacon_port
            && let Err(err) = watch_beacons(context.clone(), port)
        {
            warn!("Failed to create beacon watcher on port {port}, will run without: {err:?}");
        }
        Ok(Client { context })
    }
}

/// A circuit to one server, filled in by whichever channel connects first
type CircuitSlot = Arc<OnceCell<Circuit>>;

/// State shared between the [`Client`] and the tasks driving its channels
struct ClientContext {
    searcher: Searcher,
    /// Connections to different servers. Connecting happens outside the lock.
    circuits: Mutex<HashMap<SocketAddr, CircuitSlot>>,
    /// Live channels, by name
    channels: Mutex<HashMap<String, Arc<ChannelShared>>>,
    next_cid: AtomicU32,
    cancel: CancellationToken,
    /// Servers we have seen beaconing, with the last beacon ID and when it arrived
    observed_beacons: Mutex<HashMap<SocketAddr, (u32, Instant)>>,
    /// Woken when a server appears or restarts, so unanswered searches go again
    beacon_anomaly: Notify,
    timeout: Duration,
    connection_timeout: Duration,
    client_name: String,
    host_name: String,
}

impl ClientContext {
    /// The slot for a server's circuit, replacing one whose circuit has closed
    fn circuit_slot(&self, address: SocketAddr) -> Result<CircuitSlot, ClientError> {
        let mut circuits = self.circuits.lock().map_err(|_| ClientError::ClientClosed)?;
        let slot = circuits.entry(address).or_default();
        if slot.get().is_some_and(Circuit::is_closed) {
            *slot = CircuitSlot::default();
        }
        Ok(slot.clone())
    }

    /// Share the circuit to a server, connecting if there is none
    ///
    /// Callers for the same server wait on one connection attempt; a failed
    /// attempt leaves the slot empty for the next caller to retry.
    async fn get_or_create_circuit(&self, address: SocketAddr) -> Result<Circuit, ClientError> {
        let slot = self.circuit_slot(address)?;
        let circuit = slot
            .get_or_try_init(|| {
                Circuit::connect(
                    &address,
                    &self.client_name,
                    &self.host_name,
                    self.connection_timeout,
                )
            })
            .await?;
        Ok(circuit.clone())
    }

    /// Record a beacon, returning true if it shows a new or restarted server
    fn observe_beacon(&self, server: SocketAddr, beacon_id: u32) -> bool {
        let Ok(mut beacons) = self.observed_beacons.lock() else {
            return false;
        };
        let previous = beacons.insert(server, (beacon_id, Instant::now()));
        match previous {
            None => true,
            Some((last_id, _)) => beacon_id != last_id.wrapping_add(1),
        }
    }

    fn forget_channel(&self, shared: &Arc<ChannelShared>) -> bool {
        let Ok(mut channels) = self.channels.lock() else {
            return false;
        };
        if channels
            .get(&shared.name)
            .is_some_and(|c| Arc::ptr_eq(c, shared))
        {
            channels.remove(&shared.name);
        }
        channels.contains_key(&shared.name)
    }
}

/// A Channel Access client
///
/// Channels are created by name with [`Client::channel`]. Each is found by
/// searching, connected over a circuit shared with every other channel on the
/// same server, and searched for again whenever that connection is lost.
/// Dropping the client disposes of all of its channels.
pub struct Client {
    context: Arc<ClientContext>,
}

impl Client {
    pub async fn new() -> Result<Client, io::Error> {
        ClientBuilder::new().start().await
    }
    pub async fn new_with(
        search_port: u16,
        broadcast_addresses: Option<Vec<SocketAddr>>,
    ) -> Result<Client, io::Error> {
        let builder = ClientBuilder::new().search_port(search_port);
        match broadcast_addresses {
            Some(addresses) => builder.broadcast_to(addresses),
            None => builder,
        }
        .start()
        .await
    }

    pub fn timeout(&self) -> Duration {
        self.context.timeout
    }

    /// Get a channel for a PV name
    ///
    /// The channel starts searching straight away; use
    /// [`Channel::wait_connected`] to wait for it. Asking for a name that
    /// already has a live channel returns another handle to the same channel.
    pub fn channel(&self, name: &str) -> Channel {
        self.channel_handout(name).0
    }

    /// A handle to the channel for `name`, and whether it was created for this call
    fn channel_handout(&self, name: &str) -> (Channel, bool) {
        let (shared, created) = {
            let Ok(mut channels) = self.context.channels.lock() else {
                // Only a panic elsewhere poisons this; hand back a dead channel
                let shared = ChannelShared::new(name, 0);
                shared.dispose();
                return (Channel::new(shared, self.context.timeout), false);
            };
            match channels.get(name) {
                Some(existing) if !existing.is_disposed() => (existing.clone(), false),
                _ => {
                    let cid = self.context.next_cid.fetch_add(1, Ordering::Relaxed);
                    let shared = ChannelShared::new(name, cid);
                    channels.insert(name.to_owned(), shared.clone());
                    tokio::spawn(drive_channel(self.context.clone(), shared.clone()));
                    (shared, true)
                }
            }
        };
        shared.note_handout();
        (Channel::new(shared, self.context.timeout), created)
    }

    /// Run one operation on a channel, disposing it afterwards if nobody else asked for it
    async fn one_shot<R, F, Fut>(&self, name: &str, operation: F) -> Result<R, ClientError>
    where
        F: FnOnce(Channel) -> Fut,
        Fut: Future<Output = Result<R, ClientError>>,
    {
        let (channel, created) = self.channel_handout(name);
        let shared = channel.shared().clone();
        let result = operation(channel).await;
        if created && shared.handouts() == 1 {
            trace!("Disposing one-shot channel {name}");
            shared.dispose();
        }
        result
    }

    /// Read a single value from a PV
    ///
    /// A channel created just for this read is disposed once it completes.
    pub async fn get<T>(&self, name: &str) -> Result<T, ClientError>
    where
        T: for<'a> TryFrom<&'a DbrValue>,
    {
        self.one_shot(name, |channel| async move { channel.get().await })
            .await
    }

    /// Write a value to a PV, waiting for the server to complete it
    ///
    /// A channel created just for this write is disposed once it completes.
    pub async fn put(&self, name: &str, value: impl Into<DbrValue>) -> Result<(), ClientError> {
        let value = value.into();
        self.one_shot(name, |channel| async move { channel.put(value).await })
            .await
    }

    /// Subscribe to updates from a PV
    pub fn subscribe<T>(&self, name: &str) -> Subscription<T>
    where
        T: for<'a> TryFrom<&'a DbrValue>,
    {
        self.channel(name).subscription()
    }

    /// Servers that have been seen sending beacons, with their last beacon ID
    pub fn observed_servers(&self) -> Vec<(SocketAddr, u32)> {
        self.context
            .observed_beacons
            .lock()
            .map(|b| b.iter().map(|(addr, (id, _))| (*addr, *id)).collect())
            .unwrap_or_default()
    }

    /// Dispose every channel and close all connections
    pub async fn close(&self) {
        self.context.cancel.cancel();
        let channels: Vec<_> = self
            .context
            .channels
            .lock()
            .map(|mut c| c.drain().map(|(_, v)| v).collect())
            .unwrap_or_default();
        for channel in channels {
            channel.dispose();
        }
        let circuits: Vec<_> = self
            .context
            .circuits
            .lock()
            .map(|mut c| c.drain().map(|(_, v)| v).collect())
            .unwrap_or_default();
        for circuit in circuits.iter().filter_map(|slot| slot.get()) {
            circuit.close();
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.context.cancel.cancel();
    }
}

/// Keep one channel connected for as long as it lives
///
/// Searches for the name, attaches the channel to the circuit for the server
/// that answered, then waits for that connection to be lost and starts over.
async fn drive_channel(context: Arc<ClientContext>, shared: Arc<ChannelShared>) {
    let mut info = shared.watch();
    let mut research_delay = INITIAL_RESEARCH_DELAY;
    let max_research_delay = seconds(get_default_max_search_interval());
    let mut searching: bool;

    loop {
        searching = true;
        let found = select! {
            _ = context.cancel.cancelled() => break,
            _ = info.wait_for(|i| i.state == ChannelState::Disposed) => break,
            found = context.searcher.search_for(&shared.name) => found,
        };
        searching = false;

        let circuit = match found {
            Ok(address) => {
                shared.update(|info| info.not_found = false);
                match context.get_or_create_circuit(address).await {
                    Ok(circuit) => Some(circuit),
                    Err(e) => {
                        warn!("Could not connect to {address} for {}: {e}", shared.name);
                        None
                    }
                }
            }
            Err(CouldNotFindError::NotFound) => {
                debug!("Server does not have {}", shared.name);
                shared.update(|info| info.not_found = true);
                None
            }
            Err(CouldNotFindError::NoAnswer) => {
                debug!("No server answered for {}", shared.name);
                None
            }
        };
        let Some(circuit) = circuit else {
            select! {
                _ = context.cancel.cancelled() => break,
                _ = info.wait_for(|i| i.state == ChannelState::Disposed) => break,
                _ = tokio::time::sleep(research_delay) => (),
                _ = context.beacon_anomaly.notified() => trace!("Beacon anomaly, searching again"),
            }
            research_delay = min(research_delay * 2, max_research_delay);
            continue;
        };
        research_delay = INITIAL_RESEARCH_DELAY;

        shared.transition(ChannelState::Requested);
        circuit.attach(shared.clone());
        select! {
            _ = context.cancel.cancelled() => break,
            _ = circuit.closed() => (),
            _ = info.wait_for(|i| {
                matches!(i.state, ChannelState::Disconnected | ChannelState::Disposed)
            }) => (),
        }
        if shared.is_disposed() {
            break;
        }
        debug!("Channel {} lost its connection, searching again", shared.name);
        if info.borrow().create_failed {
            select! {
                _ = context.cancel.cancelled() => break,
                _ = tokio::time::sleep(research_delay) => (),
            }
        }
    }

    shared.dispose();
    let name_still_used = context.forget_channel(&shared);
    if searching && !name_still_used && !context.cancel.is_cancelled() {
        context.searcher.cancel(&shared.name).await;
    }
    trace!("Channel driver for {} finished", shared.name);
}

/// Watch for broadcast beacons, and record their ID and timestamp into the client map
fn watch_beacons(context: Arc<ClientContext>, port: u16) -> Result<(), io::Error> {
    // Bind the socket first, so that we know early if it fails
    let broadcast_socket = new_reusable_udp_socket(SocketAddr::new([0, 0, 0, 0].into(), port))?;
    let stop = context.cancel.clone();

    tokio::spawn(async move {
        let mut buf: Vec<u8> = vec![0; 0xFFFF];

        loop {
            select! {
                _ = stop.cancelled() => break,
                r = broadcast_socket.recv_from(&mut buf) => match r {
                    Ok((size, addr)) => {
                        let Ok((_, beacon)) = RsrvIsUp::parse(&buf[..size]) else {
                            continue;
                        };
                        trace!("Observed beacon: {beacon:?}");
                        let send_ip = beacon.server_ip.map(IpAddr::V4).unwrap_or(addr.ip());
                        let server = (send_ip, beacon.server_port).into();
                        if context.observe_beacon(server, beacon.beacon_id) {
                            debug!("New or restarted server at {send_ip}:{}", beacon.server_port);
                            context.beacon_anomaly.notify_waiters();
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!("Got unresumable error whilst watching beacons: {e:?}");
                        break;
                    }
                }
            }
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn quiet_client() -> Client {
        ClientBuilder::new()
            .broadcast_to(Vec::new())
            .beacon_port(None)
            .timeout(Duration::from_millis(100))
            .start()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn channels_are_shared_by_name() {
        let client = quiet_client().await;
        let first = client.channel("PV:A");
        let second = client.channel("PV:A");
        let other = client.channel("PV:B");
        assert_eq!(first.info().cid, second.info().cid);
        assert_ne!(first.info().cid, other.info().cid);

        first.dispose();
        let replacement = client.channel("PV:A");
        assert_ne!(replacement.info().cid, first.info().cid);
        assert_eq!(second.state(), ChannelState::Disposed);
    }

    #[tokio::test]
    async fn unanswered_get_times_out() {
        let client = quiet_client().await;
        assert!(matches!(
            client.get::<f64>("NOBODY").await,
            Err(ClientError::Timeout)
        ));
    }

    #[tokio::test]
    async fn one_shot_channels_are_disposed() {
        let client = quiet_client().await;
        let kept = client.channel("PV:KEPT");
        assert!(client.get::<f64>("PV:KEPT").await.is_err());
        assert!(client.put("PV:GONE", 1.0).await.is_err());
        assert_eq!(kept.state(), ChannelState::Requested);

        tokio::time::timeout(Duration::from_secs(2), async {
            while client.context.channels.lock().unwrap().contains_key("PV:GONE") {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("One-shot channel was never dropped");
        assert!(client.context.channels.lock().unwrap().contains_key("PV:KEPT"));
    }

    #[tokio::test]
    async fn circuits_connect_independently() {
        let client = quiet_client().await;
        // A connection attempt that never finishes
        let stalled = client
            .context
            .circuit_slot("127.0.0.1:9".parse().unwrap())
            .unwrap();
        let stuck = tokio::spawn(async move {
            let never = std::future::pending::<Result<Circuit, ClientError>>();
            stalled.get_or_try_init(|| never).await.map(|_| ())
        });
        tokio::task::yield_now().await;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let circuit = tokio::time::timeout(
            Duration::from_secs(2),
            client.context.get_or_create_circuit(address),
        )
        .await
        .expect("Connecting waited on another server")
        .unwrap();
        assert_eq!(circuit.address(), address);
        let again = client.context.get_or_create_circuit(address).await.unwrap();
        assert_eq!(again.address(), address);
        assert_eq!(client.context.circuits.lock().unwrap().len(), 2);
        stuck.abort();
        client.close().await;
        assert!(circuit.is_closed());
    }

    #[tokio::test]
    async fn close_disposes_channels() {
        let client = quiet_client().await;
        let channel = client.channel("PV:C");
        client.close().await;
        assert_eq!(channel.state(), ChannelState::Disposed);
    }

    #[tokio::test]
    async fn beacon_anomalies() {
        let client = quiet_client().await;
        let server: SocketAddr = "10.0.0.1:5064".parse().unwrap();
        assert!(client.context.observe_beacon(server, 4));
        assert!(!client.context.observe_beacon(server, 5));
        // Restarted server starts counting again
        assert!(client.context.observe_beacon(server, 0));
        assert_eq!(client.observed_servers(), vec![(server, 0)]);
    }
}
