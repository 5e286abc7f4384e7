use std::{
    cmp::min,
    collections::HashMap,
    future,
    net::SocketAddr,
    pin::Pin,
    time::{Duration, Instant},
};
use tokio::{
    io,
    net::UdpSocket,
    select,
    sync::{broadcast, mpsc, oneshot},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::{
    frame::Frame,
    messages::{self, AsBytes, ClientMessage, Message},
    utils::{
        get_default_max_search_interval, get_default_server_port, get_target_broadcast_ips,
        seconds, wrapping_inplace_add,
    },
};

/// Longest exponent of the doubling search backoff
const MAX_BACKOFF_POWER: u32 = 11;
/// Wait before rebinding a socket that failed
const SOCKET_RETRY_DELAY: Duration = Duration::from_millis(500);

pub struct SearcherBuilder {
    search_port: u16,
    stop_token: CancellationToken,
    broadcast_addresses: Option<Vec<SocketAddr>>,
    timeout: Option<Duration>,
    /// The socket that is UDP bound to receive replies
    bind_address: SocketAddr,
    request_not_found: bool,
}

impl Default for SearcherBuilder {
    fn default() -> Self {
        SearcherBuilder {
            search_port: get_default_server_port(),
            stop_token: CancellationToken::new(),
            broadcast_addresses: None,
            timeout: Some(Duration::from_secs(1)),
            bind_address: SocketAddr::from(([0, 0, 0, 0], 0)),
            request_not_found: false,
        }
    }
}
impl SearcherBuilder {
    pub fn new() -> Self {
        SearcherBuilder::default()
    }
    pub async fn start(self) -> Result<Searcher, io::Error> {
        let (send, request_recv) = mpsc::channel(32);
        let broadcast_addresses = self
            .broadcast_addresses
            .unwrap_or_else(|| get_target_broadcast_ips(self.search_port));
        if broadcast_addresses.is_empty() {
            warn!("No search addresses available; searches will never succeed");
        }
        let searcher = Searcher {
            timeout: self.timeout,
            pending_requests: send,
            stop_token: self.stop_token,
        };
        let socket = bind_search_socket(self.bind_address).await?;
        let state = SearcherInternal {
            broadcast_addresses,
            stop_token: searcher.stop_token.clone(),
            timeout: self.timeout,
            max_interval: seconds(get_default_max_search_interval()),
            bind_address: self.bind_address,
            request_not_found: self.request_not_found,
            ..Default::default()
        };
        tokio::spawn(state.run(socket, request_recv));
        Ok(searcher)
    }
    pub fn stop_token(mut self, token: CancellationToken) -> Self {
        self.stop_token = token.child_token();
        self
    }
    pub fn search_port(mut self, port: u16) -> Self {
        self.search_port = port;
        self
    }
    /// How long to search for a name. `None` searches until cancelled.
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
    pub fn broadcast_to(mut self, addresses: Vec<SocketAddr>) -> Self {
        self.broadcast_addresses = Some(addresses);
        self
    }
    pub fn bind_address(mut self, address: SocketAddr) -> Self {
        self.bind_address = address;
        self
    }
    /// Ask servers to reply when they do not have a name
    ///
    /// The first such reply ends the search, so only ask servers that can
    /// answer for every name searched for.
    pub fn request_not_found(mut self, request: bool) -> Self {
        self.request_not_found = request;
        self
    }
}

async fn bind_search_socket(address: SocketAddr) -> io::Result<UdpSocket> {
    let socket = UdpSocket::bind(address).await?;
    socket.set_broadcast(true)?;
    Ok(socket)
}

#[derive(Debug)]
enum SearchRequest {
    Find(
        String,
        oneshot::Sender<broadcast::Receiver<SearchOutcome>>,
    ),
    Cancel(String),
}

/// Finds the servers hosting PVs, by broadcasting UDP searches
#[derive(Debug)]
pub struct Searcher {
    timeout: Option<Duration>,
    /// Submit requests to search for new PVs
    pending_requests: mpsc::Sender<SearchRequest>,
    stop_token: CancellationToken,
}

impl Searcher {
    pub async fn start() -> Result<Searcher, io::Error> {
        SearcherBuilder::new().start().await
    }
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Get the SocketAddr for the server serving a specific PV
    ///
    /// Concurrent searches for the same name share one set of search messages.
    pub async fn search_for(&self, name: &str) -> SearchOutcome {
        let (ret_send, ret_recv) = oneshot::channel::<broadcast::Receiver<SearchOutcome>>();
        // Send the request into our async search loop
        self.pending_requests
            .send(SearchRequest::Find(name.to_string(), ret_send))
            .await
            .map_err(|_| CouldNotFindError::NoAnswer)?;
        // Get the receiver back from here
        let mut result_receiver = ret_recv.await.map_err(|_| CouldNotFindError::NoAnswer)?;
        // Now, wait on this
        result_receiver
            .recv()
            .await
            .unwrap_or(Err(CouldNotFindError::NoAnswer))
    }

    /// Stop searching for a name. Anyone waiting on it gets [`CouldNotFindError::NoAnswer`].
    pub async fn cancel(&self, name: &str) {
        let _ = self
            .pending_requests
            .send(SearchRequest::Cancel(name.to_string()))
            .await;
    }

    pub fn stop(&self) {
        self.stop_token.cancel();
    }
    pub fn is_cancelled(&self) -> bool {
        self.stop_token.is_cancelled()
    }
}

impl Drop for Searcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Why a search ended without finding a server
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CouldNotFindError {
    #[error("A server reported it does not have the requested PV")]
    NotFound,
    #[error("Could not find the requested PV")]
    NoAnswer,
}

/// The address of the server for a name, or why there is none
pub type SearchOutcome = Result<SocketAddr, CouldNotFindError>;

#[derive(Debug)]
struct SearchAttempt {
    name: String,
    search_expires_at: Option<Instant>,
    active_searches: Vec<u32>,
    next_search_at: Instant,
    /// How are results reported back to the requesters?
    reporter: broadcast::Sender<SearchOutcome>,
}

impl SearchAttempt {
    /// Recalculate timings and return a new search message
    fn new_search(
        &mut self,
        search_id: u32,
        max_interval: Duration,
        should_reply: bool,
    ) -> messages::Search {
        let power = min(self.active_searches.len() as u32, MAX_BACKOFF_POWER);
        let backoff = min(Duration::from_millis(32 * 2u64.pow(power)), max_interval);
        self.active_searches.push(search_id);
        self.next_search_at = Instant::now() + backoff;
        messages::Search {
            search_id,
            channel_name: self.name.clone(),
            should_reply,
            ..Default::default()
        }
    }
}
impl Default for SearchAttempt {
    fn default() -> Self {
        SearchAttempt {
            name: String::new(),
            search_expires_at: None,
            active_searches: Vec::new(),
            next_search_at: Instant::now(),
            reporter: broadcast::Sender::new(1),
        }
    }
}

/// Handle searcher internal state, inside a single Async context
struct SearcherInternal {
    /// Interfaces to broadcast onto
    broadcast_addresses: Vec<SocketAddr>,
    /// Search IDs of outstanding requests to the PV name
    in_flight: HashMap<u32, String>,
    /// Data about all the PVs we are searching for
    per_pv_info: HashMap<String, SearchAttempt>,
    stop_token: CancellationToken,
    /// The next search ID to send
    search_id: u32,
    timeout: Option<Duration>,
    max_interval: Duration,
    bind_address: SocketAddr,
    request_not_found: bool,
}

impl Default for SearcherInternal {
    fn default() -> Self {
        SearcherInternal {
            broadcast_addresses: Vec::new(),
            in_flight: HashMap::new(),
            per_pv_info: HashMap::new(),
            stop_token: CancellationToken::new(),
            search_id: 0,
            timeout: None,
            max_interval: Duration::from_secs(300),
            bind_address: SocketAddr::from(([0, 0, 0, 0], 0)),
            request_not_found: false,
        }
    }
}

impl SearcherInternal {
    async fn run(
        mut self,
        mut socket: UdpSocket,
        mut incoming_requests: mpsc::Receiver<SearchRequest>,
    ) {
        let mut buffer = vec![0u8; 0xFFFF];
        loop {
            let mut requests = Vec::new();
            select! {
                _ = self.stop_token.cancelled() => break,
                _ = incoming_requests.recv_many(&mut requests, 32) => if requests.is_empty() {
                    break;
                } else if let Some(packet) = self.handle_new_requests(requests) {
                    self.send_to_all(&socket, &packet).await;
                },
                result = socket.recv_from(&mut buffer) => match result {
                    Ok((size, sender)) => {
                        let datagram = Frame::from_bytes(&buffer[..size]).with_sender(sender);
                        self.handle_response(datagram);
                    }
                    Err(e) => {
                        error!("Error waiting for search responses: {e}");
                        // Searches are idempotent, so a fresh socket loses nothing
                        match self.rebind().await {
                            Some(new_socket) => socket = new_socket,
                            None => break,
                        }
                    },
                },
                _ = self.next_attempt() => if let Some(buf) = self.handle_retries_and_timeouts() {
                    self.send_to_all(&socket, &buf).await;
                },
            };
        }
        // Anyone still waiting will never get an answer
        for (_, info) in self.per_pv_info.drain() {
            let _ = info.reporter.send(Err(CouldNotFindError::NoAnswer));
        }
        debug!("Searcher stopped");
    }

    async fn rebind(&self) -> Option<UdpSocket> {
        loop {
            select! {
                _ = self.stop_token.cancelled() => return None,
                _ = tokio::time::sleep(SOCKET_RETRY_DELAY) => (),
            }
            match bind_search_socket(self.bind_address).await {
                Ok(socket) => {
                    debug!("Recreated search socket");
                    return Some(socket);
                }
                Err(e) => warn!("Could not recreate search socket: {e}"),
            }
        }
    }

    async fn send_to_all(&self, socket: &UdpSocket, packet: &[u8]) {
        for addr in &self.broadcast_addresses {
            trace!("Sending search packet to: {addr}");
            if let Err(e) = socket.send_to(packet, *addr).await {
                warn!("Failed to send search to {addr}: {e}");
            }
        }
    }

    /// Wait until it's time for the next tracked attempt
    fn next_attempt(&self) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>> {
        let next_wake = self
            .per_pv_info
            .values()
            .flat_map(|v| [Some(v.next_search_at), v.search_expires_at])
            .flatten()
            .min();
        match next_wake {
            None => Box::pin(future::pending()),
            Some(instant) => {
                if instant < Instant::now() {
                    Box::pin(future::ready(()))
                } else {
                    Box::pin(tokio::time::sleep_until(tokio::time::Instant::from_std(
                        instant,
                    )))
                }
            }
        }
    }

    /// Register new requests, and build a single search packet for the new names
    fn handle_new_requests(&mut self, requests: Vec<SearchRequest>) -> Option<Vec<u8>> {
        let mut messages = Vec::new();
        for request in requests {
            let (name, waiter_reply) = match request {
                SearchRequest::Find(name, reply) => (name, reply),
                SearchRequest::Cancel(name) => {
                    self.cancel_search(&name);
                    continue;
                }
            };
            if let Some(info) = self.per_pv_info.get(&name) {
                // Already searching; just wait alongside
                let _ = waiter_reply.send(info.reporter.subscribe());
                continue;
            }
            let mut info = SearchAttempt {
                name: name.clone(),
                search_expires_at: self.timeout.map(|t| Instant::now() + t),
                ..Default::default()
            };
            // Give the requester a place to wait for replies
            let _ = waiter_reply.send(info.reporter.subscribe());
            let search_id = wrapping_inplace_add(&mut self.search_id);
            self.in_flight.insert(search_id, name.clone());
            messages.push(Message::Search(info.new_search(
                search_id,
                self.max_interval,
                self.request_not_found,
            )));
            self.per_pv_info.insert(name.clone(), info);
            debug!("Sending search for {name}");
        }
        if messages.is_empty() {
            return None;
        }
        Some(
            std::iter::once(Message::Version(messages::Version::default()))
                .chain(messages)
                .flat_map(|m| m.as_bytes())
                .collect(),
        )
    }

    fn cancel_search(&mut self, name: &str) {
        if let Some(info) = self.per_pv_info.remove(name) {
            debug!("Cancelling search for {name}");
            for id in info.active_searches {
                self.in_flight.remove(&id);
            }
            let _ = info.reporter.send(Err(CouldNotFindError::NoAnswer));
        }
    }

    /// End the search that `search_id` belongs to, telling everyone waiting on it
    fn finish_search(&mut self, search_id: u32, outcome: SearchOutcome) {
        // What was this a response to?
        let Some(pv_name) = self.in_flight.remove(&search_id) else {
            debug!("Received unrequested or duplicate search response");
            return;
        };
        let Some(info) = self.per_pv_info.remove(&pv_name) else {
            return;
        };
        for search_id in info.active_searches {
            self.in_flight.remove(&search_id);
        }
        match outcome {
            Ok(server) => debug!("Found server for {pv_name}: {server}"),
            Err(_) => debug!("Server reported it does not have {pv_name}"),
        }
        let _ = info.reporter.send(outcome);
    }

    /// Handle one datagram, tagged with the address it came from
    fn handle_response(&mut self, datagram: Frame) {
        let Some(sender) = datagram.sender() else {
            warn!("Search response with no sender address");
            return;
        };
        let Ok(messages) = ClientMessage::from_datagram(datagram) else {
            warn!("Received unparseable search response from {sender}");
            return;
        };
        for message in messages {
            match message {
                ClientMessage::SearchResponse(response) => {
                    let server_origin = (
                        response.server_ip.map(|i| i.into()).unwrap_or(sender.ip()),
                        response.port_number,
                    )
                        .into();
                    self.finish_search(response.search_id, Ok(server_origin));
                }
                ClientMessage::Version(_) => continue,
                ClientMessage::NotFound(msg) => {
                    trace!("{sender} does not have search {}", msg.search_id);
                    self.finish_search(msg.search_id, Err(CouldNotFindError::NotFound));
                }
                m => warn!("Received unexpected search response: {m:?}"),
            }
        }
    }

    fn handle_retries_and_timeouts(&mut self) -> Option<Vec<u8>> {
        let now = Instant::now();

        // discard any expired searches
        self.per_pv_info.retain(|_, v| match v.search_expires_at {
            Some(time) if time < now => {
                // We are discarding this. Send the termination signal,
                let _ = v.reporter.send(Err(CouldNotFindError::NoAnswer));
                // And then remove from the in-flight register
                for id in v.active_searches.iter() {
                    let _ = self.in_flight.remove(id);
                }
                debug!(
                    "Dropping search for {} as reached search timeout {:.2} ms ago",
                    v.name,
                    (now - time).as_secs_f32() * 1000.0
                );
                false
            }
            _ => true,
        });

        let mut search_messages = Vec::new();
        for attempt in self.per_pv_info.values_mut() {
            if attempt.next_search_at > now {
                continue;
            }
            trace!("Sending retry search for: {}", attempt.name);
            let search_id = wrapping_inplace_add(&mut self.search_id);
            self.in_flight.insert(search_id, attempt.name.clone());
            search_messages.push(Message::Search(attempt.new_search(
                search_id,
                self.max_interval,
                self.request_not_found,
            )));
        }

        if search_messages.is_empty() {
            return None;
        }
        Some(
            std::iter::once(Message::Version(messages::Version::default()))
                .chain(search_messages)
                .flat_map(|m| m.as_bytes())
                .collect(),
        )
    }
}
