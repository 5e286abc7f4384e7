//! Serving PVs from a [`Provider`] over Channel Access
//!
//! A running server has three jobs: answering UDP searches for names its
//! provider knows, broadcasting beacons so clients notice it, and accepting
//! TCP circuits. Each circuit runs as its own task, see [`circuit`].

mod circuit;

use std::{
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};

use tokio::{
    net::{TcpListener, UdpSocket},
    select,
    task::{JoinError, JoinHandle, JoinSet},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{
    Provider,
    frame::Frame,
    messages::{self, AsBytes, ClientMessage, Message},
    utils::{
        get_default_beacon_period, get_default_beacon_port, get_default_server_port,
        get_target_broadcast_ips, new_reusable_udp_socket, seconds, wrapping_inplace_add,
    },
};

/// First gap between beacons after startup, doubling up to the beacon period
const INITIAL_BEACON_INTERVAL: Duration = Duration::from_millis(20);
/// Wait before rebinding a search socket that failed
const SOCKET_RETRY_DELAY: Duration = Duration::from_millis(500);

pub struct ServerBuilder<P: Provider> {
    provider: P,
    connection_port: u16,
    search_port: u16,
    beacon_port: u16,
    beacons: bool,
    beacon_period: Duration,
}

impl<P: Provider> ServerBuilder<P> {
    /// Build a server with ports and periods from the `EPICS_CA_*` environment
    pub fn new(provider: P) -> ServerBuilder<P> {
        ServerBuilder {
            provider,
            connection_port: get_default_server_port(),
            search_port: get_default_server_port(),
            beacon_port: get_default_beacon_port(),
            beacons: true,
            beacon_period: seconds(get_default_beacon_period()),
        }
    }
    /// TCP port for circuits. Zero picks a free port.
    pub fn connection_port(mut self, port: u16) -> ServerBuilder<P> {
        self.connection_port = port;
        self
    }
    /// UDP port to listen for searches on. Zero picks a free port.
    pub fn search_port(mut self, port: u16) -> ServerBuilder<P> {
        self.search_port = port;
        self
    }
    pub fn beacon_port(mut self, port: u16) -> ServerBuilder<P> {
        self.beacon_port = port;
        self
    }
    /// Whether to broadcast beacons at all
    pub fn beacons(mut self, enabled: bool) -> ServerBuilder<P> {
        self.beacons = enabled;
        self
    }
    pub fn beacon_period(mut self, period: Duration) -> ServerBuilder<P> {
        self.beacon_period = period;
        self
    }

    /// Bind the server sockets and start serving
    pub async fn start(self) -> std::io::Result<ServerHandle> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, self.connection_port)).await?;
        let connection_port = listener.local_addr()?.port();
        let search_socket = new_reusable_udp_socket((Ipv4Addr::UNSPECIFIED, self.search_port))?;
        let search_port = search_socket.local_addr()?.port();
        info!("Serving circuits on port {connection_port}, searches on port {search_port}");

        let cancel = CancellationToken::new();
        self.provider.start(cancel.child_token());

        let mut tasks = JoinSet::new();
        tasks.spawn(respond_to_searches(
            search_socket,
            connection_port,
            self.provider.clone(),
            cancel.clone(),
        ));
        if self.beacons {
            let targets = get_target_broadcast_ips(self.beacon_port);
            if targets.is_empty() {
                warn!("No beacon addresses found, not sending beacons");
            } else {
                tasks.spawn(send_beacons(
                    targets,
                    connection_port,
                    self.beacon_period,
                    cancel.clone(),
                ));
            }
        }
        tasks.spawn(accept_circuits(listener, self.provider, cancel.clone()));

        let stop = cancel.clone();
        let handle = tokio::spawn(async move {
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    error!("Server task failed: {e}");
                    stop.cancel();
                }
            }
            debug!("Server stopped");
        });

        Ok(ServerHandle {
            cancel,
            handle: Some(handle),
            connection_port,
            search_port,
        })
    }
}

/// A running server, stopped when this is dropped
pub struct ServerHandle {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
    connection_port: u16,
    search_port: u16,
}

impl ServerHandle {
    pub fn connection_port(&self) -> u16 {
        self.connection_port
    }
    pub fn search_port(&self) -> u16 {
        self.search_port
    }
    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
    /// Stop serving, closing every circuit, and wait for the tasks to end
    pub async fn stop(mut self) -> Result<(), JoinError> {
        self.cancel.cancel();
        self.join_inner().await
    }
    /// Wait until the server stops for some other reason
    pub async fn join(mut self) -> Result<(), JoinError> {
        self.join_inner().await
    }
    async fn join_inner(&mut self) -> Result<(), JoinError> {
        match self.handle.take() {
            Some(handle) => handle.await,
            None => Ok(()),
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Reply to every search for a name the provider knows
///
/// A socket that fails to receive is closed and bound again on the same
/// address; searches are repeated by clients, so nothing is lost for good.
async fn respond_to_searches<P: Provider>(
    mut socket: UdpSocket,
    connection_port: u16,
    provider: P,
    stop: CancellationToken,
) {
    let mut buf = vec![0u8; 0xFFFF];
    loop {
        let datagram = select! {
            _ = stop.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok((size, origin)) => Frame::from_bytes(&buf[..size]).with_sender(origin),
                Err(e) => {
                    error!("Error receiving search datagram: {e}");
                    match rebind_search_socket(&socket, &stop).await {
                        Some(new_socket) => socket = new_socket,
                        None => break,
                    }
                    continue;
                }
            },
        };
        let Some((origin, packet)) = answer_datagram(datagram, connection_port, &provider) else {
            continue;
        };
        if let Err(e) = socket.send_to(&packet, origin).await {
            warn!("Could not answer search from {origin}: {e}");
        }
    }
    debug!("Stopped answering searches");
}

/// Open a fresh socket on the address of one that failed
async fn rebind_search_socket(failed: &UdpSocket, stop: &CancellationToken) -> Option<UdpSocket> {
    let address = match failed.local_addr() {
        Ok(address) => address,
        Err(e) => {
            error!("Search socket has no address, cannot recreate it: {e}");
            return None;
        }
    };
    loop {
        select! {
            _ = stop.cancelled() => return None,
            _ = tokio::time::sleep(SOCKET_RETRY_DELAY) => (),
        }
        match new_reusable_udp_socket(address) {
            Ok(socket) => {
                debug!("Recreated search socket on {address}");
                return Some(socket);
            }
            Err(e) => warn!("Could not recreate search socket: {e}"),
        }
    }
}

/// The reply packet for one received datagram, and where to send it
fn answer_datagram<P: Provider>(
    datagram: Frame,
    connection_port: u16,
    provider: &P,
) -> Option<(SocketAddr, Vec<u8>)> {
    let origin = datagram.sender()?;
    let messages = match Message::from_datagram(datagram) {
        Ok(messages) => messages,
        Err(e) => {
            debug!("Ignoring malformed datagram from {origin}: {e}");
            return None;
        }
    };
    let replies = search_replies(&messages, connection_port, provider);
    if replies.is_empty() {
        return None;
    }
    trace!("Answering {origin}: {replies:?}");
    Some((origin, replies.iter().flat_map(|m| m.as_bytes()).collect()))
}

/// Build the datagram answering one search datagram
///
/// Replies start with the server version, and are empty when nothing
/// asked for was found.
fn search_replies<P: Provider>(
    messages: &[Message],
    connection_port: u16,
    provider: &P,
) -> Vec<ClientMessage> {
    let mut replies: Vec<ClientMessage> = messages
        .iter()
        .filter_map(|message| match message {
            Message::Search(search) if provider.provides(&search.channel_name) => {
                debug!("Found {} for search {}", search.channel_name, search.search_id);
                Some(search.respond(None, connection_port, true).into())
            }
            Message::Search(search) if search.should_reply => Some(search.not_found().into()),
            _ => None,
        })
        .collect();
    if !replies.is_empty() {
        replies.insert(0, messages::Version::default().into());
    }
    replies
}

async fn send_beacons(
    targets: Vec<SocketAddr>,
    connection_port: u16,
    period: Duration,
    stop: CancellationToken,
) {
    let socket = match new_reusable_udp_socket((Ipv4Addr::UNSPECIFIED, 0)) {
        Ok(socket) => socket,
        Err(e) => {
            error!("Could not open beacon socket, not sending beacons: {e}");
            return;
        }
    };
    debug!("Sending beacons to {targets:?}");
    let mut beacon_id = 0u32;
    let mut interval = INITIAL_BEACON_INTERVAL.min(period);
    loop {
        let beacon = messages::RsrvIsUp {
            server_port: connection_port,
            beacon_id: wrapping_inplace_add(&mut beacon_id),
            ..Default::default()
        };
        let packet = beacon.as_bytes();
        for target in &targets {
            if let Err(e) = socket.send_to(&packet, target).await {
                trace!("Failed to send beacon to {target}: {e}");
            }
        }
        select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(interval) => (),
        }
        interval = (interval * 2).min(period);
    }
}

async fn accept_circuits<P: Provider>(listener: TcpListener, provider: P, stop: CancellationToken) {
    let mut circuits = JoinSet::new();
    loop {
        select! {
            _ = stop.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!("Could not set nodelay on circuit from {peer}: {e}");
                    }
                    circuits.spawn(circuit::serve_circuit(
                        stream,
                        peer,
                        provider.clone(),
                        stop.child_token(),
                    ));
                }
                Err(e) => {
                    error!("Failed to accept circuit: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            // Reap finished circuits
            Some(_) = circuits.join_next(), if !circuits.is_empty() => (),
        }
    }
    while circuits.join_next().await.is_some() {}
}
