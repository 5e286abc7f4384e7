//! A virtual circuit: one TCP connection to one server, carrying many channels.
//!
//! [`Circuit`] is a cheap handle that feeds requests to a task owning the
//! socket. That task hands every decoded message and every request to
//! [`CircuitState`], which holds all of the per-connection maps, so dispatch
//! for one connection never overlaps itself.

use std::{
    cmp::max,
    collections::HashMap,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::{
    io::{AsyncWriteExt, split},
    net::TcpStream,
    select,
    sync::{mpsc, oneshot},
};
use tokio_stream::StreamExt;
use tokio_util::{codec::FramedRead, sync::CancellationToken};
use tracing::{debug, debug_span, error, trace, warn};

use crate::{
    client::{
        ClientError,
        channel::{ChannelShared, ChannelState, MonitorOptions},
    },
    dbr::{DBR_CLASS_NAME, Dbr, DbrBasicType, DbrCategory, DbrType, DbrValue},
    frame::Command,
    messages::{self, ClientMessage, ErrorCondition, Message},
    splitter::PacketSplitter,
    utils::wrapping_inplace_add,
};

#[derive(Debug)]
pub(crate) enum CircuitRequest {
    /// Ask the server to create a channel, and route its traffic here
    CreateChannel(Arc<ChannelShared>),
    /// Read a single value from the server
    Read {
        cid: u32,
        category: DbrCategory,
        count: usize,
        reply: oneshot::Sender<Result<Dbr, ClientError>>,
    },
    /// Write a value. Without a reply channel, the server is not asked to confirm.
    Write {
        cid: u32,
        value: DbrValue,
        reply: Option<oneshot::Sender<Result<(), ClientError>>>,
    },
    /// Start, or refresh the options of, the subscription for a channel
    Monitor { cid: u32 },
    CancelMonitor { cid: u32 },
    ClearChannel { cid: u32 },
}

#[derive(Clone, Debug)]
pub(crate) struct Circuit {
    address: SocketAddr,
    cancel: CancellationToken,
    requests_tx: mpsc::UnboundedSender<CircuitRequest>,
}

impl Circuit {
    pub async fn connect(
        address: &SocketAddr,
        client_name: &str,
        host_name: &str,
        connection_timeout: Duration,
    ) -> Result<Self, ClientError> {
        debug!("Connecting new Circuit to {address}");
        let mut tcp = tokio::time::timeout(connection_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| ClientError::Timeout)??;
        tcp.set_nodelay(true)?;

        // The server's VERSION is handled as part of the normal message flow
        Message::write_all_messages(
            &[
                messages::Version::default().into(),
                messages::HostName {
                    name: host_name.to_owned(),
                }
                .into(),
                messages::ClientName {
                    name: client_name.to_owned(),
                }
                .into(),
            ],
            &mut tcp,
        )
        .await?;

        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let inner_cancel = cancel.clone();
        let inner_address = *address;
        tokio::spawn(async move {
            CircuitInternal {
                address: inner_address,
                requests_rx,
                cancel: inner_cancel,
                state: CircuitState::new(inner_address),
                last_echo_sent_at: Instant::now(),
                last_received_message_at: Instant::now(),
                echo_period: connection_timeout / 2,
            }
            .circuit_lifecycle(tcp)
            .await;
        });

        debug!("Circuit Ready.");
        Ok(Circuit {
            address: *address,
            cancel,
            requests_tx,
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn send(&self, request: CircuitRequest) {
        if let Err(mpsc::error::SendError(request)) = self.requests_tx.send(request) {
            debug!("Dropping request to closed circuit {}: {request:?}", self.address);
        }
    }

    /// Bind a channel to this circuit and ask the server to create it
    pub fn attach(&self, channel: Arc<ChannelShared>) {
        channel.set_circuit(Some(self.clone()));
        self.send(CircuitRequest::CreateChannel(channel));
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.requests_tx.is_closed()
    }

    /// Wait for the circuit to shut down
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

/// A request waiting on a server reply, keyed by IOID
#[derive(Debug)]
enum PendingRequest {
    Read {
        cid: u32,
        reply: oneshot::Sender<Result<Dbr, ClientError>>,
    },
    Write {
        cid: u32,
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
}

impl PendingRequest {
    fn cid(&self) -> u32 {
        match self {
            PendingRequest::Read { cid, .. } | PendingRequest::Write { cid, .. } => *cid,
        }
    }
    fn fail(self, error: ClientError) {
        // The caller may have timed out and gone away
        match self {
            PendingRequest::Read { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            PendingRequest::Write { reply, .. } => {
                let _ = reply.send(Err(error));
            }
        }
    }
}

/// Turn a status code sent by the server into a result
fn check_status(status_code: u32) -> Result<(), ClientError> {
    match ErrorCondition::from_status_code(status_code) {
        Some(condition) if condition.is_success() => Ok(()),
        Some(condition) => Err(ClientError::ServerError {
            condition,
            message: condition.to_string(),
        }),
        None => Err(ClientError::ServerSentInvalidMessage),
    }
}

/// Convert a value to the native type of a channel, ready to send
fn encode_for_channel(
    value: &DbrValue,
    native_type: DbrBasicType,
) -> Result<(usize, Vec<u8>), ClientError> {
    let converted = match value {
        // Numeric text is parsed; a string into a char array is sent as its bytes
        DbrValue::String(_)
            if !matches!(native_type, DbrBasicType::String | DbrBasicType::Char) =>
        {
            value
                .parse_into(native_type)
                .map_err(|_| ClientError::NoConvert)?
        }
        _ => value
            .convert_to(native_type)
            .map_err(|_| ClientError::NoConvert)?,
    };
    Ok(converted.to_bytes(None))
}

/// All of the per-connection bookkeeping, driven one event at a time
#[derive(Debug)]
pub(crate) struct CircuitState {
    address: SocketAddr,
    /// Channels on this circuit, by client id
    channels: HashMap<u32, Arc<ChannelShared>>,
    /// Server id to client id
    server_ids: HashMap<u32, u32>,
    /// Read and write requests waiting on the server, by IOID
    pending: HashMap<u32, PendingRequest>,
    /// Subscriptions we have asked the server for, by client id
    monitoring: HashMap<u32, MonitorOptions>,
    next_ioid: u32,
    echo_outstanding: bool,
}

impl CircuitState {
    pub fn new(address: SocketAddr) -> Self {
        CircuitState {
            address,
            channels: HashMap::new(),
            server_ids: HashMap::new(),
            pending: HashMap::new(),
            monitoring: HashMap::new(),
            next_ioid: 1,
            echo_outstanding: false,
        }
    }

    pub fn echo_outstanding(&self) -> bool {
        self.echo_outstanding
    }

    /// Record that we sent an ECHO of our own
    pub fn echo_sent(&mut self) {
        self.echo_outstanding = true;
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn connected_channel(&self, cid: u32) -> Option<(Arc<ChannelShared>, u32, DbrBasicType)> {
        let channel = self.channels.get(&cid)?.clone();
        let info = channel.info();
        match (info.state, info.sid, info.native_type) {
            (ChannelState::Connected, Some(sid), Some(native)) => Some((channel, sid, native)),
            _ => None,
        }
    }

    fn event_add(&mut self, cid: u32) -> Vec<Message> {
        let Some((channel, sid, native)) = self.connected_channel(cid) else {
            // Sent once the channel connects
            return Vec::new();
        };
        let options = channel.monitor_options();
        let mut messages = Vec::new();
        match self.monitoring.get(&cid) {
            Some(current) if *current == options => return messages,
            Some(current) => {
                debug!("Re-issuing subscription for {cid} with new options");
                messages.push(
                    messages::EventCancel {
                        data_type: DbrType::new(native, current.category),
                        data_count: current.count as u32,
                        server_id: sid,
                        subscription_id: cid,
                    }
                    .into(),
                );
            }
            None => (),
        }
        messages.push(
            messages::EventAdd {
                data_type: DbrType::new(native, options.category),
                data_count: options.count as u32,
                server_id: sid,
                subscription_id: cid,
                mask: options.mask,
            }
            .into(),
        );
        self.monitoring.insert(cid, options);
        messages
    }

    fn event_cancel(&mut self, cid: u32) -> Vec<Message> {
        let Some(options) = self.monitoring.remove(&cid) else {
            return Vec::new();
        };
        let Some((_, sid, native)) = self.connected_channel(cid) else {
            return Vec::new();
        };
        vec![
            messages::EventCancel {
                data_type: DbrType::new(native, options.category),
                data_count: options.count as u32,
                server_id: sid,
                subscription_id: cid,
            }
            .into(),
        ]
    }

    /// Forget a channel, failing everything still waiting on it
    fn drop_channel(
        &mut self,
        cid: u32,
        error: impl Fn() -> ClientError,
    ) -> Option<Arc<ChannelShared>> {
        let channel = self.channels.remove(&cid)?;
        self.server_ids.retain(|_, c| *c != cid);
        self.monitoring.remove(&cid);
        let ioids: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, p)| p.cid() == cid)
            .map(|(ioid, _)| *ioid)
            .collect();
        for ioid in ioids {
            if let Some(pending) = self.pending.remove(&ioid) {
                pending.fail(error());
            }
        }
        Some(channel)
    }

    pub fn handle_request(&mut self, request: CircuitRequest) -> Vec<Message> {
        match request {
            CircuitRequest::CreateChannel(channel) => {
                let cid = channel.cid;
                let _span = debug_span!("create_channel", cid = cid).entered();
                if channel.is_disposed() {
                    debug!("Not creating disposed channel {}", channel.name);
                    return Vec::new();
                }
                debug!("Creating channel '{}' cid: {cid}", channel.name);
                let address = self.address;
                channel.update(|info| {
                    info.state = ChannelState::Requested;
                    info.server = Some(address);
                    info.create_failed = false;
                    info.sid = None;
                });
                let name = channel.name.clone();
                self.channels.insert(cid, channel);
                vec![
                    messages::CreateChannel {
                        client_id: cid,
                        channel_name: name,
                        ..Default::default()
                    }
                    .into(),
                ]
            }
            CircuitRequest::Read {
                cid,
                category,
                count,
                reply,
            } => {
                let _span = debug_span!("handle_request", cid = cid).entered();
                let Some((channel, sid, native)) = self.connected_channel(cid) else {
                    let _ = reply.send(Err(ClientError::Disconnected));
                    return Vec::new();
                };
                let ioid = wrapping_inplace_add(&mut self.next_ioid);
                debug!("Sending read request {ioid} for channel {cid} ({})", channel.name);
                self.pending
                    .insert(ioid, PendingRequest::Read { cid, reply });
                let data_type = match category {
                    DbrCategory::ClassName => DBR_CLASS_NAME,
                    category => DbrType::new(native, category),
                };
                vec![
                    messages::ReadNotify {
                        data_type,
                        data_count: count as u32,
                        server_id: sid,
                        client_ioid: ioid,
                    }
                    .into(),
                ]
            }
            CircuitRequest::Write { cid, value, reply } => {
                let _span = debug_span!("handle_request", cid = cid).entered();
                let Some((_, sid, native)) = self.connected_channel(cid) else {
                    if let Some(reply) = reply {
                        let _ = reply.send(Err(ClientError::Disconnected));
                    }
                    return Vec::new();
                };
                let (data_count, data) = match encode_for_channel(&value, native) {
                    Ok(encoded) => encoded,
                    Err(e) => {
                        debug!("Could not convert {value:?} to {native:?}");
                        if let Some(reply) = reply {
                            let _ = reply.send(Err(e));
                        }
                        return Vec::new();
                    }
                };
                let ioid = wrapping_inplace_add(&mut self.next_ioid);
                let data_type = DbrType::new(native, DbrCategory::Basic);
                match reply {
                    Some(reply) => {
                        debug!("Sending write request {ioid} for channel {cid}");
                        self.pending
                            .insert(ioid, PendingRequest::Write { cid, reply });
                        vec![
                            messages::WriteNotify {
                                data_type,
                                data_count: data_count as u32,
                                server_id: sid,
                                client_ioid: ioid,
                                data,
                            }
                            .into(),
                        ]
                    }
                    None => vec![
                        messages::Write {
                            data_type,
                            data_count: data_count as u32,
                            server_id: sid,
                            client_ioid: ioid,
                            data,
                        }
                        .into(),
                    ],
                }
            }
            CircuitRequest::Monitor { cid } => self.event_add(cid),
            CircuitRequest::CancelMonitor { cid } => self.event_cancel(cid),
            CircuitRequest::ClearChannel { cid } => {
                let _span = debug_span!("handle_request", cid = cid).entered();
                let sid = self.connected_channel(cid).map(|(_, sid, _)| sid);
                if self
                    .drop_channel(cid, || ClientError::ChannelDisposed)
                    .is_none()
                {
                    return Vec::new();
                }
                debug!("Clearing channel {cid}");
                match sid {
                    Some(server_id) => vec![
                        messages::ClearChannel {
                            server_id,
                            client_id: cid,
                        }
                        .into(),
                    ],
                    None => Vec::new(),
                }
            }
        }
    }

    pub fn handle_message(&mut self, message: ClientMessage) -> Vec<Message> {
        trace!("Received message: {message:?}");
        match message {
            ClientMessage::Version(version) => {
                if !version.is_compatible() {
                    warn!(
                        "Server {} speaks incompatible protocol version {}",
                        self.address, version.protocol_version
                    );
                }
                Vec::new()
            }
            ClientMessage::Echo => {
                if self.echo_outstanding {
                    self.echo_outstanding = false;
                    Vec::new()
                } else {
                    vec![Message::Echo]
                }
            }
            ClientMessage::AccessRights(msg) => {
                let _span = debug_span!("handle_message", cid = &msg.client_id).entered();
                let Some(channel) = self.channels.get(&msg.client_id) else {
                    debug!("Got message for closed/uncreated channel");
                    return Vec::new();
                };
                debug!("Got AccessRights update: {}", msg.access_rights);
                channel.update(|info| info.access = msg.access_rights);
                Vec::new()
            }
            ClientMessage::CreateChannelResponse(msg) => {
                let _span = debug_span!("handle_message", cid = &msg.client_id).entered();
                let Some(channel) = self.channels.get(&msg.client_id).cloned() else {
                    debug!("Got message for closed/uncreated channel: {msg:?}");
                    return Vec::new();
                };
                let connected = channel.update(|info| {
                    info.state = ChannelState::Connected;
                    info.sid = Some(msg.server_id);
                    info.native_type = Some(msg.data_type);
                    info.native_count = msg.data_count;
                    info.create_failed = false;
                });
                if !connected {
                    return Vec::new();
                }
                debug!(
                    "Channel {} connected as {:?}[{}]",
                    channel.name, msg.data_type, msg.data_count
                );
                let wants_monitor = channel.wants_monitor();
                self.server_ids.insert(msg.server_id, msg.client_id);
                if wants_monitor {
                    self.event_add(msg.client_id)
                } else {
                    Vec::new()
                }
            }
            ClientMessage::CreateChannelFailure(msg) => {
                let _span = debug_span!("handle_message", cid = &msg.client_id).entered();
                let failed = || ClientError::ChannelCreateFailed;
                let Some(channel) = self.drop_channel(msg.client_id, failed) else {
                    warn!(
                        "Got channel failure message for a nonexistent channel {}",
                        msg.client_id
                    );
                    return Vec::new();
                };
                warn!("Server refused to create channel {}", channel.name);
                channel.set_circuit(None);
                channel.update(|info| {
                    info.state = ChannelState::Disconnected;
                    info.create_failed = true;
                });
                Vec::new()
            }
            ClientMessage::ReadNotifyResponse(msg) => {
                let Some(pending) = self.pending.remove(&msg.client_ioid) else {
                    warn!("Got ReadNotifyResponse for apparently unknown read request?! {msg:?}");
                    return Vec::new();
                };
                let (cid, reply) = match pending {
                    PendingRequest::Read { cid, reply } => (cid, reply),
                    other => {
                        warn!("Got a read response to write request {}", msg.client_ioid);
                        other.fail(ClientError::ServerSentInvalidMessage);
                        return Vec::new();
                    }
                };
                let _span = debug_span!("handle_message", cid = cid).entered();
                let result = check_status(msg.status_code).and_then(|_| {
                    Dbr::from_bytes(msg.data_type, msg.data_count as usize, &msg.data)
                        .map_err(ClientError::from)
                });
                if let Err(e) = &result {
                    debug!("Read {} failed: {e}", msg.client_ioid);
                }
                let _ = reply.send(result);
                Vec::new()
            }
            ClientMessage::WriteNotifyResponse(msg) => {
                let Some(pending) = self.pending.remove(&msg.client_ioid) else {
                    warn!("Got WriteNotifyResponse for unknown write request {msg:?}");
                    return Vec::new();
                };
                let reply = match pending {
                    PendingRequest::Write { reply, .. } => reply,
                    other => {
                        warn!("Got a write response to read request {}", msg.client_ioid);
                        other.fail(ClientError::ServerSentInvalidMessage);
                        return Vec::new();
                    }
                };
                let _ = reply.send(check_status(msg.status_code));
                Vec::new()
            }
            ClientMessage::EventAddResponse(msg) => {
                let cid = msg.subscription_id;
                let _span = debug_span!("handle_message", cid = cid).entered();
                let Some(channel) = self.channels.get(&cid).cloned() else {
                    debug!("Got subscription message without associated channel: {cid}");
                    return Vec::new();
                };
                if msg.data.is_empty() {
                    debug!("Server confirmed cancelling subscription {cid}");
                    return Vec::new();
                }
                if let Err(e) = check_status(msg.status_code) {
                    warn!("Subscription {cid} reported error: {e}");
                    return Vec::new();
                }
                let dbr = match Dbr::from_bytes(msg.data_type, msg.data_count as usize, &msg.data) {
                    Ok(dbr) => dbr,
                    Err(e) => {
                        error!("Got invalid subscription response from server: {e}");
                        return Vec::new();
                    }
                };
                trace!("Got subscription {cid} update: {dbr:?}");
                if !channel.deliver(&dbr) {
                    debug!("No more receivers for {cid}: Cancelling");
                    return self.event_cancel(cid);
                }
                Vec::new()
            }
            ClientMessage::ServerDisconnect(msg) => {
                let Some(cid) = self.server_ids.get(&msg.server_id).copied() else {
                    debug!("Server disconnected unknown server id {}", msg.server_id);
                    return Vec::new();
                };
                let _span = debug_span!("handle_message", cid = cid).entered();
                if let Some(channel) = self.drop_channel(cid, || ClientError::Disconnected) {
                    debug!("Server dropped channel {}", channel.name);
                    channel.set_circuit(None);
                    channel.transition(ChannelState::Disconnected);
                }
                Vec::new()
            }
            ClientMessage::ECAError(msg) => {
                let original = &msg.original_request;
                let error = || ClientError::ServerError {
                    condition: msg.condition,
                    message: msg.error_message.clone(),
                };
                match Command::try_from(original.command()) {
                    Ok(Command::ReadNotify | Command::WriteNotify) => {
                        match self.pending.remove(&original.parameter_2()) {
                            Some(pending) => pending.fail(error()),
                            None => debug!("Error for unknown request: {}", msg.error_message),
                        }
                    }
                    Ok(Command::EventAdd) => {
                        let cid = original.parameter_2();
                        warn!("Subscription {cid} rejected: {}", msg.error_message);
                        self.monitoring.remove(&cid);
                    }
                    Ok(Command::CreateChannel) => {
                        let cid = original.parameter_1();
                        if let Some(channel) = self.drop_channel(cid, error) {
                            warn!("Creating {} failed: {}", channel.name, msg.error_message);
                            channel.set_circuit(None);
                            channel.update(|info| {
                                info.state = ChannelState::Disconnected;
                                info.create_failed = true;
                            });
                        }
                    }
                    _ => warn!(
                        "Server {} reported error {:?}: {}",
                        self.address, msg.condition, msg.error_message
                    ),
                }
                Vec::new()
            }
            ClientMessage::ClearChannel(msg) => {
                trace!("Server confirmed clearing channel {}", msg.client_id);
                Vec::new()
            }
            msg => {
                debug!("Got unhandled message from server: {msg:?}");
                Vec::new()
            }
        }
    }

    /// The connection is gone: fail every request and disconnect every channel
    pub fn teardown(&mut self) {
        for (_, pending) in self.pending.drain() {
            pending.fail(ClientError::Disconnected);
        }
        for (_, channel) in self.channels.drain() {
            channel.set_circuit(None);
            channel.transition(ChannelState::Disconnected);
        }
        self.server_ids.clear();
        self.monitoring.clear();
    }
}

// Inner circuit state, used to hold async management data
struct CircuitInternal {
    /// A copy of the address we are connected to
    address: SocketAddr,
    /// When the last message was received. Used to calculate Echo timing.
    last_received_message_at: Instant,
    last_echo_sent_at: Instant,
    echo_period: Duration,
    requests_rx: mpsc::UnboundedReceiver<CircuitRequest>,
    cancel: CancellationToken,
    state: CircuitState,
}

impl CircuitInternal {
    async fn circuit_lifecycle(&mut self, tcp: TcpStream) {
        debug!("Started circuit to {}", self.address);
        let (tcp_rx, mut tcp_tx) = split(tcp);
        let mut framed = FramedRead::with_capacity(tcp_rx, PacketSplitter::new(), 16384usize);
        loop {
            let next_timing_stop =
                max(self.last_echo_sent_at, self.last_received_message_at) + self.echo_period;
            let messages_out = select! {
                _ = self.cancel.cancelled() => break,
                incoming = framed.next() => match incoming {
                    Some(Ok(frame)) => {
                        self.last_received_message_at = Instant::now();
                        match ClientMessage::try_from(frame) {
                            Ok(message) => self.state.handle_message(message),
                            Err(e) => {
                                warn!("Ignoring message from {}: {e}", self.address);
                                continue;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        error!("Error reading from server {}: {e}", self.address);
                        break;
                    }
                    None => {
                        debug!("Server {} closed the circuit", self.address);
                        break;
                    }
                },
                request = self.requests_rx.recv() => match request {
                    None => break,
                    Some(req) => self.state.handle_request(req),
                },
                _ = tokio::time::sleep_until(next_timing_stop.into()) => {
                    if self.state.echo_outstanding()
                        && self.last_received_message_at <= self.last_echo_sent_at
                    {
                        // We sent an echo already, this is the termination time
                        error!("Received no reply from server, assuming connection dead");
                        break;
                    }
                    self.last_echo_sent_at = Instant::now();
                    self.state.echo_sent();
                    vec![Message::Echo]
                },
            };

            if messages_out.is_empty() {
                continue;
            }
            for message in &messages_out {
                trace!("Sending {message:?}");
            }
            if let Err(e) = Message::write_all_messages(&messages_out, &mut tcp_tx).await {
                error!("Failed to write messages to {}, aborting: {e}", self.address);
                break;
            }
        }
        self.cancel.cancel();
        self.state.teardown();
        let _ = tcp_tx.shutdown().await;
        debug!("Circuit to {} closed", self.address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Access, CAMessage, MonitorMask};
    use std::time::SystemTime;

    fn address() -> SocketAddr {
        "127.0.0.1:5064".parse().unwrap()
    }

    /// A state with one channel that the server has acknowledged
    fn connected(cid: u32, sid: u32) -> (CircuitState, Arc<ChannelShared>) {
        let mut state = CircuitState::new(address());
        let channel = ChannelShared::new("TEST:PV", cid);
        let out = state.handle_request(CircuitRequest::CreateChannel(channel.clone()));
        assert!(matches!(&out[..], [Message::CreateChannel(c)] if c.client_id == cid));
        state.handle_message(
            messages::AccessRights {
                client_id: cid,
                access_rights: Access::ReadWrite,
            }
            .into(),
        );
        state.handle_message(
            messages::CreateChannelResponse {
                data_type: DbrBasicType::Long,
                data_count: 1,
                client_id: cid,
                server_id: sid,
            }
            .into(),
        );
        (state, channel)
    }

    fn read(
        state: &mut CircuitState,
        cid: u32,
    ) -> (u32, oneshot::Receiver<Result<Dbr, ClientError>>) {
        let (tx, rx) = oneshot::channel();
        let out = state.handle_request(CircuitRequest::Read {
            cid,
            category: DbrCategory::Time,
            count: 0,
            reply: tx,
        });
        let [Message::ReadNotify(request)] = &out[..] else {
            panic!("Expected a read request, got {out:?}");
        };
        (request.client_ioid, rx)
    }

    #[test]
    fn channel_lifecycle() {
        let mut state = CircuitState::new(address());
        let channel = ChannelShared::new("TEST:PV", 7);
        assert_eq!(channel.state(), ChannelState::Requested);
        state.handle_request(CircuitRequest::CreateChannel(channel.clone()));
        assert_eq!(channel.state(), ChannelState::Requested);

        state.handle_message(
            messages::CreateChannelResponse {
                data_type: DbrBasicType::Double,
                data_count: 1,
                client_id: 7,
                server_id: 99,
            }
            .into(),
        );
        let info = channel.info();
        assert_eq!(info.state, ChannelState::Connected);
        assert_eq!(info.sid, Some(99));
        assert_eq!(info.native_type, Some(DbrBasicType::Double));
        assert_eq!(info.server, Some(address()));

        state.handle_message(messages::ServerDisconnect { server_id: 99 }.into());
        assert_eq!(channel.state(), ChannelState::Disconnected);

        channel.dispose();
        assert_eq!(channel.state(), ChannelState::Disposed);
        // Nothing moves it out of Disposed
        state.handle_request(CircuitRequest::CreateChannel(channel.clone()));
        state.handle_message(
            messages::CreateChannelResponse {
                data_type: DbrBasicType::Double,
                data_count: 1,
                client_id: 7,
                server_id: 100,
            }
            .into(),
        );
        assert_eq!(channel.state(), ChannelState::Disposed);
    }

    #[test]
    fn read_completes_once() {
        let (mut state, _channel) = connected(1, 10);
        let (ioid, mut rx) = read(&mut state, 1);
        assert_eq!(state.pending_count(), 1);

        let dbr = Dbr::Time {
            status: Default::default(),
            timestamp: SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000_000),
            value: DbrValue::Long(vec![42]),
        };
        let (count, data) = dbr.to_bytes(None);
        let response = messages::ReadNotifyResponse {
            data_type: dbr.data_type(),
            data_count: count as u32,
            status_code: ErrorCondition::Normal.status_code(),
            client_ioid: ioid,
            data,
        };
        state.handle_message(response.clone().into());
        assert_eq!(state.pending_count(), 0);
        let received = rx.try_recv().unwrap().unwrap();
        assert_eq!(received.value(), &DbrValue::Long(vec![42]));

        // A duplicate response finds nothing to complete
        state.handle_message(response.into());
        assert_eq!(state.pending_count(), 0);
    }

    #[test]
    fn error_fails_matching_request() {
        let (mut state, _channel) = connected(1, 10);
        let (ioid, mut rx) = read(&mut state, 1);
        let (_other, mut other_rx) = read(&mut state, 1);
        let original = messages::ReadNotify {
            data_type: DbrType::new(DbrBasicType::Long, DbrCategory::Time),
            data_count: 0,
            server_id: 10,
            client_ioid: ioid,
        }
        .to_frame();
        state.handle_message(
            messages::ECAError::new(ErrorCondition::NoRdAccess, 1, &original).into(),
        );
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(ClientError::ServerError {
                condition: ErrorCondition::NoRdAccess,
                ..
            })
        ));
        assert!(other_rx.try_recv().is_err());
        assert_eq!(state.pending_count(), 1);
    }

    #[test]
    fn teardown_disconnects_everything() {
        let (mut state, channel) = connected(1, 10);
        let (_, mut rx) = read(&mut state, 1);
        state.teardown();
        assert_eq!(channel.state(), ChannelState::Disconnected);
        assert!(matches!(rx.try_recv().unwrap(), Err(ClientError::Disconnected)));
        // A late reply is ignored
        let out = state.handle_message(
            messages::AccessRights {
                client_id: 1,
                access_rights: Access::Read,
            }
            .into(),
        );
        assert!(out.is_empty());
        assert_eq!(channel.info().access, Access::ReadWrite);
    }

    #[test]
    fn echo_ping_pong() {
        let mut state = CircuitState::new(address());
        // A server-initiated echo is answered
        assert_eq!(state.handle_message(ClientMessage::Echo), vec![Message::Echo]);
        // Our own echo is only acknowledged
        state.echo_sent();
        assert!(state.handle_message(ClientMessage::Echo).is_empty());
        assert!(!state.echo_outstanding());
    }

    #[test]
    fn monitor_issued_on_connect_and_cancelled_when_unwanted() {
        let mut state = CircuitState::new(address());
        let channel = ChannelShared::new("TEST:PV", 3);
        let handle = crate::client::Channel::new(channel.clone(), Duration::from_secs(1));
        let sub = handle.subscribe(|_| {});
        state.handle_request(CircuitRequest::CreateChannel(channel.clone()));
        let out = state.handle_message(
            messages::CreateChannelResponse {
                data_type: DbrBasicType::Int,
                data_count: 1,
                client_id: 3,
                server_id: 30,
            }
            .into(),
        );
        let [Message::EventAdd(event)] = &out[..] else {
            panic!("Expected subscription request, got {out:?}");
        };
        assert_eq!(event.subscription_id, 3);
        assert_eq!(event.server_id, 30);
        assert_eq!(event.mask, MonitorMask::default());
        // Asking again with the same options sends nothing new
        assert!(state.handle_request(CircuitRequest::Monitor { cid: 3 }).is_empty());

        handle.unsubscribe(sub);
        let dbr = Dbr::Basic(DbrValue::Int(vec![1]));
        let (count, data) = dbr.to_bytes(None);
        let update = messages::EventAddResponse {
            data_type: dbr.data_type(),
            data_count: count as u32,
            status_code: ErrorCondition::Normal.status_code(),
            subscription_id: 3,
            data,
        };
        let out = state.handle_message(update.into());
        assert!(matches!(&out[..], [Message::EventCancel(c)] if c.server_id == 30));
    }

    #[test]
    fn writes_convert_to_native_type() {
        let (mut state, _channel) = connected(2, 20);
        let (tx, mut rx) = oneshot::channel();
        let out = state.handle_request(CircuitRequest::Write {
            cid: 2,
            value: "12".into(),
            reply: Some(tx),
        });
        let [Message::WriteNotify(write)] = &out[..] else {
            panic!("Expected a write, got {out:?}");
        };
        assert_eq!(write.data_type, DbrType::new(DbrBasicType::Long, DbrCategory::Basic));
        assert_eq!(&write.data[..4], &12i32.to_be_bytes());
        state.handle_message(
            messages::WriteNotifyResponse {
                data_type: write.data_type,
                data_count: 1,
                status_code: ErrorCondition::Normal.status_code(),
                client_ioid: write.client_ioid,
            }
            .into(),
        );
        assert!(rx.try_recv().unwrap().is_ok());

        let (tx, mut rx) = oneshot::channel();
        let out = state.handle_request(CircuitRequest::Write {
            cid: 2,
            value: "not a number".into(),
            reply: Some(tx),
        });
        assert!(out.is_empty());
        assert!(matches!(rx.try_recv().unwrap(), Err(ClientError::NoConvert)));
    }

    #[test]
    fn create_failure_is_reported() {
        let mut state = CircuitState::new(address());
        let channel = ChannelShared::new("MISSING", 4);
        state.handle_request(CircuitRequest::CreateChannel(channel.clone()));
        state.handle_message(messages::CreateChannelFailure { client_id: 4 }.into());
        let info = channel.info();
        assert_eq!(info.state, ChannelState::Disconnected);
        assert!(info.create_failed);
    }
}
