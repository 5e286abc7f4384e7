//! One client connection to the server.
//!
//! [`ServerCircuit`] owns everything known about a connection: the client's
//! names, its channels and its monitor streams. The connection task feeds it
//! decoded messages and monitor updates one at a time, and writes back
//! whatever it returns.

use std::{collections::HashMap, net::SocketAddr, num::NonZeroUsize};

use tokio::{
    io::{AsyncWriteExt, split},
    net::TcpStream,
    select,
};
use tokio_stream::{StreamExt, StreamMap};
use tokio_util::{codec::FramedRead, sync::CancellationToken};
use tracing::{debug, debug_span, error, trace, warn};

use crate::{
    Provider,
    dbr::{Dbr, DbrType},
    frame::Frame,
    messages::{
        self, Access, ClientMessage, ECAError, ErrorCondition, Message, ReadNotifyResponse,
    },
    providers::MonitorReceiver,
    splitter::PacketSplitter,
    utils::wrapping_inplace_add,
};

struct ServerChannel {
    name: String,
    client_id: u32,
    access: Access,
}

struct ServerSubscription {
    server_id: u32,
    data_type: DbrType,
    data_count: u32,
}

pub(crate) struct ServerCircuit<P: Provider> {
    peer: SocketAddr,
    provider: P,
    client_version: Option<u16>,
    client_host_name: Option<String>,
    client_user_name: Option<String>,
    events_on: bool,
    channels: HashMap<u32, ServerChannel>,
    next_server_id: u32,
    subscriptions: HashMap<u32, ServerSubscription>,
    /// The latest update for each subscription, held while events are off
    held: HashMap<u32, Dbr>,
    monitors: StreamMap<u32, MonitorReceiver>,
}

/// Encode a value in the type and count a client asked for
fn encode(
    dbr: &Dbr,
    data_type: DbrType,
    data_count: u32,
) -> Result<(usize, Vec<u8>), ErrorCondition> {
    let converted = dbr.convert_to(data_type)?;
    Ok(converted.to_bytes(NonZeroUsize::new(data_count as usize)))
}

impl<P: Provider> ServerCircuit<P> {
    pub fn new(peer: SocketAddr, provider: P) -> Self {
        ServerCircuit {
            peer,
            provider,
            client_version: None,
            client_host_name: None,
            client_user_name: None,
            events_on: true,
            channels: HashMap::new(),
            next_server_id: 1,
            subscriptions: HashMap::new(),
            held: HashMap::new(),
            monitors: StreamMap::new(),
        }
    }

    fn channel(&self, server_id: u32) -> Result<&ServerChannel, ErrorCondition> {
        self.channels
            .get(&server_id)
            .ok_or(ErrorCondition::BadChId)
    }

    fn read(
        &self,
        server_id: u32,
        data_type: DbrType,
        data_count: u32,
    ) -> Result<(usize, Vec<u8>), ErrorCondition> {
        let channel = self.channel(server_id)?;
        if !channel.access.can_read() {
            return Err(ErrorCondition::NoRdAccess);
        }
        let dbr = self.provider.read_value(&channel.name, Some(data_type))?;
        encode(&dbr, data_type, data_count)
    }

    fn write(
        &mut self,
        server_id: u32,
        data_type: DbrType,
        data_count: u32,
        data: &[u8],
    ) -> Result<(), ErrorCondition> {
        let channel = self.channel(server_id)?;
        if !channel.access.can_write() {
            return Err(ErrorCondition::NoWtAccess);
        }
        let name = channel.name.clone();
        let value = Dbr::from_bytes(data_type, data_count as usize, data).map_err(|e| {
            debug!("Could not decode write to {name}: {e}");
            ErrorCondition::BadType
        })?;
        self.provider.write_value(&name, value)
    }

    fn event(&self, subscription_id: u32, dbr: &Dbr) -> Option<ClientMessage> {
        let subscription = self.subscriptions.get(&subscription_id)?;
        let response = match encode(dbr, subscription.data_type, subscription.data_count) {
            Ok((data_count, data)) => messages::EventAddResponse {
                data_type: subscription.data_type,
                data_count: data_count as u32,
                status_code: ErrorCondition::Normal.status_code(),
                subscription_id,
                data,
            },
            Err(condition) => messages::EventAddResponse {
                data_type: subscription.data_type,
                data_count: 0,
                status_code: condition.status_code(),
                subscription_id,
                data: Vec::new(),
            },
        };
        Some(response.into())
    }

    /// A new value arrived from a monitor
    pub fn handle_update(&mut self, subscription_id: u32, dbr: Dbr) -> Vec<ClientMessage> {
        if !self.events_on {
            self.held.insert(subscription_id, dbr);
            return Vec::new();
        }
        self.event(subscription_id, &dbr).into_iter().collect()
    }

    fn drop_subscription(&mut self, subscription_id: u32) -> Option<ServerSubscription> {
        self.monitors.remove(&subscription_id);
        self.held.remove(&subscription_id);
        self.subscriptions.remove(&subscription_id)
    }

    pub fn handle_message(&mut self, frame: &Frame, message: Message) -> Vec<ClientMessage> {
        match message {
            Message::Version(msg) => {
                if !msg.is_compatible() {
                    warn!(
                        "Client {} has incompatible protocol version {}",
                        self.peer, msg.protocol_version
                    );
                }
                self.client_version = Some(msg.protocol_version);
                Vec::new()
            }
            Message::HostName(msg) => {
                debug!("Client {} host name: {}", self.peer, msg.name);
                self.client_host_name = Some(msg.name);
                Vec::new()
            }
            Message::ClientName(msg) => {
                debug!("Client {} user name: {}", self.peer, msg.name);
                self.client_user_name = Some(msg.name);
                Vec::new()
            }
            Message::CreateChannel(msg) => {
                let _span = debug_span!("create_channel", cid = msg.client_id).entered();
                let client_id = msg.client_id;
                let failure = || vec![messages::CreateChannelFailure { client_id }.into()];
                if !self.provider.provides(&msg.channel_name) {
                    debug!("Refusing channel for unknown PV {}", msg.channel_name);
                    return failure();
                }
                let native = match self.provider.read_value(&msg.channel_name, None) {
                    Ok(dbr) => dbr,
                    Err(e) => {
                        warn!("Could not read {} to create channel: {e}", msg.channel_name);
                        return failure();
                    }
                };
                let access = self.provider.get_access_right(
                    &msg.channel_name,
                    self.client_user_name.as_deref(),
                    self.client_host_name.as_deref(),
                );
                let server_id = wrapping_inplace_add(&mut self.next_server_id);
                debug!(
                    "Created channel {} for {} with sid {server_id} ({access})",
                    msg.channel_name, self.peer
                );
                self.channels.insert(
                    server_id,
                    ServerChannel {
                        name: msg.channel_name,
                        client_id: msg.client_id,
                        access,
                    },
                );
                // Rights go first so the channel is usable as soon as it connects
                vec![
                    messages::AccessRights {
                        client_id: msg.client_id,
                        access_rights: access,
                    }
                    .into(),
                    messages::CreateChannelResponse {
                        data_type: native.data_type().basic_type,
                        data_count: native.value().get_count() as u32,
                        client_id: msg.client_id,
                        server_id,
                    }
                    .into(),
                ]
            }
            Message::ReadNotify(msg) => {
                let response = match self.read(msg.server_id, msg.data_type, msg.data_count) {
                    Ok((count, data)) => msg.respond(count, data),
                    Err(condition) => {
                        debug!("Read of sid {} failed: {condition}", msg.server_id);
                        ReadNotifyResponse {
                            data_type: msg.data_type,
                            data_count: 0,
                            status_code: condition.status_code(),
                            client_ioid: msg.client_ioid,
                            data: Vec::new(),
                        }
                    }
                };
                vec![response.into()]
            }
            Message::Read(msg) => {
                debug!("Ignoring obsolete READ of sid {} from {}", msg.server_id, self.peer);
                let client_id = self.channel(msg.server_id).map(|c| c.client_id).unwrap_or(0);
                vec![ECAError::new(ErrorCondition::Anachronism, client_id, frame).into()]
            }
            Message::Write(msg) => {
                match self.write(msg.server_id, msg.data_type, msg.data_count, &msg.data) {
                    Ok(()) => Vec::new(),
                    Err(condition) => {
                        let client_id = self
                            .channel(msg.server_id)
                            .map(|c| c.client_id)
                            .unwrap_or(0);
                        vec![ECAError::new(condition, client_id, frame).into()]
                    }
                }
            }
            Message::WriteNotify(msg) => {
                let result = self.write(msg.server_id, msg.data_type, msg.data_count, &msg.data);
                vec![msg.respond(result).into()]
            }
            Message::EventAdd(msg) => {
                let _span = debug_span!("event_add", subscription = msg.subscription_id).entered();
                let channel = match self.channel(msg.server_id) {
                    Ok(channel) => channel,
                    Err(condition) => return vec![ECAError::new(condition, 0, frame).into()],
                };
                if !channel.access.can_read() {
                    let condition = ErrorCondition::NoRdAccess;
                    return vec![ECAError::new(condition, channel.client_id, frame).into()];
                }
                let name = channel.name.clone();
                let client_id = channel.client_id;
                let receiver = match self.provider.monitor_value(&name, msg.data_type, msg.mask) {
                    Ok(receiver) => receiver,
                    Err(condition) => {
                        debug!("Could not monitor {name}: {condition}");
                        return vec![ECAError::new(condition, client_id, frame).into()];
                    }
                };
                self.drop_subscription(msg.subscription_id);
                self.subscriptions.insert(
                    msg.subscription_id,
                    ServerSubscription {
                        server_id: msg.server_id,
                        data_type: msg.data_type,
                        data_count: msg.data_count,
                    },
                );
                self.monitors.insert(msg.subscription_id, receiver);
                // Every monitor starts with the current value
                match self.provider.read_value(&name, Some(msg.data_type)) {
                    Ok(dbr) => self.handle_update(msg.subscription_id, dbr),
                    Err(condition) => {
                        warn!("Could not read initial value of {name}: {condition}");
                        Vec::new()
                    }
                }
            }
            Message::EventCancel(msg) => match self.drop_subscription(msg.subscription_id) {
                Some(_) => vec![msg.respond().into()],
                None => {
                    debug!("Cancel for unknown subscription {}", msg.subscription_id);
                    Vec::new()
                }
            },
            Message::EventsOff(_) => {
                self.events_on = false;
                Vec::new()
            }
            Message::EventsOn(_) => {
                self.events_on = true;
                let held: Vec<_> = self.held.drain().collect();
                held.into_iter()
                    .filter_map(|(id, dbr)| self.event(id, &dbr))
                    .collect()
            }
            Message::ClearChannel(msg) => {
                if self.channels.remove(&msg.server_id).is_none() {
                    debug!("Clear for unknown sid {}", msg.server_id);
                }
                let orphaned: Vec<u32> = self
                    .subscriptions
                    .iter()
                    .filter(|(_, s)| s.server_id == msg.server_id)
                    .map(|(id, _)| *id)
                    .collect();
                for id in orphaned {
                    self.drop_subscription(id);
                }
                vec![msg.into()]
            }
            Message::Echo => vec![ClientMessage::Echo],
            Message::Search(msg) => {
                trace!("Ignoring search for {} over TCP", msg.channel_name);
                Vec::new()
            }
            Message::RepeaterRegister(_) => Vec::new(),
        }
    }
}

/// Run one client connection until it closes or the server stops
pub(crate) async fn serve_circuit<P: Provider>(
    tcp: TcpStream,
    peer: SocketAddr,
    provider: P,
    stop: CancellationToken,
) {
    debug!("Accepted circuit from {peer}");
    let (tcp_rx, mut tcp_tx) = split(tcp);
    let mut framed = FramedRead::with_capacity(tcp_rx, PacketSplitter::new(), 16384usize);
    let mut state = ServerCircuit::new(peer, provider);

    if let Err(e) =
        ClientMessage::write_all_messages(&[messages::Version::default().into()], &mut tcp_tx).await
    {
        error!("Could not greet client {peer}: {e}");
        return;
    }

    loop {
        let messages_out = select! {
            _ = stop.cancelled() => break,
            incoming = framed.next() => match incoming {
                Some(Ok(frame)) => match Message::try_from(frame.clone()) {
                    Ok(message) => state.handle_message(&frame, message),
                    Err(e) => {
                        warn!("Ignoring message from {peer}: {e}");
                        continue;
                    }
                },
                Some(Err(e)) => {
                    error!("Error reading from client {peer}: {e}");
                    break;
                }
                None => {
                    debug!("Client {peer} closed the circuit");
                    break;
                }
            },
            Some((subscription_id, dbr)) = state.monitors.next(), if !state.monitors.is_empty() => {
                state.handle_update(subscription_id, dbr)
            },
        };
        if messages_out.is_empty() {
            continue;
        }
        for message in &messages_out {
            trace!("Sending {message:?}");
        }
        if let Err(e) = ClientMessage::write_all_messages(&messages_out, &mut tcp_tx).await {
            error!("Failed to write messages to {peer}, closing: {e}");
            break;
        }
    }
    let _ = tcp_tx.shutdown().await;
    debug!("Circuit from {peer} closed");
}
