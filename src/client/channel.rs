//! Per-PV channel state, shared between the user-facing handle and the circuit.

use std::{
    fmt,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, trace, warn};

use crate::{
    client::{
        ClientError, CouldNotFindError,
        circuit::{Circuit, CircuitRequest},
        subscription::Subscription,
    },
    dbr::{Dbr, DbrBasicType, DbrCategory, DbrValue},
    messages::{Access, MonitorMask},
};

/// Lifecycle of a channel
///
/// `Disposed` is terminal; nothing can move a channel out of it.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum ChannelState {
    /// Searching for, or waiting for a server to create, the channel
    #[default]
    Requested,
    Connected,
    /// Lost the server. The channel will search again.
    Disconnected,
    Disposed,
}

/// Summary of channel information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub name: String,
    pub state: ChannelState,
    pub cid: u32,
    pub sid: Option<u32>,
    pub native_type: Option<DbrBasicType>,
    pub native_count: u32,
    pub access: Access,
    pub server: Option<SocketAddr>,
    /// The last server asked refused to create this channel
    pub create_failed: bool,
    /// The last search was answered by a server without the PV
    pub not_found: bool,
}

/// What to ask the server for when monitoring a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorOptions {
    pub category: DbrCategory,
    /// Number of elements. Zero asks for the current length of the PV.
    pub count: usize,
    pub mask: MonitorMask,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        MonitorOptions {
            category: DbrCategory::Time,
            count: 0,
            mask: MonitorMask::default(),
        }
    }
}

/// Identifies one callback registered with [`Channel::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Callbacks are locked one at a time while they run, never the list
type MonitorCallback = Arc<Mutex<dyn FnMut(&Dbr) + Send>>;

/// Observer list plus the broadcast used by typed [`Subscription`]s
struct Monitors {
    options: MonitorOptions,
    callbacks: Vec<(SubscriptionId, MonitorCallback)>,
}

/// State shared by every handle to a channel, and the circuit serving it
pub(crate) struct ChannelShared {
    pub name: String,
    pub cid: u32,
    info: watch::Sender<ChannelInfo>,
    monitors: Mutex<Monitors>,
    /// Taken on dispose, which closes every [`Subscription`]
    updates: Mutex<Option<broadcast::Sender<Dbr>>>,
    circuit: Mutex<Option<Circuit>>,
    next_subscription: AtomicU64,
    /// How many times the client has handed out this channel by name
    handouts: AtomicU32,
}

impl fmt::Debug for ChannelShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelShared")
            .field("name", &self.name)
            .field("cid", &self.cid)
            .field("info", &*self.info.borrow())
            .finish()
    }
}

impl ChannelShared {
    pub fn new(name: &str, cid: u32) -> Arc<Self> {
        let info = ChannelInfo {
            name: name.to_owned(),
            state: ChannelState::Requested,
            cid,
            sid: None,
            native_type: None,
            native_count: 0,
            access: Access::None,
            server: None,
            create_failed: false,
            not_found: false,
        };
        Arc::new(ChannelShared {
            name: name.to_owned(),
            cid,
            info: watch::Sender::new(info),
            monitors: Mutex::new(Monitors {
                options: MonitorOptions::default(),
                callbacks: Vec::new(),
            }),
            updates: Mutex::new(Some(broadcast::Sender::new(32))),
            circuit: Mutex::new(None),
            next_subscription: AtomicU64::new(1),
            handouts: AtomicU32::new(0),
        })
    }

    pub fn info(&self) -> ChannelInfo {
        self.info.borrow().clone()
    }

    pub fn state(&self) -> ChannelState {
        self.info.borrow().state
    }

    pub fn is_disposed(&self) -> bool {
        self.state() == ChannelState::Disposed
    }

    pub fn watch(&self) -> watch::Receiver<ChannelInfo> {
        self.info.subscribe()
    }

    pub fn note_handout(&self) {
        self.handouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handouts(&self) -> u32 {
        self.handouts.load(Ordering::Relaxed)
    }

    /// Change the channel info, unless the channel is disposed
    ///
    /// Returns false if the change was refused.
    pub fn update(&self, change: impl FnOnce(&mut ChannelInfo)) -> bool {
        let mut applied = false;
        self.info.send_if_modified(|info| {
            if info.state == ChannelState::Disposed {
                return false;
            }
            let before = info.clone();
            change(info);
            applied = true;
            *info != before
        });
        applied
    }

    /// Move to a new state, keeping Disposed terminal
    pub fn transition(&self, state: ChannelState) -> bool {
        self.update(|info| {
            trace!("Channel {} ({}): {:?} -> {state:?}", info.name, info.cid, info.state);
            info.state = state;
            if state != ChannelState::Connected {
                info.sid = None;
            }
        })
    }

    pub fn dispose(&self) {
        self.info.send_if_modified(|info| {
            if info.state == ChannelState::Disposed {
                return false;
            }
            debug!("Disposing channel {} ({})", info.name, info.cid);
            info.state = ChannelState::Disposed;
            info.sid = None;
            true
        });
        if let Ok(mut monitors) = self.monitors.lock() {
            monitors.callbacks.clear();
        }
        if let Ok(mut updates) = self.updates.lock() {
            updates.take();
        }
        if let Some(circuit) = self.take_circuit() {
            circuit.send(CircuitRequest::ClearChannel { cid: self.cid });
        }
    }

    pub fn circuit(&self) -> Option<Circuit> {
        self.circuit
            .lock()
            .ok()
            .and_then(|c| c.clone())
            .filter(|c| !c.is_closed())
    }

    pub fn set_circuit(&self, circuit: Option<Circuit>) {
        if let Ok(mut current) = self.circuit.lock() {
            *current = circuit;
        }
    }

    fn take_circuit(&self) -> Option<Circuit> {
        self.circuit.lock().ok().and_then(|mut c| c.take())
    }

    pub fn monitor_options(&self) -> MonitorOptions {
        self.monitors
            .lock()
            .map(|m| m.options)
            .unwrap_or_default()
    }

    /// Does anything want updates from this channel?
    pub fn wants_monitor(&self) -> bool {
        let has_callbacks = self
            .monitors
            .lock()
            .map(|m| !m.callbacks.is_empty())
            .unwrap_or(false);
        has_callbacks || self.subscription_count() > 0
    }

    fn subscription_count(&self) -> usize {
        self.updates
            .lock()
            .ok()
            .and_then(|updates| updates.as_ref().map(|u| u.receiver_count()))
            .unwrap_or(0)
    }

    /// A receiver for typed subscriptions. Closed from the start if disposed.
    fn subscribe_updates(&self) -> broadcast::Receiver<Dbr> {
        let receiver = self
            .updates
            .lock()
            .ok()
            .and_then(|updates| updates.as_ref().map(|u| u.subscribe()));
        receiver.unwrap_or_else(|| broadcast::Sender::new(1).subscribe())
    }

    fn is_subscribed(&self, id: SubscriptionId) -> bool {
        self.monitors
            .lock()
            .map(|m| m.callbacks.iter().any(|(sub, _)| *sub == id))
            .unwrap_or(false)
    }

    /// Hand an update to every observer, in subscription order
    ///
    /// Returns false if nobody is listening any more.
    pub fn deliver(&self, dbr: &Dbr) -> bool {
        if self.is_disposed() {
            return false;
        }
        // Callbacks may subscribe, unsubscribe or dispose on this channel
        let snapshot = self
            .monitors
            .lock()
            .map(|m| m.callbacks.clone())
            .unwrap_or_default();
        let mut callbacks_called = 0;
        for (id, callback) in snapshot {
            if !self.is_subscribed(id) {
                continue;
            }
            if let Ok(mut callback) = callback.lock() {
                (*callback)(dbr);
                callbacks_called += 1;
            }
        }
        let receivers = self
            .updates
            .lock()
            .ok()
            .and_then(|updates| updates.as_ref().map(|u| u.send(dbr.clone()).unwrap_or(0)))
            .unwrap_or(0);
        callbacks_called + receivers > 0
    }

    fn request_monitor(&self) {
        if let Some(circuit) = self.circuit() {
            circuit.send(CircuitRequest::Monitor { cid: self.cid });
        }
    }
}

/// Handle to a named channel
///
/// Handles are cheap to clone; every clone refers to the same channel.
/// A channel searches for its server, and searches again whenever it loses
/// it, until [`Channel::dispose`] is called.
#[derive(Clone, Debug)]
pub struct Channel {
    shared: Arc<ChannelShared>,
    timeout: Duration,
}

impl Channel {
    pub(crate) fn new(shared: Arc<ChannelShared>, timeout: Duration) -> Self {
        Channel { shared, timeout }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn info(&self) -> ChannelInfo {
        self.shared.info()
    }

    pub fn state(&self) -> ChannelState {
        self.shared.state()
    }

    /// The access rights the server last reported
    pub fn access_rights(&self) -> Access {
        self.shared.info().access
    }

    /// The timeout applied to operations on this handle
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// A copy of this handle, with a different operation timeout
    pub fn with_timeout(&self, timeout: Duration) -> Channel {
        Channel {
            shared: self.shared.clone(),
            timeout,
        }
    }

    /// Wait until the channel is connected to a server
    ///
    /// Fails early if the server refused to create the channel, or if a
    /// server answered the search saying it does not have the PV.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<ChannelInfo, ClientError> {
        let mut watcher = self.shared.watch();
        let waited = tokio::time::timeout(timeout, async {
            watcher
                .wait_for(|info| {
                    matches!(info.state, ChannelState::Connected | ChannelState::Disposed)
                        || info.create_failed
                        || info.not_found
                })
                .await
                .map(|info| info.clone())
                .map_err(|_| ClientError::ClientClosed)
        })
        .await;
        let info = match waited {
            Ok(info) => info?,
            Err(_) => return Err(ClientError::Timeout),
        };
        match info.state {
            ChannelState::Connected => Ok(info),
            ChannelState::Disposed => Err(ClientError::ChannelDisposed),
            _ if info.not_found => Err(CouldNotFindError::NotFound.into()),
            _ => Err(ClientError::ChannelCreateFailed),
        }
    }

    /// Wait for a connection, and the circuit that it lives on
    async fn connected_circuit(&self) -> Result<(ChannelInfo, Circuit), ClientError> {
        let info = self.wait_connected(self.timeout).await?;
        let circuit = self.shared.circuit().ok_or(ClientError::Disconnected)?;
        Ok((info, circuit))
    }

    async fn await_reply<T>(
        &self,
        reply: oneshot::Receiver<Result<T, ClientError>>,
    ) -> Result<T, ClientError> {
        match tokio::time::timeout(self.timeout, reply).await {
            Err(_) => Err(ClientError::Timeout),
            // The circuit dropped the request without answering
            Ok(Err(_)) => Err(ClientError::Disconnected),
            Ok(Ok(result)) => result,
        }
    }

    /// Read the value with metadata of the requested category
    ///
    /// A `count` of zero asks the server for all current elements.
    pub async fn get_dbr(&self, category: DbrCategory, count: usize) -> Result<Dbr, ClientError> {
        let (info, circuit) = self.connected_circuit().await?;
        if !info.access.can_read() {
            return Err(ClientError::NoReadAccess);
        }
        let (tx, rx) = oneshot::channel();
        circuit.send(CircuitRequest::Read {
            cid: self.shared.cid,
            category,
            count,
            reply: tx,
        });
        self.await_reply(rx).await
    }

    /// Read the value, converted to a native rust type
    pub async fn get<T>(&self) -> Result<T, ClientError>
    where
        T: for<'a> TryFrom<&'a DbrValue>,
    {
        let dbr = self.get_dbr(DbrCategory::Time, 0).await?;
        T::try_from(dbr.value()).map_err(|_| ClientError::NoConvert)
    }

    /// Write a value, and wait for the server to confirm it
    pub async fn put(&self, value: impl Into<DbrValue>) -> Result<(), ClientError> {
        let (info, circuit) = self.connected_circuit().await?;
        if !info.access.can_write() {
            return Err(ClientError::NoWriteAccess);
        }
        let (tx, rx) = oneshot::channel();
        circuit.send(CircuitRequest::Write {
            cid: self.shared.cid,
            value: value.into(),
            reply: Some(tx),
        });
        self.await_reply(rx).await
    }

    /// Write a value without asking for confirmation
    pub async fn put_nowait(&self, value: impl Into<DbrValue>) -> Result<(), ClientError> {
        let (info, circuit) = self.connected_circuit().await?;
        if !info.access.can_write() {
            return Err(ClientError::NoWriteAccess);
        }
        circuit.send(CircuitRequest::Write {
            cid: self.shared.cid,
            value: value.into(),
            reply: None,
        });
        Ok(())
    }

    /// Register a callback for every monitor update
    ///
    /// Callbacks run in the order they were registered, on the task that
    /// owns the circuit, so they must not block. They may call back into
    /// the channel, including to unsubscribe themselves.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: FnMut(&Dbr) + Send + 'static,
    {
        let id = SubscriptionId(self.shared.next_subscription.fetch_add(1, Ordering::Relaxed));
        let first = match self.shared.monitors.lock() {
            Ok(mut monitors) => {
                monitors
                    .callbacks
                    .push((id, Arc::new(Mutex::new(callback))));
                monitors.callbacks.len() == 1
            }
            Err(_) => false,
        };
        if first {
            self.shared.request_monitor();
        }
        id
    }

    /// Receive monitor updates through an async receiver
    ///
    /// The first value must arrive within this handle's timeout. The
    /// subscription closes when the channel is disposed.
    pub fn subscription<T>(&self) -> Subscription<T>
    where
        T: for<'a> TryFrom<&'a DbrValue>,
    {
        let receiver = self.shared.subscribe_updates();
        self.shared.request_monitor();
        Subscription::new(receiver).with_first_value_timeout(self.timeout)
    }

    /// Remove a callback. The server subscription is cancelled with the last one.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let now_empty = match self.shared.monitors.lock() {
            Ok(mut monitors) => {
                let before = monitors.callbacks.len();
                monitors.callbacks.retain(|(sub, _)| *sub != id);
                if monitors.callbacks.len() == before {
                    warn!("Unsubscribing unknown subscription {id:?} from {}", self.name());
                }
                monitors.callbacks.is_empty()
            }
            Err(_) => false,
        };
        if now_empty
            && self.shared.subscription_count() == 0
            && let Some(circuit) = self.shared.circuit()
        {
            circuit.send(CircuitRequest::CancelMonitor {
                cid: self.shared.cid,
            });
        }
    }

    /// Change what the server subscription asks for
    ///
    /// An active subscription is re-issued with the new options.
    pub fn set_monitor_options(&self, options: MonitorOptions) {
        if let Ok(mut monitors) = self.shared.monitors.lock() {
            monitors.options = options;
        }
        if self.shared.wants_monitor() {
            self.shared.request_monitor();
        }
    }

    /// Close the channel for good, on every handle
    pub fn dispose(&self) {
        self.shared.dispose();
    }

    pub(crate) fn shared(&self) -> &Arc<ChannelShared> {
        &self.shared
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::SubscriberRecvError;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn disposed_is_terminal() {
        let shared = ChannelShared::new("PV", 3);
        assert_eq!(shared.state(), ChannelState::Requested);
        assert!(shared.transition(ChannelState::Connected));
        shared.dispose();
        assert!(!shared.transition(ChannelState::Connected));
        assert!(!shared.update(|info| info.access = Access::ReadWrite));
        assert_eq!(shared.state(), ChannelState::Disposed);
        assert_eq!(shared.info().access, Access::None);
    }

    #[test]
    fn callbacks_run_in_order() {
        let shared = ChannelShared::new("PV", 1);
        let channel = Channel::new(shared.clone(), Duration::from_millis(10));
        let order = Arc::new(Mutex::new(Vec::new()));
        let first = order.clone();
        let id = channel.subscribe(move |_| first.lock().unwrap().push(1));
        let second = order.clone();
        channel.subscribe(move |_| second.lock().unwrap().push(2));
        assert!(shared.wants_monitor());

        assert!(shared.deliver(&Dbr::Basic(5i32.into())));
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);

        channel.unsubscribe(id);
        shared.deliver(&Dbr::Basic(6i32.into()));
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 2]);
    }

    #[test]
    fn callbacks_can_unsubscribe_themselves() {
        let shared = ChannelShared::new("PV", 1);
        let channel = Channel::new(shared.clone(), Duration::from_millis(10));
        let calls = Arc::new(AtomicUsize::new(0));
        let own_id = Arc::new(Mutex::new(None));
        let (counter, id_slot, handle) = (calls.clone(), own_id.clone(), channel.clone());
        let id = channel.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            if let Some(id) = id_slot.lock().unwrap().take() {
                handle.unsubscribe(id);
            }
        });
        *own_id.lock().unwrap() = Some(id);
        let later = calls.clone();
        channel.subscribe(move |_| {
            later.fetch_add(10, Ordering::SeqCst);
        });

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let delivering = shared.clone();
        std::thread::spawn(move || {
            delivering.deliver(&Dbr::Basic(1i32.into()));
            delivering.deliver(&Dbr::Basic(2i32.into()));
            let _ = done_tx.send(());
        });
        done_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("deliver blocked on a re-entrant callback");
        // The first callback ran once, the second on both updates
        assert_eq!(calls.load(Ordering::SeqCst), 21);
    }

    #[test]
    fn callbacks_can_dispose_the_channel() {
        let shared = ChannelShared::new("PV", 1);
        let channel = Channel::new(shared.clone(), Duration::from_millis(10));
        let handle = channel.clone();
        channel.subscribe(move |_| handle.dispose());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        channel.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        shared.deliver(&Dbr::Basic(1i32.into()));
        assert_eq!(shared.state(), ChannelState::Disposed);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn subscriptions_close_on_dispose() {
        let shared = ChannelShared::new("PV", 1);
        let channel = Channel::new(shared, Duration::from_secs(30));
        let mut before = channel.subscription::<f64>();
        channel.dispose();
        let received = tokio::time::timeout(Duration::from_secs(1), before.recv())
            .await
            .expect("Subscription outlived its channel");
        assert!(matches!(received, Err(SubscriberRecvError::Closed)));
        let mut after = channel.subscription::<f64>();
        assert!(matches!(after.recv().await, Err(SubscriberRecvError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn first_value_must_arrive_in_time() {
        let shared = ChannelShared::new("PV", 1);
        let channel = Channel::new(shared.clone(), Duration::from_millis(50));
        let mut silent = channel.subscription::<f64>();
        assert!(matches!(silent.recv().await, Err(SubscriberRecvError::Timeout)));

        let mut sub = channel.subscription::<f64>();
        shared.deliver(&Dbr::Basic(2.5f64.into()));
        assert_eq!(sub.recv().await.unwrap(), 2.5);
        // Later values may take as long as they like
        let waiting = tokio::time::timeout(Duration::from_secs(60), sub.recv()).await;
        assert!(waiting.is_err());
    }

    #[test]
    fn nobody_listening_after_dispose() {
        let shared = ChannelShared::new("PV", 1);
        let channel = Channel::new(shared.clone(), Duration::from_millis(10));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        channel.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        channel.dispose();
        assert!(!shared.deliver(&Dbr::Basic(1i32.into())));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn wait_connected_times_out() {
        let shared = ChannelShared::new("PV", 1);
        let channel = Channel::new(shared.clone(), Duration::from_millis(10));
        assert!(matches!(
            channel.wait_connected(Duration::from_millis(20)).await,
            Err(ClientError::Timeout)
        ));
        shared.update(|info| {
            info.state = ChannelState::Connected;
            info.sid = Some(4);
        });
        let info = channel.wait_connected(Duration::from_millis(20)).await.unwrap();
        assert_eq!(info.sid, Some(4));
        channel.dispose();
        assert!(matches!(
            channel.wait_connected(Duration::from_millis(20)).await,
            Err(ClientError::ChannelDisposed)
        ));
    }

    #[tokio::test]
    async fn not_found_fails_without_waiting() {
        let shared = ChannelShared::new("PV", 1);
        let channel = Channel::new(shared.clone(), Duration::from_secs(30));
        shared.update(|info| info.not_found = true);
        let waited = tokio::time::timeout(Duration::from_secs(1), channel.get::<i32>())
            .await
            .expect("Waited for a channel nobody has");
        assert!(matches!(
            waited,
            Err(ClientError::PVNotFoundError(CouldNotFindError::NotFound))
        ));
    }

    #[tokio::test]
    async fn get_fails_while_disconnected() {
        let shared = ChannelShared::new("PV", 1);
        let channel = Channel::new(shared, Duration::from_millis(20));
        assert!(matches!(
            channel.get::<i32>().await,
            Err(ClientError::Timeout)
        ));
    }
}
