//! Bounded queues carrying monitor updates from a provider to a circuit.
//!
//! A reader that falls behind never makes the queue grow: once
//! [`MONITOR_QUEUE_DEPTH`] updates are waiting, each new update replaces the
//! newest waiting one, so the reader always ends on the latest value. The
//! queue itself sits behind a lock; a capacity-one channel only carries
//! "look again" wakeups, where a full channel means a wakeup is already due.

use std::{
    collections::VecDeque,
    pin::Pin,
    sync::{Arc, Mutex, PoisonError},
    task::{Context, Poll},
};

use tokio::sync::mpsc::{
    self,
    error::{TryRecvError, TrySendError},
};
use tokio_stream::Stream;

use crate::dbr::Dbr;

/// Updates held for a slow reader before the newest starts being replaced
pub const MONITOR_QUEUE_DEPTH: usize = 8;

type Queue = Arc<Mutex<VecDeque<Dbr>>>;

/// Create a connected sender and receiver for one monitor
pub fn monitor_channel() -> (MonitorSender, MonitorReceiver) {
    let queue = Queue::default();
    let (trigger, wakeups) = mpsc::channel(1);
    (
        MonitorSender {
            queue: queue.clone(),
            trigger,
        },
        MonitorReceiver { queue, wakeups },
    )
}

#[derive(Debug)]
pub struct MonitorSender {
    queue: Queue,
    trigger: mpsc::Sender<()>,
}

impl MonitorSender {
    /// Queue an update without waiting
    ///
    /// Returns false once the receiver has been dropped.
    pub fn send(&self, dbr: Dbr) -> bool {
        if self.trigger.is_closed() {
            return false;
        }
        {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            if queue.len() >= MONITOR_QUEUE_DEPTH {
                queue.pop_back();
            }
            queue.push_back(dbr);
        }
        match self.trigger.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => true,
            Err(TrySendError::Closed(())) => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.trigger.is_closed()
    }
}

/// The reading end of a monitor, also usable as a [`Stream`]
///
/// Ends once the sender is gone and every queued update has been read.
#[derive(Debug)]
pub struct MonitorReceiver {
    queue: Queue,
    wakeups: mpsc::Receiver<()>,
}

impl MonitorReceiver {
    fn pop(&self) -> Option<Dbr> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    pub async fn recv(&mut self) -> Option<Dbr> {
        loop {
            if let Some(dbr) = self.pop() {
                return Some(dbr);
            }
            if self.wakeups.recv().await.is_none() {
                return self.pop();
            }
        }
    }

    pub fn try_recv(&mut self) -> Result<Dbr, TryRecvError> {
        if let Some(dbr) = self.pop() {
            return Ok(dbr);
        }
        match self.wakeups.try_recv() {
            Err(TryRecvError::Disconnected) => self.pop().ok_or(TryRecvError::Disconnected),
            _ => self.pop().ok_or(TryRecvError::Empty),
        }
    }

    /// Number of updates waiting to be read
    pub fn len(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Stream for MonitorReceiver {
    type Item = Dbr;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Dbr>> {
        loop {
            if let Some(dbr) = self.pop() {
                return Poll::Ready(Some(dbr));
            }
            match self.wakeups.poll_recv(cx) {
                Poll::Ready(Some(())) => continue,
                Poll::Ready(None) => return Poll::Ready(self.pop()),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dbr::DbrValue;
    use tokio_stream::StreamExt;

    fn update(value: i32) -> Dbr {
        Dbr::Basic(DbrValue::Long(vec![value]))
    }

    #[test]
    fn slow_readers_keep_the_latest_value() {
        let (sender, mut receiver) = monitor_channel();
        for value in 0..100 {
            assert!(sender.send(update(value)));
        }
        assert_eq!(receiver.len(), MONITOR_QUEUE_DEPTH);
        let mut values = Vec::new();
        while let Ok(dbr) = receiver.try_recv() {
            values.push(dbr);
        }
        assert_eq!(values.len(), MONITOR_QUEUE_DEPTH);
        assert_eq!(values[0], update(0));
        assert_eq!(values.last(), Some(&update(99)));
    }

    #[test]
    fn dropped_receivers_close_the_sender() {
        let (sender, receiver) = monitor_channel();
        assert!(!sender.is_closed());
        drop(receiver);
        assert!(sender.is_closed());
        assert!(!sender.send(update(1)));
    }

    #[tokio::test]
    async fn streams_drain_before_ending() {
        let (sender, mut receiver) = monitor_channel();
        sender.send(update(1));
        sender.send(update(2));
        drop(sender);
        assert_eq!(receiver.next().await, Some(update(1)));
        assert_eq!(receiver.recv().await, Some(update(2)));
        assert_eq!(receiver.next().await, None);
        assert!(matches!(
            receiver.try_recv(),
            Err(TryRecvError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn readers_wake_for_new_updates() {
        let (sender, mut receiver) = monitor_channel();
        let reader = tokio::spawn(async move { receiver.recv().await });
        tokio::task::yield_now().await;
        sender.send(update(7));
        assert_eq!(reader.await.unwrap(), Some(update(7)));
    }
}
