use std::{marker::PhantomData, time::Duration};

use thiserror::Error;
use tokio::sync::broadcast;

use crate::dbr::{Dbr, DbrValue};

/// Errors from [`Subscription::recv`]
#[derive(Debug, Error)]
pub enum SubscriberRecvError {
    #[error("Channel closed")]
    Closed,
    #[error("No first value before the timeout")]
    Timeout,
    #[error("Receiver lagged by {0} messages")]
    Lagged(u64),
    #[error("Could not convert Dbr to type")]
    NoConvert(Box<Dbr>),
}

impl From<broadcast::error::RecvError> for SubscriberRecvError {
    fn from(err: broadcast::error::RecvError) -> Self {
        match err {
            broadcast::error::RecvError::Closed => Self::Closed,
            broadcast::error::RecvError::Lagged(n) => Self::Lagged(n),
        }
    }
}

/// Errors from [`Subscription::try_recv`]
#[derive(Debug, Error)]
pub enum SubscriberTryRecvError {
    #[error("No messages outstanding")]
    Empty,
    #[error("Channel closed")]
    Closed,
    #[error("Receiver lagged by {0} messages")]
    Lagged(u64),
    #[error("Could not convert Dbr to type")]
    NoConvert(Box<Dbr>),
}

impl From<broadcast::error::TryRecvError> for SubscriberTryRecvError {
    fn from(err: broadcast::error::TryRecvError) -> Self {
        match err {
            broadcast::error::TryRecvError::Empty => Self::Empty,
            broadcast::error::TryRecvError::Closed => Self::Closed,
            broadcast::error::TryRecvError::Lagged(n) => Self::Lagged(n),
        }
    }
}

/// Monitor updates from a channel, converted to `T` as they arrive
///
/// The server subscription stays alive while any subscription for the
/// channel exists; dropping the last one lets the client cancel it.
/// Subscriptions survive reconnection of the channel.
#[derive(Debug)]
pub struct Subscription<T>
where
    T: for<'a> TryFrom<&'a DbrValue>,
{
    inner: broadcast::Receiver<Dbr>,
    /// Cleared once the first value arrives
    first_value_timeout: Option<Duration>,
    _phantom: PhantomData<fn() -> T>,
}

fn convert<T>(dbr: Dbr) -> Result<T, Dbr>
where
    T: for<'a> TryFrom<&'a DbrValue>,
{
    let converted = T::try_from(dbr.value()).ok();
    match converted {
        Some(v) => Ok(v),
        None => Err(dbr),
    }
}

impl<T> Subscription<T>
where
    T: for<'a> TryFrom<&'a DbrValue>,
{
    pub(crate) fn new(inner: broadcast::Receiver<Dbr>) -> Self {
        Self {
            inner,
            first_value_timeout: None,
            _phantom: PhantomData,
        }
    }

    /// Fail the first receive if nothing arrives within `timeout`
    pub(crate) fn with_first_value_timeout(mut self, timeout: Duration) -> Self {
        self.first_value_timeout = Some(timeout);
        self
    }

    /// Receive the next update with all of its metadata
    pub async fn recv_dbr(&mut self) -> Result<Dbr, SubscriberRecvError> {
        let Some(limit) = self.first_value_timeout else {
            return Ok(self.inner.recv().await?);
        };
        let dbr = tokio::time::timeout(limit, self.inner.recv())
            .await
            .map_err(|_| SubscriberRecvError::Timeout)??;
        self.first_value_timeout = None;
        Ok(dbr)
    }

    /// Receive the next value from the channel.
    pub async fn recv(&mut self) -> Result<T, SubscriberRecvError> {
        let dbr = self.recv_dbr().await?;
        convert(dbr).map_err(|dbr| SubscriberRecvError::NoConvert(Box::new(dbr)))
    }

    /// Blocking receive for synchronous contexts (maps error).
    ///
    /// Waits without a limit, even for the first value.
    pub fn blocking_recv(&mut self) -> Result<T, SubscriberRecvError> {
        let dbr = self.inner.blocking_recv()?;
        self.first_value_timeout = None;
        convert(dbr).map_err(|dbr| SubscriberRecvError::NoConvert(Box::new(dbr)))
    }

    /// Try to receive a value without waiting.
    pub fn try_recv(&mut self) -> Result<T, SubscriberTryRecvError> {
        let dbr = self.inner.try_recv()?;
        self.first_value_timeout = None;
        convert(dbr).map_err(|dbr| SubscriberTryRecvError::NoConvert(Box::new(dbr)))
    }

    /// Returns `true` if the channel is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
    /// Returns the number of messages currently in the channel.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Clones the receiver.
    pub fn resubscribe(&self) -> Self {
        Self {
            inner: self.inner.resubscribe(),
            first_value_timeout: None,
            _phantom: PhantomData,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn converts_values() {
        let sender = broadcast::Sender::new(4);
        let mut sub = Subscription::<f64>::new(sender.subscribe());
        sender.send(Dbr::Basic(DbrValue::Int(vec![3]))).unwrap();
        assert_eq!(sub.recv().await.unwrap(), 3.0);

        let mut strings = sub_of_string(&sender);
        sender
            .send(Dbr::Basic(DbrValue::Double(vec![1.5])))
            .unwrap();
        assert_eq!(strings.try_recv().unwrap(), "1.5");
        assert!(matches!(strings.try_recv(), Err(SubscriberTryRecvError::Empty)));
    }

    fn sub_of_string(sender: &broadcast::Sender<Dbr>) -> Subscription<String> {
        Subscription::new(sender.subscribe())
    }

    #[tokio::test]
    async fn unconvertible_values_are_returned() {
        let sender = broadcast::Sender::new(4);
        let mut sub = Subscription::<i8>::new(sender.subscribe());
        sender.send(Dbr::Basic(DbrValue::Long(vec![100_000]))).unwrap();
        let Err(SubscriberRecvError::NoConvert(dbr)) = sub.recv().await else {
            panic!("Expected conversion failure");
        };
        assert_eq!(dbr.value(), &DbrValue::Long(vec![100_000]));
    }
}
