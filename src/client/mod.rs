mod channel;
mod circuit;
#[allow(clippy::module_inception)]
mod client;
mod searcher;
mod subscription;

pub use channel::{Channel, ChannelInfo, ChannelState, MonitorOptions, SubscriptionId};
pub use client::{Client, ClientBuilder, ClientError};
pub use searcher::{CouldNotFindError, SearchOutcome, Searcher, SearcherBuilder};
pub use subscription::{SubscriberRecvError, SubscriberTryRecvError, Subscription};
