//! Rust implementation of the EPICS Channel Access protocol core.
//!
//! This crate is a pure-rust implementation of the [EPICS CA protocol], covering
//! both ends of a connection. It does not depend on the C-based [epics-base] project
//! at all.
//!
//! The pieces, from the wire upwards:
//!
//! - [frame] and [splitter]: the 16 or 24 byte message headers, and reassembling
//!   whole messages out of a TCP stream.
//! - [messages]: mapping each CA command to and from its frame.
//! - [dbr]: the ["DBR" types] values travel as, with conversions between them.
//! - [Client]: finds PVs by UDP search, keeps one circuit per server, and hands out
//!   [Channel]s that reconnect by themselves when a server goes away.
//! - [ServerBuilder]: answers searches, sends beacons, and serves circuits from a
//!   [Provider], the trait your application implements to expose values.
//! - [record]: a small record model ([Record]) with fields, alarms and scanning,
//!   served by [`providers::RecordProvider`].
//!
//! ## Example
//!
//! Serving a record and reading it back through a client:
//!
//! ```
//! use chanaccess::{Client, RecordKind, ServerBuilder, providers::RecordProvider};
//!
//! #[tokio::main]
//! async fn main() {
//!     let provider = RecordProvider::new();
//!     let temperature = provider.add_record("TEMPERATURE", RecordKind::Ai).unwrap();
//!     temperature.set_value(21.5).unwrap();
//!     let server = ServerBuilder::new(provider)
//!         .connection_port(0)
//!         .search_port(0)
//!         .beacons(false)
//!         .start()
//!         .await
//!         .unwrap();
//!
//!     let target = format!("127.0.0.1:{}", server.search_port()).parse().unwrap();
//!     let client = Client::new_with(server.search_port(), Some(vec![target]))
//!         .await
//!         .unwrap();
//!     assert_eq!(client.get::<f64>("TEMPERATURE").await.unwrap(), 21.5);
//!     client.close().await;
//!     server.stop().await.unwrap();
//! }
//! ```
//!
//! Settings that are not given explicitly come from the usual `EPICS_CA_*`
//! environment variables, see [utils].
//!
//! [EPICS CA protocol]:
//!     https://docs.epics-controls.org/en/latest/internal/ca_protocol.html
//! [epics-base]: https://github.com/epics-base/epics-base
//! ["DBR" types]:
//!     https://docs.epics-controls.org/en/latest/internal/ca_protocol.html#payload-data-types

pub mod client;
pub mod dbr;
pub mod frame;
pub mod messages;
pub mod providers;
pub mod record;
pub mod splitter;
pub mod utils;

mod server;

pub use crate::client::{Channel, ChannelState, Client, ClientBuilder, ClientError};
pub use crate::providers::Provider;
pub use crate::record::{AlarmSeverity, AlarmStatus, Record, RecordKind, ScanPolicy};
pub use crate::server::{ServerBuilder, ServerHandle};
