use core::panic;
use std::time::Duration;

use chanaccess::{
    ChannelState, Client, ClientBuilder, ClientError, Provider, RecordKind, ServerBuilder,
    ServerHandle, client::CouldNotFindError, dbr::DbrValue, providers::RecordProvider,
};
use tokio::select;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::fmt::TestWriter;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::TRACE)
        .with_writer(TestWriter::new())
        .try_init();
}

async fn start_server<T: Provider>(provider: T, search_port: u16) -> ServerHandle {
    let server = ServerBuilder::new(provider)
        .connection_port(0)
        .search_port(search_port)
        .beacons(false)
        .start()
        .await
        .unwrap();
    info!(
        "Server ports: {} {}",
        server.connection_port(),
        server.search_port()
    );
    server
}

/// Create a client and server instance, connected to each other via random port
pub async fn connected_client_server<T>(provider: T) -> (Client, ServerHandle)
where
    T: Provider,
{
    let server = start_server(provider, 0).await;
    let client = Client::new_with(
        server.search_port(),
        Some(vec![
            format!("127.0.0.1:{}", server.search_port())
                .parse()
                .unwrap(),
        ]),
    )
    .await
    .unwrap();
    (client, server)
}

#[tokio::test]
async fn test_get() {
    init_logging();
    let provider = RecordProvider::new();
    let record = provider.add_record("TEST", RecordKind::Longin).unwrap();
    record.set_value(42i32).unwrap();
    let (client, server) = connected_client_server(provider).await;

    assert_eq!(client.get::<i32>("TEST").await.unwrap(), 42);
    // Conversion happens on the server
    assert_eq!(client.get::<f64>("TEST").await.unwrap(), 42.0);
    let channel = client.channel("TEST");
    assert_eq!(channel.state(), ChannelState::Connected);
    assert!(channel.access_rights().can_write());

    client.close().await;
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_events() {
    init_logging();
    let provider = RecordProvider::new();
    let record = provider.add_record("TEST", RecordKind::Ai).unwrap();
    record.set_value(42.0).unwrap();
    let (client, server) = connected_client_server(provider).await;

    let mut sub = client.subscribe::<f64>("TEST");
    // Validate we get an initial message without changing
    assert_eq!(sub.recv().await.unwrap(), 42.0);
    record.set_value(413.0).unwrap();
    select! {
        _ = tokio::time::sleep(Duration::from_secs(4)) => panic!("Did not get subscription event"),
        v = sub.recv() => assert_eq!(v.unwrap(), 413.0),
    }
    drop(sub);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_put() {
    init_logging();
    let provider = RecordProvider::new();
    let record = provider.add_record("SETPOINT", RecordKind::Ao).unwrap();
    record.set_field("DRVH", 10.0).unwrap();
    let (client, _server) = connected_client_server(provider).await;

    client.put("SETPOINT", 4.25).await.unwrap();
    assert_eq!(record.value(), DbrValue::Double(vec![4.25]));
    // Output records clamp to their drive limits
    client.put("SETPOINT", 50.0).await.unwrap();
    assert_eq!(client.get::<f64>("SETPOINT").await.unwrap(), 10.0);
}

#[tokio::test]
async fn test_read_written_strings() {
    init_logging();
    let provider = RecordProvider::new();
    let record = provider.add_record("TEST", RecordKind::Stringin).unwrap();
    let (client, _server) = connected_client_server(provider).await;
    client.put("TEST", "Atest").await.unwrap();
    assert_eq!(record.value(), DbrValue::String(vec!["Atest".into()]));
    assert_eq!(client.get::<String>("TEST").await.unwrap(), "Atest");
}

#[tokio::test]
async fn test_fields() {
    init_logging();
    let provider = RecordProvider::new();
    let record = provider.add_record("TEMP", RecordKind::Ai).unwrap();
    record.set_field("EGU", "degC").unwrap();
    record.set_field("HIGH", 30.0).unwrap();
    let (client, _server) = connected_client_server(provider).await;

    assert_eq!(client.get::<String>("TEMP.EGU").await.unwrap(), "degC");
    client.put("TEMP", 35.0).await.unwrap();
    // MINOR
    assert_eq!(client.get::<i16>("TEMP.SEVR").await.unwrap(), 1);
    assert!(matches!(
        client.put("TEMP.SEVR", 0i16).await,
        Err(ClientError::NoWriteAccess)
    ));
}

#[tokio::test]
async fn test_missing_pv() {
    init_logging();
    let provider = RecordProvider::new();
    provider.add_record("PRESENT", RecordKind::Longin).unwrap();
    let server = start_server(provider, 0).await;
    let client = ClientBuilder::new()
        .search_port(server.search_port())
        .broadcast_to(vec![
            format!("127.0.0.1:{}", server.search_port())
                .parse()
                .unwrap(),
        ])
        .timeout(Duration::from_secs(5))
        .request_not_found(true)
        .start()
        .await
        .unwrap();
    let started = std::time::Instant::now();
    assert!(matches!(
        client.get::<i32>("ABSENT").await,
        Err(ClientError::PVNotFoundError(CouldNotFindError::NotFound))
    ));
    // The server said so; nothing waited for the timeout
    assert!(started.elapsed() < Duration::from_secs(4));
    assert_eq!(client.get::<i32>("PRESENT").await.unwrap(), 0);
}

#[tokio::test]
async fn test_missing_pv_times_out_quietly() {
    init_logging();
    let server = start_server(RecordProvider::new(), 0).await;
    let client = ClientBuilder::new()
        .search_port(server.search_port())
        .broadcast_to(vec![
            format!("127.0.0.1:{}", server.search_port())
                .parse()
                .unwrap(),
        ])
        .timeout(Duration::from_millis(300))
        .start()
        .await
        .unwrap();
    assert!(matches!(
        client.get::<i32>("ABSENT").await,
        Err(ClientError::Timeout)
    ));
}

#[tokio::test]
async fn test_reconnects_after_restart() {
    init_logging();
    let provider = RecordProvider::new();
    provider
        .add_record("SURVIVOR", RecordKind::Longin)
        .unwrap()
        .set_value(1i32)
        .unwrap();
    let (client, server) = connected_client_server(provider).await;
    let search_port = server.search_port();
    let channel = client.channel("SURVIVOR");
    assert_eq!(channel.get::<i32>().await.unwrap(), 1);

    server.stop().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while channel.state() == ChannelState::Connected {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("Channel did not notice the server stopping");
    assert_eq!(channel.state(), ChannelState::Disconnected);

    let provider = RecordProvider::new();
    provider
        .add_record("SURVIVOR", RecordKind::Longin)
        .unwrap()
        .set_value(2i32)
        .unwrap();
    let _server = start_server(provider, search_port).await;
    channel
        .wait_connected(Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(channel.get::<i32>().await.unwrap(), 2);
}
