use num::{FromPrimitive, traits::WrappingAdd};
use pnet::datalink;
use socket2::{Domain, Protocol, Type};
use std::{
    env,
    io::{self},
    net::{SocketAddr, ToSocketAddrs},
    time::Duration,
};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

/// Bind a UDP socket that other processes on this host can also bind
///
/// Several servers may listen for searches on the same port.
pub(crate) fn new_reusable_udp_socket<T: ToSocketAddrs>(address: T) -> io::Result<UdpSocket> {
    let addr = address.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "No address to bind UDP socket to")
    })?;
    let socket = socket2::Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_port(true)?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(std::net::UdpSocket::from(socket))
}

/// Increments a mutable reference in place, and returns the original value
pub(crate) fn wrapping_inplace_add<T: WrappingAdd + FromPrimitive + Copy>(value: &mut T) -> T {
    let id = *value;
    if let Some(one) = T::from_u8(1) {
        *value = value.wrapping_add(&one);
    }
    id
}

/// Get the server listen port, either from environment or default 5064
pub fn get_default_server_port() -> u16 {
    env::var("EPICS_CA_SERVER_PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(5064u16)
        .max(5000u16)
}

/// Get the beacon broadcast port, either from environment or default 5065
pub fn get_default_beacon_port() -> u16 {
    env::var("EPICS_CA_REPEATER_PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(5065u16)
        .max(5000u16)
}

/// Parse one entry of an address list, using `default_port` if none is given
fn parse_address_entry(entry: &str, default_port: u16) -> io::Result<Vec<SocketAddr>> {
    if entry.contains(':') {
        entry.to_socket_addrs().map(Iterator::collect)
    } else {
        (entry, default_port).to_socket_addrs().map(Iterator::collect)
    }
}

/// Get the target list of broadcast IPs, by reading the environment and interfaces
///
/// Hostnames are resolved if in the environment setting, so this will re-resolve
pub fn get_target_broadcast_ips(default_search_port: u16) -> Vec<SocketAddr> {
    let mut ips = Vec::new();
    // Work out if we want to automatically include all local broadcast
    let use_auto_address = env::var("EPICS_CA_AUTO_ADDR_LIST")
        .map(|v| !v.eq_ignore_ascii_case("no"))
        .unwrap_or(true);
    if use_auto_address {
        ips.extend(
            datalink::interfaces()
                .into_iter()
                .filter(|i| !i.is_loopback())
                .flat_map(|i| i.ips.into_iter())
                .filter(|i| i.is_ipv4())
                .flat_map(|f| (f.broadcast(), default_search_port).to_socket_addrs())
                .flatten(),
        );
    }
    if let Ok(addr_list) = env::var("EPICS_CA_ADDR_LIST") {
        for add in addr_list.split_ascii_whitespace() {
            match parse_address_entry(add, default_search_port) {
                Ok(addr) => {
                    debug!("Adding search IP: {add} => {addr:?}");
                    ips.extend(addr);
                }
                Err(e) => warn!("Failed to convert '{add}' to address: {e}"),
            }
        }
    }
    ips.dedup();
    ips
}

/// Seconds of silence before a circuit is probed, then declared dead
pub fn get_default_connection_timeout() -> f32 {
    env::var("EPICS_CA_CONN_TMO")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(30.0f32)
        .max(0.1f32)
}

pub fn get_default_beacon_period() -> f32 {
    env::var("EPICS_CA_BEACON_PERIOD")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(15.0f32)
        .max(0.1f32)
}

pub fn get_default_max_search_interval() -> f32 {
    env::var("EPICS_CA_MAX_SEARCH_PERIOD")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(300.0f32)
        .max(60f32)
}

/// Convert one of the float second settings into a [`Duration`]
pub(crate) fn seconds(value: f32) -> Duration {
    Duration::try_from_secs_f32(value).unwrap_or(Duration::from_secs(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrapping_add() {
        let mut i = 3u32;
        assert_eq!(wrapping_inplace_add(&mut i), 3);
        assert_eq!(i, 4);
        let mut top = u16::MAX;
        assert_eq!(wrapping_inplace_add(&mut top), u16::MAX);
        assert_eq!(top, 0);
    }

    #[test]
    fn address_entries() {
        assert_eq!(
            parse_address_entry("127.0.0.1", 5064).unwrap(),
            vec!["127.0.0.1:5064".parse().unwrap()]
        );
        assert_eq!(
            parse_address_entry("127.0.0.1:7000", 5064).unwrap(),
            vec!["127.0.0.1:7000".parse().unwrap()]
        );
    }

    #[tokio::test]
    async fn reusable_sockets_share_a_port() {
        let first = new_reusable_udp_socket("127.0.0.1:0").unwrap();
        let port = first.local_addr().unwrap().port();
        let second = new_reusable_udp_socket(("127.0.0.1", port)).unwrap();
        assert_eq!(second.local_addr().unwrap().port(), port);
    }
}
