//! UDP tracker protocol
//!
//! Connect/announce exchange over a single UDP socket. Every response is
//! matched against the transaction id of the request that caused it; stale
//! or foreign datagrams are dropped.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use anyhow::Result;
use bytes::{Buf, BufMut, BytesMut};
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, trace};
use url::Url;

use crate::error::TorrentError;
use crate::tracker::{AnnounceParams, AnnounceResponse};

/// Magic connection id for the connect request
pub const PROTOCOL_ID: u64 = 0x41727101980;

const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;

pub const CONNECT_REQUEST_LEN: usize = 16;
pub const ANNOUNCE_REQUEST_LEN: usize = 98;
const CONNECT_RESPONSE_LEN: usize = 16;
const ANNOUNCE_HEADER_LEN: usize = 20;
const PEER_RECORD_LEN: usize = 6;

const MAX_DATAGRAM: usize = 65_536;

pub fn build_connect_request(transaction_id: u32) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(CONNECT_REQUEST_LEN);
    buf.put_u64(PROTOCOL_ID);
    buf.put_u32(ACTION_CONNECT);
    buf.put_u32(transaction_id);
    buf.to_vec()
}

/// Announce with downloaded=0, uploaded=0, event=none, ip=0, num_want=-1
pub fn build_announce_request(
    connection_id: u64,
    transaction_id: u32,
    params: &AnnounceParams,
    key: u32,
) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(ANNOUNCE_REQUEST_LEN);
    buf.put_u64(connection_id);
    buf.put_u32(ACTION_ANNOUNCE);
    buf.put_u32(transaction_id);
    buf.put_slice(&params.info_hash);
    buf.put_slice(&params.peer_id);
    buf.put_u64(0);
    buf.put_u64(params.left);
    buf.put_u64(0);
    buf.put_u32(0);
    buf.put_u32(0);
    buf.put_u32(key);
    buf.put_i32(-1);
    buf.put_u16(params.port);
    buf.to_vec()
}

/// Read action and transaction id; `None` if the datagram is not ours
fn response_header(mut buf: &[u8], transaction_id: u32) -> Result<Option<(u32, &[u8])>> {
    if buf.len() < 8 {
        return Ok(None);
    }
    let action = buf.get_u32();
    let tid = buf.get_u32();
    if tid != transaction_id {
        trace!("Ignoring datagram with transaction id {:#x}, expected {:#x}", tid, transaction_id);
        return Ok(None);
    }
    if action == ACTION_ERROR {
        let message = String::from_utf8_lossy(buf).into_owned();
        return Err(TorrentError::network_error(format!("Tracker error: {}", message)).into());
    }
    Ok(Some((action, buf)))
}

/// Extract the connection id from a connect response
pub fn parse_connect_response(buf: &[u8], transaction_id: u32) -> Result<Option<u64>> {
    let Some((action, mut rest)) = response_header(buf, transaction_id)? else {
        return Ok(None);
    };
    if action != ACTION_CONNECT {
        return Ok(None);
    }
    if buf.len() < CONNECT_RESPONSE_LEN {
        return Err(TorrentError::protocol_error(format!(
            "Connect response too short: {} bytes",
            buf.len()
        ))
        .into());
    }
    Ok(Some(rest.get_u64()))
}

/// Parse an announce response: 20-byte header then 6-byte peer records
pub fn parse_announce_response(buf: &[u8], transaction_id: u32) -> Result<Option<AnnounceResponse>> {
    let Some((action, mut rest)) = response_header(buf, transaction_id)? else {
        return Ok(None);
    };
    if action != ACTION_ANNOUNCE {
        return Ok(None);
    }
    if buf.len() < ANNOUNCE_HEADER_LEN {
        return Err(TorrentError::protocol_error(format!(
            "Announce response too short: {} bytes",
            buf.len()
        ))
        .into());
    }

    let interval = rest.get_u32();
    let leechers = rest.get_u32();
    let seeders = rest.get_u32();
    let peers = parse_compact_peers(rest);

    Ok(Some(AnnounceResponse { interval, leechers, seeders, peers }))
}

/// Decode 6-byte (IPv4, big-endian port) records; a trailing partial record is dropped
pub fn parse_compact_peers(data: &[u8]) -> Vec<SocketAddr> {
    data.chunks_exact(PEER_RECORD_LEN)
        .map(|record| {
            let ip = Ipv4Addr::new(record[0], record[1], record[2], record[3]);
            let port = u16::from_be_bytes([record[4], record[5]]);
            SocketAddr::V4(SocketAddrV4::new(ip, port))
        })
        .collect()
}

/// Resolve a `udp://host:port/...` URL, preferring IPv4
pub async fn resolve(url: &Url) -> Result<SocketAddr> {
    let host = url
        .host_str()
        .ok_or_else(|| TorrentError::config_error_with_field(format!("Tracker URL has no host: {}", url), "announce"))?;
    let port = url
        .port()
        .ok_or_else(|| TorrentError::config_error_with_field(format!("Tracker URL has no port: {}", url), "announce"))?;

    let addrs: Vec<SocketAddr> = lookup_host((host, port))
        .await
        .map_err(|e| TorrentError::network_error_full("Failed to resolve tracker", host, e.to_string()))?
        .collect();

    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| TorrentError::network_error_with_address("Tracker host has no addresses", host).into())
}

/// Wait for the first datagram the parser accepts
async fn receive<T>(socket: &UdpSocket, parse: impl Fn(&[u8]) -> Result<Option<T>>) -> Result<T> {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let n = socket.recv(&mut buf).await.map_err(|e| {
            TorrentError::network_error_full("Tracker receive failed", "udp", e.to_string())
        })?;
        if let Some(value) = parse(&buf[..n])? {
            return Ok(value);
        }
    }
}

/// Full connect + announce against one tracker
///
/// The connect step is bounded by `connect_timeout`; the announce step waits
/// until the caller's own deadline cancels it.
pub async fn announce(url: &Url, params: &AnnounceParams, connect_timeout: Duration) -> Result<AnnounceResponse> {
    let addr = resolve(url).await?;
    let bind = if addr.is_ipv4() {
        SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0)
    } else {
        SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0)
    };

    let network_err = |what: &str, e: std::io::Error| {
        TorrentError::network_error_full(what.to_string(), addr.to_string(), e.to_string())
    };
    let socket = UdpSocket::bind(bind).await.map_err(|e| network_err("Failed to bind UDP socket", e))?;
    socket.connect(addr).await.map_err(|e| network_err("Failed to connect UDP socket", e))?;

    let tid: u32 = rand::random();
    socket
        .send(&build_connect_request(tid))
        .await
        .map_err(|e| network_err("Failed to send connect request", e))?;
    debug!("Sent connect request to {} ({})", url, addr);

    let connection_id = timeout(connect_timeout, receive(&socket, |buf| parse_connect_response(buf, tid)))
        .await
        .map_err(|_| TorrentError::network_error_with_address("Tracker connect timed out", addr.to_string()))??;

    let tid: u32 = rand::random();
    let key: u32 = rand::random();
    socket
        .send(&build_announce_request(connection_id, tid, params, key))
        .await
        .map_err(|e| network_err("Failed to send announce request", e))?;
    debug!("Sent announce to {} ({})", url, addr);

    let response = receive(&socket, |buf| parse_announce_response(buf, tid)).await?;
    debug!(
        "Tracker {} returned {} peers ({} seeders, {} leechers)",
        url,
        response.peers.len(),
        response.seeders,
        response.leechers
    );
    Ok(response)
}
