//! HTTP tracker announce
//!
//! Compact announce over HTTP(S). Only the peer list is used; the response's
//! interval and counts are reported when present.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::Result;
use serde_bencode::value::Value;
use tracing::debug;
use url::Url;

use crate::error::TorrentError;
use crate::tracker::udp::parse_compact_peers;
use crate::tracker::{AnnounceParams, AnnounceResponse};

/// Build the announce URL with the query parameters appended
pub fn announce_url(base: &Url, params: &AnnounceParams) -> String {
    let separator = if base.query().is_some() { '&' } else { '?' };
    format!(
        "{}{}info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&left={}&compact=1",
        base,
        separator,
        urlencoding::encode_binary(&params.info_hash),
        urlencoding::encode_binary(&params.peer_id),
        params.port,
        params.left
    )
}

pub async fn announce(url: &Url, params: &AnnounceParams, request_timeout: Duration) -> Result<AnnounceResponse> {
    let client = reqwest::Client::builder()
        .timeout(request_timeout)
        .build()
        .map_err(|e| TorrentError::network_error_full("Failed to build HTTP client", url.as_str(), e.to_string()))?;

    let target = announce_url(url, params);
    debug!("HTTP announce to {}", url);
    let response = client
        .get(&target)
        .send()
        .await
        .map_err(|e| TorrentError::network_error_full("HTTP announce failed", url.as_str(), e.to_string()))?;
    let body = response
        .bytes()
        .await
        .map_err(|e| TorrentError::network_error_full("Failed to read HTTP announce", url.as_str(), e.to_string()))?;

    parse_response(&body)
}

fn int(dict: &HashMap<Vec<u8>, Value>, key: &[u8]) -> u32 {
    match dict.get(key) {
        Some(Value::Int(i)) => u32::try_from(*i).unwrap_or(0),
        _ => 0,
    }
}

/// Decode a bencoded announce response, compact or dictionary peer list
pub fn parse_response(body: &[u8]) -> Result<AnnounceResponse> {
    let value: Value = serde_bencode::from_bytes(body)
        .map_err(|e| TorrentError::network_error_full("Invalid tracker response", "http", e.to_string()))?;
    let Value::Dict(dict) = value else {
        return Err(TorrentError::network_error("Tracker response is not a dictionary").into());
    };

    if let Some(Value::Bytes(reason)) = dict.get(b"failure reason".as_slice()) {
        return Err(TorrentError::network_error(format!(
            "Tracker error: {}",
            String::from_utf8_lossy(reason)
        ))
        .into());
    }

    let peers = match dict.get(b"peers".as_slice()) {
        Some(Value::Bytes(compact)) => parse_compact_peers(compact),
        Some(Value::List(entries)) => entries
            .iter()
            .filter_map(|entry| {
                let Value::Dict(peer) = entry else { return None };
                let ip = match peer.get(b"ip".as_slice()) {
                    Some(Value::Bytes(ip)) => std::str::from_utf8(ip).ok()?.parse::<IpAddr>().ok()?,
                    _ => return None,
                };
                let port = match peer.get(b"port".as_slice()) {
                    Some(Value::Int(port)) => u16::try_from(*port).ok()?,
                    _ => return None,
                };
                Some(SocketAddr::new(ip, port))
            })
            .collect(),
        _ => Vec::new(),
    };

    Ok(AnnounceResponse {
        interval: int(&dict, b"interval"),
        leechers: int(&dict, b"incomplete"),
        seeders: int(&dict, b"complete"),
        peers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_announce_url_escapes_binary() {
        let base = Url::parse("http://tracker.example.com/announce").unwrap();
        let params = AnnounceParams { info_hash: [0xFF; 20], peer_id: *b"-BL0001-abcdefghijkl", left: 10, port: 6881 };
        let url = announce_url(&base, &params);
        assert!(url.starts_with("http://tracker.example.com/announce?info_hash=%FF%FF"));
        assert!(url.contains("peer_id=-BL0001-abcdefghijkl"));
        assert!(url.contains("&left=10&compact=1"));
    }

    #[test]
    fn test_parse_compact_response() {
        let mut body = b"d8:completei4e10:incompletei2e8:intervali900e5:peers12:".to_vec();
        body.extend_from_slice(&[10, 0, 0, 1, 0x1A, 0xE1, 10, 0, 0, 2, 0x1A, 0xE2]);
        body.push(b'e');

        let response = parse_response(&body).unwrap();
        assert_eq!(response.interval, 900);
        assert_eq!(response.seeders, 4);
        assert_eq!(response.leechers, 2);
        assert_eq!(response.peers.len(), 2);
        assert_eq!(response.peers[1], "10.0.0.2:6882".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn test_parse_dictionary_peers() {
        let body = b"d8:intervali60e5:peersld2:ip9:127.0.0.14:porti6881eeee";
        let response = parse_response(body).unwrap();
        assert_eq!(response.peers, vec!["127.0.0.1:6881".parse::<SocketAddr>().unwrap()]);
    }

    #[test]
    fn test_failure_reason() {
        let err = parse_response(b"d14:failure reason9:not founde").unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
