//! Torrent file parser
//!
//! Decodes a .torrent descriptor into [`TorrentInfo`]. The descriptor is
//! decoded into a generic bencode value first; the info hash is taken over the
//! raw bytes of the `info` dictionary exactly as they appear in the file.

use std::collections::HashMap;

use anyhow::Result;
use serde_bencode::value::Value;
use tracing::{debug, error, info, trace};

use crate::error::TorrentError;
use crate::torrent::info::{TorrentFile, TorrentInfo};

type Dict = HashMap<Vec<u8>, Value>;

/// Parser for .torrent files
pub struct TorrentParser;

impl TorrentParser {
    /// Parse a .torrent file from bytes
    pub fn parse_bytes(data: &[u8]) -> Result<TorrentInfo> {
        info!("Parsing torrent file from {} bytes", data.len());
        trace!("Torrent data (first 100 bytes): {:?}", &data[..data.len().min(100)]);

        let parsed: Value = serde_bencode::from_bytes(data).map_err(TorrentError::from)?;
        let root = match parsed {
            Value::Dict(d) => d,
            _ => return Err(TorrentError::parse_error("Root must be a dictionary").into()),
        };

        let info_bytes = Self::find_info_span(data)?;
        let info_hash = TorrentInfo::generate_info_hash(info_bytes);
        debug!("Info hash: {}", hex::encode(info_hash));

        let torrent = Self::convert_to_torrent_info(&root, info_hash)?;
        Self::validate(&torrent)?;

        info!("Successfully parsed torrent: {}", torrent.name);
        Ok(torrent)
    }

    /// Parse a .torrent file from a file path
    pub fn parse_file(path: &std::path::Path) -> Result<TorrentInfo> {
        info!("Loading torrent file from: {}", path.display());

        let data = std::fs::read(path).map_err(|e| {
            error!("Failed to read torrent file '{}': {}", path.display(), e);
            TorrentError::parse_error_with_source(
                format!("Failed to read torrent file '{}'", path.display()),
                e.to_string(),
            )
        })?;

        debug!("Read {} bytes from torrent file", data.len());
        Self::parse_bytes(&data)
    }

    fn convert_to_torrent_info(root: &Dict, info_hash: [u8; 20]) -> Result<TorrentInfo> {
        let announce = get_string(root, b"announce")
            .ok_or_else(|| TorrentError::parse_error("Missing announce field"))?;

        let mut announce_list = vec![announce.clone()];
        if let Some(Value::List(tiers)) = root.get(b"announce-list".as_slice()) {
            for tier in tiers {
                let Value::List(urls) = tier else { continue };
                for url in urls {
                    if let Value::Bytes(bytes) = url {
                        let url = String::from_utf8_lossy(bytes).to_string();
                        if !announce_list.contains(&url) {
                            announce_list.push(url);
                        }
                    }
                }
            }
        }

        let info_dict = match root.get(b"info".as_slice()) {
            Some(Value::Dict(d)) => d,
            _ => return Err(TorrentError::parse_error("Missing info dictionary").into()),
        };

        let name = get_string(info_dict, b"name")
            .ok_or_else(|| TorrentError::parse_error("Missing name field"))?;

        let piece_length = get_int(info_dict, b"piece length")
            .ok_or_else(|| TorrentError::parse_error("Missing piece length"))?;
        if piece_length <= 0 {
            return Err(TorrentError::parse_error_with_source(
                "Piece length must be positive",
                format!("got {}", piece_length),
            ).into());
        }

        let pieces_bytes = match info_dict.get(b"pieces".as_slice()) {
            Some(Value::Bytes(b)) => b,
            _ => return Err(TorrentError::parse_error("Missing pieces field").into()),
        };
        let pieces = TorrentInfo::parse_piece_hashes(pieces_bytes)?;

        let (length, files) = if let Some(len) = get_int(info_dict, b"length") {
            if len < 0 {
                return Err(TorrentError::parse_error("Negative length field").into());
            }
            (Some(len as u64), None)
        } else if let Some(Value::List(file_list)) = info_dict.get(b"files".as_slice()) {
            let mut torrent_files = Vec::with_capacity(file_list.len());
            for entry in file_list {
                let Value::Dict(file_dict) = entry else {
                    return Err(TorrentError::parse_error("File entry must be a dictionary").into());
                };
                let file_len = get_int(file_dict, b"length")
                    .filter(|len| *len >= 0)
                    .ok_or_else(|| TorrentError::parse_error("Missing file length"))?;
                let path = match file_dict.get(b"path".as_slice()) {
                    Some(Value::List(parts)) => parts
                        .iter()
                        .filter_map(|p| match p {
                            Value::Bytes(b) => Some(String::from_utf8_lossy(b).to_string()),
                            _ => None,
                        })
                        .collect(),
                    _ => return Err(TorrentError::parse_error("Missing file path").into()),
                };
                torrent_files.push(TorrentFile { path, length: file_len as u64 });
            }
            (None, Some(torrent_files))
        } else {
            return Err(TorrentError::parse_error("Neither length nor files found in info dict").into());
        };

        Ok(TorrentInfo {
            announce,
            announce_list,
            info_hash,
            piece_length: piece_length as u64,
            pieces,
            name,
            length,
            files,
        })
    }

    /// Geometry must agree with the hash list
    fn validate(torrent: &TorrentInfo) -> Result<()> {
        let total = torrent.total_size();
        if total == 0 {
            return Err(TorrentError::validation_error_with_field("Torrent has zero total length", "length").into());
        }
        let expected = total.div_ceil(torrent.piece_length);
        if expected != torrent.piece_count() as u64 {
            return Err(TorrentError::validation_error_with_field(
                format!(
                    "Piece count does not match total length: expected {} pieces, found {} hashes",
                    expected,
                    torrent.piece_count()
                ),
                "pieces",
            ).into());
        }
        if torrent.piece_length > u32::MAX as u64 {
            return Err(TorrentError::validation_error_with_field("Piece length too large", "piece length").into());
        }
        Ok(())
    }

    /// Locate the raw bytes of the top-level `info` value
    fn find_info_span(data: &[u8]) -> Result<&[u8]> {
        if data.first() != Some(&b'd') {
            return Err(TorrentError::parse_error("Root must be a dictionary").into());
        }
        let mut idx = 1;
        while idx < data.len() && data[idx] != b'e' {
            let key_start = idx;
            idx = skip_value(data, idx)?;
            let key = string_payload(&data[key_start..idx]);
            let value_start = idx;
            idx = skip_value(data, idx)?;
            if key == Some(b"info".as_slice()) {
                return Ok(&data[value_start..idx]);
            }
        }
        Err(TorrentError::parse_error("Missing info dictionary").into())
    }
}

fn get_string(dict: &Dict, key: &[u8]) -> Option<String> {
    match dict.get(key) {
        Some(Value::Bytes(b)) => Some(String::from_utf8_lossy(b).to_string()),
        _ => None,
    }
}

fn get_int(dict: &Dict, key: &[u8]) -> Option<i64> {
    match dict.get(key) {
        Some(Value::Int(i)) => Some(*i),
        _ => None,
    }
}

/// Payload of an encoded byte string such as `4:info`
fn string_payload(encoded: &[u8]) -> Option<&[u8]> {
    let colon = encoded.iter().position(|&b| b == b':')?;
    Some(&encoded[colon + 1..])
}

/// Index just past the bencode value starting at `idx`
fn skip_value(data: &[u8], idx: usize) -> Result<usize> {
    let truncated = || TorrentError::parse_error("Unexpected end of bencode data");
    match data.get(idx).copied().ok_or_else(truncated)? {
        b'i' => {
            let end = data[idx..].iter().position(|&b| b == b'e').ok_or_else(truncated)?;
            Ok(idx + end + 1)
        }
        b'l' | b'd' => {
            let mut pos = idx + 1;
            while data.get(pos).copied().ok_or_else(truncated)? != b'e' {
                pos = skip_value(data, pos)?;
            }
            Ok(pos + 1)
        }
        b'0'..=b'9' => {
            let colon = data[idx..].iter().position(|&b| b == b':').ok_or_else(truncated)? + idx;
            let len: usize = std::str::from_utf8(&data[idx..colon])
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| TorrentError::parse_error("Invalid string length"))?;
            let end = colon + 1 + len;
            if end > data.len() {
                return Err(truncated().into());
            }
            Ok(end)
        }
        other => Err(TorrentError::parse_error_with_source(
            "Unknown bencode type",
            format!("byte 0x{:02x} at {}", other, idx),
        ).into()),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Encode a minimal single-file descriptor
    pub(crate) fn single_file_descriptor(total: u64, piece_length: u64) -> Vec<u8> {
        let piece_count = total.div_ceil(piece_length) as usize;
        let pieces = vec![0xabu8; piece_count * 20];
        let mut info = Vec::new();
        info.extend_from_slice(format!("d6:lengthi{}e4:name8:file.bin12:piece lengthi{}e6:pieces{}:", total, piece_length, pieces.len()).as_bytes());
        info.extend_from_slice(&pieces);
        info.push(b'e');

        let mut out = Vec::new();
        out.extend_from_slice(b"d8:announce31:udp://tracker.example.com:6969/");
        out.extend_from_slice(b"13:announce-listll31:udp://tracker.example.com:6969/el25:udp://other.example:1337/ee");
        out.extend_from_slice(b"4:info");
        out.extend_from_slice(&info);
        out.push(b'e');
        out
    }

    fn info_bytes(data: &[u8]) -> Vec<u8> {
        TorrentParser::find_info_span(data).unwrap().to_vec()
    }

    #[test]
    fn test_parse_single_file() {
        let data = single_file_descriptor(40_000, 16_384);
        let torrent = TorrentParser::parse_bytes(&data).unwrap();
        assert_eq!(torrent.name, "file.bin");
        assert_eq!(torrent.total_size(), 40_000);
        assert_eq!(torrent.piece_length, 16_384);
        assert_eq!(torrent.piece_count(), 3);
        assert_eq!(torrent.announce, "udp://tracker.example.com:6969/");
        assert_eq!(
            torrent.announce_list,
            vec![
                "udp://tracker.example.com:6969/".to_string(),
                "udp://other.example:1337/".to_string(),
            ]
        );
    }

    #[test]
    fn test_info_hash_over_raw_info_dict() {
        let data = single_file_descriptor(40_000, 16_384);
        let torrent = TorrentParser::parse_bytes(&data).unwrap();
        let raw = info_bytes(&data);
        assert_eq!(raw.first(), Some(&b'd'));
        assert_eq!(raw.last(), Some(&b'e'));
        assert_eq!(torrent.info_hash, TorrentInfo::generate_info_hash(&raw));
    }

    #[test]
    fn test_parse_multi_file() {
        let mut data = Vec::new();
        data.extend_from_slice(b"d8:announce20:udp://t.example:80/a4:infod5:filesl");
        data.extend_from_slice(b"d6:lengthi100e4:pathl1:a5:x.txteed6:lengthi50e4:pathl5:y.txteee");
        data.extend_from_slice(b"4:name3:dir12:piece lengthi64e6:pieces60:");
        data.extend_from_slice(&[1u8; 60]);
        data.extend_from_slice(b"ee");

        let torrent = TorrentParser::parse_bytes(&data).unwrap();
        assert!(torrent.is_multi_file());
        assert_eq!(torrent.total_size(), 150);
        assert_eq!(torrent.piece_count(), 3);
        let files = torrent.files.unwrap();
        assert_eq!(files[0].path, vec!["a".to_string(), "x.txt".to_string()]);
    }

    #[test]
    fn test_missing_announce_is_parse_error() {
        let data = b"d4:infod6:lengthi1e4:name1:a12:piece lengthi1e6:pieces0:ee";
        let err = TorrentParser::parse_bytes(data).unwrap_err();
        let typed = err.downcast_ref::<TorrentError>().unwrap();
        assert!(matches!(typed, TorrentError::ParseError { .. }));
    }

    #[test]
    fn test_piece_count_mismatch_rejected() {
        let mut data = Vec::new();
        data.extend_from_slice(b"d8:announce20:udp://t.example:80/a4:infod6:lengthi100e4:name1:a12:piece lengthi64e6:pieces20:");
        data.extend_from_slice(&[0u8; 20]);
        data.extend_from_slice(b"ee");
        let err = TorrentParser::parse_bytes(&data).unwrap_err();
        match err.downcast_ref::<TorrentError>() {
            Some(TorrentError::ValidationError { field, .. }) => assert_eq!(field.as_deref(), Some("pieces")),
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_zero_length_is_validation_error() {
        let mut data = Vec::new();
        data.extend_from_slice(b"d8:announce20:udp://t.example:80/a4:infod6:lengthi0e4:name1:a12:piece lengthi64e6:pieces0:ee");
        let err = TorrentParser::parse_bytes(&data).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TorrentError>(),
            Some(TorrentError::ValidationError { field: Some(f), .. }) if f == "length"
        ));
    }

    #[test]
    fn test_truncated_data_rejected() {
        let data = single_file_descriptor(40_000, 16_384);
        assert!(TorrentParser::parse_bytes(&data[..data.len() - 10]).is_err());
    }

    #[test]
    fn test_skip_value() {
        assert_eq!(skip_value(b"i42e", 0).unwrap(), 4);
        assert_eq!(skip_value(b"4:test", 0).unwrap(), 6);
        assert_eq!(skip_value(b"l4:testi42ee", 0).unwrap(), 12);
        assert_eq!(skip_value(b"d4:testi42ee", 0).unwrap(), 12);
        assert!(skip_value(b"l4:test", 0).is_err());
        assert!(skip_value(b"x", 0).is_err());
    }
}
