//! Payload sub-formats carried inside CTP frames: block requests and
//! responses, peer lists, crinfo requests, and new-crinfo notifications.
//! All of them are ASCII except the raw block bytes.

use std::net::SocketAddr;
use std::str::FromStr;

use crate::digest::Digest;
use crate::frame::FrameError;
use crate::id::PeerId;

/// NOTIFICATION payload announcing that the cluster manifest changed.
pub const MANIFEST_UPDATED: &[u8] = b"manifest updated";

/// Status codes inside a BLOCK_RESPONSE payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    /// The peer has the block; its bytes follow.
    Have,
    /// The peer does not have the block.
    NotHave,
    /// The block index is out of range for the file.
    BadIndex,
}

impl BlockStatus {
    fn code(self) -> u8 {
        match self {
            BlockStatus::Have => b'0',
            BlockStatus::NotHave => b'1',
            BlockStatus::BadIndex => b'2',
        }
    }

    fn from_code(c: u8) -> Result<Self, FrameError> {
        match c {
            b'0' => Ok(BlockStatus::Have),
            b'1' => Ok(BlockStatus::NotHave),
            b'2' => Ok(BlockStatus::BadIndex),
            _ => Err(FrameError::MalformedFrame("bad block status")),
        }
    }
}

/// `{filehash}-{blockid}`
pub fn encode_block_request(hash: &Digest, block_id: u32) -> Vec<u8> {
    format!("{}-{}", hash.to_hex(), block_id).into_bytes()
}

pub fn parse_block_request(payload: &[u8]) -> Result<(Digest, u32), FrameError> {
    let text =
        std::str::from_utf8(payload).map_err(|_| FrameError::MalformedFrame("not ascii"))?;
    let (hash, id) = text
        .split_once('-')
        .ok_or(FrameError::MalformedFrame("missing block id"))?;
    let hash = Digest::from_str(hash).map_err(|_| FrameError::MalformedFrame("bad file hash"))?;
    let id = id
        .parse::<u32>()
        .map_err(|_| FrameError::MalformedFrame("bad block id"))?;
    Ok((hash, id))
}

/// `{filehash}-{blockid}-{status}\r\n\r\n{bytes}`
pub fn encode_block_response(
    hash: &Digest,
    block_id: u32,
    status: BlockStatus,
    bytes: &[u8],
) -> Vec<u8> {
    let mut out = format!("{}-{}-", hash.to_hex(), block_id).into_bytes();
    out.push(status.code());
    out.extend_from_slice(b"\r\n\r\n");
    out.extend_from_slice(bytes);
    out
}

pub fn parse_block_response(payload: &[u8]) -> Result<(Digest, u32, BlockStatus, &[u8]), FrameError> {
    let sep = find_subslice(payload, b"\r\n\r\n")
        .ok_or(FrameError::MalformedFrame("missing block separator"))?;
    let head = std::str::from_utf8(&payload[..sep])
        .map_err(|_| FrameError::MalformedFrame("not ascii"))?;
    let bytes = &payload[sep + 4..];
    let mut fields = head.splitn(3, '-');
    let hash = fields
        .next()
        .and_then(|s| Digest::from_str(s).ok())
        .ok_or(FrameError::MalformedFrame("bad file hash"))?;
    let id = fields
        .next()
        .and_then(|s| s.parse::<u32>().ok())
        .ok_or(FrameError::MalformedFrame("bad block id"))?;
    let status = fields
        .next()
        .filter(|s| s.len() == 1)
        .map(|s| BlockStatus::from_code(s.as_bytes()[0]))
        .ok_or(FrameError::MalformedFrame("missing block status"))??;
    Ok((hash, id, status, bytes))
}

/// One `{peer_id} {ip} {port}` line per peer, `\r\n`-separated.
pub fn encode_peer_list(peers: &[(PeerId, SocketAddr)]) -> Vec<u8> {
    peers
        .iter()
        .map(|(id, addr)| format!("{} {} {}", id.to_hex(), addr.ip(), addr.port()))
        .collect::<Vec<_>>()
        .join("\r\n")
        .into_bytes()
}

pub fn parse_peer_list(payload: &[u8]) -> Result<Vec<(PeerId, SocketAddr)>, FrameError> {
    let text =
        std::str::from_utf8(payload).map_err(|_| FrameError::MalformedFrame("not ascii"))?;
    let mut out = Vec::new();
    for line in text.split("\r\n") {
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split(' ');
        let id = fields
            .next()
            .and_then(|s| PeerId::from_str(s).ok())
            .ok_or(FrameError::MalformedFrame("bad peer id"))?;
        let ip = fields
            .next()
            .and_then(|s| s.parse::<std::net::IpAddr>().ok())
            .ok_or(FrameError::MalformedFrame("bad peer ip"))?;
        let port = fields
            .next()
            .and_then(|s| s.parse::<u16>().ok())
            .ok_or(FrameError::MalformedFrame("bad peer port"))?;
        if fields.next().is_some() {
            return Err(FrameError::MalformedFrame("trailing peer fields"));
        }
        out.push((id, SocketAddr::new(ip, port)));
    }
    Ok(out)
}

/// `filename: {name}`
pub fn encode_crinfo_request(filename: &str) -> Vec<u8> {
    format!("filename: {filename}").into_bytes()
}

pub fn parse_crinfo_request(payload: &[u8]) -> Result<&str, FrameError> {
    let text =
        std::str::from_utf8(payload).map_err(|_| FrameError::MalformedFrame("not ascii"))?;
    let name = text
        .strip_prefix("filename: ")
        .ok_or(FrameError::MalformedFrame("missing filename prefix"))?;
    if name.is_empty() {
        return Err(FrameError::MalformedFrame("empty filename"));
    }
    Ok(name)
}

/// `{filename}\r\n\r\n{crinfo bytes}`
pub fn encode_new_crinfo(filename: &str, crinfo: &[u8]) -> Vec<u8> {
    let mut out = filename.as_bytes().to_vec();
    out.extend_from_slice(b"\r\n\r\n");
    out.extend_from_slice(crinfo);
    out
}

pub fn parse_new_crinfo(payload: &[u8]) -> Result<(&str, &[u8]), FrameError> {
    let sep = find_subslice(payload, b"\r\n\r\n")
        .ok_or(FrameError::MalformedFrame("missing crinfo separator"))?;
    let name = std::str::from_utf8(&payload[..sep])
        .map_err(|_| FrameError::MalformedFrame("not ascii"))?;
    if name.is_empty() {
        return Err(FrameError::MalformedFrame("empty filename"));
    }
    Ok((name, &payload[sep + 4..]))
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|w| w == needle)
}
