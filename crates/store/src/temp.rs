//! The `.crtemp` partial-download container.
//!
//! ```text
//! CRTEMP {block_count}\r\n
//! {block_pointers}\r\n\r\n
//! {packed block data}
//! ```
//!
//! `block_pointers` is `block_count` signed 32-bit little-endian integers.
//! Pointer `i` is the byte offset of block `i` within the packed data region,
//! or `-1` if the block is not yet present. Blocks land in the data region in
//! arrival order; the pointer table makes out-of-order receipt safe.

use crate::StoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TempFile {
    pointers: Vec<i32>,
    data: Vec<u8>,
}

impl TempFile {
    /// Fresh container with every pointer unset.
    pub fn new(block_count: u32) -> Self {
        Self {
            pointers: vec![-1; block_count as usize],
            data: Vec::new(),
        }
    }

    pub fn block_count(&self) -> u32 {
        self.pointers.len() as u32
    }

    pub fn has_block(&self, block_id: u32) -> bool {
        self.pointers
            .get(block_id as usize)
            .is_some_and(|&p| p >= 0)
    }

    pub fn missing_blocks(&self) -> Vec<u32> {
        self.pointers
            .iter()
            .enumerate()
            .filter(|(_, &p)| p < 0)
            .map(|(i, _)| i as u32)
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.pointers.iter().all(|&p| p >= 0)
    }

    /// Bytes of block `block_id`, if present. The caller supplies the block's
    /// length since the container does not know the final short-block size.
    pub fn block(&self, block_id: u32, len: usize) -> Option<&[u8]> {
        let ptr = *self.pointers.get(block_id as usize)?;
        if ptr < 0 {
            return None;
        }
        self.data.get(ptr as usize..ptr as usize + len)
    }

    /// Append `bytes` as block `block_id`, recording its offset. The caller
    /// has already validated the length and checked for duplicates.
    pub fn set_block(&mut self, block_id: u32, bytes: &[u8]) {
        debug_assert!(!self.has_block(block_id));
        self.pointers[block_id as usize] = self.data.len() as i32;
        self.data.extend_from_slice(bytes);
    }

    /// Drop every block for a from-scratch re-download.
    pub fn clear(&mut self) {
        self.pointers.fill(-1);
        self.data.clear();
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = format!("CRTEMP {}\r\n", self.block_count()).into_bytes();
        for p in &self.pointers {
            out.extend_from_slice(&p.to_le_bytes());
        }
        out.extend_from_slice(b"\r\n\r\n");
        out.extend_from_slice(&self.data);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let header_end = bytes
            .windows(2)
            .position(|w| w == b"\r\n")
            .ok_or(StoreError::MalformedTemp("missing header line"))?;
        let header = std::str::from_utf8(&bytes[..header_end])
            .map_err(|_| StoreError::MalformedTemp("not ascii"))?;
        let count = header
            .strip_prefix("CRTEMP ")
            .and_then(|s| s.parse::<u32>().ok())
            .ok_or(StoreError::MalformedTemp("bad header"))?;

        let table_start = header_end + 2;
        let table_len = count as usize * 4;
        let sep_start = table_start + table_len;
        if bytes.len() < sep_start + 4 {
            return Err(StoreError::MalformedTemp("truncated pointer table"));
        }
        if &bytes[sep_start..sep_start + 4] != b"\r\n\r\n" {
            return Err(StoreError::MalformedTemp("missing separator"));
        }
        let data = bytes[sep_start + 4..].to_vec();

        let mut pointers = Vec::with_capacity(count as usize);
        for i in 0..count as usize {
            let at = table_start + i * 4;
            let ptr = i32::from_le_bytes([
                bytes[at],
                bytes[at + 1],
                bytes[at + 2],
                bytes[at + 3],
            ]);
            if ptr < -1 || (ptr >= 0 && ptr as usize > data.len()) {
                return Err(StoreError::MalformedTemp("pointer out of range"));
            }
            pointers.push(ptr);
        }
        Ok(Self { pointers, data })
    }
}
