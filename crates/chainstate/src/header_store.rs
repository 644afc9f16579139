//! Append-only header log (`headers.dat`) with one fixed-size record per height.
//!
//! Each record is the 80-byte header followed by a 7-byte block location
//! marker: `enabled: u8`, `chunk_id: u16 LE`, `offset: u32 LE`. The file
//! length is always `(height + 1) * HEADER_RECORD_SIZE`.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use btcnode_consensus::constants::HEADER_SIZE;
use btcnode_consensus::ChainParams;
use btcnode_pow::verify_proof_of_work;
use btcnode_primitives::block::BlockHeader;

use crate::chain::{Chain, ChainNode};

pub const HEADERS_FILE: &str = "headers.dat";
pub const MARKER_SIZE: usize = 7;
pub const HEADER_RECORD_SIZE: usize = HEADER_SIZE + MARKER_SIZE;

/// Where a block body lives inside the chunked block files.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockLocation {
    pub chunk_id: u16,
    pub offset: u32,
}

fn encode_marker(location: Option<BlockLocation>) -> [u8; MARKER_SIZE] {
    let mut out = [0u8; MARKER_SIZE];
    if let Some(location) = location {
        out[0] = 1;
        out[1..3].copy_from_slice(&location.chunk_id.to_le_bytes());
        out[3..7].copy_from_slice(&location.offset.to_le_bytes());
    }
    out
}

fn decode_marker(bytes: &[u8; MARKER_SIZE]) -> Option<Option<BlockLocation>> {
    match bytes[0] {
        0 => Some(None),
        1 => Some(Some(BlockLocation {
            chunk_id: u16::from_le_bytes([bytes[1], bytes[2]]),
            offset: u32::from_le_bytes([bytes[3], bytes[4], bytes[5], bytes[6]]),
        })),
        _ => None,
    }
}

#[derive(Debug)]
pub enum ChainStoreError {
    Io(std::io::Error),
    Corrupted { height: i32, reason: String },
    InvalidHeight(i32),
    NotEmpty,
}

impl std::fmt::Display for ChainStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainStoreError::Io(err) => write!(f, "{err}"),
            ChainStoreError::Corrupted { height, reason } => {
                write!(f, "header store corrupted at height {height}: {reason}")
            }
            ChainStoreError::InvalidHeight(height) => {
                write!(f, "height {height} is outside the header store")
            }
            ChainStoreError::NotEmpty => write!(f, "header store already initialized"),
        }
    }
}

impl std::error::Error for ChainStoreError {}

impl From<std::io::Error> for ChainStoreError {
    fn from(err: std::io::Error) -> Self {
        ChainStoreError::Io(err)
    }
}

pub struct ChainStore {
    path: PathBuf,
    file: File,
    records: u64,
}

impl ChainStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ChainStoreError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let len = file.metadata()?.len();
        let stride = HEADER_RECORD_SIZE as u64;
        if len % stride != 0 {
            return Err(ChainStoreError::Corrupted {
                height: (len / stride) as i32,
                reason: format!("{} has a partial trailing record", path.display()),
            });
        }
        Ok(Self {
            path,
            file,
            records: len / stride,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_empty(&self) -> bool {
        self.records == 0
    }

    /// Highest stored height, `-1` when nothing has been written.
    pub fn height(&self) -> i32 {
        self.records as i32 - 1
    }

    /// Writes the genesis record into an empty store.
    pub fn init(&mut self, genesis: &ChainNode) -> Result<(), ChainStoreError> {
        if !self.is_empty() {
            return Err(ChainStoreError::NotEmpty);
        }
        self.append(std::slice::from_ref(genesis))
    }

    /// Replays stored records on top of `chain`, which must hold only genesis.
    /// Every record past genesis is re-hashed and checked for linkage and
    /// proof of work; any mismatch means the file cannot be trusted.
    pub fn load(&mut self, chain: &mut Chain, params: &ChainParams) -> Result<(), ChainStoreError> {
        if self.records == 0 {
            return Ok(());
        }
        self.file.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::with_capacity(HEADER_RECORD_SIZE * 4096, &self.file);
        let mut record = [0u8; HEADER_RECORD_SIZE];

        reader.read_exact(&mut record)?;
        if record[..HEADER_SIZE] != params.genesis_header[..] {
            return Err(ChainStoreError::Corrupted {
                height: 0,
                reason: "genesis record does not match network parameters".to_string(),
            });
        }

        for height in 1..self.records as i32 {
            reader.read_exact(&mut record)?;
            let header = BlockHeader::consensus_decode(&record[..HEADER_SIZE]).map_err(|err| {
                ChainStoreError::Corrupted {
                    height,
                    reason: err.to_string(),
                }
            })?;
            let mut marker = [0u8; MARKER_SIZE];
            marker.copy_from_slice(&record[HEADER_SIZE..]);
            if decode_marker(&marker).is_none() {
                return Err(ChainStoreError::Corrupted {
                    height,
                    reason: "invalid block location marker".to_string(),
                });
            }
            let hash = header.hash();
            if header.prev_block != chain.tip().hash {
                return Err(ChainStoreError::Corrupted {
                    height,
                    reason: "header does not link to its predecessor".to_string(),
                });
            }
            if !verify_proof_of_work(&header, &hash) {
                return Err(ChainStoreError::Corrupted {
                    height,
                    reason: "header fails proof of work".to_string(),
                });
            }
            let node = ChainNode::extend(chain.tip(), header, hash);
            chain.push(node);
        }
        Ok(())
    }

    pub fn append(&mut self, nodes: &[ChainNode]) -> Result<(), ChainStoreError> {
        if nodes.is_empty() {
            return Ok(());
        }
        let mut buffer = Vec::with_capacity(nodes.len() * HEADER_RECORD_SIZE);
        for node in nodes {
            buffer.extend_from_slice(&node.header.consensus_encode());
            buffer.extend_from_slice(&encode_marker(None));
        }
        self.file
            .seek(SeekFrom::Start(self.records * HEADER_RECORD_SIZE as u64))?;
        self.file.write_all(&buffer)?;
        self.file.sync_data()?;
        self.records += nodes.len() as u64;
        Ok(())
    }

    /// Keeps heights `0..=height`.
    pub fn truncate(&mut self, height: i32) -> Result<(), ChainStoreError> {
        let keep = u64::try_from(height.saturating_add(1))
            .map_err(|_| ChainStoreError::InvalidHeight(height))?;
        if keep > self.records {
            return Err(ChainStoreError::InvalidHeight(height));
        }
        self.file.set_len(keep * HEADER_RECORD_SIZE as u64)?;
        self.file.sync_data()?;
        self.records = keep;
        Ok(())
    }

    pub fn set_block_location(
        &mut self,
        height: i32,
        location: Option<BlockLocation>,
    ) -> Result<(), ChainStoreError> {
        let offset = self.marker_offset(height)?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&encode_marker(location))?;
        self.file.sync_data()?;
        Ok(())
    }

    pub fn block_location(&mut self, height: i32) -> Result<Option<BlockLocation>, ChainStoreError> {
        let offset = self.marker_offset(height)?;
        let mut marker = [0u8; MARKER_SIZE];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut marker)?;
        decode_marker(&marker).ok_or_else(|| ChainStoreError::Corrupted {
            height,
            reason: "invalid block location marker".to_string(),
        })
    }

    /// Every record's block location marker, by height.
    pub fn block_locations(&mut self) -> Result<Vec<Option<BlockLocation>>, ChainStoreError> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::with_capacity(HEADER_RECORD_SIZE * 4096, &self.file);
        let mut record = [0u8; HEADER_RECORD_SIZE];
        let mut marker = [0u8; MARKER_SIZE];
        let mut out = Vec::with_capacity(self.records as usize);
        for height in 0..self.records as i32 {
            reader.read_exact(&mut record)?;
            marker.copy_from_slice(&record[HEADER_SIZE..]);
            let location = decode_marker(&marker).ok_or_else(|| ChainStoreError::Corrupted {
                height,
                reason: "invalid block location marker".to_string(),
            })?;
            out.push(location);
        }
        Ok(out)
    }

    fn marker_offset(&self, height: i32) -> Result<u64, ChainStoreError> {
        match u64::try_from(height) {
            Ok(h) if h < self.records => {
                Ok(h * HEADER_RECORD_SIZE as u64 + HEADER_SIZE as u64)
            }
            _ => Err(ChainStoreError::InvalidHeight(height)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_encoding() {
        let location = BlockLocation {
            chunk_id: 0x0102,
            offset: 0x0a0b_0c0d,
        };
        let bytes = encode_marker(Some(location));
        assert_eq!(bytes, [1, 0x02, 0x01, 0x0d, 0x0c, 0x0b, 0x0a]);
        assert_eq!(decode_marker(&bytes), Some(Some(location)));
        assert_eq!(decode_marker(&encode_marker(None)), Some(None));
        assert_eq!(decode_marker(&[2, 0, 0, 0, 0, 0, 0]), None);
    }
}
