//! Chunked block body storage.
//!
//! Bodies are concatenated into `blocks/chunk<N>.dat` files addressed by a
//! logical byte pointer: chunk `pointer / max_file_size`, offset
//! `pointer % max_file_size`. Records straddle chunk boundaries, so every
//! chunk but the last is exactly `max_file_size` bytes. The height index
//! (`block_pointer_idx.dat`) holds the logical end of each stored block.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use btcnode_consensus::constants::HEADER_SIZE;
use btcnode_primitives::block::{BlockDecodeError, RawBlock};
use btcnode_primitives::encoding::{DecodeError, Decoder, Encoder};

use crate::header_store::BlockLocation;
use crate::height_store::{BlockPointer, HeightStore, HeightStoreError};

pub const BLOCKS_DIR: &str = "blocks";
pub const BLOCK_INDEX_FILE: &str = "block_pointer_idx.dat";
pub const DEFAULT_MAX_CHUNK_SIZE: u64 = 128 * 1024 * 1024;

#[derive(Debug)]
pub enum BlockStoreError {
    Io(std::io::Error),
    Index(HeightStoreError),
    Decode(BlockDecodeError),
    Corrupted(String),
    ShortWrite { expected: usize, written: usize },
    CrossesChunk,
    OutOfRange,
    PointerOverflow,
    UnknownHeight(i32),
    InvalidChunkSize(u64),
}

impl std::fmt::Display for BlockStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockStoreError::Io(err) => write!(f, "{err}"),
            BlockStoreError::Index(err) => write!(f, "{err}"),
            BlockStoreError::Decode(err) => write!(f, "invalid block: {err}"),
            BlockStoreError::Corrupted(message) => write!(f, "block store corrupted: {message}"),
            BlockStoreError::ShortWrite { expected, written } => {
                write!(f, "short write: {written} of {expected} bytes")
            }
            BlockStoreError::CrossesChunk => write!(f, "update crosses a chunk boundary"),
            BlockStoreError::OutOfRange => write!(f, "range outside stored data"),
            BlockStoreError::PointerOverflow => write!(f, "block pointer exceeds 48 bits"),
            BlockStoreError::UnknownHeight(height) => write!(f, "no block stored at height {height}"),
            BlockStoreError::InvalidChunkSize(size) => write!(f, "invalid max chunk size {size}"),
        }
    }
}

impl std::error::Error for BlockStoreError {}

impl From<std::io::Error> for BlockStoreError {
    fn from(err: std::io::Error) -> Self {
        BlockStoreError::Io(err)
    }
}

impl From<HeightStoreError> for BlockStoreError {
    fn from(err: HeightStoreError) -> Self {
        BlockStoreError::Index(err)
    }
}

impl From<BlockDecodeError> for BlockStoreError {
    fn from(err: BlockDecodeError) -> Self {
        BlockStoreError::Decode(err)
    }
}

impl From<DecodeError> for BlockStoreError {
    fn from(err: DecodeError) -> Self {
        BlockStoreError::Corrupted(format!("stored record: {err}"))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StoredBlock {
    pub height: i32,
    pub pointer: u64,
    pub len: u64,
    pub location: BlockLocation,
}

pub struct BlockStore {
    dir: PathBuf,
    max_file_size: u64,
    index: HeightStore<BlockPointer>,
    end: u64,
}

impl BlockStore {
    pub fn open(data_dir: impl AsRef<Path>, max_file_size: u64) -> Result<Self, BlockStoreError> {
        // Offsets are stored as u32 in header markers.
        if max_file_size == 0 || max_file_size > u64::from(u32::MAX) + 1 {
            return Err(BlockStoreError::InvalidChunkSize(max_file_size));
        }
        let data_dir = data_dir.as_ref();
        let dir = data_dir.join(BLOCKS_DIR);
        std::fs::create_dir_all(&dir)?;
        let index = HeightStore::<BlockPointer>::open(data_dir.join(BLOCK_INDEX_FILE))?;

        let mut previous = 0u64;
        for (height, pointer) in index.iter().enumerate() {
            if pointer.0 < previous {
                return Err(BlockStoreError::Corrupted(format!(
                    "index pointer decreases at height {height}"
                )));
            }
            previous = pointer.0;
        }

        let mut store = Self {
            dir,
            max_file_size,
            index,
            end: 0,
        };
        let physical_end = store.scan_chunks()?;
        let expected = store.index.tip().map_or(0, |pointer| pointer.0);
        if physical_end < expected {
            return Err(BlockStoreError::Corrupted(format!(
                "chunk files hold {physical_end} bytes but the index expects {expected}"
            )));
        }
        if physical_end > expected {
            btcnode_log::log_warn!(
                "Discarding {} unindexed bytes after block height {}",
                physical_end - expected,
                store.index.height()
            );
            store.cut_to(expected)?;
        }
        store.end = expected;
        Ok(store)
    }

    pub fn height(&self) -> i32 {
        self.index.height()
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    /// Logical pointer at which the next block will be written.
    pub fn end_pointer(&self) -> u64 {
        self.end
    }

    /// Splits the block into transactions, stores it at the next height and
    /// returns where it landed.
    pub fn append(&mut self, block: &[u8]) -> Result<StoredBlock, BlockStoreError> {
        let raw = RawBlock::split(block)?;
        let record = encode_record(&block[..HEADER_SIZE], &raw.transactions);

        let pointer = self.end;
        let new_end = pointer + record.len() as u64;
        if new_end > BlockPointer::MAX {
            return Err(BlockStoreError::PointerOverflow);
        }
        let location = self.location_of(pointer)?;

        self.write_at(pointer, &record)?;
        self.index.append(&[BlockPointer(new_end)])?;
        self.end = new_end;
        Ok(StoredBlock {
            height: self.index.height(),
            pointer,
            len: record.len() as u64,
            location,
        })
    }

    pub fn read(&self, pointer: u64, len: usize) -> Result<Vec<u8>, BlockStoreError> {
        let end = pointer
            .checked_add(len as u64)
            .ok_or(BlockStoreError::OutOfRange)?;
        if end > self.end {
            return Err(BlockStoreError::OutOfRange);
        }
        let mut out = vec![0u8; len];
        let mut filled = 0usize;
        while filled < len {
            let (chunk, offset) = self.locate(pointer + filled as u64);
            let take = ((self.max_file_size - offset) as usize).min(len - filled);
            let mut file = File::open(self.chunk_path(chunk))?;
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut out[filled..filled + take])?;
            filled += take;
        }
        Ok(out)
    }

    /// Internal record for a stored height.
    pub fn read_record(&self, height: i32) -> Result<Vec<u8>, BlockStoreError> {
        let (start, end) = self.bounds(height)?;
        self.read(start, (end - start) as usize)
    }

    /// Stored block re-assembled into its wire serialization.
    pub fn read_block(&self, height: i32) -> Result<Vec<u8>, BlockStoreError> {
        let record = self.read_record(height)?;
        decode_record(&record)
    }

    /// Overwrites bytes in place. The range must sit inside one existing chunk.
    pub fn update(&mut self, pointer: u64, data: &[u8]) -> Result<(), BlockStoreError> {
        let (chunk, offset) = self.locate(pointer);
        if offset + data.len() as u64 > self.max_file_size {
            return Err(BlockStoreError::CrossesChunk);
        }
        let path = self.chunk_path(chunk);
        let mut file = match OpenOptions::new().write(true).open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(BlockStoreError::OutOfRange)
            }
            Err(err) => return Err(err.into()),
        };
        if offset + data.len() as u64 > file.metadata()?.len() {
            return Err(BlockStoreError::OutOfRange);
        }
        file.seek(SeekFrom::Start(offset))?;
        write_checked(&mut file, data)?;
        file.sync_data()?;
        Ok(())
    }

    /// Keeps blocks `0..=height`; `-1` removes every block.
    pub fn truncate(&mut self, height: i32) -> Result<(), BlockStoreError> {
        if height < -1 || height > self.index.height() {
            return Err(BlockStoreError::UnknownHeight(height));
        }
        let cut = if height == -1 {
            0
        } else {
            self.index
                .at(height)
                .map(|pointer| pointer.0)
                .ok_or(BlockStoreError::UnknownHeight(height))?
        };
        self.cut_to(cut)?;
        self.index.truncate(height)?;
        self.end = cut;
        Ok(())
    }

    /// Chunk and offset where the block at `height` starts.
    pub fn location_at(&self, height: i32) -> Result<BlockLocation, BlockStoreError> {
        let (start, _) = self.bounds(height)?;
        self.location_of(start)
    }

    pub fn location_of(&self, pointer: u64) -> Result<BlockLocation, BlockStoreError> {
        let (chunk, offset) = self.locate(pointer);
        let chunk_id = u16::try_from(chunk).map_err(|_| BlockStoreError::PointerOverflow)?;
        let offset = u32::try_from(offset).map_err(|_| BlockStoreError::PointerOverflow)?;
        Ok(BlockLocation { chunk_id, offset })
    }

    fn bounds(&self, height: i32) -> Result<(u64, u64), BlockStoreError> {
        let end = self
            .index
            .at(height)
            .ok_or(BlockStoreError::UnknownHeight(height))?
            .0;
        let start = if height == 0 {
            0
        } else {
            self.index
                .at(height - 1)
                .ok_or(BlockStoreError::UnknownHeight(height))?
                .0
        };
        Ok((start, end))
    }

    fn locate(&self, pointer: u64) -> (u64, u64) {
        (pointer / self.max_file_size, pointer % self.max_file_size)
    }

    fn chunk_path(&self, chunk: u64) -> PathBuf {
        self.dir.join(format!("chunk{chunk}.dat"))
    }

    fn write_at(&self, pointer: u64, data: &[u8]) -> Result<(), BlockStoreError> {
        let mut written = 0usize;
        while written < data.len() {
            let (chunk, offset) = self.locate(pointer + written as u64);
            let take = ((self.max_file_size - offset) as usize).min(data.len() - written);
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(self.chunk_path(chunk))?;
            file.seek(SeekFrom::Start(offset))?;
            write_checked(&mut file, &data[written..written + take])?;
            file.flush()?;
            file.sync_data()?;
            written += take;
        }
        Ok(())
    }

    /// Logical length implied by the chunk files on disk.
    fn scan_chunks(&self) -> Result<u64, BlockStoreError> {
        let mut chunk = 0u64;
        let mut last_len = None;
        loop {
            let path = self.chunk_path(chunk);
            let len = match std::fs::metadata(&path) {
                Ok(metadata) => metadata.len(),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => break,
                Err(err) => return Err(err.into()),
            };
            if let Some(previous) = last_len {
                if previous != self.max_file_size {
                    return Err(BlockStoreError::Corrupted(format!(
                        "chunk{} is {previous} bytes, expected {}",
                        chunk - 1,
                        self.max_file_size
                    )));
                }
            }
            if len > self.max_file_size {
                return Err(BlockStoreError::Corrupted(format!(
                    "chunk{chunk} exceeds the maximum chunk size"
                )));
            }
            last_len = Some(len);
            chunk += 1;
        }
        Ok(match last_len {
            Some(len) => (chunk - 1) * self.max_file_size + len,
            None => 0,
        })
    }

    /// Drops every byte at or after `pointer`, deleting later chunk files.
    fn cut_to(&self, pointer: u64) -> Result<(), BlockStoreError> {
        let (chunk, offset) = self.locate(pointer);
        let path = self.chunk_path(chunk);
        if path.exists() {
            let file = OpenOptions::new().write(true).open(&path)?;
            file.set_len(offset)?;
            file.sync_data()?;
        }
        let mut next = chunk + 1;
        loop {
            let path = self.chunk_path(next);
            match std::fs::remove_file(&path) {
                Ok(()) => next += 1,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => break,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}

fn write_checked(file: &mut File, data: &[u8]) -> Result<(), BlockStoreError> {
    let written = file.write(data)?;
    if written != data.len() {
        return Err(BlockStoreError::ShortWrite {
            expected: data.len(),
            written,
        });
    }
    Ok(())
}

/// `header ‖ CompactSize(count) ‖ (CompactSize(len) ‖ tx)*`
fn encode_record(header: &[u8], transactions: &[&[u8]]) -> Vec<u8> {
    let body: usize = transactions.iter().map(|tx| tx.len() + 9).sum();
    let mut encoder = Encoder::with_capacity(HEADER_SIZE + 9 + body);
    encoder.write_bytes(header);
    encoder.write_varint(transactions.len() as u64);
    for tx in transactions {
        encoder.write_var_bytes(tx);
    }
    encoder.into_inner()
}

fn decode_record(record: &[u8]) -> Result<Vec<u8>, BlockStoreError> {
    let mut decoder = Decoder::new(record);
    let header = decoder.read_slice(HEADER_SIZE)?;
    let count = decoder.read_compact_size()?;
    let mut encoder = Encoder::with_capacity(record.len());
    encoder.write_bytes(header);
    encoder.write_varint(count as u64);
    for _ in 0..count {
        let len = decoder.read_compact_size()?;
        encoder.write_bytes(decoder.read_slice(len)?);
    }
    if !decoder.is_empty() {
        return Err(DecodeError::TrailingBytes.into());
    }
    Ok(encoder.into_inner())
}
