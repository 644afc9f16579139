//! Dense, height-keyed array of fixed-size records mirrored in memory.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub trait FixedRecord: Sized + Clone {
    const SIZE: usize;

    fn encode_into(&self, out: &mut [u8]);

    fn decode(bytes: &[u8]) -> Option<Self>;
}

/// Logical byte offset into the chunked block files, stored in 48 bits.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct BlockPointer(pub u64);

impl BlockPointer {
    pub const MAX: u64 = (1 << 48) - 1;
}

impl FixedRecord for BlockPointer {
    const SIZE: usize = 6;

    fn encode_into(&self, out: &mut [u8]) {
        out.copy_from_slice(&self.0.to_le_bytes()[..Self::SIZE]);
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::SIZE {
            return None;
        }
        let mut raw = [0u8; 8];
        raw[..Self::SIZE].copy_from_slice(bytes);
        Some(Self(u64::from_le_bytes(raw)))
    }
}

#[derive(Debug)]
pub enum HeightStoreError {
    Io(std::io::Error),
    Corrupted(String),
    InvalidHeight(i32),
}

impl std::fmt::Display for HeightStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HeightStoreError::Io(err) => write!(f, "{err}"),
            HeightStoreError::Corrupted(message) => write!(f, "height store corrupted: {message}"),
            HeightStoreError::InvalidHeight(height) => {
                write!(f, "height {height} is outside the stored range")
            }
        }
    }
}

impl std::error::Error for HeightStoreError {}

impl From<std::io::Error> for HeightStoreError {
    fn from(err: std::io::Error) -> Self {
        HeightStoreError::Io(err)
    }
}

pub struct HeightStore<T> {
    path: PathBuf,
    file: File,
    items: Vec<T>,
}

impl<T: FixedRecord> HeightStore<T> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, HeightStoreError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let mut store = Self {
            path,
            file,
            items: Vec::new(),
        };
        store.reload()?;
        Ok(store)
    }

    /// Re-reads the whole file into memory.
    pub fn reload(&mut self) -> Result<(), HeightStoreError> {
        let mut bytes = Vec::new();
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_to_end(&mut bytes)?;
        if bytes.len() % T::SIZE != 0 {
            return Err(HeightStoreError::Corrupted(format!(
                "{} is {} bytes, not a multiple of {}",
                self.path.display(),
                bytes.len(),
                T::SIZE
            )));
        }
        let mut items = Vec::with_capacity(bytes.len() / T::SIZE);
        for (height, chunk) in bytes.chunks_exact(T::SIZE).enumerate() {
            let item = T::decode(chunk).ok_or_else(|| {
                HeightStoreError::Corrupted(format!("undecodable record at height {height}"))
            })?;
            items.push(item);
        }
        self.items = items;
        Ok(())
    }

    pub fn append(&mut self, items: &[T]) -> Result<(), HeightStoreError> {
        if items.is_empty() {
            return Ok(());
        }
        let mut buffer = vec![0u8; items.len() * T::SIZE];
        for (item, out) in items.iter().zip(buffer.chunks_exact_mut(T::SIZE)) {
            item.encode_into(out);
        }
        let offset = (self.items.len() * T::SIZE) as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&buffer)?;
        self.file.sync_data()?;
        self.items.extend_from_slice(items);
        Ok(())
    }

    /// Keeps heights `0..=height`; `-1` empties the store.
    pub fn truncate(&mut self, height: i32) -> Result<(), HeightStoreError> {
        let keep = usize::try_from(height.saturating_add(1))
            .map_err(|_| HeightStoreError::InvalidHeight(height))?;
        if keep > self.items.len() {
            return Err(HeightStoreError::InvalidHeight(height));
        }
        self.file.set_len((keep * T::SIZE) as u64)?;
        self.file.sync_data()?;
        self.items.truncate(keep);
        Ok(())
    }

    pub fn at(&self, height: i32) -> Option<&T> {
        usize::try_from(height).ok().and_then(|h| self.items.get(h))
    }

    pub fn tip(&self) -> Option<&T> {
        self.items.last()
    }

    /// Highest stored height, `-1` when empty.
    pub fn height(&self) -> i32 {
        self.items.len() as i32 - 1
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }
}
