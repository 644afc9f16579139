//! Header chain, persistent header/body stores and block verification.

pub mod block_store;
pub mod chain;
pub mod header_store;
pub mod height_store;
pub mod index;
pub mod verify;

pub use block_store::{BlockStore, BlockStoreError, StoredBlock};
pub use chain::{Chain, ChainNode};
pub use header_store::{BlockLocation, ChainStore, ChainStoreError};
pub use height_store::{BlockPointer, FixedRecord, HeightStore, HeightStoreError};
pub use index::ChainIndex;
pub use verify::{VerifyPool, VerifyRequest, VerifyResponse};
