pub mod builder;
pub mod crypt;
pub mod crypto;
pub mod fst;
pub mod keys;
pub mod reader;
pub mod structs;
pub mod window;

pub use crypt::{CryptPartReader, CryptPartWriter};
pub use fst::{Fst, FstNode, FstToBytes};
pub use reader::{WiiIsoReader, WiiPartition};
pub use window::IOWindow;

/// Raw block size on disc, hash header included.
pub const BLOCK_SIZE: u64 = 0x8000;
/// Size of the hash header at the start of every block.
pub const BLOCK_DATA_OFFSET: u64 = 0x400;
/// Usable plaintext per block.
pub const BLOCK_DATA_SIZE: u64 = BLOCK_SIZE - BLOCK_DATA_OFFSET;
pub const BLOCKS_PER_GROUP: u64 = 64;
/// Ciphertext group size, the encryption and hashing unit (2 MiB).
pub const GROUP_SIZE: u64 = BLOCK_SIZE * BLOCKS_PER_GROUP;
/// Plaintext held by one group.
pub const GROUP_DATA_SIZE: u64 = BLOCK_DATA_SIZE * BLOCKS_PER_GROUP;
/// Fixed size of the per-partition H3 table.
pub const H3_TABLE_SIZE: u64 = 0x18000;
