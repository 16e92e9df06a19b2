//! Common utilities and types shared across ringkv

pub mod address;
pub mod config;
pub mod error;
pub mod hash;
pub mod utils;

pub use address::PartitionServerAddress;
pub use config::{ClientConfig, Config, StoreConfig};
pub use error::{Error, Result};
pub use hash::{affinity_hash, host_shuffle_seed, key_hash, partition_for_key};
pub use utils::{
    decode_segment, encode_segment, format_timestamp_millis, join_flags, key_to_hex, split_flags,
    timestamp_now_millis,
};
