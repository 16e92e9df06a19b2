//! Hashing utilities for ringkv
//!
//! - BLAKE3 for key hashing (partition routing, key-affine host selection)
//! - Host shuffle seeds so pools for the same partition agree on host order

/// Hash a key to a 64-bit value
pub fn key_hash(key: &[u8]) -> u64 {
    let hash = blake3::hash(key);
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[0..8]);
    u64::from_le_bytes(bytes)
}

/// Hash used to pick a key's preferred host inside a partition's pool.
///
/// Taken from a different slice of the digest than [`key_hash`], otherwise
/// every key of a partition would share the same residue.
pub fn affinity_hash(key: &[u8]) -> u64 {
    let hash = blake3::hash(key);
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[8..16]);
    u64::from_le_bytes(bytes)
}

/// Compute the partition a key belongs to
pub fn partition_for_key(key: &[u8], num_partitions: u32) -> u32 {
    if num_partitions == 0 {
        return 0;
    }
    (key_hash(key) % num_partitions as u64) as u32
}

/// Deterministic host shuffle seed for a (domain, partition) pair.
///
/// `(domain_id + 1) * (partition_id + 1)` in wrapping 32-bit arithmetic, so
/// independently started clients build identical host orders for a partition.
pub fn host_shuffle_seed(domain_id: u32, partition_id: u32) -> u32 {
    domain_id
        .wrapping_add(1)
        .wrapping_mul(partition_id.wrapping_add(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_hash_deterministic() {
        assert_eq!(key_hash(b"key"), key_hash(b"key"));
        assert_ne!(key_hash(b"key1"), key_hash(b"key2"));
    }

    #[test]
    fn test_affinity_hash_independent_of_partition() {
        // Keys of one partition must still spread over hosts
        let residues: std::collections::HashSet<u64> = (0..200)
            .map(|i| format!("key_{}", i))
            .filter(|k| partition_for_key(k.as_bytes(), 4) == 0)
            .map(|k| affinity_hash(k.as_bytes()) % 4)
            .collect();
        assert!(residues.len() > 1);
    }

    #[test]
    fn test_partition_for_key() {
        for i in 0..100 {
            let key = format!("key_{}", i);
            assert!(partition_for_key(key.as_bytes(), 8) < 8);
        }
        assert_eq!(partition_for_key(b"anything", 0), 0);
    }

    #[test]
    fn test_host_shuffle_seed() {
        assert_eq!(host_shuffle_seed(0, 0), 1);
        assert_eq!(host_shuffle_seed(1, 2), 6);
        assert_eq!(host_shuffle_seed(4, 9), 50);
        // Matches 32-bit two's complement overflow
        assert_eq!(
            host_shuffle_seed(65_535, 65_536),
            (65_536i32.wrapping_mul(65_537)) as u32
        );
    }

    #[test]
    fn test_seeds_distinct_per_partition() {
        let seeds: std::collections::HashSet<u32> =
            (0..16).map(|p| host_shuffle_seed(3, p)).collect();
        assert_eq!(seeds.len(), 16);
    }
}
