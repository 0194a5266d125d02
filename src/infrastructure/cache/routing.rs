//! Weighted server selection for keys

use sha2::{Digest, Sha256};

use crate::domain::cache::ServerSpec;

/// Picks servers for keys by hashing them onto the weighted server list.
///
/// The same key always lands on the same server for a given list, across
/// processes, because the hash is SHA-256 rather than the std hasher.
#[derive(Debug, Clone, Copy)]
pub struct ServerRouter;

impl ServerRouter {
    /// Stable 64-bit hash of a routing key
    pub fn hash_key(route_key: &str) -> u64 {
        let digest = Sha256::digest(route_key.as_bytes());
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(head)
    }

    /// Hex digest of a routing key, for log fields
    pub fn fingerprint(route_key: &str) -> String {
        hex::encode(&Sha256::digest(route_key.as_bytes())[..6])
    }

    /// Index of the server for `route_key`, `None` when the list is empty.
    ///
    /// A weight of zero counts as one.
    pub fn select(servers: &[ServerSpec], route_key: &str) -> Option<usize> {
        if servers.is_empty() {
            return None;
        }

        let total: u64 = servers.iter().map(|s| u64::from(s.weight.max(1))).sum();
        let mut point = Self::hash_key(route_key) % total;

        for (index, server) in servers.iter().enumerate() {
            let weight = u64::from(server.weight.max(1));
            if point < weight {
                return Some(index);
            }
            point -= weight;
        }

        Some(servers.len() - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> Vec<ServerSpec> {
        vec![
            ServerSpec::new("a", 11211),
            ServerSpec::new("b", 11211),
            ServerSpec::new("c", 11211),
        ]
    }

    #[test]
    fn test_empty_pool() {
        assert_eq!(ServerRouter::select(&[], "key"), None);
    }

    #[test]
    fn test_selection_is_deterministic() {
        let servers = pool();
        let first = ServerRouter::select(&servers, "user:42");

        for _ in 0..100 {
            assert_eq!(ServerRouter::select(&servers, "user:42"), first);
        }
    }

    #[test]
    fn test_single_server_takes_everything() {
        let servers = vec![ServerSpec::new("only", 6379).with_weight(0)];

        for i in 0..50 {
            assert_eq!(ServerRouter::select(&servers, &format!("k{}", i)), Some(0));
        }
    }

    #[test]
    fn test_weights_shift_distribution() {
        let servers = vec![
            ServerSpec::new("light", 1).with_weight(1),
            ServerSpec::new("heavy", 2).with_weight(9),
        ];

        let heavy = (0..1000)
            .filter(|i| ServerRouter::select(&servers, &format!("key-{}", i)) == Some(1))
            .count();

        assert!(heavy > 800, "heavy server got {} of 1000 keys", heavy);
    }

    #[test]
    fn test_distribution_uses_every_server() {
        let servers = pool();
        let mut buckets = [0u32; 3];

        for i in 0..900 {
            let index = ServerRouter::select(&servers, &format!("key-{}", i)).unwrap();
            buckets[index] += 1;
        }

        for count in buckets {
            assert!(count > 200, "bucket has too few keys: {}", count);
        }
    }

    #[test]
    fn test_fingerprint_is_short_hex() {
        let fingerprint = ServerRouter::fingerprint("key");
        assert_eq!(fingerprint.len(), 12);
        assert!(fingerprint.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
