use super::crypto::random_bytes;
use crate::definitions::NodeId;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::time::{Duration, Instant};

pub const S0_HALF_NONCE_SIZE: usize = 8;

/// How long an issued nonce stays usable.
pub const NONCE_LIFETIME: Duration = Duration::from_secs(10);

/// A flood of Nonce Gets must not grow the table without bound.
pub const NONCE_TABLE_CAP: usize = 64;

/// One half of an S0 nonce pair: the 8 random bytes one side contributes.
/// The first byte doubles as the nonce id the peer echoes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct S0Nonce {
    bytes: [u8; S0_HALF_NONCE_SIZE],
}

impl S0Nonce {
    pub fn new(bytes: [u8; S0_HALF_NONCE_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        let bytes: [u8; S0_HALF_NONCE_SIZE] = slice.try_into().ok()?;
        Some(Self { bytes })
    }

    pub fn random() -> Self {
        Self {
            bytes: random_bytes(),
        }
    }

    pub fn bytes(&self) -> &[u8; S0_HALF_NONCE_SIZE] {
        &self.bytes
    }

    pub fn id(&self) -> u8 {
        self.bytes[0]
    }
}

impl Display for S0Nonce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{}", hex::encode(self.bytes))
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct NonceKey {
    remote: NodeId,
    nonce_id: u8,
}

struct NonceEntry {
    nonce: S0Nonce,
    issued_at: Instant,
}

/// The nonces this controller has issued, keyed by the remote node they
/// were issued to and the nonce id. Entries are one-shot and expire after
/// [NONCE_LIFETIME]; when the table is full the oldest entry is evicted.
#[derive(Default)]
pub struct NonceTable {
    entries: BTreeMap<NonceKey, NonceEntry>,
}

impl NonceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a fresh nonce for the given remote node, in response to its
    /// Nonce Get. The id stays unique among this remote's live entries.
    pub fn generate(&mut self, remote: NodeId, now: Instant) -> S0Nonce {
        self.prune(now);

        let nonce = loop {
            let candidate = S0Nonce::random();
            let key = NonceKey {
                remote,
                nonce_id: candidate.id(),
            };
            if !self.entries.contains_key(&key) {
                break candidate;
            }
        };

        if self.entries.len() >= NONCE_TABLE_CAP {
            self.evict_oldest();
        }

        self.entries.insert(
            NonceKey {
                remote,
                nonce_id: nonce.id(),
            },
            NonceEntry {
                nonce,
                issued_at: now,
            },
        );
        nonce
    }

    /// Look up and consume the nonce with the given id issued to `remote`.
    /// Expired entries count as absent.
    pub fn take(&mut self, remote: NodeId, nonce_id: u8, now: Instant) -> Option<S0Nonce> {
        let entry = self.entries.remove(&NonceKey { remote, nonce_id })?;
        if now.duration_since(entry.issued_at) > NONCE_LIFETIME {
            return None;
        }
        Some(entry.nonce)
    }

    /// Drop everything past its lifetime.
    pub fn prune(&mut self, now: Instant) {
        self.entries
            .retain(|_, e| now.duration_since(e.issued_at) <= NONCE_LIFETIME);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.issued_at)
            .map(|(k, _)| *k);
        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_take_is_one_shot() {
        let mut table = NonceTable::new();
        let now = Instant::now();
        let nonce = table.generate(NodeId::new(5), now);

        assert_eq!(table.take(NodeId::new(5), nonce.id(), now), Some(nonce));
        assert_eq!(table.take(NodeId::new(5), nonce.id(), now), None);
    }

    #[test]
    fn test_wrong_remote_misses() {
        let mut table = NonceTable::new();
        let now = Instant::now();
        let nonce = table.generate(NodeId::new(5), now);
        assert_eq!(table.take(NodeId::new(6), nonce.id(), now), None);
    }

    #[test]
    fn test_expiry() {
        let mut table = NonceTable::new();
        let now = Instant::now();
        let nonce = table.generate(NodeId::new(5), now);

        let later = now + NONCE_LIFETIME + Duration::from_millis(1);
        assert_eq!(table.take(NodeId::new(5), nonce.id(), later), None);
    }

    #[test]
    fn test_prune() {
        let mut table = NonceTable::new();
        let now = Instant::now();
        table.generate(NodeId::new(5), now);
        table.generate(NodeId::new(6), now);
        assert_eq!(table.len(), 2);

        table.prune(now + NONCE_LIFETIME + Duration::from_millis(1));
        assert!(table.is_empty());
    }

    #[test]
    fn test_capacity_bound() {
        let mut table = NonceTable::new();
        let now = Instant::now();
        // A hostile node hammering Nonce Get must not grow the table
        for i in 0..200u32 {
            table.generate(NodeId::new((i % 100) as u8 + 1), now + Duration::from_millis(i as u64));
        }
        assert!(table.len() <= NONCE_TABLE_CAP);
    }
}
