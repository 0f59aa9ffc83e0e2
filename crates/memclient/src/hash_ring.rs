//! Consistent-hash ring mapping keys to servers.
//!
//! Tokens are FNV-1a 64-bit hashes. Every server contributes
//! [`VIRTUAL_NODES_PER_SERVER`] ring positions derived from
//! `"{host}:{port}-{index}"`, so ownership is deterministic across
//! processes: any two clients configured with the same server set agree on
//! which server owns a key. A key resolves to the server owning the
//! smallest token ≥ its hash, wrapping to the smallest token overall.

use std::collections::{BTreeMap, HashSet};
use std::sync::RwLock;

use crate::server_list::ServerAddress;

/// Ring positions per server. More positions smooth the key distribution
/// when servers join or leave.
const VIRTUAL_NODES_PER_SERVER: usize = 160;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1a, 64-bit. Non-cryptographic, stable across processes and builds.
pub(crate) fn fnv1a_64(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for &byte in bytes {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[derive(Default)]
struct RingInner {
    tokens: BTreeMap<u64, ServerAddress>,
    members: HashSet<ServerAddress>,
}

/// Thread-safe consistent-hash store. Readers never observe a torn ring;
/// writers serialize behind the lock.
#[derive(Default)]
pub(crate) struct HashRing {
    inner: RwLock<RingInner>,
}

impl HashRing {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&self, server: &ServerAddress) {
        let mut inner = self.inner.write().unwrap();
        if !inner.members.insert(server.clone()) {
            return;
        }
        let identity = server.identity();
        for index in 0..VIRTUAL_NODES_PER_SERVER {
            let token = fnv1a_64(format!("{identity}-{index}").as_bytes());
            // Token collision: the bytewise-smaller server identity wins so
            // every client resolves the tie the same way.
            let keep_existing = inner
                .tokens
                .get(&token)
                .is_some_and(|existing| existing.identity() <= identity);
            if !keep_existing {
                inner.tokens.insert(token, server.clone());
            }
        }
    }

    pub(crate) fn remove(&self, server: &ServerAddress) {
        let mut inner = self.inner.write().unwrap();
        if !inner.members.remove(server) {
            return;
        }
        inner.tokens.retain(|_, owner| owner != server);
    }

    pub(crate) fn contains(&self, server: &ServerAddress) -> bool {
        self.inner.read().unwrap().members.contains(server)
    }

    /// Resolve the owner of `key`, or `None` when the ring is empty.
    pub(crate) fn get(&self, key: &[u8]) -> Option<ServerAddress> {
        let inner = self.inner.read().unwrap();
        if inner.tokens.is_empty() {
            return None;
        }
        let token = fnv1a_64(key);
        inner
            .tokens
            .range(token..)
            .next()
            .or_else(|| inner.tokens.iter().next())
            .map(|(_, server)| server.clone())
    }

    pub(crate) fn clear(&self) {
        let mut inner = self.inner.write().unwrap();
        inner.tokens.clear();
        inner.members.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.read().unwrap().members.len()
    }
}
