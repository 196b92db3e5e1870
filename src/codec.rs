//! Tagged, self-describing wire messages.
//!
//! Every message exchanged between nodes is one variant of [`WireMessage`].
//! Encoding is via `bincode`, which is deterministic for a fixed value, so
//! the same bytes that go on the wire can be fed straight to
//! [`crate::crypto::hash::hash_list`] for Phase 4's agreement check: two
//! honest nodes holding the same logical value always compute the same
//! digest.

use std::collections::BTreeMap;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::crypto::hash::HashOutput;
use crate::error::{Error, Result};
use crate::node::PartyId;

/// A ciphertext tagged with the round it belongs to. Carrying `round_id`
/// on every individual element (rather than once for the whole list) lets
/// a receiver catch a cross-round replay on any single entry, matching the
/// per-element check the protocol performs while peeling Phase 3 layers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CipherEnvelope {
    pub round_id: u64,
    pub ctext: Vec<u8>,
}

/// One entry of the Phase 1 consolidated keyset: a party's raw K1 public
/// key bytes, and its K2 public key bytes wrapped in a K1 signature blob
/// (still unverified at this layer).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyEntry {
    pub k1_pub: Vec<u8>,
    pub k2_pub_signed: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireMessage {
    /// 1a: peer -> leader. Unsigned (K1 identities are bootstrapped here).
    P1Join {
        id: PartyId,
        round_id: u64,
        ip: IpAddr,
        port: u16,
        k1_pub: Vec<u8>,
        k2_pub_signed: Vec<u8>,
    },
    /// 1b: leader -> peer. Unsigned, for the same reason as `P1Join`.
    P1Distribute {
        round_id: u64,
        keys: BTreeMap<PartyId, KeyEntry>,
    },
    /// 2: peer -> leader, signed.
    P2Cipher { round_id: u64, cipher: Vec<u8> },
    /// 3 / 3': ring forwarding and the last node's hop to the leader, signed.
    P3Shuffle { items: Vec<CipherEnvelope> },
    /// 4a: leader -> all, the agreed final cipher set `F`, signed.
    P4FinalSet { items: Vec<CipherEnvelope> },
    /// 4b: peer -> leader, a single GO/NO-GO vote, signed.
    P4Vote {
        id: PartyId,
        round_id: u64,
        go: bool,
        hash: HashOutput,
    },
    /// 4c: leader -> all, every signed vote blob, passed through unopened.
    P4VoteSet { votes: Vec<Vec<u8>> },
    /// 5a: peer -> leader, a revealed K2 private key, signed.
    P5Reveal {
        id: PartyId,
        round_id: u64,
        k2_priv: Vec<u8>,
    },
    /// 5b: leader -> all, every signed reveal blob, passed through unopened.
    P5RevealSet { reveals: Vec<Vec<u8>> },
}

pub fn encode(msg: &WireMessage) -> Result<Vec<u8>> {
    bincode::serialize(msg).map_err(Error::from)
}

pub fn decode(bytes: &[u8]) -> Result<WireMessage> {
    bincode::deserialize(bytes).map_err(Error::from)
}

/// Canonical bytes for a value that needs to be hashed or compared for
/// equality against the agreed final set (e.g. "is my C' in F"). For
/// [`CipherEnvelope`] this is exactly what the wire carries, so a node's
/// locally-recomputed envelope and a peer's copy that round-tripped through
/// the network compare equal byte-for-byte.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Vec<u8> {
    bincode::serialize(value).expect("in-memory protocol values always serialize")
}
