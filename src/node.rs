//! Per-node identity, round parameters, and the split between public and
//! private key material.
//!
//! [`PeerKeyset`] and [`SelfKeys`] are deliberately different types: the
//! former is read-only public data shared with every peer by the end of
//! Phase 1, the latter never leaves this node until Phase 5 hands K2 over.
//! Keeping them apart means a function that only needs `PeerKeyset` simply
//! cannot be handed a private key by accident.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use rand_core::CryptoRngCore;

use crate::crypto::rsa_ops::{self, PrivateKey, PublicKey};
use crate::error::{Error, Result};

/// A node's position in the round, `0..n_nodes`.
pub type PartyId = u32;

/// The constant-size header `package` prepends: the original message
/// length, as a big-endian `u64`.
pub const PACKAGE_HEADER_LEN: usize = 8;

/// Everything needed to construct a node's round: the constructor inputs
/// named in the external interface, plus an optional transport read
/// timeout (an operational knob, not part of the protocol proper).
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub id: PartyId,
    pub key_len_bits: usize,
    pub round_id: u64,
    pub n_nodes: u32,
    pub my_addr: SocketAddr,
    pub leader_addr: SocketAddr,
    pub prev_addr: SocketAddr,
    pub next_addr: SocketAddr,
    pub max_len: usize,
    pub read_timeout: Option<Duration>,
}

impl NodeConfig {
    pub fn is_leader(&self) -> bool {
        self.id == 0
    }

    pub fn is_last(&self) -> bool {
        self.id + 1 == self.n_nodes
    }
}

/// This node's own two keypairs for the round. Never serialized as a whole;
/// only `k1_pub`/`k2_pub` are ever handed to a peer, and `k2_priv` only
/// after Phase 4 commits.
pub struct SelfKeys {
    pub k1_priv: PrivateKey,
    pub k1_pub: PublicKey,
    pub k2_priv: PrivateKey,
    pub k2_pub: PublicKey,
}

impl SelfKeys {
    pub fn generate(bits: usize, rng: &mut impl CryptoRngCore) -> Result<Self> {
        let (k1_priv, k1_pub) = rsa_ops::generate_keypair(bits, rng)?;
        let (k2_priv, k2_pub) = rsa_ops::generate_keypair(bits, rng)?;
        Ok(Self {
            k1_priv,
            k1_pub,
            k2_priv,
            k2_pub,
        })
    }
}

/// The complete, read-only public keyset for the round: `id -> (K1, K2)`.
/// Populated during Phase 1 and never mutated afterward.
pub type PeerKeyset = BTreeMap<PartyId, (PublicKey, PublicKey)>;

/// Projects a [`PeerKeyset`] down to just the K1 public keys, the view
/// signature verification needs.
pub fn k1_view(keyset: &PeerKeyset) -> BTreeMap<PartyId, PublicKey> {
    keyset.iter().map(|(id, (k1, _))| (*id, k1.clone())).collect()
}

/// Pads `msg` to a constant-size datum: an 8-byte big-endian length header
/// followed by `msg`, followed by zero padding out to `max_len` bytes of
/// payload. Anonymity depends on every node's packaged datum being exactly
/// the same total size, so `package` enforces it up front rather than
/// leaving it to the caller.
pub fn package(max_len: usize, msg: &[u8]) -> Result<Vec<u8>> {
    if msg.len() > max_len {
        return Err(Error::MessageTooLong(msg.len(), max_len));
    }
    let mut out = Vec::with_capacity(PACKAGE_HEADER_LEN + max_len);
    out.extend_from_slice(&(msg.len() as u64).to_be_bytes());
    out.extend_from_slice(msg);
    out.resize(PACKAGE_HEADER_LEN + max_len, 0u8);
    Ok(out)
}

/// Inverse of [`package`]. Fails with [`Error::LengthMismatch`] unless
/// `bytes` is exactly `PACKAGE_HEADER_LEN + max_len` long, which is the
/// anonymity-critical check: a datum of any other size did not come from
/// an honest `package` call in this round.
pub fn unpackage(max_len: usize, bytes: &[u8]) -> Result<Vec<u8>> {
    let expected = PACKAGE_HEADER_LEN + max_len;
    if bytes.len() != expected {
        return Err(Error::LengthMismatch {
            expected,
            got: bytes.len(),
        });
    }
    let mlen = u64::from_be_bytes(bytes[..PACKAGE_HEADER_LEN].try_into().unwrap()) as usize;
    if mlen > max_len {
        return Err(Error::LengthMismatch {
            expected: max_len,
            got: mlen,
        });
    }
    Ok(bytes[PACKAGE_HEADER_LEN..PACKAGE_HEADER_LEN + mlen].to_vec())
}
