//! Self-contained signed blobs.
//!
//! A signed blob carries its own signer id so that [`verify`] can look the
//! signer's K1 public key up in the peer keyset without any out-of-band
//! context. This is what lets every signed message in the protocol
//! (Phase 2 submissions, Phase 3 forwards, Phase 4 votes, Phase 5 reveals)
//! share one verification path.

use std::collections::BTreeMap;

use rand_core::CryptoRngCore;
use rsa::pkcs1v15::{SigningKey, VerifyingKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::crypto::rsa_ops::{PrivateKey, PublicKey};
use crate::error::Error;
use crate::node::PartyId;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SignedBlob {
    signer: PartyId,
    msg: Vec<u8>,
    signature: Vec<u8>,
}

/// Signs `msg` on behalf of `signer`, producing a blob from which both the
/// message and the signer's identity can be recovered by [`verify`].
pub fn sign(
    signer: PartyId,
    sk: &PrivateKey,
    msg: &[u8],
    rng: &mut impl CryptoRngCore,
) -> Result<Vec<u8>, Error> {
    let signing_key = SigningKey::<Sha256>::new(sk.clone());
    let signature = signing_key.sign_with_rng(rng, msg);
    let blob = SignedBlob {
        signer,
        msg: msg.to_vec(),
        signature: signature.to_vec(),
    };
    Ok(bincode::serialize(&blob)?)
}

/// Verifies a blob produced by [`sign`] against the K1 public key on file
/// for its claimed signer, returning `(signer, msg)` on success.
///
/// Fails with [`Error::KeyMissing`] if the claimed signer isn't in
/// `k1_keyset`, or [`Error::BadSignature`] if the signature doesn't check
/// out.
pub fn verify(
    k1_keyset: &BTreeMap<PartyId, PublicKey>,
    blob_bytes: &[u8],
) -> Result<(PartyId, Vec<u8>), Error> {
    let blob: SignedBlob = bincode::deserialize(blob_bytes)?;
    let k1 = k1_keyset
        .get(&blob.signer)
        .ok_or(Error::KeyMissing(blob.signer))?;

    let verifying_key = VerifyingKey::<Sha256>::new(k1.clone());
    let signature = blob
        .signature
        .as_slice()
        .try_into()
        .map_err(|_| Error::BadSignature(blob.signer))?;

    verifying_key
        .verify(&blob.msg, &signature)
        .map_err(|_| Error::BadSignature(blob.signer))?;

    Ok((blob.signer, blob.msg))
}
