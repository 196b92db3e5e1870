//! RSA keypair generation, canonical encoding, and the chunked
//! encrypt/decrypt scheme used to layer ciphertexts in Phase 2.
//!
//! This module is an adapter to the `rsa` crate. `rsa`'s API shape changes
//! across major versions; isolating it here means the rest of the engine
//! only ever sees `PublicKey`/`PrivateKey` and byte slices.

use rand_core::CryptoRngCore;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPrivateKey, EncodeRsaPublicKey};
use rsa::Pkcs1v15Encrypt;
use secrecy::Secret;
use zeroize::Zeroizing;

use crate::error::{Error, Result};

pub type PublicKey = rsa::RsaPublicKey;
pub type PrivateKey = rsa::RsaPrivateKey;

/// PKCS#1 v1.5 padding overhead, in bytes, per RSA block.
const PKCS1_OVERHEAD: usize = 11;

/// Length of the big-endian plaintext-length header prefixed to every
/// ciphertext produced by [`encrypt`].
const HEADER_LEN: usize = 8;

pub fn generate_keypair(
    bits: usize,
    rng: &mut impl CryptoRngCore,
) -> Result<(PrivateKey, PublicKey)> {
    let sk = PrivateKey::new(rng, bits).map_err(Error::CryptoFailed)?;
    let pk = PublicKey::from(&sk);
    Ok((sk, pk))
}

pub fn pub_to_bytes(pk: &PublicKey) -> Vec<u8> {
    pk.to_pkcs1_der()
        .expect("a valid in-memory RsaPublicKey always encodes")
        .as_bytes()
        .to_vec()
}

pub fn pub_from_bytes(bytes: &[u8]) -> Result<PublicKey> {
    PublicKey::from_pkcs1_der(bytes).map_err(Error::KeyEncodingInvalid)
}

/// Encodes a private key for the Phase 5 reveal. The caller is responsible
/// for discarding the returned buffer promptly; it zeroizes on drop.
pub fn priv_to_bytes(sk: &PrivateKey) -> Zeroizing<Vec<u8>> {
    let doc = sk
        .to_pkcs1_der()
        .expect("a valid in-memory RsaPrivateKey always encodes");
    Zeroizing::new(doc.as_bytes().to_vec())
}

pub fn priv_from_bytes(bytes: &[u8]) -> Result<Secret<PrivateKey>> {
    let sk = PrivateKey::from_pkcs1_der(bytes).map_err(Error::KeyEncodingInvalid)?;
    Ok(Secret::new(sk))
}

/// Encrypts `plaintext` under `pk`, chunking it across as many RSA blocks
/// as needed. Output is `HEADER_LEN` bytes of big-endian original length,
/// followed by one ciphertext block per chunk, each exactly
/// `pk.size()` bytes. This framing is independent of what produced
/// `plaintext` (a raw message or a previous encryption layer), so applying
/// it repeatedly under a descending sequence of keys is well defined.
pub fn encrypt(
    pk: &PublicKey,
    plaintext: &[u8],
    rng: &mut impl CryptoRngCore,
) -> Result<Vec<u8>> {
    use rsa::traits::PublicKeyParts;

    let block_size = pk.size();
    let chunk_len = block_size - PKCS1_OVERHEAD;

    let mut out = Vec::with_capacity(HEADER_LEN + plaintext.len() / chunk_len.max(1) * block_size + block_size);
    out.extend_from_slice(&(plaintext.len() as u64).to_be_bytes());

    if plaintext.is_empty() {
        let block = pk
            .encrypt(rng, Pkcs1v15Encrypt, &[])
            .map_err(Error::CryptoFailed)?;
        out.extend_from_slice(&block);
        return Ok(out);
    }

    for chunk in plaintext.chunks(chunk_len) {
        let block = pk
            .encrypt(rng, Pkcs1v15Encrypt, chunk)
            .map_err(Error::CryptoFailed)?;
        debug_assert_eq!(block.len(), block_size);
        out.extend_from_slice(&block);
    }
    Ok(out)
}

/// Inverse of [`encrypt`]: peels exactly one layer under `sk`.
pub fn decrypt(sk: &PrivateKey, ciphertext: &[u8]) -> Result<Vec<u8>> {
    use rsa::traits::PublicKeyParts;

    if ciphertext.len() < HEADER_LEN {
        return Err(Error::CiphertextFraming("ciphertext shorter than length header"));
    }
    let (header, body) = ciphertext.split_at(HEADER_LEN);
    let orig_len = u64::from_be_bytes(header.try_into().unwrap()) as usize;

    let block_size = sk.size();
    if body.len() % block_size != 0 {
        return Err(Error::CiphertextFraming("ciphertext length is not a multiple of the RSA block size"));
    }

    let mut plain = Vec::with_capacity(orig_len);
    for block in body.chunks(block_size) {
        let chunk = sk
            .decrypt(Pkcs1v15Encrypt, block)
            .map_err(Error::DecryptFailed)?;
        plain.extend_from_slice(&chunk);
    }
    plain.truncate(orig_len);
    if plain.len() != orig_len {
        return Err(Error::CiphertextFraming("decrypted length did not match the recorded header"));
    }
    Ok(plain)
}

/// Applies [`encrypt`] once per key in `keys`, in the order given, each
/// layer wrapping the previous result. The last key in the iterator ends up
/// as the outermost layer.
pub fn layer_encrypt<'a>(
    keys: impl IntoIterator<Item = &'a PublicKey>,
    plaintext: &[u8],
    rng: &mut impl CryptoRngCore,
) -> Result<Vec<u8>> {
    let mut acc = plaintext.to_vec();
    for pk in keys {
        acc = encrypt(pk, &acc, rng)?;
    }
    Ok(acc)
}

/// Applies [`decrypt`] once per key in `keys`, in the order given. To
/// invert a [`layer_encrypt`] call, pass keys in the exact reverse order.
pub fn layer_decrypt<'a>(
    keys: impl IntoIterator<Item = &'a PrivateKey>,
    ciphertext: &[u8],
) -> Result<Vec<u8>> {
    let mut acc = ciphertext.to_vec();
    for sk in keys {
        acc = decrypt(sk, &acc)?;
    }
    Ok(acc)
}
