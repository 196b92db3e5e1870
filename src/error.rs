//! Crate-wide error type.
//!
//! Every failure mode named by the protocol is fatal to the round: there is
//! no local recovery path, so this type is a flat enum rather than a tree of
//! per-phase error types. Callers match on variants to decide how to report
//! the abort; the engine itself only ever returns `Err` and stops.

use crate::node::PartyId;

/// Something went wrong while running the shuffle protocol.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("message carried round_id {got}, expected {expected}")]
    RoundMismatch { expected: u64, got: u64 },

    #[error("no public key on file for party {0}")]
    KeyMissing(PartyId),

    #[error("signature verification failed for a message purportedly from party {0}")]
    BadSignature(PartyId),

    #[error("RSA key generation or encryption failed")]
    CryptoFailed(#[source] rsa::Error),

    #[error("RSA decryption failed")]
    DecryptFailed(#[source] rsa::Error),

    #[error("a protocol value did not decode to the expected shape")]
    EncodingInvalid(#[source] bincode::Error),

    #[error("ciphertext framing was malformed: {0}")]
    CiphertextFraming(&'static str),

    #[error("a key failed to parse from its canonical encoding")]
    KeyEncodingInvalid(#[source] rsa::pkcs1::Error),

    #[error("packaged datum was not exactly max_len bytes (got {got}, expected {expected})")]
    LengthMismatch { expected: usize, got: usize },

    #[error("message of {0} bytes exceeds the configured max_len of {1}")]
    MessageTooLong(usize, usize),

    #[error("phase 4 verification failed: {0}")]
    VerifyFailed(#[from] VerifyFailure),

    #[error("transport I/O failed")]
    TransportFailed(#[source] std::io::Error),

    #[error("peer keyset is incomplete: have {have} of {expected} entries")]
    IncompleteKeyset { have: usize, expected: usize },

    #[error("received {0} where a different message kind was expected for this phase")]
    UnexpectedMessage(&'static str),

    #[error("failed to persist a recovered plaintext to an output file")]
    OutputWriteFailed(#[source] std::io::Error),
}

/// The distinct ways Phase 4's commit-or-abort check can fail.
#[derive(Debug, thiserror::Error)]
pub enum VerifyFailure {
    #[error("this node's own inner ciphertext was not present in the agreed final set")]
    OwnCiphertextMissing,

    #[error("the final set hash this node computed locally did not match the leader's broadcast")]
    HashMismatch,

    #[error("party {0} voted against the round")]
    PeerVotedNo(PartyId),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::TransportFailed(e)
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::EncodingInvalid(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
