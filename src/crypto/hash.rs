//! Order-sensitive hash over a list of byte strings, used both to agree on
//! the final shuffled cipher set in Phase 4 and (generically) anywhere the
//! engine needs a collision-resistant digest of a sequence of wire values.

use sha2::{Digest as _, Sha256};

pub type HashOutput = [u8; 32];

/// Hashes `items` in the given order. Changing the order, duplicating an
/// entry, or changing any single byte changes the digest.
pub fn hash_list<I, B>(items: I) -> HashOutput
where
    I: IntoIterator<Item = B>,
    B: AsRef<[u8]>,
{
    let mut hasher = Sha256::new();
    for item in items {
        let bytes = item.as_ref();
        hasher.update((bytes.len() as u64).to_be_bytes());
        hasher.update(bytes);
    }
    hasher.finalize().into()
}
