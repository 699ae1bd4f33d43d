//! NanoTDF collection crypto: header codec, collection engine, KAS client.
//!
//! A *collection* is one symmetric key shared by many small encrypted items.
//! The publisher mints the key by ECDH against the KAS public key with a
//! fresh ephemeral keypair, emits one header carrying that ephemeral public
//! key, and encrypts every item under a counter-derived IV. A subscriber
//! hands the header to the KAS, which performs the mirror-image ECDH and
//! rewraps the key under the subscriber's own ephemeral key.
//!
//! Both sides of that exchange end at the same derivation:
//! `HKDF-SHA256(salt = SHA-256(magic), ikm = ECDH x-coordinate)`.

pub mod collection;
pub mod header;
pub mod kas;

use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

/// Container magic + version ("L1L").
pub const MAGIC: [u8; 3] = *b"L1L";

/// Derive a 32-byte symmetric key from an ECDH shared secret, the way the
/// KAS derives it.
pub(crate) fn derive_symmetric_key(shared_secret: &[u8]) -> Zeroizing<[u8; 32]> {
    let salt = Sha256::digest(MAGIC);
    let hk = Hkdf::<Sha256>::new(Some(salt.as_slice()), shared_secret);
    let mut key = Zeroizing::new([0u8; 32]);
    hk.expand(&[], &mut *key)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    key
}
