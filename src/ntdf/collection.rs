//! Collection engine: per-item encryption under counter-derived IVs.
//!
//! Item wire framing:
//! ```text
//! +------------+----------------+------------------+
//! | IV counter | payload length | ciphertext + tag |
//! | 3 bytes BE | 3 bytes BE     |                  |
//! +------------+----------------+------------------+
//! ```
//! The IV is 9 zero bytes followed by the same 3 counter bytes; a counter is
//! never reused under one key. Counters start at 1 and the publisher rotates
//! long before the 24-bit space could wrap.

use std::collections::HashSet;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use p256::ecdh::EphemeralSecret;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::PublicKey;
use rand::rngs::OsRng;
use zeroize::Zeroizing;

use crate::error::NtdfError;

use super::header::{
    default_policy_json, KasLocator, NtdfHeader, Policy, CIPHER_AES256_GCM_128, ECC_MODE_P256,
    POLICY_BINDING_LEN,
};
use super::derive_symmetric_key;

/// Hard ceiling of the 24-bit counter space.
pub const IV_COUNTER_MAX: u32 = (1 << 24) - 1;

/// Forced-rotation threshold: rotate well before the wire limit, whatever
/// the keyframe cadence does.
pub const IV_ROTATION_CEILING: u32 = 1 << 23;

/// Item framing overhead: counter plus length field.
pub const ITEM_PREFIX_LEN: usize = 6;

/// Encrypting side of one collection.
pub struct Collection {
    header: NtdfHeader,
    header_bytes: Vec<u8>,
    key: Zeroizing<[u8; 32]>,
    next_counter: u32,
}

impl Collection {
    /// Mint a new collection against `kas_public_key` (33-byte compressed
    /// point). A fresh ephemeral keypair is generated; its public half goes
    /// into the header and its ECDH output becomes the symmetric key, the
    /// same key the KAS will hand a subscriber during rewrap.
    pub fn create(
        kas_url: &str,
        kas_public_key: &[u8; 33],
        policy_json: Option<&[u8]>,
    ) -> Result<Self, NtdfError> {
        let kas_point = PublicKey::from_sec1_bytes(kas_public_key)
            .map_err(|_| NtdfError::HeaderParse("KAS public key is not a P-256 point".into()))?;

        let ephemeral = EphemeralSecret::random(&mut OsRng);
        let ephemeral_pub = PublicKey::from(&ephemeral);
        let shared = ephemeral.diffie_hellman(&kas_point);
        let key = derive_symmetric_key(shared.raw_secret_bytes().as_slice());

        let compressed = ephemeral_pub.to_sec1_bytes_compressed();

        let policy_body = policy_json
            .map(<[u8]>::to_vec)
            .unwrap_or_else(default_policy_json);
        let binding = policy_binding(&key, &policy_body);

        let header = NtdfHeader {
            kas: KasLocator::from_url(kas_url)?,
            ecc_mode: ECC_MODE_P256,
            symmetric_config: CIPHER_AES256_GCM_128,
            policy: Policy {
                body: policy_body,
                binding,
            },
            ephemeral_public_key: compressed,
        };
        let header_bytes = header.encode();

        Ok(Self {
            header,
            header_bytes,
            key,
            next_counter: 1,
        })
    }

    pub fn header(&self) -> &NtdfHeader {
        &self.header
    }

    pub fn header_bytes(&self) -> &[u8] {
        &self.header_bytes
    }

    /// Counter the next item will use.
    pub fn next_counter(&self) -> u32 {
        self.next_counter
    }

    /// Whether the rotation policy demands a new collection before the next
    /// item, independent of keyframe cadence.
    pub fn needs_forced_rotation(&self) -> bool {
        self.next_counter > IV_ROTATION_CEILING
    }

    /// Encrypt one item and frame it for the wire.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, NtdfError> {
        if self.next_counter > IV_COUNTER_MAX {
            return Err(NtdfError::IvExhausted);
        }
        let counter = self.next_counter;
        self.next_counter += 1;

        let iv = counter_iv(counter);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(self.key.as_slice()));
        let sealed = cipher
            .encrypt(Nonce::from_slice(&iv), plaintext)
            .map_err(|_| NtdfError::DecryptAuthFailed)?;

        let mut out = Vec::with_capacity(ITEM_PREFIX_LEN + sealed.len());
        out.extend_from_slice(&counter.to_be_bytes()[1..4]);
        out.extend_from_slice(&(sealed.len() as u32).to_be_bytes()[1..4]);
        out.extend_from_slice(&sealed);
        Ok(out)
    }
}

/// Decrypting side of one collection.
pub struct CollectionDecryptor {
    header_bytes: Vec<u8>,
    key: Zeroizing<[u8; 32]>,
    tag_size: usize,
    seen_counters: HashSet<u32>,
}

impl CollectionDecryptor {
    /// Build a decryptor from a parsed header and the symmetric key the KAS
    /// rewrap produced. The policy binding is verified now that the key is
    /// in hand.
    pub fn new(header_bytes: Vec<u8>, key: Zeroizing<[u8; 32]>) -> Result<Self, NtdfError> {
        let header = NtdfHeader::parse(&header_bytes)?;
        let binding = policy_binding(&key, &header.policy.body);
        if binding != header.policy.binding {
            return Err(NtdfError::HeaderParse("policy binding mismatch".into()));
        }
        Ok(Self {
            header_bytes,
            key,
            tag_size: header.tag_size(),
            seen_counters: HashSet::new(),
        })
    }

    pub fn header_bytes(&self) -> &[u8] {
        &self.header_bytes
    }

    /// Decrypt one framed item. Counters may arrive out of order (RTMP
    /// preserves per-csid order, so this is robustness, not a feature), but
    /// a counter seen twice is rejected outright.
    pub fn decrypt(&mut self, item: &[u8]) -> Result<Vec<u8>, NtdfError> {
        if item.len() < ITEM_PREFIX_LEN {
            return Err(NtdfError::DecryptAuthFailed);
        }
        let counter = u32::from(item[0]) << 16 | u32::from(item[1]) << 8 | u32::from(item[2]);
        let length = usize::from(item[3]) << 16 | usize::from(item[4]) << 8 | usize::from(item[5]);
        let sealed = &item[ITEM_PREFIX_LEN..];
        if counter == 0 || sealed.len() != length || length < self.tag_size {
            return Err(NtdfError::DecryptAuthFailed);
        }
        if self.seen_counters.contains(&counter) {
            return Err(NtdfError::CounterReuse(counter));
        }

        let iv = counter_iv(counter);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(self.key.as_slice()));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&iv), sealed)
            .map_err(|_| NtdfError::DecryptAuthFailed)?;

        self.seen_counters.insert(counter);
        Ok(plaintext)
    }
}

/// 12-byte GCM IV: 9 zero bytes then the 3 counter bytes.
fn counter_iv(counter: u32) -> [u8; 12] {
    let mut iv = [0u8; 12];
    iv[9..].copy_from_slice(&counter.to_be_bytes()[1..4]);
    iv
}

/// GMAC policy binding: the leading 8 bytes of a GCM tag over the policy
/// body as AAD under the collection key, zero IV.
pub(crate) fn policy_binding(key: &[u8; 32], policy_body: &[u8]) -> [u8; POLICY_BINDING_LEN] {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let tag = cipher
        .encrypt(
            Nonce::from_slice(&[0u8; 12]),
            Payload {
                msg: &[],
                aad: policy_body,
            },
        )
        .expect("GMAC over empty message cannot fail");
    let mut binding = [0u8; POLICY_BINDING_LEN];
    binding.copy_from_slice(&tag[..POLICY_BINDING_LEN]);
    binding
}

/// Compression helper: p256's `PublicKey` exposes SEC1 via encoded points.
trait CompressedPoint {
    fn to_sec1_bytes_compressed(&self) -> [u8; 33];
}

impl CompressedPoint for PublicKey {
    fn to_sec1_bytes_compressed(&self) -> [u8; 33] {
        let point = self.to_encoded_point(true);
        let mut out = [0u8; 33];
        out.copy_from_slice(point.as_bytes());
        out
    }
}
