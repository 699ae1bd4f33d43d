//! NanoTDF header codec.
//!
//! Wire layout:
//! ```text
//! magic+version     3 bytes   "L1L"
//! kas locator       1 byte protocol, 1 byte length, body
//! ecc/binding mode  1 byte    bit 7 ECDSA binding, low 3 bits curve
//! symmetric config  1 byte    bit 7 signature present, low 4 bits cipher
//! policy            1 byte type, u16 length, body, 8-byte GMAC binding
//! ephemeral key     33 bytes  compressed P-256 point
//! ```
//! Only the embedded-plaintext policy type and the P-256 / AES-256-GCM
//! configuration are produced; parsing rejects everything else rather than
//! carrying options this transport never negotiates.

use crate::error::NtdfError;

use super::MAGIC;

/// KAS locator protocol values.
pub const PROTO_HTTP: u8 = 0x00;
pub const PROTO_HTTPS: u8 = 0x01;

/// ECC mode: curve enum in the low 3 bits. secp256r1 = 0.
pub const ECC_MODE_P256: u8 = 0x00;

/// Symmetric cipher enum (low 4 bits of the config byte). The values walk
/// the GCM tag lengths: 0x00 = 64-bit through 0x05 = 128-bit.
pub const CIPHER_AES256_GCM_128: u8 = 0x05;

/// Policy type byte for an embedded plaintext policy.
pub const POLICY_EMBEDDED_PLAINTEXT: u8 = 0x01;

/// Length of the GMAC policy binding.
pub const POLICY_BINDING_LEN: usize = 8;

/// Compressed P-256 point length.
pub const EPHEMERAL_KEY_LEN: usize = 33;

/// KAS resource locator: protocol plus `host[:port]/path` body.
#[derive(Debug, Clone, PartialEq)]
pub struct KasLocator {
    pub protocol: u8,
    pub body: String,
}

impl KasLocator {
    /// Build a locator from a KAS base URL, e.g. `https://kas.example.com`.
    pub fn from_url(url: &str) -> Result<Self, NtdfError> {
        let (protocol, rest) = if let Some(rest) = url.strip_prefix("https://") {
            (PROTO_HTTPS, rest)
        } else if let Some(rest) = url.strip_prefix("http://") {
            (PROTO_HTTP, rest)
        } else {
            return Err(NtdfError::HeaderParse(format!(
                "KAS URL {} is neither http nor https",
                url
            )));
        };
        let body = rest.trim_end_matches('/').to_string();
        if body.is_empty() || body.len() > 255 {
            return Err(NtdfError::HeaderParse("KAS locator body length".into()));
        }
        Ok(Self { protocol, body })
    }

    /// Reassemble the base URL.
    pub fn url(&self) -> String {
        let scheme = if self.protocol == PROTO_HTTPS { "https" } else { "http" };
        format!("{}://{}", scheme, self.body)
    }
}

/// Embedded plaintext policy with its GMAC binding.
#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
    pub body: Vec<u8>,
    pub binding: [u8; POLICY_BINDING_LEN],
}

/// Generate the default policy body: a fresh UUID and empty attribute and
/// dissemination lists.
pub fn default_policy_json() -> Vec<u8> {
    let uuid = uuid::Uuid::new_v4();
    format!(
        r#"{{"uuid":"{}","body":{{"dataAttributes":[],"dissem":[]}}}}"#,
        uuid
    )
    .into_bytes()
}

/// Parsed NanoTDF header.
#[derive(Debug, Clone, PartialEq)]
pub struct NtdfHeader {
    pub kas: KasLocator,
    pub ecc_mode: u8,
    pub symmetric_config: u8,
    pub policy: Policy,
    pub ephemeral_public_key: [u8; EPHEMERAL_KEY_LEN],
}

impl NtdfHeader {
    /// GCM tag length selected by the symmetric config byte.
    pub fn tag_size(&self) -> usize {
        match self.symmetric_config & 0x0F {
            0x00 => 8,
            0x01 => 12,
            0x02 => 13,
            0x03 => 14,
            0x04 => 15,
            _ => 16,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            3 + 2 + self.kas.body.len() + 2 + 3 + self.policy.body.len() + POLICY_BINDING_LEN
                + EPHEMERAL_KEY_LEN,
        );
        out.extend_from_slice(&MAGIC);
        out.push(self.kas.protocol);
        out.push(self.kas.body.len() as u8);
        out.extend_from_slice(self.kas.body.as_bytes());
        out.push(self.ecc_mode);
        out.push(self.symmetric_config);
        out.push(POLICY_EMBEDDED_PLAINTEXT);
        out.extend_from_slice(&(self.policy.body.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.policy.body);
        out.extend_from_slice(&self.policy.binding);
        out.extend_from_slice(&self.ephemeral_public_key);
        out
    }

    pub fn parse(data: &[u8]) -> Result<Self, NtdfError> {
        let mut pos = 0;

        let magic = take(data, &mut pos, 3)?;
        if magic != MAGIC {
            return Err(NtdfError::HeaderParse(format!(
                "bad magic {:02X?}",
                magic
            )));
        }

        let protocol = take(data, &mut pos, 1)?[0];
        if protocol != PROTO_HTTP && protocol != PROTO_HTTPS {
            return Err(NtdfError::HeaderParse(format!(
                "KAS locator protocol {}",
                protocol
            )));
        }
        let body_len = take(data, &mut pos, 1)?[0] as usize;
        let body = std::str::from_utf8(take(data, &mut pos, body_len)?)
            .map_err(|_| NtdfError::HeaderParse("KAS locator not UTF-8".into()))?
            .to_string();

        let ecc_mode = take(data, &mut pos, 1)?[0];
        if ecc_mode & 0x07 != ECC_MODE_P256 {
            return Err(NtdfError::HeaderParse(format!(
                "unsupported curve {}",
                ecc_mode & 0x07
            )));
        }
        let symmetric_config = take(data, &mut pos, 1)?[0];

        let policy_type = take(data, &mut pos, 1)?[0];
        if policy_type != POLICY_EMBEDDED_PLAINTEXT {
            return Err(NtdfError::HeaderParse(format!(
                "unsupported policy type {}",
                policy_type
            )));
        }
        let raw = take(data, &mut pos, 2)?;
        let policy_len = u16::from_be_bytes([raw[0], raw[1]]) as usize;
        let policy_body = take(data, &mut pos, policy_len)?.to_vec();
        let mut binding = [0u8; POLICY_BINDING_LEN];
        binding.copy_from_slice(take(data, &mut pos, POLICY_BINDING_LEN)?);

        let mut ephemeral_public_key = [0u8; EPHEMERAL_KEY_LEN];
        ephemeral_public_key.copy_from_slice(take(data, &mut pos, EPHEMERAL_KEY_LEN)?);
        // Compressed SEC1 points start 0x02 or 0x03.
        if ephemeral_public_key[0] != 0x02 && ephemeral_public_key[0] != 0x03 {
            return Err(NtdfError::HeaderParse(
                "ephemeral key is not a compressed point".into(),
            ));
        }

        if pos != data.len() {
            return Err(NtdfError::HeaderParse(format!(
                "{} trailing bytes",
                data.len() - pos
            )));
        }

        Ok(Self {
            kas: KasLocator { protocol, body },
            ecc_mode,
            symmetric_config,
            policy: Policy {
                body: policy_body,
                binding,
            },
            ephemeral_public_key,
        })
    }
}

fn take<'a>(data: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8], NtdfError> {
    if data.len() < *pos + n {
        return Err(NtdfError::HeaderParse("truncated header".into()));
    }
    let slice = &data[*pos..*pos + n];
    *pos += n;
    Ok(slice)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> NtdfHeader {
        let mut key = [0u8; EPHEMERAL_KEY_LEN];
        key[0] = 0x02;
        key[1..].copy_from_slice(&[0x7A; 32]);
        NtdfHeader {
            kas: KasLocator {
                protocol: PROTO_HTTPS,
                body: "kas.example.com".into(),
            },
            ecc_mode: ECC_MODE_P256,
            symmetric_config: CIPHER_AES256_GCM_128,
            policy: Policy {
                body: default_policy_json(),
                binding: [9; POLICY_BINDING_LEN],
            },
            ephemeral_public_key: key,
        }
    }

    #[test]
    fn test_roundtrip() {
        let header = sample_header();
        let parsed = NtdfHeader::parse(&header.encode()).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.tag_size(), 16);
    }

    #[test]
    fn test_magic_leads_the_wire() {
        let bytes = sample_header().encode();
        assert_eq!(&bytes[..3], b"L1L");
    }

    #[test]
    fn test_rejects_bad_magic() {
        let mut bytes = sample_header().encode();
        bytes[0] = b'X';
        assert!(matches!(
            NtdfHeader::parse(&bytes),
            Err(NtdfError::HeaderParse(_))
        ));
    }

    #[test]
    fn test_rejects_truncation_everywhere() {
        let bytes = sample_header().encode();
        for cut in 0..bytes.len() {
            assert!(
                NtdfHeader::parse(&bytes[..cut]).is_err(),
                "cut at {} parsed",
                cut
            );
        }
    }

    #[test]
    fn test_rejects_trailing_garbage() {
        let mut bytes = sample_header().encode();
        bytes.push(0);
        assert!(NtdfHeader::parse(&bytes).is_err());
    }

    #[test]
    fn test_rejects_uncompressed_point() {
        let mut header = sample_header();
        header.ephemeral_public_key[0] = 0x04;
        assert!(NtdfHeader::parse(&header.encode()).is_err());
    }

    #[test]
    fn test_kas_locator_urls() {
        let loc = KasLocator::from_url("https://kas.example.com/kas/").unwrap();
        assert_eq!(loc.protocol, PROTO_HTTPS);
        assert_eq!(loc.body, "kas.example.com/kas");
        assert_eq!(loc.url(), "https://kas.example.com/kas");

        let loc = KasLocator::from_url("http://10.0.0.5:8080").unwrap();
        assert_eq!(loc.protocol, PROTO_HTTP);
        assert_eq!(loc.url(), "http://10.0.0.5:8080");

        assert!(KasLocator::from_url("ftp://x").is_err());
    }

    #[test]
    fn test_default_policy_shape() {
        let body = default_policy_json();
        let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(v.get("uuid").and_then(|u| u.as_str()).is_some());
        assert_eq!(v["body"]["dataAttributes"].as_array().unwrap().len(), 0);
        assert_eq!(v["body"]["dissem"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn test_tag_sizes() {
        let mut header = sample_header();
        header.symmetric_config = 0x00;
        assert_eq!(header.tag_size(), 8);
        header.symmetric_config = 0x05;
        assert_eq!(header.tag_size(), 16);
    }
}
