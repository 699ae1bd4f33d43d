//! KAS client: public-key fetch and the ephemeral-ECDH rewrap exchange.
//!
//! Rewrap flow:
//! 1. Generate an ephemeral P-256 keypair for this one exchange.
//! 2. Send the collection header and our public key (PEM around the raw
//!    65-byte SEC1 uncompressed point; the KAS expects that exact framing,
//!    not SPKI DER) with the caller's bearer token.
//! 3. The KAS answers with the collection key wrapped under
//!    KEK = HKDF(ECDH(session key, our key)) plus its session public key.
//! 4. Run the mirror ECDH, derive the KEK, open the wrapped key.
//!
//! The client is stateless between rewraps; nothing is cached.

use std::time::Duration;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use p256::ecdh::EphemeralSecret;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::PublicKey;
use rand::rngs::OsRng;
use zeroize::Zeroizing;

use crate::error::KasError;

use super::derive_symmetric_key;

/// Public-key endpoint, relative to the KAS base.
const PUBLIC_KEY_PATH: &str = "/kas/v2/kas_public_key?algorithm=ec";

/// Rewrap endpoint, relative to the KAS base.
const REWRAP_PATH: &str = "/kas/v2/rewrap";

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Nonce length prefixed to the wrapped key.
const WRAP_NONCE_LEN: usize = 12;

/// Raw SEC1 uncompressed point length.
const SEC1_UNCOMPRESSED_LEN: usize = 65;

/// SPKI body length for a P-256 key: 26-byte algorithm prefix + the point.
const SPKI_EC_LEN: usize = 26 + SEC1_UNCOMPRESSED_LEN;

pub struct KasClient {
    http: reqwest::Client,
    base_url: String,
}

impl KasClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Fetch the KAS EC public key, compressed to 33 bytes. Non-200 is
    /// fail-closed.
    pub async fn fetch_public_key(&self) -> Result<[u8; 33], KasError> {
        let url = format!("{}{}", self.base_url, PUBLIC_KEY_PATH);
        tracing::debug!(%url, "fetching KAS public key");

        let resp = self
            .http
            .get(&url)
            .timeout(HTTP_TIMEOUT)
            .send()
            .await
            .map_err(|e| KasError::BadResponse(format!("public key request failed: {}", e)))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(KasError::Http(status.as_u16()));
        }
        let body = resp
            .text()
            .await
            .map_err(|e| KasError::BadResponse(format!("public key body: {}", e)))?;

        // Some deployments return raw PEM, some wrap it in JSON.
        let pem = match serde_json::from_str::<serde_json::Value>(&body) {
            Ok(v) => v
                .get("publicKey")
                .or_else(|| v.get("pem"))
                .and_then(|p| p.as_str())
                .map(str::to_string)
                .or_else(|| v.as_str().map(str::to_string))
                .ok_or_else(|| {
                    KasError::BadResponse("JSON body without a publicKey field".into())
                })?,
            Err(_) => body,
        };

        let point = parse_public_key_pem(&pem)?;
        Ok(compress_point(&point))
    }

    /// Exchange a collection header for its symmetric key.
    pub async fn rewrap(
        &self,
        header_bytes: &[u8],
        policy_body: &[u8],
        bearer_token: &str,
    ) -> Result<Zeroizing<[u8; 32]>, KasError> {
        let ephemeral = EphemeralSecret::random(&mut OsRng);
        let client_pem = sec1_pem(&PublicKey::from(&ephemeral));

        let request = serde_json::json!({
            "keyAccess": {
                "header": base64::engine::general_purpose::STANDARD.encode(header_bytes),
                "type": "remote",
                "url": self.base_url,
                "protocol": "kas",
            },
            "policy": base64::engine::general_purpose::STANDARD.encode(policy_body),
            "clientPublicKey": client_pem,
            "algorithm": "ec:secp256r1",
        });

        let url = format!("{}{}", self.base_url, REWRAP_PATH);
        tracing::debug!(%url, "rewrap request");
        let resp = self
            .http
            .post(&url)
            .bearer_auth(bearer_token)
            .json(&request)
            .timeout(HTTP_TIMEOUT)
            .send()
            .await
            .map_err(|e| KasError::BadResponse(format!("rewrap request failed: {}", e)))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(KasError::Http(status.as_u16()));
        }
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| KasError::BadResponse(format!("rewrap body: {}", e)))?;

        // Field names vary between deployments; accept the known spellings.
        let wrapped_b64 = body
            .get("entityWrappedKey")
            .or_else(|| body.get("wrappedKey"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| KasError::BadResponse("no wrapped key in response".into()))?;
        let session_pem = body
            .get("sessionPublicKey")
            .or_else(|| body.get("sessionPublicKeyPem"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| KasError::BadResponse("no session public key in response".into()))?;

        let wrapped = base64::engine::general_purpose::STANDARD
            .decode(wrapped_b64)
            .map_err(|e| KasError::BadResponse(format!("wrapped key base64: {}", e)))?;
        let session_point = parse_public_key_pem(session_pem)?;
        let session_key = PublicKey::from_sec1_bytes(&session_point)
            .map_err(|_| KasError::BadResponse("session key is not a P-256 point".into()))?;

        let shared = ephemeral.diffie_hellman(&session_key);
        let kek = derive_symmetric_key(shared.raw_secret_bytes().as_slice());
        unwrap_key(&kek, &wrapped)
    }
}

/// PEM framing the KAS expects from clients: base64 of the raw SEC1
/// uncompressed point, no SPKI wrapper. Replicated bit for bit.
pub(crate) fn sec1_pem(key: &PublicKey) -> String {
    let point = key.to_encoded_point(false);
    let b64 = base64::engine::general_purpose::STANDARD.encode(point.as_bytes());
    format!("-----BEGIN PUBLIC KEY-----\n{}-----END PUBLIC KEY-----", b64)
}

/// Accepts both PEM body shapes KAS deployments emit: the raw 65-byte SEC1
/// point, or SPKI DER with its 26-byte prefix.
pub(crate) fn parse_public_key_pem(pem: &str) -> Result<Vec<u8>, KasError> {
    // Armor lines start with dashes; the client framing also puts base64 and
    // the END armor on one line, so strip from the first dashes onward.
    let b64: String = pem
        .lines()
        .map(|line| line.split("-----").next().unwrap_or(""))
        .collect();
    let der = base64::engine::general_purpose::STANDARD
        .decode(b64.trim())
        .map_err(|e| KasError::BadResponse(format!("PEM base64: {}", e)))?;

    let point = match der.len() {
        SEC1_UNCOMPRESSED_LEN => der,
        SPKI_EC_LEN => der[SPKI_EC_LEN - SEC1_UNCOMPRESSED_LEN..].to_vec(),
        other => {
            return Err(KasError::BadResponse(format!(
                "public key body of {} bytes",
                other
            )))
        }
    };
    if point[0] != 0x04 {
        return Err(KasError::BadResponse(
            "public key is not an uncompressed point".into(),
        ));
    }
    Ok(point)
}

fn compress_point(sec1_uncompressed: &[u8]) -> [u8; 33] {
    let key = PublicKey::from_sec1_bytes(sec1_uncompressed)
        .expect("length and tag checked by the PEM parser");
    let compressed = key.to_encoded_point(true);
    let mut out = [0u8; 33];
    out.copy_from_slice(compressed.as_bytes());
    out
}

/// Open `nonce || ciphertext || tag` under the KEK; the plaintext must be a
/// 32-byte collection key.
fn unwrap_key(kek: &[u8; 32], wrapped: &[u8]) -> Result<Zeroizing<[u8; 32]>, KasError> {
    if wrapped.len() < WRAP_NONCE_LEN + 16 {
        return Err(KasError::BadResponse(format!(
            "wrapped key of {} bytes",
            wrapped.len()
        )));
    }
    let (nonce, sealed) = wrapped.split_at(WRAP_NONCE_LEN);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(kek));
    let plain = cipher
        .decrypt(Nonce::from_slice(nonce), sealed)
        .map_err(|_| KasError::UnwrapAuthFailed)?;
    if plain.len() != 32 {
        return Err(KasError::BadResponse(format!(
            "unwrapped key of {} bytes",
            plain.len()
        )));
    }
    let mut key = Zeroizing::new([0u8; 32]);
    key.copy_from_slice(&plain);
    Ok(key)
}

#[cfg(test)]
pub(crate) mod testsupport {
    //! A scripted single-request KAS speaking just enough HTTP/1.1 for the
    //! client, with a real keypair and a real rewrap derivation.

    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    pub struct ScriptedKas {
        pub secret: p256::SecretKey,
        pub base_url: String,
        listener: TcpListener,
    }

    impl ScriptedKas {
        pub async fn start() -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let base_url = format!("http://127.0.0.1:{}", listener.local_addr().unwrap().port());
            Self {
                secret: p256::SecretKey::random(&mut OsRng),
                base_url,
                listener,
            }
        }

        pub fn public_key_pem_spki_shape(&self) -> String {
            // SPKI body: 26-byte P-256 prefix + uncompressed point.
            const SPKI_PREFIX: [u8; 26] = [
                0x30, 0x59, 0x30, 0x13, 0x06, 0x07, 0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x02, 0x01,
                0x06, 0x08, 0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x03, 0x01, 0x07, 0x03, 0x42, 0x00,
            ];
            let point = self.secret.public_key().to_encoded_point(false);
            let mut body = SPKI_PREFIX.to_vec();
            body.extend_from_slice(point.as_bytes());
            let b64 = base64::engine::general_purpose::STANDARD.encode(body);
            format!("-----BEGIN PUBLIC KEY-----\n{}\n-----END PUBLIC KEY-----\n", b64)
        }

        /// Serve requests until the task is dropped.
        pub async fn serve_forever(&self) {
            loop {
                self.serve_one(None).await;
            }
        }

        /// Serve exactly one request: either the public-key GET or a rewrap
        /// POST. Returns the bearer token seen, if any.
        pub async fn serve_one(&self, expect_token: Option<&str>) {
            let (mut stream, _) = self.listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 4096];
            let (head, body_start) = loop {
                let n = stream.read(&mut buf).await.unwrap();
                assert!(n > 0, "client closed mid-request");
                raw.extend_from_slice(&buf[..n]);
                if let Some(pos) = find_header_end(&raw) {
                    break (String::from_utf8_lossy(&raw[..pos]).to_string(), pos + 4);
                }
            };

            let response = if head.starts_with("GET") {
                assert!(head.contains("/kas/v2/kas_public_key"));
                assert!(head.contains("algorithm=ec"));
                json_response(&serde_json::json!({
                    "publicKey": self.public_key_pem_spki_shape(),
                }))
            } else {
                assert!(head.starts_with("POST"));
                assert!(head.contains("/kas/v2/rewrap"));
                if let Some(token) = expect_token {
                    assert!(
                        head.contains(&format!("authorization: Bearer {}", token))
                            || head.contains(&format!("Authorization: Bearer {}", token)),
                        "bearer token missing from: {}",
                        head
                    );
                }

                let content_length: usize = head
                    .lines()
                    .find_map(|l| {
                        let l = l.to_ascii_lowercase();
                        l.strip_prefix("content-length:").map(|v| v.trim().parse().unwrap())
                    })
                    .expect("content-length");
                let mut body = raw[body_start..].to_vec();
                while body.len() < content_length {
                    let n = stream.read(&mut buf).await.unwrap();
                    assert!(n > 0);
                    body.extend_from_slice(&buf[..n]);
                }

                self.rewrap_response(&body)
            };

            stream.write_all(response.as_bytes()).await.unwrap();
            stream.shutdown().await.unwrap();
        }

        /// Real KAS math: recover the collection key from the header's
        /// ephemeral point, then wrap it for the client's ephemeral key.
        fn rewrap_response(&self, body: &[u8]) -> String {
            let request: serde_json::Value = serde_json::from_slice(body).unwrap();
            let header_b64 = request["keyAccess"]["header"].as_str().unwrap();
            let header_bytes = base64::engine::general_purpose::STANDARD
                .decode(header_b64)
                .unwrap();
            let header = crate::ntdf::header::NtdfHeader::parse(&header_bytes).unwrap();

            // Collection key = ECDH(kas_secret, publisher ephemeral).
            let publisher_eph =
                PublicKey::from_sec1_bytes(&header.ephemeral_public_key).unwrap();
            let shared = p256::ecdh::diffie_hellman(
                self.secret.to_nonzero_scalar(),
                publisher_eph.as_affine(),
            );
            let collection_key = derive_symmetric_key(shared.raw_secret_bytes().as_slice());

            // KEK = ECDH(session ephemeral, client ephemeral).
            let client_pem = request["clientPublicKey"].as_str().unwrap();
            let client_point = parse_public_key_pem(client_pem).unwrap();
            let client_key = PublicKey::from_sec1_bytes(&client_point).unwrap();
            let session = EphemeralSecret::random(&mut OsRng);
            let session_pub = PublicKey::from(&session);
            let shared = session.diffie_hellman(&client_key);
            let kek = derive_symmetric_key(shared.raw_secret_bytes().as_slice());

            // Wrap: nonce || ciphertext || tag.
            let mut nonce = [0u8; WRAP_NONCE_LEN];
            getrandom::getrandom(&mut nonce).unwrap();
            let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(kek.as_slice()));
            let sealed = cipher
                .encrypt(Nonce::from_slice(&nonce), collection_key.as_slice())
                .unwrap();
            let mut wrapped = nonce.to_vec();
            wrapped.extend_from_slice(&sealed);

            json_response(&serde_json::json!({
                "entityWrappedKey": base64::engine::general_purpose::STANDARD.encode(wrapped),
                "sessionPublicKey": sec1_pem(&session_pub),
                "metadata": {},
            }))
        }
    }

    fn find_header_end(raw: &[u8]) -> Option<usize> {
        raw.windows(4).position(|w| w == b"\r\n\r\n")
    }

    fn json_response(body: &serde_json::Value) -> String {
        let text = body.to_string();
        format!(
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            text.len(),
            text
        )
    }
}

#[cfg(test)]
mod tests {
    use super::testsupport::ScriptedKas;
    use super::*;
    use crate::ntdf::collection::Collection;

    #[test]
    fn test_sec1_pem_exact_framing() {
        let secret = p256::SecretKey::random(&mut OsRng);
        let pem = sec1_pem(&secret.public_key());
        assert!(pem.starts_with("-----BEGIN PUBLIC KEY-----\n"));
        // No newline between the base64 and the END armor.
        assert!(pem.ends_with("-----END PUBLIC KEY-----"));
        assert!(!pem.contains("\n-----END"));

        let point = parse_public_key_pem(&pem).unwrap();
        assert_eq!(point.len(), 65);
        assert_eq!(point[0], 0x04);
    }

    #[test]
    fn test_parse_spki_shape() {
        let secret = p256::SecretKey::random(&mut OsRng);
        let raw_point = secret.public_key().to_encoded_point(false);
        const SPKI_PREFIX: [u8; 26] = [
            0x30, 0x59, 0x30, 0x13, 0x06, 0x07, 0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x02, 0x01, 0x06,
            0x08, 0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x03, 0x01, 0x07, 0x03, 0x42, 0x00,
        ];
        let mut body = SPKI_PREFIX.to_vec();
        body.extend_from_slice(raw_point.as_bytes());
        let pem = format!(
            "-----BEGIN PUBLIC KEY-----\n{}\n-----END PUBLIC KEY-----\n",
            base64::engine::general_purpose::STANDARD.encode(body)
        );
        assert_eq!(parse_public_key_pem(&pem).unwrap(), raw_point.as_bytes());
    }

    #[test]
    fn test_parse_rejects_other_lengths() {
        let pem = format!(
            "-----BEGIN PUBLIC KEY-----\n{}\n-----END PUBLIC KEY-----\n",
            base64::engine::general_purpose::STANDARD.encode([0u8; 40])
        );
        assert!(matches!(
            parse_public_key_pem(&pem),
            Err(KasError::BadResponse(_))
        ));
    }

    #[test]
    fn test_unwrap_rejects_tampering() {
        let kek = [7u8; 32];
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&kek));
        let sealed = cipher
            .encrypt(Nonce::from_slice(&[0u8; 12]), [9u8; 32].as_slice())
            .unwrap();
        let mut wrapped = vec![0u8; 12];
        wrapped.extend_from_slice(&sealed);

        assert_eq!(*unwrap_key(&kek, &wrapped).unwrap(), [9u8; 32]);

        let last = wrapped.len() - 1;
        wrapped[last] ^= 1;
        assert!(matches!(
            unwrap_key(&kek, &wrapped),
            Err(KasError::UnwrapAuthFailed)
        ));
    }

    #[tokio::test]
    async fn test_fetch_public_key_compresses() {
        let kas = ScriptedKas::start().await;
        let client = KasClient::new(&kas.base_url);
        let serve = kas.serve_one(None);
        let (_, fetched) = tokio::join!(serve, client.fetch_public_key());
        let compressed = fetched.unwrap();
        let expected = kas.secret.public_key().to_encoded_point(true);
        assert_eq!(&compressed[..], expected.as_bytes());
    }

    #[tokio::test]
    async fn test_rewrap_returns_the_collection_key() {
        let kas = ScriptedKas::start().await;
        let kas_pub = kas.secret.public_key().to_encoded_point(true);
        let mut kas_pub_bytes = [0u8; 33];
        kas_pub_bytes.copy_from_slice(kas_pub.as_bytes());

        // Publisher side: a collection minted against the KAS public key.
        let mut collection =
            Collection::create(&kas.base_url, &kas_pub_bytes, None).unwrap();
        let item = collection.encrypt(b"round trip through the KAS").unwrap();

        // Subscriber side: rewrap via the scripted KAS.
        let client = KasClient::new(&kas.base_url);
        let header = collection.header_bytes().to_vec();
        let policy = collection.header().policy.body.clone();
        let serve = kas.serve_one(Some("viewer-token"));
        let (_, key) = tokio::join!(serve, client.rewrap(&header, &policy, "viewer-token"));
        let key = key.unwrap();

        let mut decryptor =
            crate::ntdf::collection::CollectionDecryptor::new(header, key).unwrap();
        assert_eq!(
            decryptor.decrypt(&item).unwrap(),
            b"round trip through the KAS"
        );
    }
}
