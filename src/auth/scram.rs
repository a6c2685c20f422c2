//! SCRAM-SHA-256 authentication (RFC 5802, Postgres 10+)
//!
//! The exchange is two round-trips: client-first / server-first, then
//! client-final / server-final. Channel binding is not offered (`n,,`).

use crate::{Error, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Client side of one SCRAM-SHA-256 exchange.
pub struct ScramClient {
    password: String,
    nonce: String,
    /// `client-first-message-bare`, kept for the auth message
    client_first_bare: Option<String>,
    /// Expected server signature, set once the client final message is built
    server_signature: Option<Vec<u8>>,
}

impl ScramClient {
    pub fn new(password: impl Into<String>) -> Self {
        let nonce_bytes: [u8; 18] = rand::thread_rng().gen();
        Self::with_nonce(password, BASE64.encode(nonce_bytes))
    }

    fn with_nonce(password: impl Into<String>, nonce: String) -> Self {
        Self {
            password: password.into(),
            nonce,
            client_first_bare: None,
            server_signature: None,
        }
    }

    /// Build the client first message.
    ///
    /// Postgres ignores the SCRAM username (it comes from the startup
    /// packet), so the `n=` attribute stays empty.
    pub fn client_first(&mut self) -> String {
        let bare = format!("n=,r={}", self.nonce);
        let message = format!("n,,{}", bare);
        self.client_first_bare = Some(bare);
        message
    }

    /// Consume the server first message and build the client final message.
    pub fn client_final(&mut self, server_first: &str) -> Result<String> {
        let bare = self
            .client_first_bare
            .clone()
            .ok_or_else(|| Error::Auth("SCRAM exchange not started".into()))?;

        let (server_nonce, salt_b64, iterations) = parse_server_first(server_first)?;
        if !server_nonce.starts_with(&self.nonce) {
            return Err(Error::Auth(
                "SCRAM server nonce does not extend the client nonce".into(),
            ));
        }

        let salt = BASE64
            .decode(salt_b64)
            .map_err(|_| Error::Auth("invalid base64 salt in SCRAM exchange".into()))?;

        let salted_password = hi(self.password.as_bytes(), &salt, iterations);
        let client_key = hmac(&salted_password, b"Client Key");
        let stored_key = Sha256::digest(&client_key);

        let without_proof = format!("c={},r={}", BASE64.encode(b"n,,"), server_nonce);
        let auth_message = format!("{},{},{}", bare, server_first, without_proof);

        let client_signature = hmac(&stored_key, auth_message.as_bytes());
        let proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(k, s)| k ^ s)
            .collect();

        let server_key = hmac(&salted_password, b"Server Key");
        self.server_signature = Some(hmac(&server_key, auth_message.as_bytes()));

        Ok(format!("{},p={}", without_proof, BASE64.encode(proof)))
    }

    /// Check the server's final message against the expected signature.
    pub fn verify_server_final(&self, server_final: &str) -> Result<()> {
        let expected = self
            .server_signature
            .as_ref()
            .ok_or_else(|| Error::Auth("SCRAM exchange not completed".into()))?;

        let signature_b64 = server_final
            .strip_prefix("v=")
            .ok_or_else(|| Error::Auth(format!("unexpected SCRAM server final: {:?}", server_final)))?;
        let signature = BASE64
            .decode(signature_b64)
            .map_err(|_| Error::Auth("invalid base64 server signature".into()))?;

        if &signature != expected {
            return Err(Error::Auth("SCRAM server signature mismatch".into()));
        }
        Ok(())
    }
}

/// `Hi(password, salt, i)`: PBKDF2-HMAC-SHA-256.
fn hi(password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
    let mut out = vec![0u8; 32];
    pbkdf2::pbkdf2::<HmacSha256>(password, salt, iterations, &mut out)
        .expect("hmac accepts any key length");
    out
}

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Parse `r=<nonce>,s=<salt>,i=<iterations>`.
fn parse_server_first(message: &str) -> Result<(String, String, u32)> {
    let mut nonce = None;
    let mut salt = None;
    let mut iterations = None;

    for attr in message.split(',') {
        match attr.split_once('=') {
            Some(("r", v)) => nonce = Some(v.to_string()),
            Some(("s", v)) => salt = Some(v.to_string()),
            Some(("i", v)) => {
                iterations = Some(v.parse::<u32>().map_err(|_| {
                    Error::Auth(format!("invalid SCRAM iteration count: {:?}", v))
                })?)
            }
            _ => {}
        }
    }

    match (nonce, salt, iterations) {
        (Some(r), Some(s), Some(i)) => Ok((r, s, i)),
        _ => Err(Error::Auth(format!(
            "malformed SCRAM server first message: {:?}",
            message
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_server_first_fields() {
        let (r, s, i) = parse_server_first("r=abcdef,s=c2FsdA==,i=4096").unwrap();
        assert_eq!(r, "abcdef");
        assert_eq!(s, "c2FsdA==");
        assert_eq!(i, 4096);
    }

    #[test]
    fn parse_server_first_rejects_missing_attrs() {
        assert!(parse_server_first("r=abc,s=c2FsdA==").is_err());
        assert!(parse_server_first("garbage").is_err());
    }

    #[test]
    fn rejects_foreign_nonce() {
        let mut client = ScramClient::with_nonce("pw", "clientnonce".into());
        let _ = client.client_first();
        let err = client.client_final("r=stolen,s=c2FsdA==,i=4096");
        assert!(err.is_err());
    }

    #[test]
    fn full_exchange_against_reference_server() {
        // Simulate the server side with the same primitives and check both
        // proofs line up.
        let password = "pencil";
        let salt = b"0123456789ab";
        let iterations = 4096;

        let mut client = ScramClient::with_nonce(password, "cnonce".into());
        let first = client.client_first();
        assert_eq!(first, "n,,n=,r=cnonce");

        let server_nonce = "cnoncesnonce";
        let server_first = format!(
            "r={},s={},i={}",
            server_nonce,
            BASE64.encode(salt),
            iterations
        );
        let client_final = client.client_final(&server_first).unwrap();

        // Server-side verification
        let salted = hi(password.as_bytes(), salt, iterations);
        let client_key = hmac(&salted, b"Client Key");
        let stored_key = Sha256::digest(&client_key);
        let without_proof = format!("c={},r={}", BASE64.encode(b"n,,"), server_nonce);
        let auth_message = format!("n=,r=cnonce,{},{}", server_first, without_proof);

        let proof_b64 = client_final.split(",p=").nth(1).unwrap();
        let proof = BASE64.decode(proof_b64).unwrap();
        let signature = hmac(&stored_key, auth_message.as_bytes());
        let recovered_key: Vec<u8> = proof
            .iter()
            .zip(signature.iter())
            .map(|(p, s)| p ^ s)
            .collect();
        assert_eq!(
            Sha256::digest(&recovered_key).as_slice(),
            stored_key.as_slice()
        );

        // Server final message verifies
        let server_key = hmac(&salted, b"Server Key");
        let server_signature = hmac(&server_key, auth_message.as_bytes());
        let server_final = format!("v={}", BASE64.encode(server_signature));
        client.verify_server_final(&server_final).unwrap();

        // Tampered signature is rejected
        assert!(client.verify_server_final("v=AAAA").is_err());
    }
}
