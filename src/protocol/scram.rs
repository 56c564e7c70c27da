//! SCRAM-SHA-256 client exchange (RFC 5802 / RFC 7677).
//!
//! Three steps: client-first, client-final in response to the server's
//! challenge, then verification of the server signature.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// SCRAM mechanism name the server must offer.
pub const MECHANISM: &str = "SCRAM-SHA-256";

/// Client side of one SCRAM-SHA-256 exchange.
pub struct ScramExchange {
    username: String,
    password: String,
    client_nonce: String,
    auth_message: Option<String>,
    salted_password: Option<[u8; 32]>,
}

impl ScramExchange {
    pub fn new(username: &str, password: &str) -> Self {
        let nonce_bytes: [u8; 18] = rand::thread_rng().gen();
        Self {
            username: username.to_string(),
            password: password.to_string(),
            client_nonce: BASE64.encode(nonce_bytes),
            auth_message: None,
            salted_password: None,
        }
    }

    /// `n,,n=<user>,r=<nonce>` — the client-first-message.
    pub fn client_first(&self) -> Vec<u8> {
        format!("n,,{}", self.client_first_bare()).into_bytes()
    }

    fn client_first_bare(&self) -> String {
        format!("n={},r={}", self.username, self.client_nonce)
    }

    /// Consume the server's `r=<nonce>,s=<salt>,i=<iterations>` challenge
    /// and produce the client-final-message carrying the proof.
    pub fn client_final(&mut self, server_first: &[u8]) -> Result<Vec<u8>> {
        let server_str = std::str::from_utf8(server_first)
            .map_err(|_| scram_err("server challenge is not UTF-8"))?;

        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for part in server_str.split(',') {
            if let Some(value) = part.strip_prefix("r=") {
                nonce = Some(value.to_string());
            } else if let Some(value) = part.strip_prefix("s=") {
                salt = Some(
                    BASE64
                        .decode(value)
                        .map_err(|_| scram_err("salt is not valid base64"))?,
                );
            } else if let Some(value) = part.strip_prefix("i=") {
                iterations = Some(
                    value
                        .parse::<u32>()
                        .map_err(|_| scram_err("iteration count is not a number"))?,
                );
            }
        }
        let combined_nonce = nonce.ok_or_else(|| scram_err("challenge is missing the nonce"))?;
        let salt = salt.ok_or_else(|| scram_err("challenge is missing the salt"))?;
        let iterations =
            iterations.ok_or_else(|| scram_err("challenge is missing the iteration count"))?;

        if !combined_nonce.starts_with(&self.client_nonce) {
            return Err(scram_err("server nonce does not extend the client nonce"));
        }

        let salted_password = hi(&self.password, &salt, iterations);
        let client_key = hmac_sha256(&salted_password, b"Client Key");
        let stored_key = sha256(&client_key);

        let without_proof = format!("c=biws,r={combined_nonce}");
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare(),
            server_str,
            without_proof
        );

        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes());
        let mut proof = [0u8; 32];
        for (out, (a, b)) in proof
            .iter_mut()
            .zip(client_key.iter().zip(client_signature.iter()))
        {
            *out = a ^ b;
        }

        self.auth_message = Some(auth_message);
        self.salted_password = Some(salted_password);

        Ok(format!("{},p={}", without_proof, BASE64.encode(proof)).into_bytes())
    }

    /// Check the server's `v=<signature>` final message.
    pub fn verify_server(&self, server_final: &[u8]) -> Result<()> {
        let server_str = std::str::from_utf8(server_final)
            .map_err(|_| scram_err("server signature is not UTF-8"))?;
        let verifier = server_str
            .strip_prefix("v=")
            .ok_or_else(|| scram_err("server final message has no signature"))?;
        let server_signature = BASE64
            .decode(verifier)
            .map_err(|_| scram_err("server signature is not valid base64"))?;

        let salted_password = self
            .salted_password
            .ok_or_else(|| scram_err("exchange not yet past the challenge"))?;
        let auth_message = self
            .auth_message
            .as_ref()
            .ok_or_else(|| scram_err("exchange not yet past the challenge"))?;

        let server_key = hmac_sha256(&salted_password, b"Server Key");
        let expected = hmac_sha256(&server_key, auth_message.as_bytes());
        if server_signature != expected {
            return Err(scram_err("server signature mismatch"));
        }
        Ok(())
    }
}

fn scram_err(msg: &str) -> Error {
    Error::Connection(format!("scram auth failed: {msg}"))
}

/// Hi() per RFC 5802: PBKDF2 with HMAC-SHA-256.
fn hi(password: &str, salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut output = [0u8; 32];
    pbkdf2::pbkdf2::<HmacSha256>(password.as_bytes(), salt, iterations, &mut output)
        .expect("valid output length");
    output
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key size");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}
