//! SCRAM-SHA-256 client side of the authentication handshake (RFC 5802 /
//! RFC 7677). The connection drives this through the SASL messages of the
//! handshake; each phase consumes the previous one so messages cannot be
//! replayed out of order.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Mechanism name advertised to the server.
pub const MECHANISM: &str = "SCRAM-SHA-256";

fn auth_err(msg: &str) -> Error {
    Error::Authentication(msg.to_string())
}

/// State after sending client-first, waiting for the server challenge.
pub struct ScramClient {
    username: String,
    password: String,
    client_nonce: String,
}

/// State after sending client-final, waiting for the server signature.
pub struct ScramVerifier {
    salted_password: [u8; 32],
    auth_message: String,
}

impl ScramClient {
    /// Start an exchange. Returns the state machine and the
    /// client-first-message bytes (`n,,n=<user>,r=<nonce>`).
    pub fn start(username: &str, password: &str) -> (ScramClient, Vec<u8>) {
        let nonce_bytes: [u8; 18] = rand::thread_rng().gen();
        let client = ScramClient {
            username: username.to_string(),
            password: password.to_string(),
            client_nonce: BASE64.encode(nonce_bytes),
        };
        let first = format!("n,,{}", client.first_bare()).into_bytes();
        (client, first)
    }

    fn first_bare(&self) -> String {
        format!("n={},r={}", self.username, self.client_nonce)
    }

    /// Consume the server-first-message (`r=<nonce>,s=<salt>,i=<n>`),
    /// producing the client-final-message and the verifier for the server
    /// signature.
    pub fn challenge(self, server_first: &[u8]) -> Result<(ScramVerifier, Vec<u8>)> {
        let server_first = std::str::from_utf8(server_first)
            .map_err(|_| auth_err("server challenge is not UTF-8"))?;

        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for part in server_first.split(',') {
            if let Some(v) = part.strip_prefix("r=") {
                nonce = Some(v.to_string());
            } else if let Some(v) = part.strip_prefix("s=") {
                salt = Some(
                    BASE64
                        .decode(v)
                        .map_err(|_| auth_err("bad salt encoding in server challenge"))?,
                );
            } else if let Some(v) = part.strip_prefix("i=") {
                iterations = Some(
                    v.parse::<u32>()
                        .map_err(|_| auth_err("bad iteration count in server challenge"))?,
                );
            }
        }
        let nonce = nonce.ok_or_else(|| auth_err("server challenge is missing the nonce"))?;
        let salt = salt.ok_or_else(|| auth_err("server challenge is missing the salt"))?;
        let iterations =
            iterations.ok_or_else(|| auth_err("server challenge is missing iterations"))?;

        if !nonce.starts_with(&self.client_nonce) {
            return Err(auth_err("server nonce does not extend the client nonce"));
        }

        let salted_password = hi(&self.password, &salt, iterations);
        let client_key = hmac_sha256(&salted_password, b"Client Key");
        let stored_key = sha256(&client_key);

        let without_proof = format!("c=biws,r={}", nonce);
        let auth_message = format!("{},{},{}", self.first_bare(), server_first, without_proof);

        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes());
        let mut proof = [0u8; 32];
        for (p, (k, s)) in proof
            .iter_mut()
            .zip(client_key.iter().zip(client_signature.iter()))
        {
            *p = k ^ s;
        }

        let client_final = format!("{},p={}", without_proof, BASE64.encode(proof)).into_bytes();
        let verifier = ScramVerifier {
            salted_password,
            auth_message,
        };
        Ok((verifier, client_final))
    }
}

impl ScramVerifier {
    /// Check the server-final-message (`v=<signature>`) against the
    /// expected server signature.
    pub fn verify(self, server_final: &[u8]) -> Result<()> {
        let server_final = std::str::from_utf8(server_final)
            .map_err(|_| auth_err("server signature is not UTF-8"))?;
        let signature = server_final
            .strip_prefix("v=")
            .ok_or_else(|| auth_err("malformed server signature"))?;
        let signature = BASE64
            .decode(signature)
            .map_err(|_| auth_err("bad server signature encoding"))?;

        let server_key = hmac_sha256(&self.salted_password, b"Server Key");
        let expected = hmac_sha256(&server_key, self.auth_message.as_bytes());

        if signature != expected {
            return Err(auth_err("server signature verification failed"));
        }
        Ok(())
    }
}

fn hi(password: &str, salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut out = [0u8; 32];
    pbkdf2::pbkdf2::<HmacSha256>(password.as_bytes(), salt, iterations, &mut out)
        .expect("valid output length");
    out
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exchange_produces_well_formed_messages() {
        let (client, first) = ScramClient::start("admin", "secret");
        let first = String::from_utf8(first).unwrap();
        assert!(first.starts_with("n,,n=admin,r="));

        let client_nonce = first.rsplit("r=").next().unwrap().to_string();
        let server_first = format!(
            "r={}srvnonce,s={},i=4096",
            client_nonce,
            BASE64.encode(b"0123456789abcdef")
        );

        let (_, client_final) = client.challenge(server_first.as_bytes()).unwrap();
        let client_final = String::from_utf8(client_final).unwrap();
        assert!(client_final.starts_with("c=biws,r="));
        assert!(client_final.contains(",p="));
    }

    #[test]
    fn foreign_server_nonce_is_rejected() {
        let (client, _) = ScramClient::start("admin", "secret");
        let server_first = format!("r=unrelated,s={},i=4096", BASE64.encode(b"salt"));
        assert!(client.challenge(server_first.as_bytes()).is_err());
    }

    #[test]
    fn server_signature_round_trip() {
        let (client, first) = ScramClient::start("user", "pencil");
        let first = String::from_utf8(first).unwrap();
        let bare = first.strip_prefix("n,,").unwrap().to_string();
        let client_nonce = first.rsplit("r=").next().unwrap().to_string();

        let salt = b"saltsaltsaltsalt";
        let iterations = 4096;
        let combined = format!("{}srv", client_nonce);
        let server_first = format!("r={},s={},i={}", combined, BASE64.encode(salt), iterations);

        let (verifier, client_final) = client.challenge(server_first.as_bytes()).unwrap();
        let client_final = String::from_utf8(client_final).unwrap();

        // compute the signature the way the server would
        let salted = hi("pencil", salt, iterations);
        let without_proof = client_final.rsplit_once(",p=").unwrap().0;
        let auth_message = format!("{},{},{}", bare, server_first, without_proof);
        let server_key = hmac_sha256(&salted, b"Server Key");
        let signature = hmac_sha256(&server_key, auth_message.as_bytes());
        let server_final = format!("v={}", BASE64.encode(signature));

        verifier.verify(server_final.as_bytes()).unwrap();
    }

    #[test]
    fn bad_server_signature_fails_verification() {
        let (client, first) = ScramClient::start("user", "pencil");
        let first = String::from_utf8(first).unwrap();
        let client_nonce = first.rsplit("r=").next().unwrap().to_string();
        let server_first = format!("r={}x,s={},i=4096", client_nonce, BASE64.encode(b"salt"));
        let (verifier, _) = client.challenge(server_first.as_bytes()).unwrap();
        assert!(verifier
            .verify(format!("v={}", BASE64.encode([0u8; 32])).as_bytes())
            .is_err());
    }
}
