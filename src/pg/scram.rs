//! SCRAM-SHA-256 authentication implementation.
//!
//! Implements RFC 5802 (SCRAM) and RFC 7677 (SCRAM-SHA-256) for PostgreSQL,
//! without channel binding. The username in the client-first message is `*`
//! because the server takes it from the startup packet.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

use crate::crypto::{self, DIGEST_LEN};

/// Mechanism name announced in the SASL initial response.
pub const MECHANISM: &str = "SCRAM-SHA-256";

/// GS2 header: no channel binding, no authzid.
const GS2_HEADER: &str = "n,,";

/// base64 of the GS2 header, echoed back in `c=`.
const CHANNEL_BINDING: &str = "biws";

const NONCE_LEN: usize = 32;

/// Per-attempt SCRAM-SHA-256 client state. Never reused across connections.
pub struct ScramSession {
    password: String,
    client_nonce: String,
    client_first_bare: String,
    /// Set once the server-first message has been accepted.
    verified: Option<Verified>,
}

struct Verified {
    salted_password: [u8; DIGEST_LEN],
    auth_message: String,
}

impl ScramSession {
    /// Start a session with a fresh random nonce.
    pub fn new(password: &str) -> Result<Self, ScramError> {
        let nonce_bytes = crypto::random_bytes::<NONCE_LEN>()
            .map_err(|e| ScramError::Random(e.to_string()))?;
        Ok(Self::with_nonce("*", password, BASE64.encode(nonce_bytes)))
    }

    /// Start a session with a caller-chosen username and nonce.
    pub fn with_nonce(username: &str, password: &str, client_nonce: impl Into<String>) -> Self {
        let client_nonce = client_nonce.into();
        let client_first_bare = format!("n={},r={}", username, client_nonce);
        Self {
            password: password.to_string(),
            client_nonce,
            client_first_bare,
            verified: None,
        }
    }

    /// Client-first message: `n,,n=<user>,r=<nonce>`.
    pub fn client_first_message(&self) -> Vec<u8> {
        format!("{}{}", GS2_HEADER, self.client_first_bare).into_bytes()
    }

    /// Process the server-first message and produce the client-final message.
    ///
    /// Server message format: `r=<nonce>,s=<salt>,i=<iterations>`
    pub fn handle_server_first(&mut self, server_msg: &[u8]) -> Result<Vec<u8>, ScramError> {
        let server_first =
            std::str::from_utf8(server_msg).map_err(|_| ScramError::InvalidServerMessage)?;

        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;

        for part in server_first.split(',') {
            if let Some(value) = part.strip_prefix("r=") {
                nonce = Some(value);
            } else if let Some(value) = part.strip_prefix("s=") {
                salt = Some(BASE64.decode(value).map_err(|_| ScramError::InvalidSalt)?);
            } else if let Some(value) = part.strip_prefix("i=") {
                let count = value
                    .parse::<u32>()
                    .map_err(|_| ScramError::InvalidIterations)?;
                if count == 0 {
                    return Err(ScramError::InvalidIterations);
                }
                iterations = Some(count);
            }
        }

        let combined_nonce = nonce.ok_or(ScramError::MissingNonce)?;
        let salt = salt.ok_or(ScramError::MissingSalt)?;
        let iterations = iterations.ok_or(ScramError::MissingIterations)?;

        if combined_nonce.len() <= self.client_nonce.len()
            || !combined_nonce.starts_with(&self.client_nonce)
        {
            return Err(ScramError::NonceVerificationFailed);
        }

        let salted_password =
            crypto::pbkdf2_hmac_sha256(self.password.as_bytes(), &salt, iterations);

        let client_key = crypto::hmac_sha256(&salted_password, b"Client Key");
        let stored_key = crypto::sha256(&client_key);

        let client_final_without_proof = format!("c={},r={}", CHANNEL_BINDING, combined_nonce);
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare, server_first, client_final_without_proof
        );

        let client_signature = crypto::hmac_sha256(&stored_key, auth_message.as_bytes());
        let mut client_proof = client_key;
        crypto::xor_in_place(&mut client_proof, &client_signature);

        self.verified = Some(Verified {
            salted_password,
            auth_message,
        });

        Ok(format!(
            "{},p={}",
            client_final_without_proof,
            BASE64.encode(client_proof)
        )
        .into_bytes())
    }

    /// Verify the server-final message (`v=<signature>` or `e=<error>`).
    pub fn verify_server_final(&self, server_msg: &[u8]) -> Result<(), ScramError> {
        let server_final =
            std::str::from_utf8(server_msg).map_err(|_| ScramError::InvalidServerMessage)?;

        let verified = self.verified.as_ref().ok_or(ScramError::InvalidState)?;

        let mut signature = None;
        for part in server_final.split(',') {
            if let Some(value) = part.strip_prefix("e=") {
                return Err(ScramError::ServerError(value.to_string()));
            } else if let Some(value) = part.strip_prefix("v=") {
                signature = Some(value);
            }
        }

        let server_signature = BASE64
            .decode(signature.ok_or(ScramError::InvalidServerSignature)?)
            .map_err(|_| ScramError::InvalidServerSignature)?;

        let server_key = crypto::hmac_sha256(&verified.salted_password, b"Server Key");
        let expected = crypto::hmac_sha256(&server_key, verified.auth_message.as_bytes());

        if !constant_time_eq(&server_signature, &expected) {
            return Err(ScramError::ServerSignatureVerificationFailed);
        }

        Ok(())
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// SCRAM authentication errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScramError {
    InvalidServerMessage,
    InvalidSalt,
    InvalidIterations,
    MissingNonce,
    MissingSalt,
    MissingIterations,
    NonceVerificationFailed,
    InvalidServerSignature,
    ServerSignatureVerificationFailed,
    ServerError(String),
    InvalidState,
    Random(String),
}

impl std::fmt::Display for ScramError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidServerMessage => write!(f, "Invalid server message"),
            Self::InvalidSalt => write!(f, "Invalid salt encoding"),
            Self::InvalidIterations => write!(f, "Invalid iteration count"),
            Self::MissingNonce => write!(f, "Missing nonce in server message"),
            Self::MissingSalt => write!(f, "Missing salt in server message"),
            Self::MissingIterations => write!(f, "Missing iterations in server message"),
            Self::NonceVerificationFailed => write!(f, "Server nonce verification failed"),
            Self::InvalidServerSignature => write!(f, "Invalid server signature"),
            Self::ServerSignatureVerificationFailed => {
                write!(f, "server authentication failed")
            }
            Self::ServerError(e) => write!(f, "Server rejected authentication: {}", e),
            Self::InvalidState => write!(f, "Invalid SCRAM state"),
            Self::Random(e) => write!(f, "Cannot generate nonce: {}", e),
        }
    }
}

impl std::error::Error for ScramError {}
