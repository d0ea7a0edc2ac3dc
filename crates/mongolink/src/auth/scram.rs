//! SCRAM-SHA-1 / SCRAM-SHA-256 client (RFC 5802, RFC 7677)
//!
//! `ScramSession` only produces and checks payloads; carrying them over
//! `saslStart`/`saslContinue` is the authenticator's job.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use rand::Rng;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use mongolink_common::{AuthError, AuthMechanism, Credentials};

/// Servers must not ask for fewer PBKDF2 rounds than this
pub const MIN_ITERATIONS: u32 = 4096;

/// `AuthenticationFailed`
const AUTH_FAILED_CODE: i32 = 18;

const CLIENT_NONCE_BYTES: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScramStep {
    Idle,
    ClientFirstSent,
    ServerFirstReceived,
    ClientFinalSent,
    Complete,
    Failed,
}

pub struct ScramSession {
    mechanism: AuthMechanism,
    username: String,
    password: String,
    client_nonce: String,
    step: ScramStep,
    client_first_bare: String,
    auth_message: String,
    server_key: Vec<u8>,
}

impl ScramSession {
    pub fn new(mechanism: AuthMechanism, credentials: &Credentials) -> Self {
        let nonce: [u8; CLIENT_NONCE_BYTES] = rand::thread_rng().gen();
        let password = prepare_password(mechanism, &credentials.username, &credentials.password);
        Self::with_nonce(mechanism, &credentials.username, password, BASE64.encode(nonce))
    }

    /// Build a session from an already-prepared password and a fixed nonce
    pub fn with_nonce(
        mechanism: AuthMechanism,
        username: &str,
        prepared_password: impl Into<String>,
        client_nonce: impl Into<String>,
    ) -> Self {
        Self {
            mechanism,
            username: escape_username(username),
            password: prepared_password.into(),
            client_nonce: client_nonce.into(),
            step: ScramStep::Idle,
            client_first_bare: String::new(),
            auth_message: String::new(),
            server_key: Vec::new(),
        }
    }

    pub fn mechanism(&self) -> AuthMechanism {
        self.mechanism
    }

    pub fn step(&self) -> ScramStep {
        self.step
    }

    pub fn is_complete(&self) -> bool {
        self.step == ScramStep::Complete
    }

    /// `n,,n=<user>,r=<client nonce>`
    pub fn client_first(&mut self) -> Result<String, AuthError> {
        self.expect_step(ScramStep::Idle)?;
        self.client_first_bare = format!("n={},r={}", self.username, self.client_nonce);
        self.step = ScramStep::ClientFirstSent;
        Ok(format!("n,,{}", self.client_first_bare))
    }

    /// Consume the server-first message and produce the client-final message
    pub fn handle_server_first(&mut self, server_first: &str) -> Result<String, AuthError> {
        self.expect_step(ScramStep::ClientFirstSent)?;
        let outcome = self.client_final(server_first);
        self.advance(outcome, ScramStep::ClientFinalSent)
    }

    /// Verify the server signature
    pub fn handle_server_final(&mut self, server_final: &str) -> Result<(), AuthError> {
        self.expect_step(ScramStep::ClientFinalSent)?;
        let outcome = self.verify_server_final(server_final);
        self.advance(outcome, ScramStep::Complete)
    }

    fn client_final(&mut self, server_first: &str) -> Result<String, AuthError> {
        let fields = Fields::parse(server_first)?;
        fields.check_error()?;

        let nonce = fields.require('r')?;
        if !nonce.starts_with(&self.client_nonce) || nonce.len() == self.client_nonce.len() {
            return Err(AuthError::InvalidNonce);
        }
        let salt = BASE64
            .decode(fields.require('s')?)
            .map_err(|e| AuthError::MalformedMessage(format!("salt is not base64: {e}")))?;
        let iterations: u32 = fields
            .require('i')?
            .parse()
            .map_err(|_| AuthError::MalformedMessage("iteration count is not a number".to_string()))?;
        if iterations < MIN_ITERATIONS {
            return Err(AuthError::MalformedMessage(format!(
                "iteration count {iterations} below minimum {MIN_ITERATIONS}"
            )));
        }
        self.step = ScramStep::ServerFirstReceived;

        let salted = hi(self.mechanism, self.password.as_bytes(), &salt, iterations);
        let client_key = hmac(self.mechanism, &salted, b"Client Key")?;
        let stored_key = hash(self.mechanism, &client_key);

        let without_proof = format!("c=biws,r={nonce}");
        self.auth_message = format!("{},{},{}", self.client_first_bare, server_first, without_proof);

        let client_signature = hmac(self.mechanism, &stored_key, self.auth_message.as_bytes())?;
        let proof: Vec<u8> = client_key
            .iter()
            .zip(&client_signature)
            .map(|(k, s)| k ^ s)
            .collect();
        self.server_key = hmac(self.mechanism, &salted, b"Server Key")?;

        Ok(format!("{without_proof},p={}", BASE64.encode(proof)))
    }

    fn verify_server_final(&self, server_final: &str) -> Result<(), AuthError> {
        let fields = Fields::parse(server_final)?;
        fields.check_error()?;

        let signature = BASE64
            .decode(fields.require('v')?)
            .map_err(|_| AuthError::ServerSignatureInvalid)?;
        if verify_hmac(self.mechanism, &self.server_key, self.auth_message.as_bytes(), &signature)? {
            Ok(())
        } else {
            Err(AuthError::ServerSignatureInvalid)
        }
    }

    fn expect_step(&mut self, expected: ScramStep) -> Result<(), AuthError> {
        if self.step == expected {
            return Ok(());
        }
        self.step = ScramStep::Failed;
        Err(AuthError::InvalidState(match expected {
            ScramStep::Idle => "conversation already started",
            ScramStep::ClientFirstSent => "server-first received out of order",
            _ => "server-final received out of order",
        }))
    }

    fn advance<T>(&mut self, outcome: Result<T, AuthError>, next: ScramStep) -> Result<T, AuthError> {
        self.step = if outcome.is_ok() { next } else { ScramStep::Failed };
        outcome
    }
}

impl std::fmt::Debug for ScramSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScramSession")
            .field("mechanism", &self.mechanism)
            .field("username", &self.username)
            .field("step", &self.step)
            .finish_non_exhaustive()
    }
}

/// SCRAM-SHA-1 hashes the MONGODB-CR digest instead of the raw password
pub fn prepare_password(mechanism: AuthMechanism, username: &str, password: &str) -> String {
    match mechanism {
        AuthMechanism::ScramSha1 => {
            format!("{:x}", md5::compute(format!("{username}:mongo:{password}")))
        }
        AuthMechanism::ScramSha256 => password.to_string(),
    }
}

/// `=` and `,` are reserved in SCRAM attribute values
pub fn escape_username(username: &str) -> String {
    username.replace('=', "=3D").replace(',', "=2C")
}

/// `k=v` attributes of a SCRAM message, in order
struct Fields<'a>(Vec<(char, &'a str)>);

impl<'a> Fields<'a> {
    fn parse(message: &'a str) -> Result<Self, AuthError> {
        message
            .split(',')
            .map(|part| {
                let mut chars = part.chars();
                match (chars.next(), chars.next()) {
                    (Some(key), Some('=')) if key.is_ascii_alphabetic() => Ok((key, &part[2..])),
                    _ => Err(AuthError::MalformedMessage(format!("bad attribute {part:?}"))),
                }
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Fields)
    }

    fn get(&self, key: char) -> Option<&'a str> {
        self.0.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
    }

    fn require(&self, key: char) -> Result<&'a str, AuthError> {
        self.get(key)
            .ok_or_else(|| AuthError::MalformedMessage(format!("missing attribute {key}")))
    }

    /// `e=` carries a server-side failure
    fn check_error(&self) -> Result<(), AuthError> {
        match self.get('e') {
            Some(message) => Err(AuthError::Rejected {
                code: AUTH_FAILED_CODE,
                message: message.to_string(),
            }),
            None => Ok(()),
        }
    }
}

/// PBKDF2 (`Hi` in the RFC)
fn hi(mechanism: AuthMechanism, password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
    match mechanism {
        AuthMechanism::ScramSha1 => {
            let mut out = [0u8; 20];
            pbkdf2::pbkdf2_hmac::<Sha1>(password, salt, iterations, &mut out);
            out.to_vec()
        }
        AuthMechanism::ScramSha256 => {
            let mut out = [0u8; 32];
            pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut out);
            out.to_vec()
        }
    }
}

fn hmac(mechanism: AuthMechanism, key: &[u8], data: &[u8]) -> Result<Vec<u8>, AuthError> {
    Ok(match mechanism {
        AuthMechanism::ScramSha1 => keyed::<Hmac<Sha1>>(key, data)?.finalize().into_bytes().to_vec(),
        AuthMechanism::ScramSha256 => {
            keyed::<Hmac<Sha256>>(key, data)?.finalize().into_bytes().to_vec()
        }
    })
}

/// Constant-time comparison against an expected signature
fn verify_hmac(mechanism: AuthMechanism, key: &[u8], data: &[u8], expected: &[u8]) -> Result<bool, AuthError> {
    Ok(match mechanism {
        AuthMechanism::ScramSha1 => keyed::<Hmac<Sha1>>(key, data)?.verify_slice(expected).is_ok(),
        AuthMechanism::ScramSha256 => keyed::<Hmac<Sha256>>(key, data)?.verify_slice(expected).is_ok(),
    })
}

fn keyed<M: Mac + KeyInit>(key: &[u8], data: &[u8]) -> Result<M, AuthError> {
    let mut mac = <M as Mac>::new_from_slice(key)
        .map_err(|e| AuthError::MalformedMessage(format!("unusable HMAC key: {e}")))?;
    mac.update(data);
    Ok(mac)
}

fn hash(mechanism: AuthMechanism, data: &[u8]) -> Vec<u8> {
    match mechanism {
        AuthMechanism::ScramSha1 => Sha1::digest(data).to_vec(),
        AuthMechanism::ScramSha256 => Sha256::digest(data).to_vec(),
    }
}
