//! Per-session key material.
//!
//! Each session owns a fresh X25519 keypair, a client nonce, and a
//! client-chosen downlink SPI. The egress response delivers the server's
//! public value and nonce; once bound, transform keys for the datapath
//! are derived with HKDF-SHA256 over the shared secret, salted with both
//! nonces. The datapath consumes the derived keys; the AEAD itself lives
//! behind the datapath seam.

use crate::status::Status;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use std::fmt;
use x25519_dalek::{PublicKey, StaticSecret};

/// Length of the client nonce in bytes.
const NONCE_SIZE: usize = 16;

/// HKDF info string for transform key derivation.
const TRANSFORM_INFO: &[u8] = b"krypton dataplane transform";

/// Encryption suite the datapath is parameterized with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CryptoSuite {
    #[default]
    Aes128Gcm,
    Aes256Gcm,
}

impl CryptoSuite {
    /// Key length in bytes for this suite.
    pub fn key_bytes(&self) -> usize {
        match self {
            CryptoSuite::Aes128Gcm => 16,
            CryptoSuite::Aes256Gcm => 32,
        }
    }
}

impl fmt::Display for CryptoSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CryptoSuite::Aes128Gcm => "AES128_GCM",
            CryptoSuite::Aes256Gcm => "AES256_GCM",
        };
        write!(f, "{}", s)
    }
}

/// Public half of the session's key material, base64-encoded for the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyMaterial {
    pub public_value: String,
    pub nonce: String,
}

/// Uplink/downlink transform keys handed to the datapath.
#[derive(Clone, PartialEq, Eq)]
pub struct TransformParams {
    pub uplink_key: Vec<u8>,
    pub downlink_key: Vec<u8>,
    pub uplink_spi: u32,
    pub downlink_spi: u32,
}

impl fmt::Debug for TransformParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Key bytes stay out of logs.
        f.debug_struct("TransformParams")
            .field("uplink_key_len", &self.uplink_key.len())
            .field("downlink_key_len", &self.downlink_key.len())
            .field("uplink_spi", &self.uplink_spi)
            .field("downlink_spi", &self.downlink_spi)
            .finish()
    }
}

/// X25519 key agreement state for one session (or one rekey generation).
pub struct SessionCrypto {
    secret: StaticSecret,
    public: PublicKey,
    nonce: [u8; NONCE_SIZE],
    downlink_spi: u32,
    remote_public: Option<PublicKey>,
    remote_nonce: Option<Vec<u8>>,
}

impl SessionCrypto {
    /// Generate a fresh keypair, nonce, and downlink SPI.
    pub fn new() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);
        // SPI zero is reserved on the wire.
        let downlink_spi = loop {
            let spi = OsRng.next_u32();
            if spi != 0 {
                break spi;
            }
        };

        Self {
            secret,
            public,
            nonce,
            downlink_spi,
            remote_public: None,
            remote_nonce: None,
        }
    }

    /// This session's public value and nonce, base64-encoded.
    pub fn my_key_material(&self) -> KeyMaterial {
        KeyMaterial {
            public_value: BASE64.encode(self.public.as_bytes()),
            nonce: BASE64.encode(self.nonce),
        }
    }

    /// Base64 of this session's public value.
    pub fn public_value_base64(&self) -> String {
        BASE64.encode(self.public.as_bytes())
    }

    /// The client-chosen downlink SPI.
    pub fn downlink_spi(&self) -> u32 {
        self.downlink_spi
    }

    /// Bind the server's public value and nonce from the egress response.
    pub fn set_remote_key_material(
        &mut self,
        public_value: &str,
        nonce: &str,
    ) -> Result<(), Status> {
        let public_bytes = BASE64
            .decode(public_value)
            .map_err(|e| Status::invalid_argument(format!("bad remote public value: {}", e)))?;
        let public_bytes: [u8; 32] = public_bytes.try_into().map_err(|v: Vec<u8>| {
            Status::invalid_argument(format!("remote public value is {} bytes, want 32", v.len()))
        })?;
        let nonce_bytes = BASE64
            .decode(nonce)
            .map_err(|e| Status::invalid_argument(format!("bad remote nonce: {}", e)))?;
        if nonce_bytes.is_empty() {
            return Err(Status::invalid_argument("empty remote nonce"));
        }

        self.remote_public = Some(PublicKey::from(public_bytes));
        self.remote_nonce = Some(nonce_bytes);
        Ok(())
    }

    /// Whether remote key material has been bound.
    pub fn has_remote_key_material(&self) -> bool {
        self.remote_public.is_some()
    }

    /// Base64 of the bound remote public value, if any.
    pub fn remote_public_value_base64(&self) -> Option<String> {
        self.remote_public.as_ref().map(|p| BASE64.encode(p.as_bytes()))
    }

    /// Derive the dataplane transform keys for `suite`.
    ///
    /// Requires remote key material. The uplink SPI is the one assigned by
    /// the egress response; the downlink SPI is ours.
    pub fn transform_params(
        &self,
        suite: CryptoSuite,
        uplink_spi: u32,
    ) -> Result<TransformParams, Status> {
        let remote_public = self
            .remote_public
            .as_ref()
            .ok_or_else(|| Status::failed_precondition("remote key material not set"))?;
        let remote_nonce = self
            .remote_nonce
            .as_ref()
            .ok_or_else(|| Status::failed_precondition("remote key material not set"))?;

        let shared = self.secret.diffie_hellman(remote_public);

        let mut salt = Vec::with_capacity(NONCE_SIZE + remote_nonce.len());
        salt.extend_from_slice(&self.nonce);
        salt.extend_from_slice(remote_nonce);

        let key_len = suite.key_bytes();
        let hk = Hkdf::<Sha256>::new(Some(&salt), shared.as_bytes());
        let mut okm = vec![0u8; key_len * 2];
        hk.expand(TRANSFORM_INFO, &mut okm)
            .map_err(|_| Status::internal("transform key derivation failed"))?;

        let downlink_key = okm.split_off(key_len);
        Ok(TransformParams {
            uplink_key: okm,
            downlink_key,
            uplink_spi,
            downlink_spi: self.downlink_spi,
        })
    }
}

impl Default for SessionCrypto {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SessionCrypto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Secret material never appears in debug output.
        f.debug_struct("SessionCrypto")
            .field("public_value", &self.public_value_base64())
            .field("downlink_spi", &self.downlink_spi)
            .field("has_remote", &self.remote_public.is_some())
            .finish()
    }
}
