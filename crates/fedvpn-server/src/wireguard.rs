//! WireGuard key handling.
//!
//! The portal never sees the private key: the client generates an X25519
//! keypair per connect, sends only the public half, and folds the private
//! key into the `[Interface]` section of the returned config.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use x25519_dalek::{PublicKey, StaticSecret};

#[derive(Debug, Clone)]
pub struct WgKeyPair {
    /// Base64 private key for the `[Interface]` section.
    pub private: String,
    /// Base64 public key sent to `/connect`.
    pub public: String,
}

pub fn generate_keypair() -> WgKeyPair {
    let secret = StaticSecret::random_from_rng(rand::thread_rng());
    let public = PublicKey::from(&secret);
    WgKeyPair {
        private: STANDARD.encode(secret.to_bytes()),
        public: STANDARD.encode(public.to_bytes()),
    }
}

/// Insert `PrivateKey = …` directly under the `[Interface]` header.
pub fn insert_private_key(config: &str, private_key: &str) -> String {
    let mut out = String::with_capacity(config.len() + private_key.len() + 16);
    let mut inserted = false;
    for line in config.lines() {
        out.push_str(line);
        out.push('\n');
        if !inserted && line.trim().eq_ignore_ascii_case("[interface]") {
            out.push_str("PrivateKey = ");
            out.push_str(private_key);
            out.push('\n');
            inserted = true;
        }
    }
    out
}
