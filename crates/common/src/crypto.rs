//! Tunnel key generation
//!
//! WireGuard keys are x25519 scalars, base64 encoded.

use base64::{engine::general_purpose::STANDARD, Engine};
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};

/// x25519 key pair for the tunnel interface
#[derive(Clone)]
pub struct WireGuardKeyPair {
    pub private_key: String,
    pub public_key: String,
}

impl WireGuardKeyPair {
    /// Generate a new random, clamped key pair
    pub fn generate() -> Self {
        let mut private_key_bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut private_key_bytes);

        private_key_bytes[0] &= 248;
        private_key_bytes[31] &= 127;
        private_key_bytes[31] |= 64;

        let secret = StaticSecret::from(private_key_bytes);
        let public = PublicKey::from(&secret);

        Self {
            private_key: STANDARD.encode(private_key_bytes),
            public_key: STANDARD.encode(public.as_bytes()),
        }
    }
}

impl std::fmt::Debug for WireGuardKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireGuardKeyPair")
            .field("public_key", &self.public_key)
            .finish()
    }
}
