//! meshgate common library
//!
//! Node and join-request types, SQLite storage, pool allocation, topology
//! recompute and the mesh certificate authority.

pub mod allocator;
pub mod crypto;
pub mod db;
pub mod error;
pub mod pki;
pub mod topology;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use allocator::Capacity;
pub use crypto::WireGuardKeyPair;
pub use db::Database;
pub use error::{Error, Exhausted, Result};
pub use pki::{CertificateAuthority, ClientBundle};
pub use types::*;

/// meshgate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default store path
pub fn default_store_path() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".meshgate")
}

/// Default configuration file
pub fn default_config_path() -> std::path::PathBuf {
    default_store_path().join("config.toml")
}

/// Home directory helper
mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(std::path::PathBuf::from)
    }
}
