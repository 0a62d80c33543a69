//! Node identity: a long-term Curve25519 keypair and the 40-bit address
//! derived from the public key.
//!
//! The identity file holds exactly the 32-byte private key and is the only
//! state the agent persists. It is created with mode 0600 under a 0700
//! directory and reused across restarts.

use anyhow::{Context, Result};
use blake2::{Blake2s256, Digest};
use log::info;
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use x25519_dalek::{PublicKey, StaticSecret};

pub const PRIVATE_KEY_SIZE: usize = 32;
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Byte length of a node address (40 bits).
pub const ADDRESS_SIZE: usize = 5;

/// A 40-bit node address derived from the public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address([u8; ADDRESS_SIZE]);

impl Address {
    /// Derives an address from a Curve25519 public key: the first five
    /// bytes of `BLAKE2s(pubkey)`, with a zero first byte forced to 1
    /// (addresses starting 0x00 are reserved).
    pub fn from_public_key(public_key: &[u8; PUBLIC_KEY_SIZE]) -> Self {
        let hash = Blake2s256::digest(public_key);
        let mut addr = [0u8; ADDRESS_SIZE];
        addr.copy_from_slice(&hash[..ADDRESS_SIZE]);
        if addr[0] == 0 {
            addr[0] = 1;
        }
        Address(addr)
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_SIZE] {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}

impl FromStr for Address {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).context("invalid hex address")?;
        if bytes.len() != ADDRESS_SIZE {
            anyhow::bail!("address must be {} bytes, got {}", ADDRESS_SIZE, bytes.len());
        }
        let mut addr = [0u8; ADDRESS_SIZE];
        addr.copy_from_slice(&bytes);
        Ok(Address(addr))
    }
}

/// The local node's keypair and derived address.
#[derive(Clone)]
pub struct Identity {
    pub private_key: [u8; PRIVATE_KEY_SIZE],
    pub public_key: [u8; PUBLIC_KEY_SIZE],
    pub address: Address,
}

impl Identity {
    /// Generate a new random identity.
    pub fn generate() -> Self {
        let mut private_key = [0u8; PRIVATE_KEY_SIZE];
        OsRng.fill_bytes(&mut private_key);
        Self::from_private_key(private_key)
    }

    /// Rebuild an identity from a raw private key. The key is clamped per
    /// Curve25519 convention before the public key is derived, so loading
    /// the same file always yields the same address.
    pub fn from_private_key(mut private_key: [u8; PRIVATE_KEY_SIZE]) -> Self {
        private_key[0] &= 248;
        private_key[31] &= 127;
        private_key[31] |= 64;

        let secret = StaticSecret::from(private_key);
        let public_key = PublicKey::from(&secret).to_bytes();
        let address = Address::from_public_key(&public_key);
        Self {
            private_key,
            public_key,
            address,
        }
    }

    /// Load the identity from `path`, or generate and persist a new one.
    /// A file of the wrong length is treated as absent.
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if let Ok(data) = fs::read(path) {
            if data.len() == PRIVATE_KEY_SIZE {
                let mut private_key = [0u8; PRIVATE_KEY_SIZE];
                private_key.copy_from_slice(&data);
                let id = Self::from_private_key(private_key);
                info!("loaded identity from {:?} (address {})", path, id.address);
                return Ok(id);
            }
            info!("identity file {:?} has wrong length, regenerating", path);
        }

        let id = Self::generate();
        id.save(path)?;
        info!("generated new identity (address {})", id.address);
        Ok(id)
    }

    /// Persist the private key to `path` with restrictive permissions.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("create identity directory {:?}", dir))?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
            }
        }
        fs::write(path, self.private_key)
            .with_context(|| format!("write identity to {:?}", path))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Identity{{addr={}, pubkey={}...}}",
            self.address,
            &self.public_key_hex()[..16]
        )
    }
}
