//! HMAC helpers
//!
//! HMAC-SHA-256 drives the entropy pool and the KDF, HMAC-SHA-512 (or SHA-256
//! for older files) authenticates the database body and HMAC-SHA-1 tags the
//! in-memory password cache.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Sha256, Sha512};

pub type HmacSha1 = Hmac<Sha1>;
pub type HmacSha256 = Hmac<Sha256>;
pub type HmacSha512 = Hmac<Sha512>;

/// HMAC-SHA-1 tag size
pub const SHA1_TAG_SIZE: usize = 20;

/// HMAC-SHA-256 tag size
pub const SHA256_TAG_SIZE: usize = 32;

/// HMAC-SHA-512 tag size
pub const SHA512_TAG_SIZE: usize = 64;

const ANY_KEY_LENGTH: &str = "HMAC accepts keys of any length";

/// Hash algorithm used for whole-file authentication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HashId {
    Sha256 = 0,
    Sha512 = 1,
}

impl HashId {
    /// Parse the on-disk identifier
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Sha256),
            1 => Some(Self::Sha512),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Sha256 => "SHA-256",
            Self::Sha512 => "SHA-512",
        }
    }

    /// Size of the trailing authentication tag
    pub fn tag_size(self) -> usize {
        match self {
            Self::Sha256 => SHA256_TAG_SIZE,
            Self::Sha512 => SHA512_TAG_SIZE,
        }
    }
}

/// HMAC-SHA-256 over the concatenation of `parts`
pub fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> [u8; SHA256_TAG_SIZE] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect(ANY_KEY_LENGTH);
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

/// HMAC-SHA-1 over `data`
pub fn hmac_sha1(key: &[u8], data: &[u8]) -> [u8; SHA1_TAG_SIZE] {
    let mut mac = <HmacSha1 as Mac>::new_from_slice(key).expect(ANY_KEY_LENGTH);
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Constant-time check of an HMAC-SHA-1 tag
pub fn verify_hmac_sha1(key: &[u8], data: &[u8], tag: &[u8]) -> bool {
    let mut mac = <HmacSha1 as Mac>::new_from_slice(key).expect(ANY_KEY_LENGTH);
    mac.update(data);
    mac.verify_slice(tag).is_ok()
}

/// Incremental file authenticator over the selected hash
pub enum Authenticator {
    Sha256(HmacSha256),
    Sha512(HmacSha512),
}

impl Authenticator {
    pub fn new(hash: HashId, key: &[u8]) -> Self {
        match hash {
            HashId::Sha256 => {
                Self::Sha256(<HmacSha256 as Mac>::new_from_slice(key).expect(ANY_KEY_LENGTH))
            }
            HashId::Sha512 => {
                Self::Sha512(<HmacSha512 as Mac>::new_from_slice(key).expect(ANY_KEY_LENGTH))
            }
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha256(mac) => mac.update(data),
            Self::Sha512(mac) => mac.update(data),
        }
    }

    pub fn finalize(self) -> Vec<u8> {
        match self {
            Self::Sha256(mac) => mac.finalize().into_bytes().to_vec(),
            Self::Sha512(mac) => mac.finalize().into_bytes().to_vec(),
        }
    }

    /// Constant-time comparison against a stored tag
    pub fn verify(self, tag: &[u8]) -> bool {
        match self {
            Self::Sha256(mac) => mac.verify_slice(tag).is_ok(),
            Self::Sha512(mac) => mac.verify_slice(tag).is_ok(),
        }
    }
}
