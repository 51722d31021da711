//! Identity of the image being co-signed.
//!
//! A session is created for exactly one image category and one digest. The
//! category fixes the key path on the device; the digest is the content the
//! device will sign. Remote calls are checked against this identity byte for
//! byte.

use cosign_device::KeyPath;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Length of an image digest in bytes.
pub const DIGEST_LEN: usize = 32;

/// Errors from resolving an image identity.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ImageError {
    #[error("Unknown image type: {0} (expected bootloader, vendorheader or firmware)")]
    UnknownKind(String),

    #[error("Invalid digest hex: {0}")]
    InvalidHex(String),

    #[error("Digest must be 32 bytes, got {0}")]
    InvalidLength(usize),

    #[error("Unrecognized image header magic: {0}")]
    UnknownMagic(String),

    #[error("Image too short: {0} bytes")]
    Truncated(usize),
}

/// Image categories that can be co-signed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImageKind {
    Bootloader,
    VendorHeader,
    Firmware,
}

impl ImageKind {
    /// Fixed index of the category, the last component of its key path.
    pub fn index(self) -> u32 {
        match self {
            ImageKind::Bootloader => 0,
            ImageKind::VendorHeader => 1,
            ImageKind::Firmware => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ImageKind::Bootloader => "bootloader",
            ImageKind::VendorHeader => "vendorheader",
            ImageKind::Firmware => "firmware",
        }
    }

    pub fn key_path(self) -> KeyPath {
        KeyPath::for_index(self.index())
    }

    /// Header magic an image of this category starts with.
    pub fn magic(self) -> &'static [u8; 4] {
        match self {
            ImageKind::Bootloader => b"TRZB",
            ImageKind::VendorHeader => b"TRZV",
            ImageKind::Firmware => b"TRZF",
        }
    }

    fn from_magic(magic: &[u8]) -> Option<Self> {
        [
            ImageKind::Bootloader,
            ImageKind::VendorHeader,
            ImageKind::Firmware,
        ]
        .into_iter()
        .find(|kind| kind.magic().as_slice() == magic)
    }
}

impl fmt::Display for ImageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ImageKind {
    type Err = ImageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bootloader" => Ok(ImageKind::Bootloader),
            "vendorheader" => Ok(ImageKind::VendorHeader),
            "firmware" => Ok(ImageKind::Firmware),
            other => Err(ImageError::UnknownKind(other.to_string())),
        }
    }
}

/// Fixed-size digest of an image.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Digest([u8; DIGEST_LEN]);

impl Digest {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ImageError> {
        let array: [u8; DIGEST_LEN] = bytes
            .try_into()
            .map_err(|_| ImageError::InvalidLength(bytes.len()))?;
        Ok(Self(array))
    }

    /// Parse from hex, with or without a `0x` prefix.
    pub fn from_hex(s: &str) -> Result<Self, ImageError> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(s).map_err(|e| ImageError::InvalidHex(e.to_string()))?;
        Self::from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; DIGEST_LEN]> for Digest {
    fn from(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", hex::encode(self.0))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Which image, and exactly which content, a session signs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignRequestIdentity {
    pub name: String,
    pub digest: Digest,
}

impl SignRequestIdentity {
    pub fn new(kind: ImageKind, digest: Digest) -> Self {
        Self {
            name: kind.name().to_string(),
            digest,
        }
    }

    /// Exact match: case-sensitive name and byte-identical digest.
    pub fn matches(&self, name: &str, digest: &[u8]) -> bool {
        self.name == name && self.digest.as_bytes() == digest
    }
}

/// What an image parser extracts from a raw image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedImage {
    pub kind: ImageKind,
    pub digest: Digest,
    /// Public keys the image expects to be signed by, when the format embeds them
    pub allowed_public_keys: Option<Vec<Vec<u8>>>,
}

impl ParsedImage {
    pub fn identity(&self) -> SignRequestIdentity {
        SignRequestIdentity::new(self.kind, self.digest)
    }
}

/// Extracts the identity of a raw image.
pub trait ImageParser {
    fn parse(&self, bytes: &[u8]) -> Result<ParsedImage, ImageError>;
}

/// Detects the category from the header magic and hashes the whole image
/// with SHA-256. Carries no allow-list.
#[derive(Debug, Default, Clone, Copy)]
pub struct MagicImageParser;

impl ImageParser for MagicImageParser {
    fn parse(&self, bytes: &[u8]) -> Result<ParsedImage, ImageError> {
        let magic = bytes.get(..4).ok_or(ImageError::Truncated(bytes.len()))?;
        let kind = ImageKind::from_magic(magic)
            .ok_or_else(|| ImageError::UnknownMagic(hex::encode(magic)))?;

        let digest: [u8; DIGEST_LEN] = Sha256::digest(bytes).into();

        Ok(ParsedImage {
            kind,
            digest: Digest::from(digest),
            allowed_public_keys: None,
        })
    }
}
