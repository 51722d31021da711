// Copyright (C) 2025 Category Labs, Inc.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Signing device capability for collaborative firmware signing.
//!
//! The device holds one share of a two-round commit/sign scheme. This crate
//! does not implement the scheme; it only describes the two operations the
//! device exposes and how to reach a device through its host agent.
//!
//! ```text
//! ┌──────────────────┐   Unix Socket    ┌──────────────────┐   USB   ┌────────┐
//! │  cosign-signer   │ ◄──────────────► │ Device host agent│ ◄─────► │ Device │
//! │  (SignerBridge)  │  DeviceRequest   │                  │         │        │
//! └──────────────────┘                  └──────────────────┘         └────────┘
//! ```

pub mod frame;
pub mod host;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

pub use frame::FrameError;
pub use host::{DeviceRequest, DeviceResponse, HostDevice};

/// Flag marking a hardened derivation component.
pub const HARDENED: u32 = 0x8000_0000;

/// Purpose component shared by every co-signing key path.
pub const COSIGN_PURPOSE: u32 = 10018;

/// Errors reported by a signing device or its transport.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("No signing device reachable at {path:?}: {source}")]
    NotFound {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Device rejected request: {0}")]
    Rejected(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Framing error: {0}")]
    Frame(#[from] FrameError),
}

/// Errors from parsing a textual key path.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyPathError {
    #[error("Empty key path")]
    Empty,

    #[error("Invalid key path component: {0:?}")]
    InvalidComponent(String),
}

/// Hierarchical derivation path selecting a key on the device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyPath(Vec<u32>);

impl KeyPath {
    /// Co-signing path for an image category: `10018h/{index}h`.
    pub fn for_index(index: u32) -> Self {
        Self(vec![COSIGN_PURPOSE | HARDENED, index | HARDENED])
    }

    /// Raw components, hardened ones carrying [`HARDENED`].
    pub fn components(&self) -> &[u32] {
        &self.0
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, component) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            if component & HARDENED != 0 {
                write!(f, "{}h", component & !HARDENED)?;
            } else {
                write!(f, "{}", component)?;
            }
        }
        Ok(())
    }
}

impl FromStr for KeyPath {
    type Err = KeyPathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix("m/").unwrap_or(s);
        if s.is_empty() {
            return Err(KeyPathError::Empty);
        }

        let mut components = Vec::new();
        for part in s.split('/') {
            let (digits, hardened) = match part.strip_suffix('h').or_else(|| part.strip_suffix('\'')) {
                Some(digits) => (digits, true),
                None => (part, false),
            };
            let value: u32 = digits
                .parse()
                .map_err(|_| KeyPathError::InvalidComponent(part.to_string()))?;
            if value & HARDENED != 0 {
                return Err(KeyPathError::InvalidComponent(part.to_string()));
            }
            components.push(if hardened { value | HARDENED } else { value });
        }

        Ok(Self(components))
    }
}

/// First-round output of the device: its public key and commitment value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commitment {
    pub public_key: Vec<u8>,
    pub commitment: Vec<u8>,
}

/// The two operations a co-signing device exposes.
///
/// Both may block on a physical confirmation and may fail transiently
/// (device busy, wrong passphrase, user cancel). Implementations must not
/// retry on their own; retrying is the caller's decision. Taking `&mut self`
/// keeps at most one operation in flight per device handle.
pub trait SigningDevice: Send {
    /// Produce the first-round commitment for `digest` with the key at `path`.
    fn commit(&mut self, path: &KeyPath, digest: &[u8]) -> Result<Commitment, DeviceError>;

    /// Produce the partial signature over `digest` for the given round parameters.
    fn sign(
        &mut self,
        path: &KeyPath,
        digest: &[u8],
        aggregate_commitment: &[u8],
        aggregate_public_key: &[u8],
    ) -> Result<Vec<u8>, DeviceError>;
}
