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

//! Client for a local device host agent.
//!
//! The host agent owns the USB connection to the hardware device and drives
//! its confirmation prompts. We talk to it over a Unix socket, one request
//! per connection.
//!
//! ## Usage
//!
//! ```ignore
//! use cosign_device::{HostDevice, KeyPath, SigningDevice};
//!
//! let mut device = HostDevice::connect("/run/cosign-device.sock")?;
//! let commitment = device.commit(&KeyPath::for_index(2), &digest)?;
//! ```

use crate::frame::{read_frame, write_frame};
use crate::{Commitment, DeviceError, KeyPath, SigningDevice};
use serde::{Deserialize, Serialize};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Requests understood by the device host agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DeviceRequest {
    Commit {
        path: KeyPath,
        digest: Vec<u8>,
    },
    Sign {
        path: KeyPath,
        digest: Vec<u8>,
        aggregate_commitment: Vec<u8>,
        aggregate_public_key: Vec<u8>,
    },
    Ping,
}

/// Responses from the device host agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DeviceResponse {
    Commitment(Commitment),
    Signature { signature: Vec<u8> },
    /// The device refused or failed the operation (busy, cancelled, wrong passphrase)
    Failure { message: String },
    Pong,
}

/// Signing device reached through its host agent socket.
#[derive(Debug, Clone)]
pub struct HostDevice {
    socket_path: PathBuf,
    read_timeout: Option<Duration>,
}

impl HostDevice {
    /// Connect to the host agent and check that a device answers.
    pub fn connect(socket_path: impl AsRef<Path>) -> Result<Self, DeviceError> {
        let device = Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            read_timeout: None,
        };

        match device.send_request(&DeviceRequest::Ping) {
            Ok(DeviceResponse::Pong) => Ok(device),
            Ok(DeviceResponse::Failure { message }) => Err(DeviceError::Rejected(message)),
            Ok(_) => Err(DeviceError::Protocol("Unexpected response to ping".to_string())),
            Err(DeviceError::Io(source)) => Err(DeviceError::NotFound {
                path: device.socket_path,
                source,
            }),
            Err(e) => Err(e),
        }
    }

    /// Bound how long to wait for the agent's answer. Unset by default since
    /// confirmations on the device can take arbitrarily long.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    fn send_request(&self, request: &DeviceRequest) -> Result<DeviceResponse, DeviceError> {
        let mut stream = UnixStream::connect(&self.socket_path)?;
        stream.set_read_timeout(self.read_timeout)?;

        write_frame(&mut stream, request)?;
        let response = read_frame(&mut stream)?;
        Ok(response)
    }
}

impl SigningDevice for HostDevice {
    fn commit(&mut self, path: &KeyPath, digest: &[u8]) -> Result<Commitment, DeviceError> {
        debug!("Device commit: path={}, digest={}", path, hex::encode(digest));

        let response = self.send_request(&DeviceRequest::Commit {
            path: path.clone(),
            digest: digest.to_vec(),
        })?;

        match response {
            DeviceResponse::Commitment(commitment) => Ok(commitment),
            DeviceResponse::Failure { message } => Err(DeviceError::Rejected(message)),
            _ => Err(DeviceError::Protocol("Unexpected response".to_string())),
        }
    }

    fn sign(
        &mut self,
        path: &KeyPath,
        digest: &[u8],
        aggregate_commitment: &[u8],
        aggregate_public_key: &[u8],
    ) -> Result<Vec<u8>, DeviceError> {
        debug!(
            "Device sign: path={}, digest={}, R={}, P={}",
            path,
            hex::encode(digest),
            hex::encode(aggregate_commitment),
            hex::encode(aggregate_public_key)
        );

        let response = self.send_request(&DeviceRequest::Sign {
            path: path.clone(),
            digest: digest.to_vec(),
            aggregate_commitment: aggregate_commitment.to_vec(),
            aggregate_public_key: aggregate_public_key.to_vec(),
        })?;

        match response {
            DeviceResponse::Signature { signature } => Ok(signature),
            DeviceResponse::Failure { message } => Err(DeviceError::Rejected(message)),
            _ => Err(DeviceError::Protocol("Unexpected response".to_string())),
        }
    }
}
