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

//! Length-prefixed bincode framing.
//!
//! Every message is a 4-byte little-endian length followed by the bincode
//! encoded body. Used both towards the device host agent and on the
//! co-signing RPC endpoint.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};
use thiserror::Error;

/// Largest accepted frame body.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Message too large: {0} bytes")]
    TooLarge(usize),
}

/// Serialize `message` and write it as one frame.
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<(), FrameError> {
    let bytes = bincode::serialize(message)?;
    if bytes.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(bytes.len()));
    }
    let len_bytes = (bytes.len() as u32).to_le_bytes();
    writer.write_all(&len_bytes)?;
    writer.write_all(&bytes)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame and deserialize it.
pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<T, FrameError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let msg_len = u32::from_le_bytes(len_buf) as usize;

    if msg_len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(msg_len));
    }

    let mut msg_buf = vec![0u8; msg_len];
    reader.read_exact(&mut msg_buf)?;

    Ok(bincode::deserialize(&msg_buf)?)
}
