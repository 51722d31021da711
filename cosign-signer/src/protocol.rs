//! Wire protocol for the co-signing endpoint.
//!
//! Each connection carries one length-prefixed bincode request and its
//! response (see [`cosign_device::frame`]).

use serde::{Deserialize, Serialize};

/// Ask for the device commitment of the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitmentRequest {
    /// Image name the peer believes it is co-signing
    pub name: String,
    /// Digest the peer believes it is co-signing
    pub digest: Vec<u8>,
}

/// Ask for the partial signature for one set of round parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureRequest {
    pub name: String,
    pub digest: Vec<u8>,
    /// Aggregate of all signers' commitments
    pub aggregate_commitment: Vec<u8>,
    /// Aggregate of all signers' public keys
    pub aggregate_public_key: Vec<u8>,
    /// Correlates the request with server logs
    pub request_id: u64,
}

/// All possible messages from the remote peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    GetCommitment(CommitmentRequest),
    GetSignature(SignatureRequest),
    Finish,
    Ping,
}

/// All possible messages back to the remote peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Commitment {
        public_key: Vec<u8>,
        commitment: Vec<u8>,
    },
    Signature {
        signature: Vec<u8>,
        /// Echo of request ID
        request_id: u64,
    },
    /// The call was refused (identity mismatch, finished session)
    Rejected { reason: String },
    /// The call failed inside the signer
    Error { message: String },
    Finished,
    Pong,
}

impl SignatureRequest {
    pub fn new(
        name: impl Into<String>,
        digest: Vec<u8>,
        aggregate_commitment: Vec<u8>,
        aggregate_public_key: Vec<u8>,
    ) -> Self {
        Self {
            name: name.into(),
            digest,
            aggregate_commitment,
            aggregate_public_key,
            request_id: generate_request_id(),
        }
    }
}

/// Generate a request ID from the clock and a random component.
fn generate_request_id() -> u64 {
    use rand::Rng;
    use std::time::{SystemTime, UNIX_EPOCH};
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let random: u32 = rand::thread_rng().gen();
    timestamp ^ (random as u64)
}
