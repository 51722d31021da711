//! Collaborative firmware signing with a hardware signer.
//!
//! This crate exposes one seat of a two-party co-signing scheme over the
//! network. The local party owns the hardware device; the remote party
//! fetches the device's commitment, runs its own half of the protocol, and
//! then fetches the device's partial signature.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐       TCP        ┌──────────────────────────────┐
//! │   Remote peer   │ ◄──────────────► │ cosign-signer-daemon         │
//! │ (SignerClient)  │ Request/Response │  SignerServer                │
//! └─────────────────┘                  │   └─ Session                 │
//!                                      │       └─ SignerBridge        │
//!                                      │           └─ SigningDevice   │
//!                                      └──────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Identity checks**: every call must name the exact image and digest
//!   the session was started for
//! - **Idempotent rounds**: repeated calls with the same round parameters
//!   return the cached signature without another device confirmation
//! - **Transparent retries**: device failures are retried until they succeed
//!   or the operator stops the process
//!
//! ## Usage
//!
//! ```bash
//! cosign-signer-daemon \
//!     --device-socket /run/cosign-device.sock \
//!     --type firmware \
//!     --digest 0x5f3c...e1 \
//!     --port 33333
//! ```

pub mod bridge;
pub mod image;
pub mod protocol;
pub mod server;
pub mod session;

#[cfg(test)]
mod test_utils;

pub use bridge::{
    AbortSignal, AlwaysRetry, BridgeError, ConsoleOperator, NeverRetry, Operator, RetryPolicy,
    SignerBridge, DEFAULT_RETRY_DELAY,
};
pub use image::{
    Digest, ImageError, ImageKind, ImageParser, MagicImageParser, ParsedImage, SignRequestIdentity,
};
pub use protocol::{CommitmentRequest, Request, Response, SignatureRequest};
pub use server::{ServerConfig, ServerError, SignerClient, SignerServer, DEFAULT_PORT};
pub use session::{RoundParameters, Session, SessionError, SessionState, SignatureCache};
