//! Co-signing session coordinator.
//!
//! One session signs one digest with one key path. It obtains the device
//! commitment once at start, hands it out on every `get_commitment`, and
//! produces the partial signature for whatever round parameters the remote
//! peer supplies.
//!
//! ## Idempotence
//!
//! The peer may repeat a call after a transport failure. The commitment never
//! changes, and the signature for the last seen round parameters is cached,
//! so repeating `get_signature` with the same parameters never touches the
//! device again. New parameters replace the cached entry.
//!
//! ## Protocol mismatch
//!
//! Calls naming a different image or digest are rejected and logged with
//! both the expected and the received values. The session stays usable.

use crate::bridge::{BridgeError, SignerBridge};
use crate::image::SignRequestIdentity;
use cosign_device::{Commitment, KeyPath, SigningDevice};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors returned by session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(
        "Protocol mismatch: expected name={expected_name} digest={expected_digest}, \
         received name={received_name} digest={received_digest}"
    )]
    ProtocolMismatch {
        expected_name: String,
        expected_digest: String,
        received_name: String,
        received_digest: String,
    },

    #[error("Session already finished")]
    Finished,

    #[error("Signer bridge error: {0}")]
    Bridge(#[from] BridgeError),
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Identity resolved, commitment not yet obtained
    Created,
    /// Commitment held, no remote call served yet
    CommitmentReady,
    /// At least one remote call served
    Active,
    Finished,
}

/// Second-round input supplied by the remote peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundParameters {
    pub aggregate_commitment: Vec<u8>,
    pub aggregate_public_key: Vec<u8>,
}

/// Signature for the most recent round parameters. Holds at most one entry.
#[derive(Debug, Default)]
pub struct SignatureCache {
    last: Option<(RoundParameters, Vec<u8>)>,
}

impl SignatureCache {
    /// Cached signature, if `round` equals the last signed round.
    pub fn get(&self, round: &RoundParameters) -> Option<&[u8]> {
        match &self.last {
            Some((last_round, signature)) if last_round == round => Some(signature),
            _ => None,
        }
    }

    pub fn last_round(&self) -> Option<&RoundParameters> {
        self.last.as_ref().map(|(round, _)| round)
    }

    pub fn last_signature(&self) -> Option<&[u8]> {
        self.last.as_ref().map(|(_, signature)| signature.as_slice())
    }

    fn store(&mut self, round: RoundParameters, signature: Vec<u8>) {
        self.last = Some((round, signature));
    }
}

/// The single co-signing session of this process.
pub struct Session<D> {
    identity: SignRequestIdentity,
    key_path: KeyPath,
    commitment: Commitment,
    cache: SignatureCache,
    state: SessionState,
    bridge: SignerBridge<D>,
}

impl<D: SigningDevice> Session<D> {
    /// Obtain the device commitment and open the session.
    ///
    /// Fails only if the bridge gives up; there is no session without a
    /// commitment.
    pub fn start(
        identity: SignRequestIdentity,
        key_path: KeyPath,
        mut bridge: SignerBridge<D>,
    ) -> Result<Self, SessionError> {
        info!(
            "Starting session: name={}, digest={}, path={}",
            identity.name, identity.digest, key_path
        );

        let commitment = bridge.commit(&key_path, identity.digest.as_bytes())?;
        log_transition(SessionState::Created, SessionState::CommitmentReady);

        Ok(Self {
            identity,
            key_path,
            commitment,
            cache: SignatureCache::default(),
            state: SessionState::CommitmentReady,
            bridge,
        })
    }

    /// Return the commitment obtained at start.
    pub fn get_commitment(&mut self, name: &str, digest: &[u8]) -> Result<Commitment, SessionError> {
        self.ensure_live()?;
        self.check_identity("get_commitment", name, digest)?;

        debug!("Serving commitment: name={}", name);
        self.activate();
        Ok(self.commitment.clone())
    }

    /// Return the partial signature for the supplied round parameters.
    pub fn get_signature(
        &mut self,
        name: &str,
        digest: &[u8],
        aggregate_commitment: &[u8],
        aggregate_public_key: &[u8],
    ) -> Result<Vec<u8>, SessionError> {
        self.ensure_live()?;
        self.check_identity("get_signature", name, digest)?;

        let round = RoundParameters {
            aggregate_commitment: aggregate_commitment.to_vec(),
            aggregate_public_key: aggregate_public_key.to_vec(),
        };

        if let Some(signature) = self.cache.get(&round) {
            debug!("Round parameters unchanged, returning cached signature");
            let signature = signature.to_vec();
            self.activate();
            return Ok(signature);
        }

        if self.cache.last_round().is_some() {
            info!("Round parameters changed, signing again");
        }

        let signature = self.bridge.sign(
            &self.key_path,
            digest,
            aggregate_commitment,
            aggregate_public_key,
        )?;
        info!(
            "Partial signature produced: name={}, R=0x{}, P=0x{}",
            name,
            hex::encode(aggregate_commitment),
            hex::encode(aggregate_public_key)
        );

        self.cache.store(round, signature.clone());
        self.activate();
        Ok(signature)
    }

    /// End the session. Later calls fail with [`SessionError::Finished`].
    pub fn finish(&mut self) {
        if self.state != SessionState::Finished {
            log_transition(self.state, SessionState::Finished);
            self.state = SessionState::Finished;
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn identity(&self) -> &SignRequestIdentity {
        &self.identity
    }

    pub fn key_path(&self) -> &KeyPath {
        &self.key_path
    }

    pub fn commitment(&self) -> &Commitment {
        &self.commitment
    }

    pub fn cache(&self) -> &SignatureCache {
        &self.cache
    }

    fn ensure_live(&self) -> Result<(), SessionError> {
        if self.state == SessionState::Finished {
            return Err(SessionError::Finished);
        }
        Ok(())
    }

    fn check_identity(&self, operation: &str, name: &str, digest: &[u8]) -> Result<(), SessionError> {
        if self.identity.matches(name, digest) {
            return Ok(());
        }

        let received_digest = hex::encode(digest);
        warn!(
            "Protocol mismatch in {}: expected name={} digest={}, received name={} digest={}",
            operation, self.identity.name, self.identity.digest, name, received_digest
        );
        Err(SessionError::ProtocolMismatch {
            expected_name: self.identity.name.clone(),
            expected_digest: self.identity.digest.to_string(),
            received_name: name.to_string(),
            received_digest,
        })
    }

    fn activate(&mut self) {
        if self.state == SessionState::CommitmentReady {
            log_transition(self.state, SessionState::Active);
            self.state = SessionState::Active;
        }
    }
}

fn log_transition(from: SessionState, to: SessionState) {
    debug!("Session state {:?} -> {:?}", from, to);
}
