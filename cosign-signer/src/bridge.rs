//! Local signer bridge.
//!
//! Wraps the attached signing device and turns its interactive, failure-prone
//! operations into two calls that either succeed or stop for a reason the
//! operator chose. A failed attempt (device busy, wrong passphrase, user
//! cancel) is logged with the image, digest and key path and tried again
//! under the configured [`RetryPolicy`]; the default policy never gives up.
//!
//! Retrying stops early only when the [`AbortSignal`] is raised or when the
//! operator declines to continue with a device key the image does not accept.

use cosign_device::{Commitment, KeyPath, SigningDevice};
use std::io::{BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors that end a bridge operation.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("{operation} aborted after {attempts} failed attempts")]
    Aborted {
        operation: &'static str,
        attempts: u32,
    },

    #[error("{operation} gave up after {attempts} failed attempts, last error: {last}")]
    Exhausted {
        operation: &'static str,
        attempts: u32,
        last: String,
    },

    #[error("Device public key {public_key} is not accepted by the image")]
    UnrecognizedPublicKey { public_key: String },
}

/// Pause the daemon applies between failed device attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// How often, and how fast, a failing device operation is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Failed attempts tolerated before giving up; `None` retries forever
    pub max_attempts: Option<u32>,
    /// Pause between attempts
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn unbounded() -> Self {
        Self {
            max_attempts: None,
            delay: Duration::ZERO,
        }
    }

    pub fn bounded(max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::unbounded()
    }
}

/// Shared flag that stops any retry loop observing it.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The human at the device, asked before retrying with another account.
pub trait Operator: Send {
    /// Return true to try the operation again.
    fn confirm_retry(&mut self, reason: &str) -> bool;
}

/// Asks on the controlling terminal.
#[derive(Debug, Default)]
pub struct ConsoleOperator;

impl Operator for ConsoleOperator {
    fn confirm_retry(&mut self, reason: &str) -> bool {
        let mut stderr = std::io::stderr();
        let _ = write!(stderr, "{}\nRetry with a different passphrase? [y/N] ", reason);
        let _ = stderr.flush();

        let mut answer = String::new();
        match std::io::stdin().lock().read_line(&mut answer) {
            Ok(_) => matches!(answer.trim(), "y" | "Y" | "yes"),
            Err(_) => false,
        }
    }
}

/// Always retries, for unattended operation.
#[derive(Debug, Default)]
pub struct AlwaysRetry;

impl Operator for AlwaysRetry {
    fn confirm_retry(&mut self, _reason: &str) -> bool {
        true
    }
}

/// Never retries.
#[derive(Debug, Default)]
pub struct NeverRetry;

impl Operator for NeverRetry {
    fn confirm_retry(&mut self, _reason: &str) -> bool {
        false
    }
}

/// Exclusive handle on the signing device plus its retry discipline.
pub struct SignerBridge<D> {
    device: D,
    image_name: String,
    allowed_public_keys: Option<Vec<Vec<u8>>>,
    policy: RetryPolicy,
    abort: AbortSignal,
    operator: Box<dyn Operator>,
}

impl<D: SigningDevice> SignerBridge<D> {
    /// `image_name` only labels diagnostics.
    pub fn new(device: D, image_name: impl Into<String>) -> Self {
        Self {
            device,
            image_name: image_name.into(),
            allowed_public_keys: None,
            policy: RetryPolicy::default(),
            abort: AbortSignal::default(),
            operator: Box::new(NeverRetry),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_abort_signal(mut self, abort: AbortSignal) -> Self {
        self.abort = abort;
        self
    }

    pub fn with_operator(mut self, operator: Box<dyn Operator>) -> Self {
        self.operator = operator;
        self
    }

    /// Restrict the device keys accepted by [`commit`](Self::commit).
    pub fn with_allowed_public_keys(mut self, keys: Option<Vec<Vec<u8>>>) -> Self {
        self.allowed_public_keys = keys;
        self
    }

    /// Obtain the device commitment for `digest`, retrying until it succeeds.
    pub fn commit(&mut self, path: &KeyPath, digest: &[u8]) -> Result<Commitment, BridgeError> {
        const OPERATION: &str = "commit";
        let mut failures: u32 = 0;

        loop {
            self.check_abort(OPERATION, failures)?;

            let reason = match self.device.commit(path, digest) {
                Ok(commitment) if self.is_allowed(&commitment.public_key) => {
                    info!(
                        "Commitment obtained: image={}, path={}, pubkey=0x{}",
                        self.image_name,
                        path,
                        hex::encode(&commitment.public_key)
                    );
                    return Ok(commitment);
                }
                Ok(commitment) => {
                    let public_key = hex::encode(&commitment.public_key);
                    let reason = format!(
                        "Device public key 0x{} is not accepted by {}",
                        public_key, self.image_name
                    );
                    warn!("{}", reason);
                    if !self.operator.confirm_retry(&reason) {
                        return Err(BridgeError::UnrecognizedPublicKey { public_key });
                    }
                    reason
                }
                Err(e) => e.to_string(),
            };

            failures = failures.saturating_add(1);
            self.after_failure(OPERATION, failures, path, digest, reason)?;
        }
    }

    /// Obtain the partial signature for the given round, retrying until it succeeds.
    pub fn sign(
        &mut self,
        path: &KeyPath,
        digest: &[u8],
        aggregate_commitment: &[u8],
        aggregate_public_key: &[u8],
    ) -> Result<Vec<u8>, BridgeError> {
        const OPERATION: &str = "sign";
        let mut failures: u32 = 0;

        loop {
            self.check_abort(OPERATION, failures)?;

            let result = self
                .device
                .sign(path, digest, aggregate_commitment, aggregate_public_key);
            match result {
                Ok(signature) => {
                    debug!(
                        "Signature obtained: image={}, path={}, sig_len={}",
                        self.image_name,
                        path,
                        signature.len()
                    );
                    return Ok(signature);
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    self.after_failure(OPERATION, failures, path, digest, e.to_string())?;
                }
            }
        }
    }

    fn is_allowed(&self, public_key: &[u8]) -> bool {
        match &self.allowed_public_keys {
            Some(keys) => keys.iter().any(|key| key == public_key),
            None => true,
        }
    }

    fn check_abort(&self, operation: &'static str, attempts: u32) -> Result<(), BridgeError> {
        if self.abort.is_aborted() {
            warn!("{} aborted: image={}", operation, self.image_name);
            return Err(BridgeError::Aborted {
                operation,
                attempts,
            });
        }
        Ok(())
    }

    fn after_failure(
        &self,
        operation: &'static str,
        attempts: u32,
        path: &KeyPath,
        digest: &[u8],
        reason: String,
    ) -> Result<(), BridgeError> {
        warn!(
            "Device {} failed (attempt {}): image={}, digest={}, path={}: {}",
            operation,
            attempts,
            self.image_name,
            hex::encode(digest),
            path,
            reason
        );

        if self.policy.exhausted(attempts) {
            return Err(BridgeError::Exhausted {
                operation,
                attempts,
                last: reason,
            });
        }

        if !self.policy.delay.is_zero() {
            thread::sleep(self.policy.delay);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::ScriptedDevice;

    const DIGEST: [u8; 32] = [0xAA; 32];

    fn path() -> KeyPath {
        KeyPath::for_index(2)
    }

    /// Counts how often it was asked, answering from a script.
    struct ScriptedOperator {
        answers: Vec<bool>,
        asked: Arc<std::sync::atomic::AtomicUsize>,
    }

    impl Operator for ScriptedOperator {
        fn confirm_retry(&mut self, _reason: &str) -> bool {
            self.asked.fetch_add(1, Ordering::SeqCst);
            if self.answers.is_empty() {
                false
            } else {
                self.answers.remove(0)
            }
        }
    }

    #[test]
    fn test_commit_retries_until_success() {
        let device = ScriptedDevice::new().failing_commits(3);
        let calls = device.calls();
        let mut bridge = SignerBridge::new(device, "firmware");

        let commitment = bridge.commit(&path(), &DIGEST).unwrap();
        assert_eq!(commitment.public_key, ScriptedDevice::DEFAULT_PUBLIC_KEY.to_vec());
        assert_eq!(calls.commits(), 4);
    }

    #[test]
    fn test_sign_retries_until_success() {
        let device = ScriptedDevice::new().failing_signs(2);
        let calls = device.calls();
        let mut bridge = SignerBridge::new(device, "firmware");

        let signature = bridge.sign(&path(), &DIGEST, b"R1", b"P1").unwrap();
        assert!(!signature.is_empty());
        assert_eq!(calls.signs(), 3);
    }

    #[test]
    fn test_bounded_policy_gives_up() {
        let device = ScriptedDevice::new().failing_signs(10);
        let calls = device.calls();
        let mut bridge =
            SignerBridge::new(device, "firmware").with_policy(RetryPolicy::bounded(3));

        let result = bridge.sign(&path(), &DIGEST, b"R1", b"P1");
        match result {
            Err(BridgeError::Exhausted {
                operation,
                attempts,
                last,
            }) => {
                assert_eq!(operation, "sign");
                assert_eq!(attempts, 3);
                assert!(last.contains("busy"));
            }
            other => panic!("Expected Exhausted, got {:?}", other),
        }
        assert_eq!(calls.signs(), 3);
    }

    #[test]
    fn test_abort_signal_stops_retrying() {
        let device = ScriptedDevice::new().failing_commits(u32::MAX);
        let calls = device.calls();
        let abort = AbortSignal::new();

        let trigger = abort.clone();
        let watcher = calls.clone();
        let aborter = thread::spawn(move || {
            while watcher.commits() < 5 {
                thread::yield_now();
            }
            trigger.abort();
        });

        let mut bridge = SignerBridge::new(device, "firmware").with_abort_signal(abort);
        let result = bridge.commit(&path(), &DIGEST);
        aborter.join().unwrap();

        assert!(matches!(
            result,
            Err(BridgeError::Aborted {
                operation: "commit",
                ..
            })
        ));
        assert!(calls.commits() >= 5);
    }

    #[test]
    fn test_delay_applied_between_attempts() {
        let device = ScriptedDevice::new().failing_signs(10);
        let calls = device.calls();
        let delay = Duration::from_millis(25);
        let mut bridge = SignerBridge::new(device, "firmware")
            .with_policy(RetryPolicy::bounded(3).with_delay(delay));

        let started = std::time::Instant::now();
        let result = bridge.sign(&path(), &DIGEST, b"R1", b"P1");
        let elapsed = started.elapsed();

        assert!(matches!(result, Err(BridgeError::Exhausted { attempts: 3, .. })));
        assert_eq!(calls.signs(), 3);
        // Pauses follow the first two failures; the third one gives up at once.
        assert!(elapsed >= delay * 2, "elapsed {:?}", elapsed);
    }

    #[test]
    fn test_exhausted_at_counter_limit() {
        let policy = RetryPolicy::bounded(u32::MAX);
        assert!(!policy.exhausted(u32::MAX - 1));
        assert!(policy.exhausted(u32::MAX));
        assert!(!RetryPolicy::unbounded().exhausted(u32::MAX));
    }

    #[test]
    fn test_already_aborted_never_touches_device() {
        let device = ScriptedDevice::new();
        let calls = device.calls();
        let abort = AbortSignal::new();
        abort.abort();

        let mut bridge = SignerBridge::new(device, "firmware").with_abort_signal(abort);
        assert!(matches!(
            bridge.sign(&path(), &DIGEST, b"R", b"P"),
            Err(BridgeError::Aborted { attempts: 0, .. })
        ));
        assert_eq!(calls.signs(), 0);
    }

    #[test]
    fn test_unrecognized_key_declined_by_operator() {
        let device = ScriptedDevice::new().with_public_keys(vec![vec![0x03; 33]]);
        let asked = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut bridge = SignerBridge::new(device, "firmware")
            .with_allowed_public_keys(Some(vec![vec![0x02; 33]]))
            .with_operator(Box::new(ScriptedOperator {
                answers: vec![false],
                asked: asked.clone(),
            }));

        let result = bridge.commit(&path(), &DIGEST);
        match result {
            Err(BridgeError::UnrecognizedPublicKey { public_key }) => {
                assert_eq!(public_key, hex::encode([0x03; 33]));
            }
            other => panic!("Expected UnrecognizedPublicKey, got {:?}", other),
        }
        assert_eq!(asked.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unrecognized_key_retried_with_other_account() {
        // First passphrase opens the wrong account, the second one the right key.
        let device = ScriptedDevice::new().with_public_keys(vec![vec![0x03; 33], vec![0x02; 33]]);
        let calls = device.calls();
        let asked = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut bridge = SignerBridge::new(device, "firmware")
            .with_allowed_public_keys(Some(vec![vec![0x02; 33]]))
            .with_operator(Box::new(ScriptedOperator {
                answers: vec![true],
                asked: asked.clone(),
            }));

        let commitment = bridge.commit(&path(), &DIGEST).unwrap();
        assert_eq!(commitment.public_key, vec![0x02; 33]);
        assert_eq!(calls.commits(), 2);
        assert_eq!(asked.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_no_allow_list_accepts_any_key() {
        let device = ScriptedDevice::new().with_public_keys(vec![vec![0x07; 33]]);
        let mut bridge = SignerBridge::new(device, "bootloader");
        assert_eq!(bridge.commit(&path(), &DIGEST).unwrap().public_key, vec![0x07; 33]);
    }
}
