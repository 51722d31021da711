//! Test doubles for the signing device.

use cosign_device::{Commitment, DeviceError, KeyPath, SigningDevice};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Shared view of how often a [`ScriptedDevice`] was used.
#[derive(Debug, Clone, Default)]
pub(crate) struct DeviceCalls {
    commits: Arc<AtomicUsize>,
    signs: Arc<AtomicUsize>,
}

impl DeviceCalls {
    pub(crate) fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub(crate) fn signs(&self) -> usize {
        self.signs.load(Ordering::SeqCst)
    }
}

/// Device that fails a scripted number of times, then answers deterministically.
///
/// Signatures embed the sign call number, so a second hardware call for the
/// same round yields different bytes.
pub(crate) struct ScriptedDevice {
    commit_failures: u32,
    sign_failures: u32,
    public_keys: VecDeque<Vec<u8>>,
    calls: DeviceCalls,
}

impl ScriptedDevice {
    pub(crate) const DEFAULT_PUBLIC_KEY: [u8; 33] = [0x02; 33];

    pub(crate) fn new() -> Self {
        Self {
            commit_failures: 0,
            sign_failures: 0,
            public_keys: VecDeque::from([Self::DEFAULT_PUBLIC_KEY.to_vec()]),
            calls: DeviceCalls::default(),
        }
    }

    pub(crate) fn failing_commits(mut self, failures: u32) -> Self {
        self.commit_failures = failures;
        self
    }

    pub(crate) fn failing_signs(mut self, failures: u32) -> Self {
        self.sign_failures = failures;
        self
    }

    /// Keys returned by successive commits; the last one repeats.
    pub(crate) fn with_public_keys(mut self, keys: Vec<Vec<u8>>) -> Self {
        self.public_keys = keys.into();
        self
    }

    pub(crate) fn calls(&self) -> DeviceCalls {
        self.calls.clone()
    }
}

impl SigningDevice for ScriptedDevice {
    fn commit(&mut self, _path: &KeyPath, digest: &[u8]) -> Result<Commitment, DeviceError> {
        self.calls.commits.fetch_add(1, Ordering::SeqCst);
        if self.commit_failures > 0 {
            self.commit_failures -= 1;
            return Err(DeviceError::Rejected("Device busy".to_string()));
        }

        let public_key = if self.public_keys.len() > 1 {
            self.public_keys.pop_front().unwrap_or_default()
        } else {
            self.public_keys.front().cloned().unwrap_or_default()
        };

        Ok(Commitment {
            public_key,
            commitment: [b"commit:".as_slice(), digest].concat(),
        })
    }

    fn sign(
        &mut self,
        _path: &KeyPath,
        digest: &[u8],
        aggregate_commitment: &[u8],
        aggregate_public_key: &[u8],
    ) -> Result<Vec<u8>, DeviceError> {
        let call = self.calls.signs.fetch_add(1, Ordering::SeqCst) + 1;
        if self.sign_failures > 0 {
            self.sign_failures -= 1;
            return Err(DeviceError::Rejected("Device busy".to_string()));
        }

        let call_bytes = (call as u32).to_le_bytes();
        Ok([
            aggregate_commitment,
            aggregate_public_key,
            &digest[..4.min(digest.len())],
            call_bytes.as_slice(),
        ]
        .concat())
    }
}
