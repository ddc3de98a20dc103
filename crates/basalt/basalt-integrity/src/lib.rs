//! `basalt-integrity`: CRC32 verification of named shared-memory blocks.
//!
//! Producers checksum a block after writing it; consumers recompute before
//! reading. A mismatch is attributed to the block's last recorded producer,
//! which turns "something scribbled on the bus" into "node X corrupted
//! block Y between its publish and your read".
//!
//! The CRC is the reflected 0xEDB88320 polynomial with 0xFFFFFFFF initial
//! value and final XOR, which is IEEE CRC-32 as computed by `crc32fast`. Each
//! checksum can additionally be mirrored into a 32-bit slot inside the
//! shared region (release store, acquire load) so an attached process can
//! audit blocks without access to this checker's record map.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::SystemTime;

/// A recorded checksum: value, the node that produced it, and when.
#[derive(Debug, Clone)]
pub struct ChecksumRecord {
    pub crc: u32,
    pub producer: String,
    pub recorded_at: SystemTime,
}

/// Outcome of a verification.
#[derive(Debug, Clone)]
pub struct Verification {
    /// False only on an actual mismatch.
    pub valid: bool,
    /// False when no checksum had been recorded for the block (first
    /// access); `valid` is true in that case.
    pub verified: bool,
    pub expected: Option<u32>,
    pub actual: Option<u32>,
    /// Last recorded producer; the culprit when `valid` is false.
    pub culprit: Option<String>,
}

impl Verification {
    fn unverified() -> Self {
        Self {
            valid: true,
            verified: false,
            expected: None,
            actual: None,
            culprit: None,
        }
    }
}

/// Checker keyed by resource name. Shared across node threads.
pub struct IntegrityChecker {
    enabled: bool,
    records: Mutex<HashMap<String, ChecksumRecord>>,
}

impl IntegrityChecker {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Checksum `bytes`, record `(crc, producer, now)` under `name`, and
    /// mirror the value into `slot` when one is wired. Returns the crc
    /// (zero when the checker is disabled).
    pub fn compute(
        &self,
        name: &str,
        producer: &str,
        bytes: &[u8],
        slot: Option<&AtomicU32>,
    ) -> u32 {
        if !self.enabled {
            return 0;
        }
        let crc = crc32fast::hash(bytes);
        self.records.lock().unwrap().insert(
            name.to_string(),
            ChecksumRecord {
                crc,
                producer: producer.to_string(),
                recorded_at: SystemTime::now(),
            },
        );
        if let Some(slot) = slot {
            slot.store(crc, Ordering::Release);
        }
        crc
    }

    /// Recompute and compare against the recorded value. First access (no
    /// record) reports valid-but-unverified. The `consumer` is not stored;
    /// it is threaded through so the caller can build an attribution error
    /// naming both parties.
    pub fn verify(&self, name: &str, bytes: &[u8]) -> Verification {
        if !self.enabled {
            return Verification::unverified();
        }
        let records = self.records.lock().unwrap();
        let Some(record) = records.get(name) else {
            return Verification::unverified();
        };
        let actual = crc32fast::hash(bytes);
        Verification {
            valid: actual == record.crc,
            verified: true,
            expected: Some(record.crc),
            actual: Some(actual),
            culprit: Some(record.producer.clone()),
        }
    }

    /// Names of all recorded blocks that fail verification, given a way to
    /// resolve each name to its current bytes.
    pub fn verify_all<'a, F>(&self, mut bytes_of: F) -> Vec<String>
    where
        F: FnMut(&str) -> Option<&'a [u8]>,
    {
        if !self.enabled {
            return Vec::new();
        }
        let records = self.records.lock().unwrap();
        let mut failing: Vec<String> = records
            .iter()
            .filter(|(name, record)| {
                bytes_of(name).is_some_and(|bytes| crc32fast::hash(bytes) != record.crc)
            })
            .map(|(name, _)| name.clone())
            .collect();
        failing.sort();
        failing
    }

    /// Last recorded checksum for a block, if any.
    pub fn record(&self, name: &str) -> Option<ChecksumRecord> {
        self.records.lock().unwrap().get(name).cloned()
    }

    /// Drop all records (between runs).
    pub fn clear(&self) {
        self.records.lock().unwrap().clear();
    }
}
