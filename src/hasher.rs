//! Deterministic bucketing of subjects.
//!
//! Every rollout and variant decision is derived from a hash of `(subject, key, salt)`, so any
//! replica evaluating the same inputs reaches the same decision without coordination. Changing the
//! salt reshuffles the whole population.

/// Maps `(subject, key, salt)` to a stable pseudo-random bucket.
pub trait AssignmentHasher {
    /// Hash the inputs into an unsigned integer.
    fn hash(&self, subject: &str, key: &str, salt: &str) -> u64;

    /// Hash the inputs into a percentage in `0..=100`.
    fn hash_to_percentage(&self, subject: &str, key: &str, salt: &str) -> u8 {
        // 101 buckets, so that both 0 and 100 are reachable.
        (self.hash(subject, key, salt) % 101) as u8
    }
}

/// The default (and only) hasher.
///
/// Uses the first 8 bytes of the MD5 digest of `subject:key:salt`, read as a big-endian integer.
#[derive(Debug, Clone, Copy, Default)]
pub struct Md5Hasher;

impl AssignmentHasher for Md5Hasher {
    fn hash(&self, subject: &str, key: &str, salt: &str) -> u64 {
        let digest = md5::compute(format!("{subject}:{key}:{salt}"));
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[0..8]);
        u64::from_be_bytes(prefix)
    }
}

/// Returns `true` if `percentage` falls inside a rollout of `threshold` percent.
///
/// A zero threshold admits nobody, even though bucket 0 exists.
pub(crate) fn in_rollout(percentage: u8, threshold: f64) -> bool {
    threshold > 0.0 && f64::from(percentage) <= threshold
}
