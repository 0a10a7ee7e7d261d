//! Duplicate-frame suppression for the automatic analysis path.

/// How much of the encoded frame feeds the fingerprint. The leading bytes of
/// a JPEG change whenever the visible content does, which is all the
/// heuristic needs.
const FINGERPRINT_PREFIX_LEN: usize = 1000;

/// Suppresses repeated analysis of a visually-unchanged screen by comparing
/// a cheap rolling hash of the frame prefix against the previously accepted
/// one. Collisions are acceptable -- this is a heuristic, not a correctness
/// guarantee. Not thread-safe; the orchestrator's single-flight rule guards
/// it.
#[derive(Debug, Default)]
pub struct FrameDeduplicator {
    last_fingerprint: Option<i32>,
}

impl FrameDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when the frame differs from the previously accepted one (and
    /// records its fingerprint), false when it should be suppressed.
    pub fn should_analyze(&mut self, frame: &str) -> bool {
        let fingerprint = Self::fingerprint(frame);
        if self.last_fingerprint == Some(fingerprint) {
            return false;
        }
        self.last_fingerprint = Some(fingerprint);
        true
    }

    /// Forget the stored fingerprint so the next frame is always analyzed.
    pub fn reset(&mut self) {
        self.last_fingerprint = None;
    }

    // 32-bit multiplicative rolling hash (h*31 + b via shift-and-subtract)
    // over the bounded prefix.
    fn fingerprint(frame: &str) -> i32 {
        let prefix = &frame.as_bytes()[..frame.len().min(FINGERPRINT_PREFIX_LEN)];
        let mut hash: i32 = 0;
        for &byte in prefix {
            hash = hash
                .wrapping_shl(5)
                .wrapping_sub(hash)
                .wrapping_add(byte as i32);
        }
        hash
    }
}
