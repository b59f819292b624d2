//! Sample sequencer (C8): a monotonic per-session sequence number.

use tokio::sync::Mutex;

/// Hands out strictly increasing `i64` sequence numbers starting at 0.
/// Serialized for the lifetime of one session so the recorder and
/// transport observe the same ordering.
pub struct SampleSequencer {
    next: Mutex<i64>,
}

impl SampleSequencer {
    pub fn new() -> Self {
        Self { next: Mutex::new(0) }
    }

    /// Returns the current value and increments.
    pub async fn next_seq(&self) -> i64 {
        let mut next = self.next.lock().await;
        let current = *next;
        *next += 1;
        current
    }
}

impl Default for SampleSequencer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sequence_starts_at_zero_and_increments() {
        let sequencer = SampleSequencer::new();
        assert_eq!(sequencer.next_seq().await, 0);
        assert_eq!(sequencer.next_seq().await, 1);
        assert_eq!(sequencer.next_seq().await, 2);
    }

    #[tokio::test]
    async fn concurrent_callers_never_observe_a_duplicate() {
        let sequencer = std::sync::Arc::new(SampleSequencer::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let sequencer = std::sync::Arc::clone(&sequencer);
            handles.push(tokio::spawn(async move { sequencer.next_seq().await }));
        }
        let mut seqs: Vec<i64> = Vec::new();
        for handle in handles {
            seqs.push(handle.await.unwrap());
        }
        seqs.sort();
        let expected: Vec<i64> = (0..16).collect();
        assert_eq!(seqs, expected);
    }
}
