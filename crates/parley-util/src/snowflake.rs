use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Custom epoch: 2024-01-01T00:00:00Z
const PARLEY_EPOCH: u64 = 1_704_067_200_000;

const SEQUENCE_BITS: u64 = 12;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

/// Last issued (timestamp << 12 | sequence), shared by every worker id in the process.
static LAST: AtomicU64 = AtomicU64::new(0);

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(PARLEY_EPOCH)
        .max(PARLEY_EPOCH)
}

/// Generate a Snowflake ID.
/// Format: 42 bits timestamp | 10 bits worker | 12 bits sequence
///
/// Ids are strictly increasing within a process, so they double as a
/// creation order for messages.
pub fn generate(worker_id: u16) -> i64 {
    let mut last = LAST.load(Ordering::Relaxed);
    let stamp = loop {
        let now = (now_millis() - PARLEY_EPOCH) << SEQUENCE_BITS;
        // Clock went backwards or the sequence for this ms is exhausted: borrow from the future.
        let next = if now > last { now } else { last + 1 };
        match LAST.compare_exchange_weak(last, next, Ordering::SeqCst, Ordering::Relaxed) {
            Ok(_) => break next,
            Err(observed) => last = observed,
        }
    };
    let timestamp = stamp >> SEQUENCE_BITS;
    let seq = stamp & SEQUENCE_MASK;
    ((timestamp << 22) | ((worker_id as u64 & 0x3FF) << 12) | seq) as i64
}

/// Extract the Unix timestamp (ms) from a snowflake.
pub fn timestamp_millis(id: i64) -> u64 {
    ((id as u64) >> 22) + PARLEY_EPOCH
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_strictly_increasing() {
        let mut prev = generate(1);
        for _ in 0..10_000 {
            let next = generate(1);
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn timestamp_is_recoverable() {
        let before = now_millis();
        let id = generate(3);
        let ts = timestamp_millis(id);
        assert!(ts + 1 >= before);
        assert_eq!((id as u64 >> 12) & 0x3FF, 3);
    }

    #[test]
    fn concurrent_generation_has_no_duplicates() {
        let handles: Vec<_> = (0..4)
            .map(|_| std::thread::spawn(|| (0..2_000).map(|_| generate(0)).collect::<Vec<_>>()))
            .collect();
        let mut all: Vec<i64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        let total = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), total);
    }
}
