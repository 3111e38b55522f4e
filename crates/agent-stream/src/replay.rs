//! Append-only replay buffer.
//!
//! Every event bound for a client is appended here before delivery, which
//! decouples the producer (the agent stream) from any one consumer: a client
//! that disconnects and comes back replays the prefix it missed and then
//! tails the live suffix. Entries are immutable once appended and only the
//! tail ever grows, so cursor reads need no coordination beyond the lock.

use std::sync::Mutex;

struct Inner<T> {
    entries: Vec<T>,
    complete: bool,
}

/// Totally-ordered, append-only event log for a single stream.
pub struct ReplayBuffer<T> {
    inner: Mutex<Inner<T>>,
}

impl<T: Clone> ReplayBuffer<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: Vec::new(),
                complete: false,
            }),
        }
    }

    /// Append an entry. Succeeds whether or not anyone is listening.
    pub fn push(&self, entry: T) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.entries.push(entry);
        }
    }

    /// Mark the stream finished. Readers that catch up past this point stop
    /// tailing.
    pub fn mark_complete(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.complete = true;
        }
    }

    /// Clear the completion mark for a new turn on the same stream.
    pub fn mark_streaming(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.complete = false;
        }
    }

    pub fn is_complete(&self) -> bool {
        self.inner.lock().map(|inner| inner.complete).unwrap_or(true)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read everything from `cursor` onward, returning the new entries and
    /// whether the stream was complete at the time of the read. The caller
    /// advances its cursor by the returned batch length.
    pub fn read_from(&self, cursor: usize) -> (Vec<T>, bool) {
        match self.inner.lock() {
            Ok(inner) => {
                let batch = if cursor < inner.entries.len() {
                    inner.entries[cursor..].to_vec()
                } else {
                    Vec::new()
                };
                (batch, inner.complete)
            }
            Err(_) => (Vec::new(), true),
        }
    }

    /// Snapshot of the full log so far.
    pub fn snapshot(&self) -> Vec<T> {
        self.read_from(0).0
    }
}

impl<T: Clone> Default for ReplayBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_snapshot_preserve_order() {
        let buffer = ReplayBuffer::new();
        for i in 0..10 {
            buffer.push(i);
        }
        assert_eq!(buffer.snapshot(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_cursor_reads_are_monotonic() {
        let buffer = ReplayBuffer::new();
        buffer.push("a");
        buffer.push("b");

        let (first, complete) = buffer.read_from(0);
        assert_eq!(first, vec!["a", "b"]);
        assert!(!complete);

        buffer.push("c");
        let (second, _) = buffer.read_from(first.len());
        assert_eq!(second, vec!["c"]);

        // Reading past the end yields nothing rather than panicking.
        let (empty, _) = buffer.read_from(10);
        assert!(empty.is_empty());
    }

    #[test]
    fn test_completion_flag_roundtrip() {
        let buffer: ReplayBuffer<u8> = ReplayBuffer::new();
        assert!(!buffer.is_complete());
        buffer.mark_complete();
        assert!(buffer.is_complete());
        buffer.mark_streaming();
        assert!(!buffer.is_complete());
    }

    #[test]
    fn test_replay_equals_live_stream() {
        // Interleave appends with cursor reads; the concatenation of all
        // batches must equal the full log.
        let buffer = ReplayBuffer::new();
        let mut observed = Vec::new();
        let mut cursor = 0;
        for chunk in [vec![1, 2], vec![3], vec![], vec![4, 5, 6]] {
            for v in &chunk {
                buffer.push(*v);
            }
            let (batch, _) = buffer.read_from(cursor);
            cursor += batch.len();
            observed.extend(batch);
        }
        assert_eq!(observed, buffer.snapshot());
    }
}
