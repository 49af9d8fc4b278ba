//! 帧环形缓冲 (Frame ring buffer)
//!
//! Bounded hand-off between the capture thread and the inference workers.
//! Overflow drops the OLDEST frame: for live detection a fresh frame is worth
//! more than a complete record. Drops are counted, never silent.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::input::ThermalFrame;

pub struct FrameRing {
    tx: Sender<ThermalFrame>,
    rx: Receiver<ThermalFrame>,
    capacity: usize,
    dropped: AtomicU64,
}

impl FrameRing {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        Self {
            tx,
            rx,
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Push a frame, evicting the oldest when full. Returns `false` when an
    /// eviction happened (the new frame itself is always stored).
    pub fn push(&self, frame: ThermalFrame) -> bool {
        let mut frame = frame;
        let mut evicted = false;
        loop {
            match self.tx.try_send(frame) {
                Ok(()) => return !evicted,
                Err(TrySendError::Full(rejected)) => {
                    frame = rejected;
                    // A consumer may have drained concurrently; only count a
                    // drop when we actually removed something.
                    if self.rx.try_recv().is_ok() {
                        evicted = true;
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Err(TrySendError::Disconnected(_)) => return false,
            }
        }
    }

    /// Pop the oldest frame, waiting at most `timeout`.
    pub fn pop(&self, timeout: Duration) -> Option<ThermalFrame> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Some(frame),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total frames evicted by overflow since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(seq: u64) -> ThermalFrame {
        ThermalFrame::new(seq, 4, 4, vec![0; 16])
    }

    #[test]
    fn test_never_exceeds_capacity() {
        let ring = FrameRing::with_capacity(3);
        for seq in 1..=50 {
            ring.push(frame(seq));
            assert!(ring.len() <= 3);
        }
    }

    #[test]
    fn test_overflow_drops_oldest_keeps_newest() {
        let ring = FrameRing::with_capacity(2);
        assert!(ring.push(frame(1)));
        assert!(ring.push(frame(2)));
        assert!(!ring.push(frame(3))); // evicts frame 1

        assert_eq!(ring.dropped(), 1);
        assert_eq!(ring.pop(Duration::from_millis(1)).unwrap().seq, 2);
        assert_eq!(ring.pop(Duration::from_millis(1)).unwrap().seq, 3);
    }

    #[test]
    fn test_drop_counter_monotonic() {
        let ring = FrameRing::with_capacity(1);
        for seq in 1..=10 {
            ring.push(frame(seq));
        }
        assert_eq!(ring.dropped(), 9);
        assert_eq!(ring.pop(Duration::from_millis(1)).unwrap().seq, 10);
    }

    #[test]
    fn test_pop_times_out_when_empty() {
        let ring = FrameRing::with_capacity(2);
        assert!(ring.pop(Duration::from_millis(5)).is_none());
    }

    #[test]
    fn test_concurrent_producer_consumer() {
        use std::sync::Arc;

        let ring = Arc::new(FrameRing::with_capacity(4));
        let producer_ring = ring.clone();
        let producer = std::thread::spawn(move || {
            for seq in 1..=500 {
                producer_ring.push(frame(seq));
            }
        });

        let mut last_seen = 0u64;
        let mut received = 0u64;
        while received + ring.dropped() < 500 {
            if let Some(f) = ring.pop(Duration::from_millis(10)) {
                // Drop-oldest keeps the stream ordered even under eviction.
                assert!(f.seq > last_seen);
                last_seen = f.seq;
                received += 1;
            }
        }
        producer.join().unwrap();
        assert_eq!(received + ring.dropped(), 500);
    }
}
