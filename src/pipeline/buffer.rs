//! Single-slot, latest-wins frame handoff

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};

use crossbeam::utils::CachePadded;

use crate::Frame;

/// Mailbox between the request handlers (many producers) and the publisher (one consumer).
///
/// `put` never waits for the consumer: an unconsumed frame is simply replaced, so a slow
/// camera backend sees the freshest frame rather than a backlog.
pub struct FrameBuffer {
    slot: Mutex<Slot>,
    ready: Condvar,

    /// Statistics
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Slot {
    pending: Option<Frame>,
    closed: bool,
}

#[derive(Default)]
struct Stats {
    frames_written: AtomicUsize,
    frames_read: AtomicUsize,
    frames_dropped: AtomicUsize,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::default()),
            ready: Condvar::new(),
            stats: CachePadded::new(Stats::default()),
        }
    }

    /// Producer: replace whatever is pending with `frame`
    pub fn put(&self, frame: Frame) {
        let mut slot = self.lock();
        if slot.closed {
            return;
        }

        if slot.pending.replace(frame).is_some() {
            self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("frames_dropped").increment(1);
        }
        self.stats.frames_written.fetch_add(1, Ordering::Relaxed);
        drop(slot);

        self.ready.notify_one();
    }

    /// Consumer: wait for a pending frame. Returns `None` once the buffer is closed
    /// and drained.
    pub fn take_blocking(&self) -> Option<Frame> {
        let mut slot = self.lock();
        loop {
            if let Some(frame) = slot.pending.take() {
                self.stats.frames_read.fetch_add(1, Ordering::Relaxed);
                return Some(frame);
            }
            if slot.closed {
                return None;
            }
            slot = self
                .ready
                .wait(slot)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    pub fn try_take(&self) -> Option<Frame> {
        let frame = self.lock().pending.take();
        if frame.is_some() {
            self.stats.frames_read.fetch_add(1, Ordering::Relaxed);
        }
        frame
    }

    /// Stop accepting frames and wake the consumer
    pub fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_all();
    }

    /// (written, read, dropped)
    pub fn stats(&self) -> (usize, usize, usize) {
        (
            self.stats.frames_written.load(Ordering::Relaxed),
            self.stats.frames_read.load(Ordering::Relaxed),
            self.stats.frames_dropped.load(Ordering::Relaxed),
        )
    }

    // A panicking producer can't leave the slot half-written, so poison is ignored.
    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PixelFormat;
    use bytes::Bytes;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn frame(sequence: u64) -> Frame {
        Frame::new(Bytes::from_static(&[0; 12]), sequence, 2, 2, PixelFormat::Rgb24)
    }

    #[test]
    fn last_put_wins() {
        let buffer = FrameBuffer::new();
        for seq in 1..=5 {
            buffer.put(frame(seq));
        }

        let taken = buffer.take_blocking().unwrap();
        assert_eq!(taken.meta.sequence, 5);
        assert!(buffer.try_take().is_none());
        assert_eq!(buffer.stats(), (5, 1, 4));
    }

    #[test]
    fn take_waits_for_producer() {
        let buffer = Arc::new(FrameBuffer::new());
        let producer = {
            let buffer = buffer.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                buffer.put(frame(7));
            })
        };

        assert_eq!(buffer.take_blocking().unwrap().meta.sequence, 7);
        producer.join().unwrap();
    }

    #[test]
    fn close_unblocks_consumer() {
        let buffer = Arc::new(FrameBuffer::new());
        let consumer = {
            let buffer = buffer.clone();
            thread::spawn(move || buffer.take_blocking())
        };

        thread::sleep(Duration::from_millis(50));
        buffer.close();
        assert!(consumer.join().unwrap().is_none());
    }

    #[test]
    fn pending_frame_survives_close() {
        let buffer = FrameBuffer::new();
        buffer.put(frame(1));
        buffer.close();
        buffer.put(frame(2));

        assert_eq!(buffer.take_blocking().unwrap().meta.sequence, 1);
        assert!(buffer.take_blocking().is_none());
    }

    #[test]
    fn concurrent_producers_never_block() {
        let buffer = Arc::new(FrameBuffer::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let buffer = buffer.clone();
                thread::spawn(move || {
                    for i in 0..100 {
                        buffer.put(frame(t * 1000 + i));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert!(buffer.try_take().is_some());
        let (written, read, dropped) = buffer.stats();
        assert_eq!(written, 800);
        assert_eq!(read, 1);
        assert_eq!(dropped, 799);
    }
}
