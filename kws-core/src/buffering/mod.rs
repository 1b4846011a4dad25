//! Fixed-capacity SPSC byte ring with timed blocking on both ends.
//!
//! Storage is a `ringbuf::HeapRb<u8>` split into producer and consumer
//! halves, so the two sides never touch the same byte concurrently. The
//! halves additionally share a `parking_lot` mutex/condvar pair used only to
//! park a writer on a full ring or a reader on an empty one until the peer
//! makes progress or the timeout expires.
//!
//! Partial transfers are normal results, never errors: a write into a full
//! ring returns however many bytes fit before the deadline.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use ringbuf::{
    traits::{Consumer, Observer, Producer, Split},
    HeapCons, HeapProd, HeapRb,
};

use crate::error::{KwsError, Result};

/// Wake-up channel shared by both halves.
#[derive(Default)]
struct Signal {
    lock: Mutex<()>,
    cond: Condvar,
}

impl Signal {
    /// Taking the lock before notifying closes the window between a peer's
    /// "is full/empty" check and its wait.
    fn notify(&self) {
        let _guard = self.lock.lock();
        self.cond.notify_all();
    }
}

/// Writer half, owned by the capture thread.
pub struct RingProducer {
    inner: HeapProd<u8>,
    signal: Arc<Signal>,
}

/// Reader half, owned by the recognition thread.
pub struct RingConsumer {
    inner: HeapCons<u8>,
    signal: Arc<Signal>,
}

/// Create a matched producer/consumer pair over `capacity` bytes.
///
/// The storage is allocated once here and never grows.
///
/// # Errors
/// `KwsError::RingBufferCapacity` when `capacity` is zero.
pub fn create_ring(capacity: usize) -> Result<(RingProducer, RingConsumer)> {
    if capacity == 0 {
        return Err(KwsError::RingBufferCapacity);
    }
    let (prod, cons) = HeapRb::<u8>::new(capacity).split();
    let signal = Arc::new(Signal::default());
    Ok((
        RingProducer {
            inner: prod,
            signal: Arc::clone(&signal),
        },
        RingConsumer {
            inner: cons,
            signal,
        },
    ))
}

impl RingProducer {
    /// Copy as much of `data` into the ring as fits before `timeout` elapses.
    ///
    /// Returns the number of bytes written, in `0..=data.len()`. Never
    /// overwrites unread bytes.
    pub fn write(&mut self, data: &[u8], timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut written = 0;

        loop {
            let n = self.inner.push_slice(&data[written..]);
            if n > 0 {
                written += n;
                self.signal.notify();
            }
            if written == data.len() {
                return written;
            }

            let mut guard = self.signal.lock.lock();
            if self.inner.is_full()
                && self
                    .signal
                    .cond
                    .wait_until(&mut guard, deadline)
                    .timed_out()
            {
                drop(guard);
                let n = self.inner.push_slice(&data[written..]);
                if n > 0 {
                    written += n;
                    self.signal.notify();
                }
                return written;
            }
        }
    }

    /// Bytes currently queued and unread.
    pub fn filled(&self) -> usize {
        self.inner.occupied_len()
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.inner.capacity().get()
    }
}

impl RingConsumer {
    /// Fill `out` with queued bytes, waiting up to `timeout` for the producer.
    ///
    /// Returns the number of bytes read, in `0..=out.len()`. A short count
    /// means the deadline passed before enough audio arrived.
    pub fn read(&mut self, out: &mut [u8], timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut read = 0;

        loop {
            let n = self.inner.pop_slice(&mut out[read..]);
            if n > 0 {
                read += n;
                self.signal.notify();
            }
            if read == out.len() {
                return read;
            }

            let mut guard = self.signal.lock.lock();
            if self.inner.is_empty()
                && self
                    .signal
                    .cond
                    .wait_until(&mut guard, deadline)
                    .timed_out()
            {
                drop(guard);
                let n = self.inner.pop_slice(&mut out[read..]);
                if n > 0 {
                    read += n;
                    self.signal.notify();
                }
                return read;
            }
        }
    }

    /// Drop up to `count` queued bytes without copying them out.
    pub fn skip(&mut self, count: usize) -> usize {
        let skipped = self.inner.skip(count.min(self.inner.occupied_len()));
        if skipped > 0 {
            self.signal.notify();
        }
        skipped
    }

    /// Drop everything currently queued. Returns the number of bytes discarded.
    pub fn discard_all(&mut self) -> usize {
        let n = self.inner.occupied_len();
        self.skip(n)
    }

    /// Bytes currently queued and unread.
    pub fn filled(&self) -> usize {
        self.inner.occupied_len()
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.inner.capacity().get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    const NO_WAIT: Duration = Duration::ZERO;

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(matches!(create_ring(0), Err(KwsError::RingBufferCapacity)));
    }

    #[test]
    fn round_trip_preserves_order() {
        let (mut tx, mut rx) = create_ring(64).unwrap();
        let data: Vec<u8> = (0..64u8).collect();

        assert_eq!(tx.write(&data, NO_WAIT), 64);
        assert_eq!(rx.filled(), 64);

        let mut out = [0u8; 64];
        assert_eq!(rx.read(&mut out, NO_WAIT), 64);
        assert_eq!(&out[..], &data[..]);
        assert_eq!(rx.filled(), 0);
    }

    #[test]
    fn overflow_transfers_exactly_capacity() {
        let (mut tx, _rx) = create_ring(100).unwrap();
        let data = vec![7u8; 130];

        let written = tx.write(&data, Duration::from_millis(10));
        assert_eq!(written, 100);

        // Full ring: nothing more fits, and nothing is overwritten.
        assert_eq!(tx.write(&[1, 2, 3], NO_WAIT), 0);
        assert_eq!(tx.filled(), 100);
    }

    #[test]
    fn read_from_empty_ring_times_out_with_zero() {
        let (_tx, mut rx) = create_ring(16).unwrap();
        let mut out = [0u8; 8];
        let start = Instant::now();
        assert_eq!(rx.read(&mut out, Duration::from_millis(20)), 0);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn partial_read_returns_what_is_available() {
        let (mut tx, mut rx) = create_ring(16).unwrap();
        tx.write(&[1, 2, 3], NO_WAIT);
        let mut out = [0u8; 8];
        assert_eq!(rx.read(&mut out, Duration::from_millis(5)), 3);
        assert_eq!(&out[..3], &[1, 2, 3]);
    }

    #[test]
    fn skip_drops_a_prefix_and_frees_space() {
        let (mut tx, mut rx) = create_ring(8).unwrap();
        assert_eq!(tx.write(&[1, 2, 3, 4, 5, 6, 7, 8], NO_WAIT), 8);

        assert_eq!(rx.skip(3), 3);
        assert_eq!(rx.skip(0), 0);
        assert_eq!(tx.write(&[9, 10, 11, 12], NO_WAIT), 3);

        let mut out = [0u8; 8];
        assert_eq!(rx.read(&mut out, NO_WAIT), 8);
        assert_eq!(out, [4, 5, 6, 7, 8, 9, 10, 11]);
        assert_eq!(rx.skip(5), 0);
    }

    #[test]
    fn blocked_reader_wakes_when_producer_writes() {
        let (mut tx, mut rx) = create_ring(1024).unwrap();

        let reader = thread::spawn(move || {
            let mut out = [0u8; 600];
            let n = rx.read(&mut out, Duration::from_secs(2));
            (n, out)
        });

        for chunk in (0..600u32).map(|i| i as u8).collect::<Vec<_>>().chunks(100) {
            thread::sleep(Duration::from_millis(2));
            assert_eq!(tx.write(chunk, NO_WAIT), chunk.len());
        }

        let (n, out) = reader.join().expect("reader panicked");
        assert_eq!(n, 600);
        let expected: Vec<u8> = (0..600u32).map(|i| i as u8).collect();
        assert_eq!(&out[..], &expected[..]);
    }

    #[test]
    fn blocked_writer_completes_once_reader_drains() {
        let (mut tx, mut rx) = create_ring(32).unwrap();

        let writer = thread::spawn(move || {
            let data: Vec<u8> = (0..96u8).collect();
            tx.write(&data, Duration::from_secs(2))
        });

        let mut collected = Vec::new();
        let mut buf = [0u8; 16];
        while collected.len() < 96 {
            let n = rx.read(&mut buf, Duration::from_secs(2));
            assert!(n > 0, "reader starved");
            collected.extend_from_slice(&buf[..n]);
        }

        assert_eq!(writer.join().expect("writer panicked"), 96);
        let expected: Vec<u8> = (0..96u8).collect();
        assert_eq!(collected, expected);
    }

    #[test]
    fn discard_all_empties_the_ring() {
        let (mut tx, mut rx) = create_ring(16).unwrap();
        tx.write(&[9; 10], NO_WAIT);
        assert_eq!(rx.discard_all(), 10);
        assert_eq!(rx.filled(), 0);
        assert_eq!(tx.write(&[1; 16], NO_WAIT), 16);
    }
}
