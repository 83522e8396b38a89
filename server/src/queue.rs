//! Cross-thread plumbing between the control thread and the network thread
//!
//! A chunk queue carries discrete binary records from exactly one producer to
//! exactly one consumer. Both ends are non-blocking: writes fail when the
//! queue is full and reads return `None` when it is empty. The record count
//! bound comes from the channel capacity; the byte bound is tracked with an
//! atomic counter shared by the two endpoints.
//!
//! A producer that was turned away can wait for the consumer to free space
//! with [`ChunkProducer::writable`], which is how the network loop holds back
//! events instead of dropping them.
//!
//! [`WakeSignal`] interrupts the network loop's readiness wait. A wake that
//! arrives while nobody is waiting is remembered, and several wakes collapse
//! into one, so consumers must drain their queue completely per wake.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tokio::sync::Notify;

use crate::config::QueueLimits;
use crate::error::QueueError;

/// Creates a bounded single-producer/single-consumer record queue
pub fn chunk_queue(limits: QueueLimits) -> (ChunkProducer, ChunkConsumer) {
    let (sender, receiver) = mpsc::channel(limits.max_records.max(1));
    let used_bytes = Arc::new(AtomicUsize::new(0));
    let space = WakeSignal::new();

    (
        ChunkProducer {
            sender,
            used_bytes: Arc::clone(&used_bytes),
            max_bytes: limits.max_bytes,
            space: space.clone(),
        },
        ChunkConsumer {
            receiver,
            used_bytes,
            space,
        },
    )
}

/// Writing end of a chunk queue
#[derive(Debug)]
pub struct ChunkProducer {
    sender: mpsc::Sender<Vec<u8>>,
    used_bytes: Arc<AtomicUsize>,
    max_bytes: usize,
    space: WakeSignal,
}

impl ChunkProducer {
    /// Appends a whole record, or fails without queuing any part of it.
    ///
    /// A record larger than the queue's byte bound can never be written and
    /// fails with [`QueueError::RecordTooLarge`]; one that only lacks room
    /// right now fails with [`QueueError::Full`].
    pub fn write(&self, record: Vec<u8>) -> Result<(), QueueError> {
        if record.is_empty() {
            return Err(QueueError::EmptyRecord);
        }

        let len = record.len();
        if len > self.max_bytes {
            return Err(QueueError::RecordTooLarge {
                len,
                max: self.max_bytes,
            });
        }

        let previous = self.used_bytes.fetch_add(len, Ordering::AcqRel);
        if previous + len > self.max_bytes {
            self.used_bytes.fetch_sub(len, Ordering::AcqRel);
            return Err(QueueError::Full);
        }

        match self.sender.try_send(record) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.used_bytes.fetch_sub(len, Ordering::AcqRel);
                match err {
                    TrySendError::Full(_) => Err(QueueError::Full),
                    TrySendError::Closed(_) => Err(QueueError::Closed),
                }
            }
        }
    }

    /// Whether a record of `len` bytes would be accepted right now
    ///
    /// Only the consumer runs concurrently and it can only free space, so a
    /// `true` answer holds until this producer writes.
    pub fn has_room(&self, len: usize) -> bool {
        self.sender.capacity() > 0 && self.queued_bytes() + len <= self.max_bytes
    }

    /// Byte capacity of the queue; no single record can be larger
    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Payload bytes currently queued and not yet read
    pub fn queued_bytes(&self) -> usize {
        self.used_bytes.load(Ordering::Acquire)
    }

    /// Resolves after the consumer has taken a record.
    ///
    /// A read that happened since the last call is remembered, so the
    /// producer cannot miss freed space between a failed write and this
    /// wait. Wakes may be spurious; retry the write afterwards.
    pub async fn writable(&self) {
        self.space.wait().await;
    }
}

/// Reading end of a chunk queue
#[derive(Debug)]
pub struct ChunkConsumer {
    receiver: mpsc::Receiver<Vec<u8>>,
    used_bytes: Arc<AtomicUsize>,
    space: WakeSignal,
}

impl ChunkConsumer {
    /// Takes the next record if one is queued. Never blocks.
    ///
    /// Records written before the producer went away are still returned.
    pub fn read(&mut self) -> Option<Vec<u8>> {
        match self.receiver.try_recv() {
            Ok(record) => {
                self.used_bytes.fetch_sub(record.len(), Ordering::AcqRel);
                self.space.wake();
                Some(record)
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }
}

/// Wakes a task blocked in [`WakeSignal::wait`] from any thread.
#[derive(Debug, Clone, Default)]
pub struct WakeSignal {
    notify: Arc<Notify>,
}

impl WakeSignal {
    /// Creates a signal with no wake pending
    pub fn new() -> Self {
        Self::default()
    }

    /// Signals the waiting task, or the next one to wait if none is waiting
    ///
    /// Never blocks and is safe to call from threads outside the runtime.
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    /// Waits until [`wake`](Self::wake) has been called
    ///
    /// Consumes the pending wake; wakes issued before this call collapse
    /// into one.
    pub async fn wait(&self) {
        self.notify.notified().await;
    }
}

/// Test suite for chunk queue bounds, ordering and wake signalling
#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn limits(max_records: usize, max_bytes: usize) -> QueueLimits {
        QueueLimits {
            max_records,
            max_bytes,
        }
    }

    #[test]
    fn test_records_come_back_whole_and_in_order() {
        let (producer, mut consumer) = chunk_queue(limits(8, 1024));

        producer.write(vec![1]).unwrap();
        producer.write(vec![2, 3, 4]).unwrap();
        producer.write(vec![5, 6]).unwrap();

        assert_eq!(consumer.read(), Some(vec![1]));
        assert_eq!(consumer.read(), Some(vec![2, 3, 4]));
        assert_eq!(consumer.read(), Some(vec![5, 6]));
        assert_eq!(consumer.read(), None);
    }

    #[test]
    fn test_empty_read_is_idempotent() {
        let (producer, mut consumer) = chunk_queue(limits(4, 64));

        for _ in 0..10 {
            assert_eq!(consumer.read(), None);
        }
        assert_eq!(producer.queued_bytes(), 0);
    }

    #[test]
    fn test_record_count_limit() {
        let (producer, mut consumer) = chunk_queue(limits(2, 1024));

        producer.write(vec![1]).unwrap();
        producer.write(vec![2]).unwrap();
        assert_eq!(producer.write(vec![3]), Err(QueueError::Full));
        assert_eq!(producer.queued_bytes(), 2);

        consumer.read().unwrap();
        producer.write(vec![3]).unwrap();
    }

    #[test]
    fn test_byte_limit() {
        let (producer, mut consumer) = chunk_queue(limits(10, 8));

        producer.write(vec![0; 5]).unwrap();
        assert_eq!(producer.write(vec![0; 4]), Err(QueueError::Full));
        assert_eq!(producer.queued_bytes(), 5);

        producer.write(vec![0; 3]).unwrap();
        assert_eq!(producer.queued_bytes(), 8);

        consumer.read().unwrap();
        assert_eq!(producer.queued_bytes(), 3);
        producer.write(vec![0; 4]).unwrap();
    }

    #[test]
    fn test_has_room_tracks_both_bounds() {
        let (producer, mut consumer) = chunk_queue(limits(2, 8));
        assert!(producer.has_room(8));
        assert!(!producer.has_room(9));

        producer.write(vec![0; 6]).unwrap();
        assert!(producer.has_room(2));
        assert!(!producer.has_room(3));

        producer.write(vec![0; 1]).unwrap();
        assert!(!producer.has_room(1));

        consumer.read().unwrap();
        assert!(producer.has_room(7));
        assert_eq!(producer.max_bytes(), 8);
    }

    #[test]
    fn test_oversized_record_is_never_accepted() {
        let (producer, _consumer) = chunk_queue(limits(10, 8));

        assert_eq!(
            producer.write(vec![0; 9]),
            Err(QueueError::RecordTooLarge { len: 9, max: 8 })
        );
        assert_eq!(producer.queued_bytes(), 0);
    }

    #[test]
    fn test_empty_record_is_rejected() {
        let (producer, _consumer) = chunk_queue(limits(4, 64));
        assert_eq!(producer.write(Vec::new()), Err(QueueError::EmptyRecord));
    }

    #[test]
    fn test_closed_queue() {
        let (producer, consumer) = chunk_queue(limits(4, 64));
        drop(consumer);

        assert_eq!(producer.write(vec![1]), Err(QueueError::Closed));
    }

    #[test]
    fn test_records_survive_producer_drop() {
        let (producer, mut consumer) = chunk_queue(limits(4, 64));
        producer.write(vec![7]).unwrap();
        drop(producer);

        assert_eq!(consumer.read(), Some(vec![7]));
        assert_eq!(consumer.read(), None);
    }

    #[test]
    fn test_producer_on_other_thread() {
        let (producer, mut consumer) = chunk_queue(limits(100, 10_000));

        let writer = std::thread::spawn(move || {
            for i in 0..100u8 {
                producer.write(vec![i; usize::from(i % 7) + 1]).unwrap();
            }
        });
        writer.join().unwrap();

        for i in 0..100u8 {
            let record = consumer.read().unwrap();
            assert_eq!(record[0], i);
            assert_eq!(record.len(), usize::from(i % 7) + 1);
        }
        assert_eq!(consumer.read(), None);
    }

    #[tokio::test]
    async fn test_writable_after_consumer_reads() {
        let (producer, mut consumer) = chunk_queue(limits(1, 64));
        producer.write(vec![1]).unwrap();
        assert_eq!(producer.write(vec![2]), Err(QueueError::Full));

        let reader = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            consumer.read()
        });

        assert!(
            tokio::time::timeout(Duration::from_secs(2), producer.writable())
                .await
                .is_ok()
        );
        assert_eq!(reader.join().unwrap(), Some(vec![1]));
        producer.write(vec![2]).unwrap();
    }

    #[tokio::test]
    async fn test_writable_waits_while_nothing_is_read() {
        let (producer, _consumer) = chunk_queue(limits(1, 64));
        producer.write(vec![1]).unwrap();

        assert!(
            tokio::time::timeout(Duration::from_millis(50), producer.writable())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_wake_before_wait_is_not_lost() {
        let wake = WakeSignal::new();
        wake.wake();

        let woke = tokio::time::timeout(Duration::from_millis(100), wake.wait()).await;
        assert!(woke.is_ok());
    }

    #[tokio::test]
    async fn test_wakes_coalesce() {
        let wake = WakeSignal::new();
        wake.wake();
        wake.wake();
        wake.wake();

        assert!(tokio::time::timeout(Duration::from_millis(50), wake.wait())
            .await
            .is_ok());
        assert!(tokio::time::timeout(Duration::from_millis(50), wake.wait())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_wake_from_other_thread() {
        let wake = WakeSignal::new();
        let remote = wake.clone();

        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            remote.wake();
        });

        assert!(tokio::time::timeout(Duration::from_secs(2), wake.wait())
            .await
            .is_ok());
    }
}
