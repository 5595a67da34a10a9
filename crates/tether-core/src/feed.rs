//! Bridge from a blocking producer into async code.
//!
//! A producer that polls a blocking resource (a log file, a stats counter,
//! a device) runs on its own OS thread and pushes into a bounded queue. The
//! async side drains the queue in order. A full queue blocks the producer.

use std::thread;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Producer half handed to the blocking worker.
pub struct FeedSender<T> {
    tx: mpsc::Sender<T>,
}

impl<T> FeedSender<T> {
    /// Push one item, blocking while the queue is full.
    ///
    /// Returns `false` once the consumer is gone; the producer should stop.
    pub fn push(&self, item: T) -> bool {
        self.tx.blocking_send(item).is_ok()
    }

    /// Whether the consumer has been dropped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half: an ordered, bounded stream of produced items.
pub struct BlockingFeed<T> {
    rx: mpsc::Receiver<T>,
}

impl<T: Send + 'static> BlockingFeed<T> {
    /// Start `producer` on a dedicated thread named `name`.
    ///
    /// The feed ends when the producer returns.
    ///
    /// # Errors
    /// Returns error if the thread cannot be spawned.
    pub fn spawn<F>(name: &str, capacity: usize, producer: F) -> std::io::Result<Self>
    where
        F: FnOnce(FeedSender<T>) + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                producer(FeedSender { tx });
                tracing::debug!("Blocking feed producer finished");
            })?;
        Ok(Self { rx })
    }

    /// Next produced item, or `None` when the producer has finished.
    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Convert into a `Stream`.
    #[must_use]
    pub fn into_stream(self) -> ReceiverStream<T> {
        ReceiverStream::new(self.rx)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use futures::StreamExt;

    use super::*;

    #[tokio::test]
    async fn items_arrive_in_order() {
        let feed = BlockingFeed::spawn("ordered", 4, |tx| {
            for i in 0..20 {
                if !tx.push(i) {
                    return;
                }
            }
        })
        .unwrap();

        let items: Vec<i32> = feed.into_stream().collect().await;
        assert_eq!(items, (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn full_queue_blocks_producer() {
        let pushed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&pushed);
        let mut feed = BlockingFeed::spawn("bounded", 2, move |tx| {
            for i in 0..5 {
                if !tx.push(i) {
                    return;
                }
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pushed.load(Ordering::SeqCst), 2);

        assert_eq!(feed.next().await, Some(0));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pushed.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn dropping_consumer_stops_producer() {
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let feed = BlockingFeed::spawn("stoppable", 1, move |tx| {
            let mut n = 0u64;
            while tx.push(n) {
                n += 1;
            }
            let _ = done_tx.send(());
        })
        .unwrap();

        drop(feed);
        let stopped = tokio::task::spawn_blocking(move || {
            done_rx.recv_timeout(Duration::from_secs(2)).is_ok()
        })
        .await
        .unwrap();
        assert!(stopped);
    }
}
