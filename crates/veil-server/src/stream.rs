//! At-least-once delivery pumps.
//!
//! A pump drains one mailbox receiver and pushes each item into a
//! [`Delivery`] sink, retrying the same item until the sink accepts it.
//! An item is only dequeued after the previous one was delivered, so
//! the consumer sees at-least-once in queue order. The pump ends when
//! the shutdown signal fires or the mailbox side is dropped.

use std::{fmt, future::Future, time::Duration};

use tokio::sync::{mpsc, watch};
use tracing::warn;

/// Pause between redelivery attempts after a sink failure.
const RETRY_DELAY: Duration = Duration::from_millis(50);

/// Downstream sink for pumped items, typically a network session.
pub trait Delivery<T> {
    /// Why a delivery attempt failed.
    type Error: fmt::Display;

    /// Attempt to deliver one item. The pump retries on error with the
    /// same item, so a failed attempt must not leave a partial send the
    /// consumer would misparse.
    fn deliver(&mut self, item: &T) -> impl Future<Output = Result<(), Self::Error>>;
}

/// Drive a mailbox receiver into a delivery sink until shutdown.
///
/// `shutdown` ends the pump on its next change notification; a retry
/// wait is interruptible the same way.
pub async fn pump<T, S>(
    mut items: mpsc::Receiver<T>,
    mut sink: S,
    mut shutdown: watch::Receiver<()>,
) where
    S: Delivery<T>,
{
    loop {
        let item = tokio::select! {
            changed = shutdown.changed() => {
                let _ = changed;
                return;
            },
            item = items.recv() => match item {
                Some(item) => item,
                None => return,
            },
        };

        loop {
            match sink.deliver(&item).await {
                Ok(()) => break,
                Err(error) => {
                    warn!(%error, "delivery failed, will retry");
                    tokio::select! {
                        changed = shutdown.changed() => {
                            let _ = changed;
                            return;
                        },
                        () = tokio::time::sleep(RETRY_DELAY) => {},
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    /// Fails the first `failures` attempts, records what got through.
    struct FlakySink {
        failures: usize,
        delivered: Arc<Mutex<Vec<u32>>>,
    }

    impl Delivery<u32> for FlakySink {
        type Error = String;

        async fn deliver(&mut self, item: &u32) -> Result<(), String> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err("link down".to_owned());
            }
            self.delivered.lock().expect("lock").push(*item);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_delivery_retries_same_item_in_order() {
        let (tx, rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = watch::channel(());
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let sink = FlakySink { failures: 2, delivered: Arc::clone(&delivered) };

        tx.send(1).await.expect("send");
        tx.send(2).await.expect("send");
        drop(tx);

        pump(rx, sink, shutdown_rx).await;
        assert_eq!(*delivered.lock().expect("lock"), vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_ends_the_pump() {
        let (tx, rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let delivered = Arc::new(Mutex::new(Vec::new()));
        // A sink that never succeeds: only shutdown can end the pump.
        let sink = FlakySink { failures: usize::MAX, delivered: Arc::clone(&delivered) };

        tx.send(9).await.expect("send");

        let worker = tokio::spawn(pump(rx, sink, shutdown_rx));
        tokio::task::yield_now().await;
        shutdown_tx.send(()).expect("signal");

        worker.await.expect("worker ends");
        assert!(delivered.lock().expect("lock").is_empty());
    }
}
