use std::{panic::AssertUnwindSafe, sync::Arc};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::error;

#[async_trait]
pub trait QueueConsumer<T>: Send + Sync + 'static {
    async fn consume(&self, item: T);
}

/// Bounded FIFO drained by exactly one task. `push` waits while the queue
/// is full, so a slow consumer slows its producers down.
pub struct OrderedQueue<T> {
    sender: mpsc::Sender<T>,
}

impl<T: Send + 'static> OrderedQueue<T> {
    pub fn spawn(name: String, capacity: usize, consumer: Arc<dyn QueueConsumer<T>>) -> Self {
        let (sender, mut receiver) = mpsc::channel::<T>(capacity.max(1));
        tokio::spawn(async move {
            while let Some(item) = receiver.recv().await {
                if AssertUnwindSafe(consumer.consume(item))
                    .catch_unwind()
                    .await
                    .is_err()
                {
                    error!(queue = %name, "queue consumer panicked, continuing with next item");
                }
            }
        });
        Self { sender }
    }

    pub async fn push(&self, item: T) -> Result<()> {
        self.sender
            .send(item)
            .await
            .map_err(|_| anyhow!("queue consumer has stopped"))
    }

    /// Free slots right now; zero means the next `push` will wait.
    pub fn available_capacity(&self) -> usize {
        self.sender.capacity()
    }
}

#[cfg(test)]
#[path = "tests/queue_tests.rs"]
mod tests;
