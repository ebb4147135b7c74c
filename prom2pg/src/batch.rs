use tokio::sync::mpsc;
use tracing::error;

/// Fixed-capacity accumulator feeding a stage channel.
///
/// Not safe for concurrent producers: exactly one task owns each
/// instance. Several instances may feed the same channel; batches stay
/// FIFO per producer.
pub struct Batcher<T> {
    capacity: usize,
    buf: Vec<T>,
    out: mpsc::Sender<Vec<T>>,
}

impl<T> Batcher<T> {
    pub fn new(capacity: usize, out: mpsc::Sender<Vec<T>>) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            buf: Vec::with_capacity(capacity),
            out,
        }
    }

    /// Appends one unit; a full buffer is sent as one batch and cleared.
    /// Blocks only while the stage channel is at capacity.
    pub async fn add(&mut self, unit: T) {
        self.buf.push(unit);
        if self.buf.len() >= self.capacity {
            self.send(self.capacity).await;
        }
    }

    /// Sends any buffered units as a partial batch. No-op when empty.
    /// Use on shutdown or to bound the staleness of queued work.
    pub async fn flush(&mut self) {
        if !self.buf.is_empty() {
            let expected = self.buf.len();
            self.send(expected).await;
        }
    }

    async fn send(&mut self, expected: usize) {
        let batch = std::mem::replace(&mut self.buf, Vec::with_capacity(self.capacity));
        if batch.len() != expected {
            // programming error; drop rather than ship a corrupt batch
            error!(
                got = batch.len(),
                expected, "batch length mismatch, dropping batch"
            );
            return;
        }
        if self.out.send(batch).await.is_err() {
            error!("stage channel closed, dropping batch");
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add_flushes_exactly_at_capacity() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut batcher = Batcher::new(3, tx);
        for i in 0..3 {
            batcher.add(i).await;
        }
        assert_eq!(rx.try_recv().unwrap(), vec![0, 1, 2]);
        assert!(batcher.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_flush_sends_partial_batch() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut batcher = Batcher::new(5, tx);
        batcher.add("a").await;
        batcher.add("b").await;
        assert!(rx.try_recv().is_err());
        batcher.flush().await;
        assert_eq!(rx.try_recv().unwrap(), vec!["a", "b"]);
        assert!(batcher.is_empty());
    }

    #[tokio::test]
    async fn test_flush_on_empty_sends_nothing() {
        let (tx, mut rx) = mpsc::channel::<Vec<u32>>(4);
        let mut batcher = Batcher::new(3, tx);
        batcher.flush().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_batches_keep_arrival_order() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut batcher = Batcher::new(2, tx);
        for i in 0..4 {
            batcher.add(i).await;
        }
        assert_eq!(rx.try_recv().unwrap(), vec![0, 1]);
        assert_eq!(rx.try_recv().unwrap(), vec![2, 3]);
    }
}
