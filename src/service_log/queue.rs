//! Serialized writes to an append-only log.
//!
//! The log accepts one writer at a time and reports a conflict when a write
//! raced another. All writes therefore go through a single consumer task:
//! jobs run strictly in enqueue order, one at a time, and a conflicting job
//! is retried with the same arguments until it settles some other way.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::WriteError;

/// One kind of write to the log.
#[async_trait]
pub trait LogWriter: Send + Sync + 'static {
    type Args: Send + Sync + 'static;
    type Output: Send + 'static;

    async fn write(&self, args: &Self::Args) -> Result<Self::Output, WriteError>;
}

struct WriteJob<W: LogWriter> {
    seq: u64,
    args: W::Args,
    reply: oneshot::Sender<Result<W::Output, WriteError>>,
}

/// Handle for submitting writes. Clones share the same consumer.
pub struct WriteQueue<W: LogWriter> {
    tx: mpsc::UnboundedSender<WriteJob<W>>,
    next_seq: Arc<AtomicU64>,
}

impl<W: LogWriter> Clone for WriteQueue<W> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            next_seq: Arc::clone(&self.next_seq),
        }
    }
}

impl<W: LogWriter> WriteQueue<W> {
    /// Spawn the consumer task. It exits once every handle is dropped and
    /// the queued jobs are done.
    pub fn start(writer: W) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_write_loop(writer, rx));
        (
            Self {
                tx,
                next_seq: Arc::new(AtomicU64::new(0)),
            },
            handle,
        )
    }

    /// Queue a write. The job's place in line is fixed when this is called,
    /// not when the returned future is first polled.
    pub fn enqueue(
        &self,
        args: W::Args,
    ) -> impl Future<Output = Result<W::Output, WriteError>> + Send + 'static {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel();
        let queued = self.tx.send(WriteJob { seq, args, reply }).is_ok();
        if queued {
            tracing::trace!(seq, "Queued log write");
        }
        async move {
            if !queued {
                return Err(WriteError::QueueClosed);
            }
            rx.await.unwrap_or(Err(WriteError::QueueClosed))
        }
    }
}

async fn run_write_loop<W: LogWriter>(writer: W, mut rx: mpsc::UnboundedReceiver<WriteJob<W>>) {
    while let Some(job) = rx.recv().await {
        let mut attempts: u64 = 0;
        let result = loop {
            attempts += 1;
            match writer.write(&job.args).await {
                Err(e) if e.is_conflict() => {
                    tracing::debug!(seq = job.seq, attempts, "Log write conflicted, retrying: {}", e);
                    tokio::task::yield_now().await;
                }
                other => break other,
            }
        };

        match &result {
            Ok(_) => tracing::debug!(seq = job.seq, attempts, "Log write complete"),
            Err(e) => tracing::warn!(seq = job.seq, attempts, "Log write failed: {}", e),
        }
        let _ = job.reply.send(result);
    }
    tracing::debug!("Write queue closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Semaphore;
    use tokio_test::{assert_pending, assert_ready};

    /// Each write waits for a permit from the test.
    struct GatedWriter {
        gate: Arc<Semaphore>,
        events: Arc<Mutex<Vec<String>>>,
        in_flight: AtomicUsize,
    }

    #[async_trait]
    impl LogWriter for GatedWriter {
        type Args = u32;
        type Output = u32;

        async fn write(&self, args: &u32) -> Result<u32, WriteError> {
            assert_eq!(self.in_flight.fetch_add(1, Ordering::SeqCst), 0, "two writes in flight");
            self.events.lock().unwrap().push(format!("start {args}"));
            let permit = self.gate.acquire().await.unwrap();
            permit.forget();
            self.events.lock().unwrap().push(format!("end {args}"));
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if *args == 0 {
                return Err(WriteError::Failure("zero".into()));
            }
            Ok(args * 10)
        }
    }

    fn gated() -> (GatedWriter, Arc<Semaphore>, Arc<Mutex<Vec<String>>>) {
        let gate = Arc::new(Semaphore::new(0));
        let events = Arc::new(Mutex::new(Vec::new()));
        (
            GatedWriter {
                gate: gate.clone(),
                events: events.clone(),
                in_flight: AtomicUsize::new(0),
            },
            gate,
            events,
        )
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn jobs_run_one_at_a_time_in_order() {
        let (writer, gate, events) = gated();
        let (queue, _handle) = WriteQueue::start(writer);

        let mut j1 = tokio_test::task::spawn(queue.enqueue(1));
        let mut j2 = tokio_test::task::spawn(queue.enqueue(2));
        let mut j3 = tokio_test::task::spawn(queue.enqueue(3));
        settle().await;

        assert_eq!(*events.lock().unwrap(), vec!["start 1"]);
        assert_pending!(j1.poll());
        assert_pending!(j2.poll());

        gate.add_permits(1);
        settle().await;
        assert_eq!(assert_ready!(j1.poll()).unwrap(), 10);
        assert_eq!(*events.lock().unwrap(), vec!["start 1", "end 1", "start 2"]);
        assert_pending!(j3.poll());

        gate.add_permits(2);
        settle().await;
        assert_eq!(assert_ready!(j2.poll()).unwrap(), 20);
        assert_eq!(assert_ready!(j3.poll()).unwrap(), 30);
        assert_eq!(
            *events.lock().unwrap(),
            vec!["start 1", "end 1", "start 2", "end 2", "start 3", "end 3"]
        );
    }

    #[tokio::test]
    async fn failure_is_final_for_that_job_only() {
        let (writer, gate, _) = gated();
        gate.add_permits(2);
        let (queue, _handle) = WriteQueue::start(writer);

        let failed = queue.enqueue(0);
        let ok = queue.enqueue(4);
        assert_eq!(failed.await, Err(WriteError::Failure("zero".into())));
        assert_eq!(ok.await, Ok(40));
    }

    /// Conflicts a fixed number of times, then succeeds.
    struct ConflictingWriter {
        conflicts_left: AtomicUsize,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LogWriter for ConflictingWriter {
        type Args = String;
        type Output = usize;

        async fn write(&self, args: &String) -> Result<usize, WriteError> {
            self.seen.lock().unwrap().push(args.clone());
            let left = self.conflicts_left.load(Ordering::SeqCst);
            if left > 0 {
                self.conflicts_left.store(left - 1, Ordering::SeqCst);
                return Err(WriteError::Conflict("source chain head has moved".into()));
            }
            Ok(self.seen.lock().unwrap().len())
        }
    }

    #[tokio::test]
    async fn conflicts_are_retried_with_same_args() {
        let writer = Arc::new(ConflictingWriter {
            conflicts_left: AtomicUsize::new(25),
            seen: Mutex::new(Vec::new()),
        });
        let (queue, _handle) = WriteQueue::start(SharedWriter(writer.clone()));

        let first = queue.enqueue("entry-a".to_string());
        let second = queue.enqueue("entry-b".to_string());
        assert_eq!(first.await, Ok(26));
        assert_eq!(second.await, Ok(27));

        let seen = writer.seen.lock().unwrap();
        assert!(seen[..26].iter().all(|args| args == "entry-a"));
        assert_eq!(seen[26], "entry-b");
    }

    struct SharedWriter(Arc<ConflictingWriter>);

    #[async_trait]
    impl LogWriter for SharedWriter {
        type Args = String;
        type Output = usize;

        async fn write(&self, args: &String) -> Result<usize, WriteError> {
            self.0.write(args).await
        }
    }

    #[tokio::test]
    async fn consumer_exits_when_handles_dropped() {
        let (writer, _gate, _) = gated();
        let (queue, handle) = WriteQueue::start(writer);
        let clone = queue.clone();
        drop(queue);
        drop(clone);
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .expect("consumer did not exit")
            .unwrap();
    }

    #[tokio::test]
    async fn consumer_finishes_queued_jobs_after_handles_dropped() {
        let (writer, gate, events) = gated();
        let (queue, handle) = WriteQueue::start(writer);
        let first = queue.enqueue(1);
        let second = queue.enqueue(2);
        drop(queue);
        settle().await;
        assert!(!handle.is_finished());

        gate.add_permits(2);
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .expect("consumer did not exit")
            .unwrap();
        assert_eq!(first.await, Ok(10));
        assert_eq!(second.await, Ok(20));
        assert_eq!(
            *events.lock().unwrap(),
            vec!["start 1", "end 1", "start 2", "end 2"]
        );
    }
}
