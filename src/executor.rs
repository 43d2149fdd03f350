use crate::{
    config::ExecutorConfig,
    detection::{Detection, DetectionParams},
    frame::Frame,
    model_service::{InferError, ModelHandle},
};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::{
    future::Future,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread,
};
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Inference queue is full")]
    Overloaded,
    #[error("Inference job was cancelled")]
    Cancelled,
    #[error("Inference executor is shut down")]
    ShutDown,
    #[error(transparent)]
    Inference(#[from] InferError),
    #[error("Inference worker panicked")]
    WorkerPanicked,
}

type Reply = Result<Vec<Detection>, ExecutorError>;

/// Shared flag marking every job of one request as abandoned.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Returns a guard that cancels the token when dropped.
    pub fn drop_guard(&self) -> CancelOnDrop {
        CancelOnDrop(self.clone())
    }
}

pub struct CancelOnDrop(CancelToken);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

struct Job {
    frame: Frame,
    params: DetectionParams,
    cancel: CancelToken,
    reply: oneshot::Sender<Reply>,
}

/// Fixed pool of inference threads fed by one bounded FIFO queue.
///
/// At most `worker_count` frames are being inferred and at most `queue_depth`
/// wait behind them. A submission that finds the queue full is refused at once.
pub struct InferenceExecutor {
    sender: Sender<Job>,
    workers: Vec<thread::JoinHandle<()>>,
    busy: Arc<AtomicUsize>,
    worker_count: usize,
    queue_depth: usize,
}

impl InferenceExecutor {
    pub fn new(model: ModelHandle, config: &ExecutorConfig) -> std::io::Result<Self> {
        let worker_count = config.worker_count.max(1);
        let queue_depth = config.queue_depth.max(1);
        let (sender, receiver) = crossbeam_channel::bounded::<Job>(queue_depth);
        let busy = Arc::new(AtomicUsize::new(0));

        let workers = (0..worker_count)
            .map(|worker_index| {
                let model = model.clone();
                let receiver = receiver.clone();
                let busy = busy.clone();
                thread::Builder::new()
                    .name(format!("inference-worker-{}", worker_index))
                    .spawn(move || worker_loop(worker_index, model, receiver, busy))
            })
            .collect::<std::io::Result<Vec<_>>>()?;

        tracing::info!(
            workers = worker_count,
            queue_depth = queue_depth,
            "Inference executor started"
        );

        Ok(Self {
            sender,
            workers,
            busy,
            worker_count,
            queue_depth,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Jobs admitted but not yet picked up by a worker.
    pub fn queued(&self) -> usize {
        self.sender.len()
    }

    /// Workers currently running the model.
    pub fn busy(&self) -> usize {
        self.busy.load(Ordering::SeqCst)
    }

    /// Admits one frame or fails with `Overloaded` without waiting. The returned
    /// future resolves to the detections for exactly this frame, or to
    /// `Cancelled` when the job was abandoned through `cancel`.
    pub fn submit(
        &self,
        frame: Frame,
        params: DetectionParams,
        cancel: &CancelToken,
    ) -> Result<impl Future<Output = Reply> + Send + 'static, ExecutorError> {
        if cancel.is_cancelled() {
            return Err(ExecutorError::Cancelled);
        }
        let (reply, receiver) = oneshot::channel();
        let job = Job {
            frame,
            params,
            cancel: cancel.clone(),
            reply,
        };

        match self.sender.try_send(job) {
            Ok(()) => Ok(async move { receiver.await.unwrap_or(Err(ExecutorError::Cancelled)) }),
            Err(TrySendError::Full(_)) => {
                tracing::warn!(
                    queued = self.queued(),
                    queue_depth = self.queue_depth,
                    busy = self.busy(),
                    "Inference queue full, rejecting frame"
                );
                Err(ExecutorError::Overloaded)
            }
            Err(TrySendError::Disconnected(_)) => Err(ExecutorError::ShutDown),
        }
    }

    /// Stops admitting work, lets the workers drain the queue and joins them.
    /// Blocks the calling thread.
    pub fn shutdown(self) {
        let Self {
            sender, workers, ..
        } = self;
        drop(sender);
        for worker in workers {
            if worker.join().is_err() {
                tracing::error!("Inference worker terminated abnormally");
            }
        }
        tracing::info!("Inference executor stopped");
    }
}

fn worker_loop(
    worker_index: usize,
    model: ModelHandle,
    receiver: Receiver<Job>,
    busy: Arc<AtomicUsize>,
) {
    tracing::debug!("Inference worker #{} ready", worker_index);

    for job in receiver.iter() {
        if job.cancel.is_cancelled() || job.reply.is_closed() {
            tracing::debug!(
                frame = job.frame.index,
                "Skipping abandoned job on worker #{}",
                worker_index
            );
            continue;
        }

        busy.fetch_add(1, Ordering::SeqCst);
        let outcome = catch_unwind(AssertUnwindSafe(|| model.detect(&job.frame, &job.params)));
        busy.fetch_sub(1, Ordering::SeqCst);

        let reply = match outcome {
            Ok(Ok(detections)) => Ok(detections),
            Ok(Err(e)) => Err(ExecutorError::Inference(e)),
            Err(_) => {
                tracing::error!(
                    frame = job.frame.index,
                    "Model panicked on worker #{}",
                    worker_index
                );
                Err(ExecutorError::WorkerPanicked)
            }
        };

        if job.cancel.is_cancelled() {
            continue;
        }
        let _ = job.reply.send(reply);
    }

    tracing::debug!("Inference worker #{} exiting", worker_index);
}
