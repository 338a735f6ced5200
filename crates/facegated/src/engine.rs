use facegate_core::{DetectionError, Embedding, FaceAttributes, FaceModel, ImageInput};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Pending requests allowed per worker before senders wait.
const QUEUE_DEPTH_PER_WORKER: usize = 4;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Detection(#[from] DetectionError),
    #[error("model call exceeded {0:?}")]
    Timeout(Duration),
    #[error("engine thread exited")]
    ChannelClosed,
    #[error("no face model instances supplied")]
    NoWorkers,
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
}

impl EngineError {
    /// Collapse into the detection outcome reported to callers.
    /// Anything that is not an explicit "no face" is an extraction failure.
    pub fn into_detection(self) -> DetectionError {
        match self {
            EngineError::Detection(e) => e,
            other => DetectionError::ExtractionFailed(other.to_string()),
        }
    }
}

/// Messages sent from request handlers to the engine threads.
enum EngineRequest {
    Extract {
        image: Arc<ImageInput>,
        reply: oneshot::Sender<Result<Embedding, DetectionError>>,
    },
    Analyze {
        image: Arc<ImageInput>,
        reply: oneshot::Sender<Result<FaceAttributes, DetectionError>>,
    },
}

/// Clone-safe handle to the engine threads.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Extract an identity embedding, giving up after `timeout`.
    pub async fn extract(
        &self,
        image: Arc<ImageInput>,
        timeout: Duration,
    ) -> Result<Embedding, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = EngineRequest::Extract {
            image,
            reply: reply_tx,
        };
        Ok(self.round_trip(request, reply_rx, timeout).await??)
    }

    /// Run attribute analysis, giving up after `timeout`.
    pub async fn analyze(
        &self,
        image: Arc<ImageInput>,
        timeout: Duration,
    ) -> Result<FaceAttributes, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = EngineRequest::Analyze {
            image,
            reply: reply_tx,
        };
        Ok(self.round_trip(request, reply_rx, timeout).await??)
    }

    async fn round_trip<T>(
        &self,
        request: EngineRequest,
        reply_rx: oneshot::Receiver<T>,
        timeout: Duration,
    ) -> Result<T, EngineError> {
        // The deadline covers queueing as well as inference.
        let exchange = async {
            self.tx
                .send(request)
                .await
                .map_err(|_| EngineError::ChannelClosed)?;
            reply_rx.await.map_err(|_| EngineError::ChannelClosed)
        };
        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| EngineError::Timeout(timeout))?
    }
}

/// Spawn one engine thread per model instance.
///
/// Each thread exclusively owns its model; all threads pull from one shared
/// queue. Fails fast if no models are supplied or a thread cannot start.
pub fn spawn_engine(models: Vec<Box<dyn FaceModel>>) -> Result<EngineHandle, EngineError> {
    if models.is_empty() {
        return Err(EngineError::NoWorkers);
    }

    let (tx, rx) = mpsc::channel::<EngineRequest>(models.len() * QUEUE_DEPTH_PER_WORKER);
    let rx = Arc::new(Mutex::new(rx));

    for (idx, mut model) in models.into_iter().enumerate() {
        let rx = Arc::clone(&rx);
        std::thread::Builder::new()
            .name(format!("facegate-engine-{idx}"))
            .spawn(move || {
                tracing::info!(worker = idx, "engine thread started");
                loop {
                    // Lock is released before the request is processed.
                    let next = rx.lock().blocking_recv();
                    let Some(req) = next else { break };
                    handle_request(idx, model.as_mut(), req);
                }
                tracing::info!(worker = idx, "engine thread exiting");
            })
            .map_err(EngineError::Spawn)?;
    }

    Ok(EngineHandle { tx })
}

fn handle_request(worker: usize, model: &mut dyn FaceModel, req: EngineRequest) {
    match req {
        EngineRequest::Extract { image, reply } => {
            if reply.is_closed() {
                tracing::debug!(worker, op = "extract", "caller gone; skipping request");
                return;
            }
            let result = guarded(worker, "extract", || model.extract(&image));
            if let Ok(embedding) = &result {
                tracing::debug!(worker, dim = embedding.dim(), "embedding extracted");
            }
            let _ = reply.send(result);
        }
        EngineRequest::Analyze { image, reply } => {
            if reply.is_closed() {
                tracing::debug!(worker, op = "analyze", "caller gone; skipping request");
                return;
            }
            let result = guarded(worker, "analyze", || model.analyze(&image));
            let _ = reply.send(result);
        }
    }
}

/// Run a model call, turning a panic into an extraction failure so the
/// worker thread survives.
fn guarded<T>(
    worker: usize,
    op: &'static str,
    f: impl FnOnce() -> Result<T, DetectionError>,
) -> Result<T, DetectionError> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(_) => {
            tracing::error!(worker, op, "face model panicked");
            Err(DetectionError::ExtractionFailed(format!("face model panicked during {op}")))
        }
    }
}
