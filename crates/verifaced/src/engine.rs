use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use veriface_core::detection::best_detection;
use veriface_core::{AnalyzerError, Descriptor, DescriptorError, Detection, FaceAnalyzer};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("analyzer error: {0}")]
    Analyzer(#[from] AnalyzerError),
    #[error("invalid descriptor: {0}")]
    Descriptor(#[from] DescriptorError),
    #[error("no face detected in image")]
    NoFaceDetected,
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

impl EngineError {
    /// Analyzer errors pass through; anything else is a backend fault.
    pub fn into_analyzer_error(self) -> AnalyzerError {
        match self {
            EngineError::Analyzer(inner) => inner,
            other => AnalyzerError::Backend(other.to_string()),
        }
    }
}

/// Result of an enrollment extraction.
#[derive(Debug)]
pub struct ExtractResult {
    pub descriptor: Descriptor,
    pub quality_score: f32,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Analyze {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<Vec<Detection>, EngineError>>,
    },
    Extract {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<ExtractResult, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Run the analyzer on one image and return every detection.
    pub async fn analyze(&self, image: Vec<u8>) -> Result<Vec<Detection>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Analyze {
                image,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Analyze an enrollment image and extract the most confident face's descriptor.
    pub async fn extract(&self, image: Vec<u8>) -> Result<ExtractResult, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Extract {
                image,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The analyzer is moved onto the thread and never shared; requests are
/// served one at a time in arrival order.
pub fn spawn_engine<A>(mut analyzer: A) -> Result<EngineHandle, EngineError>
where
    A: FaceAnalyzer + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("veriface-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Analyze { image, reply } => {
                        let result = run_analyze(&mut analyzer, &image);
                        let _ = reply.send(result);
                    }
                    EngineRequest::Extract { image, reply } => {
                        let result = run_extract(&mut analyzer, &image);
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

fn run_analyze<A: FaceAnalyzer>(
    analyzer: &mut A,
    image: &[u8],
) -> Result<Vec<Detection>, EngineError> {
    let detections = analyzer.analyze(image)?;
    tracing::debug!(bytes = image.len(), faces = detections.len(), "analyzed frame");
    Ok(detections)
}

/// Pick the most confident face and validate its descriptor.
fn run_extract<A: FaceAnalyzer>(analyzer: &mut A, image: &[u8]) -> Result<ExtractResult, EngineError> {
    let detections = analyzer.analyze(image)?;
    let face = best_detection(&detections).ok_or(EngineError::NoFaceDetected)?;
    let descriptor = Descriptor::from_raw(&face.descriptor)?;
    let quality_score = face.score.unwrap_or(0.0);

    tracing::info!(
        faces = detections.len(),
        confidence = quality_score,
        dimension = descriptor.dimension(),
        "extract: best face selected"
    );

    Ok(ExtractResult {
        descriptor,
        quality_score,
    })
}

/// Hands a result computed on the engine thread to code that expects a
/// [`FaceAnalyzer`]. Yields its result once.
pub struct Analyzed(Option<Result<Vec<Detection>, AnalyzerError>>);

impl Analyzed {
    pub fn new(result: Result<Vec<Detection>, EngineError>) -> Self {
        Self(Some(result.map_err(EngineError::into_analyzer_error)))
    }
}

impl FaceAnalyzer for Analyzed {
    fn analyze(&mut self, _image: &[u8]) -> Result<Vec<Detection>, AnalyzerError> {
        self.0
            .take()
            .unwrap_or_else(|| Err(AnalyzerError::Backend("analysis already consumed".into())))
    }
}
