use crate::service::{FaceService, RateLimitExceeded};
use facegate_core::{DetectionError, ImageInput};
use std::sync::Arc;
use zbus::interface;
use zbus::message::Header;

/// Key used when a message carries no sender (peer-to-peer connections).
const ANONYMOUS_CLIENT: &str = "anonymous";

/// Errors surfaced to D-Bus callers.
#[derive(Debug, zbus::DBusError)]
#[zbus(prefix = "org.facegate.Facegate1.Error")]
pub enum ServiceError {
    #[zbus(error)]
    ZBus(zbus::Error),
    /// Client exceeded its request budget; retry after the window passes.
    RateLimited(String),
    InvalidInput(String),
    NoFace(String),
    Internal(String),
}

impl From<RateLimitExceeded> for ServiceError {
    fn from(err: RateLimitExceeded) -> Self {
        ServiceError::RateLimited(err.to_string())
    }
}

impl From<DetectionError> for ServiceError {
    fn from(err: DetectionError) -> Self {
        match err {
            DetectionError::NoFaceDetected => ServiceError::NoFace(err.to_string()),
            DetectionError::ExtractionFailed(_) => ServiceError::Internal(err.to_string()),
        }
    }
}

type Reply = Result<String, ServiceError>;

/// D-Bus interface for the facegate daemon.
///
/// Bus name: org.facegate.Facegate1
/// Object path: /org/facegate/Facegate1
pub struct FacegateService {
    core: Arc<FaceService>,
}

impl FacegateService {
    pub fn new(core: Arc<FaceService>) -> Self {
        Self { core }
    }

    async fn handle_identify(&self, client: &str, image: Vec<u8>) -> Reply {
        self.core.admit(client)?;
        let image = decode_image(image).await?;
        tracing::info!(
            client,
            width = image.width(),
            height = image.height(),
            "identify requested"
        );
        let found = self.core.identify(image).await?;
        to_json(&found)
    }

    async fn handle_register(&self, client: &str, name: &str, image: Vec<u8>) -> Reply {
        self.core.admit(client)?;
        let name = name.trim();
        if name.is_empty() {
            return Err(ServiceError::InvalidInput("name must not be empty".into()));
        }
        let image = decode_image(image).await?;
        tracing::info!(client, name, "register requested");
        let result = self.core.register_face(name, image).await;
        to_json(&result)
    }

    fn handle_list(&self, client: &str) -> Reply {
        self.core.admit(client)?;
        to_json(&self.core.list_faces())
    }

    fn handle_status(&self, client: &str) -> Reply {
        self.core.admit(client)?;
        let settings = self.core.settings();
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "faces": self.core.gallery().len(),
            "match_threshold": settings.match_threshold,
            "duplicate_threshold": settings.duplicate_threshold,
            "extract_timeout_secs": settings.extract_timeout.as_secs(),
            "tracked_clients": self.core.admission().tracked_clients(),
        })
        .to_string())
    }
}

#[interface(name = "org.facegate.Facegate1")]
impl FacegateService {
    /// Identify the face in an encoded image. Returns JSON with the best
    /// match (or null) and optional attributes.
    async fn identify(
        &self,
        image: Vec<u8>,
        #[zbus(header)] header: Header<'_>,
    ) -> Result<String, ServiceError> {
        self.handle_identify(&client_key(&header), image).await
    }

    /// Enroll a face under `name`. Domain failures come back as a normal
    /// reply with `status: "error"`.
    async fn register(
        &self,
        name: &str,
        image: Vec<u8>,
        #[zbus(header)] header: Header<'_>,
    ) -> Result<String, ServiceError> {
        self.handle_register(&client_key(&header), name, image).await
    }

    /// List enrolled faces without their embeddings.
    async fn list_faces(
        &self,
        #[zbus(header)] header: Header<'_>,
    ) -> Result<String, ServiceError> {
        self.handle_list(&client_key(&header))
    }

    /// Return daemon status information.
    async fn status(
        &self,
        #[zbus(header)] header: Header<'_>,
    ) -> Result<String, ServiceError> {
        self.handle_status(&client_key(&header))
    }
}

fn client_key(header: &Header<'_>) -> String {
    header
        .sender()
        .map(|sender| sender.to_string())
        .unwrap_or_else(|| ANONYMOUS_CLIENT.to_string())
}

/// Decode request bytes off the async runtime. Accepts an encoded image file
/// or a base64 `data:` URL.
async fn decode_image(bytes: Vec<u8>) -> Result<Arc<ImageInput>, ServiceError> {
    let decoded = tokio::task::spawn_blocking(move || match data_url_text(&bytes) {
        Some(text) => ImageInput::from_data_url(&String::from_utf8_lossy(text)),
        None => ImageInput::from_bytes(&bytes),
    })
    .await
    .map_err(|e| ServiceError::Internal(format!("image decode task failed: {e}")))?;

    decoded
        .map(Arc::new)
        .map_err(|e| ServiceError::InvalidInput(e.to_string()))
}

/// The request body as data URL text, ignoring a leading BOM and whitespace.
fn data_url_text(bytes: &[u8]) -> Option<&[u8]> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let text = &bytes[start..];
    text.starts_with(b"data:").then_some(text)
}

fn to_json<T: serde::Serialize>(value: &T) -> Reply {
    serde_json::to_string(value).map_err(|e| ServiceError::Internal(e.to_string()))
}
