//! Core API consumed by the service boundary: identification, registration
//! and admission control.

use crate::admission::AdmissionController;
use crate::engine::EngineHandle;
use crate::store::{FaceGallery, StorageError};
use chrono::{DateTime, Utc};
use facegate_core::{
    CosineMatcher, DetectionError, Embedding, FaceAttributes, FaceRecord, ImageInput,
    MatchResult, Matcher,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Why a registration was refused. Each variant carries what a client needs
/// to render a message.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RegistrationError {
    #[error("no face detected; position your face clearly in the frame and try again")]
    NoFaceDetected,
    #[error("could not read face features ({reason}); please try again")]
    ExtractionFailed { reason: String },
    #[error("this face is already registered as {existing_name}")]
    DuplicateFace {
        existing_name: String,
        confidence: f32,
    },
    #[error("failed to save the face ({reason})")]
    StorageFailure { reason: String },
}

impl From<DetectionError> for RegistrationError {
    fn from(err: DetectionError) -> Self {
        match err {
            DetectionError::NoFaceDetected => RegistrationError::NoFaceDetected,
            DetectionError::ExtractionFailed(reason) => RegistrationError::ExtractionFailed { reason },
        }
    }
}

impl From<StorageError> for RegistrationError {
    fn from(err: StorageError) -> Self {
        RegistrationError::StorageFailure {
            reason: err.to_string(),
        }
    }
}

/// Admission rejection. Not a fault: callers should ask the client to slow down.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("too many requests from {client}; please wait a moment")]
pub struct RateLimitExceeded {
    pub client: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RegistrationDetails {
    Registered { id: String, name: String },
    Rejected(RegistrationError),
}

/// Outcome of [`FaceService::register_face`], shaped for the wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistrationResult {
    pub status: RegistrationStatus,
    pub message: String,
    pub details: RegistrationDetails,
}

impl RegistrationResult {
    fn from_outcome(outcome: Result<FaceRecord, RegistrationError>) -> Self {
        match outcome {
            Ok(record) => Self {
                status: RegistrationStatus::Success,
                message: format!("face registered for {}", record.name),
                details: RegistrationDetails::Registered {
                    id: record.id,
                    name: record.name,
                },
            },
            Err(err) => Self {
                status: RegistrationStatus::Error,
                message: err.to_string(),
                details: RegistrationDetails::Rejected(err),
            },
        }
    }

    #[cfg(test)]
    pub fn is_success(&self) -> bool {
        self.status == RegistrationStatus::Success
    }

    #[cfg(test)]
    pub fn error(&self) -> Option<&RegistrationError> {
        match &self.details {
            RegistrationDetails::Rejected(err) => Some(err),
            RegistrationDetails::Registered { .. } => None,
        }
    }
}

/// Result of the identification path.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Identification {
    #[serde(rename = "match")]
    pub matched: Option<MatchResult>,
    /// Present only when the attribute analyzer succeeded.
    pub attributes: Option<FaceAttributes>,
}

/// Enrolled record without its embedding.
#[derive(Debug, Clone, Serialize)]
pub struct FaceSummary {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub dim: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct ServiceSettings {
    pub match_threshold: f32,
    pub duplicate_threshold: f32,
    pub extract_timeout: Duration,
}

pub struct FaceService {
    gallery: FaceGallery,
    engine: EngineHandle,
    admission: AdmissionController,
    matcher: Box<dyn Matcher + Send + Sync>,
    settings: ServiceSettings,
}

impl FaceService {
    pub fn new(
        gallery: FaceGallery,
        engine: EngineHandle,
        admission: AdmissionController,
        settings: ServiceSettings,
    ) -> Self {
        Self {
            gallery,
            engine,
            admission,
            matcher: Box::new(CosineMatcher),
            settings,
        }
    }

    pub fn gallery(&self) -> &FaceGallery {
        &self.gallery
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    /// Admission gate in front of every request.
    pub fn rate_limit_check(&self, client_key: &str) -> bool {
        self.admission.check(client_key)
    }

    /// [`rate_limit_check`](Self::rate_limit_check) as a `Result`.
    pub fn admit(&self, client_key: &str) -> Result<(), RateLimitExceeded> {
        if self.rate_limit_check(client_key) {
            Ok(())
        } else {
            Err(RateLimitExceeded {
                client: client_key.to_string(),
            })
        }
    }

    /// Closest enrolled identity at or above `threshold`, over a consistent
    /// snapshot of the gallery.
    pub fn find_match(&self, embedding: &Embedding, threshold: f32) -> Option<MatchResult> {
        let snapshot = self.gallery.list_all();
        self.matcher.find_best_match(embedding, &snapshot, threshold)
    }

    /// Match path: extract, look up at the identification threshold and
    /// attach descriptive attributes when the analyzer provides them.
    pub async fn identify(&self, image: Arc<ImageInput>) -> Result<Identification, DetectionError> {
        let timeout = self.settings.extract_timeout;
        let (embedding, attributes) = tokio::join!(
            self.engine.extract(Arc::clone(&image), timeout),
            self.engine.analyze(image, timeout),
        );
        let embedding = embedding.map_err(|e| e.into_detection())?;

        let attributes = match attributes {
            Ok(attrs) => Some(attrs),
            Err(err) => {
                tracing::warn!(error = %err, "attribute analysis failed; omitting attributes");
                None
            }
        };

        let matched = self.find_match(&embedding, self.settings.match_threshold);
        tracing::info!(
            matched = matched.as_ref().map(|m| m.name.as_str()),
            confidence = matched.as_ref().map(|m| m.confidence),
            gallery = self.gallery.len(),
            "identify finished"
        );
        Ok(Identification {
            matched,
            attributes,
        })
    }

    /// Registration workflow. The gallery changes only if extraction,
    /// the duplicate check and the insert all succeed.
    pub async fn register_face(&self, name: &str, image: Arc<ImageInput>) -> RegistrationResult {
        let outcome = self.try_register(name, image).await;
        match &outcome {
            Ok(record) => tracing::info!(name, id = %record.id, "registration succeeded"),
            Err(err) => tracing::info!(name, error = %err, "registration rejected"),
        }
        RegistrationResult::from_outcome(outcome)
    }

    async fn try_register(
        &self,
        name: &str,
        image: Arc<ImageInput>,
    ) -> Result<FaceRecord, RegistrationError> {
        // Inference runs before the append lock is taken.
        let embedding = self
            .engine
            .extract(image, self.settings.extract_timeout)
            .await
            .map_err(|e| e.into_detection())?;

        let writer = self.gallery.begin_append().await;
        if let Some(existing) = self.matcher.find_best_match(
            &embedding,
            writer.records(),
            self.settings.duplicate_threshold,
        ) {
            return Err(RegistrationError::DuplicateFace {
                existing_name: existing.name,
                confidence: existing.confidence,
            });
        }
        Ok(writer.add(name, embedding).await?)
    }

    pub fn list_faces(&self) -> Vec<FaceSummary> {
        self.gallery
            .list_all()
            .iter()
            .map(|r| FaceSummary {
                id: r.id.clone(),
                name: r.name.clone(),
                created_at: r.created_at,
                dim: r.embedding.dim(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::spawn_engine;
    use crate::engine::tests::{face_image, PixelModel};
    use facegate_core::FaceModel;
    use std::sync::atomic::Ordering;

    const ALICE: [u8; 3] = [200, 30, 40];
    const ALICE_AGAIN: [u8; 3] = [201, 31, 40];
    const BOB: [u8; 3] = [20, 60, 230];
    const STRANGER: [u8; 3] = [10, 240, 30];
    const NO_FACE: [u8; 3] = [0, 0, 0];
    const BROKEN: [u8; 3] = [255, 0, 0];

    fn settings() -> ServiceSettings {
        ServiceSettings {
            match_threshold: 0.6,
            duplicate_threshold: 0.8,
            extract_timeout: Duration::from_secs(5),
        }
    }

    async fn service_with(model: PixelModel, workers: usize) -> FaceService {
        let models: Vec<Box<dyn FaceModel>> = (0..workers)
            .map(|_| Box::new(model.clone()) as Box<dyn FaceModel>)
            .collect();
        FaceService::new(
            FaceGallery::open_in_memory().await.unwrap(),
            spawn_engine(models).unwrap(),
            AdmissionController::new(5, Duration::from_secs(1), 100),
            settings(),
        )
    }

    async fn service() -> FaceService {
        service_with(PixelModel::default(), 1).await
    }

    fn embedding_of(pixel: [u8; 3]) -> Embedding {
        Embedding::new(pixel.iter().map(|&v| v as f32).collect())
    }

    #[tokio::test]
    async fn test_end_to_end_scenario() {
        let svc = service().await;
        assert!(svc.gallery().is_empty());

        let first = svc.register_face("Alice", face_image(ALICE)).await;
        assert!(first.is_success(), "{first:?}");
        assert_eq!(svc.gallery().len(), 1);

        let second = svc.register_face("Bob", face_image(ALICE_AGAIN)).await;
        assert_eq!(second.status, RegistrationStatus::Error);
        match second.error() {
            Some(RegistrationError::DuplicateFace { existing_name, .. }) => {
                assert_eq!(existing_name, "Alice")
            }
            other => panic!("expected duplicate, got {other:?}"),
        }
        assert_eq!(svc.gallery().len(), 1);

        let hit = svc.find_match(&embedding_of(ALICE), 0.6).unwrap();
        assert_eq!(hit.name, "Alice");
        assert!(hit.confidence >= 0.6);

        assert!(svc.find_match(&embedding_of(STRANGER), 0.6).is_none());
    }

    #[tokio::test]
    async fn test_distinct_people_both_register() {
        let svc = service().await;
        assert!(svc.register_face("Alice", face_image(ALICE)).await.is_success());
        assert!(svc.register_face("Bob", face_image(BOB)).await.is_success());
        assert_eq!(svc.gallery().len(), 2);

        let names: Vec<_> = svc.list_faces().into_iter().map(|f| f.name).collect();
        assert_eq!(names, vec!["Alice", "Bob"]);
    }

    #[tokio::test]
    async fn test_same_name_different_face_is_allowed() {
        let svc = service().await;
        assert!(svc.register_face("Alex", face_image(ALICE)).await.is_success());
        assert!(svc.register_face("Alex", face_image(BOB)).await.is_success());
        assert_eq!(svc.gallery().len(), 2);
    }

    #[tokio::test]
    async fn test_no_face_leaves_gallery_untouched() {
        let svc = service().await;
        let result = svc.register_face("Ghost", face_image(NO_FACE)).await;
        assert_eq!(result.error(), Some(&RegistrationError::NoFaceDetected));
        assert!(svc.gallery().is_empty());
    }

    #[tokio::test]
    async fn test_extraction_failure_leaves_gallery_untouched() {
        let svc = service().await;
        let result = svc.register_face("Glitch", face_image(BROKEN)).await;
        assert!(matches!(
            result.error(),
            Some(RegistrationError::ExtractionFailed { .. })
        ));
        assert!(svc.gallery().is_empty());
    }

    #[tokio::test]
    async fn test_storage_failure_is_reported() {
        let svc = service().await;
        // A record from a different model poisons the dimension for new inserts.
        svc.gallery()
            .add("legacy", Embedding::new(vec![1.0, 0.0]))
            .await
            .unwrap();

        let result = svc.register_face("Alice", face_image(ALICE)).await;
        assert!(matches!(
            result.error(),
            Some(RegistrationError::StorageFailure { .. })
        ));
        assert_eq!(svc.gallery().len(), 1);
    }

    #[tokio::test]
    async fn test_extraction_runs_outside_append_lock() {
        let model = PixelModel::default();
        let calls = Arc::clone(&model.calls);
        let svc = Arc::new(service_with(model, 1).await);

        let writer = svc.gallery().begin_append().await;
        let pending = {
            let svc = Arc::clone(&svc);
            tokio::spawn(async move { svc.register_face("Alice", face_image(ALICE)).await })
        };

        for _ in 0..100 {
            if calls.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1, "extraction must not wait on the lock");
        assert!(!pending.is_finished());

        drop(writer);
        assert!(pending.await.unwrap().is_success());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_duplicate_registrations_insert_once() {
        let model = PixelModel {
            delay: Some(Duration::from_millis(50)),
            ..Default::default()
        };
        let svc = Arc::new(service_with(model, 4).await);

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let svc = Arc::clone(&svc);
                tokio::spawn(async move {
                    svc.register_face(&format!("person-{i}"), face_image(ALICE)).await
                })
            })
            .collect();

        let mut successes = 0;
        let mut duplicates = 0;
        for task in tasks {
            let result = task.await.unwrap();
            match result.error() {
                None => successes += 1,
                Some(RegistrationError::DuplicateFace { .. }) => duplicates += 1,
                Some(other) => panic!("unexpected error {other:?}"),
            }
        }
        assert_eq!(successes, 1);
        assert_eq!(duplicates, 7);
        assert_eq!(svc.gallery().len(), 1);
    }

    #[tokio::test]
    async fn test_identify_attaches_attributes() {
        let svc = service().await;
        svc.register_face("Alice", face_image(ALICE)).await;

        let found = svc.identify(face_image(ALICE_AGAIN)).await.unwrap();
        assert_eq!(found.matched.unwrap().name, "Alice");
        assert_eq!(found.attributes.unwrap().emotion.as_deref(), Some("neutral"));

        let unknown = svc.identify(face_image(STRANGER)).await.unwrap();
        assert!(unknown.matched.is_none());
    }

    #[tokio::test]
    async fn test_identify_without_face() {
        let svc = service().await;
        let err = svc.identify(face_image(NO_FACE)).await.unwrap_err();
        assert_eq!(err, DetectionError::NoFaceDetected);
    }

    #[tokio::test]
    async fn test_admit_maps_rejection() {
        let svc = service().await;
        for _ in 0..5 {
            assert!(svc.admit(":1.7").is_ok());
        }
        assert_eq!(
            svc.admit(":1.7").unwrap_err(),
            RateLimitExceeded {
                client: ":1.7".into()
            }
        );
    }

    #[test]
    fn test_registration_result_json_shape() {
        let result = RegistrationResult::from_outcome(Err(RegistrationError::DuplicateFace {
            existing_name: "Alice".into(),
            confidence: 0.93,
        }));
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["details"]["kind"], "duplicate_face");
        assert_eq!(json["details"]["existing_name"], "Alice");
        assert_eq!(json["message"], "this face is already registered as Alice");
    }
}
