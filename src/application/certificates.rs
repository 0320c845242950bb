//! Certificate issuance: validation, entitlement, record keeping and the
//! rendering pipeline, in that order.

use std::{path::PathBuf, sync::Arc, time::Instant};

use serde::Deserialize;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use crate::application::render::{
    ArtifactStore, ArtifactStream, ComposeError, DeliveryError, EmbeddedAsset, RenderFailure,
    ResourceGovernor, TemplateSource, compose,
};
use crate::application::repos::{CertificatesRepo, EntitlementRepo, RepoError};
use crate::domain::certificates::{
    CertificateFields, CertificateNumber, CertificateRecord, DEFAULT_NUMBER_PREFIX,
};
use crate::domain::error::DomainError;

const MAX_NUMBER_ATTEMPTS: usize = 3;

/// Identity established by the upstream authenticator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenerateCertificateCommand {
    pub name: String,
    pub course: String,
    #[serde(default)]
    pub date: Option<String>,
}

/// Static inputs of every render.
#[derive(Debug, Clone)]
pub struct IssuanceSettings {
    pub template_path: PathBuf,
    pub asset_path: PathBuf,
    pub number_prefix: String,
}

impl Default for IssuanceSettings {
    fn default() -> Self {
        Self {
            template_path: PathBuf::from("templates/certificate.html"),
            asset_path: PathBuf::from("assets/certificate-background.png"),
            number_prefix: DEFAULT_NUMBER_PREFIX.to_string(),
        }
    }
}

/// Stable classification of every failure the service can surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Authorization,
    TemplateMissing,
    TemplateInvalid,
    AssetMissing,
    EngineLaunch,
    RenderTimeout,
    ArtifactNotFound,
    UnknownRenderFailure,
    NotFound,
    Storage,
}

#[derive(Debug, Error)]
pub enum CertificateError {
    #[error(transparent)]
    Validation(#[from] DomainError),
    #[error("`{owner}` is not entitled to a certificate for `{course}`")]
    Authorization { owner: String, course: String },
    #[error(transparent)]
    Compose(#[from] ComposeError),
    #[error(transparent)]
    Render(#[from] RenderFailure),
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
    #[error("certificate `{number}` not found")]
    RecordNotFound { number: String },
    #[error(transparent)]
    Repo(#[from] RepoError),
}

impl CertificateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CertificateError::Validation(_) => ErrorKind::Validation,
            CertificateError::Authorization { .. } => ErrorKind::Authorization,
            CertificateError::Compose(ComposeError::TemplateMissing { .. }) => {
                ErrorKind::TemplateMissing
            }
            CertificateError::Compose(ComposeError::AssetMissing { .. }) => ErrorKind::AssetMissing,
            CertificateError::Compose(
                ComposeError::TemplateSyntax { .. } | ComposeError::Rewrite(_),
            ) => ErrorKind::TemplateInvalid,
            CertificateError::Render(RenderFailure::EngineLaunch { .. }) => ErrorKind::EngineLaunch,
            CertificateError::Render(RenderFailure::Timeout { .. }) => ErrorKind::RenderTimeout,
            CertificateError::Render(
                RenderFailure::Engine { .. } | RenderFailure::Workspace { .. },
            ) => ErrorKind::UnknownRenderFailure,
            CertificateError::Delivery(DeliveryError::ArtifactNotFound { .. }) => {
                ErrorKind::ArtifactNotFound
            }
            CertificateError::Delivery(DeliveryError::Io { .. }) => ErrorKind::Storage,
            CertificateError::RecordNotFound { .. } => ErrorKind::NotFound,
            CertificateError::Repo(_) => ErrorKind::Storage,
        }
    }
}

/// A saved record plus its freshly rendered artifact.
#[derive(Debug)]
pub struct IssuedCertificate {
    pub record: CertificateRecord,
    pub artifact: ArtifactStream,
}

#[derive(Clone)]
pub struct CertificateService {
    certificates: Arc<dyn CertificatesRepo>,
    entitlements: Arc<dyn EntitlementRepo>,
    governor: ResourceGovernor,
    artifacts: ArtifactStore,
    settings: IssuanceSettings,
}

impl CertificateService {
    pub fn new(
        certificates: Arc<dyn CertificatesRepo>,
        entitlements: Arc<dyn EntitlementRepo>,
        governor: ResourceGovernor,
        artifacts: ArtifactStore,
        settings: IssuanceSettings,
    ) -> Self {
        Self {
            certificates,
            entitlements,
            governor,
            artifacts,
            settings,
        }
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    pub async fn generate(
        &self,
        principal: &Principal,
        command: GenerateCertificateCommand,
    ) -> Result<IssuedCertificate, CertificateError> {
        let started_at = Instant::now();
        let result = self.issue(principal, command).await;

        match &result {
            Ok(issued) => info!(
                target = "application::certificates",
                op = "certificates::generate",
                owner_id = %principal.user_id,
                certificate_number = %issued.record.certificate_number,
                result = "succeeded",
                elapsed_ms = started_at.elapsed().as_millis() as u64,
                "Certificate issued"
            ),
            Err(err) => warn!(
                target = "application::certificates",
                op = "certificates::generate",
                owner_id = %principal.user_id,
                result = "failed",
                kind = ?err.kind(),
                elapsed_ms = started_at.elapsed().as_millis() as u64,
                error = %err,
                "Certificate issuance failed"
            ),
        }

        result
    }

    async fn issue(
        &self,
        principal: &Principal,
        command: GenerateCertificateCommand,
    ) -> Result<IssuedCertificate, CertificateError> {
        let now = OffsetDateTime::now_utc();
        let fields = CertificateFields::new(
            &command.name,
            &command.course,
            command.date.as_deref(),
            now,
        )?;

        let entitled = self
            .entitlements
            .has_course_access(&principal.user_id, &fields.subject_label)
            .await?;
        if !entitled {
            return Err(CertificateError::Authorization {
                owner: principal.user_id.clone(),
                course: fields.subject_label,
            });
        }

        let record = self.save_record(principal, &fields, now).await?;
        let number = &record.certificate_number;

        let template = TemplateSource::load(&self.settings.template_path).await?;
        let asset = EmbeddedAsset::load(&self.settings.asset_path).await?;
        let html = compose(
            &template,
            &fields,
            number,
            &asset,
            &self.governor.engine().page,
        )?;

        let rendered = self
            .governor
            .render(number, &html, &record.artifact_path)
            .await?;
        let artifact = self.artifacts.deliver(&rendered.document).await?;

        Ok(IssuedCertificate { record, artifact })
    }

    // Numbers are random enough that a clash is practically impossible, but
    // the store enforces uniqueness and a clash just mints another one.
    async fn save_record(
        &self,
        principal: &Principal,
        fields: &CertificateFields,
        issued_at: OffsetDateTime,
    ) -> Result<CertificateRecord, CertificateError> {
        let mut attempt = 1;
        loop {
            let number = CertificateNumber::generate(&self.settings.number_prefix);
            let record = CertificateRecord {
                id: Uuid::new_v4(),
                owner_id: principal.user_id.clone(),
                subject_name: fields.subject_name.clone(),
                course_name: fields.subject_label.clone(),
                artifact_path: self.artifacts.path_for(&number),
                certificate_number: number,
                issued_at,
            };

            match self.certificates.insert_certificate(record.clone()).await {
                Ok(()) => return Ok(record),
                Err(RepoError::Duplicate { constraint }) if attempt < MAX_NUMBER_ATTEMPTS => {
                    warn!(
                        target = "application::certificates",
                        op = "certificates::save_record",
                        attempt,
                        constraint = %constraint,
                        "Certificate number already taken, generating another"
                    );
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    pub async fn list_for_owner(
        &self,
        owner_id: &str,
    ) -> Result<Vec<CertificateRecord>, CertificateError> {
        self.certificates
            .list_certificates_for_owner(owner_id)
            .await
            .map_err(CertificateError::from)
    }

    /// Stream a previously issued certificate. The record must exist and the
    /// artifact must still be on disk.
    pub async fn download(&self, number: &str) -> Result<ArtifactStream, CertificateError> {
        let number = CertificateNumber::parse(number)?;
        let record = self
            .certificates
            .find_certificate(&number)
            .await?
            .ok_or_else(|| CertificateError::RecordNotFound {
                number: number.to_string(),
            })?;

        self.artifacts
            .locate(&record.certificate_number)
            .await
            .map_err(CertificateError::from)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use async_trait::async_trait;
    use tempfile::TempDir;

    use super::*;
    use crate::application::render::{EngineConfig, PageGeometry};
    use crate::infra::memory::MemoryStore;

    fn governor(dir: &std::path::Path) -> ResourceGovernor {
        ResourceGovernor::new(
            EngineConfig {
                // Never launched by these tests.
                executable_path: dir.join("no-engine"),
                sandbox_args: Vec::new(),
                headless: true,
                deadline: Duration::from_secs(1),
                launch_timeout: Duration::from_secs(1),
                settle_budget: Duration::from_millis(100),
                page: PageGeometry::default(),
            },
            u64::MAX,
        )
    }

    fn service(dir: &TempDir, store: Arc<MemoryStore>) -> CertificateService {
        CertificateService::new(
            store.clone(),
            store,
            governor(dir.path()),
            ArtifactStore::new(dir.path().join("artifacts"), false),
            IssuanceSettings {
                template_path: dir.path().join("template.html"),
                asset_path: dir.path().join("background.png"),
                number_prefix: "TEST".to_string(),
            },
        )
    }

    fn principal() -> Principal {
        Principal {
            user_id: "user-1".to_string(),
        }
    }

    fn command(name: &str, course: &str) -> GenerateCertificateCommand {
        GenerateCertificateCommand {
            name: name.to_string(),
            course: course.to_string(),
            date: None,
        }
    }

    #[tokio::test]
    async fn blank_name_fails_before_anything_is_saved() {
        let dir = TempDir::new().expect("temp dir");
        let store = Arc::new(MemoryStore::allow_all());
        let service = service(&dir, store.clone());

        let err = service
            .generate(&principal(), command("   ", "Course"))
            .await
            .expect_err("validation fails");

        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(store.list_certificates_for_owner("user-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_entitlement_is_an_authorization_error() {
        let dir = TempDir::new().expect("temp dir");
        let store = Arc::new(MemoryStore::with_grants([("user-1", "Other Course")]));
        let service = service(&dir, store.clone());

        let err = service
            .generate(&principal(), command("Name", "Course"))
            .await
            .expect_err("not entitled");

        assert_eq!(err.kind(), ErrorKind::Authorization);
        assert!(store.list_certificates_for_owner("user-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_template_is_reported_after_record_is_saved() {
        let dir = TempDir::new().expect("temp dir");
        let store = Arc::new(MemoryStore::allow_all());
        let service = service(&dir, store.clone());

        let err = service
            .generate(&principal(), command("Name", "Course"))
            .await
            .expect_err("template missing");

        assert_eq!(err.kind(), ErrorKind::TemplateMissing);
        assert_eq!(store.list_certificates_for_owner("user-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_asset_is_reported() {
        let dir = TempDir::new().expect("temp dir");
        std::fs::write(dir.path().join("template.html"), "<p>{{name}}</p>").unwrap();
        let service = service(&dir, Arc::new(MemoryStore::allow_all()));

        let err = service
            .generate(&principal(), command("Name", "Course"))
            .await
            .expect_err("asset missing");

        assert_eq!(err.kind(), ErrorKind::AssetMissing);
    }

    #[tokio::test]
    async fn download_rejects_unknown_and_malformed_numbers() {
        let dir = TempDir::new().expect("temp dir");
        let service = service(&dir, Arc::new(MemoryStore::allow_all()));

        let err = service.download("../secret").await.expect_err("malformed");
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = service
            .download("TEST-1-ABCDEFGHIJ")
            .await
            .expect_err("unknown");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn download_rechecks_artifact_on_disk() {
        let dir = TempDir::new().expect("temp dir");
        let store = Arc::new(MemoryStore::allow_all());
        let service = service(&dir, store.clone());
        let number = CertificateNumber::generate("TEST");
        store
            .insert_certificate(CertificateRecord {
                id: Uuid::new_v4(),
                owner_id: "user-1".to_string(),
                subject_name: "Name".to_string(),
                course_name: "Course".to_string(),
                certificate_number: number.clone(),
                issued_at: OffsetDateTime::now_utc(),
                artifact_path: dir.path().join("somewhere-else.pdf"),
            })
            .await
            .unwrap();

        let err = service
            .download(number.as_str())
            .await
            .expect_err("artifact reclaimed");
        assert_eq!(err.kind(), ErrorKind::ArtifactNotFound);

        let artifacts = dir.path().join("artifacts");
        std::fs::create_dir_all(&artifacts).unwrap();
        std::fs::write(artifacts.join(number.file_name()), b"%PDF-1.4").unwrap();
        let bytes = service
            .download(&number.as_str().to_lowercase())
            .await
            .expect("artifact present")
            .into_bytes()
            .await
            .unwrap();
        assert_eq!(bytes, b"%PDF-1.4");
    }

    struct CollidingRepo {
        inner: MemoryStore,
        collisions: AtomicUsize,
    }

    #[async_trait]
    impl CertificatesRepo for CollidingRepo {
        async fn insert_certificate(&self, record: CertificateRecord) -> Result<(), RepoError> {
            if self.collisions.load(Ordering::SeqCst) > 0 {
                self.collisions.fetch_sub(1, Ordering::SeqCst);
                return Err(RepoError::Duplicate {
                    constraint: "certificate_number".to_string(),
                });
            }
            self.inner.insert_certificate(record).await
        }

        async fn list_certificates_for_owner(
            &self,
            owner_id: &str,
        ) -> Result<Vec<CertificateRecord>, RepoError> {
            self.inner.list_certificates_for_owner(owner_id).await
        }

        async fn find_certificate(
            &self,
            number: &CertificateNumber,
        ) -> Result<Option<CertificateRecord>, RepoError> {
            self.inner.find_certificate(number).await
        }
    }

    #[tokio::test]
    async fn number_collisions_are_retried_then_surface() {
        let dir = TempDir::new().expect("temp dir");
        let repo = Arc::new(CollidingRepo {
            inner: MemoryStore::allow_all(),
            collisions: AtomicUsize::new(2),
        });
        let service = CertificateService::new(
            repo.clone(),
            Arc::new(MemoryStore::allow_all()),
            governor(dir.path()),
            ArtifactStore::new(dir.path(), false),
            IssuanceSettings::default(),
        );

        let record = service
            .save_record(
                &principal(),
                &CertificateFields::new("Name", "Course", None, OffsetDateTime::now_utc())
                    .unwrap(),
                OffsetDateTime::now_utc(),
            )
            .await
            .expect("third attempt succeeds");
        assert!(record.certificate_number.as_str().starts_with("CERT-"));

        repo.collisions.store(MAX_NUMBER_ATTEMPTS, Ordering::SeqCst);
        let err = service
            .save_record(
                &principal(),
                &CertificateFields::new("Name", "Course", None, OffsetDateTime::now_utc())
                    .unwrap(),
                OffsetDateTime::now_utc(),
            )
            .await
            .expect_err("gives up");
        assert_eq!(err.kind(), ErrorKind::Storage);
    }
}
