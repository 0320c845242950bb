//! Repository traits describing persistence adapters.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::certificates::{CertificateNumber, CertificateRecord};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("duplicate record violates unique constraint `{constraint}`")]
    Duplicate { constraint: String },
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }
}

#[async_trait]
pub trait CertificatesRepo: Send + Sync {
    /// Persist a freshly issued certificate. Fails with
    /// [`RepoError::Duplicate`] if the certificate number is already taken.
    async fn insert_certificate(&self, record: CertificateRecord) -> Result<(), RepoError>;

    /// Certificates owned by `owner_id`, most recent first.
    async fn list_certificates_for_owner(
        &self,
        owner_id: &str,
    ) -> Result<Vec<CertificateRecord>, RepoError>;

    async fn find_certificate(
        &self,
        number: &CertificateNumber,
    ) -> Result<Option<CertificateRecord>, RepoError>;
}

#[async_trait]
pub trait EntitlementRepo: Send + Sync {
    async fn has_course_access(&self, owner_id: &str, course: &str) -> Result<bool, RepoError>;
}
