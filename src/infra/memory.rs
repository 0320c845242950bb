//! In-process adapters for the record store and entitlement decisions.
//!
//! Records live only as long as the process, matching the ephemeral artifact
//! storage they point at.

use std::collections::HashSet;

use async_trait::async_trait;
use dashmap::{DashMap, mapref::entry::Entry};

use crate::application::repos::{CertificatesRepo, EntitlementRepo, RepoError};
use crate::domain::certificates::{CertificateNumber, CertificateRecord};

const NUMBER_CONSTRAINT: &str = "certificates_certificate_number_key";

#[derive(Debug, Clone)]
pub enum EntitlementPolicy {
    AllowAll,
    /// `(owner_id, course)` pairs that may be certified.
    Grants(HashSet<(String, String)>),
}

#[derive(Debug)]
pub struct MemoryStore {
    certificates: DashMap<CertificateNumber, CertificateRecord>,
    policy: EntitlementPolicy,
}

impl MemoryStore {
    pub fn new(policy: EntitlementPolicy) -> Self {
        Self {
            certificates: DashMap::new(),
            policy,
        }
    }

    pub fn allow_all() -> Self {
        Self::new(EntitlementPolicy::AllowAll)
    }

    pub fn with_grants<I, O, C>(grants: I) -> Self
    where
        I: IntoIterator<Item = (O, C)>,
        O: Into<String>,
        C: Into<String>,
    {
        let grants = grants
            .into_iter()
            .map(|(owner, course)| (owner.into(), course.into()))
            .collect();
        Self::new(EntitlementPolicy::Grants(grants))
    }

    pub fn len(&self) -> usize {
        self.certificates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certificates.is_empty()
    }
}

#[async_trait]
impl CertificatesRepo for MemoryStore {
    async fn insert_certificate(&self, record: CertificateRecord) -> Result<(), RepoError> {
        match self.certificates.entry(record.certificate_number.clone()) {
            Entry::Occupied(_) => Err(RepoError::Duplicate {
                constraint: NUMBER_CONSTRAINT.to_string(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(())
            }
        }
    }

    async fn list_certificates_for_owner(
        &self,
        owner_id: &str,
    ) -> Result<Vec<CertificateRecord>, RepoError> {
        let mut records: Vec<CertificateRecord> = self
            .certificates
            .iter()
            .filter(|entry| entry.value().owner_id == owner_id)
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by(|a, b| {
            b.issued_at
                .cmp(&a.issued_at)
                .then_with(|| b.certificate_number.as_str().cmp(a.certificate_number.as_str()))
        });
        Ok(records)
    }

    async fn find_certificate(
        &self,
        number: &CertificateNumber,
    ) -> Result<Option<CertificateRecord>, RepoError> {
        Ok(self
            .certificates
            .get(number)
            .map(|entry| entry.value().clone()))
    }
}

#[async_trait]
impl EntitlementRepo for MemoryStore {
    async fn has_course_access(&self, owner_id: &str, course: &str) -> Result<bool, RepoError> {
        Ok(match &self.policy {
            EntitlementPolicy::AllowAll => true,
            EntitlementPolicy::Grants(grants) => {
                grants.contains(&(owner_id.to_string(), course.to_string()))
            }
        })
    }
}
