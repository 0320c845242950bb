//! Hands rendered artifacts to callers from ephemeral storage.
//!
//! Nothing here trusts a previously recorded path: every read re-opens the
//! file and reports [`DeliveryError::ArtifactNotFound`] if it has gone.

use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};

use bytes::{Bytes, BytesMut};
use futures::Stream;
use thiserror::Error;
use tokio::{fs::File, io::AsyncReadExt};
use tracing::{debug, warn};

use crate::domain::certificates::CertificateNumber;

use super::types::RenderedDocument;

pub const PDF_CONTENT_TYPE: &str = "application/pdf";

const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("artifact `{path}` is no longer available")]
    ArtifactNotFound { path: PathBuf },
    #[error("failed to read artifact `{path}`")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Directory holding rendered artifacts, one `<ID>.pdf` per certificate.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
    remove_after_delivery: bool,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>, remove_after_delivery: bool) -> Self {
        Self {
            root: root.into(),
            remove_after_delivery,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, number: &CertificateNumber) -> PathBuf {
        self.root.join(number.file_name())
    }

    /// Stream a freshly rendered document.
    pub async fn deliver(&self, document: &RenderedDocument) -> Result<ArtifactStream, DeliveryError> {
        self.open(&document.number, &document.storage_path).await
    }

    /// Re-open a previously rendered artifact by identifier. The path is
    /// derived from the store root, never from a stored record.
    pub async fn locate(&self, number: &CertificateNumber) -> Result<ArtifactStream, DeliveryError> {
        let path = self.path_for(number);
        self.open(number, &path).await
    }

    async fn open(
        &self,
        number: &CertificateNumber,
        path: &Path,
    ) -> Result<ArtifactStream, DeliveryError> {
        let file = File::open(path).await.map_err(|source| match source.kind() {
            ErrorKind::NotFound => DeliveryError::ArtifactNotFound {
                path: path.to_path_buf(),
            },
            _ => DeliveryError::Io {
                path: path.to_path_buf(),
                source,
            },
        })?;
        let metadata = file.metadata().await.map_err(|source| DeliveryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if !metadata.is_file() || metadata.len() == 0 {
            return Err(DeliveryError::ArtifactNotFound {
                path: path.to_path_buf(),
            });
        }

        debug!(
            target = "application::render::delivery",
            op = "delivery::open",
            certificate_number = %number,
            bytes = metadata.len(),
            path = %path.display(),
            "Artifact opened for delivery"
        );

        Ok(ArtifactStream {
            file_name: number.file_name(),
            content_type: PDF_CONTENT_TYPE,
            byte_length: metadata.len(),
            path: path.to_path_buf(),
            remove_after: self.remove_after_delivery,
            file,
        })
    }
}

/// An opened artifact plus the metadata needed to serve it.
#[derive(Debug)]
pub struct ArtifactStream {
    pub file_name: String,
    pub content_type: &'static str,
    pub byte_length: u64,
    path: PathBuf,
    remove_after: bool,
    file: File,
}

impl ArtifactStream {
    pub fn content_disposition(&self) -> String {
        format!("attachment; filename=\"{}\"", self.file_name)
    }

    /// Chunked byte stream. When the store removes artifacts after delivery,
    /// the file is unlinked once the last chunk has been read.
    pub fn into_byte_stream(self) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
        let Self {
            mut file,
            path,
            remove_after,
            ..
        } = self;

        async_stream::try_stream! {
            loop {
                let mut chunk = BytesMut::with_capacity(CHUNK_SIZE);
                let read = file.read_buf(&mut chunk).await?;
                if read == 0 {
                    break;
                }
                yield chunk.freeze();
            }
            drop(file);
            if remove_after {
                remove_best_effort(&path).await;
            }
        }
    }

    /// Read the whole artifact into memory, honouring the removal policy.
    pub async fn into_bytes(self) -> io::Result<Vec<u8>> {
        let Self {
            mut file,
            path,
            remove_after,
            byte_length,
            ..
        } = self;

        let mut buffer = Vec::with_capacity(usize::try_from(byte_length).unwrap_or_default());
        file.read_to_end(&mut buffer).await?;
        drop(file);
        if remove_after {
            remove_best_effort(&path).await;
        }
        Ok(buffer)
    }
}

async fn remove_best_effort(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(
            target = "application::render::delivery",
            op = "delivery::remove",
            path = %path.display(),
            "Artifact removed after delivery"
        ),
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!(
            target = "application::render::delivery",
            op = "delivery::remove",
            path = %path.display(),
            error = %err,
            "Failed to remove delivered artifact"
        ),
    }
}
