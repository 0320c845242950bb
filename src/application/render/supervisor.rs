//! Drives one rendering engine through launch, content loading and pagination.
//!
//! A render is a single cancellable unit: the three stages run inside one
//! `timeout_at`, and whatever way that future finishes, the session tears the
//! engine down before [`RenderSupervisor::render`] returns.

use std::{
    path::{Path, PathBuf},
    process::ExitStatus,
    time::{Duration, Instant},
};

use sha2::{Digest, Sha256};
use tempfile::{NamedTempFile, TempDir, TempPath};
use time::OffsetDateTime;
use tokio::{process::Command, time::MissedTickBehavior};
use tracing::{debug, info};
use url::Url;

use crate::domain::certificates::CertificateNumber;

use super::engine::EngineProcess;
use super::types::{EngineConfig, RenderFailure, RenderStage, RenderedDocument};

const OUTPUT_POLL_INTERVAL: Duration = Duration::from_millis(25);
const PDF_MAGIC: &[u8] = b"%PDF-";

#[derive(Debug, Clone)]
pub struct RenderSupervisor {
    config: EngineConfig,
}

impl RenderSupervisor {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Render `html` to a PDF on the configured page geometry, published at `output_path`.
    ///
    /// On success the file exists and is non-empty. On any error nothing is
    /// published at `output_path` and the engine process is gone.
    pub async fn render(
        &self,
        number: &CertificateNumber,
        html: &str,
        output_path: &Path,
        deadline: Duration,
    ) -> Result<RenderedDocument, RenderFailure> {
        let started_at = Instant::now();
        let deadline_at = tokio::time::Instant::now() + deadline;
        let mut session = RenderSession::new(output_path);

        let outcome =
            tokio::time::timeout_at(deadline_at, self.drive(&mut session, number, html)).await;
        let stage = session.stage;
        session.teardown().await;

        let result = match outcome {
            Ok(result) => result,
            Err(_elapsed) => Err(RenderFailure::Timeout {
                stage,
                budget_ms: deadline.as_millis() as u64,
            }),
        };

        debug!(
            target = "application::render::supervisor",
            op = "supervisor::render",
            certificate_number = %number,
            result = match &result {
                Ok(_) => "succeeded",
                Err(err) => err.outcome(),
            },
            stage = %stage,
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "Render session finished"
        );

        result
    }

    async fn drive(
        &self,
        session: &mut RenderSession,
        number: &CertificateNumber,
        html: &str,
    ) -> Result<RenderedDocument, RenderFailure> {
        session.stage = RenderStage::Launching;
        let executable = self.config.executable_path.display().to_string();
        tokio::time::timeout(self.config.launch_timeout, self.launch(session, html))
            .await
            .map_err(|_| RenderFailure::EngineLaunch {
                executable: executable.clone(),
                reason: format!(
                    "engine did not start within {} ms",
                    self.config.launch_timeout.as_millis()
                ),
            })??;

        session.stage = RenderStage::ContentLoading;
        let early_exit = session.await_first_output().await?;

        session.stage = RenderStage::Paginating;
        let status = match early_exit {
            Some(status) => status,
            None => session
                .process_mut()?
                .wait()
                .await
                .map_err(RenderFailure::workspace(RenderStage::Paginating))?,
        };
        if !status.success() {
            return Err(session.engine_failure(status).await);
        }

        session.publish(number).await
    }

    async fn launch(&self, session: &mut RenderSession, html: &str) -> Result<(), RenderFailure> {
        let stage = RenderStage::Launching;
        let workspace = session.workspace_dir().to_path_buf();
        tokio::fs::create_dir_all(&workspace)
            .await
            .map_err(RenderFailure::workspace(stage))?;

        let staged = tempfile::Builder::new()
            .prefix(".render-")
            .suffix(".html")
            .tempfile_in(&workspace)
            .map_err(RenderFailure::workspace(stage))?;
        tokio::fs::write(staged.path(), html.as_bytes())
            .await
            .map_err(RenderFailure::workspace(stage))?;
        let document = tokio::fs::canonicalize(staged.path())
            .await
            .map_err(RenderFailure::workspace(stage))?;

        let partial = tempfile::Builder::new()
            .prefix(".render-")
            .suffix(".pdf.partial")
            .tempfile_in(&workspace)
            .map_err(RenderFailure::workspace(stage))?
            .into_temp_path();
        let output = tokio::fs::canonicalize(&partial)
            .await
            .map_err(RenderFailure::workspace(stage))?;

        let profile = tempfile::Builder::new()
            .prefix("certpress-profile-")
            .tempdir()
            .map_err(RenderFailure::workspace(stage))?;

        let command = self.command(&document, &output, profile.path())?;
        session.staged = Some(staged);
        session.partial = Some(partial);
        session.profile = Some(profile);

        let process =
            EngineProcess::spawn(command).map_err(|err| RenderFailure::EngineLaunch {
                executable: self.config.executable_path.display().to_string(),
                reason: match err.kind() {
                    std::io::ErrorKind::NotFound => "executable not found".to_string(),
                    std::io::ErrorKind::PermissionDenied => "permission denied".to_string(),
                    _ => err.to_string(),
                },
            })?;
        session.process = Some(process);
        Ok(())
    }

    fn command(
        &self,
        document: &Path,
        output: &Path,
        profile: &Path,
    ) -> Result<Command, RenderFailure> {
        let document_url = Url::from_file_path(document).map_err(|()| {
            RenderFailure::Workspace {
                stage: RenderStage::Launching,
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("`{}` is not an absolute path", document.display()),
                ),
            }
        })?;
        let page = self.config.page;

        let mut command = Command::new(&self.config.executable_path);
        if self.config.headless {
            command.arg("--headless");
        }
        command
            .args(&self.config.sandbox_args)
            .arg("--disable-gpu")
            .arg("--disable-extensions")
            .arg("--hide-scrollbars")
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--no-pdf-header-footer")
            .arg("--run-all-compositor-stages-before-draw")
            .arg(format!("--user-data-dir={}", profile.display()))
            .arg(format!("--window-size={},{}", page.width_px, page.height_px))
            .arg(format!(
                "--virtual-time-budget={}",
                self.config.settle_budget.as_millis()
            ))
            .arg(format!("--print-to-pdf={}", output.display()))
            .arg(document_url.as_str());
        Ok(command)
    }
}

/// Resources held for one render. Dropping the session (e.g. when the caller
/// abandons the request) still kills the engine through [`EngineProcess`]'s
/// `Drop`; temp files and the profile directory clean themselves up.
struct RenderSession {
    stage: RenderStage,
    output_path: PathBuf,
    process: Option<EngineProcess>,
    staged: Option<NamedTempFile>,
    partial: Option<TempPath>,
    profile: Option<TempDir>,
}

impl RenderSession {
    fn new(output_path: &Path) -> Self {
        Self {
            stage: RenderStage::Idle,
            output_path: output_path.to_path_buf(),
            process: None,
            staged: None,
            partial: None,
            profile: None,
        }
    }

    fn workspace_dir(&self) -> &Path {
        match self.output_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }

    fn process_mut(&mut self) -> Result<&mut EngineProcess, RenderFailure> {
        let stage = self.stage;
        self.process.as_mut().ok_or_else(|| RenderFailure::Engine {
            stage,
            detail: "engine process was not started".to_string(),
        })
    }

    fn partial_path(&self) -> Result<PathBuf, RenderFailure> {
        self.partial
            .as_ref()
            .map(|path| path.to_path_buf())
            .ok_or_else(|| RenderFailure::Engine {
                stage: self.stage,
                detail: "no output location prepared".to_string(),
            })
    }

    /// Content loading ends when the engine starts writing output. Returns the
    /// exit status if the engine finished (or died) before that was observed.
    async fn await_first_output(&mut self) -> Result<Option<ExitStatus>, RenderFailure> {
        let partial = self.partial_path()?;
        let mut poll = tokio::time::interval(OUTPUT_POLL_INTERVAL);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let process = self.process_mut()?;
        loop {
            tokio::select! {
                status = process.wait() => {
                    let status = status
                        .map_err(RenderFailure::workspace(RenderStage::ContentLoading))?;
                    return Ok(Some(status));
                }
                _ = poll.tick() => {
                    if output_len(&partial).await > 0 {
                        return Ok(None);
                    }
                }
            }
        }
    }

    async fn engine_failure(&mut self, status: ExitStatus) -> RenderFailure {
        let stage = self.stage;
        let stderr = match self.process.as_mut() {
            Some(process) => process.stderr_tail().await,
            None => String::new(),
        };
        let detail = if stderr.is_empty() {
            format!("engine exited with {status}")
        } else {
            format!("engine exited with {status}: {stderr}")
        };
        RenderFailure::Engine { stage, detail }
    }

    /// Validate the engine output and atomically move it into place.
    async fn publish(
        &mut self,
        number: &CertificateNumber,
    ) -> Result<RenderedDocument, RenderFailure> {
        let stage = self.stage;
        let partial = self.partial_path()?;
        let bytes = tokio::fs::read(&partial)
            .await
            .map_err(RenderFailure::workspace(stage))?;

        if bytes.is_empty() {
            return Err(RenderFailure::Engine {
                stage,
                detail: "engine exited without producing output".to_string(),
            });
        }
        if !bytes.starts_with(PDF_MAGIC) {
            return Err(RenderFailure::Engine {
                stage,
                detail: "engine output is not a PDF document".to_string(),
            });
        }

        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let sha256 = hex::encode(hasher.finalize());

        let Some(temp_path) = self.partial.take() else {
            return Err(RenderFailure::Engine {
                stage,
                detail: "no output location prepared".to_string(),
            });
        };
        temp_path
            .persist(&self.output_path)
            .map_err(|err| RenderFailure::workspace(stage)(err.error))?;

        let document = RenderedDocument {
            number: number.clone(),
            byte_length: bytes.len() as u64,
            storage_path: self.output_path.clone(),
            produced_at: OffsetDateTime::now_utc(),
            sha256,
        };

        info!(
            target = "application::render::supervisor",
            op = "supervisor::publish",
            certificate_number = %number,
            pid = self.process.as_ref().and_then(EngineProcess::pid).unwrap_or_default(),
            bytes = document.byte_length,
            path = %document.storage_path.display(),
            "Rendered document published"
        );

        Ok(document)
    }

    async fn teardown(&mut self) {
        if let Some(mut process) = self.process.take() {
            process.terminate().await;
        }
        self.staged.take();
        self.partial.take();
        if let Some(profile) = self.profile.take() {
            // Engine profiles can hold thousands of small files.
            let _ = tokio::task::spawn_blocking(move || drop(profile)).await;
        }
    }
}

async fn output_len(path: &Path) -> u64 {
    tokio::fs::metadata(path)
        .await
        .map(|metadata| metadata.len())
        .unwrap_or(0)
}
