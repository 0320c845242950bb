use std::{fmt, path::Path, sync::Arc, time::Instant};

use metrics::{counter, histogram};
use tracing::{info, warn};

use crate::domain::certificates::CertificateNumber;

use super::{
    memory::{MemoryDelta, MemoryProbe, process_probe},
    supervisor::RenderSupervisor,
    types::{EngineConfig, PageGeometry, RenderFailure, RenderedDocument},
};

pub const METRIC_RENDER_TOTAL: &str = "certpress_render_total";
pub const METRIC_RENDER_MS: &str = "certpress_render_ms";
pub const METRIC_RENDER_MEMORY_ALERT_TOTAL: &str = "certpress_render_memory_alert_total";

/// Successful render plus the memory observed around it.
#[derive(Debug, Clone)]
pub struct GovernedRender {
    pub document: RenderedDocument,
    pub memory: MemoryDelta,
}

/// Enforces the shared render deadline and watches process memory.
///
/// Teardown is owned by the supervisor session; by the time
/// [`ResourceGovernor::render`] returns, successfully or not, the engine is
/// gone.
#[derive(Clone)]
pub struct ResourceGovernor {
    supervisor: RenderSupervisor,
    memory_alert_bytes: u64,
    probe: MemoryProbe,
}

impl fmt::Debug for ResourceGovernor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceGovernor")
            .field("supervisor", &self.supervisor)
            .field("memory_alert_bytes", &self.memory_alert_bytes)
            .finish_non_exhaustive()
    }
}

impl ResourceGovernor {
    pub fn new(engine: EngineConfig, memory_alert_bytes: u64) -> Self {
        Self::with_probe(engine, memory_alert_bytes, process_probe())
    }

    pub fn with_probe(engine: EngineConfig, memory_alert_bytes: u64, probe: MemoryProbe) -> Self {
        Self {
            supervisor: RenderSupervisor::new(engine),
            memory_alert_bytes,
            probe,
        }
    }

    pub fn engine(&self) -> &EngineConfig {
        self.supervisor.config()
    }

    /// Same engine, deadline and memory policy, printing onto `page`.
    pub fn with_page(&self, page: PageGeometry) -> Self {
        Self {
            supervisor: RenderSupervisor::new(EngineConfig {
                page,
                ..self.engine().clone()
            }),
            memory_alert_bytes: self.memory_alert_bytes,
            probe: Arc::clone(&self.probe),
        }
    }

    pub async fn render(
        &self,
        number: &CertificateNumber,
        html: &str,
        output_path: &Path,
    ) -> Result<GovernedRender, RenderFailure> {
        let deadline = self.supervisor.config().deadline;
        let started_at = Instant::now();
        let before_bytes = (self.probe)();

        let result = self
            .supervisor
            .render(number, html, output_path, deadline)
            .await;

        let memory = MemoryDelta {
            before_bytes,
            after_bytes: (self.probe)(),
        };
        let elapsed_ms = started_at.elapsed().as_secs_f64() * 1000.0;
        let outcome = match &result {
            Ok(_) => "succeeded",
            Err(err) => err.outcome(),
        };

        counter!(METRIC_RENDER_TOTAL, "outcome" => outcome).increment(1);
        histogram!(METRIC_RENDER_MS).record(elapsed_ms);
        self.check_memory(number, memory);

        match &result {
            Ok(document) => info!(
                target = "application::render::governor",
                op = "governor::render",
                certificate_number = %number,
                result = outcome,
                bytes = document.byte_length,
                elapsed_ms = elapsed_ms as u64,
                memory_growth_bytes = memory.growth_bytes(),
                "Render completed"
            ),
            Err(err) => warn!(
                target = "application::render::governor",
                op = "governor::render",
                certificate_number = %number,
                result = outcome,
                elapsed_ms = elapsed_ms as u64,
                error = %err,
                "Render failed"
            ),
        }

        result.map(|document| GovernedRender { document, memory })
    }

    fn check_memory(&self, number: &CertificateNumber, memory: MemoryDelta) {
        let growth = memory.growth_bytes();
        if growth <= self.memory_alert_bytes {
            return;
        }

        counter!(METRIC_RENDER_MEMORY_ALERT_TOTAL).increment(1);
        warn!(
            target = "application::render::governor",
            op = "governor::memory",
            certificate_number = %number,
            before_bytes = memory.before_bytes.unwrap_or_default(),
            after_bytes = memory.after_bytes.unwrap_or_default(),
            growth_bytes = growth,
            threshold_bytes = self.memory_alert_bytes,
            "Resident memory grew past alert threshold during render"
        );
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::{
        fs,
        os::unix::fs::PermissionsExt,
        path::PathBuf,
        sync::{
            Arc,
            atomic::{AtomicU64, Ordering},
        },
        time::Duration,
    };

    use tempfile::TempDir;

    use super::*;
    use crate::application::render::types::RenderStage;

    fn engine(dir: &Path, body: &str, deadline: Duration) -> EngineConfig {
        let path = dir.join("engine.sh");
        fs::write(&path, format!("#!/bin/sh\n{body}")).expect("write script");
        let mut perms = fs::metadata(&path).expect("metadata").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).expect("set perms");
        EngineConfig {
            executable_path: path,
            sandbox_args: Vec::new(),
            headless: true,
            deadline,
            launch_timeout: Duration::from_secs(2),
            settle_budget: Duration::from_millis(100),
            page: PageGeometry::default(),
        }
    }

    fn stepping_probe(step: u64) -> MemoryProbe {
        let counter = Arc::new(AtomicU64::new(1_000));
        Arc::new(move || Some(counter.fetch_add(step, Ordering::SeqCst)))
    }

    const PRINT: &str = r#"for arg in "$@"; do
  case "$arg" in --print-to-pdf=*) out="${arg#--print-to-pdf=}" ;; esac
done
printf '%%PDF-1.4\n%%%%EOF\n' > "$out"
"#;

    fn output(dir: &Path, number: &CertificateNumber) -> PathBuf {
        dir.join(number.file_name())
    }

    #[tokio::test]
    async fn memory_growth_is_reported_without_failing() {
        let dir = TempDir::new().expect("temp dir");
        let governor = ResourceGovernor::with_probe(
            engine(dir.path(), PRINT, Duration::from_secs(5)),
            10,
            stepping_probe(500),
        );
        let number = CertificateNumber::generate("GOV");

        let rendered = governor
            .render(&number, "<html></html>", &output(dir.path(), &number))
            .await
            .expect("render succeeds despite alert");

        assert_eq!(rendered.memory.growth_bytes(), 500);
        assert!(rendered.document.storage_path.exists());
    }

    #[test]
    fn with_page_keeps_engine_and_policy() {
        let dir = TempDir::new().expect("temp dir");
        let governor = ResourceGovernor::with_probe(
            engine(dir.path(), PRINT, Duration::from_secs(7)),
            42,
            Arc::new(|| None),
        );

        let a4 = PageGeometry::a4(crate::application::render::types::PageMargins::vertical(40));
        let receipts = governor.with_page(a4);

        assert_eq!(receipts.engine().page, a4);
        assert_eq!(receipts.engine().deadline, Duration::from_secs(7));
        assert_eq!(receipts.memory_alert_bytes, 42);
        assert_eq!(governor.engine().page, PageGeometry::default());
    }

    #[tokio::test]
    async fn configured_deadline_bounds_the_render() {
        let dir = TempDir::new().expect("temp dir");
        let governor = ResourceGovernor::with_probe(
            engine(dir.path(), "exec sleep 30\n", Duration::from_millis(250)),
            u64::MAX,
            Arc::new(|| None),
        );
        let number = CertificateNumber::generate("GOV");

        let started = Instant::now();
        let err = governor
            .render(&number, "<html></html>", &output(dir.path(), &number))
            .await
            .expect_err("stall times out");

        assert!(matches!(
            err,
            RenderFailure::Timeout {
                stage: RenderStage::ContentLoading,
                budget_ms: 250
            }
        ));
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
