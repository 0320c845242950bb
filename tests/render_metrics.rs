#![cfg(unix)]

mod support;

use std::{
    collections::HashSet,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use certpress::application::render::{
    METRIC_RENDER_MEMORY_ALERT_TOTAL, METRIC_RENDER_MS, METRIC_RENDER_TOTAL, ResourceGovernor,
};
use certpress::domain::certificates::CertificateNumber;
use metrics_util::debugging::DebuggingRecorder;
use support::{PRINTING_ENGINE, Workspace, engine_config};

#[tokio::test]
async fn renders_emit_outcome_latency_and_memory_metrics() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");

    let workspace = Workspace::new();
    let engine = workspace.engine("printing", PRINTING_ENGINE);
    let resident = Arc::new(AtomicU64::new(1 << 20));
    let governor = ResourceGovernor::with_probe(
        engine_config(engine, Duration::from_secs(5)),
        1_024,
        Arc::new(move || Some(resident.fetch_add(1 << 20, Ordering::SeqCst))),
    );

    let number = CertificateNumber::generate("TEST");
    governor
        .render(
            &number,
            "<html><body>metrics</body></html>",
            &workspace.artifacts_dir().join(number.file_name()),
        )
        .await
        .expect("render succeeds");

    let missing = ResourceGovernor::new(
        engine_config(workspace.path().join("absent"), Duration::from_secs(5)),
        u64::MAX,
    );
    let number = CertificateNumber::generate("TEST");
    missing
        .render(
            &number,
            "<html></html>",
            &workspace.artifacts_dir().join(number.file_name()),
        )
        .await
        .expect_err("launch fails");

    let snapshot = snapshotter.snapshot().into_vec();
    let names = snapshot
        .iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect::<HashSet<String>>();

    for expected in [
        METRIC_RENDER_TOTAL,
        METRIC_RENDER_MS,
        METRIC_RENDER_MEMORY_ALERT_TOTAL,
    ] {
        assert!(names.contains(expected), "missing metric {expected}");
    }

    let outcomes = snapshot
        .iter()
        .filter(|(composite_key, _, _, _)| composite_key.key().name() == METRIC_RENDER_TOTAL)
        .flat_map(|(composite_key, _, _, _)| {
            composite_key
                .key()
                .labels()
                .filter(|label| label.key() == "outcome")
                .map(|label| label.value().to_string())
                .collect::<Vec<_>>()
        })
        .collect::<HashSet<String>>();
    assert!(outcomes.contains("succeeded"));
    assert!(outcomes.contains("launch_failed"));
}
