#![allow(dead_code)]

use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use certpress::application::{
    certificates::{CertificateService, IssuanceSettings},
    render::{ArtifactStore, EngineConfig, PageGeometry, ResourceGovernor},
};
use certpress::infra::memory::MemoryStore;
use tempfile::TempDir;

/// Engine that copies the document it was given next to itself, records its
/// pid and prints a minimal PDF.
pub const PRINTING_ENGINE: &str = r#"here="$(dirname "$0")"
echo $$ >> "$here/pids.log"
for arg in "$@"; do
  case "$arg" in
    --print-to-pdf=*) out="${arg#--print-to-pdf=}" ;;
    file://*) doc="${arg#file://}" ;;
  esac
done
cp "$doc" "$here/last.html"
printf '%%PDF-1.4\n1 0 obj << /Type /Catalog >> endobj\n%%%%EOF\n' > "$out"
"#;

/// Engine that never produces output. It also forks a helper so group
/// teardown can be observed.
pub const STALLING_ENGINE: &str = r#"here="$(dirname "$0")"
sleep 30 &
echo $! >> "$here/pids.log"
echo $$ >> "$here/pids.log"
exec sleep 30
"#;

/// Engine that starts printing and then hangs before finishing.
pub const STALL_WHILE_PRINTING_ENGINE: &str = r#"here="$(dirname "$0")"
echo $$ >> "$here/pids.log"
for arg in "$@"; do
  case "$arg" in --print-to-pdf=*) out="${arg#--print-to-pdf=}" ;; esac
done
printf '%%PDF-1.4 truncated' > "$out"
exec sleep 30
"#;

/// Engine that leaves a helper behind in its process group and then prints.
pub const PRINTING_WITH_HELPER_ENGINE: &str = r#"here="$(dirname "$0")"
sleep 30 >/dev/null 2>&1 &
echo $! >> "$here/pids.log"
echo $$ >> "$here/pids.log"
for arg in "$@"; do
  case "$arg" in --print-to-pdf=*) out="${arg#--print-to-pdf=}" ;; esac
done
printf '%%PDF-1.4\n%%%%EOF\n' > "$out"
"#;

/// Engine that leaves a helper behind in its process group and then crashes.
pub const CRASHING_WITH_HELPER_ENGINE: &str = r#"here="$(dirname "$0")"
sleep 30 >/dev/null 2>&1 &
echo $! >> "$here/pids.log"
echo $$ >> "$here/pids.log"
echo "renderer crashed" >&2
exit 3
"#;

pub struct Workspace {
    pub dir: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("temp dir"),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Install an engine script in its own directory so pid logs do not mix.
    pub fn engine(&self, name: &str, body: &str) -> PathBuf {
        let dir = self.path().join("engines").join(name);
        fs::create_dir_all(&dir).expect("engine dir");
        let path = dir.join("chromium");
        fs::write(&path, format!("#!/bin/sh\n{body}")).expect("write engine");
        let mut perms = fs::metadata(&path).expect("metadata").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).expect("set perms");
        path
    }

    pub fn write_template(&self, html: &str) -> PathBuf {
        let path = self.path().join("certificate.html");
        fs::write(&path, html).expect("write template");
        path
    }

    pub fn write_asset(&self) -> PathBuf {
        let path = self.path().join("background.png");
        fs::write(&path, [0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n']).expect("asset");
        path
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.path().join("artifacts")
    }
}

pub const TEMPLATE: &str = r#"<!DOCTYPE html>
<html><head><title>{{ certNumber }}</title></head>
<body style="background-image:url('{{{ templatePath }}}')">
<h1 class="name">{{ name }}</h1>
<p class="course">{{ course }}</p>
<p class="date">{{ date }}</p>
</body></html>"#;

pub fn engine_config(executable: PathBuf, deadline: Duration) -> EngineConfig {
    EngineConfig {
        executable_path: executable,
        sandbox_args: vec!["--no-sandbox".to_string()],
        headless: true,
        deadline,
        launch_timeout: Duration::from_secs(2),
        settle_budget: Duration::from_millis(100),
        page: PageGeometry::default(),
    }
}

pub fn service(
    workspace: &Workspace,
    engine: EngineConfig,
    store: Arc<MemoryStore>,
    template_path: PathBuf,
    asset_path: PathBuf,
) -> CertificateService {
    CertificateService::new(
        store.clone(),
        store,
        ResourceGovernor::new(engine, u64::MAX),
        ArtifactStore::new(workspace.artifacts_dir(), false),
        IssuanceSettings {
            template_path,
            asset_path,
            number_prefix: "TEST".to_string(),
        },
    )
}

/// Pids recorded by the engine scripts installed next to `executable`.
pub fn recorded_pids(executable: &Path) -> Vec<i32> {
    let Some(dir) = executable.parent() else {
        return Vec::new();
    };
    fs::read_to_string(dir.join("pids.log"))
        .unwrap_or_default()
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect()
}

#[cfg(target_os = "linux")]
pub fn is_alive(pid: i32) -> bool {
    // Zombies left for init to reap are dead for our purposes.
    match fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
            .is_some_and(|state| state != "Z" && state != "X"),
        Err(_) => false,
    }
}

#[cfg(not(target_os = "linux"))]
pub fn is_alive(pid: i32) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}

/// Wait up to `grace` for every pid to disappear; returns the survivors.
pub async fn survivors(pids: &[i32], grace: Duration) -> Vec<i32> {
    let started = Instant::now();
    loop {
        let alive: Vec<i32> = pids.iter().copied().filter(|pid| is_alive(*pid)).collect();
        if alive.is_empty() || started.elapsed() >= grace {
            return alive;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
