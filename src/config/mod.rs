//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::application::certificates::IssuanceSettings;
use crate::application::receipts::ReceiptSettings;
use crate::application::render::{
    DEFAULT_PAGE_HEIGHT_PX, DEFAULT_PAGE_WIDTH_PX, EngineConfig, PageGeometry,
};
use crate::domain::certificates::DEFAULT_NUMBER_PREFIX;
use crate::domain::receipts::DEFAULT_RECEIPT_PREFIX;

pub use cli::{
    CliArgs, Command, ReceiptArgs, RenderArgs, RenderOverrides, ServeArgs, ServeOverrides,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "certpress";
const ENV_PREFIX: &str = "CERTPRESS";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 5000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_ENGINE_EXECUTABLE: &str = "chromium";
const DEFAULT_SANDBOX_ARGS: [&str; 2] = ["--no-sandbox", "--disable-setuid-sandbox"];
const DEFAULT_RENDER_DEADLINE_SECS: u64 = 25;
const DEFAULT_LAUNCH_TIMEOUT_SECS: u64 = 10;
const DEFAULT_SETTLE_BUDGET_MS: u64 = 2_000;
const DEFAULT_MEMORY_ALERT_BYTES: u64 = 256 * 1024 * 1024;
const MAX_PAGE_DIMENSION_PX: u32 = 16_384;
const DEFAULT_ARTIFACTS_DIR: &str = "generated-certificates";
const DEFAULT_TEMPLATE_PATH: &str = "templates/certificate.html";
const DEFAULT_ASSET_PATH: &str = "assets/certificate-background.png";
const DEFAULT_RECEIPT_TEMPLATE_PATH: &str = "templates/receipt.html";
const DEFAULT_RECEIPT_LOGO_PATH: &str = "assets/receipt-logo.png";
const MAX_NUMBER_PREFIX_LEN: usize = 16;
// Time allowed to tear engines down after the last render deadline expires.
const SHUTDOWN_TEARDOWN_MARGIN: Duration = Duration::from_secs(2);

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub render: RenderSettings,
    pub artifacts: ArtifactSettings,
    pub template: TemplateSettings,
    pub receipt: ReceiptTemplateSettings,
    pub entitlements: EntitlementSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub engine: EngineConfig,
    pub memory_alert_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ArtifactSettings {
    pub directory: PathBuf,
    pub remove_after_delivery: bool,
    pub number_prefix: String,
}

#[derive(Debug, Clone)]
pub struct TemplateSettings {
    pub html_path: PathBuf,
    pub asset_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ReceiptTemplateSettings {
    pub html_path: PathBuf,
    pub logo_path: PathBuf,
    pub number_prefix: String,
}

#[derive(Debug, Clone)]
pub struct EntitlementSettings {
    pub allow_all: bool,
    /// `(owner_id, course)` pairs.
    pub grants: Vec<(String, String)>,
}

impl Settings {
    pub fn issuance(&self) -> IssuanceSettings {
        IssuanceSettings {
            template_path: self.template.html_path.clone(),
            asset_path: self.template.asset_path.clone(),
            number_prefix: self.artifacts.number_prefix.clone(),
        }
    }

    pub fn receipts(&self) -> ReceiptSettings {
        ReceiptSettings {
            template_path: self.receipt.html_path.clone(),
            logo_path: self.receipt.logo_path.clone(),
            number_prefix: self.receipt.number_prefix.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Render(args)) => raw.apply_render_overrides(&args.overrides),
        Some(Command::Receipt(args)) => raw.apply_render_overrides(&args.overrides),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    render: RawRenderSettings,
    artifacts: RawArtifactSettings,
    template: RawTemplateSettings,
    receipt: RawReceiptSettings,
    entitlements: RawEntitlementSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }

        self.apply_render_overrides(&overrides.render);
    }

    fn apply_render_overrides(&mut self, overrides: &RenderOverrides) {
        if let Some(path) = overrides.executable_path.as_ref() {
            self.render.executable_path = Some(path.clone());
        }
        if let Some(seconds) = overrides.deadline_seconds {
            self.render.deadline_seconds = Some(seconds);
        }
        if let Some(headless) = overrides.headless {
            self.render.headless = Some(headless);
        }
        if let Some(directory) = overrides.artifacts_directory.as_ref() {
            self.artifacts.directory = Some(directory.clone());
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            render,
            artifacts,
            template,
            receipt,
            entitlements,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let render = build_render_settings(render)?;
        let artifacts = build_artifact_settings(artifacts)?;
        let template = build_template_settings(template)?;
        let receipt = build_receipt_settings(receipt)?;
        let entitlements = build_entitlement_settings(entitlements)?;

        if server.graceful_shutdown < render.engine.deadline + SHUTDOWN_TEARDOWN_MARGIN {
            return Err(LoadError::invalid(
                "server.graceful_shutdown_seconds",
                format!(
                    "must be at least {} seconds so in-flight renders can finish",
                    (render.engine.deadline + SHUTDOWN_TEARDOWN_MARGIN).as_secs_f64().ceil()
                ),
            ));
        }

        Ok(Self {
            server,
            logging,
            render,
            artifacts,
            template,
            receipt,
            entitlements,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    let graceful_shutdown = positive_seconds(graceful_secs, "server.graceful_shutdown_seconds")?;

    Ok(ServerSettings {
        addr,
        graceful_shutdown,
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_render_settings(render: RawRenderSettings) -> Result<RenderSettings, LoadError> {
    let executable_path = render
        .executable_path
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ENGINE_EXECUTABLE));
    if executable_path.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "render.executable_path",
            "path must not be empty",
        ));
    }

    let sandbox_args = render
        .sandbox_args
        .unwrap_or_else(|| Vec::from(DEFAULT_SANDBOX_ARGS.map(str::to_string)));
    if let Some(arg) = sandbox_args.iter().find(|arg| !arg.starts_with("--")) {
        return Err(LoadError::invalid(
            "render.sandbox_args",
            format!("`{arg}` is not a `--` switch"),
        ));
    }

    let deadline = positive_seconds(
        render
            .deadline_seconds
            .unwrap_or(DEFAULT_RENDER_DEADLINE_SECS),
        "render.deadline_seconds",
    )?;
    let launch_timeout = positive_seconds(
        render
            .launch_timeout_seconds
            .unwrap_or(DEFAULT_LAUNCH_TIMEOUT_SECS),
        "render.launch_timeout_seconds",
    )?;

    let settle_budget_ms = render.settle_budget_ms.unwrap_or(DEFAULT_SETTLE_BUDGET_MS);
    let settle_budget = Duration::from_millis(settle_budget_ms);
    if settle_budget >= deadline {
        return Err(LoadError::invalid(
            "render.settle_budget_ms",
            "must be shorter than the render deadline",
        ));
    }

    let page = PageGeometry::fixed(
        page_dimension(
            render.page_width_px.unwrap_or(DEFAULT_PAGE_WIDTH_PX),
            "render.page_width_px",
        )?,
        page_dimension(
            render.page_height_px.unwrap_or(DEFAULT_PAGE_HEIGHT_PX),
            "render.page_height_px",
        )?,
    );

    Ok(RenderSettings {
        engine: EngineConfig {
            executable_path,
            sandbox_args,
            headless: render.headless.unwrap_or(true),
            deadline,
            launch_timeout,
            settle_budget,
            page,
        },
        memory_alert_bytes: render
            .memory_alert_bytes
            .unwrap_or(DEFAULT_MEMORY_ALERT_BYTES),
    })
}

fn build_artifact_settings(artifacts: RawArtifactSettings) -> Result<ArtifactSettings, LoadError> {
    let directory = artifacts
        .directory
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ARTIFACTS_DIR));
    if directory.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "artifacts.directory",
            "path must not be empty",
        ));
    }

    let number_prefix = number_prefix(
        artifacts.number_prefix,
        DEFAULT_NUMBER_PREFIX,
        "artifacts.number_prefix",
    )?;

    Ok(ArtifactSettings {
        directory,
        remove_after_delivery: artifacts.remove_after_delivery.unwrap_or(false),
        number_prefix,
    })
}

fn build_template_settings(template: RawTemplateSettings) -> Result<TemplateSettings, LoadError> {
    let html_path = template
        .html_path
        .unwrap_or_else(|| PathBuf::from(DEFAULT_TEMPLATE_PATH));
    if html_path.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "template.html_path",
            "path must not be empty",
        ));
    }

    let asset_path = template
        .asset_path
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ASSET_PATH));
    if asset_path.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "template.asset_path",
            "path must not be empty",
        ));
    }

    Ok(TemplateSettings {
        html_path,
        asset_path,
    })
}

fn build_receipt_settings(
    receipt: RawReceiptSettings,
) -> Result<ReceiptTemplateSettings, LoadError> {
    let html_path = receipt
        .html_path
        .unwrap_or_else(|| PathBuf::from(DEFAULT_RECEIPT_TEMPLATE_PATH));
    if html_path.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "receipt.html_path",
            "path must not be empty",
        ));
    }

    let logo_path = receipt
        .logo_path
        .unwrap_or_else(|| PathBuf::from(DEFAULT_RECEIPT_LOGO_PATH));
    if logo_path.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "receipt.logo_path",
            "path must not be empty",
        ));
    }

    Ok(ReceiptTemplateSettings {
        html_path,
        logo_path,
        number_prefix: number_prefix(
            receipt.number_prefix,
            DEFAULT_RECEIPT_PREFIX,
            "receipt.number_prefix",
        )?,
    })
}

fn build_entitlement_settings(
    entitlements: RawEntitlementSettings,
) -> Result<EntitlementSettings, LoadError> {
    let mut grants = Vec::with_capacity(entitlements.grants.len());
    for grant in entitlements.grants {
        let owner = grant.owner.trim().to_string();
        let course = grant.course.trim().to_string();
        if owner.is_empty() || course.is_empty() {
            return Err(LoadError::invalid(
                "entitlements.grants",
                "owner and course must not be empty",
            ));
        }
        grants.push((owner, course));
    }

    if entitlements.allow_all == Some(true) && !grants.is_empty() {
        return Err(LoadError::invalid(
            "entitlements.allow_all",
            "cannot be enabled together with explicit grants",
        ));
    }

    Ok(EntitlementSettings {
        allow_all: entitlements.allow_all.unwrap_or(grants.is_empty()),
        grants,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRenderSettings {
    executable_path: Option<PathBuf>,
    sandbox_args: Option<Vec<String>>,
    headless: Option<bool>,
    deadline_seconds: Option<u64>,
    launch_timeout_seconds: Option<u64>,
    settle_budget_ms: Option<u64>,
    page_width_px: Option<u32>,
    page_height_px: Option<u32>,
    memory_alert_bytes: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawArtifactSettings {
    directory: Option<PathBuf>,
    remove_after_delivery: Option<bool>,
    number_prefix: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawTemplateSettings {
    html_path: Option<PathBuf>,
    asset_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawReceiptSettings {
    html_path: Option<PathBuf>,
    logo_path: Option<PathBuf>,
    number_prefix: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawEntitlementSettings {
    allow_all: Option<bool>,
    grants: Vec<RawGrant>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawGrant {
    owner: String,
    course: String,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn positive_seconds(value: u64, key: &'static str) -> Result<Duration, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(Duration::from_secs(value))
}

fn number_prefix(
    value: Option<String>,
    default: &str,
    key: &'static str,
) -> Result<String, LoadError> {
    let prefix = value
        .map(|value| value.trim().to_string())
        .unwrap_or_else(|| default.to_string());
    let prefix_ok = !prefix.is_empty()
        && prefix.len() <= MAX_NUMBER_PREFIX_LEN
        && prefix.chars().all(|ch| ch.is_ascii_alphanumeric());
    if !prefix_ok {
        return Err(LoadError::invalid(
            key,
            format!("must be 1-{MAX_NUMBER_PREFIX_LEN} ASCII letters or digits"),
        ));
    }
    Ok(prefix)
}

fn page_dimension(value: u32, key: &'static str) -> Result<u32, LoadError> {
    if value == 0 || value > MAX_PAGE_DIMENSION_PX {
        return Err(LoadError::invalid(
            key,
            format!("must be between 1 and {MAX_PAGE_DIMENSION_PX} pixels"),
        ));
    }
    Ok(value)
}
