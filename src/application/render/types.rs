use std::{fmt, io, path::PathBuf, time::Duration};

use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;

use crate::domain::certificates::CertificateNumber;

pub const DEFAULT_PAGE_WIDTH_PX: u32 = 1120;
pub const DEFAULT_PAGE_HEIGHT_PX: u32 = 792;
/// ISO A4 at 96 CSS pixels per inch.
pub const A4_WIDTH_PX: u32 = 794;
pub const A4_HEIGHT_PX: u32 = 1123;

/// Printed page margins, in CSS pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageMargins {
    pub top_px: u32,
    pub right_px: u32,
    pub bottom_px: u32,
    pub left_px: u32,
}

impl PageMargins {
    pub fn vertical(px: u32) -> Self {
        Self {
            top_px: px,
            bottom_px: px,
            ..Self::default()
        }
    }

    fn css(&self) -> String {
        if *self == Self::default() {
            return "0".to_string();
        }
        format!(
            "{}px {}px {}px {}px",
            self.top_px, self.right_px, self.bottom_px, self.left_px
        )
    }
}

/// How document content maps onto pages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PageFlow {
    /// One page; the document box is the page box.
    #[default]
    Single,
    /// Content continues onto further pages as needed.
    Continuous,
}

/// Page size and layout of the exported document, in CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageGeometry {
    pub width_px: u32,
    pub height_px: u32,
    pub margins: PageMargins,
    pub flow: PageFlow,
}

impl Default for PageGeometry {
    fn default() -> Self {
        Self::fixed(DEFAULT_PAGE_WIDTH_PX, DEFAULT_PAGE_HEIGHT_PX)
    }
}

impl PageGeometry {
    /// A single borderless page of exactly this size.
    pub fn fixed(width_px: u32, height_px: u32) -> Self {
        Self {
            width_px,
            height_px,
            margins: PageMargins::default(),
            flow: PageFlow::Single,
        }
    }

    /// Flowing A4 pages with the given margins.
    pub fn a4(margins: PageMargins) -> Self {
        Self {
            width_px: A4_WIDTH_PX,
            height_px: A4_HEIGHT_PX,
            margins,
            flow: PageFlow::Continuous,
        }
    }

    /// Stylesheet pinning the printed page to this geometry with backgrounds on.
    pub fn print_stylesheet(&self) -> String {
        let Self {
            width_px,
            height_px,
            ..
        } = self;
        let margin = self.margins.css();
        let body_margin = match self.flow {
            PageFlow::Single => "margin:0;",
            PageFlow::Continuous => "",
        };
        format!(
            "<style data-certpress-print>@page{{size:{width_px}px {height_px}px;margin:{margin}}}\
             html,body{{{body_margin}-webkit-print-color-adjust:exact;print-color-adjust:exact}}</style>"
        )
    }
}

/// Everything the supervisor needs to launch one rendering engine.
///
/// Passed explicitly into [`super::RenderSupervisor::new`]; nothing about the
/// engine transport is read from process-global state.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Chromium-compatible executable.
    pub executable_path: PathBuf,
    /// Extra arguments, typically sandbox switches such as `--no-sandbox`.
    pub sandbox_args: Vec<String>,
    pub headless: bool,
    /// Wall-clock budget shared by launch, content loading and pagination.
    pub deadline: Duration,
    /// Upper bound for the launch stage alone.
    pub launch_timeout: Duration,
    /// Virtual time the engine may spend settling resources before printing.
    pub settle_budget: Duration,
    pub page: PageGeometry,
}

/// Stages of a single render. Terminal outcomes are carried by the `Result`
/// returned from the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderStage {
    Idle,
    Launching,
    ContentLoading,
    Paginating,
}

impl RenderStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RenderStage::Idle => "idle",
            RenderStage::Launching => "launching",
            RenderStage::ContentLoading => "content_loading",
            RenderStage::Paginating => "paginating",
        }
    }
}

impl fmt::Display for RenderStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A PDF produced by a successful render, published at `storage_path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedDocument {
    pub number: CertificateNumber,
    pub byte_length: u64,
    pub storage_path: PathBuf,
    pub produced_at: OffsetDateTime,
    pub sha256: String,
}

/// Failures surfaced by the render supervisor. Every variant is returned only
/// after the engine process has been torn down.
#[derive(Debug, Error)]
pub enum RenderFailure {
    #[error("failed to launch rendering engine `{executable}`: {reason}")]
    EngineLaunch { executable: String, reason: String },
    #[error("render exceeded its {budget_ms} ms deadline during {stage}")]
    Timeout { stage: RenderStage, budget_ms: u64 },
    #[error("rendering engine failed during {stage}: {detail}")]
    Engine { stage: RenderStage, detail: String },
    #[error("render workspace unavailable during {stage}: {source}")]
    Workspace {
        stage: RenderStage,
        #[source]
        source: io::Error,
    },
}

impl RenderFailure {
    pub(crate) fn workspace(stage: RenderStage) -> impl FnOnce(io::Error) -> Self {
        move |source| Self::Workspace { stage, source }
    }

    /// Stable label used in logs and metrics.
    pub fn outcome(&self) -> &'static str {
        match self {
            RenderFailure::EngineLaunch { .. } => "launch_failed",
            RenderFailure::Timeout { .. } => "timed_out",
            RenderFailure::Engine { .. } | RenderFailure::Workspace { .. } => "failed",
        }
    }
}
