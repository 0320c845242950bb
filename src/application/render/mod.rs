//! Document rendering pipeline.
//!
//! Compose a self-contained HTML document, drive one headless engine per
//! request to print it on the configured page geometry (one fixed-size page
//! for certificates, flowing A4 for receipts), and hand the result to
//! delivery. The engine is a scoped resource: it never outlives
//! [`ResourceGovernor::render`].

mod compose;
mod delivery;
mod engine;
mod governor;
mod memory;
mod supervisor;
mod types;

pub use compose::{
    ComposeError, EmbeddedAsset, TemplateBindings, TemplateField, TemplateSource, compose,
    compose_document,
};
pub use delivery::{ArtifactStore, ArtifactStream, DeliveryError, PDF_CONTENT_TYPE};
pub use governor::{
    GovernedRender, METRIC_RENDER_MEMORY_ALERT_TOTAL, METRIC_RENDER_MS, METRIC_RENDER_TOTAL,
    ResourceGovernor,
};
pub use memory::{MemoryDelta, MemoryProbe, process_probe, resident_bytes};
pub use supervisor::RenderSupervisor;
pub use types::{
    A4_HEIGHT_PX, A4_WIDTH_PX, DEFAULT_PAGE_HEIGHT_PX, DEFAULT_PAGE_WIDTH_PX, EngineConfig,
    PageFlow, PageGeometry, PageMargins, RenderFailure, RenderStage, RenderedDocument,
};
