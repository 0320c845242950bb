//! Payment receipts: an A4 document with margins, rendered through the same
//! governed engine as certificates. Receipts are not recorded or entitled;
//! the caller has already verified the payment.

use std::{path::PathBuf, time::Instant};

use serde::Deserialize;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::application::render::{
    ArtifactStore, ArtifactStream, ComposeError, DeliveryError, EmbeddedAsset, PageGeometry,
    PageMargins, RenderFailure, ResourceGovernor, TemplateBindings, TemplateSource,
    compose_document,
};
use crate::domain::certificates::CertificateNumber;
use crate::domain::error::DomainError;
use crate::domain::receipts::{DEFAULT_RECEIPT_PREFIX, ReceiptFields, ReceiptInput};

/// Vertical margin of every receipt page, in CSS pixels.
pub const RECEIPT_MARGIN_PX: u32 = 40;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateReceiptCommand {
    pub name: String,
    pub email: String,
    pub course: String,
    pub amount: String,
    pub payment_id: String,
    pub order_id: String,
    #[serde(default)]
    pub date: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ReceiptSettings {
    pub template_path: PathBuf,
    pub logo_path: PathBuf,
    pub number_prefix: String,
}

impl Default for ReceiptSettings {
    fn default() -> Self {
        Self {
            template_path: PathBuf::from("templates/receipt.html"),
            logo_path: PathBuf::from("assets/receipt-logo.png"),
            number_prefix: DEFAULT_RECEIPT_PREFIX.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ReceiptError {
    #[error(transparent)]
    Validation(#[from] DomainError),
    #[error(transparent)]
    Compose(#[from] ComposeError),
    #[error(transparent)]
    Render(#[from] RenderFailure),
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

/// A rendered receipt and the number printed on it.
#[derive(Debug)]
pub struct IssuedReceipt {
    pub receipt_number: CertificateNumber,
    pub artifact: ArtifactStream,
}

struct ReceiptBindings<'a> {
    fields: &'a ReceiptFields,
    number: &'a CertificateNumber,
    logo_uri: String,
}

impl TemplateBindings for ReceiptBindings<'_> {
    fn lookup(&self, key: &str) -> Option<&str> {
        let value: &str = match key {
            "name" => &self.fields.payer_name,
            "email" => &self.fields.payer_email,
            "course" | "courseId" => &self.fields.course,
            "amount" => &self.fields.amount,
            "paymentId" => &self.fields.payment_id,
            "orderId" => &self.fields.order_id,
            "date" => &self.fields.paid_on,
            "receiptNumber" => self.number.as_str(),
            "logoDataUri" | "logoUrl" => &self.logo_uri,
            _ => return None,
        };
        Some(value)
    }
}

#[derive(Clone)]
pub struct ReceiptService {
    governor: ResourceGovernor,
    artifacts: ArtifactStore,
    settings: ReceiptSettings,
}

impl ReceiptService {
    /// `governor` is switched to the A4 receipt page; its engine, deadline
    /// and memory policy are kept.
    pub fn new(
        governor: &ResourceGovernor,
        artifacts: ArtifactStore,
        settings: ReceiptSettings,
    ) -> Self {
        Self {
            governor: governor.with_page(receipt_page()),
            artifacts,
            settings,
        }
    }

    pub fn page(&self) -> &PageGeometry {
        &self.governor.engine().page
    }

    pub async fn generate(
        &self,
        command: GenerateReceiptCommand,
    ) -> Result<IssuedReceipt, ReceiptError> {
        let started_at = Instant::now();
        let result = self.issue(command).await;

        match &result {
            Ok(issued) => info!(
                target = "application::receipts",
                op = "receipts::generate",
                receipt_number = %issued.receipt_number,
                result = "succeeded",
                elapsed_ms = started_at.elapsed().as_millis() as u64,
                "Receipt rendered"
            ),
            Err(err) => warn!(
                target = "application::receipts",
                op = "receipts::generate",
                result = "failed",
                elapsed_ms = started_at.elapsed().as_millis() as u64,
                error = %err,
                "Receipt rendering failed"
            ),
        }

        result
    }

    async fn issue(&self, command: GenerateReceiptCommand) -> Result<IssuedReceipt, ReceiptError> {
        let fields = ReceiptFields::new(
            ReceiptInput {
                name: &command.name,
                email: &command.email,
                course: &command.course,
                amount: &command.amount,
                payment_id: &command.payment_id,
                order_id: &command.order_id,
                date: command.date.as_deref(),
            },
            OffsetDateTime::now_utc(),
        )?;

        let template = TemplateSource::load(&self.settings.template_path).await?;
        let logo = EmbeddedAsset::load(&self.settings.logo_path).await?;
        let number = CertificateNumber::generate(&self.settings.number_prefix);
        let bindings = ReceiptBindings {
            fields: &fields,
            number: &number,
            logo_uri: logo.data_uri(),
        };
        let html = compose_document(&template, &bindings, self.page())?;

        let output = self.artifacts.path_for(&number);
        let rendered = self.governor.render(&number, &html, &output).await?;
        let artifact = self.artifacts.deliver(&rendered.document).await?;

        Ok(IssuedReceipt {
            receipt_number: number,
            artifact,
        })
    }
}

/// A4 portrait, flowing onto further pages, 40px top and bottom margins.
pub fn receipt_page() -> PageGeometry {
    PageGeometry::a4(PageMargins::vertical(RECEIPT_MARGIN_PX))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;
    use crate::application::render::{A4_HEIGHT_PX, A4_WIDTH_PX, EngineConfig, PageFlow};

    fn governor(dir: &std::path::Path) -> ResourceGovernor {
        ResourceGovernor::new(
            EngineConfig {
                // Never launched by these tests.
                executable_path: dir.join("no-engine"),
                sandbox_args: Vec::new(),
                headless: true,
                deadline: Duration::from_secs(1),
                launch_timeout: Duration::from_secs(1),
                settle_budget: Duration::from_millis(100),
                page: PageGeometry::default(),
            },
            u64::MAX,
        )
    }

    fn service(dir: &TempDir) -> ReceiptService {
        ReceiptService::new(
            &governor(dir.path()),
            ArtifactStore::new(dir.path().join("artifacts"), false),
            ReceiptSettings {
                template_path: dir.path().join("receipt.html"),
                logo_path: dir.path().join("logo.png"),
                number_prefix: "RCPT".to_string(),
            },
        )
    }

    fn command(amount: &str) -> GenerateReceiptCommand {
        GenerateReceiptCommand {
            name: "A. Sharma".to_string(),
            email: "a.sharma@example.com".to_string(),
            course: "Direct Tax Fundamentals".to_string(),
            amount: amount.to_string(),
            payment_id: "pay_1".to_string(),
            order_id: "order_1".to_string(),
            date: None,
        }
    }

    #[test]
    fn receipts_print_on_flowing_a4() {
        let dir = TempDir::new().expect("temp dir");
        let page = *service(&dir).page();

        assert_eq!((page.width_px, page.height_px), (A4_WIDTH_PX, A4_HEIGHT_PX));
        assert_eq!(page.flow, PageFlow::Continuous);
        assert_eq!(page.margins, PageMargins::vertical(RECEIPT_MARGIN_PX));
    }

    #[tokio::test]
    async fn malformed_amount_fails_before_loading_the_template() {
        let dir = TempDir::new().expect("temp dir");

        let err = service(&dir)
            .generate(command("twelve"))
            .await
            .expect_err("amount rejected");

        assert!(matches!(err, ReceiptError::Validation(_)));
    }

    #[tokio::test]
    async fn missing_logo_is_reported() {
        let dir = TempDir::new().expect("temp dir");
        std::fs::write(dir.path().join("receipt.html"), "<p>{{ amount }}</p>").unwrap();

        let err = service(&dir)
            .generate(command("1499"))
            .await
            .expect_err("logo missing");

        assert!(matches!(
            err,
            ReceiptError::Compose(ComposeError::AssetMissing { .. })
        ));
    }

    #[test]
    fn certificate_fields_are_unknown_to_receipts() {
        let fields = ReceiptFields::new(
            ReceiptInput {
                name: "A. Sharma",
                email: "a@example.com",
                course: "Course",
                amount: "10",
                payment_id: "pay_1",
                order_id: "order_1",
                date: None,
            },
            OffsetDateTime::now_utc(),
        )
        .unwrap();
        let number = CertificateNumber::generate("RCPT");
        let bindings = ReceiptBindings {
            fields: &fields,
            number: &number,
            logo_uri: String::new(),
        };

        assert_eq!(bindings.lookup("amount"), Some("10.00"));
        assert_eq!(bindings.lookup("receiptNumber"), Some(number.as_str()));
        assert_eq!(bindings.lookup("certNumber"), None);
    }
}
