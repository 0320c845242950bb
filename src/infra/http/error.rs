use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::application::certificates::{CertificateError, ErrorKind};
use crate::application::error::ErrorReport;

/// Seconds clients are asked to wait after a render timeout.
pub const RENDER_RETRY_AFTER_SECS: u64 = 30;

pub mod codes {
    pub const VALIDATION: &str = "validation_error";
    pub const UNAUTHORIZED: &str = "unauthorized";
    pub const AUTHORIZATION: &str = "authorization_error";
    pub const NOT_FOUND: &str = "not_found";
    pub const TEMPLATE_MISSING: &str = "template_missing";
    pub const TEMPLATE_INVALID: &str = "template_invalid";
    pub const ASSET_MISSING: &str = "asset_missing";
    pub const ENGINE_LAUNCH: &str = "engine_launch_error";
    pub const RENDER_TIMEOUT: &str = "render_timeout";
    pub const ARTIFACT_NOT_FOUND: &str = "artifact_not_found";
    pub const RENDER_FAILED: &str = "unknown_render_failure";
    pub const STORAGE: &str = "storage_error";
}

#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub success: bool,
    pub error: ApiErrorMessage,
}

#[derive(Debug, Serialize)]
pub struct ApiErrorMessage {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: &'static str,
    hint: Option<String>,
    retry_after: Option<u64>,
    report: Option<ErrorReport>,
}

impl ApiError {
    pub fn new(
        status: StatusCode,
        code: &'static str,
        message: &'static str,
        hint: Option<String>,
    ) -> Self {
        Self {
            status,
            code,
            message,
            hint,
            retry_after: None,
            report: None,
        }
    }

    pub fn bad_request(message: &'static str, hint: Option<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, codes::VALIDATION, message, hint)
    }

    pub fn unauthorized() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            codes::UNAUTHORIZED,
            "Authenticated identity required",
            None,
        )
    }

    pub fn forbidden(message: &'static str) -> Self {
        Self::new(StatusCode::FORBIDDEN, codes::AUTHORIZATION, message, None)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    fn with_report(mut self, report: ErrorReport) -> Self {
        self.report = Some(report);
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let report = self.report.unwrap_or_else(|| {
            ErrorReport::from_message(
                "infra::http::api",
                self.status,
                format!(
                    "{}: {}",
                    self.code,
                    self.hint.as_deref().unwrap_or(self.message)
                ),
            )
        });
        let body = ApiErrorBody {
            success: false,
            error: ApiErrorMessage {
                code: self.code.to_string(),
                message: self.message.to_string(),
                hint: self.hint,
            },
        };
        let mut response = (self.status, Json(body)).into_response();
        if let Some(value) = self
            .retry_after
            .and_then(|seconds| HeaderValue::from_str(&seconds.to_string()).ok())
        {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
        // Attach a structured report so shared logging middleware can emit rich diagnostics.
        report.attach(&mut response);
        response
    }
}

/// Map a service failure to its public shape. Only validation and
/// authorization failures echo details back; everything else is logged.
pub(crate) fn certificate_to_api(err: CertificateError) -> ApiError {
    let kind = err.kind();
    let (status, code, message, hint) = match kind {
        ErrorKind::Validation => (
            StatusCode::BAD_REQUEST,
            codes::VALIDATION,
            "Request could not be processed",
            Some(err.to_string()),
        ),
        ErrorKind::Authorization => (
            StatusCode::FORBIDDEN,
            codes::AUTHORIZATION,
            "User does not have access to this course",
            None,
        ),
        ErrorKind::NotFound => (
            StatusCode::NOT_FOUND,
            codes::NOT_FOUND,
            "Certificate not found",
            None,
        ),
        ErrorKind::ArtifactNotFound => (
            StatusCode::NOT_FOUND,
            codes::ARTIFACT_NOT_FOUND,
            "Certificate file is no longer available",
            Some("Generate the certificate again".to_string()),
        ),
        ErrorKind::RenderTimeout => (
            StatusCode::SERVICE_UNAVAILABLE,
            codes::RENDER_TIMEOUT,
            "Certificate rendering timed out",
            Some(format!("Retry after {RENDER_RETRY_AFTER_SECS} seconds")),
        ),
        ErrorKind::TemplateMissing => (
            StatusCode::INTERNAL_SERVER_ERROR,
            codes::TEMPLATE_MISSING,
            "Certificate template unavailable",
            None,
        ),
        ErrorKind::TemplateInvalid => (
            StatusCode::INTERNAL_SERVER_ERROR,
            codes::TEMPLATE_INVALID,
            "Certificate template is invalid",
            None,
        ),
        ErrorKind::AssetMissing => (
            StatusCode::INTERNAL_SERVER_ERROR,
            codes::ASSET_MISSING,
            "Certificate template background not found",
            None,
        ),
        ErrorKind::EngineLaunch => (
            StatusCode::INTERNAL_SERVER_ERROR,
            codes::ENGINE_LAUNCH,
            "Certificate renderer unavailable",
            None,
        ),
        ErrorKind::UnknownRenderFailure => (
            StatusCode::INTERNAL_SERVER_ERROR,
            codes::RENDER_FAILED,
            "Certificate generation failed",
            None,
        ),
        ErrorKind::Storage => (
            StatusCode::INTERNAL_SERVER_ERROR,
            codes::STORAGE,
            "Certificate storage failed",
            None,
        ),
    };

    let report = ErrorReport::from_error("infra::http::certificates", status, &err);
    let api = ApiError::new(status, code, message, hint).with_report(report);
    if kind == ErrorKind::RenderTimeout {
        api.with_retry_after(RENDER_RETRY_AFTER_SECS)
    } else {
        api
    }
}
