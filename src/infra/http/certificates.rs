//! Certificate endpoints.

use axum::{
    Json,
    body::Body,
    extract::{Extension, Path, State, rejection::JsonRejection},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::application::{
    certificates::{GenerateCertificateCommand, Principal},
    render::ArtifactStream,
};
use crate::domain::certificates::CertificateRecord;

use super::HttpState;
use super::error::{ApiError, certificate_to_api};

#[derive(Debug, Serialize)]
pub struct CertificateListResponse {
    pub success: bool,
    pub certificates: Vec<CertificateRecord>,
}

pub async fn generate_certificate(
    State(state): State<HttpState>,
    Extension(principal): Extension<Principal>,
    payload: Result<Json<GenerateCertificateCommand>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(command) = payload.map_err(|rejection| {
        ApiError::bad_request("Request body is invalid", Some(rejection.body_text()))
    })?;

    let issued = state
        .certificates
        .generate(&principal, command)
        .await
        .map_err(certificate_to_api)?;

    Ok(pdf_response(issued.artifact))
}

pub async fn list_certificates(
    State(state): State<HttpState>,
    Extension(principal): Extension<Principal>,
    Path(user_id): Path<String>,
) -> Result<Json<CertificateListResponse>, ApiError> {
    if principal.user_id != user_id {
        return Err(ApiError::forbidden(
            "Certificates of other users are not visible",
        ));
    }

    let certificates = state
        .certificates
        .list_for_owner(&user_id)
        .await
        .map_err(certificate_to_api)?;

    Ok(Json(CertificateListResponse {
        success: true,
        certificates,
    }))
}

pub async fn download_certificate(
    State(state): State<HttpState>,
    Path(certificate_number): Path<String>,
) -> Result<Response, ApiError> {
    let artifact = state
        .certificates
        .download(&certificate_number)
        .await
        .map_err(certificate_to_api)?;

    Ok(pdf_response(artifact))
}

fn pdf_response(artifact: ArtifactStream) -> Response {
    let content_type = HeaderValue::from_static(artifact.content_type);
    let length = HeaderValue::from(artifact.byte_length);
    let disposition = HeaderValue::from_str(&artifact.content_disposition())
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"));

    let mut response = (
        StatusCode::OK,
        Body::from_stream(artifact.into_byte_stream()),
    )
        .into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, content_type);
    headers.insert(header::CONTENT_LENGTH, length);
    headers.insert(header::CONTENT_DISPOSITION, disposition);
    response
}
