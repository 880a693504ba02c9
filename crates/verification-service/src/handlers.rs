//! API request handlers for transaction verification

use axum::{
    extract::{Multipart, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use veriflow_common::{ApiResponse, Error, Principal};

use crate::models::{
    Transaction, TransactionStatus, TransactionType, VerificationData, VerificationMethod,
};
use crate::AppState;

/// Request to create a transaction
#[derive(Debug, Deserialize)]
pub struct CreateTransactionRequest {
    #[serde(rename = "type")]
    pub transaction_type: TransactionType,
    pub amount: f64,
    pub currency: String,
    pub verification_method: VerificationMethod,
}

/// Transaction summary returned by the API
#[derive(Debug, Serialize)]
pub struct TransactionView {
    pub id: String,
    pub owner_id: String,

    #[serde(rename = "type")]
    pub transaction_type: TransactionType,

    pub amount: f64,
    pub currency: String,
    pub status: TransactionStatus,
    pub verification_method: VerificationMethod,
    pub verification_data: VerificationData,
    pub risk_score: u8,
    pub created_at: DateTime<Utc>,
    pub expiry_time: DateTime<Utc>,
}

impl From<Transaction> for TransactionView {
    fn from(txn: Transaction) -> Self {
        Self {
            id: txn.id,
            owner_id: txn.owner_id,
            transaction_type: txn.transaction_type,
            amount: txn.amount,
            currency: txn.currency,
            status: txn.status,
            verification_method: txn.verification_method,
            verification_data: txn.verification_data,
            risk_score: txn.risk_score,
            created_at: txn.created_at,
            expiry_time: txn.expiry_time,
        }
    }
}

/// API Error type
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ApiResponse::<()>::error(self.message))).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::UnknownClient => StatusCode::UNAUTHORIZED,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Expired => StatusCode::BAD_REQUEST,
            Error::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::VerificationMismatch { .. } => StatusCode::BAD_REQUEST,
            Error::AttemptsExhausted => StatusCode::BAD_REQUEST,
            Error::ExternalService(_) => StatusCode::BAD_GATEWAY,
            Error::ConcurrencyConflict(_) => StatusCode::CONFLICT,
            Error::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Redis(_) | Error::JsonSerialization(_) | Error::Io(_) | Error::Other(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        ApiError {
            status,
            message: err.to_string(),
        }
    }
}

/// Health check endpoint
pub async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "verification-service"
    }))
}

/// Create a pending transaction for the authenticated principal
pub async fn create_transaction_handler(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Json(payload): Json<CreateTransactionRequest>,
) -> Result<(StatusCode, Json<ApiResponse<TransactionView>>), ApiError> {
    info!(
        "Creating {:?} transaction for {}",
        payload.transaction_type,
        principal.owner_id()
    );

    let txn = state
        .orchestrator
        .create(
            principal.owner_id(),
            payload.transaction_type,
            payload.amount,
            &payload.currency,
            payload.verification_method,
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::ok(TransactionView::from(txn))),
    ))
}

/// Read a transaction, applying lazy expiry
pub async fn get_transaction_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<TransactionView>>, ApiError> {
    let txn = state.orchestrator.get(&id).await?;
    Ok(Json(ApiResponse::ok(TransactionView::from(txn))))
}

/// Verify face evidence uploaded as multipart field `image`
pub async fn verify_face_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    multipart: Multipart,
) -> Result<Json<ApiResponse<TransactionView>>, ApiError> {
    let (image, evidence_ref) = read_face_evidence(multipart).await?;

    info!("Face verification requested for transaction {}", id);

    let txn = state
        .orchestrator
        .verify_face(&id, &image, evidence_ref)
        .await?;

    Ok(Json(ApiResponse::ok(TransactionView::from(txn))))
}

/// Verify voice evidence: multipart fields `audio` and `text`
pub async fn verify_voice_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    multipart: Multipart,
) -> Result<Json<ApiResponse<TransactionView>>, ApiError> {
    let (audio, expected_text, evidence_ref) = read_voice_evidence(multipart).await?;

    info!("Voice verification requested for transaction {}", id);

    let txn = state
        .orchestrator
        .verify_voice(&id, &audio, &expected_text, evidence_ref)
        .await?;

    Ok(Json(ApiResponse::ok(TransactionView::from(txn))))
}

async fn read_face_evidence(
    mut multipart: Multipart,
) -> Result<(Vec<u8>, Option<String>), ApiError> {
    let mut image = None;
    let mut evidence_ref = None;

    while let Some(field) = multipart.next_field().await.map_err(bad_multipart)? {
        if field.name() == Some("image") {
            evidence_ref = field.file_name().map(str::to_string);
            image = Some(field.bytes().await.map_err(bad_multipart)?.to_vec());
        }
    }

    match image {
        Some(bytes) if !bytes.is_empty() => Ok((bytes, evidence_ref)),
        _ => Err(ApiError {
            status: StatusCode::BAD_REQUEST,
            message: "multipart field 'image' is required".to_string(),
        }),
    }
}

async fn read_voice_evidence(
    mut multipart: Multipart,
) -> Result<(Vec<u8>, String, Option<String>), ApiError> {
    let mut audio = None;
    let mut text = None;
    let mut evidence_ref = None;

    while let Some(field) = multipart.next_field().await.map_err(bad_multipart)? {
        match field.name() {
            Some("audio") => {
                evidence_ref = field.file_name().map(str::to_string);
                audio = Some(field.bytes().await.map_err(bad_multipart)?.to_vec());
            }
            Some("text") => {
                text = Some(field.text().await.map_err(bad_multipart)?);
            }
            _ => {}
        }
    }

    let audio = match audio {
        Some(bytes) if !bytes.is_empty() => bytes,
        _ => {
            return Err(ApiError {
                status: StatusCode::BAD_REQUEST,
                message: "multipart field 'audio' is required".to_string(),
            })
        }
    };

    let text = text.filter(|t| !t.trim().is_empty()).ok_or_else(|| ApiError {
        status: StatusCode::BAD_REQUEST,
        message: "multipart field 'text' is required".to_string(),
    })?;

    Ok((audio, text, evidence_ref))
}

fn bad_multipart(err: axum::extract::multipart::MultipartError) -> ApiError {
    ApiError {
        status: StatusCode::BAD_REQUEST,
        message: format!("Invalid multipart body: {}", err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (Error::Validation("bad".to_string()), StatusCode::BAD_REQUEST),
            (Error::UnknownClient, StatusCode::UNAUTHORIZED),
            (Error::NotFound("x".to_string()), StatusCode::NOT_FOUND),
            (Error::Expired, StatusCode::BAD_REQUEST),
            (
                Error::VerificationMismatch {
                    remaining_attempts: 1,
                },
                StatusCode::BAD_REQUEST,
            ),
            (Error::AttemptsExhausted, StatusCode::BAD_REQUEST),
            (
                Error::ExternalService("down".to_string()),
                StatusCode::BAD_GATEWAY,
            ),
            (
                Error::ConcurrencyConflict("x".to_string()),
                StatusCode::CONFLICT,
            ),
            (
                Error::StorageUnavailable("down".to_string()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (Error::Redis("down".to_string()), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).status, expected);
        }
    }

    #[test]
    fn test_mismatch_error_reports_remaining_attempts() {
        let api_error = ApiError::from(Error::VerificationMismatch {
            remaining_attempts: 2,
        });

        assert!(api_error.message.contains("2 attempt(s) remaining"));
    }

    #[test]
    fn test_create_request_accepts_wire_shape() {
        let payload: CreateTransactionRequest = serde_json::from_value(serde_json::json!({
            "type": "payment",
            "amount": 100.0,
            "currency": "USD",
            "verification_method": "face"
        }))
        .unwrap();

        assert_eq!(payload.transaction_type, TransactionType::Payment);
        assert_eq!(payload.verification_method, VerificationMethod::Face);
    }
}
