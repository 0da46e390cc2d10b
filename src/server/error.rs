use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::{Map, Value, json};
use thiserror::Error;

use crate::exec::ExecError;
use crate::sync::registry::PushError;

/// Errors returned by HTTP handlers. The `Display` text is the wire error code.
#[derive(Debug, Error)]
pub enum ApiError {
	#[error("body_too_large")]
	BodyTooLarge,
	#[error("body_read_failed")]
	BodyReadFailed,
	#[error("bad_json")]
	BadJson,
	#[error("missing_path")]
	MissingPath,
	#[error("missing_id")]
	MissingId,
	#[error("invalid_request")]
	InvalidRequest,
	#[error("invalid_base64")]
	InvalidBase64,
	#[error("resolve_failed")]
	ResolveFailed { detail: String },
	#[error("send_failed")]
	SendFailed { detail: String },
	#[error("exec_failed")]
	ExecFailed(#[from] ExecError),
	#[error("scan_disabled")]
	ScanDisabled,
	#[error("registry_full")]
	RegistryFull,
	#[error("missing_master_reference")]
	MissingMasterReference,
	#[error("invalid_master_reference")]
	InvalidMasterReference,
	#[error("no_ui")]
	NoUi,
	#[error("ui_not_found")]
	UiNotFound,
	#[error("forbidden")]
	Forbidden,
	/// Unknown route or a role-gated endpoint; plain-text body.
	#[error("not_found")]
	NotFound,
	#[error("method_not_allowed")]
	MethodNotAllowed,
	#[error(transparent)]
	Push(#[from] PushError),
}

impl ApiError {
	pub fn status(&self) -> StatusCode {
		match self {
			ApiError::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
			ApiError::ResolveFailed { .. } | ApiError::SendFailed { .. } => StatusCode::BAD_GATEWAY,
			ApiError::ExecFailed(_) | ApiError::UiNotFound => StatusCode::INTERNAL_SERVER_ERROR,
			ApiError::RegistryFull => StatusCode::SERVICE_UNAVAILABLE,
			ApiError::Forbidden => StatusCode::FORBIDDEN,
			ApiError::NoUi | ApiError::NotFound => StatusCode::NOT_FOUND,
			ApiError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
			ApiError::Push(p) => match p {
				PushError::SlaveNotFound { .. } | PushError::ReplaySlaveNotFound { .. } => {
					StatusCode::NOT_FOUND
				}
				PushError::SlotUnassigned { .. } => StatusCode::CONFLICT,
				PushError::NoMoves | PushError::SlotOutOfRange { .. } => StatusCode::BAD_REQUEST,
			},
			_ => StatusCode::BAD_REQUEST,
		}
	}

	fn body(&self) -> Value {
		let mut out = Map::new();
		out.insert("error".into(), json!(self.to_string()));
		match self {
			ApiError::ResolveFailed { detail } | ApiError::SendFailed { detail } => {
				out.insert("detail".into(), json!(detail));
			}
			ApiError::Push(PushError::SlotOutOfRange { slot })
			| ApiError::Push(PushError::SlotUnassigned { slot }) => {
				out.insert("slot".into(), json!(slot));
			}
			ApiError::Push(PushError::SlaveNotFound { id })
			| ApiError::Push(PushError::ReplaySlaveNotFound { id }) => {
				out.insert("id".into(), json!(id));
			}
			_ => {}
		}
		Value::Object(out)
	}
}

impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		if let ApiError::ExecFailed(e) = &self {
			log::warn!("exec failed: {}", e);
		}
		match self {
			ApiError::NotFound => (StatusCode::NOT_FOUND, "not_found").into_response(),
			other => (other.status(), Json(other.body())).into_response(),
		}
	}
}
