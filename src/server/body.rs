//! Request body guard shared by the JSON endpoints.

use axum::body::Body;
use axum::http::Request;
use axum::http::header::CONTENT_LENGTH;
use serde_json::Value;

use super::ApiError;

/// Largest accepted request body.
pub const MAX_BODY_BYTES: usize = 256 * 1024;

/// Read and parse a JSON body. An empty body parses as `{}`.
pub async fn read_json(req: Request<Body>) -> Result<Value, ApiError> {
	let declared = req
		.headers()
		.get(CONTENT_LENGTH)
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.trim().parse::<u64>().ok());
	if declared.is_some_and(|len| len > MAX_BODY_BYTES as u64) {
		return Err(ApiError::BodyTooLarge);
	}

	let bytes = axum::body::to_bytes(req.into_body(), MAX_BODY_BYTES)
		.await
		.map_err(|e| {
			if is_length_limit(&e) {
				ApiError::BodyTooLarge
			} else {
				ApiError::BodyReadFailed
			}
		})?;
	parse_json(&bytes)
}

pub fn parse_json(bytes: &[u8]) -> Result<Value, ApiError> {
	if bytes.iter().all(u8::is_ascii_whitespace) {
		return Ok(Value::Object(Default::default()));
	}
	serde_json::from_slice(bytes).map_err(|_| ApiError::BadJson)
}

fn is_length_limit(err: &axum::Error) -> bool {
	let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
	while let Some(e) = source {
		if e.is::<http_body_util::LengthLimitError>() {
			return true;
		}
		source = e.source();
	}
	false
}

/// A string field, trimmed; `None` when absent, not a string, or blank.
pub fn str_field<'a>(v: &'a Value, key: &str) -> Option<&'a str> {
	v.get(key)
		.and_then(Value::as_str)
		.map(str::trim)
		.filter(|s| !s.is_empty())
}

/// A string or an array of strings, as a list.
pub fn str_list(v: Option<&Value>) -> Vec<String> {
	match v {
		Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
		Some(Value::Array(items)) => items
			.iter()
			.filter_map(Value::as_str)
			.map(str::trim)
			.filter(|s| !s.is_empty())
			.map(str::to_string)
			.collect(),
		_ => Vec::new(),
	}
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;

	#[test]
	fn empty_body_is_empty_object() {
		assert_eq!(parse_json(b"").unwrap(), serde_json::json!({}));
		assert_eq!(parse_json(b" \n").unwrap(), serde_json::json!({}));
		assert!(matches!(parse_json(b"{nope"), Err(ApiError::BadJson)));
	}

	#[tokio::test]
	async fn declared_length_over_limit_is_rejected() {
		let req = Request::builder()
			.header(CONTENT_LENGTH, (MAX_BODY_BYTES + 1).to_string())
			.body(Body::empty())
			.unwrap();
		assert!(matches!(read_json(req).await, Err(ApiError::BodyTooLarge)));
	}

	#[tokio::test]
	async fn oversized_stream_is_rejected() {
		let req = Request::builder()
			.body(Body::from(vec![b' '; MAX_BODY_BYTES + 10]))
			.unwrap();
		assert!(matches!(read_json(req).await, Err(ApiError::BodyTooLarge)));
	}

	#[test]
	fn lists_accept_string_or_array() {
		let v = serde_json::json!({"a": "x", "b": ["y", 1, " z "]});
		assert_eq!(str_list(v.get("a")), vec!["x"]);
		assert_eq!(str_list(v.get("b")), vec!["y", "z"]);
		assert!(str_list(v.get("c")).is_empty());
	}
}
