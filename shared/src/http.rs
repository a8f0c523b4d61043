use lambda_http::{http::StatusCode, Body, Error, Response};
use serde::{de::DeserializeOwned, Serialize};

use crate::error::ApiError;

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

pub fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Result<Response<Body>, Error> {
    Ok(Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .body(serde_json::to_string(value)?.into())
        .map_err(Box::new)?)
}

pub fn empty_response(status: StatusCode) -> Result<Response<Body>, Error> {
    Ok(Response::builder()
        .status(status)
        .header("Access-Control-Allow-Origin", "*")
        .body(Body::Empty)
        .map_err(Box::new)?)
}

pub fn error_response(err: &ApiError) -> Result<Response<Body>, Error> {
    match err {
        ApiError::Internal(detail) => tracing::error!("Internal error: {}", detail),
        other => tracing::warn!("Request rejected ({}): {}", other.kind(), other),
    }
    let error = ErrorResponse {
        error: err.kind().to_string(),
        message: err.public_message(),
    };
    json_response(err.status(), &error)
}

/// Parse a JSON request body. An empty body is read as `{}` so partial
/// updates without fields are accepted.
pub fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    if body.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(serde_json::from_slice(b"{}")?);
    }
    Ok(serde_json::from_slice(body)?)
}

pub fn preflight() -> Result<Response<Body>, Error> {
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("Access-Control-Allow-Origin", "*")
        .header(
            "Access-Control-Allow-Methods",
            "GET,POST,PUT,PATCH,DELETE,OPTIONS",
        )
        .header(
            "Access-Control-Allow-Headers",
            "Content-Type,Authorization,X-User-Id",
        )
        .body(Body::Empty)
        .map_err(Box::new)?)
}

pub fn not_found() -> Result<Response<Body>, Error> {
    json_response(
        StatusCode::NOT_FOUND,
        &serde_json::json!({"error": "Not found"}),
    )
}

pub fn method_not_allowed() -> Result<Response<Body>, Error> {
    json_response(
        StatusCode::METHOD_NOT_ALLOWED,
        &serde_json::json!({"error": "Method not allowed"}),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, Default)]
    struct Partial {
        name: Option<String>,
    }

    #[test]
    fn test_empty_body_parses_as_empty_object() {
        let parsed: Partial = parse_body(b"").unwrap();
        assert!(parsed.name.is_none());
    }

    #[test]
    fn test_malformed_body_is_validation_error() {
        let err = parse_body::<Partial>(b"{not json").unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_error_response_shape() {
        let resp = error_response(&ApiError::not_found("Health record not found")).unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body: serde_json::Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(body["error"], "NotFound");
        assert_eq!(body["message"], "Health record not found");
    }
}
