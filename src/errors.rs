use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Stable error taxonomy carried all the way out to HTTP clients.
///
/// Every variant here corresponds to one row of the error-kind table: the
/// kind is what crosses the wire, the message is for humans reading logs.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
	#[error("link missing or unparseable")]
	InvalidInspect,
	#[error("malformed request body: {0}")]
	BadBody(String),
	#[error("bulk key mismatch")]
	BadSecret,
	#[error("per-client request cap exceeded")]
	MaxRequests,
	#[error("global queue cap exceeded")]
	MaxQueueSize,
	#[error("no session ready")]
	SteamOffline,
	#[error("rate limit exceeded")]
	RateLimit,
	#[error("ttl exceeded after max attempts")]
	TtlExceeded,
	#[error("no bot available")]
	NoBotsAvailable,
	#[error("internal error: {0}")]
	GenericBad(String),
}

impl GatewayError {
	pub fn kind(&self) -> &'static str {
		match self {
			GatewayError::InvalidInspect => "InvalidInspect",
			GatewayError::BadBody(_) => "BadBody",
			GatewayError::BadSecret => "BadSecret",
			GatewayError::MaxRequests => "MaxRequests",
			GatewayError::MaxQueueSize => "MaxQueueSize",
			GatewayError::SteamOffline => "SteamOffline",
			GatewayError::RateLimit => "RateLimit",
			GatewayError::TtlExceeded => "TTLExceeded",
			GatewayError::NoBotsAvailable => "NoBotsAvailable",
			GatewayError::GenericBad(_) => "GenericBad",
		}
	}

	fn status(&self) -> StatusCode {
		match self {
			GatewayError::InvalidInspect | GatewayError::BadBody(_) => StatusCode::BAD_REQUEST,
			GatewayError::BadSecret => StatusCode::UNAUTHORIZED,
			GatewayError::MaxRequests | GatewayError::MaxQueueSize | GatewayError::RateLimit => {
				StatusCode::TOO_MANY_REQUESTS
			},
			GatewayError::SteamOffline => StatusCode::SERVICE_UNAVAILABLE,
			GatewayError::TtlExceeded | GatewayError::NoBotsAvailable => StatusCode::GATEWAY_TIMEOUT,
			GatewayError::GenericBad(_) => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}
}

#[derive(Serialize)]
struct ErrorBody {
	error: String,
	message: String,
}

impl IntoResponse for GatewayError {
	fn into_response(self) -> Response {
		let body = ErrorBody {
			error: self.kind().to_string(),
			message: self.to_string(),
		};
		(self.status(), Json(body)).into_response()
	}
}
