use axum::extract::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use std::env;
use std::fmt::{self, Debug, Display};
use std::num::{ParseFloatError, ParseIntError};

pub const ENV_VAR_ERROR: i32 = 1;
pub const UPSTREAM_ERROR: i32 = 4;
pub const INVALID_INPUT_ERROR: i32 = 101;
pub const NOT_FOUND_ERROR: i32 = 102;
pub const TENANT_MISMATCH_ERROR: i32 = 103;
pub const DRIVER_MISMATCH_ERROR: i32 = 104;
pub const TERMINAL_STATE_ERROR: i32 = 105;
pub const DRIVER_UNAVAILABLE_ERROR: i32 = 106;
pub const INVALID_TRANSITION_ERROR: i32 = 107;
pub const STALE_WRITE_ERROR: i32 = 108;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    pub code: i32,
    pub message: String,
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

impl std::error::Error for Error {}

impl From<env::VarError> for Error {
    fn from(err: env::VarError) -> Self {
        env_var_error(err)
    }
}

impl From<ParseFloatError> for Error {
    fn from(_: ParseFloatError) -> Self {
        invalid_input_error("expected a number")
    }
}

impl From<ParseIntError> for Error {
    fn from(_: ParseIntError) -> Self {
        invalid_input_error("expected an integer")
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error_message) = match self.code {
            1..=99 => (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error"),
            NOT_FOUND_ERROR => (StatusCode::NOT_FOUND, self.message.as_str()),
            TENANT_MISMATCH_ERROR => (StatusCode::FORBIDDEN, self.message.as_str()),
            TERMINAL_STATE_ERROR | DRIVER_UNAVAILABLE_ERROR | STALE_WRITE_ERROR => {
                (StatusCode::CONFLICT, self.message.as_str())
            }
            _ => (StatusCode::BAD_REQUEST, self.message.as_str()),
        };

        let body = Json(json!({
            "code": self.code,
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

impl Error {
    pub fn is_not_found_error(&self) -> bool {
        self.code == NOT_FOUND_ERROR
    }

    pub fn is_tenant_mismatch_error(&self) -> bool {
        self.code == TENANT_MISMATCH_ERROR
    }

    pub fn is_driver_mismatch_error(&self) -> bool {
        self.code == DRIVER_MISMATCH_ERROR
    }

    pub fn is_terminal_state_error(&self) -> bool {
        self.code == TERMINAL_STATE_ERROR
    }

    pub fn is_driver_unavailable_error(&self) -> bool {
        self.code == DRIVER_UNAVAILABLE_ERROR
    }

    pub fn is_invalid_input_error(&self) -> bool {
        self.code == INVALID_INPUT_ERROR
    }

    pub fn is_invalid_transition_error(&self) -> bool {
        self.code == INVALID_TRANSITION_ERROR
    }

    pub fn is_stale_write_error(&self) -> bool {
        self.code == STALE_WRITE_ERROR
    }
}

pub fn invalid_input_error(detail: &str) -> Error {
    Error {
        code: INVALID_INPUT_ERROR,
        message: format!("invalid input: {}", detail),
    }
}

pub fn not_found_error() -> Error {
    Error {
        code: NOT_FOUND_ERROR,
        message: "not found".into(),
    }
}

pub fn tenant_mismatch_error() -> Error {
    Error {
        code: TENANT_MISMATCH_ERROR,
        message: "resource belongs to another tenant".into(),
    }
}

pub fn driver_mismatch_error() -> Error {
    Error {
        code: DRIVER_MISMATCH_ERROR,
        message: "driver is not assigned to this booking".into(),
    }
}

pub fn terminal_state_error() -> Error {
    Error {
        code: TERMINAL_STATE_ERROR,
        message: "booking is in a terminal state".into(),
    }
}

pub fn driver_unavailable_error() -> Error {
    Error {
        code: DRIVER_UNAVAILABLE_ERROR,
        message: "driver is no longer available".into(),
    }
}

pub fn invalid_transition_error() -> Error {
    Error {
        code: INVALID_TRANSITION_ERROR,
        message: "invalid status transition".into(),
    }
}

pub fn stale_write_error() -> Error {
    Error {
        code: STALE_WRITE_ERROR,
        message: "booking changed concurrently".into(),
    }
}

pub fn env_var_error(_: env::VarError) -> Error {
    Error {
        code: ENV_VAR_ERROR,
        message: "environment variable error".into(),
    }
}

pub fn upstream_error<T: Debug>(err: T) -> Error {
    Error {
        code: UPSTREAM_ERROR,
        message: format!("upstream error: {:?}", err),
    }
}

#[test]
fn client_errors_are_distinguishable() {
    assert!(not_found_error().is_not_found_error());
    assert!(!tenant_mismatch_error().is_not_found_error());
    assert!(terminal_state_error().is_terminal_state_error());
    assert!(invalid_input_error("radius").message.contains("radius"));
}

#[test]
fn internal_errors_hide_their_message() {
    let response = upstream_error("connection reset").into_response();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let response = not_found_error().into_response();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = tenant_mismatch_error().into_response();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = stale_write_error().into_response();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}
