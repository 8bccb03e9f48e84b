use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JohannError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

pub type JohannResult<T> = std::result::Result<T, JohannError>;

impl JohannError {
    pub fn validation(msg: impl Into<String>) -> Self {
        JohannError::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        JohannError::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        JohannError::Conflict(msg.into())
    }

    pub fn unrecognized_score(name: &str) -> Self {
        JohannError::NotFound(format!("unrecognized score '{}'", name))
    }

    pub fn status_code(&self) -> u16 {
        match self {
            JohannError::Validation(_) | JohannError::Conflict(_) => 400,
            JohannError::NotFound(_) => 404,
            JohannError::Internal(_) => 500,
        }
    }

    /// Message safe to hand back to a client. Internal failure text is only
    /// exposed in debug mode.
    pub fn client_message(&self, debug: bool) -> String {
        match self {
            JohannError::Internal(_) if !debug => "internal error".to_string(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JohannResponse {
    pub success: bool,
    pub messages: Vec<String>,
    pub data: Option<Value>,
    #[serde(skip)]
    pub status_code: u16,
}

impl JohannResponse {
    pub fn ok(data: Value) -> Self {
        JohannResponse {
            success: true,
            messages: Vec::new(),
            data: Some(data),
            status_code: 200,
        }
    }

    pub fn ok_with_messages(messages: Vec<String>, data: Option<Value>) -> Self {
        JohannResponse {
            success: true,
            messages,
            data,
            status_code: 200,
        }
    }

    pub fn failure(status_code: u16, messages: Vec<String>) -> Self {
        JohannResponse {
            success: false,
            messages,
            data: None,
            status_code,
        }
    }

    pub fn from_error(err: &JohannError, debug: bool) -> Self {
        JohannResponse::failure(err.status_code(), vec![err.client_message(debug)])
    }

    pub fn from_result(result: JohannResult<Value>, debug: bool) -> Self {
        match result {
            Ok(data) => JohannResponse::ok(data),
            Err(e) => JohannResponse::from_error(&e, debug),
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "success": self.success,
            "messages": self.messages,
            "data": self.data,
        })
    }
}
