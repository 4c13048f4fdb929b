use data_model::{ErrorKind, ErrorResponse};

/// The one failure taxonomy every layer of the invocation path reports
/// through. Everything a caller can observe, from admission rejection to a
/// malformed connector response, is one of these.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("too many requests: {0}")]
    TooManyRequests(String),
    #[error("bad gateway: {0}")]
    BadGateway(String),
    #[error("gateway timeout: {0}")]
    GatewayTimeout(String),
    #[error("request entity too large: {0}")]
    PayloadTooLarge(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("not implemented: {0}")]
    NotImplemented(String),
    #[error("call cancelled")]
    Cancelled,
}

impl RpcError {
    pub fn status_code(&self) -> u16 {
        match self {
            RpcError::TooManyRequests(_) => 429,
            RpcError::BadGateway(_) => 502,
            RpcError::GatewayTimeout(_) => 504,
            RpcError::PayloadTooLarge(_) => 413,
            RpcError::Forbidden(_) => 403,
            RpcError::Conflict(_) => 409,
            RpcError::BadRequest(_) => 400,
            RpcError::NotImplemented(_) => 501,
            RpcError::Cancelled => 499,
        }
    }

    /// Maps a connector-reported semantic error into the externally visible
    /// failure class.
    pub fn from_error_response(response: ErrorResponse) -> RpcError {
        let message = response.error_message;
        match response.error {
            ErrorKind::NotImplemented => {
                RpcError::NotImplemented("the connector is unable to process this request".into())
            }
            ErrorKind::Conflict => RpcError::Conflict(format!(
                "a conflict occurred when updating a feature: {message}"
            )),
            ErrorKind::Forbidden => RpcError::Forbidden("the user is not authorized".into()),
            ErrorKind::TooManyRequests => RpcError::TooManyRequests(
                "the connector cannot process the message due to a limitation in an upstream service"
                    .into(),
            ),
            ErrorKind::IllegalArgument => RpcError::BadRequest(message),
            ErrorKind::Timeout => RpcError::GatewayTimeout("connector timeout error".into()),
            ErrorKind::Exception | ErrorKind::BadGateway => {
                RpcError::BadGateway("connector error".into())
            }
            ErrorKind::PayloadTooLarge => RpcError::PayloadTooLarge(message),
        }
    }
}
