use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::error::CardscanError;

pub type Result<T, E = AppError> = std::result::Result<T, E>;

/// API错误类型
#[derive(Debug)]
pub struct AppError(pub StatusCode, pub anyhow::Error);

impl AppError {
    pub fn new(status: StatusCode, err: impl Into<anyhow::Error>) -> Self {
        Self(status, err.into())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "error": format!("{:#}", self.1) }))).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        let err = err.into();
        let status = match err.downcast_ref() {
            Some(CardscanError::BuildInProgress(_)) => StatusCode::CONFLICT,
            Some(CardscanError::InconsistentBundle(_) | CardscanError::MissingArtifact(_)) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self(status, err)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn test_status_from_domain_error() {
        let err = AppError::from(anyhow::Error::from(CardscanError::BuildInProgress(PathBuf::new())));
        assert_eq!(err.0, StatusCode::CONFLICT);
        let err = AppError::from(anyhow::Error::from(CardscanError::InconsistentBundle("x".into())));
        assert_eq!(err.0, StatusCode::SERVICE_UNAVAILABLE);
        let err = AppError::from(anyhow::anyhow!("boom"));
        assert_eq!(err.0, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
