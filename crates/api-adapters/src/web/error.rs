use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use askama::Template;
use domains::{DomainError, StoreError};
use services::PluginError;
use thiserror::Error;
use tracing::{error, warn};

use crate::pages::ErrorPage;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error("{0}")]
    BadRequest(String),

    #[error("template rendering failed: {0}")]
    Template(#[from] askama::Error),

    #[error("metrics encoding failed")]
    Metrics(#[from] std::fmt::Error),
}

fn store_status(e: &StoreError) -> StatusCode {
    if e.is_unavailable() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Domain(e) => match e {
                DomainError::Validation(_) => StatusCode::BAD_REQUEST,
                DomainError::UnknownBoard(_) | DomainError::NotFound(..) => StatusCode::NOT_FOUND,
                DomainError::Unauthorized(_) => StatusCode::FORBIDDEN,
                DomainError::Store(e) => store_status(e),
                DomainError::OrphanedLink { source, .. } => store_status(source),
            },
            ApiError::Plugin(e) => match e {
                PluginError::Rejected(_) => StatusCode::BAD_REQUEST,
                PluginError::Store(e) => store_status(e),
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Template(_) | ApiError::Metrics(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status.is_server_error() {
            error!(error = %self, status = status.as_u16(), "request failed");
            match status {
                StatusCode::SERVICE_UNAVAILABLE => "storage is temporarily unavailable".to_string(),
                _ => "internal error".to_string(),
            }
        } else {
            warn!(error = %self, status = status.as_u16(), "request rejected");
            self.to_string()
        };

        let reason = status.canonical_reason().unwrap_or("Error");
        match ErrorPage::new(status.as_u16(), reason, &message).render() {
            Ok(page) => (status, Html(page)).into_response(),
            Err(e) => {
                error!(error = %e, "error page rendering failed");
                (status, reason).into_response()
            }
        }
    }
}
