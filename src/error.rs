use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// The error kinds the tile pipeline can raise. `NotFound` is deliberately
/// absent: a legitimate "no such tile" is `Ok(None)`, never an `Err`.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Invalid static configuration; fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// A source's backend was unreachable or malformed at init.
    #[error("backend init error for source '{backend}': {reason}")]
    BackendInit { backend: String, reason: String },

    /// Transient backend failure during `get_tile` or a compositor fetch.
    #[error("backend error: {0}")]
    Backend(String),

    /// Bad client-supplied parameters.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Corrupt image/TIFF bytes encountered while decoding or encoding.
    #[error("format error: {0}")]
    Format(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ServerError>;

impl ServerError {
    fn status(&self) -> StatusCode {
        match self {
            ServerError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServerError::BackendInit { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ServerError::Backend(_) => StatusCode::BAD_GATEWAY,
            ServerError::Protocol(_) => StatusCode::BAD_REQUEST,
            ServerError::Format(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServerError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// An OGC `ServiceExceptionReport` body; WMS errors are always `200 OK`
    /// with this as the payload, never a 4xx/5xx status.
    pub fn as_ogc_exception(&self) -> String {
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
             <ServiceExceptionReport version=\"1.3.0\" xmlns=\"http://www.opengis.net/ogc\">\n  \
             <ServiceException>{}</ServiceException>\n\
             </ServiceExceptionReport>",
            xml_escape(&self.to_string())
        )
    }
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}
