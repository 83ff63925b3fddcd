//! HTTP endpoint
//!
//! `GET` opens a stream and `POST` carries form-encoded control requests,
//! both on the same path.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Form, Router};
use futures_util::StreamExt;
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use crate::connection::{ConnectionManager, ManagerError};
use crate::protocol::{ControlRequest, ProtocolError};

/// Content type every streaming transport accepts
const STREAM_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

#[derive(Clone)]
struct AppState {
    manager: Arc<ConnectionManager>,
}

/// Build the router serving the stream and control requests at `path`
pub fn router(path: &str, manager: Arc<ConnectionManager>) -> Router {
    // XDomainRequest needs a wildcard origin on the streaming response
    let cors = CorsLayer::new().allow_origin(Any);

    Router::new()
        .route(path, get(open_stream).post(control))
        .layer(cors)
        .with_state(AppState { manager })
}

async fn open_stream(State(state): State<AppState>) -> Result<Response, ManagerError> {
    let opened = state.manager.open().await?;
    let body = Body::from_stream(opened.stream.into_stream().map(Ok::<_, Infallible>));
    Ok(([(header::CONTENT_TYPE, STREAM_CONTENT_TYPE)], body).into_response())
}

async fn control(
    State(state): State<AppState>,
    Form(fields): Form<Vec<(String, String)>>,
) -> Result<StatusCode, ManagerError> {
    state
        .manager
        .handle_request(ControlRequest::from_pairs(fields))
        .await?;
    Ok(StatusCode::OK)
}

impl IntoResponse for ManagerError {
    fn into_response(self) -> Response {
        let status = match &self {
            ManagerError::ShuttingDown | ManagerError::Pipeline(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ManagerError::Encoding(ProtocolError::MessageTooLarge { .. }) => {
                StatusCode::PAYLOAD_TOO_LARGE
            }
            ManagerError::Encoding(_) | ManagerError::Write(_) | ManagerError::Config(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            warn!("Request failed: {}", self);
        }
        (status, self.to_string()).into_response()
    }
}
