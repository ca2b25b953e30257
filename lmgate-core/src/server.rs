//! HTTP surface: OpenAI-style routes in front of one [`ChatProvider`].

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use futures::StreamExt;
use http::{header, HeaderValue, StatusCode};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, error, field, info, info_span, warn, Instrument};

use crate::config::RelayCfg;
use crate::error::{CoreResult, GatewayError};
use crate::http_client::RequestCtx;
use crate::model::{ChatCompletionBody, CompletionRequest, RequestDefaults};
use crate::provider::ChatProvider;
use crate::relay::{relay, RelaySession};

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Shared, read-only state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub provider: Arc<dyn ChatProvider>,
    pub defaults: RequestDefaults,
    pub relay: RelayCfg,
}

impl AppState {
    pub fn new(provider: Arc<dyn ChatProvider>, defaults: RequestDefaults, relay: RelayCfg) -> Self {
        Self {
            provider,
            defaults,
            relay,
        }
    }
}

fn status_for(err: &GatewayError) -> StatusCode {
    match err {
        GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
        GatewayError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
        GatewayError::UpstreamUnreachable { .. }
        | GatewayError::UpstreamProtocolError { .. }
        | GatewayError::UpstreamRejected { .. }
        | GatewayError::MalformedUpstreamResponse { .. } => StatusCode::BAD_GATEWAY,
        GatewayError::Io(_) | GatewayError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_body(err: &GatewayError) -> Json<serde_json::Value> {
    Json(json!({
        "error": {
            "message": err.to_string(),
            "type": err.kind(),
            "code": null,
        }
    }))
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        (status_for(&self), error_body(&self)).into_response()
    }
}

/// Build the router. Every API route is also served under `/v1`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/models", get(list_models))
        .route("/chat/completions", post(chat_completions))
        .route("/v1/health", get(health))
        .route("/v1/models", get(list_models))
        .route("/v1/chat/completions", post(chat_completions))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve on a pre-bound listener until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> CoreResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    info!(%addr, backend = state.provider.name(), "gateway listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("gateway shut down");
    Ok(())
}

async fn root(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "message": format!("{} chat completion gateway is running", state.provider.name())
    }))
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.provider.health().await;
    if !report.is_healthy() {
        warn!(error = report.error.as_deref().unwrap_or(""), "backend unhealthy");
    }
    Json(report)
}

async fn list_models(State(state): State<AppState>) -> Response {
    match state.provider.list_models().await {
        Ok(models) => Json(models).into_response(),
        Err(e) => {
            error!(error = %e, "failed to list models");
            (StatusCode::SERVICE_UNAVAILABLE, error_body(&e)).into_response()
        }
    }
}

async fn chat_completions(State(state): State<AppState>, body: Bytes) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    let span = info_span!(
        "chat_completion",
        request_id = %request_id,
        model = field::Empty,
        stream = field::Empty,
    );
    let mut resp = handle_chat(state, body, &request_id).instrument(span).await;
    if let Ok(v) = HeaderValue::from_str(&request_id) {
        resp.headers_mut().insert(REQUEST_ID_HEADER, v);
    }
    resp
}

async fn handle_chat(state: AppState, body: Bytes, request_id: &str) -> Response {
    let parsed: ChatCompletionBody = match serde_json::from_slice(&body) {
        Ok(b) => b,
        Err(e) => {
            warn!(error = %e, "rejecting unparsable request body");
            return GatewayError::Validation(format!("invalid request body: {e}")).into_response();
        }
    };
    let req = match CompletionRequest::resolve(parsed, &state.defaults) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "rejecting invalid request");
            return e.into_response();
        }
    };

    let span = tracing::Span::current();
    span.record("model", req.model.as_str());
    span.record("stream", req.stream);
    info!(
        messages = req.messages.len(),
        last = req.last_message_content(),
        "chat completion received"
    );

    let ctx = RequestCtx::with_request_id(request_id);
    if req.stream {
        stream_response(&state, &req, &ctx).await
    } else {
        match state.provider.chat(&req, &ctx).await {
            Ok(result) => {
                debug!(id = %result.id, "completion returned");
                Json(result).into_response()
            }
            Err(e) => {
                error!(error = %e, kind = e.kind(), "completion failed");
                e.into_response()
            }
        }
    }
}

async fn stream_response(
    state: &AppState,
    req: &CompletionRequest,
    ctx: &RequestCtx<'_>,
) -> Response {
    let upstream = match state.provider.chat_stream(req, ctx).await {
        Ok(s) => s,
        Err(e) => {
            // Nothing has been sent yet, so a plain error response still works.
            error!(error = %e, kind = e.kind(), "failed to open upstream stream");
            return e.into_response();
        }
    };
    let session = RelaySession::new(
        ctx.request_id.unwrap_or_default(),
        state.provider.name(),
        &req.model,
    );
    let frames = relay(upstream, session, &state.relay).map(Ok::<_, Infallible>);

    let mut resp = Response::new(Body::from_stream(frames));
    let headers = resp.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    resp
}
