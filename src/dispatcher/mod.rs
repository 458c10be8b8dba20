//! HTTP front door: `/api/exec` submission and polling, plus the signed
//! `/blob/{*key}` routes that stand in for direct object-store urls.
//!
//! Every request runs in its own task behind a panic boundary. `/api/`
//! requests are authenticated first; an unknown path or method answers 404
//! only after authentication succeeded.

pub mod blob;

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Bytes,
    extract::{Query, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Extension, Json, Router,
};
use tower_http::cors::{Any, CorsLayer};

use crate::activity::ActivityLog;
use crate::auth::AuthResolver;
use crate::error::ExecError;
use crate::event::{is_valid_uid, mint_uid, AsyncEvent, Event, JobSpec};
use crate::protocol::{GetQuery, GetResponse, PostRequest, PostResponse, PullKeys};
use crate::store::{ObjectStore, StoreError, UrlSigner};
use crate::worker::panic::catch_panic;
use crate::worker::{InvokeAck, Invoker, Registry};

pub const AUTH_HEADER: &str = "auth";
pub const AUTH_NAME_HEADER: &str = "auth-name";
pub const UID_HEADER: &str = "uid";

#[derive(Clone)]
pub struct DispatcherState {
    pub auth: Arc<dyn AuthResolver>,
    pub store: Arc<dyn ObjectStore>,
    pub invoker: Arc<dyn Invoker>,
    pub registry: Registry,
    pub signer: UrlSigner,
    pub activity: ActivityLog,
    pub unauthorized_delay: Duration,
    pub read_url_ttl: Duration,
}

/// Principal resolved by [`authenticate`].
#[derive(Debug, Clone)]
pub struct Principal(pub String);

pub fn router(state: DispatcherState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::POST, Method::GET, Method::PUT, Method::OPTIONS])
        .allow_headers([
            HeaderName::from_static(AUTH_HEADER),
            header::CONTENT_TYPE,
            header::RANGE,
        ])
        .expose_headers([
            HeaderName::from_static(AUTH_NAME_HEADER),
            HeaderName::from_static(UID_HEADER),
        ]);

    Router::new()
        .route(
            "/api/exec",
            get(exec_get).post(exec_post).fallback(not_found),
        )
        .route("/blob/{*key}", get(blob::get_blob).put(blob::put_blob))
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(state.clone(), authenticate))
        .layer(middleware::from_fn(contain_panics))
        .layer(middleware::from_fn_with_state(state.clone(), access_log))
        .layer(cors)
        .with_state(state)
}

/// Gate for `/api/` paths. OPTIONS is answered without credentials; a
/// rejected credential is answered only after `unauthorized_delay`.
async fn authenticate(
    State(state): State<DispatcherState>,
    mut req: Request,
    next: Next,
) -> Response {
    if !req.uri().path().starts_with("/api/") {
        return next.run(req).await;
    }
    if req.method() == Method::OPTIONS {
        return StatusCode::OK.into_response();
    }

    let secret = req
        .headers()
        .get(AUTH_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    match state.auth.resolve(&secret).await {
        Some(name) => {
            req.extensions_mut().insert(Principal(name));
            next.run(req).await
        }
        None => {
            tokio::time::sleep(state.unauthorized_delay).await;
            ExecError::Unauthorized.into_response()
        }
    }
}

/// Run the rest of the stack in its own task; a panic becomes a 500 whose
/// body is the panic message followed by the backtrace.
async fn contain_panics(req: Request, next: Next) -> Response {
    let (tx, rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let response = match catch_panic(next.run(req)).await {
            Ok(response) => response,
            Err(panic) => {
                tracing::error!(message = %panic.message, backtrace = %panic.backtrace, "Request handler panicked");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("{}\n{}", panic.message, panic.backtrace),
                )
                    .into_response()
            }
        };
        let _ = tx.send(response);
    });
    rx.await.unwrap_or_else(|_| {
        (StatusCode::INTERNAL_SERVER_ERROR, "request task dropped").into_response()
    })
}

fn header_text(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string()
}

async fn access_log(State(state): State<DispatcherState>, req: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = next.run(req).await;

    let (status, auth_name, uid) = {
        let headers = response.headers();
        (
            response.status().as_u16(),
            header_text(headers, AUTH_NAME_HEADER),
            header_text(headers, UID_HEADER),
        )
    };
    let elapsed_ms = started.elapsed().as_millis() as u64;
    tracing::info!(method = %method, path = %path, status, auth_name = %auth_name, uid = %uid, elapsed_ms, "Request");
    if path.starts_with("/api/") {
        state
            .activity
            .record(format!(
                "{} {} {} {} {} {}ms",
                method, path, status, auth_name, uid, elapsed_ms
            ))
            .await;
    }
    response
}

impl IntoResponse for ExecError {
    fn into_response(self) -> Response {
        let status = match &self {
            ExecError::Unauthorized => StatusCode::UNAUTHORIZED,
            ExecError::InvalidRequest(_) | ExecError::Json(_) => StatusCode::BAD_REQUEST,
            ExecError::RpcNotFound(_) => StatusCode::NOT_FOUND,
            ExecError::Dispatch(_) => StatusCode::SERVICE_UNAVAILABLE,
            ExecError::Store(StoreError::InvalidKey(_)) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self, "Request failed");
        }
        let body = match status {
            StatusCode::UNAUTHORIZED => "unauthorized".to_string(),
            _ => self.to_string(),
        };
        (status, body).into_response()
    }
}

async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "not found").into_response()
}

fn identity_headers(auth_name: &str, uid: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in [(AUTH_NAME_HEADER, auth_name), (UID_HEADER, uid)] {
        if let Ok(value) = HeaderValue::from_str(value) {
            headers.insert(HeaderName::from_static(name), value);
        }
    }
    headers
}

/// `POST /api/exec`: validate, mint a uid, hand the job off.
async fn exec_post(
    State(state): State<DispatcherState>,
    Extension(Principal(auth_name)): Extension<Principal>,
    body: Bytes,
) -> Result<Response, ExecError> {
    let request: PostRequest = serde_json::from_slice(&body)
        .map_err(|e| ExecError::InvalidRequest(format!("malformed body: {}", e)))?;
    let job = request.job_spec()?;
    if let JobSpec::Rpc { name, .. } = &job {
        if !state.registry.contains(name) {
            return Err(ExecError::RpcNotFound(name.clone()));
        }
    }

    let uid = mint_uid();
    let event = Event::Exec(AsyncEvent {
        auth_name: auth_name.clone(),
        uid: uid.clone(),
        push_urls: request.push_urls,
        job,
    });

    match state.invoker.invoke(&event).await? {
        InvokeAck::Accepted => {}
        ack => {
            tracing::warn!(uid = %uid, status = ack.status_code(), "Invocation not accepted");
            return Err(ExecError::Dispatch(format!(
                "invocation answered {}",
                ack.status_code()
            )));
        }
    }

    tracing::info!(uid = %uid, auth_name = %auth_name, "Job accepted");
    Ok((
        identity_headers(&auth_name, &uid),
        Json(PostResponse { uid }),
    )
        .into_response())
}

async fn read_counter<T: std::str::FromStr>(
    store: &dyn ObjectStore,
    key: &str,
) -> Result<Option<T>, ExecError> {
    let data = match store.get(key).await {
        Ok(data) => data,
        Err(StoreError::NotFound(_)) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let text = std::str::from_utf8(&data)
        .map_err(|_| ExecError::Internal(format!("{} is not utf-8", key)))?;
    text.trim()
        .parse()
        .map(Some)
        .map_err(|_| ExecError::Internal(format!("{} holds {:?}", key, text)))
}

/// `GET /api/exec`: the exit code once the reader has everything, else a
/// short-lived read url for the log.
async fn exec_get(
    State(state): State<DispatcherState>,
    Extension(Principal(auth_name)): Extension<Principal>,
    Query(query): Query<GetQuery>,
) -> Result<Response, ExecError> {
    if !is_valid_uid(&query.uid) {
        return Err(ExecError::InvalidRequest(format!(
            "invalid uid: {}",
            query.uid
        )));
    }
    let keys = PullKeys::for_job(&auth_name, &query.uid);
    let headers = identity_headers(&auth_name, &query.uid);

    if let Some(size) = read_counter::<u64>(state.store.as_ref(), &keys.size).await? {
        if query.range_start > size {
            return Err(ExecError::InvalidRequest(format!(
                "range-start {} past log size {}",
                query.range_start, size
            )));
        }
        if query.range_start == size {
            let exit = read_counter::<i32>(state.store.as_ref(), &keys.exit)
                .await?
                .ok_or_else(|| ExecError::Internal(format!("{} missing", keys.exit)))?;
            return Ok((headers, Json(GetResponse::Exit { exit })).into_response());
        }
    }

    let url = state.signer.presign_get(&keys.log, state.read_url_ttl)?;
    Ok((headers, Json(GetResponse::Url { url })).into_response())
}
