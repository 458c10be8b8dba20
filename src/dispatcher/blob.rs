//! Signed object access, shaped like presigned bucket urls: a missing
//! object and a bad signature both answer 403, and reads honour an
//! open-ended `Range: bytes=N-`.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Deserialize;

use super::DispatcherState;
use crate::store::signer::SignedMethod;
use crate::store::StoreError;

#[derive(Debug, Deserialize)]
pub struct SignedQuery {
    pub expires: i64,
    pub signature: String,
}

fn forbidden() -> Response {
    (StatusCode::FORBIDDEN, "access denied").into_response()
}

/// Start offset of a `bytes=N-` range. Anything else is ignored and the
/// whole object is served.
pub fn parse_range_start(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(header::RANGE)?.to_str().ok()?;
    let start = value.trim().strip_prefix("bytes=")?.strip_suffix('-')?;
    start.parse().ok()
}

pub async fn get_blob(
    State(state): State<DispatcherState>,
    Path(key): Path<String>,
    Query(query): Query<SignedQuery>,
    headers: HeaderMap,
) -> Response {
    if !state
        .signer
        .verify(SignedMethod::Get, &key, query.expires, &query.signature)
    {
        return forbidden();
    }

    match parse_range_start(&headers) {
        None => match state.store.get(&key).await {
            Ok(data) => (StatusCode::OK, data).into_response(),
            Err(e) => store_failure(&key, e),
        },
        Some(start) => match state.store.get_range(&key, start).await {
            Ok(data) => {
                let end = start + data.len() as u64 - 1;
                let total = start + data.len() as u64;
                (
                    StatusCode::PARTIAL_CONTENT,
                    [(header::CONTENT_RANGE, format!("bytes {}-{}/{}", start, end, total))],
                    data,
                )
                    .into_response()
            }
            Err(StoreError::InvalidRange { len, .. }) => (
                StatusCode::RANGE_NOT_SATISFIABLE,
                [(header::CONTENT_RANGE, format!("bytes */{}", len))],
            )
                .into_response(),
            Err(e) => store_failure(&key, e),
        },
    }
}

pub async fn put_blob(
    State(state): State<DispatcherState>,
    Path(key): Path<String>,
    Query(query): Query<SignedQuery>,
    body: Bytes,
) -> Response {
    if !state
        .signer
        .verify(SignedMethod::Put, &key, query.expires, &query.signature)
    {
        return forbidden();
    }
    match state.store.put(&key, body).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => store_failure(&key, e),
    }
}

fn store_failure(key: &str, e: StoreError) -> Response {
    match e {
        StoreError::NotFound(_) => forbidden(),
        StoreError::InvalidKey(_) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
        other => {
            tracing::error!(key, error = %other, "Blob store access failed");
            (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()).into_response()
        }
    }
}
