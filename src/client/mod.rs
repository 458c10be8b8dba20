//! Client driver for `/api/exec`.
//!
//! Submits a job, then (in pull mode) alternates between asking the server
//! where the log is and reading new bytes from there, until the server
//! answers with the exit code.

pub mod tail;

use std::time::Duration;

use reqwest::header::RANGE;
use reqwest::StatusCode;

use crate::config::ClientConfig;
use crate::dispatcher::AUTH_HEADER;
use crate::error::{ExecError, Result};
use crate::protocol::{GetResponse, PostRequest, PostResponse, PullKeys, PushUrls};
use crate::retry::retry;
use crate::store::{validate_key, UrlSigner};

pub use tail::{tail, TailOptions};

/// Signed PUT urls that make a push-mode job write its results into the
/// server's own store under `prefix`. The returned keys can be followed
/// with [`tail`] on the server host.
pub fn presigned_push(
    signer: &UrlSigner,
    prefix: &str,
    ttl: Duration,
) -> Result<(PushUrls, PullKeys)> {
    let prefix = prefix.trim_matches('/');
    let keys = PullKeys {
        log: format!("{}/log.txt", prefix),
        size: format!("{}/size", prefix),
        exit: format!("{}/exit", prefix),
    };
    for key in [&keys.log, &keys.size, &keys.exit] {
        validate_key(key)?;
    }
    let urls = PushUrls {
        log: signer.presign_put(&keys.log, ttl)?,
        size: signer.presign_put(&keys.size, ttl)?,
        exit: signer.presign_put(&keys.exit, ttl)?,
    };
    Ok((urls, keys))
}

/// One page of log fetched from a read url.
#[derive(Debug, PartialEq, Eq)]
enum Fetch {
    Data(bytes::Bytes),
    /// Nothing readable yet; poll again after a pause.
    NotReady,
}

#[derive(Debug, Clone)]
pub struct ExecClient {
    http: reqwest::Client,
    config: ClientConfig,
}

impl ExecClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/api/exec", self.config.url.trim_end_matches('/'))
    }

    /// Classify a non-success answer: 5xx may be retried, anything else is
    /// a definite rejection.
    async fn failure(response: reqwest::Response) -> ExecError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        if status >= 500 {
            ExecError::ServerError { status, body }
        } else {
            ExecError::Rejected { status, body }
        }
    }

    /// Submit a job and return its uid.
    pub async fn submit(&self, request: &PostRequest) -> Result<String> {
        let url = self.endpoint();
        let response: PostResponse = retry(&self.config.retry, || async {
            let response = self
                .http
                .post(&url)
                .header(AUTH_HEADER, &self.config.auth)
                .json(request)
                .send()
                .await?;
            if response.status() != StatusCode::OK {
                return Err(Self::failure(response).await);
            }
            Ok(response.json().await?)
        })
        .await?;
        tracing::info!(uid = %response.uid, "Job submitted");
        Ok(response.uid)
    }

    async fn poll(&self, uid: &str, range_start: u64) -> Result<Option<GetResponse>> {
        let url = self.endpoint();
        let range_start = range_start.to_string();
        retry(&self.config.retry, || async {
            let response = self
                .http
                .get(&url)
                .header(AUTH_HEADER, &self.config.auth)
                .query(&[("uid", uid), ("range-start", range_start.as_str())])
                .send()
                .await?;
            match response.status() {
                StatusCode::OK => Ok(Some(response.json().await?)),
                StatusCode::CONFLICT => Ok(None),
                _ => Err(Self::failure(response).await),
            }
        })
        .await
    }

    async fn fetch(&self, url: &str, range_start: u64) -> Result<Fetch> {
        retry(&self.config.retry, || async {
            let response = self
                .http
                .get(url)
                .header(RANGE, format!("bytes={}-", range_start))
                .send()
                .await?;
            match response.status() {
                StatusCode::OK | StatusCode::PARTIAL_CONTENT => Ok(Fetch::Data(response.bytes().await?)),
                StatusCode::FORBIDDEN | StatusCode::RANGE_NOT_SATISFIABLE => Ok(Fetch::NotReady),
                status => Err(ExecError::ServerError {
                    status: status.as_u16(),
                    body: response.text().await.unwrap_or_default(),
                }),
            }
        })
        .await
    }

    /// Submit and follow a job. Log bytes are handed to `sink` in order
    /// as they become visible.
    ///
    /// Returns `None` for push-mode jobs, which are not followed.
    pub async fn exec<F>(&self, request: &PostRequest, sink: F) -> Result<Option<i32>>
    where
        F: FnMut(&[u8]),
    {
        let uid = self.submit(request).await?;
        if request.push_urls.is_some() {
            return Ok(None);
        }
        self.follow(&uid, sink).await.map(Some)
    }

    /// Follow an already submitted pull-mode job until it exits.
    pub async fn follow<F>(&self, uid: &str, mut sink: F) -> Result<i32>
    where
        F: FnMut(&[u8]),
    {
        let mut range_start = 0u64;
        loop {
            let url = match self.poll(uid, range_start).await? {
                Some(GetResponse::Exit { exit }) => {
                    tracing::debug!(uid, exit, bytes = range_start, "Job finished");
                    return Ok(exit);
                }
                Some(GetResponse::Url { url }) => url,
                None => {
                    tokio::time::sleep(self.config.poll_interval).await;
                    continue;
                }
            };
            match self.fetch(&url, range_start).await? {
                Fetch::Data(data) if !data.is_empty() => {
                    sink(&data);
                    range_start += data.len() as u64;
                }
                _ => tokio::time::sleep(self.config.poll_interval).await,
            }
        }
    }
}
