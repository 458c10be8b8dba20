//! Wire types for `/api/exec` and the destination slots a job publishes to.

use serde::{Deserialize, Serialize};

use crate::error::{ExecError, Result};
use crate::event::JobSpec;

/// Caller-supplied write URLs. Log is pushed repeatedly with the whole log;
/// exit and then size are pushed once each at the end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushUrls {
    pub log: String,
    pub size: String,
    pub exit: String,
}

impl PushUrls {
    pub fn validate(&self) -> Result<()> {
        for (slot, url) in [("log", &self.log), ("size", &self.size), ("exit", &self.exit)] {
            let parsed = reqwest::Url::parse(url).map_err(|e| {
                ExecError::InvalidRequest(format!("push-urls.{} is not a url: {}", slot, e))
            })?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(ExecError::InvalidRequest(format!(
                    "push-urls.{} must be http or https",
                    slot
                )));
            }
        }
        Ok(())
    }
}

/// Store keys a pull-mode job publishes to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullKeys {
    pub log: String,
    pub size: String,
    pub exit: String,
}

impl PullKeys {
    pub fn for_job(auth_name: &str, uid: &str) -> Self {
        let prefix = format!("jobs/{}/{}", auth_name, uid);
        Self {
            log: format!("{}/log.txt", prefix),
            size: format!("{}/size", prefix),
            exit: format!("{}/exit", prefix),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostRequest {
    #[serde(rename = "push-urls", default, skip_serializing_if = "Option::is_none")]
    pub push_urls: Option<PushUrls>,

    /// Subprocess to run. Slower than an rpc.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub argv: Vec<String>,

    /// Registered procedure to run, with its JSON arguments.
    #[serde(rename = "rpc-name", default, skip_serializing_if = "String::is_empty")]
    pub rpc_name: String,
    #[serde(rename = "rpc-args", default, skip_serializing_if = "String::is_empty")]
    pub rpc_args: String,
}

impl PostRequest {
    pub fn subprocess(argv: Vec<String>) -> Self {
        Self {
            argv,
            ..Default::default()
        }
    }

    pub fn rpc(name: impl Into<String>, args: impl Into<String>) -> Self {
        Self {
            rpc_name: name.into(),
            rpc_args: args.into(),
            ..Default::default()
        }
    }

    pub fn with_push_urls(mut self, urls: PushUrls) -> Self {
        self.push_urls = Some(urls);
        self
    }

    /// Validate the body and pick the invocation mode.
    pub fn job_spec(&self) -> Result<JobSpec> {
        if let Some(urls) = &self.push_urls {
            urls.validate()?;
        }
        match (self.rpc_name.is_empty(), self.argv.is_empty()) {
            (false, true) => Ok(JobSpec::Rpc {
                name: self.rpc_name.clone(),
                args: self.rpc_args.clone(),
            }),
            (true, false) => {
                if self.argv[0].is_empty() {
                    return Err(ExecError::InvalidRequest("argv[0] is empty".to_string()));
                }
                Ok(JobSpec::Subprocess {
                    argv: self.argv.clone(),
                })
            }
            (false, false) => Err(ExecError::InvalidRequest(
                "provide either argv or rpc-name, not both".to_string(),
            )),
            (true, true) => Err(ExecError::InvalidRequest(
                "provide argv or rpc-name".to_string(),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostResponse {
    pub uid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetQuery {
    pub uid: String,
    #[serde(rename = "range-start", default)]
    pub range_start: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GetResponse {
    Exit { exit: i32 },
    Url { url: String },
}
