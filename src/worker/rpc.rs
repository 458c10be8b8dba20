//! Named in-process procedures invocable as jobs.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::output::LineSink;

pub type RpcError = Box<dyn std::error::Error + Send + Sync>;
pub type RpcResult = std::result::Result<(), RpcError>;

/// What a procedure knows about the job it runs in.
#[derive(Debug, Clone)]
pub struct RpcContext {
    pub uid: String,
    pub auth_name: String,
    /// Cancelled when the job deadline passes.
    pub cancel: CancellationToken,
}

pub type RpcHandler =
    Arc<dyn Fn(RpcContext, LineSink, String) -> BoxFuture<'static, RpcResult> + Send + Sync>;

/// Immutable name-to-procedure table, built once at startup.
#[derive(Clone, Default)]
pub struct Registry {
    procedures: Arc<HashMap<String, RpcHandler>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("procedures", &self.names())
            .finish()
    }
}

#[derive(Default)]
pub struct RegistryBuilder {
    procedures: HashMap<String, RpcHandler>,
}

impl RegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, procedure: F) -> Self
    where
        F: Fn(RpcContext, LineSink, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RpcResult> + Send + 'static,
    {
        let handler: RpcHandler =
            Arc::new(move |ctx, out, args| Box::pin(procedure(ctx, out, args)));
        self.procedures.insert(name.into(), handler);
        self
    }

    pub fn build(self) -> Registry {
        Registry {
            procedures: Arc::new(self.procedures),
        }
    }
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Registry holding the procedures shipped with the server.
    pub fn builtin() -> Self {
        Self::builder().register("listdir", listdir).build()
    }

    pub fn get(&self, name: &str) -> Option<RpcHandler> {
        self.procedures.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.procedures.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.procedures.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[derive(Debug, Deserialize)]
struct ListdirArgs {
    path: String,
}

enum Entry {
    Dir(PathBuf),
    File(PathBuf),
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_string_lossy().starts_with('.')
}

/// Print every non-hidden file under `path`, depth first in lexical order.
/// Unreadable directories are skipped.
pub async fn listdir(ctx: RpcContext, out: LineSink, args: String) -> RpcResult {
    let args: ListdirArgs = serde_json::from_str(&args)?;
    let root = PathBuf::from(&args.path);
    let mut stack = match tokio::fs::symlink_metadata(&root).await {
        Ok(meta) if meta.is_dir() => vec![Entry::Dir(root)],
        Ok(_) => vec![Entry::File(root)],
        Err(e) => {
            tracing::debug!(path = %args.path, error = %e, "listdir root unreadable");
            Vec::new()
        }
    };

    while let Some(entry) = stack.pop() {
        if ctx.cancel.is_cancelled() {
            return Err("cancelled".into());
        }
        match entry {
            Entry::File(path) => out.emit(path.display().to_string()).await,
            Entry::Dir(dir) => {
                let Ok(mut reader) = tokio::fs::read_dir(&dir).await else {
                    continue;
                };
                let mut children = Vec::new();
                while let Ok(Some(child)) = reader.next_entry().await {
                    if is_hidden(&child.file_name()) {
                        continue;
                    }
                    let is_dir = child
                        .file_type()
                        .await
                        .map(|t| t.is_dir())
                        .unwrap_or(false);
                    children.push((child.file_name(), is_dir, child.path()));
                }
                children.sort_by(|a, b| a.0.cmp(&b.0));
                for (_, is_dir, path) in children.into_iter().rev() {
                    stack.push(if is_dir {
                        Entry::Dir(path)
                    } else {
                        Entry::File(path)
                    });
                }
            }
        }
    }
    Ok(())
}
