use std::io;
use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;

pub fn truncation_marker(cap: u64) -> String {
    format!("[log truncated: output exceeded {} bytes]", cap)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Written,
    /// This append crossed the cap; the marker has been written.
    Truncated,
    /// The file was already truncated; the line was discarded.
    Dropped,
}

struct SpillState {
    writer: BufWriter<File>,
    /// Output bytes written, excluding the marker.
    written: u64,
    ends_with_newline: bool,
    truncated: bool,
}

/// Append-only local copy of a job's log, bounded by a byte cap.
///
/// The file always holds a prefix of the shipped log, so any stat'd length
/// can be read back and uploaded while appends continue.
pub struct SpillFile {
    path: PathBuf,
    cap: u64,
    state: Mutex<SpillState>,
}

impl std::fmt::Debug for SpillFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpillFile")
            .field("path", &self.path)
            .field("cap", &self.cap)
            .finish()
    }
}

impl SpillFile {
    pub async fn create(dir: &Path, cap: u64) -> io::Result<Self> {
        let path = dir.join("log.txt");
        let file = File::create(&path).await?;
        Ok(Self {
            path,
            cap,
            state: Mutex::new(SpillState {
                writer: BufWriter::new(file),
                written: 0,
                ends_with_newline: true,
                truncated: false,
            }),
        })
    }

    /// Append one line plus its terminator, honouring the cap.
    pub async fn append(&self, line: &str) -> io::Result<AppendOutcome> {
        let mut state = self.state.lock().await;
        if state.truncated {
            return Ok(AppendOutcome::Dropped);
        }

        let mut bytes = Vec::with_capacity(line.len() + 1);
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(b'\n');

        let remaining = self.cap.saturating_sub(state.written);
        if (bytes.len() as u64) <= remaining {
            state.writer.write_all(&bytes).await?;
            state.written += bytes.len() as u64;
            state.ends_with_newline = true;
            return Ok(AppendOutcome::Written);
        }

        let keep = remaining as usize;
        if keep > 0 {
            state.writer.write_all(&bytes[..keep]).await?;
            state.written += remaining;
            state.ends_with_newline = bytes[keep - 1] == b'\n';
        }
        let mut marker = String::new();
        if !state.ends_with_newline {
            marker.push('\n');
        }
        marker.push_str(&truncation_marker(self.cap));
        marker.push('\n');
        state.writer.write_all(marker.as_bytes()).await?;
        state.truncated = true;
        tracing::warn!(cap = self.cap, "Log exceeded cap, truncating");
        Ok(AppendOutcome::Truncated)
    }

    /// Flush buffered appends and return the durable length.
    pub async fn snapshot(&self) -> io::Result<u64> {
        let mut state = self.state.lock().await;
        state.writer.flush().await?;
        state.writer.get_ref().sync_data().await?;
        Ok(state.writer.get_ref().metadata().await?.len())
    }

    /// Read the first `len` bytes. Appends may continue concurrently.
    pub async fn read_prefix(&self, len: u64) -> io::Result<Vec<u8>> {
        let file = File::open(&self.path).await?;
        let mut buf = Vec::with_capacity(len as usize);
        file.take(len).read_to_end(&mut buf).await?;
        if (buf.len() as u64) < len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("spill file shorter than {} bytes", len),
            ));
        }
        Ok(buf)
    }

    pub async fn is_truncated(&self) -> bool {
        self.state.lock().await.truncated
    }
}
