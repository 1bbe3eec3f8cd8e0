// logging/journal.rs — CSV journal of terminal command outcomes
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
};
use tracing::warn;

use crate::commands::tracker::Outcome;

pub const HEADER: &str = "ts,token,kind,code,outcome,latency_ms\n";

/// Opened lazily on the first record; the header is written only to a fresh file.
#[derive(Debug, Clone)]
pub struct Journal {
    path: PathBuf,
    file: Arc<OnceCell<Mutex<BufWriter<File>>>>,
}

impl Journal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Arc::new(OnceCell::new()),
        }
    }

    async fn file(&self) -> std::io::Result<&Mutex<BufWriter<File>>> {
        self.file
            .get_or_try_init(|| async {
                if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
                    fs::create_dir_all(dir).await?;
                }
                let fresh = !fs::try_exists(&self.path).await.unwrap_or(false);
                let f = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)
                    .await?;
                let mut writer = BufWriter::new(f);
                if fresh {
                    writer.write_all(HEADER.as_bytes()).await?;
                    writer.flush().await?;
                }
                Ok(Mutex::new(writer))
            })
            .await
    }

    pub async fn record(&self, outcome: &Outcome) {
        let line = format_line(Utc::now(), outcome);
        let file = match self.file().await {
            Ok(f) => f,
            Err(e) => {
                warn!(path = %self.path.display(), %e, "journal unavailable");
                return;
            }
        };
        let mut f = file.lock().await;
        if let Err(e) = f.write_all(line.as_bytes()).await {
            warn!(%e, "journal write failed");
            return;
        }
        let _ = f.flush().await;
    }
}

fn format_line(ts: DateTime<Utc>, o: &Outcome) -> String {
    let latency_ms = o.latency.as_secs_f64() * 1000.0;
    format!(
        "{},{},{},{},{},{latency_ms:.3}\n",
        ts.to_rfc3339(),
        o.token,
        o.kind,
        o.code,
        o.state.as_str()
    )
}
