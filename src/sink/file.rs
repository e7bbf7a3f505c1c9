use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::trace::TraceEvent;

#[derive(Debug, Deserialize)]
struct FileSinkOptions {
    path: PathBuf,
}

/// JSON-lines file sink: one serialized event per line, appended.
pub struct FileSink {
    path: PathBuf,
    file: Option<File>,
}

impl FileSink {
    pub fn from_options(options: &serde_json::Value) -> Result<Self> {
        let opts: FileSinkOptions =
            serde_json::from_value(options.clone()).context("parsing file sink options")?;

        if opts.path.as_os_str().is_empty() {
            bail!("file sink requires a non-empty path");
        }

        Ok(Self {
            path: opts.path,
            file: None,
        })
    }

    pub fn name(&self) -> &str {
        "file"
    }

    pub async fn open(&mut self) -> Result<()> {
        if self.file.is_some() {
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("creating sink directory {}", parent.display()))?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("opening sink file {}", self.path.display()))?;

        self.file = Some(file);
        Ok(())
    }

    pub async fn write_batch(&mut self, events: &[TraceEvent]) -> Result<()> {
        let file = match self.file.as_mut() {
            Some(f) => f,
            None => bail!("file sink not open"),
        };

        let mut buf = Vec::with_capacity(events.len() * 256);
        for event in events {
            serde_json::to_writer(&mut buf, event).context("serializing event")?;
            buf.push(b'\n');
        }

        file.write_all(&buf)
            .await
            .with_context(|| format!("writing batch to {}", self.path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing {}", self.path.display()))?;

        Ok(())
    }

    pub async fn close(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await.ok();
        }
        Ok(())
    }
}
