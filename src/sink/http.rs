use std::collections::HashMap;
use std::io::Write;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::trace::TraceEvent;

#[derive(Debug, Deserialize)]
struct HttpSinkOptions {
    address: String,

    #[serde(default)]
    headers: HashMap<String, String>,

    /// Compression algorithm: "none" or "gzip". Default: gzip.
    #[serde(default = "default_compression")]
    compression: String,

    /// Request timeout in seconds. Default: 30.
    #[serde(default = "default_timeout_secs")]
    timeout_secs: u64,
}

fn default_compression() -> String {
    "gzip".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Default, Deserialize)]
struct HttpCredentials {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

/// HTTP NDJSON sink: serializes each batch as newline-delimited JSON,
/// optionally gzip-compressed, and POSTs it to the configured address.
pub struct HttpSink {
    opts: HttpSinkOptions,
    credentials: HttpCredentials,
    client: Option<reqwest::Client>,
}

impl HttpSink {
    pub fn from_options(options: &serde_json::Value, credentials: &str) -> Result<Self> {
        let opts: HttpSinkOptions =
            serde_json::from_value(options.clone()).context("parsing http sink options")?;

        if opts.address.is_empty() {
            bail!("http sink requires a non-empty address");
        }

        match opts.compression.as_str() {
            "none" | "gzip" => {}
            other => bail!("unsupported http sink compression: {other}"),
        }

        let credentials: HttpCredentials = if credentials.is_empty() {
            HttpCredentials::default()
        } else {
            serde_json::from_str(credentials).context("parsing http sink credentials")?
        };

        Ok(Self {
            opts,
            credentials,
            client: None,
        })
    }

    pub fn name(&self) -> &str {
        "http"
    }

    pub async fn open(&mut self) -> Result<()> {
        if self.client.is_some() {
            return Ok(());
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.opts.timeout_secs))
            .build()
            .context("building HTTP client")?;

        self.client = Some(client);
        Ok(())
    }

    pub async fn write_batch(&mut self, events: &[TraceEvent]) -> Result<()> {
        let client = match self.client.as_ref() {
            Some(c) => c,
            None => bail!("http sink not open"),
        };

        if events.is_empty() {
            return Ok(());
        }

        let mut buf = Vec::with_capacity(events.len() * 256);
        for event in events {
            serde_json::to_writer(&mut buf, event).context("serializing event to JSON")?;
            buf.push(b'\n');
        }

        let body = match self.opts.compression.as_str() {
            "gzip" => compress_gzip(&buf)?,
            _ => buf,
        };

        let mut request = client
            .post(&self.opts.address)
            .header("Content-Type", "application/x-ndjson")
            .body(body);

        if self.opts.compression == "gzip" {
            request = request.header("Content-Encoding", "gzip");
        }

        for (k, v) in &self.opts.headers {
            request = request.header(k.as_str(), v.as_str());
        }

        if !self.credentials.username.is_empty() {
            request = request.basic_auth(
                &self.credentials.username,
                Some(&self.credentials.password),
            );
        }

        let resp = request.send().await.context("sending batch")?;

        let status = resp.status();
        // Drain body for connection reuse.
        let _ = resp.bytes().await;

        if !status.is_success() {
            bail!("unexpected status {status} from {}", self.opts.address);
        }

        tracing::debug!(events = events.len(), "batch exported via HTTP");
        Ok(())
    }

    pub async fn close(&mut self) -> Result<()> {
        self.client.take();
        Ok(())
    }
}

fn compress_gzip(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).context("gzip write")?;
    encoder.finish().context("gzip finish")
}
