//! Thin wrapper around a streaming HTTP GET that delivers its bytes straight
//! into a [`PartialFile`].

use std::{
    fmt,
    path::Path,
    pin::Pin,
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use log::{debug, error};
use reqwest::{header::RANGE, Response, StatusCode};
use thiserror::Error;
use tokio::time::timeout;
use tokio_stream::{Stream, StreamExt};

use crate::partial_file::{PartialFile, WriteError};
use crate::volume::{StorageError, Volume};

/// How long to wait for the next body chunk before calling the connection
/// dead.
const DATA_TIMEOUT: Duration = Duration::from_secs(30);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// The request to repeat on every (re)start of a transfer: URL plus whatever
/// headers the original submitter attached (auth tokens and the like).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DownloadRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Builder for [`DownloadClient`].
#[derive(Clone, Debug, Default)]
pub struct DownloadClientBuilder {
    ignore_tls_validation: bool,
}

impl DownloadClientBuilder {
    /// Disable TLS certificate validation for HTTPS connections.
    pub fn ignore_tls_validation(mut self, value: bool) -> Self {
        self.ignore_tls_validation = value;
        self
    }

    pub fn build(self) -> reqwest::Result<DownloadClient> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .danger_accept_invalid_certs(self.ignore_tls_validation)
            .build()?;

        Ok(DownloadClient { client })
    }
}

/// Shared, cheaply clonable HTTP client used by all transfers.
#[derive(Clone)]
pub struct DownloadClient {
    client: reqwest::Client,
}

impl DownloadClient {
    pub fn new() -> reqwest::Result<Self> {
        DownloadClientBuilder::default().build()
    }

    pub fn builder() -> DownloadClientBuilder {
        DownloadClientBuilder::default()
    }
}

/// Why a download could not start.
#[derive(Debug, Error)]
pub enum DownloadStartError {
    /// The server did not give us what we need (bad status, missing size,
    /// ignored range).
    #[error("server refused the request")]
    RefusedRequest,
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error(transparent)]
    Storage(StorageError),
}

/// Result of pumping one chunk through [`Download::step`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DownloadStep {
    Continue,
    /// The requested range is fully delivered. Whether the *file* is done is
    /// the download order's call, not ours.
    Finished,
    FailedNetwork,
    FailedOther,
}

type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

/// One live HTTP request feeding a partial file.
pub struct Download {
    stream: ByteStream,
    partial: Arc<PartialFile>,
    position: u64,
    /// Exclusive end of the range this request is expected to deliver.
    end: u64,
}

impl fmt::Debug for Download {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Download")
            .field("position", &self.position)
            .field("end", &self.end)
            .finish()
    }
}

impl Download {
    /// Start a fresh transfer: issue the request, learn the final size from
    /// the response, preallocate the partial file and stream into it.
    pub async fn begin(
        client: &DownloadClient,
        request: &DownloadRequest,
        volume: &dyn Volume,
        partial_path: &Path,
    ) -> Result<Download, DownloadStartError> {
        let response = Self::send(client, request, None, None).await?;

        let Some(total) = response.content_length() else {
            error!("Server did not provide a file size");
            return Err(DownloadStartError::RefusedRequest);
        };

        let partial = PartialFile::create(volume, partial_path, total)
            .map_err(DownloadStartError::Storage)?;

        Ok(Download {
            stream: Box::pin(response.bytes_stream()),
            partial,
            position: 0,
            end: total,
        })
    }

    /// Re-attach to an existing partial file, requesting bytes from
    /// `position` up to and including `end_range` (or to the end of the
    /// file).
    pub async fn resume(
        client: &DownloadClient,
        request: &DownloadRequest,
        partial: Arc<PartialFile>,
        position: u64,
        end_range: Option<u64>,
    ) -> Result<Download, DownloadStartError> {
        let response = Self::send(client, request, Some(position), end_range).await?;

        if position > 0 && response.status() != StatusCode::PARTIAL_CONTENT {
            // The server ignored the range; accepting a restart from zero
            // here would interleave two different offsets into the file.
            error!("Server ignored the range request (HTTP {})", response.status());
            return Err(DownloadStartError::RefusedRequest);
        }

        partial.seek(position).await;

        Ok(Download {
            stream: Box::pin(response.bytes_stream()),
            end: end_range.map_or(partial.final_size(), |e| e + 1),
            partial,
            position,
        })
    }

    async fn send(
        client: &DownloadClient,
        request: &DownloadRequest,
        position: Option<u64>,
        end_range: Option<u64>,
    ) -> Result<Response, DownloadStartError> {
        let mut builder = client.client.get(&request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(position) = position {
            let range = match end_range {
                Some(end) => format!("bytes={}-{}", position, end),
                None => format!("bytes={}-", position),
            };
            debug!("Requesting range {}", range);
            builder = builder.header(RANGE, range);
        }

        let response = builder.send().await?;

        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
            error!("Expected HTTP 200 or 206, but got HTTP {}", status);
            return Err(DownloadStartError::RefusedRequest);
        }

        Ok(response)
    }

    pub fn partial_file(&self) -> Arc<PartialFile> {
        Arc::clone(&self.partial)
    }

    pub fn file_size(&self) -> u64 {
        self.partial.final_size()
    }

    /// Pump one body chunk into the partial file.
    pub async fn step(&mut self) -> DownloadStep {
        if self.position >= self.end {
            return DownloadStep::Finished;
        }

        let chunk = match timeout(DATA_TIMEOUT, self.stream.next()).await {
            Err(_) => {
                error!("Timed out waiting for data");
                return DownloadStep::FailedNetwork;
            }
            Ok(None) => {
                debug!("Received unexpected EOF from server");
                return DownloadStep::FailedNetwork;
            }
            Ok(Some(Err(e))) => {
                error!("Download stream error: {}", e);
                return DownloadStep::FailedNetwork;
            }
            Ok(Some(Ok(chunk))) => chunk,
        };

        // a server ignoring our end of range can hand us more than we asked
        let take = ((self.end - self.position).min(chunk.len() as u64)) as usize;
        if let Err(e) = self.partial.write(&chunk[..take]).await {
            error!(
                "Failed to write {} bytes at offset {}: {}",
                take, self.position, e
            );
            return match e {
                // the write path can be reset and retried after these
                WriteError::Latched
                | WriteError::LockLost
                | WriteError::Submit
                | WriteError::PoolTimeout => DownloadStep::FailedNetwork,
                WriteError::PastEnd => DownloadStep::FailedOther,
            };
        }
        self.position += take as u64;

        // exhaustion of the range is only reported on the next call, so the
        // caller always gets a Continue to react to the data just written
        DownloadStep::Continue
    }
}
