use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use bytesize::ByteSize;
use percent_encoding::percent_decode_str;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use url::Url;

use super::{Clock, SystemClock};
use crate::auth::Credentials;
use crate::constants::{CHUNK_SIZE, DEFAULT_TIME_BUDGET};
use crate::document::DocumentKey;
use crate::error::{Error, Result};
use crate::http::{BatchExecutor, HttpRequest, HttpResponse};
use crate::source::{drive_media_url, essence, fetch_drive_meta};
use crate::store::CheckpointStore;
use crate::telemetry::RunMonitor;
use crate::types::UploadedFile;
use crate::utils::sha256_hex;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransferSource {
    Drive { file_id: String },
    Url { url: String },
}

impl TransferSource {
    fn descriptor(&self) -> String {
        match self {
            TransferSource::Drive { file_id } => format!("drive:{file_id}"),
            TransferSource::Url { url } => format!("url:{url}"),
        }
    }

    fn download_url(&self) -> String {
        match self {
            TransferSource::Drive { file_id } => drive_media_url(file_id),
            TransferSource::Url { url } => url.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub source: TransferSource,
    pub display_name: Option<DocumentKey>,
    pub transfer_id: Option<String>,
}

impl TransferRequest {
    pub fn drive(file_id: impl Into<String>) -> Self {
        Self::new(TransferSource::Drive {
            file_id: file_id.into(),
        })
    }

    pub fn url(url: impl Into<String>) -> Self {
        Self::new(TransferSource::Url { url: url.into() })
    }

    pub fn new(source: TransferSource) -> Self {
        Self {
            source,
            display_name: None,
            transfer_id: None,
        }
    }

    pub fn with_display_name(mut self, key: DocumentKey) -> Self {
        self.display_name = Some(key);
        self
    }

    pub fn with_transfer_id(mut self, id: impl Into<String>) -> Self {
        self.transfer_id = Some(id.into());
        self
    }

    /// Explicit id, or a digest of the source so the same source always maps to one slot.
    pub fn transfer_id(&self) -> String {
        self.transfer_id
            .clone()
            .unwrap_or_else(|| sha256_hex(self.source.descriptor().as_bytes()))
    }
}

/// Half-open byte range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRange {
    pub start: u64,
    pub end: u64,
}

impl ChunkRange {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }

    /// Inclusive form used by `Range` and `Content-Range` headers.
    pub fn http_span(&self) -> String {
        format!("{}-{}", self.start, self.end - 1)
    }
}

pub fn plan_chunks(size: u64, chunk_size: u64) -> Vec<ChunkRange> {
    if size == 0 || chunk_size == 0 {
        return Vec::new();
    }
    (0..size.div_ceil(chunk_size))
        .map(|idx| {
            let start = idx * chunk_size;
            ChunkRange {
                start,
                end: (start + chunk_size).min(size),
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadCheckpoint {
    pub transfer_id: String,
    pub source: TransferSource,
    pub display_name: String,
    pub mime_type: String,
    pub size: u64,
    pub chunks: Vec<ChunkRange>,
    pub next_chunk: usize,
    pub session_location: String,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UploadOutcome {
    Complete(UploadedFile),
    /// The time budget ran out. Calling `resume` with `transfer_id` continues the transfer.
    Partial {
        transfer_id: String,
        next_chunk: usize,
        total_chunks: usize,
    },
}

struct SourceProbe {
    size: u64,
    mime_type: String,
    file_name: String,
}

pub struct ResumableUploader {
    executor: Arc<dyn BatchExecutor>,
    credentials: Credentials,
    store: Arc<dyn CheckpointStore>,
    clock: Arc<dyn Clock>,
    upload_url: String,
    chunk_size: u64,
    time_budget: Duration,
    monitor: Option<RunMonitor>,
}

impl ResumableUploader {
    pub fn new(
        executor: Arc<dyn BatchExecutor>,
        credentials: Credentials,
        store: Arc<dyn CheckpointStore>,
        upload_url: &str,
    ) -> Result<Self> {
        let parsed = Url::parse(upload_url)
            .map_err(|err| Error::InvalidInput(format!("upload url {upload_url}: {err}")))?;
        let resumable = parsed
            .query_pairs()
            .any(|(key, value)| key == "uploadType" && value == "resumable");
        if !resumable {
            return Err(Error::InvalidInput(format!(
                "upload url {upload_url} is not configured for resumable uploads; add uploadType=resumable"
            )));
        }
        Ok(Self {
            executor,
            credentials,
            store,
            clock: Arc::new(SystemClock),
            upload_url: upload_url.to_string(),
            chunk_size: CHUNK_SIZE,
            time_budget: DEFAULT_TIME_BUDGET,
            monitor: None,
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_time_budget(mut self, budget: Duration) -> Self {
        self.time_budget = budget;
        self
    }

    pub fn with_monitor(mut self, monitor: RunMonitor) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// A checkpoint recorded for a different source under the same id is never overwritten:
    /// the call fails with `CheckpointConflict` until the stale transfer is resumed or
    /// abandoned.
    pub fn start(&self, request: &TransferRequest) -> Result<UploadOutcome> {
        let invoked = self.clock.now();
        let transfer_id = request.transfer_id();
        match self.checkpoint(&transfer_id)? {
            Some(checkpoint) if checkpoint.source != request.source => {
                Err(Error::CheckpointConflict { transfer_id })
            }
            Some(checkpoint) => {
                info!(
                    "resuming transfer {} at chunk {}/{}",
                    transfer_id,
                    checkpoint.next_chunk + 1,
                    checkpoint.chunks.len()
                );
                self.transfer(checkpoint, invoked)
            }
            None => {
                let checkpoint = self.open_session(&transfer_id, request)?;
                self.transfer(checkpoint, invoked)
            }
        }
    }

    pub fn resume(&self, transfer_id: &str) -> Result<UploadOutcome> {
        let invoked = self.clock.now();
        let checkpoint = self.checkpoint(transfer_id)?.ok_or_else(|| {
            Error::InvalidInput(format!("no checkpoint recorded for transfer {transfer_id}"))
        })?;
        self.transfer(checkpoint, invoked)
    }

    pub fn checkpoint(&self, transfer_id: &str) -> Result<Option<UploadCheckpoint>> {
        match self.store.get(&checkpoint_key(transfer_id))? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Forgets a transfer. The remote session is left to expire on its own.
    pub fn abandon(&self, transfer_id: &str) -> Result<()> {
        self.store.delete(&checkpoint_key(transfer_id))
    }

    fn save(&self, checkpoint: &UploadCheckpoint) -> Result<()> {
        self.store.set(
            &checkpoint_key(&checkpoint.transfer_id),
            &serde_json::to_value(checkpoint)?,
        )
    }

    fn open_session(&self, transfer_id: &str, request: &TransferRequest) -> Result<UploadCheckpoint> {
        let started_at = OffsetDateTime::now_utc();
        debug!("probing source {}", request.source.descriptor());
        let probe = self.probe(&request.source, started_at)?;
        let chunks = plan_chunks(probe.size, self.chunk_size);
        if chunks.is_empty() {
            return Err(Error::UnsupportedSource(format!(
                "{} is empty",
                request.source.descriptor()
            )));
        }
        info!(
            "transfer {}: {} in {} chunk(s)",
            transfer_id,
            ByteSize(probe.size),
            chunks.len()
        );

        let display_name = request
            .display_name
            .clone()
            .unwrap_or_else(|| default_display_name(&request.source, &probe.file_name))
            .display_name();
        let metadata = json!({ "file": { "displayName": display_name } });
        let init = HttpRequest::post(&self.upload_url)
            .header("X-Upload-Content-Type", probe.mime_type.as_str())
            .header("X-Upload-Content-Length", probe.size.to_string())
            .json(&metadata)?;
        let resp = self
            .executor
            .send(self.credentials.authorize(init)?)?
            .ensure_ok()?;
        let session_location = resp
            .header("location")
            .or_else(|| resp.header("x-goog-upload-url"))
            .ok_or_else(|| Error::Protocol("upload session response has no Location header".into()))?
            .to_string();

        let checkpoint = UploadCheckpoint {
            transfer_id: transfer_id.to_string(),
            source: request.source.clone(),
            display_name,
            mime_type: probe.mime_type,
            size: probe.size,
            chunks,
            next_chunk: 0,
            session_location,
            started_at,
        };
        self.save(&checkpoint)?;
        Ok(checkpoint)
    }

    fn probe(&self, source: &TransferSource, started_at: OffsetDateTime) -> Result<SourceProbe> {
        match source {
            TransferSource::Drive { file_id } => {
                let token = self.credentials.bearer_token()?;
                let meta = fetch_drive_meta(self.executor.as_ref(), &token, file_id)?;
                let size = meta.size_bytes().ok_or_else(|| {
                    Error::UnsupportedSource(format!("Drive file {file_id} reports no size"))
                })?;
                Ok(SourceProbe {
                    size,
                    mime_type: meta.mime_type,
                    file_name: meta.name.unwrap_or_else(|| file_id.clone()),
                })
            }
            TransferSource::Url { url } => {
                let resp = self
                    .executor
                    .send(HttpRequest::get(url).header("Range", "bytes=0-1"))?;
                if resp.status != 206 {
                    return Err(Error::UnsupportedSource(format!(
                        "{url} does not support range requests (status {})",
                        resp.status
                    )));
                }
                let size = resp
                    .header("content-range")
                    .and_then(total_from_content_range)
                    .ok_or_else(|| {
                        Error::UnsupportedSource(format!("{url} sent no usable Content-Range"))
                    })?;
                let mime_type = resp
                    .header("content-type")
                    .map(essence)
                    .unwrap_or_else(|| "application/octet-stream".to_string());
                let file_name = resp
                    .header("content-disposition")
                    .and_then(filename_from_disposition)
                    .unwrap_or_else(|| (started_at.unix_timestamp_nanos() / 1_000_000).to_string());
                Ok(SourceProbe {
                    size,
                    mime_type,
                    file_name,
                })
            }
        }
    }

    /// `invoked` is when the caller's `start`/`resume` began; the time guard counts from it.
    fn transfer(&self, mut checkpoint: UploadCheckpoint, invoked: Instant) -> Result<UploadOutcome> {
        let total = checkpoint.chunks.len();
        let drive_token = match checkpoint.source {
            TransferSource::Drive { .. } => Some(self.credentials.bearer_token()?),
            TransferSource::Url { .. } => None,
        };

        for idx in checkpoint.next_chunk..total {
            let chunk = checkpoint.chunks[idx];
            debug!("chunk {}/{}: downloading bytes {}", idx + 1, total, chunk.http_span());
            let data = self.download(&checkpoint, chunk, drive_token.as_deref())?;

            let put = HttpRequest::put(&checkpoint.session_location)
                .header(
                    "Content-Range",
                    format!("bytes {}/{}", chunk.http_span(), checkpoint.size),
                )
                .body(checkpoint.mime_type.clone(), data);
            let resp = self.executor.send(put)?;
            match resp.status {
                200 | 201 => {
                    info!("transfer {} finished after chunk {}/{}", checkpoint.transfer_id, idx + 1, total);
                    let file = parse_file_record(&resp)?;
                    self.store.delete(&checkpoint_key(&checkpoint.transfer_id))?;
                    return Ok(UploadOutcome::Complete(file));
                }
                308 => {
                    checkpoint.next_chunk = idx + 1;
                    self.save(&checkpoint)?;
                    info!(
                        "transfer {}: chunk {}/{} accepted ({})",
                        checkpoint.transfer_id,
                        idx + 1,
                        total,
                        ByteSize(chunk.end)
                    );
                }
                status => return Err(Error::service(status, resp.text())),
            }

            let elapsed = self.clock.now().saturating_duration_since(invoked);
            if elapsed > self.time_budget && checkpoint.next_chunk < total {
                warn!(
                    "transfer {} paused after {:?}; {} chunk(s) left, run it again to continue",
                    checkpoint.transfer_id,
                    elapsed,
                    total - checkpoint.next_chunk
                );
                if let Some(monitor) = &self.monitor {
                    monitor.note_event(
                        "upload.partial",
                        json!({
                            "transfer_id": checkpoint.transfer_id,
                            "next_chunk": checkpoint.next_chunk,
                            "total_chunks": total,
                        }),
                    );
                }
                return Ok(UploadOutcome::Partial {
                    transfer_id: checkpoint.transfer_id.clone(),
                    next_chunk: checkpoint.next_chunk,
                    total_chunks: total,
                });
            }
        }

        Err(Error::Protocol(format!(
            "upload session for transfer {} accepted every chunk but never returned a file",
            checkpoint.transfer_id
        )))
    }

    fn download(
        &self,
        checkpoint: &UploadCheckpoint,
        chunk: ChunkRange,
        drive_token: Option<&str>,
    ) -> Result<bytes::Bytes> {
        let mut request = HttpRequest::get(checkpoint.source.download_url())
            .header("Range", format!("bytes={}", chunk.http_span()));
        if let Some(token) = drive_token {
            request = request.bearer(token);
        }
        let resp = self.executor.send(request)?;
        let whole_file = resp.status == 200 && chunk.start == 0 && chunk.end == checkpoint.size;
        if resp.status != 206 && !whole_file {
            return Err(Error::service(resp.status, resp.text()));
        }
        if resp.body.len() as u64 != chunk.len() {
            return Err(Error::Protocol(format!(
                "expected {} bytes for range {}, got {}",
                chunk.len(),
                chunk.http_span(),
                resp.body.len()
            )));
        }
        Ok(resp.body)
    }
}

fn checkpoint_key(transfer_id: &str) -> String {
    format!("checkpoint:{transfer_id}")
}

fn default_display_name(source: &TransferSource, file_name: &str) -> DocumentKey {
    match source {
        TransferSource::Drive { file_id } => DocumentKey::single(file_id.clone()),
        TransferSource::Url { .. } => DocumentKey::blob(file_name),
    }
}

fn parse_file_record(resp: &HttpResponse) -> Result<UploadedFile> {
    let mut value: Value = resp.json()?;
    if let Some(file) = value.get_mut("file") {
        value = file.take();
    }
    Ok(serde_json::from_value(value)?)
}

/// `bytes 0-1/1048576` -> 1048576.
fn total_from_content_range(header: &str) -> Option<u64> {
    header.rsplit_once('/')?.1.trim().parse().ok()
}

/// The extended `filename*=UTF-8''..` form is percent-encoded (RFC 5987).
fn filename_from_disposition(header: &str) -> Option<String> {
    static FILENAME: OnceLock<Regex> = OnceLock::new();
    let re = FILENAME.get_or_init(|| {
        Regex::new(r#"filename(\*)?=(?:UTF-8'')?"?([^";]+)"?"#).expect("valid filename regex")
    });
    let caps = re.captures(header)?;
    let raw = caps.get(2)?.as_str().trim();
    let name = if caps.get(1).is_some() {
        percent_decode_str(raw).decode_utf8_lossy().into_owned()
    } else {
        raw.to_string()
    };
    Some(name).filter(|name| !name.is_empty())
}
