use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::auth::Credentials;
use crate::constants::DEFAULT_WAVE_SIZE;
use crate::document::DocumentKey;
use crate::error::{Error, Result};
use crate::http::{multipart_related, BatchExecutor, HttpRequest, HttpResponse};
use crate::source::{Blob, BlobResolver, PageRenderer};
use crate::types::UploadedFile;

#[derive(Debug, Clone)]
pub enum BatchItem {
    /// Resolved through the batcher's `BlobResolver`. `as_image` asks the resolver for a
    /// rendered preview instead of the raw bytes.
    Reference {
        reference: String,
        split_pages: bool,
        as_image: bool,
    },
    Blob { blob: Blob, split_pages: bool },
}

impl BatchItem {
    pub fn reference(reference: impl Into<String>) -> Self {
        BatchItem::Reference {
            reference: reference.into(),
            split_pages: false,
            as_image: false,
        }
    }

    pub fn blob(blob: Blob) -> Self {
        BatchItem::Blob {
            blob,
            split_pages: false,
        }
    }

    pub fn split_pages(mut self) -> Self {
        match &mut self {
            BatchItem::Reference { split_pages, .. } | BatchItem::Blob { split_pages, .. } => {
                *split_pages = true
            }
        }
        self
    }

    pub fn as_image(mut self) -> Self {
        if let BatchItem::Reference { as_image, .. } = &mut self {
            *as_image = true;
        }
        self
    }
}

pub struct UploadBatcher {
    executor: Arc<dyn BatchExecutor>,
    credentials: Credentials,
    resolver: Arc<dyn BlobResolver>,
    renderer: Arc<dyn PageRenderer>,
    upload_url: String,
    wave_size: usize,
}

impl UploadBatcher {
    pub fn new(
        executor: Arc<dyn BatchExecutor>,
        credentials: Credentials,
        resolver: Arc<dyn BlobResolver>,
        renderer: Arc<dyn PageRenderer>,
        upload_url: impl Into<String>,
    ) -> Self {
        Self {
            executor,
            credentials,
            resolver,
            renderer,
            upload_url: upload_url.into(),
            wave_size: DEFAULT_WAVE_SIZE,
        }
    }

    pub fn with_wave_size(mut self, wave_size: usize) -> Self {
        self.wave_size = wave_size.max(1);
        self
    }

    /// Items that fail to resolve or authorize, and responses without a `file` record, are
    /// dropped with a warning. Only an empty input is an error.
    pub fn upload(&self, items: &[BatchItem]) -> Result<Vec<UploadedFile>> {
        if items.is_empty() {
            return Err(Error::EmptyUploadSet);
        }

        let mut uploaded = Vec::new();
        let mut wave: Vec<HttpRequest> = Vec::with_capacity(self.wave_size);
        let mut waves = 0usize;
        for item in items {
            let entries = match self.expand(item) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!("skipping {}: {err}", describe(item));
                    continue;
                }
            };
            for (key, blob) in entries {
                match self.request_for(&key, &blob) {
                    Ok(request) => wave.push(request),
                    Err(err) => {
                        warn!("skipping {key}: {err}");
                        continue;
                    }
                }
                if wave.len() == self.wave_size {
                    waves += 1;
                    uploaded.extend(self.dispatch(std::mem::take(&mut wave), waves));
                }
            }
        }
        if !wave.is_empty() {
            waves += 1;
            uploaded.extend(self.dispatch(wave, waves));
        }

        info!("uploaded {} file(s) in {} wave(s)", uploaded.len(), waves);
        Ok(uploaded)
    }

    fn expand(&self, item: &BatchItem) -> Result<Vec<(DocumentKey, Blob)>> {
        match item {
            BatchItem::Reference {
                reference,
                split_pages,
                as_image,
            } => {
                let blob = if *as_image {
                    self.resolver.thumbnail(reference)?
                } else {
                    self.resolver.resolve(reference)?
                };
                if *split_pages {
                    self.paged(reference, &blob)
                } else {
                    Ok(vec![(DocumentKey::single(reference.as_str()), blob)])
                }
            }
            BatchItem::Blob { blob, split_pages } => {
                if *split_pages {
                    self.paged(&blob.name, blob)
                } else {
                    Ok(vec![(DocumentKey::blob(blob.name.as_str()), blob.clone())])
                }
            }
        }
    }

    fn paged(&self, id: &str, blob: &Blob) -> Result<Vec<(DocumentKey, Blob)>> {
        let pages = self.renderer.render_pages(blob)?;
        let total = pages.len() as u32;
        debug!("{id}: {total} page(s)");
        Ok(pages
            .into_iter()
            .enumerate()
            .map(|(idx, page)| (DocumentKey::paged(id, idx as u32 + 1, total), page))
            .collect())
    }

    fn request_for(&self, key: &DocumentKey, blob: &Blob) -> Result<HttpRequest> {
        let boundary = next_boundary();
        let metadata = json!({ "file": { "displayName": key.display_name() } });
        let body = multipart_related(&boundary, &metadata, &blob.mime_type, &blob.bytes);
        let request = HttpRequest::post(&self.upload_url)
            .header("X-Goog-Upload-Protocol", "multipart")
            .body(format!("multipart/related; boundary={boundary}"), body);
        self.credentials.authorize(request)
    }

    fn dispatch(&self, wave: Vec<HttpRequest>, number: usize) -> Vec<UploadedFile> {
        debug!("wave {number}: {} request(s)", wave.len());
        self.executor
            .execute(wave)
            .into_iter()
            .filter_map(|result| match result.and_then(file_record) {
                Ok(Some(file)) => Some(file),
                Ok(None) => {
                    warn!("wave {number}: upload response carried no file record");
                    None
                }
                Err(err) => {
                    warn!("wave {number}: upload failed: {err}");
                    None
                }
            })
            .collect()
    }
}

fn file_record(resp: HttpResponse) -> Result<Option<UploadedFile>> {
    let resp = resp.ensure_ok()?;
    let mut value: Value = resp.json()?;
    match value.get_mut("file") {
        Some(file) => Ok(Some(serde_json::from_value(file.take())?)),
        None => Ok(None),
    }
}

fn describe(item: &BatchItem) -> &str {
    match item {
        BatchItem::Reference { reference, .. } => reference.as_str(),
        BatchItem::Blob { blob, .. } => blob.name.as_str(),
    }
}

fn next_boundary() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    format!(
        "gemfiles-{}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}
