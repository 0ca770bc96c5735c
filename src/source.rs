use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use serde::Deserialize;

use crate::auth::Credentials;
use crate::constants::{
    DRIVE_FILES_URL, DRIVE_THUMBNAIL_URL, GOOGLE_NATIVE_MIME_PREFIX, THUMBNAIL_WIDTH,
};
use crate::error::{Error, Result};
use crate::http::{BatchExecutor, HttpRequest};

#[derive(Debug, Clone, PartialEq)]
pub struct Blob {
    pub name: String,
    pub mime_type: String,
    pub bytes: Bytes,
}

impl Blob {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            bytes: bytes.into(),
        }
    }

    pub fn is_pdf(&self) -> bool {
        essence(&self.mime_type) == "application/pdf"
    }
}

/// Strips parameters such as `; charset=binary` from a content type.
pub fn essence(content_type: &str) -> String {
    content_type
        .parse::<mime::Mime>()
        .map(|m| m.essence_str().to_string())
        .unwrap_or_else(|_| {
            content_type
                .split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .to_string()
        })
}

pub trait BlobResolver: Send + Sync {
    fn resolve(&self, reference: &str) -> Result<Blob>;

    /// A rendered preview image of the reference. Sources without previews return the file.
    fn thumbnail(&self, reference: &str) -> Result<Blob> {
        self.resolve(reference)
    }
}

#[derive(Debug, Clone, Default)]
pub struct LocalFileResolver {
    root: Option<PathBuf>,
}

impl LocalFileResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rooted(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    fn path_for(&self, reference: &str) -> PathBuf {
        match &self.root {
            Some(root) => root.join(reference),
            None => PathBuf::from(reference),
        }
    }
}

impl BlobResolver for LocalFileResolver {
    fn resolve(&self, reference: &str) -> Result<Blob> {
        let path = self.path_for(reference);
        let bytes = fs::read(&path)?;
        let name = path
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| reference.to_string());
        let mime_type = mime_guess::from_path(&path)
            .first_raw()
            .unwrap_or("application/octet-stream")
            .to_string();
        Ok(Blob::new(name, mime_type, bytes))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveFileMeta {
    pub name: Option<String>,
    pub mime_type: String,
    /// Drive reports sizes as decimal strings.
    pub size: Option<String>,
}

impl DriveFileMeta {
    pub fn size_bytes(&self) -> Option<u64> {
        self.size.as_deref().and_then(|s| s.parse().ok())
    }

    pub fn is_google_native(&self) -> bool {
        self.mime_type.starts_with(GOOGLE_NATIVE_MIME_PREFIX)
    }
}

pub fn drive_media_url(file_id: &str) -> String {
    format!("{DRIVE_FILES_URL}/{file_id}?supportsAllDrives=true&alt=media")
}

pub fn fetch_drive_meta(
    executor: &dyn BatchExecutor,
    token: &str,
    file_id: &str,
) -> Result<DriveFileMeta> {
    let url = format!("{DRIVE_FILES_URL}/{file_id}?supportsAllDrives=true&fields=name%2CmimeType%2Csize");
    let resp = executor.send(HttpRequest::get(url).bearer(token))?.ensure_ok()?;
    let meta: DriveFileMeta = resp.json()?;
    if meta.is_google_native() {
        return Err(Error::UnsupportedSource(format!(
            "Drive file {file_id} is a Google-native document ({}) and has no byte content",
            meta.mime_type
        )));
    }
    Ok(meta)
}

pub struct DriveResolver {
    executor: Arc<dyn BatchExecutor>,
    credentials: Credentials,
}

impl DriveResolver {
    pub fn new(executor: Arc<dyn BatchExecutor>, credentials: Credentials) -> Self {
        Self {
            executor,
            credentials,
        }
    }
}

impl BlobResolver for DriveResolver {
    fn resolve(&self, file_id: &str) -> Result<Blob> {
        let token = self.credentials.bearer_token()?;
        let meta = fetch_drive_meta(self.executor.as_ref(), &token, file_id)?;
        let resp = self
            .executor
            .send(HttpRequest::get(drive_media_url(file_id)).bearer(&token))?
            .ensure_ok()?;
        let name = meta.name.clone().unwrap_or_else(|| file_id.to_string());
        Ok(Blob::new(name, meta.mime_type, resp.body))
    }

    fn thumbnail(&self, file_id: &str) -> Result<Blob> {
        let token = self.credentials.bearer_token()?;
        let url = format!("{DRIVE_THUMBNAIL_URL}?sz=w{THUMBNAIL_WIDTH}&id={file_id}");
        let resp = self
            .executor
            .send(HttpRequest::get(url).bearer(&token))?
            .ensure_ok()?;
        let mime_type = resp
            .header("content-type")
            .map(essence)
            .unwrap_or_else(|| "image/png".to_string());
        Ok(Blob::new(file_id, mime_type, resp.body))
    }
}

pub trait PageRenderer: Send + Sync {
    fn render_pages(&self, blob: &Blob) -> Result<Vec<Blob>>;
}

/// Renders PDF pages to PNG with poppler's `pdftoppm`. Non-PDF blobs pass through as one page.
#[derive(Debug, Clone, Default)]
pub struct PdftoppmRenderer;

impl PageRenderer for PdftoppmRenderer {
    fn render_pages(&self, blob: &Blob) -> Result<Vec<Blob>> {
        if !blob.is_pdf() {
            return Ok(vec![blob.clone()]);
        }
        render_pdf(blob).map_err(|err| Error::UnsupportedSource(format!("{err:#}")))
    }
}

fn render_pdf(blob: &Blob) -> anyhow::Result<Vec<Blob>> {
    let pdftoppm = which::which("pdftoppm").context("pdftoppm not found; install poppler utils")?;
    let work = tempfile::tempdir().context("creating page render directory")?;
    let input = work.path().join("source.pdf");
    fs::write(&input, &blob.bytes)?;
    let out_base = work.path().join("page");
    let status = Command::new(pdftoppm)
        .arg("-png")
        .arg(&input)
        .arg(&out_base)
        .status()?;
    if !status.success() {
        anyhow::bail!("pdftoppm failed for {}", blob.name);
    }

    let mut pages = collect_pngs(work.path())?;
    pages.sort_by_key(|path| page_number(path));
    let stem = Path::new(&blob.name)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| blob.name.clone());
    pages
        .into_iter()
        .enumerate()
        .map(|(idx, path)| {
            let bytes = fs::read(&path)?;
            Ok(Blob::new(format!("{stem}-{}.png", idx + 1), "image/png", bytes))
        })
        .collect()
}

fn collect_pngs(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut pages = vec![];
    for entry in walkdir::WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry?;
        if entry.file_type().is_file()
            && entry
                .path()
                .extension()
                .and_then(|s| s.to_str())
                .map(|ext| ext.eq_ignore_ascii_case("png"))
                .unwrap_or(false)
        {
            pages.push(entry.into_path());
        }
    }
    Ok(pages)
}

/// `page-07.png` -> 7. pdftoppm pads only to the width of the page count.
fn page_number(path: &Path) -> u32 {
    path.file_stem()
        .and_then(|s| s.to_str())
        .and_then(|stem| stem.rsplit('-').next())
        .and_then(|digits| digits.parse().ok())
        .unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticToken;
    use crate::http::HttpResponse;
    use crate::testing::ScriptedExecutor;

    #[test]
    fn local_resolver_guesses_mime_from_extension() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("scan.png"), b"PNGDATA").unwrap();
        let blob = LocalFileResolver::rooted(dir.path()).resolve("scan.png").unwrap();
        assert_eq!(blob.name, "scan.png");
        assert_eq!(blob.mime_type, "image/png");
        assert_eq!(&blob.bytes[..], b"PNGDATA");
    }

    #[test]
    fn essence_drops_parameters() {
        assert_eq!(essence("application/pdf; charset=binary"), "application/pdf");
        assert_eq!(essence("image/jpeg"), "image/jpeg");
    }

    #[test]
    fn page_numbers_sort_numerically() {
        let mut pages = vec![
            PathBuf::from("page-10.png"),
            PathBuf::from("page-2.png"),
            PathBuf::from("page-1.png"),
        ];
        pages.sort_by_key(|p| page_number(p));
        assert_eq!(pages[0], PathBuf::from("page-1.png"));
        assert_eq!(pages[2], PathBuf::from("page-10.png"));
    }

    #[test]
    fn non_pdf_blob_renders_as_single_page() {
        let blob = Blob::new("a.png", "image/png", &b"x"[..]);
        assert_eq!(PdftoppmRenderer.render_pages(&blob).unwrap(), vec![blob]);
    }

    #[test]
    fn drive_resolver_rejects_native_documents() {
        let executor = Arc::new(ScriptedExecutor::new(|_| {
            HttpResponse::new(
                200,
                r#"{"name":"Budget","mimeType":"application/vnd.google-apps.spreadsheet"}"#,
            )
        }));
        let resolver = DriveResolver::new(
            executor.clone(),
            Credentials::bearer(Arc::new(StaticToken("tok".into()))),
        );
        let err = resolver.resolve("sheet1").unwrap_err();
        assert!(matches!(err, Error::UnsupportedSource(_)));
        assert_eq!(executor.requests().len(), 1);
    }

    #[test]
    fn drive_resolver_downloads_media() {
        let executor = Arc::new(ScriptedExecutor::new(|req| {
            if req.url.contains("alt=media") {
                HttpResponse::new(200, "%PDF-1.7")
            } else {
                HttpResponse::new(200, r#"{"name":"a.pdf","mimeType":"application/pdf","size":"8"}"#)
            }
        }));
        let resolver = DriveResolver::new(
            executor.clone(),
            Credentials::bearer(Arc::new(StaticToken("tok".into()))),
        );
        let blob = resolver.resolve("f1").unwrap();
        assert_eq!(blob.name, "a.pdf");
        assert!(blob.is_pdf());
        let requests = executor.requests();
        assert!(requests
            .iter()
            .all(|r| r.header_value("authorization") == Some("Bearer tok")));
    }
}
