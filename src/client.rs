use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use url::Url;

use crate::auth::Credentials;
use crate::config::AppConfig;
use crate::consolidate::{await_active, consolidate, ActiveWait, GroupedFile};
use crate::constants::{
    DEFAULT_API_VERSION, DEFAULT_BASE_URL, DEFAULT_MODEL, DEFAULT_TIME_BUDGET, DEFAULT_WAVE_SIZE,
    HTTP_TIMEOUT,
};
use crate::error::{Error, Result};
use crate::files::FilesApi;
use crate::generate::{GenerationConfig, Generator};
use crate::http::{BatchExecutor, ReqwestExecutor};
use crate::source::{BlobResolver, DriveResolver, PageRenderer, PdftoppmRenderer};
use crate::store::{CheckpointStore, FileStore, MemoryStore};
use crate::telemetry::RunMonitor;
use crate::types::UploadedFile;
use crate::upload::{ResumableUploader, UploadBatcher};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub base_url: String,
    pub api_version: String,
    /// Always carries the `models/` prefix.
    pub model: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL, DEFAULT_API_VERSION, DEFAULT_MODEL)
    }
}

impl Endpoints {
    pub fn new(base_url: &str, api_version: &str, model: &str) -> Self {
        let model = if model.starts_with("models/") {
            model.to_string()
        } else {
            format!("models/{model}")
        };
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_version: api_version.to_string(),
            model,
        }
    }

    /// `uploadType` is `multipart` for batch uploads and `resumable` for chunked transfers.
    pub fn upload_url(&self, upload_type: &str, credentials: &Credentials) -> Result<String> {
        let raw = format!("{}/upload/{}/files", self.base_url, self.api_version);
        build_url(&raw, &[("uploadType", upload_type.to_string())], credentials)
    }

    pub fn files_url(&self, query: &[(&str, String)], credentials: &Credentials) -> Result<String> {
        let raw = format!("{}/{}/files", self.base_url, self.api_version);
        build_url(&raw, query, credentials)
    }

    /// `name` is the remote id, e.g. `files/abc123`.
    pub fn file_url(&self, name: &str, credentials: &Credentials) -> Result<String> {
        let raw = format!("{}/{}/{}", self.base_url, self.api_version, name);
        build_url(&raw, &[], credentials)
    }

    pub fn generate_url(&self, credentials: &Credentials) -> Result<String> {
        self.model_url("generateContent", credentials)
    }

    pub fn count_tokens_url(&self, credentials: &Credentials) -> Result<String> {
        self.model_url("countTokens", credentials)
    }

    fn model_url(&self, method: &str, credentials: &Credentials) -> Result<String> {
        let raw = format!("{}/{}/{}:{method}", self.base_url, self.api_version, self.model);
        build_url(&raw, &[], credentials)
    }
}

fn build_url(raw: &str, query: &[(&str, String)], credentials: &Credentials) -> Result<String> {
    let mut url = Url::parse(raw).map_err(|err| Error::InvalidInput(format!("{raw}: {err}")))?;
    let auth = credentials.query_pairs();
    if !query.is_empty() || !auth.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in query.iter().chain(auth.iter()) {
            pairs.append_pair(key, value);
        }
    }
    Ok(url.into())
}

pub struct GeminiClient {
    executor: Arc<dyn BatchExecutor>,
    credentials: Credentials,
    endpoints: Endpoints,
    store: Arc<dyn CheckpointStore>,
    renderer: Arc<dyn PageRenderer>,
    wave_size: usize,
    time_budget: Duration,
    generation: GenerationConfig,
    monitor: RunMonitor,
}

impl GeminiClient {
    pub fn new(executor: Arc<dyn BatchExecutor>, credentials: Credentials, endpoints: Endpoints) -> Self {
        Self {
            executor,
            credentials,
            endpoints,
            store: Arc::new(MemoryStore::new()),
            renderer: Arc::new(PdftoppmRenderer),
            wave_size: DEFAULT_WAVE_SIZE,
            time_budget: DEFAULT_TIME_BUDGET,
            generation: GenerationConfig::default(),
            monitor: RunMonitor::new(),
        }
    }

    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let executor: Arc<dyn BatchExecutor> = Arc::new(
            ReqwestExecutor::new(config.wave_size, HTTP_TIMEOUT).context("building HTTP executor")?,
        );
        let credentials = config.credentials(executor.clone())?;
        let store = FileStore::new(config.checkpoint_dir.clone()).with_context(|| {
            format!("opening checkpoint dir {}", config.checkpoint_dir.display())
        })?;
        Ok(Self::new(executor, credentials, config.endpoints())
            .with_store(Arc::new(store))
            .with_wave_size(config.wave_size)
            .with_time_budget(config.time_budget)
            .with_generation_config(config.generation_config()))
    }

    pub fn with_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn PageRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn with_wave_size(mut self, wave_size: usize) -> Self {
        self.wave_size = wave_size.max(1);
        self
    }

    pub fn with_time_budget(mut self, budget: Duration) -> Self {
        self.time_budget = budget;
        self
    }

    pub fn with_generation_config(mut self, config: GenerationConfig) -> Self {
        self.generation = config;
        self
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    pub fn monitor(&self) -> &RunMonitor {
        &self.monitor
    }

    pub fn wave_size(&self) -> usize {
        self.wave_size
    }

    pub fn files(&self) -> FilesApi {
        FilesApi::new(
            self.executor.clone(),
            self.credentials.clone(),
            self.endpoints.clone(),
        )
    }

    pub fn drive_resolver(&self) -> DriveResolver {
        DriveResolver::new(self.executor.clone(), self.credentials.clone())
    }

    pub fn batcher(&self, resolver: Arc<dyn BlobResolver>) -> Result<UploadBatcher> {
        let url = self.endpoints.upload_url("multipart", &self.credentials)?;
        Ok(UploadBatcher::new(
            self.executor.clone(),
            self.credentials.clone(),
            resolver,
            self.renderer.clone(),
            url,
        )
        .with_wave_size(self.wave_size))
    }

    pub fn resumable(&self) -> Result<ResumableUploader> {
        let url = self.endpoints.upload_url("resumable", &self.credentials)?;
        Ok(ResumableUploader::new(
            self.executor.clone(),
            self.credentials.clone(),
            self.store.clone(),
            &url,
        )?
        .with_time_budget(self.time_budget)
        .with_monitor(self.monitor.clone()))
    }

    pub fn generator(&self) -> Generator {
        Generator::new(
            self.executor.clone(),
            self.credentials.clone(),
            self.endpoints.clone(),
        )
        .with_config(self.generation.clone())
        .with_monitor(self.monitor.clone())
    }

    pub fn consolidate(&self, files: Vec<UploadedFile>, wait: ActiveWait) -> Result<Vec<GroupedFile>> {
        if files.is_empty() {
            return Err(Error::InvalidInput("no files to consolidate".into()));
        }
        let files = await_active(files, &self.files(), wait)?;
        consolidate(&files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticToken;
    use crate::document::DocumentKey;
    use crate::http::HttpResponse;
    use crate::testing::ScriptedExecutor;
    use crate::types::FileState;

    #[test]
    fn urls_carry_key_query() {
        let creds = Credentials::api_key("k");
        let endpoints = Endpoints::new("https://example.test/", "v1beta", "gemini-1.5-pro");
        assert_eq!(endpoints.model, "models/gemini-1.5-pro");
        assert_eq!(
            endpoints.generate_url(&creds).unwrap(),
            "https://example.test/v1beta/models/gemini-1.5-pro:generateContent?key=k"
        );
        assert_eq!(
            endpoints.upload_url("resumable", &creds).unwrap(),
            "https://example.test/upload/v1beta/files?uploadType=resumable&key=k"
        );
        assert_eq!(
            endpoints.file_url("files/abc", &creds).unwrap(),
            "https://example.test/v1beta/files/abc?key=k"
        );
    }

    #[test]
    fn bearer_credentials_add_no_query() {
        let creds = Credentials::bearer(Arc::new(StaticToken("t".into())));
        let url = Endpoints::default().count_tokens_url(&creds).unwrap();
        assert!(url.ends_with("models/gemini-1.5-flash-latest:countTokens"));
    }

    #[test]
    fn bad_base_url_is_invalid_input() {
        let endpoints = Endpoints::new("not a url", "v1beta", "m");
        assert!(matches!(
            endpoints.generate_url(&Credentials::default()),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn client_consolidates_after_listing() {
        let executor = Arc::new(ScriptedExecutor::new(|_| {
            HttpResponse::new(
                200,
                r#"{"files":[{"name":"files/1","displayName":"fileId@d$page@1$maxPage@2","state":"ACTIVE"}]}"#,
            )
        }));
        let client = GeminiClient::new(executor.clone(), Credentials::api_key("k"), Endpoints::default());
        let mk = |name: &str, page: u32, state: FileState| UploadedFile {
            name: name.into(),
            key: DocumentKey::paged("d", page, 2),
            mime_type: "image/png".into(),
            uri: String::new(),
            state,
            extra: Default::default(),
        };
        let groups = client
            .consolidate(
                vec![mk("files/2", 2, FileState::Active), mk("files/1", 1, FileState::Processing)],
                ActiveWait {
                    attempts: 3,
                    backoff: Duration::ZERO,
                },
            )
            .unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].files[0].name, "files/1");
        assert_eq!(groups[0].files[0].state, FileState::Active);
        assert_eq!(executor.requests().len(), 1);
    }

    #[test]
    fn resumable_uploader_uses_resumable_endpoint() {
        let client = GeminiClient::new(
            Arc::new(ScriptedExecutor::new(|_| HttpResponse::new(500, ""))),
            Credentials::api_key("k"),
            Endpoints::default(),
        );
        assert!(client.resumable().is_ok());
        assert!(client.batcher(Arc::new(crate::source::LocalFileResolver::new())).is_ok());
    }
}
