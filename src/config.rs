use anyhow::{bail, Context};
use serde::Deserialize;
use serde_json::json;
use std::{
    env,
    fs::File,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use crate::auth::{Credentials, ServiceAccount, ServiceAccountKey, StaticToken};
use crate::client::Endpoints;
use crate::constants::{
    DEFAULT_API_VERSION, DEFAULT_BASE_URL, DEFAULT_MAX_FUNCTION_ROUNDS, DEFAULT_MODEL,
    DEFAULT_RETRY_BACKOFF, DEFAULT_RETRY_BUDGET, DEFAULT_TIME_BUDGET, DEFAULT_WAVE_SIZE,
    DRIVE_SCOPE, GENERATIVE_SCOPE,
};
use crate::generate::{GenerationConfig, RetryPolicy};
use crate::http::BatchExecutor;
use crate::store::FileStore;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct Root {
    pub model: Option<String>,
    pub api_version: Option<String>,
    pub base_url: Option<String>,
    pub wave_size: Option<usize>,
    pub retry_budget: Option<u32>,
    /// humantime string, e.g. `3s`.
    pub retry_backoff: Option<String>,
    pub time_budget: Option<String>,
    pub checkpoint_dir: Option<PathBuf>,
    pub temperature: Option<f64>,
    pub response_mime_type: Option<String>,
    pub system_instruction: Option<String>,
    pub max_function_rounds: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub api_key: Option<String>,
    pub access_token: Option<String>,
    pub service_account: Option<PathBuf>,
    pub model: String,
    pub api_version: String,
    pub base_url: String,
    pub wave_size: usize,
    pub retry_budget: u32,
    pub retry_backoff: Duration,
    pub time_budget: Duration,
    pub checkpoint_dir: PathBuf,
    pub temperature: Option<f64>,
    pub response_mime_type: Option<String>,
    pub system_instruction: Option<String>,
    pub max_function_rounds: usize,
}

impl AppConfig {
    pub fn load(path: Option<&str>) -> anyhow::Result<Self> {
        let root = match path {
            Some(p) => Some(Self::read_yaml(Path::new(p))?),
            None => {
                let mut found = None;
                for candidate in ["gemfiles.yaml", "gemfiles.yml"] {
                    let path = Path::new(candidate);
                    if path.exists() {
                        found = Some(Self::read_yaml(path)?);
                        break;
                    }
                }
                found
            }
        };
        Self::from_root(root, |name| env::var(name).ok().filter(|v| !v.is_empty()))
    }

    fn read_yaml(path: &Path) -> anyhow::Result<Root> {
        let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
        serde_yaml::from_reader(file).with_context(|| format!("parsing {}", path.display()))
    }

    /// Environment values win over the YAML file.
    fn from_root(root: Option<Root>, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let r = root.unwrap_or_default();
        let model = lookup("GEMFILES_MODEL")
            .or(r.model)
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let checkpoint_dir = lookup("GEMFILES_CHECKPOINT_DIR")
            .map(PathBuf::from)
            .or(r.checkpoint_dir)
            .unwrap_or_else(FileStore::default_root);

        Ok(Self {
            api_key: lookup("GEMINI_API_KEY"),
            access_token: lookup("GEMINI_ACCESS_TOKEN"),
            service_account: lookup("GOOGLE_APPLICATION_CREDENTIALS").map(PathBuf::from),
            model,
            api_version: r
                .api_version
                .unwrap_or_else(|| DEFAULT_API_VERSION.to_string()),
            base_url: r.base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            wave_size: r.wave_size.unwrap_or(DEFAULT_WAVE_SIZE).max(1),
            retry_budget: r.retry_budget.unwrap_or(DEFAULT_RETRY_BUDGET),
            retry_backoff: parse_duration("retry_backoff", r.retry_backoff)?
                .unwrap_or(DEFAULT_RETRY_BACKOFF),
            time_budget: parse_duration("time_budget", r.time_budget)?
                .unwrap_or(DEFAULT_TIME_BUDGET),
            checkpoint_dir,
            temperature: r.temperature,
            response_mime_type: r.response_mime_type,
            system_instruction: r.system_instruction,
            max_function_rounds: r
                .max_function_rounds
                .unwrap_or(DEFAULT_MAX_FUNCTION_ROUNDS),
        })
    }

    pub fn endpoints(&self) -> Endpoints {
        Endpoints::new(&self.base_url, &self.api_version, &self.model)
    }

    pub fn generation_config(&self) -> GenerationConfig {
        GenerationConfig {
            response_mime_type: self.response_mime_type.clone(),
            temperature: self.temperature,
            system_instruction: self
                .system_instruction
                .as_ref()
                .map(|text| json!({ "parts": [{ "text": text }] })),
            retry: RetryPolicy {
                budget: self.retry_budget,
                backoff: self.retry_backoff,
            },
            max_function_rounds: self.max_function_rounds,
            ..GenerationConfig::default()
        }
    }

    pub fn credentials(&self, executor: Arc<dyn BatchExecutor>) -> anyhow::Result<Credentials> {
        let mut credentials = Credentials {
            api_key: self.api_key.clone(),
            token: None,
        };
        if let Some(token) = &self.access_token {
            credentials = credentials.with_token(Arc::new(StaticToken(token.clone())));
        } else if let Some(path) = &self.service_account {
            let key = ServiceAccountKey::load(path)?;
            credentials = credentials.with_token(Arc::new(ServiceAccount::new(
                key,
                &[GENERATIVE_SCOPE, DRIVE_SCOPE],
                executor,
            )));
        }
        if credentials.api_key.is_none() && credentials.token.is_none() {
            bail!("set GEMINI_API_KEY, GEMINI_ACCESS_TOKEN or GOOGLE_APPLICATION_CREDENTIALS");
        }
        Ok(credentials)
    }
}

fn parse_duration(field: &str, value: Option<String>) -> anyhow::Result<Option<Duration>> {
    value
        .map(|raw| humantime::parse_duration(&raw).with_context(|| format!("{field}: `{raw}`")))
        .transpose()
}
