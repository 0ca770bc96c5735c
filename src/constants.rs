use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_API_VERSION: &str = "v1beta";
pub const DEFAULT_MODEL: &str = "models/gemini-1.5-flash-latest";

pub const DRIVE_FILES_URL: &str = "https://www.googleapis.com/drive/v3/files";
pub const DRIVE_THUMBNAIL_URL: &str = "https://drive.google.com/thumbnail";
pub const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive.readonly";
pub const GENERATIVE_SCOPE: &str = "https://www.googleapis.com/auth/generative-language";
pub const OAUTH_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Drive MIME prefix for Docs, Sheets and friends; these have no byte stream.
pub const GOOGLE_NATIVE_MIME_PREFIX: &str = "application/vnd.google-apps";

pub const CHUNK_SIZE: u64 = 16 * 1024 * 1024;
pub const DEFAULT_TIME_BUDGET: Duration = Duration::from_secs(300);

pub const DEFAULT_WAVE_SIZE: usize = 50;
pub const FILE_LIST_PAGE_SIZE: u32 = 100;

pub const DEFAULT_RETRY_BUDGET: u32 = 5;
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(3);
pub const DEFAULT_MAX_FUNCTION_ROUNDS: usize = 16;

pub const ACTIVE_WAIT_ATTEMPTS: u32 = 3;
pub const ACTIVE_WAIT_BACKOFF: Duration = Duration::from_secs(10);

pub const THUMBNAIL_WIDTH: u32 = 1500;
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(600);

/// Wire prefix of functions whose arguments are the answer itself.
pub const OUTPUT_FUNCTION_PREFIX: &str = "customType_";

pub const NO_VALUE: &str = "No values.";

pub const BLOCKED_FINISH_REASONS: &[&str] = &[
    "OTHER",
    "RECITATION",
    "SAFETY",
    "BLOCKLIST",
    "PROHIBITED_CONTENT",
    "SPII",
];
