pub mod auth;
pub mod client;
pub mod config;
pub mod consolidate;
pub mod constants;
pub mod document;
pub mod error;
pub mod files;
pub mod generate;
pub mod http;
pub mod source;
pub mod store;
pub mod telemetry;
pub mod types;
pub mod upload;
pub mod utils;

#[cfg(test)]
mod testing;

pub use auth::{Credentials, ServiceAccount, ServiceAccountKey, StaticToken, TokenProvider};
pub use client::{Endpoints, GeminiClient};
pub use config::AppConfig;
pub use consolidate::{await_active, consolidate, group_files, ActiveWait, GroupedFile};
pub use document::DocumentKey;
pub use error::{Error, Result};
pub use files::{FileLister, FilesApi};
pub use generate::{
    FunctionTable, GenerateRequest, Generation, GenerationConfig, Generator, Output, OutputShape,
    RetryPolicy,
};
pub use http::{BatchExecutor, HttpRequest, HttpResponse, ReqwestExecutor};
pub use source::{Blob, BlobResolver, DriveResolver, LocalFileResolver, PageRenderer, PdftoppmRenderer};
pub use store::{CheckpointStore, FileStore, MemoryStore};
pub use telemetry::RunMonitor;
pub use types::{Content, FileState, Part, Role, UploadedFile};
pub use upload::{
    BatchItem, Clock, ResumableUploader, SystemClock, TransferRequest, TransferSource,
    UploadBatcher, UploadOutcome,
};
