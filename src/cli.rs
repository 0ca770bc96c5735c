use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "gemfiles",
    version,
    about = "Upload files to Gemini and ask questions about them"
)]
pub struct Cli {
    /// YAML config file (defaults to ./gemfiles.yaml when present)
    #[arg(long, global = true)]
    pub config: Option<String>,
    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Upload local files matching glob patterns in parallel waves
    Upload {
        #[arg(required = true)]
        patterns: Vec<String>,
        /// Render PDFs to one image per page
        #[arg(long, default_value_t = false)]
        split_pages: bool,
    },
    /// Chunked, resumable transfer of a large Drive file or URL
    Transfer {
        /// Drive file id, or an http(s) URL that supports range requests
        source: String,
        /// Checkpoint slot; defaults to a digest of the source
        #[arg(long)]
        transfer_id: Option<String>,
        /// Drop the checkpoint for this transfer instead of running it
        #[arg(long, default_value_t = false)]
        abandon: bool,
    },
    /// List files held by the service
    List,
    /// Delete files by remote name (files/...)
    Delete {
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Ask a question, optionally about uploaded files
    Ask {
        question: String,
        /// Remote file name to attach; repeatable
        #[arg(long = "file")]
        files: Vec<String>,
        /// JSON schema the answer must follow
        #[arg(long)]
        schema: Option<PathBuf>,
        /// Write a run summary (requests, tokens, retries) to this path
        #[arg(long)]
        summary: Option<PathBuf>,
        #[arg(long, default_value_t = false)]
        usage: bool,
    },
}
