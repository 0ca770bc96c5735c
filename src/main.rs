mod cli;

use anyhow::{bail, Context};
use clap::Parser;
use gemfiles::{
    ActiveWait, AppConfig, BatchItem, FileLister, GeminiClient, GenerateRequest, LocalFileResolver,
    TransferRequest, UploadOutcome,
};
use serde_json::Value;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = cli::Cli::parse();
    let cfg = AppConfig::load(cli.config.as_deref())?;
    let client = GeminiClient::from_config(&cfg)?;

    match cli.cmd {
        cli::Command::Upload {
            patterns,
            split_pages,
        } => {
            let paths = expand_patterns(&patterns)?;
            let items: Vec<BatchItem> = paths
                .iter()
                .map(|path| {
                    let item = BatchItem::reference(path.to_string_lossy());
                    if split_pages {
                        item.split_pages()
                    } else {
                        item
                    }
                })
                .collect();
            let files = client
                .batcher(Arc::new(LocalFileResolver::new()))?
                .upload(&items)?;
            println!("{}", serde_json::to_string_pretty(&files)?);
        }
        cli::Command::Transfer {
            source,
            transfer_id,
            abandon,
        } => {
            let mut request = if source.starts_with("http://") || source.starts_with("https://") {
                TransferRequest::url(source)
            } else {
                TransferRequest::drive(source)
            };
            if let Some(id) = transfer_id {
                request = request.with_transfer_id(id);
            }
            let uploader = client.resumable()?;
            if abandon {
                uploader.abandon(&request.transfer_id())?;
                println!("Dropped checkpoint {}", request.transfer_id());
                return Ok(());
            }
            match uploader.start(&request)? {
                UploadOutcome::Complete(file) => {
                    println!("{}", serde_json::to_string_pretty(&file)?)
                }
                UploadOutcome::Partial {
                    transfer_id,
                    next_chunk,
                    total_chunks,
                } => {
                    eprintln!(
                        "Transfer {transfer_id} paused at chunk {}/{total_chunks}; run the same command again to continue.",
                        next_chunk + 1
                    );
                }
            }
        }
        cli::Command::List => {
            let files = client.files().list_files()?;
            for file in &files {
                println!("{}\t{}\t{:?}", file.name, file.display_name(), file.state);
            }
            eprintln!("{} file(s)", files.len());
        }
        cli::Command::Delete { names } => {
            let results = client.files().delete_files(&names, client.wave_size())?;
            let failed = results.iter().filter(|v| v.get("error").is_some()).count();
            println!("{} deleted, {} failed", results.len() - failed, failed);
        }
        cli::Command::Ask {
            question,
            files,
            schema,
            summary,
            usage,
        } => {
            let mut generator = client.generator();
            generator.config_mut().include_usage = usage;
            if !files.is_empty() {
                let api = client.files();
                let records = files
                    .iter()
                    .map(|name| api.get_file(name))
                    .collect::<Result<Vec<_>, _>>()?;
                let groups = client.consolidate(records, ActiveWait::default())?;
                generator = generator.with_files(groups);
            }
            let mut request = GenerateRequest::question(question);
            if let Some(path) = schema {
                let text = fs::read_to_string(&path)
                    .with_context(|| format!("reading schema {}", path.display()))?;
                let value: Value = serde_json::from_str(&text)
                    .with_context(|| format!("parsing schema {}", path.display()))?;
                request = request.with_schema(value.clone());
                generator.config_mut().response_schema = Some(value);
            }

            let generation = generator.generate(&request)?;
            println!("{}", generation.output);
            if let Some(usage) = generation.usage {
                eprintln!("tokens: {}", serde_json::to_string(&usage)?);
            }
            if let Some(path) = summary {
                client.monitor().flush_summary(&path)?;
            }
        }
    }

    Ok(())
}

fn expand_patterns(patterns: &[String]) -> anyhow::Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for pattern in patterns {
        let before = paths.len();
        for entry in glob::glob(pattern).with_context(|| format!("bad pattern {pattern}"))? {
            let path = entry?;
            if path.is_file() {
                paths.push(path);
            }
        }
        if paths.len() == before {
            bail!("no files match {pattern}");
        }
    }
    Ok(paths)
}
