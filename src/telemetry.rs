use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use serde_json::{json, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::utils::ensure_dir;

#[derive(Debug, Clone, Serialize)]
pub struct RequestEvent {
    pub model: String,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub finished_at: OffsetDateTime,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
    pub retries: u32,
    pub function_rounds: usize,
}

impl RequestEvent {
    pub fn duration_seconds(&self) -> f64 {
        (self.finished_at - self.started_at).as_seconds_f64().max(0.0)
    }

    /// Falls back to input + output when the service omitted a total.
    fn billed_tokens(&self) -> u64 {
        self.total_tokens.map(u64::from).unwrap_or_else(|| {
            u64::from(self.input_tokens.unwrap_or(0)) + u64::from(self.output_tokens.unwrap_or(0))
        })
    }
}

#[derive(Debug, Default, Clone, Serialize, PartialEq)]
pub struct Tally {
    pub requests: usize,
    pub retries: u64,
    pub function_rounds: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub seconds: f64,
}

impl Tally {
    fn add(&mut self, event: &RequestEvent) {
        self.requests += 1;
        self.retries += u64::from(event.retries);
        self.function_rounds += event.function_rounds as u64;
        self.input_tokens += u64::from(event.input_tokens.unwrap_or(0));
        self.output_tokens += u64::from(event.output_tokens.unwrap_or(0));
        self.total_tokens += event.billed_tokens();
        self.seconds += event.duration_seconds();
    }
}

#[derive(Debug, Default, Serialize)]
pub struct RunSummary {
    pub total: Tally,
    pub by_model: BTreeMap<String, Tally>,
    /// Occurrences per note name, e.g. `retry.generateContent`.
    pub notes: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Serialize)]
struct Note {
    name: String,
    payload: Value,
    #[serde(with = "time::serde::rfc3339")]
    at: OffsetDateTime,
}

#[derive(Default)]
struct Ledger {
    events: Vec<RequestEvent>,
    notes: Vec<Note>,
}

#[derive(Clone, Default)]
pub struct RunMonitor {
    ledger: Arc<Mutex<Ledger>>,
}

impl RunMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record(&self, event: RequestEvent) {
        self.ledger().events.push(event);
    }

    pub fn note_event(&self, name: &str, payload: Value) {
        self.ledger().notes.push(Note {
            name: name.to_string(),
            payload,
            at: OffsetDateTime::now_utc(),
        });
    }

    pub fn events(&self) -> Vec<RequestEvent> {
        self.ledger().events.clone()
    }

    pub fn note_names(&self) -> Vec<String> {
        self.ledger().notes.iter().map(|n| n.name.clone()).collect()
    }

    pub fn summarize(&self) -> RunSummary {
        let ledger = self.ledger();
        let mut summary = RunSummary::default();
        for event in &ledger.events {
            summary.total.add(event);
            summary
                .by_model
                .entry(event.model.clone())
                .or_default()
                .add(event);
        }
        for note in &ledger.notes {
            *summary.notes.entry(note.name.clone()).or_default() += 1;
        }
        summary
    }

    fn window(&self) -> Option<(OffsetDateTime, OffsetDateTime)> {
        let ledger = self.ledger();
        let start = ledger.events.iter().map(|e| e.started_at).min()?;
        let end = ledger.events.iter().map(|e| e.finished_at).max()?;
        Some((start, end.max(start)))
    }

    pub fn flush_summary(&self, to: &Path) -> anyhow::Result<()> {
        if let Some(parent) = to.parent() {
            ensure_dir(parent)?;
        }
        let summary = self.summarize();
        let window = match self.window() {
            Some((start, end)) => json!({
                "start": start.format(&Rfc3339)?,
                "end": end.format(&Rfc3339)?,
                "elapsed_sec": (end - start).as_seconds_f64(),
            }),
            None => Value::Null,
        };
        let notes = self.ledger().notes.clone();
        let document = json!({
            "summary": summary,
            "window": window,
            "notes": notes,
        });
        fs::write(to, serde_json::to_vec_pretty(&document)?)?;
        Ok(())
    }
}
