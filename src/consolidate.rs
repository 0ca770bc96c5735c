use std::collections::HashMap;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::constants::{ACTIVE_WAIT_ATTEMPTS, ACTIVE_WAIT_BACKOFF};
use crate::document::DocumentKey;
use crate::error::{Error, Result};
use crate::files::FileLister;
use crate::types::{Part, UploadedFile};

#[derive(Debug, Clone, PartialEq)]
pub struct GroupedFile {
    pub files: Vec<UploadedFile>,
}

impl GroupedFile {
    pub fn document_name(&self) -> &str {
        self.files
            .first()
            .map(|file| file.key.document_name())
            .unwrap_or_default()
    }

    pub fn page_count(&self) -> usize {
        self.files.len()
    }

    pub fn parts(&self) -> Vec<Part> {
        let mut parts = Vec::with_capacity(self.files.len() + 1);
        parts.push(Part::text(format!(
            "[Filename of the following file is {}. Total pages are {}.]",
            self.document_name(),
            self.page_count()
        )));
        parts.extend(self.files.iter().map(Part::file));
        parts
    }
}

/// Pages of one paged document share a group; blob and literal records always stand alone.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum GroupKey<'a> {
    Paged(&'a str),
    Record(usize),
}

impl<'a> GroupKey<'a> {
    fn of(position: usize, file: &'a UploadedFile) -> Self {
        match &file.key {
            DocumentKey::Paged { id, .. } => GroupKey::Paged(id.as_str()),
            DocumentKey::Blob { .. } | DocumentKey::Literal(_) => GroupKey::Record(position),
        }
    }
}

pub fn group_files(files: &[UploadedFile]) -> Vec<GroupedFile> {
    let mut groups: Vec<GroupedFile> = Vec::new();
    let mut index: HashMap<GroupKey<'_>, usize> = HashMap::new();
    for (position, file) in files.iter().enumerate() {
        let key = GroupKey::of(position, file);
        match index.get(&key) {
            Some(&slot) => groups[slot].files.push(file.clone()),
            None => {
                index.insert(key, groups.len());
                groups.push(GroupedFile {
                    files: vec![file.clone()],
                });
            }
        }
    }
    for group in &mut groups {
        group
            .files
            .sort_by_key(|file| file.key.page().unwrap_or(u32::MAX));
    }
    groups
}

pub fn flatten(groups: &[GroupedFile]) -> Vec<UploadedFile> {
    groups.iter().flat_map(|g| g.files.iter().cloned()).collect()
}

pub fn consolidate(files: &[UploadedFile]) -> Result<Vec<GroupedFile>> {
    if files.is_empty() {
        return Err(Error::InvalidInput("no files to consolidate".into()));
    }
    Ok(group_files(files))
}

#[derive(Debug, Clone, Copy)]
pub struct ActiveWait {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for ActiveWait {
    fn default() -> Self {
        Self {
            attempts: ACTIVE_WAIT_ATTEMPTS,
            backoff: ACTIVE_WAIT_BACKOFF,
        }
    }
}

/// Gives up with a warning after `wait.attempts` polls and returns the freshest records seen.
/// Files missing from the listing keep their previous record.
pub fn await_active(
    files: Vec<UploadedFile>,
    lister: &dyn FileLister,
    wait: ActiveWait,
) -> Result<Vec<UploadedFile>> {
    let mut files = files;
    for attempt in 1..=wait.attempts {
        let pending = files.iter().filter(|f| !f.state.is_terminal()).count();
        if pending == 0 {
            return Ok(files);
        }
        debug!(
            "{pending} file(s) still processing; poll {attempt}/{} in {:?}",
            wait.attempts, wait.backoff
        );
        thread::sleep(wait.backoff);
        let listing: HashMap<String, UploadedFile> = lister
            .list_files()?
            .into_iter()
            .map(|file| (file.name.clone(), file))
            .collect();
        files = files
            .into_iter()
            .map(|file| listing.get(&file.name).cloned().unwrap_or(file))
            .collect();
    }
    let pending: Vec<&str> = files
        .iter()
        .filter(|f| !f.state.is_terminal())
        .map(|f| f.name.as_str())
        .collect();
    if !pending.is_empty() {
        warn!(
            "files still processing after {} poll(s), continuing anyway: {}",
            wait.attempts,
            pending.join(", ")
        );
    }
    Ok(files)
}
