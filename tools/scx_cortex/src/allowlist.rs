// SPDX-License-Identifier: GPL-2.0
//
// scx_cortex: Known inference process names
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use log::{debug, warn};
use rustc_hash::FxHashSet;

/// Length of a kernel task comm including the trailing NUL.
pub const COMM_LEN: usize = 16;

/// Allowlist capacity.
pub const MAX_KNOWN_PROCESSES: usize = 64;

/// NUL padded executable name as the kernel reports it.
pub type CommKey = [u8; COMM_LEN];

/// Inference servers recognized out of the box.
pub const DEFAULT_KNOWN_PROCESSES: &[&str] = &[
    "ollama",
    "llama-server",
    "llama-cli",
    "vllm",
    "tritonserver",
    "text-generation-launcher",
    "koboldcpp",
    "local-ai",
    "whisper-server",
];

/// Build a comm key: at most 15 bytes of `name`, stopping at the first NUL,
/// zero padded.
pub fn comm_key(name: &[u8]) -> CommKey {
    let mut key = [0u8; COMM_LEN];
    let len = name
        .iter()
        .take(COMM_LEN - 1)
        .position(|&b| b == 0)
        .unwrap_or_else(|| name.len().min(COMM_LEN - 1));
    key[..len].copy_from_slice(&name[..len]);
    key
}

/// Printable form of a comm key.
pub fn comm_str(key: &CommKey) -> String {
    let end = key.iter().position(|&b| b == 0).unwrap_or(COMM_LEN);
    String::from_utf8_lossy(&key[..end]).into_owned()
}

#[derive(Debug, thiserror::Error)]
pub enum AllowlistError {
    #[error("allowlist full ({MAX_KNOWN_PROCESSES} entries), cannot add {0:?}")]
    Full(String),
    #[error("empty process name")]
    Empty,
}

/// Set of executable names whose exec marks a process as inference.
///
/// Built before the handlers start and swapped wholesale afterwards, so the
/// handlers only ever read it.
#[derive(Clone, Debug, Default)]
pub struct KnownProcesses {
    names: FxHashSet<CommKey>,
}

impl KnownProcesses {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut known = Self::new();
        for name in DEFAULT_KNOWN_PROCESSES {
            // The default table is well below capacity.
            let _ = known.insert(name);
        }
        known
    }

    pub fn insert(&mut self, name: &str) -> Result<bool, AllowlistError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AllowlistError::Empty);
        }
        let key = comm_key(name.as_bytes());
        if self.names.contains(&key) {
            return Ok(false);
        }
        if self.names.len() >= MAX_KNOWN_PROCESSES {
            return Err(AllowlistError::Full(name.to_string()));
        }
        Ok(self.names.insert(key))
    }

    #[inline]
    pub fn contains(&self, comm: &CommKey) -> bool {
        self.names.contains(comm)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        let mut out: Vec<_> = self.names.iter().map(comm_str).collect();
        out.sort();
        out
    }

    /// Add names from `path`, one per line. Blank lines and text after `#`
    /// are ignored. Entries beyond capacity are skipped with a warning.
    pub fn load_file(&mut self, path: &Path) -> Result<usize> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read allowlist {}", path.display()))?;

        let mut added = 0;
        for (lineno, line) in text.lines().enumerate() {
            let name = line.split('#').next().unwrap_or("").trim();
            if name.is_empty() {
                continue;
            }
            match self.insert(name) {
                Ok(true) => added += 1,
                Ok(false) => debug!("{}:{}: duplicate {:?}", path.display(), lineno + 1, name),
                Err(e) => warn!("{}:{}: {}", path.display(), lineno + 1, e),
            }
        }
        Ok(added)
    }
}

/// Where the allowlist comes from: a fixed part (defaults and command line)
/// plus an optional file that is re-read when it changes.
#[derive(Clone, Debug)]
pub struct AllowlistSource {
    base: KnownProcesses,
    file: Option<PathBuf>,
    mtime: Option<SystemTime>,
}

impl AllowlistSource {
    pub fn new(base: KnownProcesses, file: Option<PathBuf>) -> Self {
        Self {
            base,
            file,
            mtime: None,
        }
    }

    fn file_mtime(&self) -> Option<SystemTime> {
        let file = self.file.as_ref()?;
        fs::metadata(file).and_then(|m| m.modified()).ok()
    }

    /// Build the full list and remember the file's modification time.
    pub fn load(&mut self) -> Result<KnownProcesses> {
        let mut known = self.base.clone();
        if let Some(file) = &self.file {
            known.load_file(file)?;
        }
        self.mtime = self.file_mtime();
        Ok(known)
    }

    /// Rebuild the list if the file changed since the last load.
    pub fn reload_if_changed(&mut self) -> Result<Option<KnownProcesses>> {
        if self.file.is_none() || self.file_mtime() == self.mtime {
            return Ok(None);
        }
        self.load().map(Some)
    }
}
