// SPDX-License-Identifier: GPL-2.0
//
// scx_cortex: Daemon pid file
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use log::warn;
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;

pub const DEFAULT_PID_FILE: &str = "/run/scx_cortex.pid";

/// Pid recorded in `path`, None if the file does not exist.
pub fn read_pid(path: &Path) -> Result<Option<i32>> {
    let text = match fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
    };
    let pid = text
        .trim()
        .parse()
        .with_context(|| format!("malformed pid file {}", path.display()))?;
    Ok(Some(pid))
}

/// EPERM still means the process exists.
pub fn is_alive(pid: i32) -> bool {
    pid > 0 && matches!(kill(Pid::from_raw(pid), None), Ok(()) | Err(Errno::EPERM))
}

/// Pid file owned by the running daemon, removed on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Record the current pid in `path`. Fails if the file names another
    /// process that is still running; a stale file is replaced.
    pub fn create(path: &Path) -> Result<Self> {
        let me = std::process::id() as i32;
        match read_pid(path) {
            Ok(Some(pid)) if pid != me && is_alive(pid) => {
                bail!(
                    "scx_cortex already running as pid {} ({})",
                    pid,
                    path.display()
                );
            }
            Ok(_) => {}
            Err(e) => warn!("ignoring unreadable pid file: {:#}", e),
        }

        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)
                    .with_context(|| format!("failed to create {}", dir.display()))?;
            }
        }
        fs::write(path, format!("{}\n", me))
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("failed to remove {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run/cortex.pid");
        {
            let _pf = PidFile::create(&path).unwrap();
            assert_eq!(read_pid(&path).unwrap(), Some(std::process::id() as i32));
        }
        assert!(!path.exists());
        assert_eq!(read_pid(&path).unwrap(), None);
    }

    #[test]
    fn refuses_live_owner() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cortex.pid");
        // pid 1 always exists.
        fs::write(&path, "1\n").unwrap();
        assert!(PidFile::create(&path).is_err());
        assert_eq!(read_pid(&path).unwrap(), Some(1));
    }

    #[test]
    fn replaces_stale_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cortex.pid");
        // Above PID_MAX_LIMIT, never a live process.
        fs::write(&path, "4194305\n").unwrap();
        let _pf = PidFile::create(&path).unwrap();
        assert_eq!(read_pid(&path).unwrap(), Some(std::process::id() as i32));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cortex.pid");
        fs::write(&path, "nope").unwrap();
        assert!(read_pid(&path).is_err());
    }
}
