// Mount Activity Log (rmtab)
//
// One `host:path` line per mounted export, sorted by host then path. The
// file is shared by all workers: each re-reads it when its modification
// time or inode changed and rewrites it through a temporary file. Two workers
// writing at the same instant may lose one update; there is no locking.

use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::fs;
use std::io::{ErrorKind, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};

use crate::protocol::v2::mount::MountBody;

/// Longer lines are not valid entries and are skipped on read
const MAX_LINE: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct RmtabEntry {
    host: String,
    path: String,
}

/// In-memory copy of the activity log
#[derive(Debug)]
pub struct Rmtab {
    path: PathBuf,
    entries: BTreeSet<RmtabEntry>,
    /// File version when it was last read or written
    stamp: Option<Stamp>,
}

/// Identifies one version of the file
///
/// Writers rename a new file into place, so the inode changes even when
/// two writes land within the timestamp granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Stamp {
    ino: u64,
    mtime: Option<SystemTime>,
}

impl Stamp {
    fn of(meta: &fs::Metadata) -> Self {
        Stamp {
            ino: meta.ino(),
            mtime: meta.modified().ok(),
        }
    }
}

impl Rmtab {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Rmtab {
            path: path.into(),
            entries: BTreeSet::new(),
            stamp: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Note that `host` mounted `path`
    pub fn record_mount(&mut self, host: &str, path: &str) -> Result<()> {
        self.refresh()?;
        let entry = RmtabEntry {
            host: host.to_string(),
            path: path.to_string(),
        };
        if self.entries.insert(entry) {
            debug!("rmtab: added {}:{}", host, path);
            self.save()?;
        }
        Ok(())
    }

    /// Forget one mount of `host`
    pub fn remove_mount(&mut self, host: &str, path: &str) -> Result<()> {
        self.refresh()?;
        let entry = RmtabEntry {
            host: host.to_string(),
            path: path.to_string(),
        };
        if self.entries.remove(&entry) {
            debug!("rmtab: removed {}:{}", host, path);
            self.save()?;
        }
        Ok(())
    }

    /// Forget every mount of `host`
    pub fn remove_all_mounts(&mut self, host: &str) -> Result<()> {
        self.refresh()?;
        let before = self.entries.len();
        self.entries.retain(|e| e.host != host);
        if self.entries.len() != before {
            debug!("rmtab: removed {} entries of {}", before - self.entries.len(), host);
            self.save()?;
        }
        Ok(())
    }

    /// Current mounts, sorted by host then path
    pub fn list_mounts(&mut self) -> Result<Vec<MountBody>> {
        self.refresh()?;
        Ok(self
            .entries
            .iter()
            .map(|e| MountBody {
                hostname: e.host.clone(),
                directory: e.path.clone(),
            })
            .collect())
    }

    /// Re-read the file if another writer changed it since we last looked
    fn refresh(&mut self) -> Result<()> {
        let meta = match fs::metadata(&self.path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.entries.clear();
                self.save()?;
                return Ok(());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to stat {}", self.path.display()));
            }
        };
        let stamp = Stamp::of(&meta);
        if self.stamp == Some(stamp) {
            return Ok(());
        }

        let text = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        self.entries = parse(&text);
        self.stamp = Some(stamp);
        debug!("rmtab: loaded {} entries", self.entries.len());
        Ok(())
    }

    fn save(&mut self) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        let mut out = String::new();
        for e in &self.entries {
            out.push_str(&e.host);
            out.push(':');
            out.push_str(&e.path);
            out.push('\n');
        }

        let write = || -> std::io::Result<()> {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(out.as_bytes())?;
            file.sync_all()?;
            fs::rename(&tmp, &self.path)
        };
        write().with_context(|| format!("Failed to write {}", self.path.display()))?;

        self.stamp = fs::metadata(&self.path).ok().map(|m| Stamp::of(&m));
        Ok(())
    }
}

fn parse(text: &str) -> BTreeSet<RmtabEntry> {
    let mut entries = BTreeSet::new();
    for line in text.lines() {
        if line.len() > MAX_LINE {
            warn!("rmtab: skipping overlong line");
            continue;
        }
        let Some((host, path)) = line.split_once(':') else {
            continue;
        };
        if host.is_empty() || path.is_empty() {
            continue;
        }
        entries.insert(RmtabEntry {
            host: host.to_string(),
            path: path.to_string(),
        });
    }
    entries
}
