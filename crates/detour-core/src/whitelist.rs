//! Detour whitelist
//!
//! The set of destinations (`host:port`) known to need the detour path.
//! Connections to a whitelisted address skip the race and dial detour only.
//!
//! Entries are either temporary (learned during this process, e.g. after a
//! tampered direct dial) or permanent (confirmed by a detour connection that
//! worked, or imported from a file). Only permanent entries are persisted.
//!
//! File format:
//! - One `host:port` per line
//! - Lines starting with # are comments
//! - Empty lines are ignored

use dashmap::DashMap;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy)]
struct Entry {
    permanent: bool,
}

/// Concurrent set of addresses that should be detoured
///
/// Lookups are lock-free with respect to other addresses; operations on a
/// single address are serialized by the owning shard.
#[derive(Debug, Default)]
pub struct Whitelist {
    entries: DashMap<String, Entry>,
    /// Source file path used by [`Whitelist::save`]
    file_path: RwLock<Option<PathBuf>>,
}

impl Whitelist {
    /// Create an empty whitelist
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a whitelist with initial permanent entries
    pub fn with_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let wl = Self::new();
        wl.import(entries);
        wl
    }

    /// Create a whitelist from a file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let wl = Self::new();
        wl.load_file(path)?;
        Ok(wl)
    }

    /// True if `addr` has any entry, temporary or permanent
    pub fn contains(&self, addr: &str) -> bool {
        self.entries.contains_key(addr)
    }

    /// True if `addr` is whitelisted for this process only
    pub fn is_temporary(&self, addr: &str) -> bool {
        self.entries.get(addr).map_or(false, |e| !e.permanent)
    }

    /// True if `addr` has a permanent entry
    pub fn is_permanent(&self, addr: &str) -> bool {
        self.entries.get(addr).map_or(false, |e| e.permanent)
    }

    /// Add `addr`, upgrading a temporary entry when `permanent` is set.
    ///
    /// A permanent entry is never downgraded.
    pub fn add(&self, addr: &str, permanent: bool) {
        self.entries
            .entry(addr.to_string())
            .and_modify(|e| e.permanent |= permanent)
            .or_insert_with(|| {
                debug!(addr, permanent, "Adding to whitelist");
                Entry { permanent }
            });
    }

    /// Remove `addr` if present
    pub fn remove(&self, addr: &str) {
        if self.entries.remove(addr).is_some() {
            debug!(addr, "Removed from whitelist");
        }
    }

    /// Add permanent entries, returning how many were given
    pub fn import<I, S>(&self, entries: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut count = 0;
        for addr in entries {
            let addr = addr.as_ref().trim();
            if addr.is_empty() || addr.starts_with('#') {
                continue;
            }
            self.add(addr, true);
            count += 1;
        }
        count
    }

    /// Permanent entries, sorted
    pub fn permanent_entries(&self) -> Vec<String> {
        let mut result: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.value().permanent)
            .map(|e| e.key().clone())
            .collect();
        result.sort();
        result
    }

    /// All entries with their permanent flag, sorted by address
    pub fn entries(&self) -> Vec<(String, bool)> {
        let mut result: Vec<(String, bool)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().permanent))
            .collect();
        result.sort();
        result
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the whitelist is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every entry
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Load permanent entries from a file, remembering the path for [`Whitelist::save`]
    pub fn load_file<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::whitelist(path.display().to_string(), e.to_string()))?;

        *self.file_path.write() = Some(path.to_path_buf());

        let mut count = 0;
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if !is_host_port(line) {
                warn!("Skipping malformed whitelist entry '{}' in {}", line, path.display());
                continue;
            }
            self.add(line, true);
            count += 1;
        }

        info!("Loaded {} whitelist entries from {}", count, path.display());
        Ok(count)
    }

    /// Save permanent entries to a file
    pub fn save_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let entries = self.permanent_entries();

        let mut content = String::new();
        content.push_str("# Detour whitelist\n");
        content.push_str("#\n");
        content.push_str("# One host:port per line\n");
        content.push_str("# Lines starting with # are comments\n");
        content.push_str("#\n\n");
        for addr in &entries {
            content.push_str(addr);
            content.push('\n');
        }

        std::fs::write(path, content)
            .map_err(|e| Error::whitelist(path.display().to_string(), e.to_string()))?;
        *self.file_path.write() = Some(path.to_path_buf());

        info!("Saved {} whitelist entries to {}", entries.len(), path.display());
        Ok(())
    }

    /// Save to the file this whitelist was loaded from or last saved to.
    ///
    /// Returns `false` when no file is associated.
    pub fn save(&self) -> Result<bool> {
        let file_path = self.file_path.read().clone();
        let Some(path) = file_path else {
            return Ok(false);
        };
        self.save_file(&path)?;
        Ok(true)
    }

    /// Associate a file without loading it
    pub fn set_file<P: AsRef<Path>>(&self, path: P) {
        *self.file_path.write() = Some(path.as_ref().to_path_buf());
    }

    /// The associated file, if any
    pub fn file(&self) -> Option<PathBuf> {
        self.file_path.read().clone()
    }
}

/// Loose `host:port` check for file entries
fn is_host_port(s: &str) -> bool {
    match s.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}
