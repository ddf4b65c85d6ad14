//! Segment descriptors and the sliding window shared by the HLS and DASH
//! segmenters. Files are written to a temp path and renamed into place so
//! players never observe a partial segment.

use crate::error::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// One media fragment on disk.
#[derive(Debug, Clone)]
pub struct Fragment {
    /// Final path; the in-progress file lives at [Fragment::tmppath].
    path: PathBuf,
    /// Monotonic per-track sequence number.
    pub number: u64,
    /// Start DTS, ms.
    pub start_dts: i64,
    /// Duration, ms.
    pub duration: i64,
}

impl Fragment {
    pub fn new(path: PathBuf, number: u64, start_dts: i64) -> Self {
        Self {
            path,
            number,
            start_dts,
            duration: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn tmppath(&self) -> PathBuf {
        let mut p = self.path.as_os_str().to_owned();
        p.push(".tmp");
        PathBuf::from(p)
    }

    /// Grows the duration to cover a frame at `dts`.
    pub fn append(&mut self, dts: i64) {
        if dts > self.start_dts {
            self.duration = (dts - self.start_dts).max(self.duration);
        }
    }

    /// Atomically publishes the temp file at the final path.
    pub fn rename(&self) -> Result<()> {
        fs::rename(self.tmppath(), &self.path)
            .map_err(|e| Error::Io(format!("rename {}: {}", self.path.display(), e)))
    }

    /// Removes the fragment file, both temp and final, best-effort.
    pub fn unlink(&self) {
        let _ = fs::remove_file(self.tmppath());
        let _ = fs::remove_file(&self.path);
    }
}

/// The most recent fragments advertised in a live manifest.
#[derive(Debug, Default)]
pub struct FragmentWindow {
    fragments: Vec<Fragment>,
}

impl FragmentWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, fragment: Fragment) {
        self.fragments.push(fragment);
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    pub fn first(&self) -> Option<&Fragment> {
        self.fragments.first()
    }

    pub fn last(&self) -> Option<&Fragment> {
        self.fragments.last()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Fragment> {
        self.fragments.iter()
    }

    /// Total duration of the fragments in the window, ms.
    pub fn duration(&self) -> i64 {
        self.fragments.iter().map(|f| f.duration).sum()
    }

    /// Shrinks the window to at most `max_duration_ms`, expiring from the
    /// front; expired fragments are deleted from disk when `cleanup` is set.
    pub fn shrink(&mut self, max_duration_ms: i64, cleanup: bool) {
        while self.fragments.len() > 1 && self.duration() > max_duration_ms {
            let expired = self.fragments.remove(0);
            if cleanup {
                expired.unlink();
            }
        }
    }

    /// Drops everything, deleting files when `cleanup` is set.
    pub fn dispose(&mut self, cleanup: bool) {
        if cleanup {
            for f in &self.fragments {
                f.unlink();
            }
        }
        self.fragments.clear();
    }
}
