//! On-disk cache of raw wiki page text with a revision manifest.
//!
//! One `<key>.wiki` file per page plus a shared `manifest.json`. Page files
//! are written as soon as they are fetched; the manifest is only persisted
//! by [`PageCache::flush`], which callers run once per batch.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::CacheError;
use crate::names::cache_key;

pub const MANIFEST_FILENAME: &str = "manifest.json";
const MANIFEST_VERSION: u32 = 1;
const PAGE_EXTENSION: &str = "wiki";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WikiPageCacheEntry {
    pub normalized_key: String,
    pub page_id: i64,
    pub revision_id: i64,
    pub remote_timestamp: Option<DateTime<Utc>>,
    pub cached_at: DateTime<Utc>,
    pub content_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionMeta {
    pub page_id: i64,
    pub revision_id: i64,
    pub remote_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawWikiPage {
    pub normalized_key: String,
    pub source_text: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub files: usize,
    pub orphan_files: Vec<String>,
    pub missing_files: Vec<String>,
    pub total_bytes: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ManifestFile {
    version: u32,
    #[serde(default)]
    pages: BTreeMap<String, WikiPageCacheEntry>,
}

pub struct PageCache {
    dir: PathBuf,
    manifest: Mutex<BTreeMap<String, WikiPageCacheEntry>>,
    dirty: AtomicBool,
}

impl PageCache {
    /// Opens (creating if needed) the cache directory. An unreadable manifest
    /// yields an empty cache so the next crawl refetches everything.
    pub fn open(dir: &Path) -> Result<Self, CacheError> {
        fs::create_dir_all(dir)?;
        let manifest = load_manifest(&dir.join(MANIFEST_FILENAME));
        Ok(Self {
            dir: dir.to_path_buf(),
            manifest: Mutex::new(manifest),
            dirty: AtomicBool::new(false),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILENAME)
    }

    pub fn page_path(&self, key: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{PAGE_EXTENSION}", cache_key(key)))
    }

    pub fn len(&self) -> usize {
        self.lock_manifest().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has(&self, key: &str) -> bool {
        let key = cache_key(key);
        self.lock_manifest().contains_key(&key) && self.page_path(&key).is_file()
    }

    pub fn entry(&self, key: &str) -> Option<WikiPageCacheEntry> {
        self.lock_manifest().get(&cache_key(key)).cloned()
    }

    /// True when the cached copy is at `revision_id` and still on disk.
    pub fn is_current(&self, key: &str, revision_id: i64) -> bool {
        self.entry(key)
            .is_some_and(|entry| entry.revision_id == revision_id)
            && self.page_path(key).is_file()
    }

    pub fn get(&self, key: &str) -> Option<RawWikiPage> {
        let key = cache_key(key);
        let entry = self.entry(&key)?;
        let path = self.page_path(&key);
        let source_text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(error) => {
                warn!(key = %key, %error, "cached page unreadable; treating as not cached");
                return None;
            }
        };
        if compute_hash(&source_text) != entry.content_hash {
            warn!(key = %key, "cached page hash mismatch; treating as not cached");
            return None;
        }
        Some(RawWikiPage {
            normalized_key: key,
            source_text,
        })
    }

    /// Writes the page file and records it in the in-memory manifest. The
    /// manifest on disk is untouched until [`PageCache::flush`].
    pub fn put(&self, key: &str, text: &str, meta: &RevisionMeta) -> Result<(), CacheError> {
        let key = cache_key(key);
        let path = self.page_path(&key);
        write_atomically(&path, text.as_bytes()).map_err(|source| CacheError::WritePage {
            path: path.clone(),
            source,
        })?;

        let entry = WikiPageCacheEntry {
            normalized_key: key.clone(),
            page_id: meta.page_id,
            revision_id: meta.revision_id,
            remote_timestamp: meta.remote_timestamp,
            cached_at: Utc::now(),
            content_hash: compute_hash(text),
        };
        let mut manifest = self.lock_manifest();
        manifest.insert(key, entry);
        self.dirty.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Persists the manifest if anything changed since the last flush.
    /// Returns whether a write happened.
    pub fn flush(&self) -> Result<bool, CacheError> {
        let manifest = self.lock_manifest();
        if !self.dirty.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let file = ManifestFile {
            version: MANIFEST_VERSION,
            pages: manifest.clone(),
        };
        let rendered = serde_json::to_vec_pretty(&file)?;
        let path = self.manifest_path();
        write_atomically(&path, &rendered)
            .map_err(|source| CacheError::WriteManifest { path, source })?;
        self.dirty.store(false, Ordering::SeqCst);
        debug!(entries = manifest.len(), "cache manifest flushed");
        Ok(true)
    }

    pub fn stats(&self) -> Result<CacheStats, CacheError> {
        let manifest = self.lock_manifest().clone();
        let mut stats = CacheStats {
            entries: manifest.len(),
            ..CacheStats::default()
        };

        let mut on_disk = Vec::new();
        for entry in WalkDir::new(&self.dir).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|error| CacheError::Io(error.into()))?;
            let path = entry.path();
            if !entry.file_type().is_file()
                || path.extension().and_then(|ext| ext.to_str()) != Some(PAGE_EXTENSION)
            {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            stats.files += 1;
            stats.total_bytes += entry.metadata().map(|meta| meta.len()).unwrap_or(0);
            on_disk.push(stem.to_string());
        }

        for key in &on_disk {
            if !manifest.contains_key(key) {
                stats.orphan_files.push(key.clone());
            }
        }
        for key in manifest.keys() {
            if !on_disk.contains(key) {
                stats.missing_files.push(key.clone());
            }
        }
        stats.orphan_files.sort();
        Ok(stats)
    }

    /// Deletes page files that no manifest entry refers to.
    pub fn prune_orphans(&self) -> Result<Vec<String>, CacheError> {
        let stats = self.stats()?;
        for key in &stats.orphan_files {
            fs::remove_file(self.page_path(key))?;
        }
        Ok(stats.orphan_files)
    }

    fn lock_manifest(&self) -> MutexGuard<'_, BTreeMap<String, WikiPageCacheEntry>> {
        self.manifest.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn load_manifest(path: &Path) -> BTreeMap<String, WikiPageCacheEntry> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(_) => return BTreeMap::new(),
    };
    match serde_json::from_str::<ManifestFile>(&content) {
        Ok(file) => file.pages,
        Err(error) => {
            warn!(path = %path.display(), %error, "cache manifest unreadable; starting empty");
            BTreeMap::new()
        }
    }
}

pub(crate) fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut temp = path.as_os_str().to_owned();
    temp.push(".tmp");
    let temp = PathBuf::from(temp);
    fs::write(&temp, bytes)?;
    fs::rename(&temp, path)
}

pub fn compute_hash(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    let mut output = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}
