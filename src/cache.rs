//! Content-addressed cache of raw result pages.
//!
//! Each entry is one file named after the SHA-256 fingerprint of the
//! job, holding the raw response body, optionally zlib-compressed. The
//! compression flag is run-wide; an entry written under the other flag is
//! unreadable, gets deleted and counts as a miss. Entries older than the
//! TTL are misses too and are removed by [`CacheStore::purge_expired`].

use std::fmt;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::job::Job;
use crate::Result;

/// File suffix of cache entries.
pub const CACHE_SUFFIX: &str = "cache";

/// Stable digest identifying one cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// SHA-256 over `query`, engine base URL, transport tag and page number.
    pub fn new(query: &str, base_url: &str, transport_tag: &str, page: u32) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(query.as_bytes());
        hasher.update(base_url.as_bytes());
        hasher.update(transport_tag.as_bytes());
        hasher.update(page.to_string().as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn for_job(job: &Job) -> Self {
        let base_url = job.engine.profile().base_url(job.method.is_http());
        Self::new(&job.query, base_url, job.method.tag(), job.page)
    }

    /// Lowercase hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `<hex>.cache`
    pub fn file_name(&self) -> String {
        format!("{}.{}", self.0, CACHE_SUFFIX)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of a cache lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    Hit(Vec<u8>),
    Miss,
}

/// On-disk cache directory.
#[derive(Debug, Clone)]
pub struct CacheStore {
    dir: PathBuf,
    compress: bool,
    ttl: Duration,
}

impl CacheStore {
    pub fn new(dir: impl Into<PathBuf>, compress: bool, ttl: Duration) -> Self {
        Self {
            dir: dir.into(),
            compress,
            ttl,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.dir.join(fingerprint.file_name())
    }

    /// Looks up an entry. Unreadable or expired entries are misses.
    pub async fn lookup(&self, fingerprint: &Fingerprint) -> CacheLookup {
        self.lookup_at(fingerprint, SystemTime::now()).await
    }

    /// Looks up an entry as if the current time were `now`.
    pub async fn lookup_at(&self, fingerprint: &Fingerprint, now: SystemTime) -> CacheLookup {
        let path = self.path_for(fingerprint);
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(_) => return CacheLookup::Miss,
        };
        if self.is_expired(metadata.modified().ok(), now) {
            debug!("Cache entry {} expired", fingerprint);
            return CacheLookup::Miss;
        }

        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Cache entry {} unreadable: {}", fingerprint, e);
                return CacheLookup::Miss;
            }
        };
        match self.decode(&raw) {
            Some(body) => CacheLookup::Hit(body),
            None => {
                warn!(
                    "Cache entry {} does not match compression setting, discarding",
                    fingerprint
                );
                let _ = tokio::fs::remove_file(&path).await;
                CacheLookup::Miss
            }
        }
    }

    /// Writes an entry, replacing any previous content.
    pub async fn store(&self, fingerprint: &Fingerprint, body: &[u8]) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let payload = if self.compress {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(body)?;
            encoder.finish()?
        } else {
            body.to_vec()
        };
        tokio::fs::write(self.path_for(fingerprint), payload).await?;
        Ok(())
    }

    /// Removes expired entries. Returns how many were deleted.
    pub async fn purge_expired(&self) -> Result<usize> {
        self.purge_expired_at(SystemTime::now()).await
    }

    /// Removes entries that are expired at `now`.
    pub async fn purge_expired_at(&self, now: SystemTime) -> Result<usize> {
        self.remove_where(|modified| self.is_expired(modified, now)).await
    }

    /// Removes every entry.
    pub async fn clear(&self) -> Result<usize> {
        self.remove_where(|_| true).await
    }

    async fn remove_where<F>(&self, predicate: F) -> Result<usize>
    where
        F: Fn(Option<SystemTime>) -> bool,
    {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(CACHE_SUFFIX) {
                continue;
            }
            let modified = entry.metadata().await.ok().and_then(|m| m.modified().ok());
            if predicate(modified) {
                tokio::fs::remove_file(&path).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            debug!("Removed {} cache entries from {}", removed, self.dir.display());
        }
        Ok(removed)
    }

    fn is_expired(&self, modified: Option<SystemTime>, now: SystemTime) -> bool {
        match modified {
            Some(modified) => now
                .duration_since(modified)
                .map(|age| age > self.ttl)
                .unwrap_or(false),
            None => true,
        }
    }

    fn decode(&self, raw: &[u8]) -> Option<Vec<u8>> {
        if self.compress {
            let mut body = Vec::new();
            ZlibDecoder::new(raw).read_to_end(&mut body).ok()?;
            Some(body)
        } else if looks_like_zlib(raw) {
            None
        } else {
            Some(raw.to_vec())
        }
    }
}

/// Checks for a zlib stream header (CMF/FLG pair).
fn looks_like_zlib(data: &[u8]) -> bool {
    match data {
        [cmf, flg, ..] => cmf & 0x0f == 8 && (u16::from(*cmf) << 8 | u16::from(*flg)) % 31 == 0,
        _ => false,
    }
}
