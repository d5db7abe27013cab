use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use tempfile::NamedTempFile;

use crate::caching::ResourceKey;
use crate::metric;
use crate::types::Payload;

/// The persisted cache tier.
///
/// A cached resource consists of two co-located files under the key's
/// sharded [`relative_path`](ResourceKey::relative_path): the raw body and
/// the response headers serialized as a JSON list. A record exists only while
/// both halves do, so torn writes and partial deletions read as misses.
#[derive(Debug, Clone)]
pub struct DiskCache {
    /// Directory storing the cache records.
    cache_dir: PathBuf,

    /// Directory for temporary files.
    ///
    /// New records are first written to a temporary file in a sibling
    /// directory, and atomically moved into their final location within
    /// [`cache_dir`](Self::cache_dir) once fully written.
    tmp_dir: PathBuf,
}

/// A record located in the disk cache, not yet validated or loaded.
#[derive(Debug)]
pub struct DiskRecord {
    body_path: PathBuf,
    headers_path: PathBuf,
    mtime: SystemTime,
}

impl DiskRecord {
    /// The time the record was written.
    pub fn last_modified(&self) -> SystemTime {
        self.mtime
    }

    /// Validates the record's age against a TTL.
    ///
    /// `None` and a zero duration both disable expiry, matching the
    /// "`ttl <= 0` caches indefinitely" contract of the load options.
    pub fn is_valid(&self, ttl: Option<Duration>) -> bool {
        // `mtime` is the only reliable timestamp across filesystems;
        // creation time does not exist everywhere and atime is usually
        // mounted away.
        match ttl {
            None => true,
            Some(ttl) if ttl.is_zero() => true,
            Some(ttl) => self.mtime.elapsed().unwrap_or_default() < ttl,
        }
    }
}

impl DiskCache {
    /// Opens the disk cache rooted at `cache_dir`, creating the directory
    /// and its temp sibling if needed.
    pub fn new(cache_dir: impl Into<PathBuf>) -> io::Result<Self> {
        let cache_dir = cache_dir.into();
        let tmp_dir = cache_dir.join("tmp");
        std::fs::create_dir_all(&cache_dir)?;
        std::fs::create_dir_all(&tmp_dir)?;
        Ok(Self { cache_dir, tmp_dir })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn body_path(&self, key: &ResourceKey) -> PathBuf {
        self.cache_dir.join(format!("{}.body", key.relative_path()))
    }

    fn headers_path(&self, key: &ResourceKey) -> PathBuf {
        self.cache_dir
            .join(format!("{}.headers", key.relative_path()))
    }

    /// Locates the record for `key` without reading its contents.
    ///
    /// Returns `None` if either half of the record is missing. I/O errors
    /// other than absence are logged and also reported as a miss.
    pub fn read(&self, key: &ResourceKey) -> Option<DiskRecord> {
        let body_path = self.body_path(key);
        let headers_path = self.headers_path(key);

        let located = catch_not_found(|| {
            let metadata = body_path.metadata()?;
            let mtime = metadata.modified()?;
            // Both halves must exist for the record to count.
            headers_path.metadata()?;
            Ok(DiskRecord {
                body_path: body_path.clone(),
                headers_path: headers_path.clone(),
                mtime,
            })
        });

        match located {
            Ok(record) => record,
            Err(err) => {
                let stderr: &dyn std::error::Error = &err;
                tracing::error!(error = stderr, "Failed to read cache record");
                None
            }
        }
    }

    /// Reads the record's contents back into a [`Payload`].
    pub fn load(&self, record: &DiskRecord) -> io::Result<Payload> {
        let body = std::fs::read(&record.body_path)?;
        let headers = std::fs::read(&record.headers_path)?;
        let headers: Vec<String> = serde_json::from_slice(&headers)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(Payload::new(Bytes::from(body), headers))
    }

    /// Validates and loads the record for `key` in one step.
    ///
    /// An expired record is deleted before absence is reported, so the fetch
    /// that follows never observes stale data. Unreadable or corrupt records
    /// degrade to a miss the same way.
    pub fn open(&self, key: &ResourceKey, ttl: Option<Duration>) -> Option<Payload> {
        let record = self.read(key)?;

        if !record.is_valid(ttl) {
            metric!(counter("cache.disk.expired") += 1);
            tracing::debug!("Evicting expired cache record `{key}`");
            if let Err(err) = self.invalidate(key) {
                let stderr: &dyn std::error::Error = &err;
                tracing::error!(error = stderr, "Failed to evict expired cache record");
            }
            return None;
        }

        match self.load(&record) {
            Ok(payload) => Some(payload),
            Err(err) => {
                let stderr: &dyn std::error::Error = &err;
                tracing::error!(error = stderr, "Failed to load cache record, evicting");
                self.invalidate(key).ok();
                None
            }
        }
    }

    /// Persists a payload as the record for `key`.
    ///
    /// Both halves are staged as temporary files and moved into place, body
    /// first. If anything fails, whatever made it into the cache directory
    /// is removed again before the error propagates, so `read` never judges
    /// a partial record present.
    pub fn write(&self, key: &ResourceKey, payload: &Payload) -> io::Result<()> {
        if let Err(err) = self.write_inner(key, payload) {
            self.invalidate(key).ok();
            return Err(err);
        }
        Ok(())
    }

    fn write_inner(&self, key: &ResourceKey, payload: &Payload) -> io::Result<()> {
        let body_path = self.body_path(key);
        let headers_path = self.headers_path(key);
        if let Some(parent) = body_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let body_file = self.tempfile()?;
        std::fs::write(body_file.path(), &payload.body)?;

        let headers_file = self.tempfile()?;
        let headers = serde_json::to_vec(&payload.headers)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        std::fs::write(headers_file.path(), headers)?;

        body_file.persist(&body_path).map_err(|e| e.error)?;
        headers_file.persist(&headers_path).map_err(|e| e.error)?;

        Ok(())
    }

    /// Removes the record for `key`. Missing halves are not an error.
    pub fn invalidate(&self, key: &ResourceKey) -> io::Result<()> {
        catch_not_found(|| std::fs::remove_file(self.body_path(key)))?;
        catch_not_found(|| std::fs::remove_file(self.headers_path(key)))?;
        Ok(())
    }

    /// Removes every record and starts over with an empty cache directory.
    pub fn clear(&self) -> io::Result<()> {
        std::fs::remove_dir_all(&self.cache_dir)?;
        std::fs::create_dir_all(&self.cache_dir)?;
        std::fs::create_dir_all(&self.tmp_dir)?;
        Ok(())
    }

    /// Creates a new temporary file in the cache's temp directory.
    fn tempfile(&self) -> io::Result<NamedTempFile> {
        // Cache cleanup could remove the directories we are operating in,
        // so retry the fs operations.
        const MAX_RETRIES: usize = 2;
        let mut retries = 0;
        loop {
            retries += 1;

            if let Err(e) = std::fs::create_dir_all(&self.tmp_dir) {
                tracing::error!("Failed to create cache directory: {:?}", e);
                if retries > MAX_RETRIES {
                    return Err(e);
                }
                continue;
            }

            match tempfile::Builder::new()
                .prefix("tmp")
                .tempfile_in(&self.tmp_dir)
            {
                Ok(temp_file) => return Ok(temp_file),
                Err(e) => {
                    tracing::error!("Failed to create cache file: {:?}", e);
                    if retries > MAX_RETRIES {
                        return Err(e);
                    }
                    continue;
                }
            }
        }
    }
}

fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}

#[cfg(test)]
mod tests {
    use filetime::FileTime;

    use super::*;

    fn payload() -> Payload {
        Payload::new(
            Bytes::from_static(b"hello world"),
            vec![
                "Content-Type: image/png".to_string(),
                "ETag: \"abc123\"".to_string(),
            ],
        )
    }

    fn key(name: &str) -> ResourceKey {
        ResourceKey::for_testing(name)
    }

    fn age(cache: &DiskCache, key: &ResourceKey, by: Duration) {
        let record = cache.read(key).unwrap();
        let mtime = FileTime::from_system_time(SystemTime::now() - by);
        filetime::set_file_mtime(&record.body_path, mtime).unwrap();
    }

    #[test]
    fn write_then_open_roundtrips() {
        let dir = resloader_test::tempdir();
        let cache = DiskCache::new(dir.path()).unwrap();
        let key = key("roundtrip");

        cache.write(&key, &payload()).unwrap();
        assert_eq!(cache.open(&key, None), Some(payload()));
    }

    #[test]
    fn record_requires_both_halves() {
        let dir = resloader_test::tempdir();
        let cache = DiskCache::new(dir.path()).unwrap();
        let key = key("halves");

        cache.write(&key, &payload()).unwrap();
        std::fs::remove_file(cache.headers_path(&key)).unwrap();

        assert!(cache.read(&key).is_none());
        assert_eq!(cache.open(&key, None), None);
    }

    #[test]
    fn expired_records_are_deleted_on_read() {
        let dir = resloader_test::tempdir();
        let cache = DiskCache::new(dir.path()).unwrap();
        let key = key("expired");

        cache.write(&key, &payload()).unwrap();
        age(&cache, &key, Duration::from_secs(7200));

        assert_eq!(cache.open(&key, Some(Duration::from_secs(3600))), None);
        // Both halves are gone, not just judged invalid.
        assert!(!cache.body_path(&key).exists());
        assert!(!cache.headers_path(&key).exists());
    }

    #[test]
    fn disabled_ttl_is_valid_forever() {
        let dir = resloader_test::tempdir();
        let cache = DiskCache::new(dir.path()).unwrap();
        let key = key("forever");

        cache.write(&key, &payload()).unwrap();
        age(&cache, &key, Duration::from_secs(7200));

        assert_eq!(cache.open(&key, None), Some(payload()));
        assert_eq!(cache.open(&key, Some(Duration::ZERO)), Some(payload()));
    }

    #[test]
    fn fresh_records_pass_their_ttl() {
        let dir = resloader_test::tempdir();
        let cache = DiskCache::new(dir.path()).unwrap();
        let key = key("fresh");

        cache.write(&key, &payload()).unwrap();
        assert_eq!(
            cache.open(&key, Some(Duration::from_secs(3600))),
            Some(payload())
        );
    }

    #[test]
    fn corrupt_headers_degrade_to_a_miss() {
        let dir = resloader_test::tempdir();
        let cache = DiskCache::new(dir.path()).unwrap();
        let key = key("corrupt");

        cache.write(&key, &payload()).unwrap();
        std::fs::write(cache.headers_path(&key), b"not json").unwrap();

        assert_eq!(cache.open(&key, None), None);
        // The corrupt record was evicted.
        assert!(cache.read(&key).is_none());
    }

    #[test]
    fn invalidate_removes_the_record() {
        let dir = resloader_test::tempdir();
        let cache = DiskCache::new(dir.path()).unwrap();
        let key = key("invalidate");

        cache.write(&key, &payload()).unwrap();
        cache.invalidate(&key).unwrap();
        assert!(cache.read(&key).is_none());

        // Idempotent on an absent record.
        cache.invalidate(&key).unwrap();
    }

    #[test]
    fn clear_starts_over() {
        let dir = resloader_test::tempdir();
        let cache = DiskCache::new(dir.path()).unwrap();

        cache.write(&key("one"), &payload()).unwrap();
        cache.write(&key("two"), &payload()).unwrap();
        cache.clear().unwrap();

        assert!(cache.read(&key("one")).is_none());
        assert!(cache.read(&key("two")).is_none());
        // The cache stays usable after a clear.
        cache.write(&key("one"), &payload()).unwrap();
        assert_eq!(cache.open(&key("one"), None), Some(payload()));
    }
}
