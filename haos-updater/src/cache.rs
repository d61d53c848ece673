//! Single-slot bundle cache
//!
//! Features:
//! - Deterministic bundle path per version
//! - Eviction of bundles for other versions before a download
//! - Streamed download into a temp file, renamed only when complete
//! - Optional sha256 verification
//! - Agent path -> host path translation for the install backend

use crate::error::DownloadError;
use crate::version::Version;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Pair of filesystem roots: the agent's view and the backend's view
#[derive(Debug, Clone, PartialEq)]
pub struct PathMapping {
    pub agent_root: String,
    pub host_root: String,
}

impl PathMapping {
    pub fn new(agent_root: impl Into<String>, host_root: impl Into<String>) -> Self {
        Self {
            agent_root: agent_root.into(),
            host_root: host_root.into(),
        }
    }

    /// Swap the agent root prefix for the host root. Paths outside the agent
    /// root are returned unchanged.
    pub fn to_host(&self, path: &Path) -> PathBuf {
        let raw = path.to_string_lossy();
        match raw.strip_prefix(self.agent_root.as_str()) {
            Some(rest) => PathBuf::from(format!("{}{}", self.host_root, rest)),
            None => path.to_path_buf(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub dir: PathBuf,
    pub model: String,
    pub release_base_url: String,
    pub attempts: u32,
    pub backoff: Duration,
    pub mapping: PathMapping,
}

pub struct BundleCache {
    settings: CacheSettings,
    http: reqwest::Client,
}

impl BundleCache {
    pub fn new(settings: CacheSettings) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self { settings, http })
    }

    fn file_prefix(&self) -> String {
        format!("haos_{}-", self.settings.model)
    }

    pub fn bundle_name(&self, version: &Version) -> String {
        format!("{}{}.raucb", self.file_prefix(), version)
    }

    pub fn bundle_path(&self, version: &Version) -> PathBuf {
        self.settings.dir.join(self.bundle_name(version))
    }

    pub fn bundle_url(&self, version: &Version) -> String {
        format!(
            "{}/{}/{}",
            self.settings.release_base_url.trim_end_matches('/'),
            version,
            self.bundle_name(version)
        )
    }

    pub fn host_path(&self, path: &Path) -> PathBuf {
        self.settings.mapping.to_host(path)
    }

    /// Return the cached bundle for `version`, downloading it on a miss
    pub async fn fetch(&self, version: &Version, sha256: Option<&str>) -> Result<PathBuf, DownloadError> {
        let path = self.bundle_path(version);

        if fs::try_exists(&path).await.unwrap_or(false) {
            match sha256 {
                Some(expected) if !digest_matches(&path, expected).await => {
                    warn!("Cached bundle {} fails checksum, downloading again", path.display());
                    let _ = fs::remove_file(&path).await;
                }
                _ => {
                    info!("Bundle already cached: {}", path.display());
                    return Ok(path);
                }
            }
        }

        fs::create_dir_all(&self.settings.dir)
            .await
            .map_err(|source| DownloadError::CacheDir {
                path: self.settings.dir.clone(),
                source,
            })?;

        self.evict_except(&path).await;

        let url = self.bundle_url(version);
        let attempts = self.settings.attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            info!("Downloading {} (attempt {}/{})", url, attempt, attempts);
            match self.download_to(&url, &path, sha256).await {
                Ok(()) => {
                    info!("Bundle saved: {}", path.display());
                    return Ok(path);
                }
                Err(e) => {
                    warn!("Download attempt {} failed: {}", attempt, e);
                    last_error = e;
                    if attempt < attempts {
                        tokio::time::sleep(self.settings.backoff).await;
                    }
                }
            }
        }

        Err(DownloadError::Exhausted {
            url,
            attempts,
            last: last_error,
        })
    }

    /// Remove every cached bundle of another version. Files belonging to
    /// `keep`, including other downloads' partial files, stay.
    async fn evict_except(&self, keep: &Path) {
        let prefix = self.file_prefix();
        let keep_name = keep
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let mut entries = match fs::read_dir(&self.settings.dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Cannot scan cache directory: {}", e);
                return;
            }
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            let stale_bundle = name.starts_with(&prefix) && name.ends_with(".raucb");
            let stale_part = name.starts_with(&prefix) && name.ends_with(".part");
            if (stale_bundle || stale_part) && !is_same_version(&name, &keep_name) {
                match fs::remove_file(&path).await {
                    Ok(()) => info!("Evicted stale bundle {}", path.display()),
                    Err(e) => warn!("Failed to evict {}: {}", path.display(), e),
                }
            }
        }
    }

    /// One download attempt. The final path only appears once the whole body
    /// is on disk and verified.
    async fn download_to(&self, url: &str, dest: &Path, sha256: Option<&str>) -> Result<(), String> {
        let part = dest.with_extension(format!("{}.part", uuid::Uuid::new_v4().simple()));

        let mut result = self.stream_into(url, &part, sha256).await;
        if result.is_ok() {
            result = fs::rename(&part, dest)
                .await
                .map_err(|e| format!("rename {} failed: {}", part.display(), e));
        }

        if result.is_err() {
            // Partial files must never linger under any name
            let _ = fs::remove_file(&part).await;
        }
        result
    }

    async fn stream_into(&self, url: &str, part: &Path, sha256: Option<&str>) -> Result<(), String> {
        let response = self.http.get(url).send().await.map_err(|e| e.to_string())?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("HTTP {}", status));
        }

        let mut file = fs::File::create(part).await.map_err(|e| e.to_string())?;
        let mut hasher = Sha256::new();
        let mut written: u64 = 0;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| e.to_string())?;
            hasher.update(&chunk);
            file.write_all(&chunk).await.map_err(|e| e.to_string())?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(|e| e.to_string())?;
        file.sync_all().await.map_err(|e| e.to_string())?;
        debug!("Downloaded {} bytes into {}", written, part.display());

        if let Some(expected) = sha256 {
            let actual = hex::encode(hasher.finalize());
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(format!("sha256 mismatch: expected {}, got {}", expected, actual));
            }
        }
        Ok(())
    }

    /// Make the agent root visible under the host root (symlink) when the
    /// host root does not exist in this filesystem view.
    pub async fn ensure_host_root(&self) {
        let mapping = &self.settings.mapping;
        let host = PathBuf::from(mapping.host_root.trim_end_matches('/'));
        let agent = PathBuf::from(mapping.agent_root.trim_end_matches('/'));
        if host == agent || fs::symlink_metadata(&host).await.is_ok() {
            return;
        }

        if let Some(parent) = host.parent() {
            if let Err(e) = fs::create_dir_all(parent).await {
                warn!("Cannot create {}: {}", parent.display(), e);
                return;
            }
        }

        #[cfg(unix)]
        {
            match fs::symlink(&agent, &host).await {
                Ok(()) => info!("Linked {} -> {}", host.display(), agent.display()),
                Err(e) => warn!("Failed to link {} -> {}: {}", host.display(), agent.display(), e),
            }
        }
    }
}

/// `name` is `keep` itself or one of its `<stem>.<uuid>.part` files
fn is_same_version(name: &str, keep: &str) -> bool {
    if name == keep {
        return true;
    }
    let Some(stem) = keep.strip_suffix(".raucb") else {
        return false;
    };
    name.strip_prefix(stem)
        .and_then(|rest| rest.strip_prefix('.'))
        .and_then(|rest| rest.strip_suffix(".part"))
        .is_some_and(|id| id.len() == 32 && id.chars().all(|c| c.is_ascii_hexdigit()))
}

async fn digest_matches(path: &Path, expected: &str) -> bool {
    let path = path.to_path_buf();
    let expected = expected.to_string();
    tokio::task::spawn_blocking(move || {
        let mut file = match std::fs::File::open(&path) {
            Ok(f) => f,
            Err(_) => return false,
        };
        let mut hasher = Sha256::new();
        if std::io::copy(&mut file, &mut hasher).is_err() {
            return false;
        }
        hex::encode(hasher.finalize()).eq_ignore_ascii_case(&expected)
    })
    .await
    .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    fn cache_in(dir: &Path, server: &MockServer) -> BundleCache {
        BundleCache::new(CacheSettings {
            dir: dir.to_path_buf(),
            model: "umdu-k1".to_string(),
            release_base_url: server.uri(),
            attempts: 3,
            backoff: Duration::from_millis(10),
            mapping: PathMapping::new("/share/", "/mnt/data/supervisor/share/"),
        })
        .unwrap()
    }

    #[test]
    fn test_path_mapping() {
        let mapping = PathMapping::new("/share/", "/mnt/data/supervisor/share/");
        assert_eq!(
            mapping.to_host(Path::new("/share/umdu-haos-updater/haos_umdu-k1-16.1.raucb")),
            PathBuf::from("/mnt/data/supervisor/share/umdu-haos-updater/haos_umdu-k1-16.1.raucb")
        );
        assert_eq!(mapping.to_host(Path::new("/data/x.raucb")), PathBuf::from("/data/x.raucb"));
        // prefix match only at the start
        assert_eq!(
            mapping.to_host(Path::new("/tmp/share/x.raucb")),
            PathBuf::from("/tmp/share/x.raucb")
        );
    }

    #[tokio::test]
    async fn test_fetch_is_idempotent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/16.1/haos_umdu-k1-16.1.raucb"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"bundle".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path(), &server);

        let first = cache.fetch(&v("16.1"), None).await.unwrap();
        let second = cache.fetch(&v("16.1"), None).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(std::fs::read(&first).unwrap(), b"bundle");
    }

    #[tokio::test]
    async fn test_fetch_evicts_other_versions() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/16.2/haos_umdu-k1-16.2.raucb"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"new".to_vec()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("haos_umdu-k1-16.1.raucb");
        let unrelated = dir.path().join("notes.txt");
        std::fs::write(&old, b"old").unwrap();
        std::fs::write(&unrelated, b"keep").unwrap();

        let cache = cache_in(dir.path(), &server);
        let fresh = cache.fetch(&v("16.2"), None).await.unwrap();

        assert!(fresh.exists());
        assert!(!old.exists());
        assert!(unrelated.exists());
    }

    #[test]
    fn test_same_version_matching() {
        let keep = "haos_umdu-k1-16.1.raucb";
        let part = format!("haos_umdu-k1-16.1.{}.part", uuid::Uuid::new_v4().simple());
        assert!(is_same_version(keep, keep));
        assert!(is_same_version(&part, keep));
        assert!(!is_same_version("haos_umdu-k1-16.10.raucb", keep));
        assert!(!is_same_version("haos_umdu-k1-16.1.5.raucb", keep));
        assert!(!is_same_version(
            &format!("haos_umdu-k1-16.1.5.{}.part", uuid::Uuid::new_v4().simple()),
            keep
        ));
    }

    #[tokio::test]
    async fn test_fetch_keeps_in_flight_part_of_same_version() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/16.1/haos_umdu-k1-16.1.raucb"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"bundle".to_vec()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let in_flight = dir
            .path()
            .join(format!("haos_umdu-k1-16.1.{}.part", uuid::Uuid::new_v4().simple()));
        let stale = dir
            .path()
            .join(format!("haos_umdu-k1-16.0.{}.part", uuid::Uuid::new_v4().simple()));
        std::fs::write(&in_flight, b"half").unwrap();
        std::fs::write(&stale, b"old").unwrap();

        let cache = cache_in(dir.path(), &server);
        cache.fetch(&v("16.1"), None).await.unwrap();

        assert!(in_flight.exists());
        assert!(!stale.exists());
    }

    #[tokio::test]
    async fn test_concurrent_fetches_of_one_version_both_succeed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/16.1/haos_umdu-k1-16.1.raucb"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(b"bundle".to_vec())
                    .set_delay(Duration::from_millis(50)),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(cache_in(dir.path(), &server));

        let first = tokio::spawn({
            let cache = cache.clone();
            async move { cache.fetch(&v("16.1"), None).await }
        });
        let second = tokio::spawn({
            let cache = cache.clone();
            async move { cache.fetch(&v("16.1"), None).await }
        });

        let a = first.await.unwrap().unwrap();
        let b = second.await.unwrap().unwrap();
        assert_eq!(a, b);
        assert_eq!(std::fs::read(&a).unwrap(), b"bundle");
    }

    #[tokio::test]
    async fn test_fetch_retries_then_fails_without_leftovers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path(), &server);

        let err = cache.fetch(&v("16.1"), None).await.unwrap_err();
        assert!(matches!(err, DownloadError::Exhausted { attempts: 3, .. }));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"tampered".to_vec()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path(), &server);

        let expected = hex::encode(Sha256::digest(b"bundle"));
        assert!(cache.fetch(&v("16.1"), Some(&expected)).await.is_err());
        assert!(!cache.bundle_path(&v("16.1")).exists());
    }

    #[tokio::test]
    async fn test_checksum_match_accepts_cached_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path(), &server);
        std::fs::write(cache.bundle_path(&v("16.1")), b"bundle").unwrap();

        let expected = hex::encode(Sha256::digest(b"bundle"));
        assert!(cache.fetch(&v("16.1"), Some(&expected)).await.is_ok());
    }
}
