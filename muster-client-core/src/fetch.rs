use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use reqwest::blocking::Client;
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::redirect;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use url::Url;

use crate::prefs::Preferences;

const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Connection failed for {1}")]
    Connection(#[source] reqwest::Error, String),

    #[error("Transfer from {0} stalled (no data for {}s)", INACTIVITY_TIMEOUT.as_secs())]
    Inactivity(String),

    #[error("HTTP {code} for {url}")]
    Http { code: u16, url: String },

    #[error("Hash mismatch for {url}: expected {expected}, got {actual}")]
    Integrity {
        url: String,
        expected: String,
        actual: String,
    },

    #[error("No expected hash supplied for {0} and verification is strict")]
    MissingHash(String),

    #[error("I/O error at {}", .1.display())]
    Io(#[source] std::io::Error, PathBuf),

    #[error("Could not build HTTP client")]
    ClientBuild(#[source] reqwest::Error),

    #[error("Could not read TLS material at {}", .1.display())]
    TlsMaterial(#[source] std::io::Error, PathBuf),

    #[error("TLS material at {} was rejected", .1.display())]
    TlsInvalid(#[source] reqwest::Error, PathBuf),
}

/// What a fetch did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    DownloadedNew,
    NotModified,
    Resumed,
}

#[derive(Debug, Clone)]
pub struct Fetched {
    pub status: FetchStatus,
    pub bytes_transferred: u64,
    pub elapsed: Duration,
}

impl Fetched {
    fn not_modified() -> Fetched {
        Fetched {
            status: FetchStatus::NotModified,
            bytes_transferred: 0,
            elapsed: Duration::ZERO,
        }
    }

    /// Average transfer rate, the unit the run report records.
    pub fn kbytes_per_sec(&self) -> Option<u32> {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 || self.bytes_transferred == 0 {
            return None;
        }
        Some((self.bytes_transferred as f64 / 1024.0 / secs) as u32)
    }
}

/// Redirect handling declared by the `FollowHTTPRedirects` preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RedirectPolicy {
    #[default]
    None,
    HttpsOnly,
    All,
}

impl RedirectPolicy {
    pub fn from_pref(value: &str) -> RedirectPolicy {
        match value {
            "https" => RedirectPolicy::HttpsOnly,
            "all" => RedirectPolicy::All,
            _ => RedirectPolicy::None,
        }
    }

    /// Decides whether one redirect hop is permitted. The declared repo host
    /// is always an acceptable cross-host target, scheme rules permitting.
    pub fn allows(&self, from: &Url, to: &Url, repo_host: Option<&str>) -> bool {
        let same_host = from.host_str() == to.host_str();
        let to_repo = repo_host.is_some() && to.host_str() == repo_host;
        match self {
            RedirectPolicy::None => false,
            RedirectPolicy::HttpsOnly => {
                from.scheme() == "https" && to.scheme() == "https" && (same_host || to_repo)
            }
            RedirectPolicy::All => {
                // No https -> http downgrades.
                !(from.scheme() == "https" && to.scheme() == "http")
            }
        }
    }
}

/// Integrity checking declared by `PackageVerificationMode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VerificationMode {
    None,
    #[default]
    Hash,
    HashStrict,
}

impl VerificationMode {
    pub fn from_pref(value: &str) -> VerificationMode {
        match value.to_ascii_lowercase().as_str() {
            "none" => VerificationMode::None,
            "hash_strict" => VerificationMode::HashStrict,
            _ => VerificationMode::Hash,
        }
    }
}

/// Sidecar state stored next to each cached file, carrying the validators
/// for conditional GETs and the content hash.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FetchState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "mod")]
    pub last_modified: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl FetchState {
    pub fn path_for(dest: &Path) -> PathBuf {
        let mut name = dest.file_name().unwrap_or_default().to_os_string();
        name.push(".info.json");
        dest.with_file_name(name)
    }

    pub fn load(dest: &Path) -> Option<FetchState> {
        let raw = fs::read_to_string(Self::path_for(dest)).ok()?;
        serde_json::from_str(&raw).ok()
    }

    pub fn save(&self, dest: &Path) -> Result<(), FetchError> {
        let path = Self::path_for(dest);
        let raw = serde_json::to_string_pretty(self)
            .expect("fetch state serializes");
        fs::write(&path, raw).map_err(|e| FetchError::Io(e, path))
    }

    pub fn remove(dest: &Path) {
        let _ = fs::remove_file(Self::path_for(dest));
    }

    fn add_validators(&self, headers: &mut HeaderMap) {
        if let Some(etag) = self.etag.as_deref().and_then(|v| HeaderValue::from_str(v).ok()) {
            headers.insert(header::IF_NONE_MATCH, etag);
        }
        if let Some(lm) = self
            .last_modified
            .as_deref()
            .and_then(|v| HeaderValue::from_str(v).ok())
        {
            headers.insert(header::IF_MODIFIED_SINCE, lm);
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub resume: bool,
    pub expected_hash: Option<String>,
    /// UI hint, surfaced through logging.
    pub message: Option<String>,
    pub custom_headers: Vec<(String, String)>,
}

pub struct Fetcher {
    client: Client,
    verification: VerificationMode,
    extra_headers: Vec<(String, String)>,
}

impl Fetcher {
    pub fn new(prefs: &Preferences) -> Result<Fetcher, FetchError> {
        let policy = RedirectPolicy::from_pref(
            &prefs.string("FollowHTTPRedirects").unwrap_or_default(),
        );
        let repo_host = prefs
            .string("SoftwareRepoURL")
            .and_then(|u| Url::parse(&u).ok())
            .and_then(|u| u.host_str().map(str::to_string));

        let redirect_policy = match policy {
            RedirectPolicy::None => redirect::Policy::none(),
            _ => {
                let repo_host = repo_host.clone();
                redirect::Policy::custom(move |attempt| {
                    if attempt.previous().len() > 10 {
                        return attempt.error("too many redirects");
                    }
                    let from = match attempt.previous().last() {
                        Some(u) => u.clone(),
                        None => return attempt.stop(),
                    };
                    if policy.allows(&from, attempt.url(), repo_host.as_deref()) {
                        attempt.follow()
                    } else {
                        attempt.stop()
                    }
                })
            }
        };

        let mut builder = Client::builder()
            .user_agent(format!(
                "muster/{} ({}; {})",
                crate::defaults::ENGINE_VERSION,
                std::env::consts::OS,
                std::env::consts::ARCH
            ))
            .redirect(redirect_policy)
            .gzip(true)
            .connect_timeout(INACTIVITY_TIMEOUT)
            .timeout(None);

        if let Some(ca_path) = prefs.string("SoftwareRepoCACertificate").map(PathBuf::from) {
            let pem = fs::read(&ca_path).map_err(|e| FetchError::TlsMaterial(e, ca_path.clone()))?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| FetchError::TlsInvalid(e, ca_path))?;
            // The configured CA replaces system trust for repo connections.
            builder = builder
                .tls_built_in_root_certs(false)
                .add_root_certificate(cert);
        }

        if prefs.boolean("UseClientCertificate") {
            let cert_path = prefs
                .string("ClientCertificatePath")
                .map(PathBuf::from)
                .unwrap_or_default();
            let key_path = prefs
                .string("ClientKeyPath")
                .map(PathBuf::from)
                .unwrap_or_else(|| cert_path.clone());
            let mut pem =
                fs::read(&cert_path).map_err(|e| FetchError::TlsMaterial(e, cert_path.clone()))?;
            if key_path != cert_path {
                let key =
                    fs::read(&key_path).map_err(|e| FetchError::TlsMaterial(e, key_path.clone()))?;
                pem.extend_from_slice(&key);
            }
            let identity = reqwest::Identity::from_pem(&pem)
                .map_err(|e| FetchError::TlsInvalid(e, cert_path))?;
            builder = builder.identity(identity);
        }

        let mut extra_headers = Vec::new();
        if let Some(dict) = prefs.dictionary("AdditionalHttpHeaders") {
            for (name, value) in dict.iter() {
                if let plist::Value::String(v) = value {
                    extra_headers.push((name.clone(), v.clone()));
                }
            }
        }

        Ok(Fetcher {
            client: builder.build().map_err(FetchError::ClientBuild)?,
            verification: VerificationMode::from_pref(
                &prefs.string("PackageVerificationMode").unwrap_or_default(),
            ),
            extra_headers,
        })
    }

    pub fn verification(&self) -> VerificationMode {
        self.verification
    }

    fn partial_path(dest: &Path) -> PathBuf {
        let mut name = dest.file_name().unwrap_or_default().to_os_string();
        name.push(".download");
        dest.with_file_name(name)
    }

    /// Fetches `url` to `dest`, resuming a partial download and issuing a
    /// conditional GET where possible. Integrity is enforced according to
    /// `PackageVerificationMode`.
    pub fn fetch(
        &self,
        url: &Url,
        dest: &Path,
        opts: &FetchOptions,
    ) -> Result<Fetched, FetchError> {
        if let Some(msg) = &opts.message {
            log::info!("{}", msg);
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| FetchError::Io(e, parent.to_path_buf()))?;
        }

        let partial = Self::partial_path(dest);
        let resume_from = if opts.resume {
            fs::metadata(&partial).map(|m| m.len()).unwrap_or(0)
        } else {
            if partial.exists() {
                let _ = fs::remove_file(&partial);
            }
            0
        };

        let mut headers = HeaderMap::new();
        for (name, value) in self.extra_headers.iter().chain(opts.custom_headers.iter()) {
            if let (Ok(n), Ok(v)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.insert(n, v);
            }
        }

        if resume_from > 0 {
            headers.insert(
                header::RANGE,
                HeaderValue::from_str(&format!("bytes={}-", resume_from))
                    .expect("range header value"),
            );
        } else if dest.exists() {
            if let Some(state) = FetchState::load(dest) {
                state.add_validators(&mut headers);
            }
        }

        let started = Instant::now();
        let response = self
            .client
            .get(url.clone())
            .headers(headers)
            .send()
            .map_err(|e| {
                if e.is_status() {
                    FetchError::Http {
                        code: e.status().map(|s| s.as_u16()).unwrap_or(0),
                        url: url.to_string(),
                    }
                } else {
                    FetchError::Connection(e, url.to_string())
                }
            })?;

        let status = response.status();
        match status {
            StatusCode::NOT_MODIFIED => {
                log::debug!("{} not modified", url);
                return Ok(Fetched::not_modified());
            }
            StatusCode::RANGE_NOT_SATISFIABLE => {
                // The partial file already covers the full entity.
                if resume_from > 0 {
                    self.finalize(url, dest, &partial, opts)?;
                    return Ok(Fetched::not_modified());
                }
                return Err(FetchError::Http {
                    code: status.as_u16(),
                    url: url.to_string(),
                });
            }
            s if s.is_success() => {}
            s => {
                return Err(FetchError::Http {
                    code: s.as_u16(),
                    url: url.to_string(),
                });
            }
        }

        let resumed = status == StatusCode::PARTIAL_CONTENT && resume_from > 0;
        let mut file = if resumed {
            fs::OpenOptions::new()
                .append(true)
                .open(&partial)
                .map_err(|e| FetchError::Io(e, partial.clone()))?
        } else {
            // A 200 answer to a range request restarts from zero.
            fs::File::create(&partial).map_err(|e| FetchError::Io(e, partial.clone()))?
        };

        let etag = header_string(response.headers(), header::ETAG);
        let last_modified = header_string(response.headers(), header::LAST_MODIFIED);

        let mut reader = response;
        let mut buf = [0u8; 64 * 1024];
        let mut transferred: u64 = 0;
        // Per-operation inactivity watchdog: the blocking client has no read
        // timeout of its own, so progress is tracked here and a stalled
        // transfer is abandoned. The partial file is kept for resume.
        let mut last_activity = Instant::now();
        loop {
            let n = reader.read(&mut buf).map_err(|e| {
                match e.kind() {
                    std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                        FetchError::Inactivity(url.to_string())
                    }
                    _ => FetchError::Io(e, partial.clone()),
                }
            })?;
            if n == 0 {
                break;
            }
            if last_activity.elapsed() > INACTIVITY_TIMEOUT {
                let _ = file.flush();
                return Err(FetchError::Inactivity(url.to_string()));
            }
            last_activity = Instant::now();
            file.write_all(&buf[..n])
                .map_err(|e| FetchError::Io(e, partial.clone()))?;
            transferred += n as u64;
        }
        file.flush().map_err(|e| FetchError::Io(e, partial.clone()))?;
        drop(file);

        let sha256 = self.verify_and_finalize(url, dest, &partial, opts)?;
        FetchState {
            url: Some(url.to_string()),
            etag,
            last_modified,
            sha256: Some(sha256),
        }
        .save(dest)?;

        Ok(Fetched {
            status: if resumed {
                FetchStatus::Resumed
            } else {
                FetchStatus::DownloadedNew
            },
            bytes_transferred: transferred,
            elapsed: started.elapsed(),
        })
    }

    fn finalize(
        &self,
        url: &Url,
        dest: &Path,
        partial: &Path,
        opts: &FetchOptions,
    ) -> Result<(), FetchError> {
        let sha256 = self.verify_and_finalize(url, dest, partial, opts)?;
        let mut state = FetchState::load(dest).unwrap_or_default();
        state.url = Some(url.to_string());
        state.sha256 = Some(sha256);
        state.save(dest)
    }

    /// Hash-checks the completed partial file and renames it into place.
    fn verify_and_finalize(
        &self,
        url: &Url,
        dest: &Path,
        partial: &Path,
        opts: &FetchOptions,
    ) -> Result<String, FetchError> {
        let actual = sha256_of_file(partial)?;

        match (self.verification, opts.expected_hash.as_deref()) {
            (VerificationMode::None, _) => {}
            (VerificationMode::Hash, None) => {}
            (VerificationMode::HashStrict, None) => {
                let _ = fs::remove_file(partial);
                return Err(FetchError::MissingHash(url.to_string()));
            }
            (_, Some(expected)) => {
                if !expected.eq_ignore_ascii_case(&actual) {
                    let _ = fs::remove_file(partial);
                    FetchState::remove(dest);
                    return Err(FetchError::Integrity {
                        url: url.to_string(),
                        expected: expected.to_string(),
                        actual,
                    });
                }
            }
        }

        fs::rename(partial, dest).map_err(|e| FetchError::Io(e, dest.to_path_buf()))?;
        Ok(actual)
    }
}

fn header_string(headers: &HeaderMap, name: HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Hex sha256 of a file's bytes.
pub fn sha256_of_file(path: &Path) -> Result<String, FetchError> {
    let mut file = fs::File::open(path).map_err(|e| FetchError::Io(e, path.to_path_buf()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| FetchError::Io(e, path.to_path_buf()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redirect_policy_rules() {
        let https_a = Url::parse("https://a.example.org/x").unwrap();
        let https_b = Url::parse("https://b.example.org/x").unwrap();
        let http_a = Url::parse("http://a.example.org/x").unwrap();
        let https_repo = Url::parse("https://repo.example.org/x").unwrap();

        let none = RedirectPolicy::None;
        assert!(!none.allows(&https_a, &https_a, None));

        let https = RedirectPolicy::HttpsOnly;
        assert!(https.allows(&https_a, &https_a, None));
        assert!(!https.allows(&http_a, &https_a, None));
        assert!(!https.allows(&https_a, &https_b, None));
        assert!(https.allows(&https_a, &https_repo, Some("repo.example.org")));

        let all = RedirectPolicy::All;
        assert!(all.allows(&http_a, &https_a, None));
        assert!(all.allows(&https_a, &https_b, None));
        assert!(!all.allows(&https_a, &http_a, None));
    }

    #[test]
    fn test_verification_mode_parse() {
        assert_eq!(VerificationMode::from_pref("none"), VerificationMode::None);
        assert_eq!(VerificationMode::from_pref("hash"), VerificationMode::Hash);
        assert_eq!(
            VerificationMode::from_pref("hash_strict"),
            VerificationMode::HashStrict
        );
        assert_eq!(VerificationMode::from_pref("bogus"), VerificationMode::Hash);
    }

    #[test]
    fn test_fetch_state_sidecar_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("catalog");
        let state = FetchState {
            url: Some("https://repo.example.org/catalogs/production".into()),
            etag: Some("\"abc123\"".into()),
            last_modified: Some("Wed, 01 May 2024 10:00:00 GMT".into()),
            sha256: Some("deadbeef".into()),
        };
        state.save(&dest).unwrap();
        let loaded = FetchState::load(&dest).unwrap();
        assert_eq!(loaded.etag.as_deref(), Some("\"abc123\""));
        assert_eq!(loaded.sha256.as_deref(), Some("deadbeef"));
        assert!(FetchState::path_for(&dest).ends_with("catalog.info.json"));
    }

    #[test]
    fn test_sha256_of_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        fs::write(&path, b"muster").unwrap();
        // sha256("muster")
        assert_eq!(
            sha256_of_file(&path).unwrap(),
            "74cd18c016d902f940554dfd07545f219064b27fe6e890e9447f0c9e377903a8"
        );
    }
}
