//! GitHub Actions artifact-cache backend.
//!
//! Speaks the `_apis/artifactcache` protocol: JSON check/reserve/commit,
//! octet-stream chunked upload with `content-range`, and an unauthenticated
//! CDN download URL. Writes are two-phase (reserve, then upload+commit) so
//! an interrupted upload never becomes a visible entry.
//!
//! A 429 from any endpoint trips a process-wide sticky flag: one
//! `cache-info` event is surfaced and every later cache operation
//! short-circuits to a miss or decline without network I/O.

use std::{
    io::SeekFrom,
    path::PathBuf,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
};

use color_eyre::{
    Result, Section, SectionExt,
    eyre::{Context, bail, eyre},
};
use derive_more::Debug;
use futures::TryStreamExt;
use reqwest::{RequestBuilder, Response, StatusCode, header};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use tap::Pipe;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::StreamReader;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::{
    config::ScriptReference,
    data_dir::ScriptDataDir,
    fingerprint::Fingerprint,
    fs,
    manifest::FileManifest,
};

use super::{CacheLookup, SetOutcome, archive};

/// Entries larger than this are not uploaded; the service rejects them
/// anyway.
const MAX_ARCHIVE_BYTES: u64 = 10 * 1024 * 1024 * 1024;

/// Upload chunk size.
const CHUNK_BYTES: u64 = 32 * 1024 * 1024;

/// Compression tag folded into the cache version.
const COMPRESSION: &str = "gzip";

/// Cache schema version salt. Bump to invalidate entries written with an
/// incompatible archive or key layout.
const VERSION_SALT: &str = "2";

/// Field separator for the version digest preimage.
const VERSION_SEPARATOR: u8 = 0x1E;

/// Sticky process-wide rate-limit flag.
static RATE_LIMITED: AtomicBool = AtomicBool::new(false);

fn rate_limited() -> bool {
    RATE_LIMITED.load(Ordering::Relaxed)
}

/// Set the sticky flag; returns whether this call tripped it first.
fn trip_rate_limit() -> bool {
    let first = !RATE_LIMITED.swap(true, Ordering::Relaxed);
    if first {
        info!("remote cache rate limited; caching disabled for the remainder of the process");
    }
    first
}

/// Client for the GitHub Actions artifact-cache service.
#[derive(Clone, Debug)]
pub struct GithubActionsCache {
    #[debug("{:?}", base.as_str())]
    base: Url,
    #[debug(skip)]
    http: reqwest::Client,
    #[debug(skip)]
    token: String,
    image_os: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReserveRequest<'a> {
    key: &'a str,
    version: &'a str,
    cache_size: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReserveResponse {
    cache_id: u64,
}

#[derive(Debug, Serialize)]
struct CommitRequest {
    size: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckResponse {
    archive_location: Option<String>,
}

/// Result of one protocol step that can be rate limited.
enum Step<T> {
    Done(T),
    RateLimited,
}

impl GithubActionsCache {
    /// Build from `ACTIONS_CACHE_URL` and `ACTIONS_RUNTIME_TOKEN`
    /// (provided by the GitHub Actions runner), plus the optional `ImageOS`
    /// tag.
    pub fn from_env() -> Result<Self> {
        let base = match std::env::var("ACTIONS_CACHE_URL") {
            Ok(url) => url,
            Err(_) => bail!(
                "the github cache backend requires ACTIONS_CACHE_URL; \
                 it is set automatically by the google/wireit@setup-github-actions-caching action"
            ),
        };
        let token = match std::env::var("ACTIONS_RUNTIME_TOKEN") {
            Ok(token) => token,
            Err(_) => bail!("the github cache backend requires ACTIONS_RUNTIME_TOKEN"),
        };
        Self::new(&base, token, std::env::var("ImageOS").ok())
    }

    pub fn new(base: &str, token: String, image_os: Option<String>) -> Result<Self> {
        // Joining relative API paths silently drops the last path segment
        // unless the base ends with a slash.
        let normalized = if base.ends_with('/') {
            base.to_string()
        } else {
            format!("{base}/")
        };
        let base = Url::parse(&normalized).context("parse cache base URL")?;
        let http = reqwest::Client::builder()
            .build()
            .context("build http client")?;
        Ok(Self { base, http, token, image_os })
    }

    fn api_url(&self, path: &str) -> Result<Url> {
        self.base
            .join(&format!("_apis/artifactcache/{path}"))
            .context("join cache API URL")
    }

    fn request(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header(header::USER_AGENT, "actions/cache")
            .header(header::ACCEPT, "application/json;api-version=6.0-preview.1")
            .bearer_auth(&self.token)
    }

    /// Look up an entry. A hit defers the download to
    /// [`GithubCacheHit::apply`].
    #[instrument(skip_all, fields(script = %script))]
    pub async fn get(
        &self,
        script: &ScriptReference,
        fingerprint: &Fingerprint,
        data_dir: &ScriptDataDir,
    ) -> Result<CacheLookup> {
        if rate_limited() {
            return Ok(CacheLookup::Miss);
        }

        let key = cache_key(script);
        let version = self.cache_version(fingerprint);
        let url = self.api_url("cache")?;
        let response = self
            .request(self.http.get(url))
            .query(&[("keys", key.as_str()), ("version", version.as_str())])
            .send()
            .await
            .context("send cache check")?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(CacheLookup::Miss),
            StatusCode::TOO_MANY_REQUESTS => Ok(rate_limit_lookup()),
            status if status.is_success() => {
                let check = response
                    .json::<CheckResponse>()
                    .await
                    .context("parse cache check response")?;
                match check.archive_location {
                    Some(archive_url) => {
                        debug!("remote cache hit");
                        Ok(CacheLookup::Hit(super::CacheHit::Github(GithubCacheHit {
                            http: self.http.clone(),
                            archive_url,
                            package_dir: script.package_dir.clone(),
                            temp_dir: data_dir.temp_dir(),
                        })))
                    }
                    None => Ok(CacheLookup::Miss),
                }
            }
            _ => Err(unexpected_status("cache check", response).await),
        }
    }

    /// Store an entry: archive, size check, reserve, chunked upload,
    /// commit. Returns a decline rather than an error for every condition
    /// another producer or the service can legitimately cause.
    #[instrument(skip_all, fields(script = %script))]
    pub async fn set(
        &self,
        script: &ScriptReference,
        fingerprint: &Fingerprint,
        outputs: &FileManifest,
        data_dir: &ScriptDataDir,
    ) -> Result<SetOutcome> {
        if rate_limited() {
            return Ok(SetOutcome::Disabled);
        }

        // The scratch name is unique per producer: the temp dir is shared
        // across concurrent wireit processes racing on the same entry.
        static TARBALL_SEQ: AtomicU64 = AtomicU64::new(0);
        let temp = data_dir.ensure_temp_dir().await?;
        let tarball = temp.join(format!(
            "{}.{}.{}.tgz",
            fingerprint.digest(),
            std::process::id(),
            TARBALL_SEQ.fetch_add(1, Ordering::Relaxed),
        ));
        let result = self
            .set_with_tarball(script, fingerprint, outputs, &tarball)
            .await;
        fs::remove_file_if_exists(&tarball).await.ok();
        result
    }

    async fn set_with_tarball(
        &self,
        script: &ScriptReference,
        fingerprint: &Fingerprint,
        outputs: &FileManifest,
        tarball: &std::path::Path,
    ) -> Result<SetOutcome> {
        let size = archive::create(&script.package_dir, outputs, tarball).await?;
        if size > MAX_ARCHIVE_BYTES {
            return Ok(SetOutcome::TooLarge { bytes: size });
        }

        let key = cache_key(script);
        let version = self.cache_version(fingerprint);
        let cache_id = match self.reserve(&key, &version, size).await? {
            Step::Done(Some(id)) => id,
            Step::Done(None) => return Ok(SetOutcome::RaceLost),
            Step::RateLimited => return Ok(rate_limit_set()),
        };

        match self.upload(cache_id, tarball, size).await? {
            Step::Done(()) => {}
            Step::RateLimited => return Ok(rate_limit_set()),
        }
        match self.commit(cache_id, size).await? {
            Step::Done(()) => {}
            Step::RateLimited => return Ok(rate_limit_set()),
        }

        debug!(size, "stored remote cache entry");
        Ok(SetOutcome::Stored)
    }

    async fn reserve(&self, key: &str, version: &str, size: u64) -> Result<Step<Option<u64>>> {
        let url = self.api_url("caches")?;
        let response = self
            .request(self.http.post(url))
            .json(&ReserveRequest { key, version, cache_size: size })
            .send()
            .await
            .context("send cache reserve")?;

        match response.status() {
            StatusCode::CREATED => {
                let reserved = response
                    .json::<ReserveResponse>()
                    .await
                    .context("parse cache reserve response")?;
                Ok(Step::Done(Some(reserved.cache_id)))
            }
            StatusCode::CONFLICT => {
                debug!("another producer reserved this cache entry");
                Ok(Step::Done(None))
            }
            StatusCode::TOO_MANY_REQUESTS => Ok(Step::RateLimited),
            _ => Err(unexpected_status("cache reserve", response).await),
        }
    }

    async fn upload(&self, cache_id: u64, tarball: &std::path::Path, size: u64) -> Result<Step<()>> {
        let url = self.api_url(&format!("caches/{cache_id}"))?;
        let mut file = tokio::fs::File::open(tarball)
            .await
            .with_context(|| format!("open archive: {tarball:?}"))?;

        let mut start = 0u64;
        while start < size {
            let len = CHUNK_BYTES.min(size - start);
            let mut chunk = vec![0u8; len as usize];
            file.seek(SeekFrom::Start(start)).await.context("seek archive")?;
            file.read_exact(&mut chunk).await.context("read archive chunk")?;

            let end = start + len - 1;
            let response = self
                .request(self.http.patch(url.clone()))
                .header(header::CONTENT_TYPE, "application/octet-stream")
                .header(header::CONTENT_RANGE, format!("bytes {start}-{end}/*"))
                .body(chunk)
                .send()
                .await
                .context("send cache upload chunk")?;

            match response.status() {
                status if status.is_success() => {}
                StatusCode::TOO_MANY_REQUESTS => return Ok(Step::RateLimited),
                _ => return Err(unexpected_status("cache upload", response).await),
            }
            debug!(start, end, "uploaded cache chunk");
            start += len;
        }
        Ok(Step::Done(()))
    }

    async fn commit(&self, cache_id: u64, size: u64) -> Result<Step<()>> {
        let url = self.api_url(&format!("caches/{cache_id}"))?;
        let response = self
            .request(self.http.post(url))
            .json(&CommitRequest { size })
            .send()
            .await
            .context("send cache commit")?;

        match response.status() {
            status if status.is_success() => Ok(Step::Done(())),
            StatusCode::TOO_MANY_REQUESTS => Ok(Step::RateLimited),
            _ => Err(unexpected_status("cache commit", response).await),
        }
    }

    /// SHA-256 over the fingerprint digest, compression tag, image OS tag,
    /// and schema salt, `0x1E`-separated.
    fn cache_version(&self, fingerprint: &Fingerprint) -> String {
        let mut hasher = Sha256::new();
        hasher.update(fingerprint.digest().as_bytes());
        hasher.update([VERSION_SEPARATOR]);
        hasher.update(COMPRESSION.as_bytes());
        hasher.update([VERSION_SEPARATOR]);
        hasher.update(self.image_os.as_deref().unwrap_or_default().as_bytes());
        hasher.update([VERSION_SEPARATOR]);
        hasher.update(VERSION_SALT.as_bytes());
        hex::encode(hasher.finalize())
    }
}

fn rate_limit_lookup() -> CacheLookup {
    if trip_rate_limit() {
        CacheLookup::RateLimited
    } else {
        CacheLookup::Miss
    }
}

fn rate_limit_set() -> SetOutcome {
    if trip_rate_limit() {
        SetOutcome::RateLimited
    } else {
        SetOutcome::Disabled
    }
}

/// SHA-256 of the stringified script reference.
pub fn cache_key(script: &ScriptReference) -> String {
    hex::encode(Sha256::digest(script.key().as_str().as_bytes()))
}

async fn unexpected_status(operation: &str, response: Response) -> color_eyre::Report {
    let status = response.status();
    let url = response.url().to_string();
    let body = response.text().await.unwrap_or_default();
    eyre!("unexpected status code during {operation}: {status}")
        .with_section(|| url.header("Url:"))
        .with_section(|| body.header("Body:"))
}

/// A remote hit: the CDN URL to download on apply.
#[derive(Debug)]
pub struct GithubCacheHit {
    #[debug(skip)]
    http: reqwest::Client,
    archive_url: String,
    package_dir: PathBuf,
    temp_dir: PathBuf,
}

impl GithubCacheHit {
    /// Download the archive (unauthenticated; the URL itself is the
    /// secret) and unpack it into the package directory. Consumes the
    /// handle: a hit can only be applied once.
    #[instrument(skip_all, fields(package = ?self.package_dir))]
    pub async fn apply(self) -> Result<()> {
        fs::create_dir_all(&self.temp_dir).await?;
        let download = self.temp_dir.join("download.tgz");

        let response = self
            .http
            .get(&self.archive_url)
            .send()
            .await
            .context("download cache archive")?;
        if !response.status().is_success() {
            return Err(unexpected_status("cache download", response).await);
        }

        let stream = response
            .bytes_stream()
            .map_err(std::io::Error::other)
            .pipe(StreamReader::new);
        let mut reader = stream;
        let mut file = tokio::fs::File::create(&download)
            .await
            .with_context(|| format!("create download file: {download:?}"))?;
        tokio::io::copy(&mut reader, &mut file)
            .await
            .context("write cache archive")?;
        drop(file);

        let result = archive::extract(&download, &self.package_dir).await;
        if let Err(err) = fs::remove_file_if_exists(&download).await {
            warn!(?err, "failed to remove downloaded archive");
        }
        result
    }
}
