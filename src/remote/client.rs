use std::pin::Pin;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use rand::Rng;
use reqwest::{Body, Client, RequestBuilder, Response};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::path::RelPath;
use crate::remote::types::{RemoteDirent, VolumeStats, WriteReply};

/// Lazily consumed body of a range read.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Stateless HTTP transport over the storage service's wire contract.
///
/// Idempotent calls are retried with jittered exponential backoff; streamed
/// writes get exactly one attempt because their body cannot be replayed once
/// bytes have gone out on the wire.
#[derive(Debug, Clone)]
pub struct RemoteClient {
    base_url: String,
    client: Client,
    request_timeout: Duration,
    retry_attempts: u32,
    retry_base_delay: Duration,
    retry_deadline: Duration,
}

impl RemoteClient {
    pub fn new(base_url: &str) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            request_timeout: Duration::from_secs(10),
            retry_attempts: 3,
            retry_base_delay: Duration::from_millis(100),
            retry_deadline: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_retries(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts.max(1);
        self
    }

    pub fn with_retry_deadline(mut self, deadline: Duration) -> Self {
        self.retry_deadline = deadline;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.base_url, endpoint)
    }

    /// Send a request that is safe to repeat, retrying transport errors and
    /// 5xx responses until the attempt or wall-time budget runs out.
    async fn send_idempotent<F>(&self, what: &str, mut build: F) -> Result<Response>
    where
        F: FnMut() -> RequestBuilder,
    {
        let started = Instant::now();
        let mut delay = self.retry_base_delay;

        for attempt in 1..=self.retry_attempts {
            let err = match timeout(self.request_timeout, build().send()).await {
                Err(_) => Error::Transport(format!(
                    "{} timed out after {:?}",
                    what, self.request_timeout
                )),
                Ok(Err(e)) => e.into(),
                Ok(Ok(resp)) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp);
                    }
                    let detail = resp.text().await.unwrap_or_default();
                    if status.is_server_error() {
                        Error::Transport(format!("{}: HTTP {} - {}", what, status.as_u16(), detail))
                    } else {
                        return Err(Error::from_status(
                            status,
                            &format!("{} failed: {}", what, detail),
                        ));
                    }
                }
            };

            let out_of_budget = attempt >= self.retry_attempts
                || started.elapsed() + delay >= self.retry_deadline;
            if !err.is_retriable() || out_of_budget {
                return Err(err);
            }

            warn!(
                "{} attempt {}/{} failed ({}), retrying in {:?}",
                what, attempt, self.retry_attempts, err, delay
            );
            tokio::time::sleep(jittered(delay)).await;
            delay = delay.saturating_mul(2);
        }

        unreachable!("retry loop always returns")
    }

    /// GET /list - full listing of one directory, in server order.
    pub async fn list(&self, path: &RelPath) -> Result<Vec<RemoteDirent>> {
        let resp = self
            .send_idempotent("list", || {
                self.client
                    .get(self.url("/list"))
                    .query(&[("relPath", path.as_str())])
            })
            .await?;
        let entries = resp.json::<Vec<RemoteDirent>>().await?;
        debug!("list {}: {} entries", path, entries.len());
        Ok(entries)
    }

    /// GET /list/updatedMetadata - single metadata row; 404 when untracked.
    pub async fn stats(&self, path: &RelPath) -> Result<RemoteDirent> {
        let resp = self
            .send_idempotent("stats", || {
                self.client
                    .get(self.url("/list/updatedMetadata"))
                    .query(&[("relPath", path.as_str())])
            })
            .await?;
        Ok(resp.json::<RemoteDirent>().await?)
    }

    /// GET /stats - volume summary.
    pub async fn statfs(&self) -> Result<VolumeStats> {
        let resp = self
            .send_idempotent("statfs", || self.client.get(self.url("/stats")))
            .await?;
        Ok(resp.json::<VolumeStats>().await?)
    }

    /// GET /files with a `Range` header. The returned stream back-pressures
    /// on the consumer; nothing beyond the transport's own buffering is held
    /// in memory.
    pub async fn read_range(
        &self,
        path: &RelPath,
        start: u64,
        end_inclusive: u64,
    ) -> Result<ByteStream> {
        let range = format!("bytes={}-{}", start, end_inclusive);
        let resp = self
            .send_idempotent("read", || {
                self.client
                    .get(self.url("/files"))
                    .query(&[("relPath", path.as_str())])
                    .header(reqwest::header::RANGE, &range)
            })
            .await?;

        let stream = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| Error::Transport(format!("read body: {}", e))));
        Ok(Box::pin(stream))
    }

    /// PUT /files?relPath=P&offset=N consuming a lazy body stream.
    ///
    /// At `offset=0` the server truncates the file to the body length; at any
    /// other offset the bytes overlay without shrinking. Not retried: the
    /// body is gone after the first attempt.
    pub async fn write_at<S>(&self, path: &RelPath, offset: u64, body: S) -> Result<u64>
    where
        S: Stream<Item = std::io::Result<Bytes>> + Send + 'static,
    {
        let resp = self
            .client
            .put(self.url("/files"))
            .query(&[("relPath", path.as_str()), ("offset", &offset.to_string())])
            .body(Body::wrap_stream(body))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(Error::from_status(
                status,
                &format!("write {} failed: {}", path, detail),
            ));
        }

        let written = resp
            .json::<WriteReply>()
            .await
            .map(|r| r.written)
            .unwrap_or(0);
        debug!("write {} offset={} written={}", path, offset, written);
        Ok(written)
    }

    /// Whole-buffer variant of [`write_at`] for small payloads (create,
    /// single random-offset writes).
    pub async fn write_bytes(&self, path: &RelPath, offset: u64, data: Bytes) -> Result<u64> {
        let resp = timeout(
            self.request_timeout,
            self.client
                .put(self.url("/files"))
                .query(&[("relPath", path.as_str()), ("offset", &offset.to_string())])
                .body(data)
                .send(),
        )
        .await
        .map_err(|_| {
            Error::Transport(format!(
                "write timed out after {:?}",
                self.request_timeout
            ))
        })??;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(Error::from_status(
                status,
                &format!("write {} failed: {}", path, detail),
            ));
        }
        Ok(resp
            .json::<WriteReply>()
            .await
            .map(|r| r.written)
            .unwrap_or(0))
    }

    /// POST /mkdir - 409 when the directory already exists.
    pub async fn mkdir(&self, path: &RelPath) -> Result<()> {
        let resp = timeout(
            self.request_timeout,
            self.client
                .post(self.url("/mkdir"))
                .query(&[("relPath", path.as_str())])
                .send(),
        )
        .await
        .map_err(|_| Error::Transport("mkdir timed out".to_string()))??;

        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            let detail = resp.text().await.unwrap_or_default();
            Err(Error::from_status(
                status,
                &format!("mkdir {} failed: {}", path, detail),
            ))
        }
    }

    /// DELETE /files - removes a file, or a directory recursively.
    pub async fn delete(&self, path: &RelPath) -> Result<()> {
        self.send_idempotent("delete", || {
            self.client
                .delete(self.url("/files"))
                .query(&[("relPath", path.as_str())])
        })
        .await
        .map(|_| ())
    }

    /// PATCH /files/chmod - `perm` travels as an octal string.
    pub async fn chmod(&self, path: &RelPath, mode: u32) -> Result<()> {
        let perm = format!("{:o}", mode & 0o777);
        self.send_idempotent("chmod", || {
            self.client
                .patch(self.url("/files/chmod"))
                .query(&[("relPath", path.as_str()), ("perm", perm.as_str())])
        })
        .await
        .map(|_| ())
    }

    /// PATCH /files/truncate.
    pub async fn truncate(&self, path: &RelPath, size: u64) -> Result<()> {
        let size = size.to_string();
        self.send_idempotent("truncate", || {
            self.client
                .patch(self.url("/files/truncate"))
                .query(&[("relPath", path.as_str()), ("size", size.as_str())])
        })
        .await
        .map(|_| ())
    }

    /// PATCH /files/utimes - either timestamp may be omitted.
    pub async fn utimes(
        &self,
        path: &RelPath,
        atime_s: Option<i64>,
        mtime_s: Option<i64>,
    ) -> Result<()> {
        let mut query: Vec<(&str, String)> = vec![("relPath", path.as_str().to_string())];
        if let Some(a) = atime_s {
            query.push(("atime", a.to_string()));
        }
        if let Some(m) = mtime_s {
            query.push(("mtime", m.to_string()));
        }
        self.send_idempotent("utimes", || {
            self.client.patch(self.url("/files/utimes")).query(&query)
        })
        .await
        .map(|_| ())
    }

    /// PATCH /files/rename - server-side overwrite when the target exists.
    pub async fn rename(&self, old: &RelPath, new: &RelPath) -> Result<()> {
        self.send_idempotent("rename", || {
            self.client.patch(self.url("/files/rename")).query(&[
                ("oldRelPath", old.as_str()),
                ("newRelPath", new.as_str()),
            ])
        })
        .await
        .map(|_| ())
    }
}

fn jittered(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.5..1.5);
    delay.mul_f64(factor)
}
