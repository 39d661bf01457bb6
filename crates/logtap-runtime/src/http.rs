//! Asynchronous worker-pool HTTP client.
//!
//! Requests are POSTed fire-and-forget by a fixed set of worker tasks, each
//! consuming its own bounded channel with its own connection pool. Response
//! bodies are ignored; transport failures and non-2xx statuses become
//! [`HttpError`] records on a shared error channel the sandbox drains into
//! the script's `on_http_error` hook.
//!
//! The error channel is unbounded on purpose: workers must never block
//! while reporting, otherwise a builtin blocking on a full request channel
//! could wedge against the error poller waiting for the VM lock.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::HttpConfig;

/// Errors from the HTTP client itself (as opposed to failed requests,
/// which are reported through the error channel).
#[derive(Debug, thiserror::Error)]
pub enum HttpClientError {
    /// Invalid configuration at construction.
    #[error("config error: {0}")]
    InvalidConfig(String),

    /// Affinity beyond the last worker slot.
    #[error("cannot pass affinity greater than {max} (only {concurrency} channels available)")]
    AffinityOutOfRange {
        /// Largest valid affinity.
        max: i64,
        /// Configured worker count.
        concurrency: usize,
    },

    /// The client was used after `close`.
    #[error("http client used before init or after close")]
    Uninitialized,

    /// A worker channel was unexpectedly closed.
    #[error("http worker channel closed")]
    ChannelClosed,
}

/// A failed HTTP request: either a transport error or a non-2xx response.
#[derive(Debug, Clone)]
pub struct HttpError {
    /// Request URL.
    pub url: String,
    /// Request method.
    pub method: String,
    /// Failure description.
    pub error: String,
}

#[derive(Debug)]
struct PostRequest {
    url: String,
    body: String,
    content_type: String,
    submitted: Instant,
}

#[derive(Debug)]
struct Workers {
    senders: Vec<mpsc::Sender<PostRequest>>,
    quit_tx: mpsc::UnboundedSender<usize>,
    quit_rx: mpsc::UnboundedReceiver<usize>,
}

/// Worker-pool HTTP POST dispatcher.
///
/// Within one affinity slot requests are dispatched in submission order;
/// across slots, order is unspecified.
#[derive(Debug)]
pub struct AsyncHttpClient {
    cfg: HttpConfig,
    handle: Handle,
    error_tx: mpsc::UnboundedSender<HttpError>,
    // serializes post against flush so no submission races a flush boundary
    workers: Mutex<Workers>,
}

impl AsyncHttpClient {
    /// Build the client and spawn its workers on `handle`. Returns the
    /// receiving end of the shared error channel.
    ///
    /// # Errors
    ///
    /// Fails on invalid configuration or when a reqwest client cannot be
    /// constructed.
    pub fn new(
        cfg: HttpConfig,
        handle: Handle,
    ) -> Result<(Self, mpsc::UnboundedReceiver<HttpError>), HttpClientError> {
        cfg.validate().map_err(HttpClientError::InvalidConfig)?;

        let (error_tx, error_rx) = mpsc::unbounded_channel();
        let (quit_tx, quit_rx) = mpsc::unbounded_channel();
        let senders = spawn_workers(&cfg, &handle, &error_tx, &quit_tx)?;

        let client = Self {
            cfg,
            handle,
            error_tx,
            workers: Mutex::new(Workers {
                senders,
                quit_tx,
                quit_rx,
            }),
        };
        Ok((client, error_rx))
    }

    /// Configured worker count.
    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.cfg.concurrency
    }

    /// Submit a POST. A non-negative affinity selects that worker's channel
    /// and blocks when it is full; a negative affinity takes the first
    /// worker with free capacity and, when all are full, blocks on worker 0.
    ///
    /// # Errors
    ///
    /// Fails when `affinity` exceeds the last worker slot or the client has
    /// been closed.
    pub fn post(
        &self,
        url: &str,
        body: &str,
        content_type: &str,
        affinity: i64,
    ) -> Result<(), HttpClientError> {
        let workers = lock_workers(&self.workers);
        if workers.senders.is_empty() {
            return Err(HttpClientError::Uninitialized);
        }

        debug!(url, affinity, "http post submit");
        let request = PostRequest {
            url: url.to_owned(),
            body: body.to_owned(),
            content_type: content_type.to_owned(),
            submitted: Instant::now(),
        };
        dispatch(request, affinity, &workers.senders)
    }

    /// Wait for all currently queued requests to finish, then restore the
    /// worker pool. Blocks the calling thread; must not be called from an
    /// async context.
    pub fn flush(&self) {
        let mut workers = lock_workers(&self.workers);
        stop_workers(&mut workers);
        // respawn errors only repeat the construction-time validation
        if let Ok(senders) = spawn_workers(&self.cfg, &self.handle, &self.error_tx, &workers.quit_tx)
        {
            workers.senders = senders;
        }
    }

    /// Flush and tear down the worker pool. Any later use of the client is
    /// an error. Blocks the calling thread; must not be called from an
    /// async context.
    pub fn close(&self) {
        let mut workers = lock_workers(&self.workers);
        stop_workers(&mut workers);
    }
}

fn lock_workers(workers: &Mutex<Workers>) -> MutexGuard<'_, Workers> {
    workers.lock().unwrap_or_else(PoisonError::into_inner)
}

fn stop_workers(workers: &mut Workers) {
    let count = workers.senders.len();
    workers.senders.clear();
    for _ in 0..count {
        // each worker sends one sentinel as it drains and exits
        let _ = workers.quit_rx.blocking_recv();
    }
}

fn spawn_workers(
    cfg: &HttpConfig,
    handle: &Handle,
    error_tx: &mpsc::UnboundedSender<HttpError>,
    quit_tx: &mpsc::UnboundedSender<usize>,
) -> Result<Vec<mpsc::Sender<PostRequest>>, HttpClientError> {
    let mut senders = Vec::with_capacity(cfg.concurrency);
    for id in 0..cfg.concurrency {
        let client = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .map_err(|e| HttpClientError::InvalidConfig(e.to_string()))?;
        let (tx, rx) = mpsc::channel(cfg.channel_buffer);
        handle.spawn(worker(id, client, rx, error_tx.clone(), quit_tx.clone()));
        senders.push(tx);
    }
    Ok(senders)
}

fn dispatch(
    mut request: PostRequest,
    affinity: i64,
    senders: &[mpsc::Sender<PostRequest>],
) -> Result<(), HttpClientError> {
    let max = senders.len() as i64 - 1;
    if affinity > max {
        return Err(HttpClientError::AffinityOutOfRange {
            max,
            concurrency: senders.len(),
        });
    }

    if affinity >= 0 {
        #[allow(clippy::cast_sign_loss)]
        return senders[affinity as usize]
            .blocking_send(request)
            .map_err(|_| HttpClientError::ChannelClosed);
    }

    // fire-and-forget: first worker with free capacity wins
    for sender in senders {
        match sender.try_send(request) {
            Ok(()) => return Ok(()),
            Err(mpsc::error::TrySendError::Full(r)) => request = r,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                return Err(HttpClientError::ChannelClosed)
            }
        }
    }

    // all full: block the caller on worker 0
    senders[0]
        .blocking_send(request)
        .map_err(|_| HttpClientError::ChannelClosed)
}

async fn worker(
    id: usize,
    client: reqwest::Client,
    mut rx: mpsc::Receiver<PostRequest>,
    error_tx: mpsc::UnboundedSender<HttpError>,
    quit_tx: mpsc::UnboundedSender<usize>,
) {
    while let Some(request) = rx.recv().await {
        debug!(worker = id, url = %request.url, "http post attempt");
        let outcome = post_request(&client, &request).await;
        let duration_ms = request.submitted.elapsed().as_millis() as u64;
        match outcome {
            Ok(()) => {
                debug!(worker = id, url = %request.url, duration_ms, "http post success");
            }
            Err(error) => {
                debug!(worker = id, url = %request.url, duration_ms, %error, "http post failure");
                let _ = error_tx.send(HttpError {
                    url: request.url,
                    method: "POST".to_owned(),
                    error,
                });
            }
        }
    }
    let _ = quit_tx.send(id);
}

async fn post_request(client: &reqwest::Client, request: &PostRequest) -> Result<(), String> {
    let response = client
        .post(&request.url)
        .header(reqwest::header::CONTENT_TYPE, &request.content_type)
        .body(request.body.clone())
        .send()
        .await
        .map_err(|e| e.to_string())?;

    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    match response.text().await {
        Ok(body) if !body.is_empty() => Err(format!(
            "request to '{}' status: {status}: {body}",
            request.url
        )),
        _ => Err(format!("request to '{}' status: {status}", request.url)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn request(url: &str) -> PostRequest {
        PostRequest {
            url: url.to_owned(),
            body: "{}".to_owned(),
            content_type: "application/json".to_owned(),
            submitted: Instant::now(),
        }
    }

    fn channels(n: usize, buffer: usize) -> (Vec<mpsc::Sender<PostRequest>>, Vec<mpsc::Receiver<PostRequest>>) {
        (0..n).map(|_| mpsc::channel(buffer)).unzip()
    }

    #[test]
    fn positive_affinity_targets_that_worker_only() {
        let (senders, mut receivers) = channels(4, 4);
        dispatch(request("http://a"), 2, &senders).unwrap();

        assert_eq!(receivers[2].try_recv().unwrap().url, "http://a");
        for (i, rx) in receivers.iter_mut().enumerate() {
            if i != 2 {
                assert!(rx.try_recv().is_err(), "worker {i} must stay empty");
            }
        }
    }

    #[test]
    fn negative_affinity_picks_first_free_worker() {
        let (senders, mut receivers) = channels(4, 1);
        // fill worker 0
        senders[0].try_send(request("http://fill")).unwrap();

        dispatch(request("http://a"), -1, &senders).unwrap();
        assert_eq!(receivers[1].try_recv().unwrap().url, "http://a");
        assert!(receivers[2].try_recv().is_err());
        assert!(receivers[3].try_recv().is_err());
    }

    #[test]
    fn negative_affinity_prefers_worker_zero_when_free() {
        let (senders, mut receivers) = channels(4, 1);
        dispatch(request("http://a"), -1, &senders).unwrap();
        assert_eq!(receivers[0].try_recv().unwrap().url, "http://a");
    }

    #[test]
    fn affinity_beyond_last_slot_is_an_error() {
        let (senders, _receivers) = channels(4, 1);
        let err = dispatch(request("http://a"), 4, &senders).unwrap_err();
        assert!(
            matches!(
                err,
                HttpClientError::AffinityOutOfRange {
                    max: 3,
                    concurrency: 4,
                }
            ),
            "expected AffinityOutOfRange, got {err:?}"
        );
    }

    #[test]
    fn invalid_config_fails_initialization() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let cfg = HttpConfig {
            concurrency: 0,
            ..Default::default()
        };
        let err = AsyncHttpClient::new(cfg, runtime.handle().clone()).unwrap_err();
        assert!(matches!(err, HttpClientError::InvalidConfig(_)));
    }

    #[test]
    fn post_after_close_is_an_error() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let (client, _errors) =
            AsyncHttpClient::new(HttpConfig::default(), runtime.handle().clone()).unwrap();
        client.close();
        let err = client.post("http://localhost:9", "{}", "application/json", -1);
        assert!(matches!(err, Err(HttpClientError::Uninitialized)));
    }

    #[test]
    fn flush_restores_the_worker_pool() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let cfg = HttpConfig {
            timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let (client, mut errors) = AsyncHttpClient::new(cfg, runtime.handle().clone()).unwrap();

        // nothing is listening on this port; the request must fail and the
        // failure must be reported through the error channel
        client
            .post("http://127.0.0.1:1/x", "{}", "text/plain", 1)
            .unwrap();
        client.flush();

        let reported = errors.try_recv().expect("flush must drain in-flight work");
        assert_eq!(reported.url, "http://127.0.0.1:1/x");
        assert_eq!(reported.method, "POST");

        // the pool is usable again after flush
        client
            .post("http://127.0.0.1:1/y", "{}", "text/plain", 0)
            .unwrap();
        client.close();
    }
}
