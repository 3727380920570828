//! Serializes requests against a link that allows one round trip at a time.
//!
//! Every request runs on a single worker task, strictly in the order
//! [`RequestQueue::enqueue`] was called. Request N+1 starts only after
//! request N resolved (success, failure or timeout) and the configured
//! spacing elapsed.
//!
//! Responses are not tagged on the wire: the producer of the active request
//! takes the next matching frame. The queue is what makes that assumption
//! hold; a link that reorders notifications is not supported.

use crate::config::ManagerConfig;
use crate::{Error, Result};
use futures::future::{BoxFuture, FutureExt};
use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Deadline and retry budget of a single request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// Deadline per attempt; `None` waits forever.
    pub timeout: Option<Duration>,
    /// Extra attempts after a retryable failure.
    pub retries: u8,
}

impl RequestOptions {
    /// Reads: deadline plus the configured retry.
    pub fn get(config: &ManagerConfig) -> Self {
        Self {
            timeout: Some(config.request_timeout),
            retries: config.get_retries,
        }
    }

    /// Writes are an explicit user action and never repeated.
    pub fn set(config: &ManagerConfig) -> Self {
        Self {
            timeout: Some(config.request_timeout),
            retries: 0,
        }
    }
}

type Job = Box<dyn FnOnce(Duration) -> BoxFuture<'static, ()> + Send>;

struct QueuedRequest {
    name: String,
    job: Job,
}

/// FIFO of deferred requests executed one at a time.
///
/// Must be created inside a tokio runtime. Dropping the queue stops the
/// worker; requests still waiting then resolve with
/// [`Error::ConnectionUnavailable`].
#[derive(Debug)]
pub struct RequestQueue {
    tx: mpsc::UnboundedSender<QueuedRequest>,
    worker: JoinHandle<()>,
}

impl RequestQueue {
    pub fn new(spacing: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(Self::run(rx, spacing));
        Self { tx, worker }
    }

    async fn run(mut rx: mpsc::UnboundedReceiver<QueuedRequest>, spacing: Duration) {
        let mut last_execution: Option<Instant> = None;
        while let Some(request) = rx.recv().await {
            if let Some(last) = last_execution {
                if let Some(time_until_delay_reached) = spacing.checked_sub(last.elapsed()) {
                    tokio::time::sleep(time_until_delay_reached).await;
                }
            }
            log::debug!("Executing request '{}'", request.name);
            (request.job)(spacing).await;
            last_execution = Some(Instant::now());
        }
        log::trace!("Request queue closed");
    }

    /// Appends a request and returns a future resolving with its result.
    ///
    /// The request is queued immediately, not when the returned future is
    /// first polled. `producer` is called once per attempt and must perform
    /// exactly one write and wait for its answer.
    pub fn enqueue<T, F, Fut>(
        &self,
        name: &str,
        options: RequestOptions,
        producer: F,
    ) -> impl Future<Output = Result<T>> + Send + 'static
    where
        T: Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job_name = name.to_string();
        let job: Job = Box::new(move |spacing| {
            async move {
                let result = execute(&job_name, options, spacing, producer).await;
                if tx.send(result).is_err() {
                    log::trace!("Caller of '{job_name}' went away before it resolved");
                }
            }
            .boxed()
        });
        let queued = self
            .tx
            .send(QueuedRequest {
                name: name.to_string(),
                job,
            })
            .is_ok();
        if !queued {
            log::debug!("Request queue closed, rejecting '{name}'");
        }
        async move {
            if !queued {
                return Err(Error::ConnectionUnavailable);
            }
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(Error::ConnectionUnavailable),
            }
        }
    }
}

impl Drop for RequestQueue {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

async fn execute<T, F, Fut>(
    name: &str,
    options: RequestOptions,
    spacing: Duration,
    mut producer: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let tries = u32::from(options.retries) + 1;
    let mut attempt = 1;
    loop {
        let result = match options.timeout {
            Some(deadline) => match tokio::time::timeout(deadline, producer()).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout),
            },
            None => producer().await,
        };
        match result {
            Ok(value) => return Ok(value),
            Err(err) if attempt < tries && err.is_retryable() => {
                log::trace!("Failed try {attempt} of {tries} for '{name}', repeating ({err})");
                attempt += 1;
                tokio::time::sleep(spacing).await;
            }
            Err(Error::Timeout) => {
                log::warn!("Request '{name}' timed out after {attempt} tries");
                return Err(Error::Timeout);
            }
            Err(err) => {
                log::debug!("Request '{name}' failed: {err}");
                return Err(err);
            }
        }
    }
}
