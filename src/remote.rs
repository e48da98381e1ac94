use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use reqwest::blocking::Client;
use reqwest::blocking::multipart::Form;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::BeaconError;

const CANCEL_CHECK_SLICE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queueing,
    Running,
    Completed,
}

impl JobStatus {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "QUEUEING" => Some(JobStatus::Queueing),
            "RUNNING" => Some(JobStatus::Running),
            "COMPLETED" => Some(JobStatus::Completed),
            _ => None,
        }
    }
}

/// Outstanding remote job; lives only as long as its poll loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub results_url: String,
}

/// Cooperative cancellation shared between a scheduler and its workers.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sleeps for `duration`, waking early (with an error) on cancel.
    pub fn sleep(&self, duration: Duration, what: &str) -> Result<(), BeaconError> {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return Err(BeaconError::Cancelled(what.to_string()));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::sleep((deadline - now).min(CANCEL_CHECK_SLICE));
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PollBudget {
    pub interval: Duration,
    pub timeout: Option<Duration>,
}

impl PollBudget {
    pub fn new(interval: Duration, timeout: Option<Duration>) -> Self {
        Self { interval, timeout }
    }
}

/// Wire protocol of the QMEAN submission service.
pub trait QmeanTransport: Send + Sync {
    fn submit(&self, structure: &Path, email: &str) -> Result<JobHandle, BeaconError>;
    fn check(&self, job: &JobHandle) -> Result<Value, BeaconError>;
}

#[derive(Clone)]
pub struct QmeanHttpClient {
    client: Client,
    submit_url: String,
}

impl QmeanHttpClient {
    pub fn new(submit_url: &str) -> Result<Self, BeaconError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("beacon/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| BeaconError::RemoteHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| BeaconError::RemoteHttp(err.to_string()))?;
        Ok(Self::with_client(client, submit_url))
    }

    pub fn with_client(client: Client, submit_url: &str) -> Self {
        Self {
            client,
            submit_url: submit_url.to_string(),
        }
    }

    fn handle_status(
        response: reqwest::blocking::Response,
    ) -> Result<reqwest::blocking::Response, BeaconError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "QMEAN request failed".to_string());
        Err(BeaconError::RemoteService { status, message })
    }

    /// Retries transient failures of idempotent status checks only.
    fn get_with_retries(&self, url: &str) -> Result<reqwest::blocking::Response, BeaconError> {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            match self.client.get(url).send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && (err.is_timeout() || err.is_connect()) {
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                        attempt += 1;
                        continue;
                    }
                    return Err(BeaconError::RemoteHttp(err.to_string()));
                }
            }
        }
    }
}

impl QmeanTransport for QmeanHttpClient {
    fn submit(&self, structure: &Path, email: &str) -> Result<JobHandle, BeaconError> {
        let form = Form::new()
            .text("email", email.to_string())
            .file("structure", structure)
            .map_err(|err| {
                BeaconError::Filesystem(format!("read {}: {err}", structure.display()))
            })?;
        debug!(url = %self.submit_url, structure = %structure.display(), "submitting QMEAN job");
        let response = self
            .client
            .post(&self.submit_url)
            .multipart(form)
            .send()
            .map_err(|err| BeaconError::RemoteHttp(err.to_string()))?;
        let response = Self::handle_status(response)?;
        let body: Value = response
            .json()
            .map_err(|err| BeaconError::RemoteHttp(err.to_string()))?;
        parse_submit_response(&body)
    }

    fn check(&self, job: &JobHandle) -> Result<Value, BeaconError> {
        let response = self.get_with_retries(&job.results_url)?;
        let response = Self::handle_status(response)?;
        response
            .json()
            .map_err(|err| BeaconError::RemoteHttp(err.to_string()))
    }
}

pub fn parse_submit_response(body: &Value) -> Result<JobHandle, BeaconError> {
    let results_url = body
        .get("results_json")
        .and_then(|value| value.as_str())
        .ok_or_else(|| {
            BeaconError::RemoteHttp("submit response is missing 'results_json'".to_string())
        })?;
    Ok(JobHandle {
        results_url: results_url.to_string(),
    })
}

/// Submit-then-poll client around a [`QmeanTransport`].
pub struct JobPoller<T: QmeanTransport> {
    transport: T,
    budget: PollBudget,
}

impl<T: QmeanTransport> JobPoller<T> {
    pub fn new(transport: T, budget: PollBudget) -> Self {
        Self { transport, budget }
    }

    pub fn submit(&self, structure: &Path, email: &str) -> Result<JobHandle, BeaconError> {
        let job = self.transport.submit(structure, email)?;
        info!(job = %job.results_url, "QMEAN job submitted");
        Ok(job)
    }

    /// Polls until `COMPLETED` and returns that response body. Unknown
    /// statuses are fatal.
    pub fn poll(&self, job: &JobHandle, cancel: &CancelToken) -> Result<Value, BeaconError> {
        let started = Instant::now();
        let mut checks = 0u64;
        loop {
            if cancel.is_cancelled() {
                return Err(BeaconError::Cancelled(job.results_url.clone()));
            }
            let body = self.transport.check(job)?;
            checks += 1;
            let status = body
                .get("status")
                .and_then(|value| value.as_str())
                .unwrap_or("<missing>");
            match JobStatus::parse(status) {
                Some(JobStatus::Completed) => {
                    info!(job = %job.results_url, checks, "QMEAN job completed");
                    return Ok(body);
                }
                Some(JobStatus::Queueing | JobStatus::Running) => {
                    debug!(job = %job.results_url, status, checks, "QMEAN job pending");
                }
                None => {
                    return Err(BeaconError::UnknownJobStatus {
                        status: status.to_string(),
                        job: job.results_url.clone(),
                    });
                }
            }
            if let Some(timeout) = self.budget.timeout {
                if started.elapsed() + self.budget.interval > timeout {
                    return Err(BeaconError::PollTimeout {
                        job: job.results_url.clone(),
                        waited_secs: started.elapsed().as_secs(),
                    });
                }
            }
            cancel.sleep(self.budget.interval, &job.results_url)?;
        }
    }

    pub fn run(
        &self,
        structure: &Path,
        email: &str,
        cancel: &CancelToken,
    ) -> Result<Value, BeaconError> {
        let job = self.submit(structure, email)?;
        self.poll(&job, cancel)
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}
