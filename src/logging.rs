use std::time::Duration;

use anyhow::{Result, anyhow};
use http::header::CONTENT_LENGTH;
use http::{HeaderMap, StatusCode};
use time::OffsetDateTime;
use tracing_subscriber::{EnvFilter, fmt};

use crate::cli::LogFormat;
use crate::protocol::{CacheRequest, DispatchError};

const DEFAULT_FILTER: &str = "info";

pub fn init_logger(format: LogFormat) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    match format {
        LogFormat::Json => fmt::fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .try_init()
            .map_err(|err| anyhow!(err))?,
        LogFormat::Text => fmt::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .try_init()
            .map_err(|err| anyhow!(err))?,
    }

    Ok(())
}

/// One cache decision for one request.
#[derive(Debug, Clone)]
pub struct CacheEvent {
    pub method: String,
    pub host: String,
    pub path: String,
    pub outcome: String,
    pub status: u16,
    pub content_length: Option<u64>,
    pub elapsed_ms: u128,
    pub error: Option<String>,
    pub disconnect: bool,
}

#[derive(Debug)]
pub struct CacheEventBuilder {
    event: CacheEvent,
}

impl CacheEventBuilder {
    pub fn new(req: &CacheRequest) -> Self {
        Self {
            event: CacheEvent {
                method: req.method.to_string(),
                host: req.host.clone(),
                path: req.path.clone(),
                outcome: String::from("unknown"),
                status: 0,
                content_length: None,
                elapsed_ms: 0,
                error: None,
                disconnect: false,
            },
        }
    }

    pub fn outcome(mut self, outcome: impl Into<String>) -> Self {
        self.event.outcome = outcome.into();
        self
    }

    pub fn status(mut self, status: StatusCode) -> Self {
        self.event.status = status.as_u16();
        self
    }

    /// Takes the length from the response headers when one was declared.
    pub fn content_length(mut self, headers: &HeaderMap) -> Self {
        self.event.content_length = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        self
    }

    pub fn elapsed(mut self, elapsed: Duration) -> Self {
        self.event.elapsed_ms = elapsed.as_millis();
        self
    }

    pub fn error(mut self, err: &DispatchError) -> Self {
        self.event.disconnect = err.is_disconnect();
        self.event.error = Some(err.to_string());
        self
    }

    pub fn build(self) -> CacheEvent {
        self.event
    }

    pub fn log(self) {
        log_cache_event(self.build());
    }
}

pub fn log_cache_event(event: CacheEvent) {
    let CacheEvent {
        method,
        host,
        path,
        outcome,
        status,
        content_length,
        elapsed_ms,
        error,
        disconnect,
    } = event;

    let now = OffsetDateTime::now_utc();
    let (year, month, day) = now.to_calendar_date();
    let (hour, minute, second) = now.to_hms();
    let millisecond = now.millisecond();
    let month_number: u8 = month.into();
    let ts = format!(
        "{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}.{millisecond:03}Z",
        month = month_number
    );

    let error_field = error.as_deref();

    tracing::info!(
        target = "cache_event",
        ts,
        method,
        host,
        path,
        outcome,
        status,
        content_length,
        elapsed_ms,
        error = error_field,
        disconnect
    );
}
