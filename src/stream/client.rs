//! AgriWeb API client.
//!
//! Two request shapes: the department search, answered with a long-lived
//! event stream, and the commune search, answered with a single partial
//! result. Recorded stream transcripts can be replayed through the same
//! event pipeline.

use crate::config::{ApiConfig, SearchConfig};
use crate::layers::session::{CancellationSignal, SearchTicket};
use crate::models::{DecodeError, PartialResult};
use crate::stream::sse::{SseFrame, SseParser, StreamEvent};
use futures::StreamExt;
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use std::future::Future;
use std::sync::atomic::Ordering;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(25);
const MAX_ERROR_BODY: usize = 512;

/// Errors from the streaming and single-shot sources.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("HTTP request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("server returned {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("API error: {0}")]
    Api(String),

    #[error("invalid result payload: {0}")]
    Decode(#[from] DecodeError),

    #[error("search cancelled")]
    Cancelled,
}

/// How a stream stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    /// The server sent `end`.
    Ended,
    /// The server sent `error`.
    Failed,
    /// The connection closed without a terminal event.
    Closed,
}

/// HTTP client bound to one AgriWeb server.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl ApiClient {
    /// Create a client from the `[api]` settings.
    ///
    /// Only the connection is time-limited on the client itself: event
    /// streams may legitimately stay open for a long time.
    pub fn new(config: &ApiConfig) -> Result<Self, StreamError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .build()?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(config.timeout_seconds),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Run a department search and deliver its events in arrival order.
    ///
    /// Returns after the first terminal event, when the server closes the
    /// connection, or with [`StreamError::Cancelled`] once the ticket's
    /// signal is raised.
    pub async fn stream_department<F>(
        &self,
        department: &str,
        search: &SearchConfig,
        ticket: &SearchTicket,
        mut on_event: F,
    ) -> Result<StreamOutcome, StreamError>
    where
        F: FnMut(StreamEvent),
    {
        let url = self.endpoint("/generate_reports_by_dept_sse");
        info!("Opening department stream for {} at {}", department, url);

        let request = self
            .http
            .get(&url)
            .query(&department_params(department, search))
            .header(ACCEPT, "text/event-stream")
            .send();
        let response = await_or_cancel(request, &ticket.cancel).await??;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StreamError::Status {
                status,
                body: truncate(&body),
            });
        }

        let mut bytes = response.bytes_stream();
        let mut parser = SseParser::default();

        while let Some(chunk) = await_or_cancel(bytes.next(), &ticket.cancel).await? {
            let chunk = chunk?;
            if let Some(outcome) = dispatch(parser.feed(&chunk), &mut on_event) {
                return Ok(outcome);
            }
        }

        if !parser.is_empty_buffer() {
            debug!("Discarding incomplete trailing SSE frame");
        }
        Ok(StreamOutcome::Closed)
    }

    /// Run a commune search. The server answers with one partial result, or
    /// with an `{"error": "..."}` object.
    pub async fn search_commune(
        &self,
        commune: &str,
        search: &SearchConfig,
    ) -> Result<PartialResult, StreamError> {
        let url = self.endpoint("/search_by_commune");
        info!("Querying commune {} at {}", commune, url);

        let response = self
            .http
            .get(&url)
            .query(&commune_params(commune, search))
            .timeout(self.timeout)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;

        commune_response(status, &body)
    }
}

fn commune_response(status: StatusCode, body: &str) -> Result<PartialResult, StreamError> {
    match PartialResult::from_json(body) {
        Ok(result) => {
            if let Some(message) = result.error() {
                Err(StreamError::Api(message.to_string()))
            } else if !status.is_success() {
                Err(StreamError::Status {
                    status,
                    body: truncate(body),
                })
            } else {
                Ok(result)
            }
        }
        Err(_) if !status.is_success() => Err(StreamError::Status {
            status,
            body: truncate(body),
        }),
        Err(e) => Err(e.into()),
    }
}

/// Replay a recorded SSE transcript through the event pipeline.
pub fn replay_transcript<F>(
    transcript: &str,
    ticket: &SearchTicket,
    mut on_event: F,
) -> Result<StreamOutcome, StreamError>
where
    F: FnMut(StreamEvent),
{
    for frame in SseParser::parse_frames(transcript) {
        if ticket.is_cancelled() {
            return Err(StreamError::Cancelled);
        }
        if let Some(outcome) = dispatch(vec![frame], &mut on_event) {
            return Ok(outcome);
        }
    }
    Ok(StreamOutcome::Closed)
}

/// Deliver decoded frames; stop at the first terminal event.
fn dispatch<F>(frames: Vec<SseFrame>, on_event: &mut F) -> Option<StreamOutcome>
where
    F: FnMut(StreamEvent),
{
    for frame in frames {
        let Some(event) = StreamEvent::from_frame(frame) else {
            continue;
        };
        if !event.is_terminal() {
            on_event(event);
            continue;
        }
        let outcome = match event {
            StreamEvent::Error(_) => StreamOutcome::Failed,
            _ => StreamOutcome::Ended,
        };
        on_event(event);
        return Some(outcome);
    }
    None
}

async fn await_or_cancel<F>(future: F, cancel: &CancellationSignal) -> Result<F::Output, StreamError>
where
    F: Future,
{
    tokio::pin!(future);
    loop {
        if cancel.load(Ordering::SeqCst) {
            return Err(StreamError::Cancelled);
        }
        tokio::select! {
            output = &mut future => return Ok(output),
            _ = tokio::time::sleep(CANCEL_POLL_INTERVAL) => {}
        }
    }
}

fn department_params(department: &str, search: &SearchConfig) -> Vec<(&'static str, String)> {
    vec![
        ("department", department.to_string()),
        ("culture", search.culture.clone()),
        ("min_area_ha", search.min_area_ha.to_string()),
        ("max_area_ha", search.max_area_ha.to_string()),
        ("ht_max_distance", search.ht_max_distance.to_string()),
        ("bt_max_distance", search.bt_max_distance.to_string()),
        ("sirene_radius", search.sirene_radius.to_string()),
        ("want_eleveurs", search.want_eleveurs.to_string()),
        ("reseau_types", search.reseau_types.join(",")),
    ]
}

fn commune_params(commune: &str, search: &SearchConfig) -> Vec<(&'static str, String)> {
    vec![
        ("commune", commune.to_string()),
        ("culture", search.culture.clone()),
        ("min_area_ha", search.min_area_ha.to_string()),
        ("max_area_ha", search.max_area_ha.to_string()),
        ("ht_max_distance", search.ht_max_distance.to_string()),
        ("bt_max_distance", search.bt_max_distance.to_string()),
        ("sirene_radius", search.sirene_radius.to_string()),
    ]
}

fn truncate(body: &str) -> String {
    match body.char_indices().nth(MAX_ERROR_BODY) {
        Some((i, _)) => format!("{}…", &body[..i]),
        None => body.to_string(),
    }
}
