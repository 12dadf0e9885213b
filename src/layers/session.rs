//! Search sessions and their owner.
//!
//! A [`SearchSession`] is the ordered list of results of one streamed search
//! together with the layers merged from them. The [`SearchController`] is its
//! only owner: it creates a fresh session per search, appends results coming
//! from the current stream, and drops events from streams it has replaced.

use crate::layers::aggregator::{LayerState, ResultAggregator};
use crate::models::PartialResult;
use crate::stream::StreamEvent;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Shared flag raised to stop a stream.
pub type CancellationSignal = Arc<AtomicBool>;

/// Results of one streamed search, plus their merged layers.
#[derive(Debug, Clone)]
pub struct SearchSession {
    aggregator: Arc<ResultAggregator>,
    results: Vec<PartialResult>,
    state: LayerState,
}

impl SearchSession {
    /// Create an empty session.
    pub fn new(aggregator: Arc<ResultAggregator>) -> Self {
        let state = aggregator.empty_state();
        Self {
            aggregator,
            results: Vec::new(),
            state,
        }
    }

    /// Append a result and fold it into the merged layers.
    pub fn push(&mut self, result: PartialResult) -> &LayerState {
        self.aggregator.fold(&mut self.state, &result);
        self.results.push(result);
        &self.state
    }

    /// Received results, unmodified and in arrival order.
    pub fn results(&self) -> &[PartialResult] {
        &self.results
    }

    /// Current merged layers.
    pub fn layers(&self) -> &LayerState {
        &self.state
    }

    /// Recompute the merged layers from scratch.
    #[allow(dead_code)]
    pub fn remerge(&self) -> LayerState {
        self.aggregator.merge(&self.results)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

/// Handle given to the stream that feeds one search.
#[derive(Debug, Clone)]
pub struct SearchTicket {
    /// Generation the stream's events must be tagged with.
    pub generation: u64,
    /// Raised when the search is replaced or closed.
    pub cancel: CancellationSignal,
}

impl SearchTicket {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

/// What a handled event changed.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    /// Free-text status, with `(current, total)` when the message carries it.
    Progress {
        message: String,
        step: Option<(usize, usize)>,
    },
    /// A result was appended and merged.
    Merged { communes: usize, features: usize },
    /// A result payload could not be decoded and was skipped.
    Rejected(String),
    /// The stream ended normally.
    Finished(String),
    /// The server reported an error and the stream stopped.
    Failed(String),
}

/// Single owner of the current search session.
#[derive(Debug)]
pub struct SearchController {
    aggregator: Arc<ResultAggregator>,
    session: SearchSession,
    generation: u64,
    active: Option<CancellationSignal>,
    status: Option<String>,
}

impl SearchController {
    pub fn new(aggregator: Arc<ResultAggregator>) -> Self {
        let session = SearchSession::new(Arc::clone(&aggregator));
        Self {
            aggregator,
            session,
            generation: 0,
            active: None,
            status: None,
        }
    }

    /// Start a new search.
    ///
    /// The previous session is discarded and its stream is signalled to stop;
    /// anything it still delivers is ignored.
    pub fn begin(&mut self) -> SearchTicket {
        self.close();
        self.generation += 1;
        self.session = SearchSession::new(Arc::clone(&self.aggregator));
        self.status = None;

        let cancel: CancellationSignal = Arc::new(AtomicBool::new(false));
        self.active = Some(Arc::clone(&cancel));
        debug!("Started search generation {}", self.generation);

        SearchTicket {
            generation: self.generation,
            cancel,
        }
    }

    /// Stop the current stream, keeping the results received so far.
    pub fn close(&mut self) {
        if let Some(cancel) = self.active.take() {
            cancel.store(true, Ordering::SeqCst);
            debug!("Closed search generation {}", self.generation);
        }
    }

    /// Apply one stream event.
    ///
    /// Returns `None` when the event belongs to a replaced or finished stream.
    pub fn handle(&mut self, generation: u64, event: StreamEvent) -> Option<SessionUpdate> {
        if generation != self.generation || self.active.is_none() {
            debug!(
                "Ignoring event from stale stream (generation {}, current {})",
                generation, self.generation
            );
            return None;
        }

        let update = match event {
            StreamEvent::Progress { message, step } => SessionUpdate::Progress { message, step },
            StreamEvent::Result(result) => {
                let commune = result.commune().unwrap_or("?").to_string();
                let features = self.session.push(result).feature_count();
                debug!("Merged result for {} ({} features total)", commune, features);
                SessionUpdate::Merged {
                    communes: self.session.len(),
                    features,
                }
            }
            StreamEvent::Rejected(reason) => {
                warn!("Skipping undecodable result: {}", reason);
                SessionUpdate::Rejected(reason)
            }
            StreamEvent::End(message) => {
                info!("Stream ended: {}", message);
                self.active = None;
                self.status = Some(message.clone());
                SessionUpdate::Finished(message)
            }
            StreamEvent::Error(message) => {
                warn!("Stream reported an error: {}", message);
                self.active = None;
                self.status = Some(message.clone());
                SessionUpdate::Failed(message)
            }
        };

        Some(update)
    }

    /// The current session.
    pub fn session(&self) -> &SearchSession {
        &self.session
    }

    /// Whether a stream is still feeding the current session.
    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Final message of the last finished stream.
    pub fn status(&self) -> Option<&str> {
        self.status.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn features(n: usize) -> Value {
        let items: Vec<Value> = (0..n)
            .map(|i| {
                json!({
                    "type": "Feature",
                    "geometry": {"type": "Point", "coordinates": [i as f64, 45.0]},
                    "properties": {"n": i}
                })
            })
            .collect();
        Value::Array(items)
    }

    fn commune(name: &str, rpg: usize, eleveurs: usize) -> StreamEvent {
        let value = json!({"commune": name, "rpg": features(rpg), "eleveurs": features(eleveurs)});
        StreamEvent::Result(PartialResult::from_value(value).unwrap())
    }

    fn controller() -> SearchController {
        SearchController::new(Arc::new(ResultAggregator::default()))
    }

    #[test]
    fn test_three_communes_scenario() {
        let mut controller = controller();
        let ticket = controller.begin();

        for event in [
            commune("Alpha", 2, 1),
            commune("Beta", 0, 3),
            commune("Gamma", 1, 0),
        ] {
            controller.handle(ticket.generation, event);
        }

        let session = controller.session();
        assert_eq!(session.layers().get("rpg").unwrap().len(), 3);
        assert_eq!(session.layers().get("eleveurs").unwrap().len(), 4);

        let names: Vec<_> = session.results().iter().map(|r| r.commune().unwrap()).collect();
        assert_eq!(names, vec!["Alpha", "Beta", "Gamma"]);
    }

    #[test]
    fn test_incremental_state_matches_remerge() {
        let mut controller = controller();
        let ticket = controller.begin();
        controller.handle(ticket.generation, commune("Alpha", 2, 1));
        controller.handle(ticket.generation, commune("Beta", 1, 1));

        let session = controller.session();
        assert_eq!(session.layers(), &session.remerge());
    }

    #[test]
    fn test_begin_discards_previous_session() {
        let mut controller = controller();
        let first = controller.begin();
        controller.handle(first.generation, commune("Alpha", 2, 1));

        let second = controller.begin();
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert!(controller.session().is_empty());
        assert!(controller.session().layers().get("rpg").unwrap().is_empty());

        // Late events from the first stream must not leak into the new session.
        assert_eq!(controller.handle(first.generation, commune("Late", 5, 5)), None);
        assert!(controller.session().is_empty());

        controller.handle(second.generation, commune("Beta", 1, 0));
        assert_eq!(controller.session().len(), 1);
    }

    #[test]
    fn test_rejected_result_leaves_session_intact() {
        let mut controller = controller();
        let ticket = controller.begin();
        controller.handle(ticket.generation, commune("Alpha", 1, 0));

        let update = controller.handle(ticket.generation, StreamEvent::Rejected("bad json".into()));
        assert_eq!(update, Some(SessionUpdate::Rejected("bad json".into())));
        assert_eq!(controller.session().len(), 1);
        assert!(controller.is_active());
    }

    #[test]
    fn test_end_closes_stream() {
        let mut controller = controller();
        let ticket = controller.begin();
        controller.handle(ticket.generation, commune("Alpha", 1, 0));

        let update = controller.handle(ticket.generation, StreamEvent::End("Terminé".into()));
        assert_eq!(update, Some(SessionUpdate::Finished("Terminé".into())));
        assert!(!controller.is_active());
        assert_eq!(controller.status(), Some("Terminé"));

        // Results after the end are ignored, the session is kept.
        assert_eq!(controller.handle(ticket.generation, commune("Beta", 1, 0)), None);
        assert_eq!(controller.session().len(), 1);
    }

    #[test]
    fn test_progress_passes_through() {
        let mut controller = controller();
        let ticket = controller.begin();
        let update = controller.handle(
            ticket.generation,
            StreamEvent::Progress {
                message: "[1/3] Alpha".into(),
                step: Some((1, 3)),
            },
        );

        assert_eq!(
            update,
            Some(SessionUpdate::Progress {
                message: "[1/3] Alpha".into(),
                step: Some((1, 3)),
            })
        );
        assert!(controller.session().is_empty());
    }
}
