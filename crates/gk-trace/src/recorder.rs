// recorder.rs - The single writer of trace events.
//
// One mutex guards both the in-memory index and the sink. Holding it while
// assigning a sequence number, writing to the sink and committing makes
// each append atomic: two events for one action can never share a
// sequence number, and a failed sink write consumes nothing.
//
// Committed events are immutable `Arc`s. A query clones the Arcs it needs
// and iterates that snapshot without holding the lock.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::TraceError;
use crate::event::{TraceEvent, TraceEventKind, TraceEventType};
use crate::sink::TraceSink;

struct State {
    /// Committed events per action, indexed by sequence number.
    events: BTreeMap<Uuid, Vec<Arc<TraceEvent>>>,
    sink: Option<Box<dyn TraceSink>>,
}

/// Append-only, per-action ordered event log.
pub struct TraceRecorder {
    state: Mutex<State>,
}

impl Default for TraceRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceRecorder {
    /// A recorder that only keeps events in memory.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                events: BTreeMap::new(),
                sink: None,
            }),
        }
    }

    /// A recorder that writes every event through `sink` before committing.
    pub fn with_sink(sink: impl TraceSink + 'static) -> Self {
        Self {
            state: Mutex::new(State {
                events: BTreeMap::new(),
                sink: Some(Box::new(sink)),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append one event for `action_id` and return its sequence number.
    pub fn append(&self, action_id: Uuid, kind: TraceEventKind) -> Result<u64, TraceError> {
        let mut state = self.lock();
        let sequence = state.events.get(&action_id).map_or(0, |e| e.len() as u64);
        let event = TraceEvent::new(action_id, sequence, kind);

        if let Some(sink) = state.sink.as_mut() {
            if let Err(e) = sink.write(&event) {
                tracing::warn!(
                    action_id = %action_id,
                    event_type = %event.event_type(),
                    error = %e,
                    "trace sink write failed; event not committed"
                );
                return Err(e);
            }
        }

        tracing::debug!(
            action_id = %action_id,
            sequence,
            event_type = %event.event_type(),
            "trace event committed"
        );
        state
            .events
            .entry(action_id)
            .or_default()
            .push(Arc::new(event));
        Ok(sequence)
    }

    /// Lazily iterate committed events matching `filter`, ordered by
    /// `(action_id, sequence)`.
    pub fn query(&self, filter: TraceFilter) -> TraceQuery {
        let state = self.lock();
        let snapshot: Vec<Arc<TraceEvent>> = match filter.action_id {
            Some(id) => state.events.get(&id).cloned().unwrap_or_default(),
            None => state.events.values().flatten().cloned().collect(),
        };
        TraceQuery {
            events: snapshot.into_iter(),
            filter,
        }
    }

    /// All committed events for one action, in sequence order.
    pub fn events_for(&self, action_id: Uuid) -> Vec<Arc<TraceEvent>> {
        self.lock()
            .events
            .get(&action_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Total number of committed events.
    pub fn len(&self) -> usize {
        self.lock().events.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Which events a [`TraceQuery`] yields. The default matches everything.
#[derive(Debug, Clone, Default)]
pub struct TraceFilter {
    pub action_id: Option<Uuid>,
    /// Empty means every event type.
    pub event_types: Vec<TraceEventType>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl TraceFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_action(action_id: Uuid) -> Self {
        Self {
            action_id: Some(action_id),
            ..Self::default()
        }
    }

    pub fn with_type(mut self, event_type: TraceEventType) -> Self {
        self.event_types.push(event_type);
        self
    }

    /// Restrict to events with `since <= timestamp < until`.
    pub fn between(mut self, since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self.until = Some(until);
        self
    }

    pub fn matches(&self, event: &TraceEvent) -> bool {
        if self.action_id.is_some_and(|id| id != event.action_id) {
            return false;
        }
        if !self.event_types.is_empty() && !self.event_types.contains(&event.event_type()) {
            return false;
        }
        if self.since.is_some_and(|since| event.timestamp < since) {
            return false;
        }
        if self.until.is_some_and(|until| event.timestamp >= until) {
            return false;
        }
        true
    }
}

/// Iterator over a point-in-time snapshot of the trace.
pub struct TraceQuery {
    events: std::vec::IntoIter<Arc<TraceEvent>>,
    filter: TraceFilter,
}

impl Iterator for TraceQuery {
    type Item = Arc<TraceEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        let filter = &self.filter;
        self.events.by_ref().find(|e| filter.matches(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ExecutionStatus;
    use crate::sink::MemorySink;

    struct BrokenSink;

    impl TraceSink for BrokenSink {
        fn write(&mut self, _event: &TraceEvent) -> Result<(), TraceError> {
            Err(TraceError::SinkUnavailable("disk full".into()))
        }
    }

    fn attempted(attempt: u32) -> TraceEventKind {
        TraceEventKind::ExecutionAttempted { attempt }
    }

    #[test]
    fn sequences_are_per_action_and_contiguous() {
        let recorder = TraceRecorder::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(recorder.append(a, attempted(1)).unwrap(), 0);
        assert_eq!(recorder.append(b, attempted(1)).unwrap(), 0);
        assert_eq!(recorder.append(a, attempted(2)).unwrap(), 1);
        assert_eq!(recorder.append(a, attempted(3)).unwrap(), 2);

        let seqs: Vec<u64> = recorder.events_for(a).iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert_eq!(recorder.len(), 4);
    }

    #[test]
    fn concurrent_appends_never_share_a_sequence() {
        let recorder = Arc::new(TraceRecorder::new());
        let action = Uuid::new_v4();
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let recorder = Arc::clone(&recorder);
                std::thread::spawn(move || {
                    for i in 0..25 {
                        recorder.append(action, attempted(t * 100 + i)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let seqs: Vec<u64> = recorder.events_for(action).iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, (0..200).collect::<Vec<u64>>());
    }

    #[test]
    fn failed_sink_write_consumes_no_sequence() {
        let recorder = TraceRecorder::with_sink(BrokenSink);
        let action = Uuid::new_v4();
        let err = recorder.append(action, attempted(1)).unwrap_err();
        assert!(matches!(err, TraceError::SinkUnavailable(_)));
        assert!(recorder.is_empty());
    }

    #[test]
    fn sink_sees_every_committed_event() {
        let sink = MemorySink::new();
        let recorder = TraceRecorder::with_sink(sink.clone());
        let action = Uuid::new_v4();
        recorder.append(action, attempted(1)).unwrap();
        recorder.append(action, attempted(2)).unwrap();
        let written = sink.events();
        assert_eq!(written.len(), 2);
        assert_eq!(written[1].sequence, 1);
    }

    #[test]
    fn query_orders_by_action_then_sequence() {
        let recorder = TraceRecorder::new();
        let ids = [Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
        for round in 0..3 {
            for id in ids.iter().rev() {
                recorder.append(*id, attempted(round)).unwrap();
            }
        }

        let keys: Vec<(Uuid, u64)> = recorder
            .query(TraceFilter::all())
            .map(|e| (e.action_id, e.sequence))
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert_eq!(keys.len(), 9);
    }

    #[test]
    fn query_filters_by_action_and_type() {
        let recorder = TraceRecorder::new();
        let action = Uuid::new_v4();
        recorder.append(action, attempted(1)).unwrap();
        recorder
            .append(
                action,
                TraceEventKind::ExecutionCompleted {
                    attempt: 1,
                    status: ExecutionStatus::Success,
                    duration_ms: 1,
                    error_detail: None,
                },
            )
            .unwrap();
        recorder.append(Uuid::new_v4(), attempted(1)).unwrap();

        let completed: Vec<_> = recorder
            .query(TraceFilter::for_action(action).with_type(TraceEventType::ExecutionCompleted))
            .collect();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].sequence, 1);
    }

    #[test]
    fn query_time_range_is_half_open() {
        let recorder = TraceRecorder::new();
        let action = Uuid::new_v4();
        recorder.append(action, attempted(1)).unwrap();
        let at = recorder.events_for(action)[0].timestamp;

        let hit = recorder
            .query(TraceFilter::all().between(at, at + chrono::Duration::milliseconds(1)))
            .count();
        let miss = recorder
            .query(TraceFilter::all().between(at - chrono::Duration::seconds(1), at))
            .count();
        assert_eq!(hit, 1);
        assert_eq!(miss, 0);
    }

    #[test]
    fn query_snapshot_ignores_later_appends() {
        let recorder = TraceRecorder::new();
        let action = Uuid::new_v4();
        recorder.append(action, attempted(1)).unwrap();
        let query = recorder.query(TraceFilter::for_action(action));
        recorder.append(action, attempted(2)).unwrap();
        assert_eq!(query.count(), 1);
    }
}
