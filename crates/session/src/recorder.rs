//! [`SessionRecorder`]: the append-only capture side of a session.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::event::{attr_keys, AttrValue, Event, EventKind, MonotonicInstant};

/// Direction of a captured raw frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Send,
    Receive,
}

/// A raw frame capture, stored compressed-by-encoding (base64) rather than
/// as raw bytes so the export document stays valid JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameCapture {
    pub direction: Direction,
    pub opcode: u16,
    pub length: u32,
    pub body_base64: String,
}

/// Aggregate counters stamped into a sealed session's footer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionFooter {
    pub total_events: u64,
    pub total_frames: u64,
    pub reconnect_count: u64,
    pub error_count: u64,
    pub close_reason_code: Option<i32>,
    pub close_description: Option<String>,
}

/// An immutable snapshot of a session: all events, all frame captures (if
/// any were recorded), and the aggregate footer. Once `end_time` is set
/// the session is sealed and this value is never mutated again; replay,
/// analysis, and assertion evaluation only read it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub events: Vec<Event>,
    pub frames: Vec<FrameCapture>,
    pub footer: SessionFooter,
}

impl Session {
    pub fn is_sealed(&self) -> bool {
        self.end_time.is_some()
    }

    pub fn events_of_kind(&self, kind: EventKind) -> impl Iterator<Item = &Event> {
        self.events.iter().filter(move |e| e.kind == kind)
    }
}

/// Errors returned by recorder operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session {0} is already sealed; no further events can be recorded")]
    AlreadySealed(String),
}

struct RecorderInner {
    events: Vec<Event>,
    frames: Vec<FrameCapture>,
    sealed: bool,
    end_time: Option<DateTime<Utc>>,
    next_seq: u64,
    reconnect_count: u64,
    error_count: u64,
    close_reason_code: Option<i32>,
    close_description: Option<String>,
}

/// Records events and raw frame captures for one client session.
///
/// Safe to call from multiple tasks concurrently (the reader loop, the
/// heartbeat loop, ...): the critical section guarded by the internal
/// mutex is only the append itself, never serialization.
pub struct SessionRecorder {
    id: String,
    start_time: DateTime<Utc>,
    origin: Instant,
    inner: Mutex<RecorderInner>,
}

impl SessionRecorder {
    pub fn new(id: impl Into<String>) -> Self {
        SessionRecorder {
            id: id.into(),
            start_time: Utc::now(),
            origin: Instant::now(),
            inner: Mutex::new(RecorderInner {
                events: Vec::new(),
                frames: Vec::new(),
                sealed: false,
                end_time: None,
                next_seq: 0,
                reconnect_count: 0,
                error_count: 0,
                close_reason_code: None,
                close_description: None,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn now(&self) -> MonotonicInstant {
        MonotonicInstant(self.origin.elapsed().as_nanos() as u64)
    }

    /// Append a new event with a monotonic timestamp. Returns
    /// [`SessionError::AlreadySealed`] if the session has already been
    /// closed.
    pub fn record_event(
        &self,
        kind: EventKind,
        attributes: BTreeMap<String, AttrValue>,
    ) -> Result<(), SessionError> {
        let at = self.now();
        let wall_time = Utc::now();
        let mut guard = self.inner.lock().expect("recorder mutex poisoned");
        if guard.sealed {
            warn!(session_id = %self.id, ?kind, "dropping event recorded after session was sealed");
            return Err(SessionError::AlreadySealed(self.id.clone()));
        }
        let seq = guard.next_seq;
        guard.next_seq += 1;
        if kind == EventKind::Reconnect {
            guard.reconnect_count += 1;
        }
        if kind == EventKind::Error {
            guard.error_count += 1;
        }
        guard.events.push(Event {
            seq,
            kind,
            at,
            wall_time,
            attributes,
        });
        Ok(())
    }

    /// Convenience for heartbeat-derived RTTs: stored as a `Heartbeat`
    /// event carrying `latency_nanos`.
    pub fn record_latency(&self, duration: std::time::Duration) -> Result<(), SessionError> {
        let mut attrs = BTreeMap::new();
        attrs.insert(
            attr_keys::LATENCY_NANOS.to_owned(),
            AttrValue::U64(duration.as_nanos() as u64),
        );
        self.record_event(EventKind::Heartbeat, attrs)
    }

    /// Optional raw-frame capture, independent of the structured event
    /// stream above.
    pub fn record_frame(
        &self,
        direction: Direction,
        opcode: u16,
        body: &[u8],
    ) -> Result<(), SessionError> {
        use base64::Engine;
        let capture = FrameCapture {
            direction,
            opcode,
            length: body.len() as u32,
            body_base64: base64::engine::general_purpose::STANDARD.encode(body),
        };
        let mut guard = self.inner.lock().expect("recorder mutex poisoned");
        if guard.sealed {
            return Err(SessionError::AlreadySealed(self.id.clone()));
        }
        guard.frames.push(capture);
        Ok(())
    }

    /// Seal the session: record a final `Close` event and stamp
    /// `end_time`. Idempotent past the first call (subsequent calls are a
    /// no-op returning `Ok(())`, matching `close()`'s idempotency on the
    /// client engine that owns this recorder).
    pub fn record_close(
        &self,
        reason_code: i32,
        description: impl Into<String>,
    ) -> Result<(), SessionError> {
        let description = description.into();
        let at = self.now();
        let wall_time = Utc::now();
        let mut guard = self.inner.lock().expect("recorder mutex poisoned");
        if guard.sealed {
            return Ok(());
        }
        let seq = guard.next_seq;
        guard.next_seq += 1;
        let mut attrs = BTreeMap::new();
        attrs.insert(
            attr_keys::REASON_CODE.to_owned(),
            AttrValue::I64(reason_code as i64),
        );
        attrs.insert(
            attr_keys::DESCRIPTION.to_owned(),
            AttrValue::Str(description.clone()),
        );
        guard.events.push(Event {
            seq,
            kind: EventKind::Close,
            at,
            wall_time,
            attributes: attrs,
        });
        guard.sealed = true;
        guard.end_time = Some(wall_time);
        guard.close_reason_code = Some(reason_code);
        guard.close_description = Some(description);
        debug!(session_id = %self.id, reason_code, events = guard.events.len(), "session sealed");
        Ok(())
    }

    /// An immutable snapshot of everything recorded so far.
    pub fn get_session(&self) -> Session {
        let guard = self.inner.lock().expect("recorder mutex poisoned");
        Session {
            id: self.id.clone(),
            start_time: self.start_time,
            end_time: guard.end_time,
            events: guard.events.clone(),
            frames: guard.frames.clone(),
            footer: SessionFooter {
                total_events: guard.events.len() as u64,
                total_frames: guard.frames.len() as u64,
                reconnect_count: guard.reconnect_count,
                error_count: guard.error_count,
                close_reason_code: guard.close_reason_code,
                close_description: guard.close_description.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_event_appends_and_counts() {
        let rec = SessionRecorder::new("s1");
        rec.record_event(EventKind::Connect, BTreeMap::new()).unwrap();
        rec.record_event(EventKind::Login, BTreeMap::new()).unwrap();
        let session = rec.get_session();
        assert_eq!(session.events.len(), 2);
        assert_eq!(session.footer.total_events, 2);
        assert!(!session.is_sealed());
    }

    #[test]
    fn events_are_stable_ordered_by_insertion_for_ties() {
        let rec = SessionRecorder::new("s1");
        for _ in 0..10 {
            rec.record_event(EventKind::Heartbeat, BTreeMap::new())
                .unwrap();
        }
        let session = rec.get_session();
        let seqs: Vec<u64> = session.events.iter().map(|e| e.seq).collect();
        let mut sorted = seqs.clone();
        sorted.sort_unstable();
        assert_eq!(seqs, sorted, "insertion order must be preserved");
    }

    #[test]
    fn record_close_seals_session_and_rejects_further_events() {
        let rec = SessionRecorder::new("s1");
        rec.record_event(EventKind::Connect, BTreeMap::new()).unwrap();
        rec.record_close(0, "normal close").unwrap();
        let session = rec.get_session();
        assert!(session.is_sealed());
        assert_eq!(session.footer.close_reason_code, Some(0));

        let err = rec
            .record_event(EventKind::MessageSend, BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, SessionError::AlreadySealed(_)));
    }

    #[test]
    fn record_close_is_idempotent() {
        let rec = SessionRecorder::new("s1");
        rec.record_close(0, "first").unwrap();
        rec.record_close(1, "second").unwrap();
        let session = rec.get_session();
        // First close wins; second call is a no-op.
        assert_eq!(session.footer.close_description, Some("first".to_owned()));
    }

    #[test]
    fn record_latency_stores_heartbeat_event_with_latency_attr() {
        let rec = SessionRecorder::new("s1");
        rec.record_latency(std::time::Duration::from_millis(42))
            .unwrap();
        let session = rec.get_session();
        let ev = &session.events[0];
        assert_eq!(ev.kind, EventKind::Heartbeat);
        assert_eq!(
            ev.attr(attr_keys::LATENCY_NANOS).unwrap().as_u64(),
            Some(42_000_000)
        );
    }

    #[test]
    fn record_frame_appends_base64_capture() {
        let rec = SessionRecorder::new("s1");
        rec.record_frame(Direction::Send, 0x0300, b"hello").unwrap();
        let session = rec.get_session();
        assert_eq!(session.frames.len(), 1);
        assert_eq!(session.frames[0].opcode, 0x0300);
        assert_eq!(session.frames[0].length, 5);
    }

    #[test]
    fn reconnect_and_error_events_are_counted_in_footer() {
        let rec = SessionRecorder::new("s1");
        rec.record_event(EventKind::Reconnect, BTreeMap::new()).unwrap();
        rec.record_event(EventKind::Reconnect, BTreeMap::new()).unwrap();
        rec.record_event(EventKind::Error, BTreeMap::new()).unwrap();
        let session = rec.get_session();
        assert_eq!(session.footer.reconnect_count, 2);
        assert_eq!(session.footer.error_count, 1);
    }
}
