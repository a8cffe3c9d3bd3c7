//! [`AssertionSuite`]: declarative pass/fail checks over a sealed session.

use std::time::{Duration, Instant};

use crate::event::{attr_keys, EventKind};
use crate::analyser::{AnalysisReport, TimelineAnalyser};
use crate::recorder::Session;

/// Result of evaluating a single assertion: a pure function of a session
/// (and its derived analysis report) to pass/fail plus how long the check
/// itself took to run.
#[derive(Debug, Clone, PartialEq)]
pub struct AssertionOutcome {
    pub name: String,
    pub passed: bool,
    pub detail: String,
    pub duration: Duration,
}

/// Aggregate result of running every assertion in a suite.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SuiteSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub success_ratio: f64,
}

/// A single named check over a session and its derived analysis report.
pub trait Assertion: Send + Sync {
    fn name(&self) -> &str;
    fn check(&self, session: &Session, report: &AnalysisReport) -> AssertionOutcome;
}

/// A bundle of assertions evaluated together against one session.
#[derive(Default)]
pub struct AssertionSuite {
    assertions: Vec<Box<dyn Assertion>>,
}

impl AssertionSuite {
    pub fn new() -> Self {
        AssertionSuite::default()
    }

    pub fn add(mut self, assertion: Box<dyn Assertion>) -> Self {
        self.assertions.push(assertion);
        self
    }

    /// Evaluate every assertion against `session`, analysing it exactly
    /// once and sharing the report across all checks. Each outcome's
    /// `duration` is measured around that assertion's own `check` call.
    pub fn evaluate(&self, session: &Session) -> Vec<AssertionOutcome> {
        let report = TimelineAnalyser::analyse(session);
        self.assertions
            .iter()
            .map(|a| {
                let start = Instant::now();
                let mut outcome = a.check(session, &report);
                outcome.duration = start.elapsed();
                outcome
            })
            .collect()
    }

    pub fn all_passed(&self, session: &Session) -> bool {
        self.evaluate(session).iter().all(|o| o.passed)
    }

    /// Aggregate pass/fail counts and success ratio across the whole suite.
    pub fn summarize(&self, session: &Session) -> SuiteSummary {
        let outcomes = self.evaluate(session);
        let total = outcomes.len();
        let passed = outcomes.iter().filter(|o| o.passed).count();
        SuiteSummary {
            total,
            passed,
            failed: total - passed,
            success_ratio: if total == 0 { 1.0 } else { passed as f64 / total as f64 },
        }
    }
}

/// Push-state sequence numbers for `opcode`, filtered to `MessageReceive`
/// events, must be strictly increasing in receive order AND the receive
/// count must fall within `[min_count, max_count]`.
pub struct MessageOrderAssertion {
    pub opcode: u16,
    pub min_count: u64,
    pub max_count: u64,
}

impl MessageOrderAssertion {
    pub fn new(opcode: u16, min_count: u64, max_count: u64) -> Self {
        MessageOrderAssertion {
            opcode,
            min_count,
            max_count,
        }
    }
}

impl Assertion for MessageOrderAssertion {
    fn name(&self) -> &str {
        "message_order"
    }

    fn check(&self, session: &Session, _report: &AnalysisReport) -> AssertionOutcome {
        let mut last_seq: Option<u64> = None;
        let mut count: u64 = 0;
        for event in session.events_of_kind(EventKind::MessageReceive) {
            let Some(opcode_attr) = event.attr(attr_keys::OPCODE).and_then(|v| v.as_u64()) else {
                continue;
            };
            if opcode_attr as u16 != self.opcode {
                continue;
            }
            let Some(seq) = event
                .attr(attr_keys::SEQUENCE_NUMBER)
                .and_then(|v| v.as_u64())
            else {
                continue;
            };
            count += 1;
            if let Some(prev) = last_seq {
                if seq <= prev {
                    return AssertionOutcome {
                        name: self.name().to_owned(),
                        passed: false,
                        detail: format!(
                            "sequence {seq} did not strictly increase past previous {prev}"
                        ),
                        duration: Duration::ZERO,
                    };
                }
            }
            last_seq = Some(seq);
        }
        if count < self.min_count || count > self.max_count {
            return AssertionOutcome {
                name: self.name().to_owned(),
                passed: false,
                detail: format!(
                    "opcode {:#06x}: received {count} messages, expected between {} and {}",
                    self.opcode, self.min_count, self.max_count
                ),
                duration: Duration::ZERO,
            };
        }
        AssertionOutcome {
            name: self.name().to_owned(),
            passed: true,
            detail: format!(
                "opcode {:#06x}: {count} messages received, strictly increasing sequence",
                self.opcode
            ),
            duration: Duration::ZERO,
        }
    }
}

/// The specified `percentile` of matched-flow round-trip latencies must
/// not exceed `max_latency`. Passes vacuously if there are no matched
/// flows to sample.
pub struct LatencyAssertion {
    pub max_latency: Duration,
    pub percentile: f64,
}

impl LatencyAssertion {
    pub fn new(max_latency: Duration, percentile: f64) -> Self {
        LatencyAssertion {
            max_latency,
            percentile,
        }
    }
}

impl Assertion for LatencyAssertion {
    fn name(&self) -> &str {
        "latency"
    }

    fn check(&self, _session: &Session, report: &AnalysisReport) -> AssertionOutcome {
        match report.network_metrics.percentile(self.percentile) {
            Some(observed) if observed > self.max_latency => AssertionOutcome {
                name: self.name().to_owned(),
                passed: false,
                detail: format!(
                    "p{} latency {observed:?} exceeded limit {:?}",
                    self.percentile, self.max_latency
                ),
                duration: Duration::ZERO,
            },
            Some(observed) => AssertionOutcome {
                name: self.name().to_owned(),
                passed: true,
                detail: format!(
                    "p{} latency {observed:?} within limit {:?}",
                    self.percentile, self.max_latency
                ),
                duration: Duration::ZERO,
            },
            None => AssertionOutcome {
                name: self.name().to_owned(),
                passed: true,
                detail: "no matched flows to sample".to_owned(),
                duration: Duration::ZERO,
            },
        }
    }
}

/// Total recorded reconnects must not exceed `max_reconnects`, AND their
/// aggregate downtime (the analyser's disconnected duration, per
/// `ConnectionStability`) must not exceed `max_total_duration`.
pub struct ReconnectAssertion {
    pub max_reconnects: u64,
    pub max_total_duration: Duration,
}

impl ReconnectAssertion {
    pub fn new(max_reconnects: u64, max_total_duration: Duration) -> Self {
        ReconnectAssertion {
            max_reconnects,
            max_total_duration,
        }
    }
}

impl Assertion for ReconnectAssertion {
    fn name(&self) -> &str {
        "reconnect"
    }

    fn check(&self, session: &Session, report: &AnalysisReport) -> AssertionOutcome {
        let count = session.footer.reconnect_count;
        let downtime = report
            .connection_stability
            .total_duration
            .saturating_sub(report.connection_stability.connected_duration);
        let passed = count <= self.max_reconnects && downtime <= self.max_total_duration;
        AssertionOutcome {
            name: self.name().to_owned(),
            passed,
            detail: format!(
                "{count} reconnects observed (limit {}), {downtime:?} aggregate downtime (limit {:?})",
                self.max_reconnects, self.max_total_duration
            ),
            duration: Duration::ZERO,
        }
    }
}

/// `error_count / message_receive_count` must not exceed `max_error_rate`.
pub struct ErrorRateAssertion {
    pub max_error_rate: f64,
}

impl ErrorRateAssertion {
    pub fn new(max_error_rate: f64) -> Self {
        ErrorRateAssertion { max_error_rate }
    }
}

impl Assertion for ErrorRateAssertion {
    fn name(&self) -> &str {
        "error_rate"
    }

    fn check(&self, session: &Session, _report: &AnalysisReport) -> AssertionOutcome {
        let received = session.events_of_kind(EventKind::MessageReceive).count().max(1);
        let rate = session.footer.error_count as f64 / received as f64;
        AssertionOutcome {
            name: self.name().to_owned(),
            passed: rate <= self.max_error_rate,
            detail: format!(
                "error rate {rate:.4} ({} / {received} messages received), limit {:.4}",
                session.footer.error_count, self.max_error_rate
            ),
            duration: Duration::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::AttrValue;
    use crate::recorder::SessionRecorder;
    use std::collections::BTreeMap;

    fn flow_attrs(opcode: u16, seq: u64) -> BTreeMap<String, AttrValue> {
        let mut m = BTreeMap::new();
        m.insert(attr_keys::OPCODE.to_owned(), AttrValue::U64(opcode as u64));
        m.insert(attr_keys::SEQUENCE_NUMBER.to_owned(), AttrValue::U64(seq));
        m
    }

    #[test]
    fn message_order_fails_on_non_increasing_sequence() {
        let rec = SessionRecorder::new("assert-1");
        rec.record_event(EventKind::MessageReceive, flow_attrs(0x0200, 5))
            .unwrap();
        rec.record_event(EventKind::MessageReceive, flow_attrs(0x0200, 3))
            .unwrap();
        rec.record_close(0, "done").unwrap();
        let session = rec.get_session();

        let suite =
            AssertionSuite::new().add(Box::new(MessageOrderAssertion::new(0x0200, 0, 100)));
        let outcomes = suite.evaluate(&session);
        assert!(!outcomes[0].passed);
    }

    #[test]
    fn synthetic_session_with_ten_flows_one_reconnect_one_error_passes_all_four() {
        let rec = SessionRecorder::new("assert-2");
        for seq in 1..=10u64 {
            rec.record_event(EventKind::MessageSend, flow_attrs(0x0300, seq))
                .unwrap();
            rec.record_event(EventKind::MessageReceive, flow_attrs(0x0300, seq))
                .unwrap();
        }
        rec.record_event(EventKind::Reconnect, BTreeMap::new())
            .unwrap();
        rec.record_event(EventKind::Error, BTreeMap::new()).unwrap();
        rec.record_close(0, "done").unwrap();
        let session = rec.get_session();

        let suite = AssertionSuite::new()
            .add(Box::new(MessageOrderAssertion::new(0x0300, 5, 15)))
            .add(Box::new(LatencyAssertion::new(Duration::from_secs(5), 95.0)))
            .add(Box::new(ReconnectAssertion::new(2, Duration::from_secs(5))))
            .add(Box::new(ErrorRateAssertion::new(0.5)));

        let outcomes = suite.evaluate(&session);
        assert!(outcomes.iter().all(|o| o.passed), "{outcomes:?}");
        assert!(suite.all_passed(&session));
    }

    #[test]
    fn reconnect_assertion_fails_past_limit() {
        let rec = SessionRecorder::new("assert-3");
        rec.record_event(EventKind::Reconnect, BTreeMap::new())
            .unwrap();
        rec.record_event(EventKind::Reconnect, BTreeMap::new())
            .unwrap();
        rec.record_close(0, "done").unwrap();
        let session = rec.get_session();

        let suite =
            AssertionSuite::new().add(Box::new(ReconnectAssertion::new(1, Duration::from_secs(5))));
        assert!(!suite.all_passed(&session));
    }

    #[test]
    fn error_rate_assertion_fails_past_limit() {
        let rec = SessionRecorder::new("assert-4");
        rec.record_event(EventKind::Error, BTreeMap::new()).unwrap();
        rec.record_event(EventKind::Connect, BTreeMap::new())
            .unwrap();
        rec.record_close(0, "done").unwrap();
        let session = rec.get_session();

        let suite = AssertionSuite::new().add(Box::new(ErrorRateAssertion::new(0.1)));
        assert!(!suite.all_passed(&session));
    }
}
