//! [`TimelineAnalyser`]: pure, side-effect-free analysis over a sealed
//! session's event timeline.

use std::time::Duration;

use crate::event::{attr_keys, Event, EventKind, MonotonicInstant};
use crate::recorder::Session;

/// One matched send/receive pair, keyed by `(opcode, sequence_number)`.
/// Matching is one-shot: the first unmatched receive with the same key
/// closes the first unmatched send with that key, in timeline order.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageFlow {
    pub opcode: u16,
    pub sequence_number: u64,
    pub sent_at: Option<MonotonicInstant>,
    pub received_at: Option<MonotonicInstant>,
    pub round_trip: Option<Duration>,
}

/// Aggregate network-quality figures derived from matched flows.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NetworkMetrics {
    pub sample_count: usize,
    pub min_latency: Option<Duration>,
    pub max_latency: Option<Duration>,
    pub mean_latency: Option<Duration>,
    /// Nearest-rank percentiles: `index = ceil(p/100 * n) - 1`.
    pub p50_latency: Option<Duration>,
    pub p95_latency: Option<Duration>,
    pub p99_latency: Option<Duration>,
    /// Mean absolute difference between consecutive round trips, in
    /// send order.
    pub jitter: Option<Duration>,
    /// Fraction of sends with no matching receive.
    pub loss_rate: f64,
    pub throughput_msgs_per_sec: f64,
    /// Matched-flow round trips, sorted ascending. Kept so callers (e.g.
    /// [`crate::assertions::LatencyAssertion`]) can query an arbitrary
    /// percentile without re-deriving flows from the timeline.
    pub sorted_latencies: Vec<Duration>,
}

impl NetworkMetrics {
    /// Nearest-rank percentile (`index = ceil(p/100 * n) - 1`) over the
    /// matched-flow latencies. `None` if there are no matched flows.
    pub fn percentile(&self, p: f64) -> Option<Duration> {
        (!self.sorted_latencies.is_empty()).then(|| nearest_rank(&self.sorted_latencies, p))
    }
}

/// A single flow whose round trip exceeded the anomaly threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencyAnomaly {
    pub sequence_number: u64,
    pub latency: Duration,
    pub threshold: Duration,
}

/// How much of a session's span was spent connected, derived from
/// `Reconnect` events: the gap immediately preceding each reconnect is
/// attributed to downtime.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnectionStability {
    /// Number of `Connect` events (the initial connect plus every
    /// successful reconnect).
    pub connect_count: u64,
    /// Number of times the connection was lost and reconnect began. The
    /// event model records this as a `Reconnect` event at the moment the
    /// disconnect is noticed, so this mirrors `reconnect_count` exactly.
    pub disconnect_count: u64,
    pub reconnect_count: u64,
    pub total_duration: Duration,
    pub connected_duration: Duration,
    pub stability_ratio: f64,
    /// `connected_duration` divided across `reconnect_count + 1` connected
    /// segments (the span between consecutive reconnects, or between a
    /// connect/reconnect and the final close).
    pub mean_connection_duration: Duration,
    /// 1 if the session ended in a graceful close (`close_reason_code ==
    /// Some(0)`), 0 otherwise (unsealed, or closed for cause).
    pub normal_close_count: u64,
    /// `reconnects / (reconnects + normal_closes)`. `0.0` if neither
    /// occurred.
    pub reconnect_rate: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisReport {
    pub message_flows: Vec<MessageFlow>,
    pub network_metrics: NetworkMetrics,
    pub latency_anomalies: Vec<LatencyAnomaly>,
    pub connection_stability: ConnectionStability,
}

/// Default anomaly threshold multiplier applied to mean latency when the
/// caller doesn't supply one explicitly.
const DEFAULT_ANOMALY_MULTIPLIER: f64 = 3.0;

pub struct TimelineAnalyser;

impl TimelineAnalyser {
    /// Analyse with a threshold of `mean_latency * 3` for anomaly flagging.
    pub fn analyse(session: &Session) -> AnalysisReport {
        let flows = build_flows(&session.events);
        let metrics = compute_metrics(&flows, session);
        let threshold = metrics
            .mean_latency
            .map(|m| m.mul_f64(DEFAULT_ANOMALY_MULTIPLIER))
            .unwrap_or(Duration::ZERO);
        let anomalies = find_anomalies(&flows, threshold);
        let stability = compute_stability(session);
        AnalysisReport {
            message_flows: flows,
            network_metrics: metrics,
            latency_anomalies: anomalies,
            connection_stability: stability,
        }
    }

    pub fn analyse_with_anomaly_threshold(session: &Session, threshold: Duration) -> AnalysisReport {
        let flows = build_flows(&session.events);
        let metrics = compute_metrics(&flows, session);
        let anomalies = find_anomalies(&flows, threshold);
        let stability = compute_stability(session);
        AnalysisReport {
            message_flows: flows,
            network_metrics: metrics,
            latency_anomalies: anomalies,
            connection_stability: stability,
        }
    }
}

fn flow_key(event: &Event) -> Option<(u16, u64)> {
    let opcode = event.attr(attr_keys::OPCODE)?.as_u64()? as u16;
    let seq = event.attr(attr_keys::SEQUENCE_NUMBER)?.as_u64()?;
    Some((opcode, seq))
}

fn build_flows(events: &[Event]) -> Vec<MessageFlow> {
    let mut flows: Vec<MessageFlow> = Vec::new();
    let mut open_sends: Vec<(usize, (u16, u64))> = Vec::new();

    for event in events {
        match event.kind {
            EventKind::MessageSend => {
                if let Some(key) = flow_key(event) {
                    let idx = flows.len();
                    flows.push(MessageFlow {
                        opcode: key.0,
                        sequence_number: key.1,
                        sent_at: Some(event.at),
                        received_at: None,
                        round_trip: None,
                    });
                    open_sends.push((idx, key));
                }
            }
            EventKind::MessageReceive => {
                if let Some(key) = flow_key(event) {
                    if let Some(pos) = open_sends.iter().position(|(_, k)| *k == key) {
                        let (idx, _) = open_sends.remove(pos);
                        let flow = &mut flows[idx];
                        flow.received_at = Some(event.at);
                        flow.round_trip = flow.sent_at.map(|s| event.at.duration_since(s));
                    } else {
                        // Unsolicited push with no matching send: still a
                        // flow, just receive-only.
                        flows.push(MessageFlow {
                            opcode: key.0,
                            sequence_number: key.1,
                            sent_at: None,
                            received_at: Some(event.at),
                            round_trip: None,
                        });
                    }
                }
            }
            _ => {}
        }
    }
    flows
}

fn nearest_rank(sorted: &[Duration], percentile: f64) -> Duration {
    let n = sorted.len();
    if n == 0 {
        return Duration::ZERO;
    }
    let rank = ((percentile / 100.0) * n as f64).ceil() as usize;
    let idx = rank.saturating_sub(1).min(n - 1);
    sorted[idx]
}

fn compute_metrics(flows: &[MessageFlow], session: &Session) -> NetworkMetrics {
    let mut latencies: Vec<Duration> = flows.iter().filter_map(|f| f.round_trip).collect();
    latencies.sort_unstable();

    let sample_count = latencies.len();
    let min_latency = latencies.first().copied();
    let max_latency = latencies.last().copied();
    let mean_latency = if sample_count > 0 {
        let total_nanos: u128 = latencies.iter().map(|d| d.as_nanos()).sum();
        Some(Duration::from_nanos((total_nanos / sample_count as u128) as u64))
    } else {
        None
    };

    let jitter = if sample_count > 1 {
        let flows_in_order: Vec<Duration> = flows
            .iter()
            .filter(|f| f.sent_at.is_some())
            .filter_map(|f| f.round_trip)
            .collect();
        if flows_in_order.len() > 1 {
            let diffs: Vec<i128> = flows_in_order
                .windows(2)
                .map(|w| (w[1].as_nanos() as i128 - w[0].as_nanos() as i128).abs())
                .collect();
            let mean_diff = diffs.iter().sum::<i128>() / diffs.len() as i128;
            Some(Duration::from_nanos(mean_diff as u64))
        } else {
            None
        }
    } else {
        None
    };

    let sent_count = flows.iter().filter(|f| f.sent_at.is_some()).count();
    let unmatched_sends = flows
        .iter()
        .filter(|f| f.sent_at.is_some() && f.received_at.is_none())
        .count();
    let loss_rate = if sent_count > 0 {
        unmatched_sends as f64 / sent_count as f64
    } else {
        0.0
    };

    let message_event_count = session
        .events
        .iter()
        .filter(|e| matches!(e.kind, EventKind::MessageSend | EventKind::MessageReceive))
        .count();
    let span = session_span(&session.events);
    let throughput_msgs_per_sec = if span.as_secs_f64() > 0.0 {
        message_event_count as f64 / span.as_secs_f64()
    } else {
        0.0
    };

    NetworkMetrics {
        sample_count,
        min_latency,
        max_latency,
        mean_latency,
        p50_latency: (sample_count > 0).then(|| nearest_rank(&latencies, 50.0)),
        p95_latency: (sample_count > 0).then(|| nearest_rank(&latencies, 95.0)),
        p99_latency: (sample_count > 0).then(|| nearest_rank(&latencies, 99.0)),
        jitter,
        loss_rate,
        throughput_msgs_per_sec,
        sorted_latencies: latencies,
    }
}

fn find_anomalies(flows: &[MessageFlow], threshold: Duration) -> Vec<LatencyAnomaly> {
    if threshold.is_zero() {
        return Vec::new();
    }
    flows
        .iter()
        .filter_map(|f| {
            let rt = f.round_trip?;
            (rt > threshold).then_some(LatencyAnomaly {
                sequence_number: f.sequence_number,
                latency: rt,
                threshold,
            })
        })
        .collect()
}

fn session_span(events: &[Event]) -> Duration {
    match (events.first(), events.last()) {
        (Some(first), Some(last)) => last.at.duration_since(first.at),
        _ => Duration::ZERO,
    }
}

fn compute_stability(session: &Session) -> ConnectionStability {
    let events = &session.events;
    let reconnect_count = session.footer.reconnect_count;
    let total_duration = session_span(events);
    let mut down_time = Duration::ZERO;
    let mut prev_at: Option<MonotonicInstant> = None;
    for event in events {
        if event.kind == EventKind::Reconnect {
            if let Some(prev) = prev_at {
                down_time += event.at.duration_since(prev);
            }
        }
        prev_at = Some(event.at);
    }
    let connected_duration = total_duration.saturating_sub(down_time);
    let stability_ratio = if total_duration.as_secs_f64() > 0.0 {
        connected_duration.as_secs_f64() / total_duration.as_secs_f64()
    } else {
        1.0
    };

    let connect_count = events.iter().filter(|e| e.kind == EventKind::Connect).count() as u64;
    let segments = reconnect_count + 1;
    let mean_connection_duration = Duration::from_secs_f64(
        connected_duration.as_secs_f64() / segments as f64,
    );
    let normal_close_count = u64::from(session.footer.close_reason_code == Some(0));
    let reconnect_denominator = reconnect_count + normal_close_count;
    let reconnect_rate = if reconnect_denominator > 0 {
        reconnect_count as f64 / reconnect_denominator as f64
    } else {
        0.0
    };

    ConnectionStability {
        connect_count,
        disconnect_count: reconnect_count,
        reconnect_count,
        total_duration,
        connected_duration,
        stability_ratio,
        mean_connection_duration,
        normal_close_count,
        reconnect_rate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::AttrValue;
    use crate::recorder::SessionRecorder;
    use std::collections::BTreeMap;

    fn attrs(opcode: u16, seq: u64) -> BTreeMap<String, AttrValue> {
        let mut m = BTreeMap::new();
        m.insert(attr_keys::OPCODE.to_owned(), AttrValue::U64(opcode as u64));
        m.insert(attr_keys::SEQUENCE_NUMBER.to_owned(), AttrValue::U64(seq));
        m
    }

    #[test]
    fn matches_send_and_receive_by_opcode_and_sequence() {
        let rec = SessionRecorder::new("analyse-1");
        rec.record_event(EventKind::MessageSend, attrs(0x0300, 1))
            .unwrap();
        std::thread::sleep(Duration::from_millis(5));
        rec.record_event(EventKind::MessageReceive, attrs(0x0300, 1))
            .unwrap();
        rec.record_close(0, "done").unwrap();

        let session = rec.get_session();
        let report = TimelineAnalyser::analyse(&session);
        assert_eq!(report.message_flows.len(), 1);
        let flow = &report.message_flows[0];
        assert!(flow.sent_at.is_some());
        assert!(flow.received_at.is_some());
        assert!(flow.round_trip.unwrap() >= Duration::from_millis(1));
    }

    #[test]
    fn unmatched_send_counts_toward_loss_rate() {
        let rec = SessionRecorder::new("analyse-2");
        rec.record_event(EventKind::MessageSend, attrs(0x0300, 1))
            .unwrap();
        rec.record_event(EventKind::MessageSend, attrs(0x0300, 2))
            .unwrap();
        rec.record_event(EventKind::MessageReceive, attrs(0x0300, 1))
            .unwrap();
        rec.record_close(0, "done").unwrap();

        let session = rec.get_session();
        let report = TimelineAnalyser::analyse(&session);
        assert_eq!(report.network_metrics.loss_rate, 0.5);
    }

    #[test]
    fn percentiles_use_nearest_rank_method() {
        let latencies: Vec<Duration> = (1..=10).map(Duration::from_millis).collect();
        let p50 = nearest_rank(&latencies, 50.0);
        // ceil(0.5 * 10) - 1 = 4 -> latencies[4] == 5ms
        assert_eq!(p50, Duration::from_millis(5));
        let p99 = nearest_rank(&latencies, 99.0);
        assert_eq!(p99, Duration::from_millis(10));
    }

    #[test]
    fn reconnect_events_reduce_stability_ratio() {
        let rec = SessionRecorder::new("analyse-3");
        rec.record_event(EventKind::Connect, BTreeMap::new())
            .unwrap();
        std::thread::sleep(Duration::from_millis(10));
        rec.record_event(EventKind::Reconnect, BTreeMap::new())
            .unwrap();
        std::thread::sleep(Duration::from_millis(10));
        rec.record_close(0, "done").unwrap();

        let session = rec.get_session();
        let report = TimelineAnalyser::analyse(&session);
        assert_eq!(report.connection_stability.reconnect_count, 1);
        assert!(report.connection_stability.stability_ratio < 1.0);
        assert!(report.connection_stability.stability_ratio >= 0.0);
    }

    #[test]
    fn anomalies_are_flagged_above_threshold() {
        let rec = SessionRecorder::new("analyse-4");
        rec.record_event(EventKind::MessageSend, attrs(0x0300, 1))
            .unwrap();
        rec.record_event(EventKind::MessageReceive, attrs(0x0300, 1))
            .unwrap();
        rec.record_close(0, "done").unwrap();
        let session = rec.get_session();

        let report =
            TimelineAnalyser::analyse_with_anomaly_threshold(&session, Duration::from_nanos(0));
        // Any positive round trip should be flagged against a zero floor,
        // but find_anomalies short-circuits a literal zero threshold, so
        // use a 1ns threshold instead to exercise the real comparison.
        let report2 =
            TimelineAnalyser::analyse_with_anomaly_threshold(&session, Duration::from_nanos(1));
        assert!(report.latency_anomalies.is_empty());
        assert_eq!(report2.latency_anomalies.len(), 1);
    }
}
