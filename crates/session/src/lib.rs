//! Recording, export, replay, analysis, and assertion of game-client test
//! sessions.

pub mod analyser;
pub mod assertions;
pub mod event;
pub mod export;
pub mod recorder;
pub mod replayer;

pub use analyser::{
    AnalysisReport, ConnectionStability, LatencyAnomaly, MessageFlow, NetworkMetrics,
    TimelineAnalyser,
};
pub use assertions::{
    Assertion, AssertionOutcome, AssertionSuite, ErrorRateAssertion, LatencyAssertion,
    MessageOrderAssertion, ReconnectAssertion,
};
pub use event::{attr_keys, AttrValue, Event, EventKind, MonotonicInstant};
pub use export::{export_session, parse_session, ExportError};
pub use recorder::{Direction, FrameCapture, Session, SessionError, SessionFooter, SessionRecorder};
pub use replayer::{ReplayCallback, ReplaySpeed, ReplayStats, SessionReplayer, UnsealedSessionError};
