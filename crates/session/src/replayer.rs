//! [`SessionReplayer`]: deterministic playback of a sealed session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::event::Event;
use crate::recorder::Session;

/// Playback rate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReplaySpeed {
    /// Sleep to match the original inter-event gaps exactly.
    Real,
    /// Scale gaps by `1/k`; `Fast(2.0)` replays twice as fast.
    Fast(f64),
    /// `advance()` releases exactly one event; no automatic timing.
    Step,
}

/// Counters exposed while (and after) a replay runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub total_events: u64,
    pub replayed_events: u64,
    pub error_events: u64,
}

/// A callback invoked once per replayed event. Returning `Err` is either
/// fatal (if the replayer was built with `pause_on_error = true`) or
/// counted and replay continues.
pub type ReplayCallback = Box<dyn FnMut(&Event) -> Result<(), String> + Send>;

struct Control {
    paused: AtomicBool,
    stopped: AtomicBool,
    resume_notify: Notify,
    step_permits: Semaphore,
}

/// Replays a sealed [`Session`] in timestamp order at a configurable rate.
///
/// Must not be constructed from an unsealed session — `SessionReplayer::new`
/// rejects one, since §3 invariant 4 makes replay a read-only operation
/// over an immutable record.
pub struct SessionReplayer {
    session: Session,
    speed: ReplaySpeed,
    pause_on_error: bool,
    control: Arc<Control>,
    stats: Arc<Mutex<ReplayStats>>,
    handle: Option<JoinHandle<()>>,
}

/// A session passed to [`SessionReplayer::new`] was not sealed
/// (`end_time` is `None`).
#[derive(Debug, thiserror::Error)]
#[error("session {0} is not sealed; replay requires an immutable record")]
pub struct UnsealedSessionError(pub String);

impl SessionReplayer {
    pub fn new(
        session: Session,
        speed: ReplaySpeed,
        pause_on_error: bool,
    ) -> Result<Self, UnsealedSessionError> {
        if !session.is_sealed() {
            return Err(UnsealedSessionError(session.id.clone()));
        }
        let total_events = session.events.len() as u64;
        Ok(SessionReplayer {
            session,
            speed,
            pause_on_error,
            control: Arc::new(Control {
                paused: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                resume_notify: Notify::new(),
                step_permits: Semaphore::new(0),
            }),
            stats: Arc::new(Mutex::new(ReplayStats {
                total_events,
                ..Default::default()
            })),
            handle: None,
        })
    }

    /// Spawn the background replay task. `callback` is invoked once per
    /// event, in order.
    pub fn start(&mut self, callback: ReplayCallback) {
        let events = self.session.events.clone();
        let session_id = self.session.id.clone();
        let speed = self.speed;
        let pause_on_error = self.pause_on_error;
        let control = self.control.clone();
        let stats = self.stats.clone();

        info!(session_id = %session_id, events = events.len(), ?speed, "replay starting");
        let handle = tokio::spawn(async move {
            run_replay(&session_id, events, speed, pause_on_error, control, stats, callback).await;
        });
        self.handle = Some(handle);
    }

    pub fn pause(&self) {
        self.control.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.control.paused.store(false, Ordering::SeqCst);
        self.control.resume_notify.notify_one();
    }

    /// Release exactly one event in [`ReplaySpeed::Step`] mode. Calling
    /// this before the replay task is waiting is fine: permits queue.
    pub fn advance(&self) {
        self.control.step_permits.add_permits(1);
    }

    /// Signal cancellation. Does not block; call [`SessionReplayer::wait`]
    /// afterward to know when the background task has fully quiesced.
    pub fn stop(&self) {
        self.control.stopped.store(true, Ordering::SeqCst);
        self.control.resume_notify.notify_one();
        self.control.step_permits.add_permits(1);
    }

    /// Block until the replay task has exited. Mandatory before asserting
    /// on `stats()` in deterministic tests.
    pub async fn wait(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }

    pub fn stats(&self) -> ReplayStats {
        *self.stats.lock().expect("replay stats mutex poisoned")
    }
}

async fn run_replay(
    session_id: &str,
    events: Vec<Event>,
    speed: ReplaySpeed,
    pause_on_error: bool,
    control: Arc<Control>,
    stats: Arc<Mutex<ReplayStats>>,
    mut callback: ReplayCallback,
) {
    let mut prev_at = None;
    for event in &events {
        if control.stopped.load(Ordering::SeqCst) {
            break;
        }

        while control.paused.load(Ordering::SeqCst) && !control.stopped.load(Ordering::SeqCst) {
            control.resume_notify.notified().await;
        }
        if control.stopped.load(Ordering::SeqCst) {
            break;
        }

        match speed {
            ReplaySpeed::Real | ReplaySpeed::Fast(_) => {
                if let Some(prev) = prev_at {
                    let gap = event.at.duration_since(prev);
                    let scaled = match speed {
                        ReplaySpeed::Fast(k) if k > 0.0 => {
                            std::time::Duration::from_secs_f64(gap.as_secs_f64() / k)
                        }
                        _ => gap,
                    };
                    if !scaled.is_zero() {
                        tokio::time::sleep(scaled).await;
                    }
                }
            }
            ReplaySpeed::Step => {
                let permit = control.step_permits.acquire().await;
                match permit {
                    Ok(p) => p.forget(),
                    Err(_) => break,
                }
            }
        }
        prev_at = Some(event.at);

        if control.stopped.load(Ordering::SeqCst) {
            break;
        }

        let result = callback(event);
        let mut s = stats.lock().expect("replay stats mutex poisoned");
        s.replayed_events += 1;
        if let Err(e) = &result {
            s.error_events += 1;
            drop(s);
            warn!(session_id = %session_id, seq = event.seq, error = %e, "replay callback failed");
            if pause_on_error {
                debug!(session_id = %session_id, seq = event.seq, "replay pausing on error");
                break;
            }
        }
    }
    let final_stats = *stats.lock().expect("replay stats mutex poisoned");
    info!(
        session_id = %session_id,
        replayed = final_stats.replayed_events,
        errors = final_stats.error_events,
        "replay finished"
    );
}
