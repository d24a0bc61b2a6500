use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use veriface_core::{Terminal, VerificationSession, VerifyEvent};
use zbus::interface;
use zbus::object_server::SignalEmitter;

use crate::config::Config;
use crate::engine::{Analyzed, EngineHandle};
use crate::rate_limiter::RateLimiter;
use crate::store::ReferenceStore;

pub const BUS_NAME: &str = "org.veriface.Verify1";
pub const OBJECT_PATH: &str = "/org/veriface/Verify1";

/// One open verification session.
pub struct SessionEntry {
    pub subject: String,
    pub session: VerificationSession,
    pub last_active: Instant,
}

/// Shared state accessible by D-Bus method handlers.
pub struct AppState {
    pub config: Config,
    pub engine: EngineHandle,
    pub store: ReferenceStore,
    pub rate_limiter: RateLimiter,
    pub sessions: HashMap<String, SessionEntry>,
}

impl AppState {
    fn entry_mut(&mut self, session_id: &str) -> zbus::fdo::Result<&mut SessionEntry> {
        self.sessions
            .get_mut(session_id)
            .ok_or_else(|| zbus::fdo::Error::UnknownObject(format!("no session '{session_id}'")))
    }
}

/// D-Bus interface for the verification daemon.
///
/// Bus name: org.veriface.Verify1
/// Object path: /org/veriface/Verify1
///
/// A client opens a session for a subject, streams analyzed frames into it
/// and listens for the `Progress` and `Result` signals. Sessions opened for
/// a subject with stored references are registered immediately; otherwise
/// the client registers one with `RegisterImage`.
pub struct VerifyService {
    pub state: Arc<Mutex<AppState>>,
}

fn failed(e: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

fn to_json(value: &impl serde::Serialize) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(failed)
}

#[interface(name = "org.veriface.Verify1")]
impl VerifyService {
    /// Enroll a reference image for a subject. Returns the reference ID.
    async fn enroll(&self, subject: &str, label: &str, image: Vec<u8>) -> zbus::fdo::Result<String> {
        tracing::info!(subject, label, bytes = image.len(), "enroll requested");

        // Copy values while holding lock, then release
        let engine = self.state.lock().await.engine.clone();

        // Run engine (no lock held)
        let result = engine.extract(image).await.map_err(|e| {
            tracing::error!(error = %e, "enroll failed");
            failed(e)
        })?;

        let state = self.state.lock().await;
        let reference_id = state
            .store
            .insert(subject, label, &result.descriptor, result.quality_score)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "enroll: store insert failed");
                failed(e)
            })?;

        tracing::info!(reference_id = %reference_id, subject, label, "enrolled successfully");
        Ok(reference_id)
    }

    /// List stored references for a subject as JSON.
    async fn list_references(&self, subject: &str) -> zbus::fdo::Result<String> {
        let state = self.state.lock().await;
        let references = state.store.list_by_subject(subject).await.map_err(failed)?;
        to_json(&references)
    }

    /// Remove a stored reference by ID (scoped to subject).
    async fn remove_reference(&self, subject: &str, reference_id: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(subject, reference_id, "remove_reference requested");
        let state = self.state.lock().await;
        let removed = state
            .store
            .remove(subject, reference_id)
            .await
            .map_err(failed)?;
        if !removed {
            tracing::warn!(reference_id, subject, "reference not found or not owned by subject");
        }
        Ok(removed)
    }

    /// Open a verification session for a subject. Returns the session ID.
    async fn open_session(
        &self,
        subject: &str,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) -> zbus::fdo::Result<String> {
        let session_id = uuid::Uuid::new_v4().to_string();

        let events = {
            let mut state = self.state.lock().await;
            state
                .rate_limiter
                .check(subject, Instant::now())
                .map_err(|e| {
                    tracing::warn!(subject, "open_session: rate limited");
                    zbus::fdo::Error::AccessDenied(e.to_string())
                })?;

            if state.sessions.len() >= state.config.max_sessions {
                return Err(zbus::fdo::Error::LimitsExceeded(format!(
                    "at most {} sessions may be open",
                    state.config.max_sessions
                )));
            }

            let references = state
                .store
                .references_for_subject(subject)
                .await
                .map_err(failed)?;

            let mut session = VerificationSession::new(state.config.verify.clone());
            if !references.is_empty() {
                let count = references.len();
                session
                    .register_references(references.into_iter().map(|r| r.descriptor))
                    .map_err(failed)?;
                tracing::debug!(subject, references = count, "session seeded from store");
            }
            let events = session.take_events();

            state.sessions.insert(
                session_id.clone(),
                SessionEntry {
                    subject: subject.to_string(),
                    session,
                    last_active: Instant::now(),
                },
            );
            events
        };

        tracing::info!(subject, session = %session_id, "session opened");
        forward(&emitter, &session_id, events).await;
        Ok(session_id)
    }

    /// Register a reference image into a session, replacing its references.
    async fn register_image(
        &self,
        session_id: &str,
        image: Vec<u8>,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) -> zbus::fdo::Result<()> {
        let engine = {
            let mut state = self.state.lock().await;
            state.entry_mut(session_id)?;
            state.engine.clone()
        };

        let analyzed = engine.analyze(image.clone()).await;

        let (result, events) = {
            let mut state = self.state.lock().await;
            let entry = state.entry_mut(session_id)?;
            entry.last_active = Instant::now();
            let result = entry
                .session
                .register_image(&mut Analyzed::new(analyzed), &image);
            (result, entry.session.take_events())
        };

        forward(&emitter, session_id, events).await;
        result.map_err(failed)
    }

    /// Analyze one live frame. Returns the frame report as JSON.
    ///
    /// A frame arriving while the previous one is still being analyzed is
    /// dropped and reported as skipped.
    async fn process_frame(
        &self,
        session_id: &str,
        frame: Vec<u8>,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) -> zbus::fdo::Result<String> {
        let (engine, ticket) = {
            let mut state = self.state.lock().await;
            let entry = state.entry_mut(session_id)?;
            entry.last_active = Instant::now();
            let Some(ticket) = entry.session.begin_frame() else {
                return to_json(&entry.session.snapshot());
            };
            (state.engine.clone(), ticket)
        };

        // Run engine (no lock held)
        let analyzed = engine.analyze(frame).await;

        let (report, events) = {
            let mut state = self.state.lock().await;
            let entry = state.entry_mut(session_id)?;
            let report = match analyzed {
                Ok(detections) => entry.session.finish_frame(ticket, &detections),
                Err(e) => entry.session.abandon_frame(ticket, &e.into_analyzer_error()),
            };
            let events = entry.session.take_events();

            if !report.skipped {
                let subject = entry.subject.clone();
                match report.terminal {
                    Terminal::Success => state.rate_limiter.record_success(&subject),
                    Terminal::Fail => state.rate_limiter.record_failure(&subject, Instant::now()),
                    Terminal::None => {}
                }
            }
            (report, events)
        };

        forward(&emitter, session_id, events).await;
        to_json(&report)
    }

    /// Compare one photo against the session's references. Returns the
    /// comparison as JSON, `null` when the photo has no face.
    async fn verify_photo(
        &self,
        session_id: &str,
        image: Vec<u8>,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) -> zbus::fdo::Result<String> {
        let engine = {
            let mut state = self.state.lock().await;
            let subject = state.entry_mut(session_id)?.subject.clone();
            state
                .rate_limiter
                .check(&subject, Instant::now())
                .map_err(|e| zbus::fdo::Error::AccessDenied(e.to_string()))?;
            state.engine.clone()
        };

        let analyzed = engine.analyze(image.clone()).await;

        let (result, events) = {
            let mut state = self.state.lock().await;
            let entry = state.entry_mut(session_id)?;
            entry.last_active = Instant::now();
            let result = entry
                .session
                .verify_photo_image(&mut Analyzed::new(analyzed), &image);
            (result, entry.session.take_events())
        };

        forward(&emitter, session_id, events).await;
        to_json(&result.map_err(failed)?)
    }

    /// Clear counters and liveness progress; keep the references.
    async fn reset(&self, session_id: &str) -> zbus::fdo::Result<()> {
        let mut state = self.state.lock().await;
        let entry = state.entry_mut(session_id)?;
        entry.session.reset();
        entry.last_active = Instant::now();
        Ok(())
    }

    /// Return the session to the unregistered state.
    async fn full_reset(&self, session_id: &str) -> zbus::fdo::Result<()> {
        let mut state = self.state.lock().await;
        let entry = state.entry_mut(session_id)?;
        entry.session.full_reset();
        entry.last_active = Instant::now();
        Ok(())
    }

    async fn close_session(&self, session_id: &str) -> zbus::fdo::Result<bool> {
        let removed = self.state.lock().await.sessions.remove(session_id).is_some();
        if removed {
            tracing::info!(session = %session_id, "session closed");
        }
        Ok(removed)
    }

    /// Return session state as JSON.
    async fn session_status(&self, session_id: &str) -> zbus::fdo::Result<String> {
        let mut state = self.state.lock().await;
        let entry = state.entry_mut(session_id)?;
        let session = &entry.session;
        Ok(serde_json::json!({
            "subject": entry.subject,
            "registered": session.is_registered(),
            "references": session.store().len(),
            "busy": session.is_busy(),
            "terminal": session.terminal(),
            "match_count": session.match_count(),
            "fail_count": session.fail_count(),
            "similarity": session.similarity(),
            "liveness_step": session.liveness().step(),
            "liveness_progress": session.liveness().progress_percent(),
        })
        .to_string())
    }

    /// Return daemon status information as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let state = self.state.lock().await;
        let reference_count = state.store.count_all().await.unwrap_or(0);

        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "references_enrolled": reference_count,
            "open_sessions": state.sessions.len(),
            "max_sessions": state.config.max_sessions,
            "liveness_enabled": state.config.verify.liveness.enabled,
        })
        .to_string())
    }

    /// Terminal result of a session (success or fail), as JSON.
    #[zbus(signal)]
    async fn result(emitter: &SignalEmitter<'_>, session: &str, payload: &str) -> zbus::Result<()>;

    /// Progress notification from a session, as JSON.
    #[zbus(signal)]
    async fn progress(emitter: &SignalEmitter<'_>, session: &str, payload: &str)
        -> zbus::Result<()>;
}

/// Emit buffered session events as D-Bus signals.
async fn forward(emitter: &SignalEmitter<'_>, session_id: &str, events: Vec<VerifyEvent>) {
    for event in events {
        let sent = match &event {
            VerifyEvent::Success(result) | VerifyEvent::Fail(result) => match serde_json::to_string(result) {
                Ok(payload) => VerifyService::result(emitter, session_id, &payload).await,
                Err(e) => {
                    tracing::error!(error = %e, "failed to encode result");
                    continue;
                }
            },
            VerifyEvent::Progress(progress) => match serde_json::to_string(progress) {
                Ok(payload) => VerifyService::progress(emitter, session_id, &payload).await,
                Err(e) => {
                    tracing::error!(error = %e, "failed to encode progress");
                    continue;
                }
            },
        };
        if let Err(e) = sent {
            tracing::warn!(error = %e, session = %session_id, "failed to emit signal");
        }
    }
}

/// Drive liveness timers of open sessions and close idle ones.
///
/// Runs until the process exits.
pub async fn run_session_timers(
    state: Arc<Mutex<AppState>>,
    emitter: SignalEmitter<'static>,
    period: Duration,
    idle: Duration,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        interval.tick().await;

        let pending = {
            let mut guard = state.lock().await;
            let now = Instant::now();
            let expired = expire_idle(&mut guard.sessions, now, idle);
            for session_id in expired {
                tracing::info!(session = %session_id, "session closed after idle timeout");
            }

            let mut pending = Vec::new();
            for (session_id, entry) in guard.sessions.iter_mut() {
                entry.session.tick(now);
                let events = entry.session.take_events();
                if !events.is_empty() {
                    pending.push((session_id.clone(), events));
                }
            }
            pending
        };

        for (session_id, events) in pending {
            forward(&emitter, &session_id, events).await;
        }
    }
}

/// Remove sessions idle for longer than `idle`. A session with a frame in
/// flight is kept.
fn expire_idle(
    sessions: &mut HashMap<String, SessionEntry>,
    now: Instant,
    idle: Duration,
) -> Vec<String> {
    let expired: Vec<String> = sessions
        .iter()
        .filter(|(_, entry)| {
            !entry.session.is_busy() && now.saturating_duration_since(entry.last_active) > idle
        })
        .map(|(id, _)| id.clone())
        .collect();
    for id in &expired {
        sessions.remove(id);
    }
    expired
}
