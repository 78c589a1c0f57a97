// THEORY:
// The `SessionController` turns a stream of "compare these two photos" requests
// into at most one running alignment at a time. Each request becomes a session
// that walks `idle -> loading images -> aligning -> computing differences ->
// complete`, or stops early in `error` or `stopped`.
//
// Key architectural principles:
// 1.  **Single Flight**: A new input pair replaces whatever session is active. The
//     replaced session is cancelled and its consumer is told `None` before the
//     replacement starts.
// 2.  **Exactly One Answer**: Every session delivers one callback: the overlay,
//     the unchanged reference (identical inputs), or `None` (failure or abort).
//     Only dropping the controller ends a session silently.
// 3.  **Deferred Background Work**: In background mode a session waits a short,
//     revocable delay first so rapid input changes do not thrash. Switching to
//     foreground starts a waiting session at once.
// 4.  **Errors Stop Here**: Load, capability, alignment and context failures all
//     end as status `error: <message>` plus a `None` callback. None of them reach
//     the caller as a panic or an `Err`.

use crate::core_modules::capability::CapabilityLoader;
use crate::core_modules::difference::OverlayResult;
use crate::error::AlignerError;
use crate::execution::ExecutionContext;
use crate::ingest::{self, ImageLocator};
use crate::pipeline::{PipelineConfig, PipelineStage};
use crate::schedule::ScheduledTask;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_BACKGROUND_DELAY: Duration = Duration::from_millis(300);

/// How eagerly a new input pair is processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PriorityMode {
    /// The user asked for the analysis; start right away.
    #[default]
    Foreground,
    /// Speculative work; wait `background_delay` before starting.
    Background,
}

/// Lifecycle state of the controller's most recent session.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionStatus {
    #[default]
    Idle,
    LoadingImages,
    Aligning,
    Diffing,
    Complete,
    Error(String),
    Stopped,
}

impl SessionStatus {
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            SessionStatus::LoadingImages | SessionStatus::Aligning | SessionStatus::Diffing
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Idle => f.write_str("idle"),
            SessionStatus::LoadingImages => f.write_str("loading images"),
            SessionStatus::Aligning => f.write_str("aligning"),
            SessionStatus::Diffing => f.write_str("computing differences"),
            SessionStatus::Complete => f.write_str("complete"),
            SessionStatus::Error(message) => write!(f, "error: {message}"),
            SessionStatus::Stopped => f.write_str("stopped"),
        }
    }
}

/// What a successful session hands to the consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutput {
    /// Both locators were identical; the reference is shown unchanged.
    Reference(ImageLocator),
    Overlay(OverlayResult),
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Wait before a background-priority session starts.
    pub background_delay: Duration,
    pub pipeline: PipelineConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            background_delay: DEFAULT_BACKGROUND_DELAY,
            pipeline: PipelineConfig::default(),
        }
    }
}

/// The control surface a UI holds on to.
pub trait AlignmentControl: Send + Sync {
    fn set_priority_mode(&self, mode: PriorityMode);
    fn status(&self) -> SessionStatus;
    fn is_busy(&self) -> bool;
    /// Stops the active session, if any. Idempotent.
    fn abort(&self);
}

type ResultCallback = dyn Fn(Option<SessionOutput>) + Send + Sync;

enum Phase {
    /// Waiting out the background delay.
    Deferred {
        timer: ScheduledTask,
        reference: ImageLocator,
        current: ImageLocator,
    },
    Running,
}

struct ActiveSession {
    id: u64,
    cancel: CancellationToken,
    phase: Phase,
}

impl ActiveSession {
    fn stop(self) -> u64 {
        self.cancel.cancel();
        if let Phase::Deferred { timer, .. } = &self.phase {
            timer.revoke();
        }
        self.id
    }
}

struct ControllerState {
    status: SessionStatus,
    priority: PriorityMode,
    next_id: u64,
    active: Option<ActiveSession>,
    closed: bool,
}

/// A run to launch once the state lock is released.
struct Launch {
    id: u64,
    cancel: CancellationToken,
    reference: ImageLocator,
    current: ImageLocator,
}

enum Plan {
    Deliver(Option<SessionOutput>),
    Launch(Launch),
    Wait,
}

struct Shared {
    handle: Handle,
    loader: Arc<CapabilityLoader>,
    config: ControllerConfig,
    on_result: Box<ResultCallback>,
    state: Mutex<ControllerState>,
}

/// Runs at most one alignment session at a time and reports each session's
/// result through a callback.
pub struct SessionController {
    shared: Arc<Shared>,
}

impl SessionController {
    /// Sessions are spawned on `handle`; `on_result` is invoked once per session.
    pub fn new<F>(handle: Handle, loader: Arc<CapabilityLoader>, config: ControllerConfig, on_result: F) -> Self
    where
        F: Fn(Option<SessionOutput>) + Send + Sync + 'static,
    {
        Self {
            shared: Arc::new(Shared {
                handle,
                loader,
                config,
                on_result: Box::new(on_result),
                state: Mutex::new(ControllerState {
                    status: SessionStatus::Idle,
                    priority: PriorityMode::default(),
                    next_id: 1,
                    active: None,
                    closed: false,
                }),
            }),
        }
    }

    /// Starts a session for a new input pair, replacing any active one.
    pub fn set_inputs(&self, reference: impl Into<ImageLocator>, current: impl Into<ImageLocator>) {
        let reference = reference.into();
        let current = current.into();
        let shared = &self.shared;

        let (superseded, id, plan) = {
            let mut state = shared.lock();
            let superseded = state.active.take().map(ActiveSession::stop);
            let id = state.next_id;
            state.next_id += 1;

            let plan = if reference.is_empty() {
                state.status = SessionStatus::Idle;
                Plan::Deliver(None)
            } else if current.is_empty() || reference == current {
                state.status = SessionStatus::Complete;
                Plan::Deliver(Some(SessionOutput::Reference(reference.clone())))
            } else {
                match state.priority {
                    PriorityMode::Foreground => {
                        let cancel = CancellationToken::new();
                        state.active = Some(ActiveSession {
                            id,
                            cancel: cancel.clone(),
                            phase: Phase::Running,
                        });
                        state.status = SessionStatus::LoadingImages;
                        Plan::Launch(Launch {
                            id,
                            cancel,
                            reference: reference.clone(),
                            current: current.clone(),
                        })
                    }
                    PriorityMode::Background => {
                        let weak = Arc::downgrade(shared);
                        let timer = ScheduledTask::after(
                            &shared.handle,
                            shared.config.background_delay,
                            start_deferred(weak, id),
                        );
                        state.active = Some(ActiveSession {
                            id,
                            cancel: CancellationToken::new(),
                            phase: Phase::Deferred {
                                timer,
                                reference: reference.clone(),
                                current: current.clone(),
                            },
                        });
                        state.status = SessionStatus::Idle;
                        Plan::Wait
                    }
                }
            };
            (superseded, id, plan)
        };

        info!(session = id, %reference, %current, "new input pair");
        if let Some(old) = superseded {
            info!(session = old, "session superseded");
            (shared.on_result)(None);
        }
        match plan {
            Plan::Deliver(output) => (shared.on_result)(output),
            Plan::Launch(launch) => shared.launch(launch),
            Plan::Wait => debug!(delay = ?shared.config.background_delay, "deferring background session"),
        }
    }

    pub fn priority_mode(&self) -> PriorityMode {
        self.shared.lock().priority
    }
}

impl AlignmentControl for SessionController {
    fn set_priority_mode(&self, mode: PriorityMode) {
        let launch = {
            let mut state = self.shared.lock();
            state.priority = mode;
            let deferred = matches!(
                state.active,
                Some(ActiveSession { phase: Phase::Deferred { .. }, .. })
            );
            if mode == PriorityMode::Foreground && deferred {
                self.shared.promote(&mut state)
            } else {
                None
            }
        };
        if let Some(launch) = launch {
            info!(session = launch.id, "foreground requested, starting deferred session");
            self.shared.launch(launch);
        }
    }

    fn status(&self) -> SessionStatus {
        self.shared.lock().status.clone()
    }

    fn is_busy(&self) -> bool {
        matches!(
            self.shared.lock().active,
            Some(ActiveSession { phase: Phase::Running, .. })
        )
    }

    fn abort(&self) {
        let stopped = {
            let mut state = self.shared.lock();
            let stopped = state.active.take().map(ActiveSession::stop);
            if stopped.is_some() {
                state.status = SessionStatus::Stopped;
            }
            stopped
        };
        if let Some(id) = stopped {
            info!(session = id, "session aborted");
            (self.shared.on_result)(None);
        }
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.closed = true;
        if let Some(active) = state.active.take() {
            debug!(session = active.id, "controller dropped, cancelling session");
            active.stop();
        }
    }
}

async fn start_deferred(shared: Weak<Shared>, id: u64) {
    let Some(shared) = shared.upgrade() else {
        return;
    };
    let launch = {
        let mut state = shared.lock();
        if state.active.as_ref().map(|a| a.id) == Some(id) {
            shared.promote(&mut state)
        } else {
            None
        }
    };
    if let Some(launch) = launch {
        info!(session = id, "background delay elapsed");
        shared.launch(launch);
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Moves a deferred session to running. Caller holds the lock.
    fn promote(&self, state: &mut ControllerState) -> Option<Launch> {
        let active = state.active.as_mut()?;
        let Phase::Deferred { timer, reference, current } = std::mem::replace(&mut active.phase, Phase::Running)
        else {
            return None;
        };
        timer.revoke();
        state.status = SessionStatus::LoadingImages;
        Some(Launch {
            id: active.id,
            cancel: active.cancel.clone(),
            reference,
            current,
        })
    }

    fn launch(self: &Arc<Self>, launch: Launch) {
        let shared = self.clone();
        self.handle.spawn(async move { shared.run(launch).await });
    }

    async fn run(self: Arc<Self>, launch: Launch) {
        let Launch { id, cancel, reference, current } = launch;
        info!(session = id, status = %SessionStatus::LoadingImages, "session started");

        let options = self.config.pipeline.ingest_options();
        let (frames, engine) = tokio::select! {
            _ = cancel.cancelled() => return,
            pair = async {
                tokio::join!(ingest::load_pair(&reference, &current, options), self.loader.ensure_ready())
            } => pair,
        };
        let engine = match engine {
            Ok(engine) => engine,
            Err(e) => return self.fail(id, e.into()),
        };
        let (reference_frame, current_frame) = match frames {
            Ok(frames) => frames,
            Err(e) => return self.fail(id, e.into()),
        };

        if !self.advance(id, SessionStatus::Aligning) {
            return;
        }
        let context = ExecutionContext::submit(
            engine,
            self.config.pipeline.clone(),
            reference_frame,
            current_frame,
            &cancel,
        );
        let outcome = context
            .wait(|stage| {
                if stage == PipelineStage::Diffing {
                    self.advance(id, SessionStatus::Diffing);
                }
            })
            .await;

        match outcome {
            None => debug!(session = id, "execution context cancelled"),
            Some(Ok(overlay)) => {
                info!(session = id, changed = overlay.changed_pixels, "overlay ready");
                self.finish(id, SessionStatus::Complete, Some(SessionOutput::Overlay(overlay)));
            }
            Some(Err(e)) => self.fail(id, e),
        }
    }

    /// Records a stage transition if `id` is still the running session.
    fn advance(&self, id: u64, status: SessionStatus) -> bool {
        let mut state = self.lock();
        match state.active.as_ref() {
            Some(active) if active.id == id && !active.cancel.is_cancelled() => {
                info!(session = id, %status, "session transition");
                state.status = status;
                true
            }
            _ => false,
        }
    }

    fn fail(&self, id: u64, error: AlignerError) {
        warn!(session = id, %error, "session failed");
        self.finish(id, SessionStatus::Error(error.to_string()), None);
    }

    /// Ends session `id` and delivers its answer, unless it was already ended.
    fn finish(&self, id: u64, status: SessionStatus, output: Option<SessionOutput>) {
        {
            let mut state = self.lock();
            if state.closed || state.active.as_ref().map(|a| a.id) != Some(id) {
                return;
            }
            state.active = None;
            info!(session = id, %status, "session finished");
            state.status = status;
        }
        (self.on_result)(output);
    }
}
