// THEORY:
// The `ExecutionContext` is the isolated unit that performs all pixel work for
// one session. The caller hands it two frames and gets back a single answer; it
// never blocks the caller and never shares mutable state with it.
//
// Key architectural principles:
// 1.  **Move-Only Payloads**: The input frames are moved into the worker. The
//     caller keeps only a cancellation handle and the receiving ends of two
//     channels: a `watch` for coarse stage reports and a `oneshot` for the result.
// 2.  **At Most One Answer**: The worker sends either a success or a failure,
//     exactly once, unless it was cancelled first, in which case it sends nothing.
// 3.  **Single Use**: A context is built per session and torn down after its
//     answer or its cancellation. Dropping the context cancels it.
// 4.  **Faults Stay Inside**: A panic in the worker is caught and becomes an
//     `ExecutionContext` error rather than unwinding into the runtime.

use crate::core_modules::capability::VisionEngine;
use crate::core_modules::difference::OverlayResult;
use crate::core_modules::frame::Frame;
use crate::error::AlignerError;
use crate::pipeline::{PipelineConfig, PipelineStage, VisionPipeline};
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub type ContextOutcome = Result<OverlayResult, AlignerError>;

/// Handle to a running background computation.
pub struct ExecutionContext {
    cancel: CancellationToken,
    stages: watch::Receiver<Option<PipelineStage>>,
    result: oneshot::Receiver<ContextOutcome>,
}

impl ExecutionContext {
    /// Starts aligning `current` onto `reference` and composing the overlay.
    ///
    /// Must be called from within a tokio runtime. The context is cancelled when
    /// `parent` is, or when the context itself is cancelled or dropped.
    pub fn submit(
        engine: Arc<VisionEngine>,
        config: PipelineConfig,
        reference: Frame,
        current: Frame,
        parent: &CancellationToken,
    ) -> Self {
        debug!(
            reference = ?reference.dimensions(),
            current = ?current.dimensions(),
            "submitting frames to execution context"
        );
        Self::spawn(parent, move |cancel, report| {
            let pipeline = VisionPipeline::new(config, engine);
            let overlay = pipeline.run(&reference, &current, cancel, |stage| report(stage))?;
            Ok(overlay)
        })
    }

    /// Runs an arbitrary job under the context's channel and cancellation plumbing.
    pub(crate) fn spawn<F>(parent: &CancellationToken, job: F) -> Self
    where
        F: FnOnce(&CancellationToken, &mut dyn FnMut(PipelineStage)) -> Result<Option<OverlayResult>, AlignerError>
            + Send
            + 'static,
    {
        let cancel = parent.child_token();
        let (stage_tx, stages) = watch::channel(None);
        let (result_tx, result) = oneshot::channel();

        let worker_cancel = cancel.clone();
        tokio::task::spawn_blocking(move || {
            let mut report = |stage: PipelineStage| {
                let _ = stage_tx.send(Some(stage));
            };
            let outcome = catch_unwind(AssertUnwindSafe(|| job(&worker_cancel, &mut report)));
            let answer = match outcome {
                Ok(Ok(Some(overlay))) => Ok(overlay),
                Ok(Ok(None)) => return,
                Ok(Err(e)) => Err(e),
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    warn!(%message, "execution context panicked");
                    Err(AlignerError::ExecutionContext(message))
                }
            };
            if !worker_cancel.is_cancelled() {
                let _ = result_tx.send(answer);
            }
        });

        Self { cancel, stages, result }
    }

    /// Stops the computation. Safe to call at any time, any number of times.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    #[cfg(test)]
    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Waits for the single answer, forwarding stage reports as they arrive.
    ///
    /// Returns `None` if the context was cancelled before answering. A stage
    /// report still pending when the answer lands is forwarded before returning.
    pub async fn wait(mut self, mut on_stage: impl FnMut(PipelineStage)) -> Option<ContextOutcome> {
        let mut stages_open = true;
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                received = &mut self.result => {
                    return match received {
                        Ok(answer) => {
                            if self.stages.has_changed().unwrap_or(false) {
                                if let Some(stage) = *self.stages.borrow_and_update() {
                                    on_stage(stage);
                                }
                            }
                            Some(answer)
                        }
                        Err(_) if self.cancel.is_cancelled() => None,
                        Err(_) => Some(Err(AlignerError::ExecutionContext(
                            "worker exited without an answer".to_string(),
                        ))),
                    };
                }
                changed = self.stages.changed(), if stages_open => match changed {
                    Ok(()) => {
                        if let Some(stage) = *self.stages.borrow_and_update() {
                            on_stage(stage);
                        }
                    }
                    Err(_) => stages_open = false,
                },
            }
        }
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}
