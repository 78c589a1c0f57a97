// THEORY:
// The `CapabilityLoader` guards the one expensive, process-wide resource of the
// engine: the `VisionEngine` (a dedicated compute pool plus the precomputed
// descriptor sampling pattern). Nothing touches pixels before the engine exists.
//
// Key architectural principles:
// 1.  **Load At Most Once**: The first caller triggers the load on a loader thread.
//     Every later caller either gets the ready engine immediately or is parked.
// 2.  **Ordered Continuations**: Parked callers are continuations in a FIFO list.
//     When the load finishes, each one is invoked exactly once, in the order it was
//     enqueued, with the same outcome.
// 3.  **No Retry**: A failed load is remembered and reported to every caller. Only
//     an explicit `reset` (used by tests) returns the loader to its initial state.
// 4.  **Explicit Singleton**: `CapabilityLoader::global()` is the process-wide
//     instance. Anything that needs isolation builds its own with `new`.

use crate::core_modules::features::SamplingPattern;
use crate::error::CapabilityLoadError;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

const DEFAULT_PATTERN_SEED: u64 = 0x0C2A_C4ED;

/// Settings used to build a `VisionEngine`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Worker threads of the compute pool.
    pub threads: usize,
    pub pattern_seed: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            threads: num_cpus::get().max(1),
            pattern_seed: DEFAULT_PATTERN_SEED,
        }
    }
}

/// The computer-vision primitives every pipeline run needs.
pub struct VisionEngine {
    pool: rayon::ThreadPool,
    pattern: SamplingPattern,
}

impl VisionEngine {
    pub fn build(config: &EngineConfig) -> Result<Self, CapabilityLoadError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.threads.max(1))
            .thread_name(|i| format!("vision-worker-{i}"))
            .build()
            .map_err(|e| CapabilityLoadError(e.to_string()))?;
        let pattern = SamplingPattern::generate(config.pattern_seed);
        Ok(Self { pool, pattern })
    }

    /// Runs `op` inside the engine's compute pool.
    pub fn install<R, F>(&self, op: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        self.pool.install(op)
    }

    pub fn pattern(&self) -> &SamplingPattern {
        &self.pattern
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }
}

impl std::fmt::Debug for VisionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VisionEngine")
            .field("threads", &self.threads())
            .field("pattern_pairs", &self.pattern.len())
            .finish()
    }
}

pub type EngineOutcome = Result<Arc<VisionEngine>, CapabilityLoadError>;
type Continuation = Box<dyn FnOnce(EngineOutcome) + Send>;
type LoadFn = dyn Fn() -> Result<VisionEngine, CapabilityLoadError> + Send + Sync;

enum LoadState {
    Unloaded,
    Loading,
    Ready(Arc<VisionEngine>),
    Failed(CapabilityLoadError),
}

struct LoaderState {
    state: LoadState,
    pending: Vec<Continuation>,
    /// Bumped by `reset` so a load started before it cannot complete after it.
    generation: u64,
}

/// Loads the vision engine once and hands it to everyone who asks.
pub struct CapabilityLoader {
    load: Arc<LoadFn>,
    inner: Arc<Mutex<LoaderState>>,
}

static GLOBAL_LOADER: OnceLock<Arc<CapabilityLoader>> = OnceLock::new();

impl CapabilityLoader {
    /// A loader that runs `load` (on a dedicated thread) the first time the
    /// engine is requested.
    pub fn new<F>(load: F) -> Self
    where
        F: Fn() -> Result<VisionEngine, CapabilityLoadError> + Send + Sync + 'static,
    {
        Self {
            load: Arc::new(load),
            inner: Arc::new(Mutex::new(LoaderState {
                state: LoadState::Unloaded,
                pending: Vec::new(),
                generation: 0,
            })),
        }
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self::new(move || VisionEngine::build(&config))
    }

    /// The process-wide loader, built with `EngineConfig::default()`.
    pub fn global() -> Arc<CapabilityLoader> {
        GLOBAL_LOADER
            .get_or_init(|| Arc::new(CapabilityLoader::with_config(EngineConfig::default())))
            .clone()
    }

    pub fn is_ready(&self) -> bool {
        matches!(lock(&self.inner).state, LoadState::Ready(_))
    }

    /// Invokes `continuation` with the engine once it is available.
    ///
    /// If the engine is already loaded (or failed to load) the continuation runs
    /// immediately on the calling thread; otherwise it is queued and runs on the
    /// loader thread, after every continuation queued before it.
    pub fn when_ready<F>(&self, continuation: F)
    where
        F: FnOnce(EngineOutcome) + Send + 'static,
    {
        let mut guard = lock(&self.inner);
        match &guard.state {
            LoadState::Ready(engine) => {
                let engine = engine.clone();
                drop(guard);
                continuation(Ok(engine));
            }
            LoadState::Failed(err) => {
                let err = err.clone();
                drop(guard);
                continuation(Err(err));
            }
            LoadState::Loading => guard.pending.push(Box::new(continuation)),
            LoadState::Unloaded => {
                guard.pending.push(Box::new(continuation));
                guard.state = LoadState::Loading;
                let generation = guard.generation;
                drop(guard);
                self.start_load(generation);
            }
        }
    }

    /// Resolves once the engine is usable.
    pub async fn ensure_ready(&self) -> EngineOutcome {
        let (tx, rx) = oneshot::channel();
        self.when_ready(move |outcome| {
            let _ = tx.send(outcome);
        });
        rx.await
            .map_err(|_| CapabilityLoadError("engine loader went away".to_string()))?
    }

    /// Forgets any loaded engine or failure. Continuations still waiting on an
    /// in-flight load are failed, and that load's result is discarded.
    pub fn reset(&self) {
        let pending = {
            let mut guard = lock(&self.inner);
            guard.generation += 1;
            guard.state = LoadState::Unloaded;
            std::mem::take(&mut guard.pending)
        };
        for continuation in pending {
            continuation(Err(CapabilityLoadError("engine loader was reset".to_string())));
        }
    }

    fn start_load(&self, generation: u64) {
        let load = self.load.clone();
        let inner = self.inner.clone();
        info!("loading vision engine");
        let spawned = std::thread::Builder::new()
            .name("vision-engine-loader".to_string())
            .spawn({
                let inner = inner.clone();
                move || {
                    let outcome = load().map(Arc::new);
                    complete(&inner, generation, outcome);
                }
            });
        if let Err(e) = spawned {
            complete(&inner, generation, Err(CapabilityLoadError(e.to_string())));
        }
    }
}

fn complete(inner: &Mutex<LoaderState>, generation: u64, outcome: EngineOutcome) {
    let pending = {
        let mut guard = lock(inner);
        if guard.generation != generation {
            debug!("discarding engine load from before a reset");
            return;
        }
        guard.state = match &outcome {
            Ok(engine) => {
                info!(threads = engine.threads(), "vision engine ready");
                LoadState::Ready(engine.clone())
            }
            Err(e) => {
                warn!(error = %e, "vision engine failed to load");
                LoadState::Failed(e.clone())
            }
        };
        std::mem::take(&mut guard.pending)
    };
    for continuation in pending {
        continuation(outcome.clone());
    }
}

fn lock(inner: &Mutex<LoaderState>) -> MutexGuard<'_, LoaderState> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
