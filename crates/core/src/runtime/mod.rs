//! Process-wide, exactly-once loading of the pattern runtime.
//!
//! The loader moves through `Uninitialized → Initializing → Ready`, or to
//! `Failed` when the import or engine init errors. While `Initializing`, every
//! caller awaits the same shared future, so the factory and `init()` run once
//! no matter how many blocks press play at the same moment. A failed load is
//! not sticky: the next caller starts a fresh attempt.

use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use tracing::{info, warn};

use crate::{
    audio::{splice_analyser, AnalyserNode, AudioContext, NodeId},
    config::{AppConfig, AudioConfig, SandboxConfig},
    engine::{GlobalValue, PatternRuntime, RuntimeFactory, Session, ToneEngine},
    sandbox::Sandbox,
    GardenLiveError, Result,
};

/// Global names engines are known to keep their master output under.
const OUTPUT_GLOBALS: &[&str] = &["masterGain", "destinationGain", "outputNode"];

static GLOBAL_LOADER: OnceLock<Arc<RuntimeLoader>> = OnceLock::new();

type LoadOutcome = std::result::Result<Arc<RuntimeHandle>, String>;
type PendingLoad = Shared<BoxFuture<'static, LoadOutcome>>;

enum LoaderState {
    Uninitialized,
    Initializing(PendingLoad),
    Ready(Arc<RuntimeHandle>),
    Failed(String),
}

/// A loaded runtime together with the shared audio handles. Lives for the
/// rest of the process once created.
pub struct RuntimeHandle {
    runtime: Arc<dyn PatternRuntime>,
    context: Arc<AudioContext>,
    analyser: Option<Arc<AnalyserNode>>,
    symbols: Vec<String>,
    limits: SandboxConfig,
}

/// What one successful execution scheduled, not yet audible.
///
/// Committing starts the scheduled patterns. Dropping it discards them.
pub struct PendingPlay {
    session: Box<dyn Session>,
}

impl PendingPlay {
    pub fn commit(self) -> Result<()> {
        self.session.commit()
    }
}

impl std::fmt::Debug for PendingPlay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingPlay").finish_non_exhaustive()
    }
}

impl RuntimeHandle {
    pub fn runtime(&self) -> &Arc<dyn PatternRuntime> {
        &self.runtime
    }

    pub fn audio_context(&self) -> &Arc<AudioContext> {
        &self.context
    }

    /// The tap visualizers attach to; `None` means they run in demo mode.
    pub fn analyser(&self) -> Option<&Arc<AnalyserNode>> {
        self.analyser.as_ref()
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    /// Runs pattern source in a fresh sandbox bound to a new runtime session.
    /// Nothing the source plays is heard until the returned play is
    /// committed.
    pub async fn execute(&self, source: &str) -> Result<PendingPlay> {
        let session = self.runtime.session();
        Sandbox::new(&session.exports(), &self.limits)
            .execute(source.to_string())
            .await?;
        Ok(PendingPlay { session })
    }

    pub fn hush(&self) -> Result<()> {
        self.runtime.hush()
    }
}

impl std::fmt::Debug for RuntimeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeHandle")
            .field("sample_rate", &self.context.sample_rate())
            .field("analyser", &self.analyser)
            .field("symbols", &self.symbols)
            .finish()
    }
}

pub struct RuntimeLoader {
    factory: RuntimeFactory,
    config: Arc<AppConfig>,
    state: Mutex<LoaderState>,
}

impl RuntimeLoader {
    pub fn new(factory: RuntimeFactory, config: AppConfig) -> Self {
        Self {
            factory,
            config: Arc::new(config),
            state: Mutex::new(LoaderState::Uninitialized),
        }
    }

    /// Loader over the built-in [`ToneEngine`], rendering into the shared
    /// audio context.
    pub fn with_tone_engine(config: AppConfig) -> Self {
        let sample_rate = config.audio.sample_rate;
        let factory: RuntimeFactory = Arc::new(move || {
            async move {
                let engine = ToneEngine::new(AudioContext::shared(sample_rate))?;
                Ok::<_, GardenLiveError>(Arc::new(engine) as Arc<dyn PatternRuntime>)
            }
            .boxed()
        });
        Self::new(factory, config)
    }

    /// The process-wide loader. The first call's configuration wins.
    pub fn init_global(config: &AppConfig) -> Arc<RuntimeLoader> {
        GLOBAL_LOADER
            .get_or_init(|| Arc::new(RuntimeLoader::with_tone_engine(config.clone())))
            .clone()
    }

    pub fn global() -> Arc<RuntimeLoader> {
        Self::init_global(&AppConfig::default())
    }

    pub fn is_initialized(&self) -> bool {
        self.ready().is_some()
    }

    /// The loaded handle, without triggering a load.
    pub fn ready(&self) -> Option<Arc<RuntimeHandle>> {
        match &*self.lock().ok()? {
            LoaderState::Ready(handle) => Some(handle.clone()),
            _ => None,
        }
    }

    /// Message of the most recent failed attempt, if the loader is failed.
    pub fn last_failure(&self) -> Option<String> {
        match &*self.lock().ok()? {
            LoaderState::Failed(message) => Some(message.clone()),
            _ => None,
        }
    }

    /// Loads and initialises the runtime once, returning the shared handle.
    pub async fn ensure_initialized(&self) -> Result<Arc<RuntimeHandle>> {
        let pending = {
            let mut state = self.lock()?;
            match &*state {
                LoaderState::Ready(handle) => return Ok(handle.clone()),
                LoaderState::Initializing(pending) => pending.clone(),
                LoaderState::Uninitialized | LoaderState::Failed(_) => {
                    let pending = self.start_load();
                    *state = LoaderState::Initializing(pending.clone());
                    pending
                }
            }
        };

        let outcome = pending.clone().await;

        {
            let mut state = self.lock()?;
            let settles_this_attempt = matches!(
                &*state,
                LoaderState::Initializing(current) if current.ptr_eq(&pending)
            );
            if settles_this_attempt {
                *state = match &outcome {
                    Ok(handle) => LoaderState::Ready(handle.clone()),
                    Err(message) => LoaderState::Failed(message.clone()),
                };
            }
        }

        outcome.map_err(GardenLiveError::Load)
    }

    fn start_load(&self) -> PendingLoad {
        let factory = self.factory.clone();
        let config = self.config.clone();

        async move {
            let runtime = factory().await.map_err(|err| {
                warn!(error = %err, "pattern runtime import failed");
                err.to_string()
            })?;
            runtime.init().await.map_err(|err| {
                warn!(error = %err, "pattern runtime init failed");
                err.to_string()
            })?;

            let context = runtime
                .audio_context()
                .unwrap_or_else(|| AudioContext::shared(config.audio.sample_rate));

            let analyser = match tap_output(runtime.as_ref(), &context, &config.audio) {
                Ok(analyser) => Some(analyser),
                Err(err) => {
                    warn!(error = %err, "visualizers will run in demo mode");
                    None
                }
            };

            let symbols: Vec<String> = runtime
                .exports()
                .names()
                .into_iter()
                .map(String::from)
                .collect();
            info!(
                symbols = symbols.len(),
                tapped = analyser.is_some(),
                "pattern runtime ready"
            );

            Ok::<_, String>(Arc::new(RuntimeHandle {
                runtime,
                context,
                analyser,
                symbols,
                limits: config.sandbox.clone(),
            }))
        }
        .boxed()
        .shared()
    }

    fn lock(&self) -> Result<MutexGuard<'_, LoaderState>> {
        self.state
            .lock()
            .map_err(|_| GardenLiveError::msg("runtime loader state has been poisoned"))
    }
}

impl std::fmt::Debug for RuntimeLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeLoader")
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

/// Finds the runtime's master output: the explicit extension point first,
/// then the global names engines are known to use.
pub fn locate_output_node(runtime: &dyn PatternRuntime) -> Option<NodeId> {
    runtime.output_node().or_else(|| {
        OUTPUT_GLOBALS
            .iter()
            .find_map(|name| match runtime.global(name) {
                Some(GlobalValue::Node(node)) => Some(node),
                _ => None,
            })
    })
}

fn tap_output(
    runtime: &dyn PatternRuntime,
    context: &AudioContext,
    audio: &AudioConfig,
) -> Result<Arc<AnalyserNode>> {
    let output = locate_output_node(runtime)
        .ok_or_else(|| GardenLiveError::GraphSplice("runtime output node not found".into()))?;
    let (node, analyser) = context
        .create_analyser(audio.fft_size, audio.smoothing)
        .map_err(|err| GardenLiveError::GraphSplice(err.to_string()))?;
    let mut graph = context.graph()?;
    if let Err(err) = splice_analyser(&mut graph, output, node) {
        graph.remove_node(node)?;
        return Err(err);
    }
    Ok(analyser)
}
