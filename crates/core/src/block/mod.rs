//! Play/stop state machine for a single code block.
//!
//! ```text
//! Idle --play--> Loading --executed--> Playing --stop--> Idle
//!   ^               |
//!   +---rejected / load failed / pattern threw
//! ```
//!
//! Every play attempt is stamped with a generation number. `stop()` bumps
//! the generation, so an execution that completes after the block was
//! stopped (or replayed) can no longer change its state or error. Patterns
//! such an execution played are discarded rather than started.
//!
//! Block source is rhai: pattern strings take double quotes, as in
//! `note("c3 e3").play();`. Single quotes delimit characters, so
//! `note('c3')` passes validation and then fails as a runtime error.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::{
    highlight::highlight,
    runtime::{PendingPlay, RuntimeLoader},
    validate::{validate, ValidationResult},
    ErrorKind, GardenLiveError, Result,
};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockState {
    Idle,
    /// Waiting for the runtime to load or the pattern to finish evaluating.
    Loading,
    Playing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Notifications for whatever UI hosts the block.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum BlockEvent {
    PlayStarted { code: String },
    PlayStopped { code: String },
    CodeChanged { code: String },
    Error {
        code: String,
        message: String,
        kind: ErrorKind,
    },
}

#[derive(Debug)]
struct BlockInner {
    source: String,
    state: BlockState,
    last_error: Option<BlockError>,
    generation: u64,
}

pub struct PatternBlock {
    loader: Arc<RuntimeLoader>,
    inner: Mutex<BlockInner>,
    events: broadcast::Sender<BlockEvent>,
}

impl PatternBlock {
    pub fn new(loader: Arc<RuntimeLoader>, source: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            loader,
            inner: Mutex::new(BlockInner {
                source: source.into(),
                state: BlockState::Idle,
                last_error: None,
                generation: 0,
            }),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BlockEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> Result<BlockState> {
        Ok(self.lock()?.state)
    }

    pub fn source(&self) -> Result<String> {
        Ok(self.lock()?.source.clone())
    }

    pub fn last_error(&self) -> Result<Option<BlockError>> {
        Ok(self.lock()?.last_error.clone())
    }

    /// Highlighted markup for the current source.
    pub fn highlighted(&self) -> Result<String> {
        Ok(highlight(&self.lock()?.source))
    }

    pub fn set_code(&self, source: impl Into<String>) -> Result<()> {
        let code = source.into();
        self.lock()?.source = code.clone();
        self.emit(BlockEvent::CodeChanged { code });
        Ok(())
    }

    /// Validates, loads the runtime if needed and runs the current source.
    ///
    /// Failures are recorded on the block and broadcast as
    /// [`BlockEvent::Error`] as well as returned. Calling `play` while the
    /// block is loading or playing does nothing.
    pub async fn play(&self) -> Result<()> {
        let (source, stamp) = {
            let mut inner = self.lock()?;
            if inner.state != BlockState::Idle {
                debug!(state = ?inner.state, "play ignored");
                return Ok(());
            }

            if let ValidationResult::Rejected { reason } = validate(&inner.source) {
                let err = GardenLiveError::Validation(reason.to_string());
                let event = record_error(&mut inner, &err);
                drop(inner);
                self.emit(event);
                return Err(err);
            }

            inner.generation += 1;
            inner.state = BlockState::Loading;
            inner.last_error = None;
            (inner.source.clone(), inner.generation)
        };

        let handle = match self.loader.ensure_initialized().await {
            Ok(handle) => handle,
            Err(err) => return self.settle_error(stamp, err),
        };

        if !self.is_current(stamp)? {
            debug!(stamp, "block stopped while the runtime loaded");
            return Ok(());
        }

        match handle.execute(&source).await {
            Ok(pending) => self.settle_started(stamp, pending),
            Err(err) => self.settle_error(stamp, err),
        }
    }

    /// Silences the runtime and returns the block to idle. Always notifies,
    /// even when the runtime never loaded.
    pub fn stop(&self) -> Result<()> {
        let code = {
            let mut inner = self.lock()?;
            inner.generation += 1;
            inner.state = BlockState::Idle;
            // Hushed under the block lock: a commit either landed before
            // this and is silenced, or sees the new generation and is dropped.
            if let Some(handle) = self.loader.ready() {
                if let Err(err) = handle.hush() {
                    warn!(error = %err, "failed to silence runtime");
                }
            }
            inner.source.clone()
        };
        self.emit(BlockEvent::PlayStopped { code });
        Ok(())
    }

    fn settle_started(&self, stamp: u64, pending: PendingPlay) -> Result<()> {
        let code = {
            let mut inner = self.lock()?;
            if inner.generation != stamp {
                debug!(stamp, current = inner.generation, "stale completion discarded");
                return Ok(());
            }
            if let Err(err) = pending.commit() {
                inner.state = BlockState::Idle;
                let event = record_error(&mut inner, &err);
                drop(inner);
                self.emit(event);
                return Err(err);
            }
            inner.state = BlockState::Playing;
            inner.source.clone()
        };
        self.emit(BlockEvent::PlayStarted { code });
        Ok(())
    }

    fn settle_error(&self, stamp: u64, err: GardenLiveError) -> Result<()> {
        let event = {
            let mut inner = self.lock()?;
            if inner.generation != stamp {
                debug!(stamp, error = %err, "stale failure ignored");
                return Ok(());
            }
            inner.state = BlockState::Idle;
            record_error(&mut inner, &err)
        };
        self.emit(event);
        Err(err)
    }

    fn is_current(&self, stamp: u64) -> Result<bool> {
        Ok(self.lock()?.generation == stamp)
    }

    fn emit(&self, event: BlockEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn lock(&self) -> Result<MutexGuard<'_, BlockInner>> {
        self.inner
            .lock()
            .map_err(|_| GardenLiveError::msg("block state has been poisoned"))
    }
}

impl std::fmt::Debug for PatternBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatternBlock")
            .field("inner", &self.inner)
            .finish()
    }
}

fn record_error(inner: &mut BlockInner, err: &GardenLiveError) -> BlockEvent {
    let kind = err.classification().unwrap_or(ErrorKind::Runtime);
    let message = match err {
        GardenLiveError::Validation(message) | GardenLiveError::Runtime(message) => message.clone(),
        other => other.to_string(),
    };
    inner.last_error = Some(BlockError {
        kind,
        message: message.clone(),
    });
    BlockEvent::Error {
        code: inner.source.clone(),
        message,
        kind,
    }
}
