//! Boundary to the pattern engine that user code drives.
//!
//! A [`PatternRuntime`] is what the runtime loader imports and initialises.
//! Beyond lifecycle hooks it publishes an [`Exports`] table: the named
//! functions and values user code may call. Nothing outside that table is
//! reachable from a pattern.

mod pattern;
mod tone;

use std::{fmt, sync::Arc};

use futures::future::BoxFuture;
use rhai::{Dynamic, Engine};

pub use pattern::{midi_to_hz, parse_note, Layer, Pattern, SoundEvent, StepValue};
pub use tone::{ToneEngine, DEFAULT_SOUND, KNOWN_SOUNDS};

use crate::{audio::AudioContext, audio::NodeId, Result};

/// Async constructor standing in for a dynamic module import.
pub type RuntimeFactory =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Arc<dyn PatternRuntime>>> + Send + Sync>;

/// Value exposed through a runtime's undocumented global state.
#[derive(Debug, Clone, PartialEq)]
pub enum GlobalValue {
    Node(NodeId),
    Number(f64),
}

pub trait PatternRuntime: Send + Sync {
    /// One-time engine initialisation, run by the loader after import.
    fn init(&self) -> BoxFuture<'_, Result<()>>;

    /// The audio context the engine renders into, if it owns one.
    fn audio_context(&self) -> Option<Arc<AudioContext>> {
        None
    }

    /// Explicit extension point for the engine's master output node.
    fn output_node(&self) -> Option<NodeId> {
        None
    }

    /// Looks up engine-internal state by name.
    fn global(&self, _name: &str) -> Option<GlobalValue> {
        None
    }

    /// Silences everything the engine is playing.
    fn hush(&self) -> Result<()>;

    /// The capability table handed to user code.
    fn exports(&self) -> Exports;

    /// Opens a session for one evaluation of user code. Runtimes that can
    /// hold back scheduling until [`Session::commit`] override this; the
    /// default applies every call immediately.
    fn session(&self) -> Box<dyn Session> {
        Box::new(ImmediateSession(self.exports()))
    }

    /// Renders `frames` samples of the active patterns into the audio graph.
    fn render(&self, frames: usize) -> Result<()>;
}

/// Exports bound to a single evaluation.
///
/// Dropping a session without committing discards whatever the evaluation
/// scheduled.
pub trait Session: Send {
    fn exports(&self) -> Exports;

    /// Applies what the evaluation scheduled.
    fn commit(self: Box<Self>) -> Result<()>;
}

struct ImmediateSession(Exports);

impl Session for ImmediateSession {
    fn exports(&self) -> Exports {
        self.0.clone()
    }

    fn commit(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

type Installer = Arc<dyn Fn(&mut Engine) + Send + Sync>;

/// Named capabilities a runtime exposes to pattern code.
#[derive(Clone, Default)]
pub struct Exports {
    setup: Vec<Installer>,
    functions: Vec<(String, Installer)>,
    values: Vec<(String, Dynamic)>,
}

impl Exports {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers custom types or helpers every export relies on. Setup hooks
    /// run before any function is installed and add no names of their own.
    pub fn setup(mut self, install: impl Fn(&mut Engine) + Send + Sync + 'static) -> Self {
        self.setup.push(Arc::new(install));
        self
    }

    /// Adds a function export. `install` registers every overload of `name`.
    pub fn function(
        mut self,
        name: impl Into<String>,
        install: impl Fn(&mut Engine) + Send + Sync + 'static,
    ) -> Self {
        self.functions.push((name.into(), Arc::new(install)));
        self
    }

    /// Adds a constant visible to pattern code by name.
    pub fn value(mut self, name: impl Into<String>, value: Dynamic) -> Self {
        self.values.push((name.into(), value));
        self
    }

    /// Every exported symbol, functions first.
    pub fn names(&self) -> Vec<&str> {
        self.functions
            .iter()
            .map(|(name, _)| name.as_str())
            .chain(self.values.iter().map(|(name, _)| name.as_str()))
            .collect()
    }

    pub fn values(&self) -> &[(String, Dynamic)] {
        &self.values
    }

    pub fn install(&self, engine: &mut Engine) {
        for install in &self.setup {
            install(engine);
        }
        for (_, install) in &self.functions {
            install(engine);
        }
    }
}

impl fmt::Debug for Exports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exports")
            .field("names", &self.names())
            .finish()
    }
}

/// Reads a script number, accepting both integers and floats.
pub(crate) fn dynamic_number(value: &Dynamic) -> Option<f64> {
    value
        .as_float()
        .ok()
        .or_else(|| value.as_int().ok().map(|int| int as f64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_list_functions_then_values() {
        let exports = Exports::new()
            .function("note", |_| {})
            .value("silence", Dynamic::UNIT)
            .function("s", |_| {});

        assert_eq!(exports.names(), vec!["note", "s", "silence"]);
    }

    #[test]
    fn reads_ints_and_floats() {
        assert_eq!(dynamic_number(&Dynamic::from(2_i64)), Some(2.0));
        assert_eq!(dynamic_number(&Dynamic::from(0.5_f64)), Some(0.5));
        assert_eq!(dynamic_number(&Dynamic::from("x")), None);
    }
}
