//! Core library for Garden live-coding blocks.
//!
//! A code block holds pattern source for an embedded music engine. This crate
//! highlights that source, screens it against a denylist, runs it inside a
//! sandbox that only exposes the engine's exported capabilities, and drives
//! bar visualizers from an analyser spliced into the engine's audio output.
//! The engine itself is loaded lazily, once per process, and shared by every
//! block and visualizer.

pub mod audio;
pub mod block;
pub mod config;
pub mod engine;
pub mod error;
pub mod highlight;
pub mod record;
pub mod render;
pub mod runtime;
pub mod sandbox;
pub mod timeline;
pub mod validate;
pub mod visualizer;

pub use audio::{AnalyserNode, AudioContext, AudioGraph, NodeId, NodeKind};
pub use block::{BlockError, BlockEvent, BlockState, PatternBlock};
pub use config::{AppConfig, AudioConfig, SandboxConfig, VisualizerConfig};
pub use engine::{
    Exports, GlobalValue, Pattern, PatternRuntime, RuntimeFactory, Session, ToneEngine,
};
pub use error::{ErrorKind, GardenLiveError, Result};
pub use highlight::highlight;
pub use record::{Recorder, RecordingSettings};
pub use render::{display_heights, BarRenderer, MIN_BAR_HEIGHT};
pub use runtime::{locate_output_node, PendingPlay, RuntimeHandle, RuntimeLoader};
pub use sandbox::Sandbox;
pub use timeline::CycleClock;
pub use validate::{validate, ValidationResult};
pub use visualizer::{BarFrame, FrameLoop, Visualizer};
