//! A small in-process audio graph.
//!
//! Nodes are addressed by [`NodeId`] and blocks of mono samples are pushed
//! from a source node through every downstream connection. Analysers tap the
//! signal and pass it on unchanged, gain nodes scale it and the destination
//! counts (and optionally captures) what reaches it.

mod analyser;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, OnceLock},
};

pub use analyser::AnalyserNode;

use crate::{GardenLiveError, Result};

static SHARED_CONTEXT: OnceLock<Arc<AudioContext>> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

#[derive(Debug, Clone)]
pub enum NodeKind {
    Gain { gain: f32 },
    Analyser(Arc<AnalyserNode>),
    Destination,
}

#[derive(Debug)]
pub struct AudioGraph {
    /// Removed nodes leave a `None` slot so ids stay stable.
    nodes: Vec<Option<NodeKind>>,
    connections: HashMap<NodeId, Vec<NodeId>>,
    capture: Option<Vec<f32>>,
    frames_delivered: u64,
}

impl Default for AudioGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioGraph {
    /// Creates a graph containing only its destination node.
    pub fn new() -> Self {
        Self {
            nodes: vec![Some(NodeKind::Destination)],
            connections: HashMap::new(),
            capture: None,
            frames_delivered: 0,
        }
    }

    pub fn destination(&self) -> NodeId {
        NodeId(0)
    }

    pub fn create_gain(&mut self, gain: f32) -> NodeId {
        self.push_node(NodeKind::Gain { gain })
    }

    pub fn add_analyser(&mut self, analyser: Arc<AnalyserNode>) -> NodeId {
        self.push_node(NodeKind::Analyser(analyser))
    }

    pub fn kind(&self, node: NodeId) -> Option<&NodeKind> {
        self.nodes.get(node.0 as usize).and_then(Option::as_ref)
    }

    /// Number of live nodes, the destination included.
    pub fn node_count(&self) -> usize {
        self.nodes.iter().flatten().count()
    }

    pub fn analyser(&self, node: NodeId) -> Option<Arc<AnalyserNode>> {
        match self.kind(node) {
            Some(NodeKind::Analyser(analyser)) => Some(analyser.clone()),
            _ => None,
        }
    }

    pub fn set_gain(&mut self, node: NodeId, value: f32) -> Result<()> {
        match self.nodes.get_mut(node.0 as usize).and_then(Option::as_mut) {
            Some(NodeKind::Gain { gain }) => {
                *gain = value;
                Ok(())
            }
            _ => Err(GardenLiveError::InvalidInput("node is not a gain node")),
        }
    }

    pub fn connect(&mut self, from: NodeId, to: NodeId) -> Result<()> {
        self.ensure_exists(from)?;
        self.ensure_exists(to)?;
        if from == self.destination() {
            return Err(GardenLiveError::InvalidInput(
                "the destination has no outputs",
            ));
        }
        if from == to || self.reaches(to, from) {
            return Err(GardenLiveError::InvalidInput(
                "connection would create a cycle",
            ));
        }

        let targets = self.connections.entry(from).or_default();
        if !targets.contains(&to) {
            targets.push(to);
        }
        Ok(())
    }

    /// Removes every outgoing connection of `from` and returns the nodes it
    /// used to feed.
    pub fn disconnect(&mut self, from: NodeId) -> Vec<NodeId> {
        self.connections.remove(&from).unwrap_or_default()
    }

    /// Drops `node` along with every connection into or out of it.
    pub fn remove_node(&mut self, node: NodeId) -> Result<()> {
        self.ensure_exists(node)?;
        if node == self.destination() {
            return Err(GardenLiveError::InvalidInput(
                "the destination cannot be removed",
            ));
        }

        self.nodes[node.0 as usize] = None;
        self.connections.remove(&node);
        for targets in self.connections.values_mut() {
            targets.retain(|target| *target != node);
        }
        Ok(())
    }

    pub fn downstream(&self, node: NodeId) -> &[NodeId] {
        self.connections
            .get(&node)
            .map(|targets| targets.as_slice())
            .unwrap_or(&[])
    }

    /// Pushes a block of samples out of `node` and through the graph.
    pub fn process(&mut self, node: NodeId, samples: &[f32]) -> Result<()> {
        let kind = self
            .kind(node)
            .cloned()
            .ok_or(GardenLiveError::InvalidInput("unknown audio node"))?;
        let block = match kind {
            NodeKind::Gain { gain } => samples.iter().map(|s| s * gain).collect(),
            NodeKind::Analyser(analyser) => {
                analyser.push_samples(samples)?;
                samples.to_vec()
            }
            NodeKind::Destination => {
                self.frames_delivered += samples.len() as u64;
                if let Some(capture) = self.capture.as_mut() {
                    capture.extend_from_slice(samples);
                }
                return Ok(());
            }
        };

        let targets = self.downstream(node).to_vec();
        for target in targets {
            self.process(target, &block)?;
        }
        Ok(())
    }

    /// Starts keeping a copy of everything that reaches the destination.
    pub fn enable_capture(&mut self) {
        self.capture.get_or_insert_with(Vec::new);
    }

    pub fn take_capture(&mut self) -> Vec<f32> {
        self.capture.take().unwrap_or_default()
    }

    pub fn frames_delivered(&self) -> u64 {
        self.frames_delivered
    }

    fn push_node(&mut self, kind: NodeKind) -> NodeId {
        self.nodes.push(Some(kind));
        NodeId(self.nodes.len() as u32 - 1)
    }

    fn ensure_exists(&self, node: NodeId) -> Result<()> {
        if self.kind(node).is_some() {
            Ok(())
        } else {
            Err(GardenLiveError::InvalidInput("unknown audio node"))
        }
    }

    fn reaches(&self, from: NodeId, target: NodeId) -> bool {
        let mut stack = vec![from];
        let mut seen = Vec::new();
        while let Some(node) = stack.pop() {
            if node == target {
                return true;
            }
            if seen.contains(&node) {
                continue;
            }
            seen.push(node);
            stack.extend_from_slice(self.downstream(node));
        }
        false
    }
}

/// Owning handle to an audio graph running at a fixed sample rate.
#[derive(Debug)]
pub struct AudioContext {
    sample_rate: u32,
    graph: Mutex<AudioGraph>,
}

impl AudioContext {
    pub fn new(sample_rate: u32) -> Arc<Self> {
        Arc::new(Self {
            sample_rate,
            graph: Mutex::new(AudioGraph::new()),
        })
    }

    /// Returns the process-wide context, creating it on first use. Later
    /// calls ignore `sample_rate`.
    pub fn shared(sample_rate: u32) -> Arc<Self> {
        SHARED_CONTEXT
            .get_or_init(|| AudioContext::new(sample_rate))
            .clone()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn graph(&self) -> Result<MutexGuard<'_, AudioGraph>> {
        self.graph
            .lock()
            .map_err(|_| GardenLiveError::msg("audio graph has been poisoned"))
    }

    /// Creates an analyser and registers it as a node of this context.
    pub fn create_analyser(
        &self,
        fft_size: usize,
        smoothing: f32,
    ) -> Result<(NodeId, Arc<AnalyserNode>)> {
        let analyser = Arc::new(AnalyserNode::new(fft_size, smoothing)?);
        let node = self.graph()?.add_analyser(analyser.clone());
        Ok((node, analyser))
    }
}

/// Rewires `output → targets` into `output → analyser → targets` so the
/// analyser observes everything `output` produces without changing what
/// reaches the original targets.
pub fn splice_analyser(graph: &mut AudioGraph, output: NodeId, analyser: NodeId) -> Result<()> {
    if graph.analyser(analyser).is_none() {
        return Err(GardenLiveError::GraphSplice(
            "splice target is not an analyser".into(),
        ));
    }
    if graph.kind(output).is_none() || output == graph.destination() {
        return Err(GardenLiveError::GraphSplice(
            "runtime output node does not exist".into(),
        ));
    }

    let previous = graph.disconnect(output);
    let rewire = |graph: &mut AudioGraph| -> Result<()> {
        graph.connect(output, analyser)?;
        for target in &previous {
            graph.connect(analyser, *target)?;
        }
        Ok(())
    };

    if let Err(err) = rewire(graph) {
        // Put the original routing back so playback is unaffected.
        graph.disconnect(output);
        graph.disconnect(analyser);
        for target in &previous {
            graph.connect(output, *target)?;
        }
        return Err(GardenLiveError::GraphSplice(err.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gain_scales_into_destination_capture() {
        let mut graph = AudioGraph::new();
        let gain = graph.create_gain(0.5);
        graph.connect(gain, graph.destination()).unwrap();
        graph.enable_capture();

        graph.process(gain, &[1.0, -1.0]).unwrap();

        assert_eq!(graph.take_capture(), vec![0.5, -0.5]);
        assert_eq!(graph.frames_delivered(), 2);
    }

    #[test]
    fn removed_nodes_are_unlinked() {
        let mut graph = AudioGraph::new();
        let gain = graph.create_gain(1.0);
        let analyser = graph.add_analyser(Arc::new(AnalyserNode::new(256, 0.8).unwrap()));
        graph.connect(gain, analyser).unwrap();
        graph.connect(analyser, graph.destination()).unwrap();
        assert_eq!(graph.node_count(), 3);

        graph.remove_node(analyser).unwrap();

        assert_eq!(graph.node_count(), 2);
        assert!(graph.kind(analyser).is_none());
        assert!(graph.downstream(gain).is_empty());
        assert!(graph.connect(gain, analyser).is_err());
        assert!(graph.process(analyser, &[1.0]).is_err());
        assert!(graph.remove_node(graph.destination()).is_err());

        let next = graph.create_gain(1.0);
        assert_ne!(next, analyser);
    }

    #[test]
    fn rejects_cycles() {
        let mut graph = AudioGraph::new();
        let a = graph.create_gain(1.0);
        let b = graph.create_gain(1.0);
        graph.connect(a, b).unwrap();
        assert!(graph.connect(b, a).is_err());
        assert!(graph.connect(a, a).is_err());
    }

    #[test]
    fn splice_keeps_playback_path() {
        let context = AudioContext::new(48_000);
        let (analyser_id, analyser) = context.create_analyser(64, 0.0).unwrap();
        let mut graph = context.graph().unwrap();
        let output = graph.create_gain(1.0);
        let destination = graph.destination();
        graph.connect(output, destination).unwrap();
        graph.enable_capture();

        splice_analyser(&mut graph, output, analyser_id).unwrap();

        assert_eq!(graph.downstream(output), &[analyser_id]);
        assert_eq!(graph.downstream(analyser_id), &[destination]);

        let block: Vec<f32> = (0..64).map(|i| (i as f32 * 0.3).sin()).collect();
        graph.process(output, &block).unwrap();
        assert_eq!(graph.take_capture(), block);

        let mut bytes = vec![0u8; analyser.frequency_bin_count()];
        analyser.byte_frequency_data(&mut bytes).unwrap();
        assert!(bytes.iter().any(|b| *b > 0));
    }

    #[test]
    fn splice_fails_for_missing_output() {
        let context = AudioContext::new(48_000);
        let (analyser_id, _) = context.create_analyser(64, 0.0).unwrap();
        let mut graph = context.graph().unwrap();
        let destination = graph.destination();

        let err = splice_analyser(&mut graph, destination, analyser_id).unwrap_err();
        assert!(matches!(err, GardenLiveError::GraphSplice(_)));
    }
}
