//! The Processor Contract and the Router Scheduler
//!
//! This module provides the runtime graph that the whole engine is built
//! from: processors with typed ports, cables between them, topological
//! sorting, and block-oriented signal propagation. Routers compose: a
//! router exports ports and can sit as a processor inside another router.

use crate::port::{Block, PortDef, PortSpec, ValueRef};
use crate::{StdMap, MAX_BLOCK_SIZE};
use slotmap::{new_key_type, SecondaryMap, SlotMap};
use std::any::Any;
use std::collections::VecDeque;

new_key_type! {
    /// Unique identifier for a node in a router
    pub struct NodeId;
}

/// Maximum number of input ports on a single processor
pub const MAX_PORTS: usize = 12;

/// Reference to a specific port on a specific node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortRef {
    pub node: NodeId,
    pub port: usize,
}

/// Error types for graph construction
#[derive(Debug, Clone)]
pub enum GraphError {
    InvalidNode,
    InvalidPort,
    /// A cycle not broken by a declared feedback edge
    CycleDetected {
        nodes: Vec<NodeId>,
    },
    /// A voice handler was used before its voices were built
    NotFinalized,
    /// Construction parameters out of range
    InvalidConfig(&'static str),
}

impl std::fmt::Display for GraphError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GraphError::InvalidNode => write!(f, "Invalid node"),
            GraphError::InvalidPort => write!(f, "Invalid port"),
            GraphError::CycleDetected { nodes } => {
                write!(f, "Cycle detected involving {} nodes", nodes.len())
            }
            GraphError::NotFinalized => write!(f, "Voice handler not finalized"),
            GraphError::InvalidConfig(message) => write!(f, "Invalid configuration: {}", message),
        }
    }
}

impl std::error::Error for GraphError {}

/// Per-block processing context handed to `Processor::process`
///
/// `inputs` holds one slice per declared input, each `frames` samples long;
/// unbound inputs read zeros. Every declared output block must hold valid
/// samples for the current block when `process` returns.
pub struct ProcessContext<'a, 'b> {
    pub inputs: &'a [&'b [f64]],
    pub outputs: &'a mut [Block],
    pub frames: usize,
}

impl ProcessContext<'_, '_> {
    /// Read one input sample, first-sample authoritative (control rate)
    #[inline]
    pub fn control(&self, index: usize) -> f64 {
        self.inputs[index][0]
    }
}

/// Type-erased processor interface
///
/// The fixed contract of every node in the graph: declared ports, a
/// block-rate process step, lifecycle hooks, and state duplication for
/// per-voice cloning.
pub trait Processor: Send {
    /// Returns the processor's port specification
    fn port_spec(&self) -> &PortSpec;

    /// Read `ctx.frames` samples from every input, write every output
    fn process(&mut self, ctx: &mut ProcessContext<'_, '_>);

    /// Return internal state to the just-constructed condition
    fn reset(&mut self);

    /// Rebuild rate-dependent state
    fn set_sample_rate(&mut self, sample_rate: f64);

    /// Duplicate this processor's state (used for per-voice cloning)
    fn box_clone(&self) -> Box<dyn Processor>;

    /// Stable type identifier for diagnostics
    fn type_name(&self) -> &'static str;

    /// Downcasting hook for callers that keep handles to graph-owned nodes
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl Clone for Box<dyn Processor> {
    fn clone(&self) -> Self {
        self.box_clone()
    }
}

/// How one input gets its samples
#[derive(Clone)]
enum Binding {
    /// Reads the shared zero block
    Unbound,
    /// Reads an upstream output; feedback edges read the previous block
    Cable { source: PortRef, feedback: bool },
    /// Reads a shared control scalar, filled into a scratch block
    Value(ValueRef),
    /// Reads one of the router's exported inputs
    Export(usize),
}

/// Handle to a node for ergonomic port references
#[derive(Clone)]
pub struct NodeHandle {
    id: NodeId,
    spec: PortSpec,
}

impl NodeHandle {
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Reference an output port by name
    pub fn out(&self, name: &str) -> PortRef {
        let port = self
            .spec
            .output_index(name)
            .unwrap_or_else(|| panic!("Unknown output port: {}", name));
        PortRef {
            node: self.id,
            port,
        }
    }

    /// Reference an input port by name
    pub fn in_(&self, name: &str) -> PortRef {
        let port = self
            .spec
            .input_index(name)
            .unwrap_or_else(|| panic!("Unknown input port: {}", name));
        PortRef {
            node: self.id,
            port,
        }
    }

    /// Get the port specification
    pub fn spec(&self) -> &PortSpec {
        &self.spec
    }
}

/// Per-voice duplicate of the mutable state of a subset of nodes
///
/// A voice handler clones the per-voice partition of its graph into one
/// `StateBank` per voice: same topology and bindings, independent processor
/// state and output blocks. Shared control scalars stay shared.
#[derive(Clone, Default)]
pub struct StateBank {
    pub(crate) processors: SecondaryMap<NodeId, Box<dyn Processor>>,
    pub(crate) blocks: SecondaryMap<NodeId, Vec<Block>>,
}

impl StateBank {
    pub fn contains(&self, node: NodeId) -> bool {
        self.processors.contains_key(node)
    }

    /// Read an output block owned by this bank
    pub fn read(&self, port: PortRef) -> Option<&[f64]> {
        self.blocks
            .get(port.node)
            .and_then(|blocks| blocks.get(port.port))
            .map(|block| block.as_slice())
    }

    pub(crate) fn block_mut(&mut self, port: PortRef) -> Option<&mut Block> {
        self.blocks
            .get_mut(port.node)
            .and_then(|blocks| blocks.get_mut(port.port))
    }

    pub fn reset(&mut self) {
        for (_, processor) in self.processors.iter_mut() {
            processor.reset();
        }
        for (_, blocks) in self.blocks.iter_mut() {
            for block in blocks.iter_mut() {
                block.clear();
            }
        }
    }

    pub fn set_sample_rate(&mut self, sample_rate: f64) {
        for (_, processor) in self.processors.iter_mut() {
            processor.set_sample_rate(sample_rate);
        }
    }
}

/// A processor that owns and schedules a subgraph of processors
///
/// Construction-time mutation (`add`, `connect`) marks the evaluation order
/// dirty; `compile` runs Kahn's algorithm over the non-feedback cables and
/// caches the order. After construction the graph is frozen by convention:
/// nothing removes nodes or cables at runtime.
#[derive(Clone)]
pub struct Router {
    names: SlotMap<NodeId, String>,
    processors: SecondaryMap<NodeId, Box<dyn Processor>>,
    specs: SecondaryMap<NodeId, PortSpec>,
    bindings: SecondaryMap<NodeId, Vec<Binding>>,
    blocks: SecondaryMap<NodeId, Vec<Block>>,

    // Execution state
    order: Vec<NodeId>,
    dirty: bool,
    sample_rate: f64,
    zero: Block,
    scratch: Vec<Block>,

    // Exported ports (router-in-router composition)
    export_in: Vec<Block>,
    export_outputs: Vec<PortRef>,
    export_spec: PortSpec,
}

impl Router {
    /// Create a new empty router
    pub fn new(sample_rate: f64) -> Self {
        Self {
            names: SlotMap::with_key(),
            processors: SecondaryMap::new(),
            specs: SecondaryMap::new(),
            bindings: SecondaryMap::new(),
            blocks: SecondaryMap::new(),
            order: Vec::new(),
            dirty: false,
            sample_rate,
            zero: Block::new(),
            scratch: (0..MAX_PORTS).map(|_| Block::new()).collect(),
            export_in: Vec::new(),
            export_outputs: Vec::new(),
            export_spec: PortSpec::new(),
        }
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Add a processor to the router
    pub fn add<P: Processor + 'static>(&mut self, name: impl Into<String>, processor: P) -> NodeHandle {
        self.add_boxed(name, Box::new(processor))
    }

    /// Add a boxed processor to the router
    pub fn add_boxed(&mut self, name: impl Into<String>, mut processor: Box<dyn Processor>) -> NodeHandle {
        processor.set_sample_rate(self.sample_rate);
        let spec = processor.port_spec().clone();
        assert!(
            spec.inputs.len() <= MAX_PORTS,
            "processor exceeds MAX_PORTS inputs"
        );
        let id = self.names.insert(name.into());
        self.bindings
            .insert(id, vec![Binding::Unbound; spec.inputs.len()]);
        self.blocks
            .insert(id, (0..spec.outputs.len()).map(|_| Block::new()).collect());
        self.specs.insert(id, spec.clone());
        self.processors.insert(id, processor);
        self.invalidate();
        NodeHandle { id, spec }
    }

    /// Plug an output into an input
    ///
    /// An input holds at most one binding; connecting again replaces it.
    pub fn connect(&mut self, from: PortRef, to: PortRef) -> Result<(), GraphError> {
        self.plug(from, to, false)
    }

    /// Plug an output into an input as a feedback edge
    ///
    /// Feedback edges are excluded from the topological order; the consumer
    /// reads the producer's previous block.
    pub fn connect_feedback(&mut self, from: PortRef, to: PortRef) -> Result<(), GraphError> {
        self.plug(from, to, true)
    }

    fn plug(&mut self, from: PortRef, to: PortRef, feedback: bool) -> Result<(), GraphError> {
        self.validate_output_port(from)?;
        self.validate_input_port(to)?;
        self.bindings[to.node][to.port] = Binding::Cable {
            source: from,
            feedback,
        };
        self.invalidate();
        Ok(())
    }

    /// Bind an input to a shared control scalar
    pub fn bind_value(&mut self, to: PortRef, value: &ValueRef) -> Result<(), GraphError> {
        self.validate_input_port(to)?;
        self.bindings[to.node][to.port] = Binding::Value(value.clone());
        self.invalidate();
        Ok(())
    }

    /// Expose a child input as an input of this router
    pub fn export_input(&mut self, name: &'static str, to: PortRef) -> Result<(), GraphError> {
        self.validate_input_port(to)?;
        let rate = self.specs[to.node].inputs[to.port].rate;
        let index = self.export_in.len();
        self.export_in.push(Block::new());
        self.bindings[to.node][to.port] = Binding::Export(index);
        self.export_spec.inputs.push(PortDef::new(name, rate));
        self.invalidate();
        Ok(())
    }

    /// Expose a child output as an output of this router
    pub fn export_output(&mut self, name: &'static str, from: PortRef) -> Result<(), GraphError> {
        self.validate_output_port(from)?;
        let rate = self.specs[from.node].outputs[from.port].rate;
        self.export_outputs.push(from);
        self.export_spec.outputs.push(PortDef::new(name, rate));
        Ok(())
    }

    /// Get node name
    pub fn name(&self, node: NodeId) -> Option<&str> {
        self.names.get(node).map(|n| n.as_str())
    }

    /// Get number of nodes
    pub fn node_count(&self) -> usize {
        self.names.len()
    }

    /// Get execution order (after compile)
    pub fn execution_order(&self) -> &[NodeId] {
        &self.order
    }

    /// Mutable access to a node's processor
    pub fn processor_mut(&mut self, node: NodeId) -> Option<&mut (dyn Processor + '_)> {
        self.processors
            .get_mut(node)
            .map(|p| -> &mut (dyn Processor + '_) { p.as_mut() })
    }

    /// Read an output block
    pub fn read(&self, port: PortRef) -> &[f64] {
        self.blocks
            .get(port.node)
            .and_then(|blocks| blocks.get(port.port))
            .map(|block| block.as_slice())
            .unwrap_or_else(|| self.zero.as_slice())
    }

    /// Clone the mutable state of a subset of nodes into a fresh bank
    pub fn clone_state(&self, members: &[NodeId]) -> StateBank {
        let mut bank = StateBank::default();
        for &id in members {
            if let (Some(processor), Some(blocks)) = (self.processors.get(id), self.blocks.get(id))
            {
                bank.processors.insert(id, processor.box_clone());
                bank.blocks.insert(id, blocks.clone());
            }
        }
        bank
    }

    fn invalidate(&mut self) {
        self.order.clear();
        self.dirty = true;
    }

    fn validate_output_port(&self, port_ref: PortRef) -> Result<(), GraphError> {
        let spec = self.specs.get(port_ref.node).ok_or(GraphError::InvalidNode)?;
        if port_ref.port >= spec.outputs.len() {
            return Err(GraphError::InvalidPort);
        }
        Ok(())
    }

    fn validate_input_port(&self, port_ref: PortRef) -> Result<(), GraphError> {
        let spec = self.specs.get(port_ref.node).ok_or(GraphError::InvalidNode)?;
        if port_ref.port >= spec.inputs.len() {
            return Err(GraphError::InvalidPort);
        }
        Ok(())
    }

    /// Compile the graph into an executable order
    pub fn compile(&mut self) -> Result<(), GraphError> {
        let order = self.topological_sort()?;
        self.order = order;
        self.dirty = false;
        Ok(())
    }

    fn topological_sort(&self) -> Result<Vec<NodeId>, GraphError> {
        let mut in_degree: StdMap<NodeId, usize> = self.names.keys().map(|k| (k, 0)).collect();
        let mut successors: StdMap<NodeId, Vec<NodeId>> =
            self.names.keys().map(|k| (k, vec![])).collect();

        for (node, bindings) in self.bindings.iter() {
            for binding in bindings {
                if let Binding::Cable {
                    source,
                    feedback: false,
                } = binding
                {
                    if let Some(deg) = in_degree.get_mut(&node) {
                        *deg += 1;
                    }
                    if let Some(succ) = successors.get_mut(&source.node) {
                        succ.push(node);
                    }
                }
            }
        }

        // Kahn's algorithm; BTreeMap iteration keeps same-depth ordering
        // deterministic across runs.
        let mut queue: VecDeque<NodeId> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(&id, _)| id)
            .collect();

        let mut result = Vec::with_capacity(self.names.len());

        while let Some(node) = queue.pop_front() {
            result.push(node);
            if let Some(succ) = successors.get(&node) {
                for &next in succ {
                    if let Some(deg) = in_degree.get_mut(&next) {
                        *deg -= 1;
                        if *deg == 0 {
                            queue.push_back(next);
                        }
                    }
                }
            }
        }

        if result.len() != self.names.len() {
            let in_cycle: Vec<NodeId> = in_degree
                .into_iter()
                .filter(|(_, deg)| *deg > 0)
                .map(|(id, _)| id)
                .collect();
            return Err(GraphError::CycleDetected { nodes: in_cycle });
        }

        Ok(result)
    }

    /// Process one block: run every node in topological order
    pub fn process_block(&mut self, frames: usize) {
        let frames = frames.min(MAX_BLOCK_SIZE);
        if self.dirty {
            // A dirty graph at render time is a construction bug; produce
            // silence rather than failing the audio thread.
            if let Err(err) = self.compile() {
                log::error!("graph compile failed mid-render: {}", err);
                for (_, blocks) in self.blocks.iter_mut() {
                    for block in blocks.iter_mut() {
                        block.clear();
                    }
                }
                return;
            }
        }
        for index in 0..self.order.len() {
            let id = self.order[index];
            self.run_node(id, frames, None);
        }
    }

    /// Run a single node, optionally with a per-voice state bank
    ///
    /// When a bank is supplied and contains the node, processor state and
    /// output blocks come from the bank; cable reads prefer bank-owned
    /// producers and fall back to router-owned (global) producers.
    pub(crate) fn run_node(&mut self, id: NodeId, frames: usize, mut bank: Option<&mut StateBank>) {
        let taken = match bank.as_mut() {
            Some(b) if b.processors.contains_key(id) => {
                (b.processors.remove(id), b.blocks.remove(id), true)
            }
            _ => (self.processors.remove(id), self.blocks.remove(id), false),
        };
        let (Some(mut processor), Some(mut outputs), from_bank) = taken else {
            return;
        };

        // Pass 1: fill scratch blocks for value-bound inputs.
        if let Some(bindings) = self.bindings.get(id) {
            for (slot, binding) in bindings.iter().enumerate() {
                if let Binding::Value(value) = binding {
                    self.scratch[slot].fill(value.get(), frames);
                }
            }
        }

        // Pass 2: resolve every input to a slice.
        let zero = &self.zero.as_slice()[..frames];
        let bank_view = bank.as_deref();
        let mut inputs: [&[f64]; MAX_PORTS] = [zero; MAX_PORTS];
        let mut arity = 0;
        if let Some(bindings) = self.bindings.get(id) {
            arity = bindings.len();
            for (slot, binding) in bindings.iter().enumerate() {
                inputs[slot] = match binding {
                    Binding::Unbound => zero,
                    Binding::Value(_) => &self.scratch[slot].as_slice()[..frames],
                    Binding::Export(index) => &self.export_in[*index].as_slice()[..frames],
                    Binding::Cable { source, .. } => {
                        let blocks = match bank_view {
                            Some(view) if view.blocks.contains_key(source.node) => {
                                view.blocks.get(source.node)
                            }
                            _ => self.blocks.get(source.node),
                        };
                        match blocks.and_then(|outputs| outputs.get(source.port)) {
                            Some(block) => &block.as_slice()[..frames],
                            None => zero,
                        }
                    }
                };
            }
        }

        {
            let mut ctx = ProcessContext {
                inputs: &inputs[..arity],
                outputs: &mut outputs,
                frames,
            };
            processor.process(&mut ctx);
        }

        if from_bank {
            if let Some(b) = bank.as_mut() {
                b.processors.insert(id, processor);
                b.blocks.insert(id, outputs);
            }
        } else {
            self.processors.insert(id, processor);
            self.blocks.insert(id, outputs);
        }
    }

    /// Reset all processors and clear every block
    pub fn reset(&mut self) {
        for (_, processor) in self.processors.iter_mut() {
            processor.reset();
        }
        for (_, blocks) in self.blocks.iter_mut() {
            for block in blocks.iter_mut() {
                block.clear();
            }
        }
        for block in &mut self.export_in {
            block.clear();
        }
    }

    /// Propagate a sample-rate change to every processor
    pub fn set_graph_sample_rate(&mut self, sample_rate: f64) {
        self.sample_rate = sample_rate;
        for (_, processor) in self.processors.iter_mut() {
            processor.set_sample_rate(sample_rate);
        }
    }
}

impl Processor for Router {
    fn port_spec(&self) -> &PortSpec {
        &self.export_spec
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_, '_>) {
        let frames = ctx.frames;
        for (index, input) in ctx.inputs.iter().enumerate() {
            if index >= self.export_in.len() {
                break;
            }
            self.export_in[index].as_mut_slice()[..frames].copy_from_slice(&input[..frames]);
        }

        self.process_block(frames);

        for (index, port) in self.export_outputs.iter().enumerate() {
            if index >= ctx.outputs.len() {
                break;
            }
            let source = self
                .blocks
                .get(port.node)
                .and_then(|blocks| blocks.get(port.port))
                .map(|block| block.as_slice())
                .unwrap_or_else(|| self.zero.as_slice());
            ctx.outputs[index].as_mut_slice()[..frames].copy_from_slice(&source[..frames]);
        }
    }

    fn reset(&mut self) {
        Router::reset(self);
    }

    fn set_sample_rate(&mut self, sample_rate: f64) {
        self.set_graph_sample_rate(sample_rate);
    }

    fn box_clone(&self) -> Box<dyn Processor> {
        Box::new(self.clone())
    }

    fn type_name(&self) -> &'static str {
        "router"
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
