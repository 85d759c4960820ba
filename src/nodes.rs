//! Node models and per-node simulation state.
//!
//! The kernel knows a closed set of built-in node models, gathered in the [`Node`] enum. Each
//! model implements the [`Dynamics`] trait: events read at a step are passed to
//! [`Dynamics::handle`], after which [`Dynamics::update`] advances the state by one step and
//! reports the emitted spikes.
//!
//! Every node lives in a [`NodeSlot`] on the virtual process owning it. The slot holds the
//! model-independent state: the queue of pending input events, the frozen flag, the spike archive
//! read by plastic synapses and the synaptic elements used by structural plasticity.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::core::time::{PreciseTime, TimeGrid};
use crate::core::{KernelRng, ParamDict};
use crate::error::KernelError;

pub mod buffer;
pub mod elements;
pub mod generator;
pub mod model;
pub mod neuron;
pub mod parrot;
pub mod recorder;

use buffer::{InEvent, InputQueue, SpikeArchive};
use elements::SynapticElements;
use generator::{PoissonGenerator, SpikeGenerator};
use neuron::{IafPscDelta, IafPscDeltaGap};
use parrot::{ParrotNeuron, ParrotNeuronPs};
use recorder::SpikeRecorder;

/// Gap-junction coupling of a node during the update of a slice.
#[derive(Debug, Clone, Copy)]
pub struct GapInput<'a> {
    /// The coupled nodes and the coupling conductances in nS.
    pub couplings: &'a [(u64, f64)],
    /// The membrane potential trajectories over the slice, indexed by node ID.
    pub trajectories: &'a HashMap<u64, Vec<f64>>,
    /// The first step of the trajectories.
    pub origin: i64,
}

impl<'a> GapInput<'a> {
    /// Returns the membrane potential of the node at the start of the given step.
    pub fn voltage(&self, node_id: u64, step: i64) -> Option<f64> {
        let index = usize::try_from(step - self.origin).ok()?;
        self.trajectories
            .get(&node_id)
            .and_then(|trajectory| trajectory.get(index))
            .copied()
    }
}

/// The context of the update from `step` to `step + 1`.
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    pub step: i64,
    pub grid: &'a TimeGrid,
    pub gap: Option<GapInput<'a>>,
}

/// A spike emitted during an update.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Emission {
    pub time: PreciseTime,
    pub multiplicity: u32,
}

/// The dynamics of a node model.
pub trait Dynamics {
    /// Handle an event read during the current update.
    fn handle(&mut self, event: &InEvent);

    /// Advance the state from `ctx.step` to `ctx.step + 1`, pushing the emitted spikes.
    fn update(&mut self, ctx: &StepContext, rng: &mut KernelRng, emitted: &mut Vec<Emission>);

    /// Returns the model properties.
    fn get_status(&self) -> ParamDict;

    /// Set model properties. Nothing changes if any property is unknown or invalid.
    fn set_status(&mut self, params: &ParamDict, grid: &TimeGrid) -> Result<(), KernelError>;

    /// Returns true if the node emits spikes off the grid.
    fn is_precise(&self) -> bool {
        false
    }
}

/// The names of the built-in node models.
pub const BUILTIN_NODE_MODELS: [&str; 7] = [
    "iaf_psc_delta",
    "iaf_psc_delta_gap",
    "parrot_neuron",
    "parrot_neuron_ps",
    "poisson_generator",
    "spike_generator",
    "spike_recorder",
];

/// A node of any built-in model.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub enum Node {
    IafPscDelta(IafPscDelta),
    IafPscDeltaGap(IafPscDeltaGap),
    ParrotNeuron(ParrotNeuron),
    ParrotNeuronPs(ParrotNeuronPs),
    PoissonGenerator(PoissonGenerator),
    SpikeGenerator(SpikeGenerator),
    SpikeRecorder(SpikeRecorder),
}

macro_rules! dispatch {
    ($node:expr, $inner:ident => $body:expr) => {
        match $node {
            Node::IafPscDelta($inner) => $body,
            Node::IafPscDeltaGap($inner) => $body,
            Node::ParrotNeuron($inner) => $body,
            Node::ParrotNeuronPs($inner) => $body,
            Node::PoissonGenerator($inner) => $body,
            Node::SpikeGenerator($inner) => $body,
            Node::SpikeRecorder($inner) => $body,
        }
    };
}

impl Node {
    /// Create a node of the built-in model with the given name, with default properties.
    pub fn from_name(name: &str) -> Result<Self, KernelError> {
        match name {
            "iaf_psc_delta" => Ok(Node::IafPscDelta(IafPscDelta::default())),
            "iaf_psc_delta_gap" => Ok(Node::IafPscDeltaGap(IafPscDeltaGap::default())),
            "parrot_neuron" => Ok(Node::ParrotNeuron(ParrotNeuron::default())),
            "parrot_neuron_ps" => Ok(Node::ParrotNeuronPs(ParrotNeuronPs::default())),
            "poisson_generator" => Ok(Node::PoissonGenerator(PoissonGenerator::default())),
            "spike_generator" => Ok(Node::SpikeGenerator(SpikeGenerator::default())),
            "spike_recorder" => Ok(Node::SpikeRecorder(SpikeRecorder::default())),
            _ => Err(KernelError::UnknownModel(name.to_string())),
        }
    }

    /// Returns the name of the built-in model of the node.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Node::IafPscDelta(_) => "iaf_psc_delta",
            Node::IafPscDeltaGap(_) => "iaf_psc_delta_gap",
            Node::ParrotNeuron(_) => "parrot_neuron",
            Node::ParrotNeuronPs(_) => "parrot_neuron_ps",
            Node::PoissonGenerator(_) => "poisson_generator",
            Node::SpikeGenerator(_) => "spike_generator",
            Node::SpikeRecorder(_) => "spike_recorder",
        }
    }

    /// Returns true if the node emits spikes, i.e., can be the source of a connection.
    pub fn can_send(&self) -> bool {
        !matches!(self, Node::SpikeRecorder(_))
    }

    /// Returns true if the node handles spikes, i.e., can be the target of a connection.
    pub fn can_receive(&self) -> bool {
        !matches!(self, Node::PoissonGenerator(_) | Node::SpikeGenerator(_))
    }

    /// Returns the number of receptor ports of the node.
    pub fn num_receptors(&self) -> usize {
        match self {
            Node::ParrotNeuron(_) | Node::ParrotNeuronPs(_) => 2,
            _ => 1,
        }
    }

    /// Returns true if the node supports gap junctions.
    pub fn supports_gap_junctions(&self) -> bool {
        matches!(self, Node::IafPscDeltaGap(_))
    }

    /// Returns true if the node keeps a spike archive for plastic synapses.
    pub fn archives_spikes(&self) -> bool {
        matches!(
            self,
            Node::IafPscDelta(_)
                | Node::IafPscDeltaGap(_)
                | Node::ParrotNeuron(_)
                | Node::ParrotNeuronPs(_)
        )
    }

    /// Returns the membrane potential of neurons.
    pub fn membrane_potential(&self) -> Option<f64> {
        match self {
            Node::IafPscDelta(neuron) => Some(neuron.v_m()),
            Node::IafPscDeltaGap(neuron) => Some(neuron.v_m()),
            _ => None,
        }
    }

    /// Returns the recorder, if the node is one.
    pub fn as_recorder(&self) -> Option<&SpikeRecorder> {
        match self {
            Node::SpikeRecorder(recorder) => Some(recorder),
            _ => None,
        }
    }

    /// Returns the spike generator, if the node is one.
    pub fn as_spike_generator_mut(&mut self) -> Option<&mut SpikeGenerator> {
        match self {
            Node::SpikeGenerator(generator) => Some(generator),
            _ => None,
        }
    }
}

impl Dynamics for Node {
    fn handle(&mut self, event: &InEvent) {
        dispatch!(self, inner => inner.handle(event))
    }

    fn update(&mut self, ctx: &StepContext, rng: &mut KernelRng, emitted: &mut Vec<Emission>) {
        dispatch!(self, inner => inner.update(ctx, rng, emitted))
    }

    fn get_status(&self) -> ParamDict {
        dispatch!(self, inner => inner.get_status())
    }

    fn set_status(&mut self, params: &ParamDict, grid: &TimeGrid) -> Result<(), KernelError> {
        dispatch!(self, inner => inner.set_status(params, grid))
    }

    fn is_precise(&self) -> bool {
        dispatch!(self, inner => inner.is_precise())
    }
}

/// A node together with its model-independent simulation state.
#[derive(Debug, PartialEq, Clone)]
pub struct NodeSlot {
    id: u64,
    model_id: usize,
    frozen: bool,
    node: Node,
    queue: InputQueue,
    archive: SpikeArchive,
    elements: SynapticElements,
}

impl NodeSlot {
    /// Create a slot for a node of the given model. The node reads its first input at step 0.
    pub fn new(model_id: usize, node: Node) -> Self {
        NodeSlot {
            id: 0,
            model_id,
            frozen: false,
            node,
            queue: InputQueue::new(0),
            archive: SpikeArchive::default(),
            elements: SynapticElements::default(),
        }
    }

    /// Returns a copy of the slot for the node with the given ID, reading its first input at `step`.
    pub fn instantiate(&self, id: u64, step: i64) -> Self {
        NodeSlot {
            id,
            queue: InputQueue::new(step),
            ..self.clone()
        }
    }

    /// Returns the node ID.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the model ID.
    pub fn model_id(&self) -> usize {
        self.model_id
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn node_mut(&mut self) -> &mut Node {
        &mut self.node
    }

    /// Returns true if the node is frozen, i.e., not updated.
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Returns the spike archive of the node.
    pub fn archive(&self) -> &SpikeArchive {
        &self.archive
    }

    pub fn archive_mut(&mut self) -> &mut SpikeArchive {
        &mut self.archive
    }

    /// Returns the calcium trace and synaptic elements of the node.
    pub fn elements(&self) -> &SynapticElements {
        &self.elements
    }

    pub fn elements_mut(&mut self) -> &mut SynapticElements {
        &mut self.elements
    }

    /// Queue an event to be read during the update from `step` to `step + 1`.
    /// Returns false if that update already happened.
    pub fn enqueue(&mut self, step: i64, event: InEvent) -> bool {
        self.queue.push(step, event)
    }

    /// Returns the number of events waiting to be read.
    pub fn num_pending(&self) -> usize {
        self.queue.num_pending()
    }

    /// Drops the pending events of the given sender.
    pub fn drop_pending_from(&mut self, sender: u64) {
        self.queue.drop_sender(sender);
    }

    /// Returns all node properties.
    pub fn get_status(&self) -> ParamDict {
        let mut status = self.node.get_status();
        status.insert("global_id".to_string(), self.id as f64);
        status.insert("model_id".to_string(), self.model_id as f64);
        status.insert("frozen".to_string(), f64::from(u8::from(self.frozen)));
        if self.node.archives_spikes() {
            status.insert("tau_minus".to_string(), self.archive.tau_minus());
        }
        status.extend(self.elements.get_status());
        status
    }

    /// Set node properties. Nothing changes if any property is unknown or invalid.
    pub fn set_status(&mut self, params: &ParamDict, grid: &TimeGrid) -> Result<(), KernelError> {
        let mut frozen = self.frozen;
        let mut tau_minus = self.archive.tau_minus();
        let mut elements = self.elements.clone();
        let mut node_params = ParamDict::new();
        for (key, value) in params.iter() {
            match key.as_str() {
                "frozen" if *value == 0.0 || *value == 1.0 => frozen = *value == 1.0,
                "tau_minus" if self.node.archives_spikes() && *value > 0.0 => tau_minus = *value,
                "frozen" | "tau_minus" | "global_id" | "model_id" => {
                    return Err(KernelError::BadProperty(format!(
                        "Invalid value {} for property {}",
                        value, key
                    )))
                }
                _ if SynapticElements::owns_key(key) => elements.set(key, *value)?,
                _ => {
                    node_params.insert(key.clone(), *value);
                }
            }
        }
        self.node.set_status(&node_params, grid)?;
        self.frozen = frozen;
        self.archive.set_tau_minus(tau_minus);
        self.elements = elements;
        Ok(())
    }

    /// Read the events of the step and advance the node from `ctx.step` to `ctx.step + 1`.
    /// Frozen nodes discard their input and keep their state.
    pub fn update(&mut self, ctx: &StepContext, rng: &mut KernelRng, emitted: &mut Vec<Emission>) {
        let events = self.queue.take(ctx.step);
        if self.frozen {
            return;
        }
        events.iter().for_each(|event| self.node.handle(event));

        let first = emitted.len();
        self.node.update(ctx, rng, emitted);

        let mut num_spikes = 0;
        for emission in emitted[first..].iter() {
            num_spikes += emission.multiplicity;
            if self.node.archives_spikes() {
                self.archive.record(emission.time.to_ms(ctx.grid));
            }
        }
        self.elements.update(ctx.grid.resolution(), num_spikes);
    }

    /// Predicts the membrane potential of a gap-junction neuron at the start of each step of
    /// `origin..=origin + num_steps`, without changing its state.
    /// Returns `None` for nodes without gap junctions.
    pub fn predict_trajectory(
        &self,
        num_steps: i64,
        grid: &TimeGrid,
        gap: GapInput,
        rng: &mut KernelRng,
    ) -> Option<Vec<f64>> {
        let Node::IafPscDeltaGap(neuron) = &self.node else {
            return None;
        };
        let mut neuron = neuron.clone();
        let mut trajectory = Vec::with_capacity(num_steps as usize + 1);
        trajectory.push(neuron.v_m());
        let mut scratch = Vec::new();
        for step in gap.origin..gap.origin + num_steps {
            if !self.frozen {
                self.queue
                    .peek(step)
                    .iter()
                    .for_each(|event| neuron.handle(event));
                let ctx = StepContext {
                    step,
                    grid,
                    gap: Some(gap),
                };
                neuron.update(&ctx, rng, &mut scratch);
            }
            trajectory.push(neuron.v_m());
        }
        Some(trajectory)
    }
}
