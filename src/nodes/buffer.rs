//! Per-node input queues and spike archives.
use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::core::time::PreciseTime;

/// A spike event as received by a node.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct InEvent {
    /// The ID of the sending node.
    pub sender: u64,
    /// The weight of the connection the event travelled along.
    pub weight: f64,
    /// The number of coincident spikes the event stands for.
    pub multiplicity: u32,
    /// The sub-step offset of the spike time, zero for grid events.
    pub offset: f64,
    /// The delay of the connection in steps.
    pub delay_steps: i64,
    /// The receptor port of the target.
    pub receptor: usize,
}

impl InEvent {
    /// Returns the arrival time of an event read during the update from `step` to `step + 1`.
    pub fn arrival(&self, step: i64) -> PreciseTime {
        if self.offset > 0.0 {
            PreciseTime {
                step,
                offset: self.offset,
            }
        } else {
            PreciseTime::on_grid(step + 1)
        }
    }

    /// Returns the emission time of an event read during the update from `step` to `step + 1`.
    pub fn emission(&self, step: i64) -> PreciseTime {
        self.arrival(step).shifted(-self.delay_steps)
    }
}

/// Events waiting to be read by a node, bucketed by the step at which they are read.
///
/// The queue starts at `base`, the next step to be read, and grows on demand up to the furthest
/// pending delivery.
#[derive(Debug, PartialEq, Clone, Default)]
pub struct InputQueue {
    base: i64,
    slots: VecDeque<Vec<InEvent>>,
}

impl InputQueue {
    /// Create an empty queue whose first readable step is `base`.
    pub fn new(base: i64) -> Self {
        InputQueue {
            base,
            slots: VecDeque::new(),
        }
    }

    /// Returns the next step to be read.
    pub fn base(&self) -> i64 {
        self.base
    }

    /// Queue an event to be read at the given step.
    /// Returns false, and drops the event, if the step was already read.
    pub fn push(&mut self, step: i64, event: InEvent) -> bool {
        if step < self.base {
            return false;
        }
        let index = (step - self.base) as usize;
        if index >= self.slots.len() {
            self.slots.resize_with(index + 1, Vec::new);
        }
        self.slots[index].push(event);
        true
    }

    /// Removes and returns the events to be read at the given step.
    /// Steps before `step` that were never read are discarded.
    pub fn take(&mut self, step: i64) -> Vec<InEvent> {
        while self.base < step {
            self.slots.pop_front();
            self.base += 1;
        }
        if step < self.base {
            return Vec::new();
        }
        self.base += 1;
        self.slots.pop_front().unwrap_or_default()
    }

    /// Returns the events to be read at the given step without removing them.
    pub fn peek(&self, step: i64) -> &[InEvent] {
        if step < self.base {
            return &[];
        }
        self.slots
            .get((step - self.base) as usize)
            .map(|events| events.as_slice())
            .unwrap_or(&[])
    }

    /// Returns the total number of pending events.
    pub fn num_pending(&self) -> usize {
        self.slots.iter().map(|events| events.len()).sum()
    }

    /// Drops every pending event sent by the given node.
    pub fn drop_sender(&mut self, sender: u64) {
        self.slots
            .iter_mut()
            .for_each(|events| events.retain(|event| event.sender != sender));
    }
}

/// The default time constant of the post-synaptic trace used by spike-timing dependent plasticity.
pub const DEFAULT_TAU_MINUS: f64 = 20.0;

/// An archived spike of a node, with the value of its post-synaptic trace just after the spike.
#[derive(Debug, PartialEq, Clone, Copy, Serialize, Deserialize)]
pub struct ArchivedSpike {
    pub time: f64,
    pub k_minus: f64,
}

/// The spike history of a node, read by plastic synapses targeting it.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct SpikeArchive {
    tau_minus: f64,
    history: Vec<ArchivedSpike>,
}

impl Default for SpikeArchive {
    fn default() -> Self {
        SpikeArchive {
            tau_minus: DEFAULT_TAU_MINUS,
            history: Vec::new(),
        }
    }
}

impl SpikeArchive {
    /// Returns the time constant of the post-synaptic trace.
    pub fn tau_minus(&self) -> f64 {
        self.tau_minus
    }

    /// Set the time constant of the post-synaptic trace.
    pub fn set_tau_minus(&mut self, tau_minus: f64) {
        self.tau_minus = tau_minus;
    }

    /// Returns the archived spikes, sorted by time.
    pub fn history(&self) -> &[ArchivedSpike] {
        &self.history
    }

    /// Record a spike at the given time.
    pub fn record(&mut self, time: f64) {
        let k_minus = self.k_minus(time) + 1.0;
        self.history.push(ArchivedSpike { time, k_minus });
    }

    /// Returns the post-synaptic trace at the given time, excluding spikes at exactly that time.
    pub fn k_minus(&self, time: f64) -> f64 {
        self.history
            .iter()
            .rev()
            .find(|spike| spike.time < time)
            .map(|spike| spike.k_minus * ((spike.time - time) / self.tau_minus).exp())
            .unwrap_or(0.0)
    }

    /// An iterator over the spikes in the time interval `(start, end]`.
    pub fn spikes_between(&self, start: f64, end: f64) -> impl Iterator<Item = &ArchivedSpike> {
        self.history
            .iter()
            .filter(move |spike| spike.time > start && spike.time <= end)
    }

    /// Forget the spikes older than the given time.
    pub fn prune_before(&mut self, time: f64) {
        let keep_from = self.history.partition_point(|spike| spike.time < time);
        if keep_from > 0 {
            self.history.drain(..keep_from);
        }
    }
}
