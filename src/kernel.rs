//! The simulation kernel.
//!
//! A [`Kernel`] owns everything a simulation needs: the configuration, the node and synapse
//! model registries, and one [`process::VirtualProcess`] per virtual process (VP) holding the
//! nodes and incoming connections assigned to it. Ranks are simulated in-process: the VPs of all
//! ranks live in the same kernel and exchange spikes through an in-process all-to-all.
//!
//! The lifecycle of a kernel is:
//! - *configured*: nodes and connections can be created, models copied and settings changed
//!   (subject to the locks described in [`Kernel::set_kernel_status`]);
//! - *prepared*: between [`Kernel::prepare`] and [`Kernel::cleanup`], the network is frozen and
//!   [`Kernel::run`] advances the simulation, possibly over several calls.
//!
//! [`Kernel::simulate`] chains the three calls.
use derivative::Derivative;
use serde::{Deserialize, Serialize};

use crate::config::{KernelConfig, KernelStatusUpdate};
use crate::connection::spec::SynSpec;
use crate::core::collection::NodeCollection;
use crate::core::spatial::Positions;
use crate::core::time::TimeGrid;
use crate::core::vp::VpMap;
use crate::core::{stream_rng, KernelRng, ParamDict, RANK_SYNCED_STREAM};
use crate::error::KernelError;
use crate::nodes::model::NodeModelRegistry;
use crate::nodes::recorder::RecordedSpike;
use crate::nodes::NodeSlot;
use crate::synapse::{SynapseKind, SynapseRegistry};

mod connect;
pub mod delivery;
pub mod process;
mod scheduler;
mod structural;
mod wfr;

pub use connect::DisconnectRule;
use delivery::{DeliveryStats, RoutingTable};
use process::VirtualProcess;
use wfr::GapState;

/// The lifecycle state of the kernel.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum KernelState {
    /// The network can be modified.
    Configured,
    /// A simulation is prepared; only node properties and connection weights can change.
    Prepared,
}

/// A snapshot of the kernel settings and counters.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct KernelStatus {
    pub config: KernelConfig,
    pub state: KernelState,
    /// The current simulation time in ms.
    pub time: f64,
    pub num_nodes: u64,
    pub num_connections: usize,
    /// The smallest and largest delays in ms, from the user bounds or the existing connections.
    pub min_delay: f64,
    pub max_delay: f64,
    /// The length of a time slice in ms.
    pub slice_length: f64,
    pub delivery: DeliveryStats,
    /// The waveform relaxation iterations performed since the start, over all slices.
    pub wfr_iterations: u64,
}

/// The simulation kernel. See the [module documentation](self).
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Kernel {
    config: KernelConfig,
    grid: TimeGrid,
    vp_map: VpMap,
    state: KernelState,
    node_models: NodeModelRegistry,
    synapses: SynapseRegistry,
    processes: Vec<VirtualProcess>,
    #[derivative(Debug = "ignore")]
    rank_rng: KernelRng,
    num_nodes: u64,
    /// Whether a model was copied or synapse defaults were set.
    models_modified: bool,
    /// The next step to be simulated.
    step: i64,
    /// The first step of the current time slice.
    origin: i64,
    /// The length of a time slice in steps, fixed while prepared.
    slice_steps: i64,
    #[derivative(Debug = "ignore")]
    routing: Option<RoutingTable>,
    #[derivative(Debug = "ignore")]
    gap: Option<GapState>,
    stats: DeliveryStats,
    wfr_iterations: u64,
    structural_synapse: SynSpec,
    next_structural_step: i64,
}

impl Default for Kernel {
    fn default() -> Self {
        let config = KernelConfig::default();
        let grid = TimeGrid::default();
        let vp_map = VpMap::default();
        let processes = Kernel::spawn_processes(&vp_map, config.rng_seed);
        let rank_rng = stream_rng(config.rng_seed, RANK_SYNCED_STREAM);
        Kernel {
            config,
            grid,
            vp_map,
            state: KernelState::Configured,
            node_models: NodeModelRegistry::default(),
            synapses: SynapseRegistry::default(),
            processes,
            rank_rng,
            num_nodes: 0,
            models_modified: false,
            step: 0,
            origin: 0,
            slice_steps: 1,
            routing: None,
            gap: None,
            stats: DeliveryStats::default(),
            wfr_iterations: 0,
            structural_synapse: SynSpec::default(),
            next_structural_step: 0,
        }
    }
}

impl Kernel {
    /// Create a kernel with the default configuration.
    pub fn new() -> Self {
        Kernel::default()
    }

    /// Create a kernel with the given configuration.
    pub fn with_config(mut config: KernelConfig) -> Result<Self, KernelError> {
        config.normalize();
        config.validate()?;
        let mut kernel = Kernel::default();
        kernel.grid = config.time_grid()?;
        kernel.vp_map = config.vp_map()?;
        kernel.processes = Kernel::spawn_processes(&kernel.vp_map, config.rng_seed);
        kernel.rank_rng = stream_rng(config.rng_seed, RANK_SYNCED_STREAM);
        kernel.config = config;
        Ok(kernel)
    }

    /// Forget every node, connection, model copy and setting.
    pub fn reset(&mut self) {
        log::info!("Resetting the kernel");
        *self = Kernel::default();
    }

    fn spawn_processes(vp_map: &VpMap, seed: u64) -> Vec<VirtualProcess> {
        (0..vp_map.num_vps())
            .map(|vp| VirtualProcess::new(vp, seed))
            .collect()
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn state(&self) -> KernelState {
        self.state
    }

    pub fn grid(&self) -> &TimeGrid {
        &self.grid
    }

    pub fn vp_map(&self) -> VpMap {
        self.vp_map
    }

    /// Returns the current simulation time in ms.
    pub fn time(&self) -> f64 {
        self.grid.steps_to_ms(self.step)
    }

    /// Returns the number of nodes created since the last reset.
    pub fn num_nodes(&self) -> u64 {
        self.num_nodes
    }

    /// Returns the total number of connections.
    pub fn num_connections(&self) -> usize {
        self.processes.iter().map(|p| p.table.len()).sum()
    }

    /// Returns the wire statistics accumulated since the last reset.
    pub fn delivery_stats(&self) -> DeliveryStats {
        self.stats
    }

    fn ensure_configured(&self, operation: &str) -> Result<(), KernelError> {
        match self.state {
            KernelState::Configured => Ok(()),
            KernelState::Prepared => Err(KernelError::KernelState(format!(
                "Cannot {} between prepare and cleanup",
                operation
            ))),
        }
    }

    /// Returns true once the time grid can no longer change.
    fn tick_base_locked(&self) -> bool {
        self.num_nodes > 0 || self.models_modified || self.step > 0
    }

    /// Returns the settings and counters of the kernel.
    pub fn get_kernel_status(&self) -> KernelStatus {
        let (min_delay, max_delay) = self.delay_extrema();
        KernelStatus {
            config: self.config.clone(),
            state: self.state,
            time: self.time(),
            num_nodes: self.num_nodes,
            num_connections: self.num_connections(),
            min_delay: self.grid.steps_to_ms(min_delay),
            max_delay: self.grid.steps_to_ms(max_delay),
            slice_length: self.grid.steps_to_ms(self.slice_steps),
            delivery: self.stats,
            wfr_iterations: self.wfr_iterations,
        }
    }

    /// Change kernel settings.
    ///
    /// The update is rejected as a whole, leaving the settings unchanged, if:
    /// - it changes the time grid after a node was created, a model was copied, synapse defaults
    ///   were set or time advanced;
    /// - it toggles waveform relaxation after a node was created;
    /// - it toggles spike compression after time advanced;
    /// - it changes the VP layout after a node was created or while structural plasticity is
    ///   enabled, or toggles structural plasticity together with the VP layout;
    /// - the delay bounds exclude existing connections.
    pub fn set_kernel_status(&mut self, update: &KernelStatusUpdate) -> Result<(), KernelError> {
        self.ensure_configured("change kernel settings")?;
        let new = update.apply_to(&self.config);

        if update.changes_tick_base()
            && (new.resolution != self.config.resolution || new.tics_per_ms != self.config.tics_per_ms)
            && self.tick_base_locked()
        {
            return Err(KernelError::KernelState(
                "The time grid cannot change once nodes exist, models were modified or time advanced"
                    .to_string(),
            ));
        }
        if new.use_wfr != self.config.use_wfr && self.num_nodes > 0 {
            return Err(KernelError::KernelState(
                "use_wfr cannot change once nodes exist".to_string(),
            ));
        }
        if new.use_compressed_spikes != self.config.use_compressed_spikes && self.step > 0 {
            return Err(KernelError::KernelState(
                "use_compressed_spikes cannot change once time advanced".to_string(),
            ));
        }
        let vp_layout_changes = new.total_num_virtual_procs != self.config.total_num_virtual_procs
            || new.num_ranks != self.config.num_ranks;
        if vp_layout_changes {
            if new.use_structural_plasticity != self.config.use_structural_plasticity {
                return Err(KernelError::KernelState(
                    "Structural plasticity cannot be toggled together with the VP layout"
                        .to_string(),
                ));
            }
            if self.config.use_structural_plasticity {
                return Err(KernelError::KernelState(
                    "The VP layout cannot change while structural plasticity is enabled".to_string(),
                ));
            }
            if self.num_nodes > 0 {
                return Err(KernelError::KernelState(
                    "The VP layout cannot change once nodes exist".to_string(),
                ));
            }
        }
        new.validate()?;

        let grid = new.time_grid()?;
        let vp_map = new.vp_map()?;
        self.check_delay_bounds(&new, &grid)?;

        let reseed = new.rng_seed != self.config.rng_seed;
        self.config = new;
        self.grid = grid;
        if vp_layout_changes {
            self.vp_map = vp_map;
            self.processes = Kernel::spawn_processes(&self.vp_map, self.config.rng_seed);
            self.routing = None;
        }
        if reseed {
            for process in self.processes.iter_mut() {
                process.reseed(self.config.rng_seed);
            }
            self.rank_rng = stream_rng(self.config.rng_seed, RANK_SYNCED_STREAM);
        }
        log::debug!("Kernel settings updated: {:?}", self.config);
        Ok(())
    }

    /// Checks that the delay bounds of `config` include every existing connection delay.
    fn check_delay_bounds(&self, config: &KernelConfig, grid: &TimeGrid) -> Result<(), KernelError> {
        if self.num_connections() == 0 {
            return Ok(());
        }
        let (min_steps, max_steps) = self.edge_delay_extrema();
        if let Some(min_delay) = config.min_delay {
            if grid.steps_to_ms(min_steps) < min_delay - 0.5 * grid.resolution() {
                return Err(KernelError::BadDelay(format!(
                    "min_delay {} ms exceeds the delay of existing connections",
                    min_delay
                )));
            }
        }
        if let Some(max_delay) = config.max_delay {
            if grid.steps_to_ms(max_steps) > max_delay + 0.5 * grid.resolution() {
                return Err(KernelError::BadDelay(format!(
                    "max_delay {} ms is below the delay of existing connections",
                    max_delay
                )));
            }
        }
        Ok(())
    }

    /// Returns the smallest and largest delay steps of the spiking connections, or `(1, 1)`.
    fn edge_delay_extrema(&self) -> (i64, i64) {
        let delays = self
            .processes
            .iter()
            .flat_map(|p| p.table.iter())
            .filter(|(syn_id, _, _)| !self.is_gap_synapse(*syn_id))
            .map(|(_, _, edge)| edge.delay_steps);
        let (min, max) = delays.fold((i64::MAX, i64::MIN), |(min, max), d| (min.min(d), max.max(d)));
        if min > max {
            (1, 1)
        } else {
            (min, max)
        }
    }

    /// Returns the delay extrema in steps, the user bounds taking precedence over the connections.
    fn delay_extrema(&self) -> (i64, i64) {
        let (min_steps, max_steps) = self.edge_delay_extrema();
        let quantize = |delay: f64| self.grid.ms_to_steps_nearest(delay).max(1);
        (
            self.config.min_delay.map(quantize).unwrap_or(min_steps),
            self.config.max_delay.map(quantize).unwrap_or(max_steps),
        )
    }

    fn is_gap_synapse(&self, syn_id: usize) -> bool {
        self.synapses
            .get(syn_id)
            .map(|model| model.kind() == SynapseKind::GapJunction)
            .unwrap_or(false)
    }

    /// Returns the slot of an existing node.
    pub(crate) fn slot(&self, node_id: u64) -> Result<&NodeSlot, KernelError> {
        if node_id == 0 || node_id > self.num_nodes {
            return Err(KernelError::UnknownNode(node_id.to_string()));
        }
        self.processes[self.vp_map.vp_of(node_id)]
            .node(node_id)
            .ok_or_else(|| KernelError::UnknownNode(node_id.to_string()))
    }

    fn slot_mut(&mut self, node_id: u64) -> Result<&mut NodeSlot, KernelError> {
        if node_id == 0 || node_id > self.num_nodes {
            return Err(KernelError::UnknownNode(node_id.to_string()));
        }
        let vp = self.vp_map.vp_of(node_id);
        self.processes[vp]
            .node_mut(node_id)
            .ok_or_else(|| KernelError::UnknownNode(node_id.to_string()))
    }

    /// Create `n` nodes of the given model with contiguous IDs, applying `params` to each of them.
    pub fn create(
        &mut self,
        model: &str,
        n: usize,
        params: &ParamDict,
    ) -> Result<NodeCollection, KernelError> {
        self.ensure_configured("create nodes")?;
        if n == 0 {
            return Err(KernelError::BadParameter(
                "The number of nodes to create must be positive".to_string(),
            ));
        }
        let model_id = self.node_models.id_of(model)?;
        let mut prototype = self
            .node_models
            .get(model_id)
            .map(|model| model.prototype().clone())
            .ok_or_else(|| KernelError::UnknownModel(model.to_string()))?;
        prototype.set_status(params, &self.grid)?;

        let first = self.num_nodes + 1;
        let last = self.num_nodes + n as u64;
        for node_id in first..=last {
            let vp = self.vp_map.vp_of(node_id);
            self.processes[vp]
                .nodes
                .push(prototype.instantiate(node_id, self.step));
        }
        self.num_nodes = last;
        log::info!("Created {} nodes of model {} ({}..={})", n, model, first, last);
        Ok(NodeCollection::from_range(first, last, model_id))
    }

    /// Create nodes at the given positions. Random positions are drawn from the rank-synchronized
    /// generator.
    pub fn create_spatial(
        &mut self,
        model: &str,
        positions: &Positions,
        params: &ParamDict,
    ) -> Result<NodeCollection, KernelError> {
        self.ensure_configured("create nodes")?;
        let mut rank_rng = self.rank_rng.clone();
        let layer = positions.build_layer(&mut rank_rng)?;
        let nodes = self.create(model, positions.num_nodes(), params)?;
        self.rank_rng = rank_rng;
        Ok(nodes.with_layer(layer))
    }

    /// Returns the properties of every node of the collection.
    pub fn get_status(&self, nodes: &NodeCollection) -> Result<Vec<ParamDict>, KernelError> {
        nodes
            .iter()
            .map(|node_id| self.slot(node_id).map(|slot| slot.get_status()))
            .collect()
    }

    /// Set properties of every node of the collection. Nothing changes if any node rejects them.
    pub fn set_status(&mut self, nodes: &NodeCollection, params: &ParamDict) -> Result<(), KernelError> {
        let mut updated = Vec::with_capacity(nodes.len());
        for node_id in nodes.iter() {
            let mut slot = self.slot(node_id)?.clone();
            slot.set_status(params, &self.grid)?;
            updated.push(slot);
        }
        for slot in updated {
            let node_id = slot.id();
            *self.slot_mut(node_id)? = slot;
        }
        Ok(())
    }

    /// Set the spike times (ms) and multiplicities of a spike generator.
    pub fn set_spike_times(
        &mut self,
        node_id: u64,
        spike_times: &[f64],
        spike_multiplicities: &[u32],
    ) -> Result<(), KernelError> {
        let grid = self.grid.clone();
        let slot = self.slot_mut(node_id)?;
        let generator = slot.node_mut().as_spike_generator_mut().ok_or_else(|| {
            KernelError::BadParameter(format!("Node {} is not a spike generator", node_id))
        })?;
        generator.set_spike_times(spike_times.to_vec(), spike_multiplicities.to_vec(), &grid)
    }

    /// Returns the spikes recorded by a spike recorder, in delivery order.
    pub fn get_events(&self, recorder_id: u64) -> Result<&[RecordedSpike], KernelError> {
        self.slot(recorder_id)?
            .node()
            .as_recorder()
            .map(|recorder| recorder.events())
            .ok_or_else(|| {
                KernelError::BadParameter(format!("Node {} is not a spike recorder", recorder_id))
            })
    }

    /// Register a copy of a node or synapse model under a new name and return its model ID.
    pub fn copy_model(
        &mut self,
        base: &str,
        new_name: &str,
        params: &ParamDict,
    ) -> Result<usize, KernelError> {
        self.ensure_configured("copy models")?;
        if self.node_models.id_of(new_name).is_ok() || self.synapses.id_of(new_name).is_ok() {
            return Err(KernelError::BadParameter(format!(
                "A model named {} already exists",
                new_name
            )));
        }
        let id = if self.node_models.id_of(base).is_ok() {
            self.node_models.copy_model(base, new_name, params, &self.grid)?
        } else {
            self.synapses.copy_model(base, new_name, params)?
        };
        self.models_modified = true;
        log::info!("Copied model {} to {} (ID {})", base, new_name, id);
        Ok(id)
    }

    /// Set the defaults of a node model, or the common properties and defaults of a synapse model.
    pub fn set_defaults(&mut self, model: &str, params: &ParamDict) -> Result<(), KernelError> {
        if self.node_models.id_of(model).is_ok() {
            return self.node_models.set_defaults(model, params, &self.grid);
        }
        self.synapses.set_defaults(model, params)?;
        self.models_modified = true;
        Ok(())
    }

    /// Returns the defaults of a node or synapse model.
    pub fn get_defaults(&self, model: &str) -> Result<ParamDict, KernelError> {
        match self.node_models.get_defaults(model) {
            Ok(defaults) => Ok(defaults),
            Err(_) => self.synapses.get_defaults(model),
        }
    }

    /// Set the synapse of the connections created by structural plasticity.
    pub fn set_structural_plasticity_synapse(&mut self, syn: SynSpec) -> Result<(), KernelError> {
        self.ensure_configured("change the structural plasticity synapse")?;
        syn.validate()?;
        let model = self.synapses.by_name(&syn.model)?;
        if model.kind() == SynapseKind::GapJunction || syn.has_arrays() {
            return Err(KernelError::BadParameter(format!(
                "Structural plasticity cannot create {} connections with parameter arrays or gap junctions",
                syn.model
            )));
        }
        self.structural_synapse = syn;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::params;

    #[test]
    fn test_create_assigns_contiguous_ids() {
        let mut kernel = Kernel::with_config(KernelConfig {
            total_num_virtual_procs: 3,
            ..KernelConfig::default()
        })
        .unwrap();
        let a = kernel.create("iaf_psc_delta", 4, &ParamDict::new()).unwrap();
        let b = kernel.create("parrot_neuron", 2, &ParamDict::new()).unwrap();
        assert_eq!(a.to_vec(), vec![1, 2, 3, 4]);
        assert_eq!(b.to_vec(), vec![5, 6]);
        assert_eq!(kernel.num_nodes(), 6);
        assert_eq!(kernel.processes[1].nodes.len(), 2);
        assert!(kernel.create("iaf_psc_delta", 0, &ParamDict::new()).is_err());
        assert!(matches!(
            kernel.create("hh_psc_alpha", 1, &ParamDict::new()),
            Err(KernelError::UnknownModel(_))
        ));
    }

    #[test]
    fn test_create_with_invalid_params_creates_nothing() {
        let mut kernel = Kernel::new();
        assert!(kernel
            .create("iaf_psc_delta", 3, &params(&[("C_m", -1.0)]))
            .is_err());
        assert_eq!(kernel.num_nodes(), 0);
    }

    #[test]
    fn test_tick_base_lock() {
        let mut kernel = Kernel::new();
        let finer = KernelStatusUpdate {
            resolution: Some(0.01),
            ..KernelStatusUpdate::default()
        };
        kernel.set_kernel_status(&finer).unwrap();
        assert_eq!(kernel.grid().resolution(), 0.01);

        kernel
            .copy_model("static_synapse", "my_synapse", &params(&[("weight", 2.0)]))
            .unwrap();
        let coarser = KernelStatusUpdate {
            resolution: Some(0.1),
            ..KernelStatusUpdate::default()
        };
        assert!(matches!(
            kernel.set_kernel_status(&coarser),
            Err(KernelError::KernelState(_))
        ));
        assert_eq!(kernel.config().resolution, 0.01);
    }

    #[test]
    fn test_coarse_grid_without_wfr() {
        let kernel = Kernel::with_config(KernelConfig {
            resolution: 2.0,
            use_wfr: false,
            ..KernelConfig::default()
        })
        .unwrap();
        assert_eq!(kernel.config().wfr_comm_interval, 2.0);
        assert_eq!(kernel.grid().resolution(), 2.0);
    }

    #[test]
    fn test_wfr_and_layout_locks() {
        let mut kernel = Kernel::new();
        kernel.create("iaf_psc_delta", 1, &ParamDict::new()).unwrap();
        let no_wfr = KernelStatusUpdate {
            use_wfr: Some(false),
            ..KernelStatusUpdate::default()
        };
        assert!(kernel.set_kernel_status(&no_wfr).is_err());
        let more_vps = KernelStatusUpdate {
            total_num_virtual_procs: Some(2),
            ..KernelStatusUpdate::default()
        };
        assert!(kernel.set_kernel_status(&more_vps).is_err());

        let mut kernel = Kernel::new();
        let toggle = KernelStatusUpdate {
            total_num_virtual_procs: Some(2),
            use_structural_plasticity: Some(true),
            ..KernelStatusUpdate::default()
        };
        assert!(kernel.set_kernel_status(&toggle).is_err());
        assert!(kernel.set_kernel_status(&more_vps).is_ok());
        assert_eq!(kernel.vp_map().num_vps(), 2);
    }

    #[test]
    fn test_set_status_is_atomic_over_collection() {
        let mut kernel = Kernel::new();
        let neurons = kernel.create("iaf_psc_delta", 2, &ParamDict::new()).unwrap();
        let parrot = kernel.create("parrot_neuron", 1, &ParamDict::new()).unwrap();
        let all = neurons.concat(&parrot).unwrap();
        assert!(kernel.set_status(&all, &params(&[("V_m", -60.0)])).is_err());
        assert_eq!(kernel.get_status(&neurons).unwrap()[0]["V_m"], -70.0);

        kernel.set_status(&neurons, &params(&[("V_m", -60.0)])).unwrap();
        let status = kernel.get_status(&neurons).unwrap();
        assert!(status.iter().all(|s| s["V_m"] == -60.0));
    }

    #[test]
    fn test_models() {
        let mut kernel = Kernel::new();
        let id = kernel
            .copy_model("iaf_psc_delta", "fast_neuron", &params(&[("tau_m", 5.0)]))
            .unwrap();
        let nodes = kernel.create("fast_neuron", 1, &ParamDict::new()).unwrap();
        let status = kernel.get_status(&nodes).unwrap();
        assert_eq!(status[0]["tau_m"], 5.0);
        assert_eq!(status[0]["model_id"], id as f64);

        kernel
            .set_defaults("stdp_synapse", &params(&[("Wmax", 50.0)]))
            .unwrap();
        assert_eq!(kernel.get_defaults("stdp_synapse").unwrap()["Wmax"], 50.0);
        assert!(kernel.copy_model("stdp_synapse", "fast_neuron", &ParamDict::new()).is_err());
    }

    #[test]
    fn test_reset() {
        let mut kernel = Kernel::new();
        kernel.create("iaf_psc_delta", 3, &ParamDict::new()).unwrap();
        kernel.reset();
        assert_eq!(kernel.num_nodes(), 0);
        assert!(kernel.slot(1).is_err());
    }
}
