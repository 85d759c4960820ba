//! Advancing the simulation in time slices.
//!
//! Time advances in slices of `Δ` steps, `Δ` being the smallest connection delay. During a slice
//! every VP updates its nodes step by step; spikes are exchanged at the end of the slice. A spike
//! emitted during a slice is read by its target at the earliest one step after the delay, hence
//! never before the next slice starts.
//!
//! A run may stop in the middle of a slice: the next run continues the slice and the exchange
//! happens once it completes, so that splitting a simulation into several runs changes nothing.
use rayon::prelude::*;

use super::delivery::{all_to_all, deliver, pack, total, DeliveryStats, OutSpike, RoutingTable};
use super::wfr::GapState;
use super::{Kernel, KernelState};
use crate::error::KernelError;
use crate::synapse::SynapseKind;
use crate::MIN_VPS_PAR;

/// Archived spikes are kept this many time constants after they can no longer reach a connection.
const ARCHIVE_HORIZON: f64 = 10.0;

impl Kernel {
    /// Returns true if any gap junction exists.
    fn has_gap_junctions(&self) -> bool {
        self.processes.iter().any(|process| {
            process
                .table
                .syn_ids()
                .any(|syn_id| self.is_gap_synapse(syn_id))
        })
    }

    /// Returns the length of a time slice in steps.
    fn compute_slice_steps(&self) -> Result<i64, KernelError> {
        let (min_delay, _) = self.delay_extrema();
        let mut steps = min_delay.max(1);
        if self.config.use_wfr && self.has_gap_junctions() {
            let interval = self.grid.ms_to_steps_nearest(self.config.wfr_comm_interval);
            steps = steps.min(interval.max(1));
        }
        Ok(steps)
    }

    /// Freeze the network and get ready to run.
    pub fn prepare(&mut self) -> Result<(), KernelError> {
        self.ensure_configured("prepare")?;
        let slice_steps = self.compute_slice_steps()?;
        self.check_structural_delay(slice_steps)?;
        if slice_steps != self.slice_steps {
            self.flush_pending();
            self.slice_steps = slice_steps;
        }
        self.processes.iter_mut().for_each(|process| process.table.sort());
        if self.routing.is_none() {
            self.routing = Some(RoutingTable::build(&self.processes, &self.synapses));
        }
        self.state = KernelState::Prepared;
        log::info!(
            "Prepared {} nodes and {} connections on {} VPs, time slices of {} ms",
            self.num_nodes,
            self.num_connections(),
            self.vp_map.num_vps(),
            self.grid.steps_to_ms(self.slice_steps)
        );
        Ok(())
    }

    /// Advance the simulation by `duration` ms, which must be a multiple of the resolution.
    pub fn run(&mut self, duration: f64) -> Result<(), KernelError> {
        if self.state != KernelState::Prepared {
            return Err(KernelError::KernelState(
                "run requires a prior call to prepare".to_string(),
            ));
        }
        if duration < 0.0 {
            return Err(KernelError::BadParameter(format!(
                "Cannot simulate a negative duration of {} ms",
                duration
            )));
        }
        let end = self.step + self.grid.ms_to_steps(duration)?;
        log::info!("Simulating from {} ms to {} ms", self.time(), self.grid.steps_to_ms(end));

        while self.step < end {
            let slice_end = self.origin + self.slice_steps;
            let until = slice_end.min(end);

            let covered = self
                .gap
                .as_ref()
                .map_or(false, |gap| gap.covers(self.step, slice_end));
            if self.step == self.origin || !covered {
                self.gap = GapState::compute(
                    &self.processes,
                    &self.synapses,
                    &self.config,
                    &self.grid,
                    self.step,
                    slice_end - self.step,
                );
                if let Some(gap) = self.gap.as_ref() {
                    self.wfr_iterations += gap.iterations() as u64;
                    log::trace!(
                        "Gap-junction trajectories from {} ms after {} iterations",
                        self.grid.steps_to_ms(gap.origin()),
                        gap.iterations()
                    );
                }
            }

            let steps = self.step..until;
            let grid = &self.grid;
            let gap = self.gap.as_ref();
            if self.processes.len() >= MIN_VPS_PAR {
                self.processes
                    .par_iter_mut()
                    .for_each(|process| process.update(steps.clone(), grid, gap));
            } else {
                self.processes
                    .iter_mut()
                    .for_each(|process| process.update(steps.clone(), grid, gap));
            }
            self.step = until;

            if self.step == slice_end {
                self.exchange();
                self.prune_archives();
                log::debug!(
                    "Completed slice [{}, {}) ms",
                    self.grid.steps_to_ms(slice_end - self.slice_steps),
                    self.grid.steps_to_ms(slice_end)
                );
                if self.config.use_structural_plasticity && self.step >= self.next_structural_step {
                    let interval = self
                        .grid
                        .ms_to_steps_nearest(self.config.structural_plasticity_update_interval)
                        .max(1);
                    self.update_structure()?;
                    self.next_structural_step = self.step + interval;
                    self.routing = Some(RoutingTable::build(&self.processes, &self.synapses));
                }
            }
        }
        log::info!("Simulation reached {} ms", self.time());
        Ok(())
    }

    /// Unfreeze the network. Spikes of an unfinished slice stay pending until the next run.
    pub fn cleanup(&mut self) -> Result<(), KernelError> {
        if self.state != KernelState::Prepared {
            return Err(KernelError::KernelState(
                "cleanup requires a prior call to prepare".to_string(),
            ));
        }
        self.state = KernelState::Configured;
        Ok(())
    }

    /// Prepare, run for `duration` ms and clean up.
    pub fn simulate(&mut self, duration: f64) -> Result<(), KernelError> {
        self.prepare()?;
        let result = self.run(duration);
        self.cleanup()?;
        result
    }

    /// Send the spikes of the outboxes along the connections and deliver them to their targets.
    /// The next slice starts at the current step.
    pub(crate) fn exchange(&mut self) {
        self.processes.iter_mut().for_each(|process| process.table.sort());
        let routing: &RoutingTable = self
            .routing
            .get_or_insert_with(|| RoutingTable::build(&self.processes, &self.synapses));

        let origin = self.origin;
        let vp_map = self.vp_map;
        let compressed = self.config.use_compressed_spikes;
        let outboxes: Vec<Vec<OutSpike>> = self
            .processes
            .iter_mut()
            .map(|process| std::mem::take(&mut process.outbox))
            .collect();
        let (buffers, pack_stats): (Vec<_>, Vec<_>) = outboxes
            .into_iter()
            .map(|outbox| pack(outbox, routing, &vp_map, origin, compressed))
            .unzip();
        let inboxes = all_to_all(buffers, &vp_map);

        let synapses = &self.synapses;
        let grid = &self.grid;
        let deliver_to = |process: &mut super::process::VirtualProcess| {
            deliver(process, &inboxes[vp_map.rank_of_vp(process.vp)], origin, synapses, grid)
        };
        let deliver_stats: Vec<DeliveryStats> = if self.processes.len() >= MIN_VPS_PAR {
            self.processes.par_iter_mut().map(deliver_to).collect()
        } else {
            self.processes.iter_mut().map(deliver_to).collect()
        };

        self.stats = total(&[self.stats, total(&pack_stats), total(&deliver_stats)]);
        self.origin = self.step;
    }

    /// Exchange the spikes of an unfinished slice, before the connections change.
    pub(super) fn flush_pending(&mut self) {
        if self.step > self.origin {
            log::debug!(
                "Exchanging the spikes of the unfinished slice starting at {} ms",
                self.grid.steps_to_ms(self.origin)
            );
            self.exchange();
        }
    }

    /// Forget archived spikes too old to affect any plastic connection.
    fn prune_archives(&mut self) {
        let tau_plus = (0..self.synapses.len())
            .filter_map(|id| self.synapses.get(id))
            .filter(|model| model.kind() == SynapseKind::Stdp)
            .map(|model| model.stdp().tau_plus)
            .fold(0.0, f64::max);
        let (_, max_delay) = self.delay_extrema();
        let max_delay = self.grid.steps_to_ms(max_delay);
        let now = self.time();
        for process in self.processes.iter_mut() {
            let tau_minus = process
                .nodes
                .iter()
                .map(|slot| slot.archive().tau_minus())
                .fold(tau_plus, f64::max);
            process.prune_archives(now - max_delay - ARCHIVE_HORIZON * tau_minus);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{KernelConfig, KernelStatusUpdate};
    use crate::connection::spec::{ConnSpec, SynSpec};
    use crate::core::{params, ParamDict};

    fn relay(config: KernelConfig) -> Kernel {
        let mut kernel = Kernel::with_config(config).unwrap();
        let generator = kernel.create("spike_generator", 1, &ParamDict::new()).unwrap();
        let parrot = kernel.create("parrot_neuron", 1, &ParamDict::new()).unwrap();
        let recorder = kernel.create("spike_recorder", 1, &ParamDict::new()).unwrap();
        kernel.set_spike_times(1, &[1.0, 2.5, 4.0], &[]).unwrap();
        kernel
            .connect(&generator, &parrot, &ConnSpec::one_to_one(), &SynSpec::default().delay(1.0))
            .unwrap();
        kernel
            .connect(&parrot, &recorder, &ConnSpec::one_to_one(), &SynSpec::default().delay(0.5))
            .unwrap();
        kernel
    }

    fn recorded_times(kernel: &Kernel) -> Vec<f64> {
        kernel.get_events(3).unwrap().iter().map(|event| event.time).collect()
    }

    #[test]
    fn test_slice_length_follows_min_delay() {
        let mut kernel = relay(KernelConfig::default());
        kernel.prepare().unwrap();
        assert_eq!(kernel.slice_steps, 5);
        kernel.cleanup().unwrap();

        let mut kernel = relay(KernelConfig {
            min_delay: Some(0.2),
            ..KernelConfig::default()
        });
        kernel.prepare().unwrap();
        assert_eq!(kernel.get_kernel_status().slice_length, 0.2);
        kernel.cleanup().unwrap();

        let clear = KernelStatusUpdate {
            min_delay: Some(None),
            ..KernelStatusUpdate::default()
        };
        kernel.set_kernel_status(&clear).unwrap();
        assert_eq!(kernel.config().min_delay, None);
        kernel.prepare().unwrap();
        assert_eq!(kernel.get_kernel_status().slice_length, 0.5);
    }

    #[test]
    fn test_relay_timing() {
        let mut kernel = relay(KernelConfig::default());
        kernel.simulate(10.0).unwrap();
        // the parrot fires at the arrival time, the recorder keeps the emission time
        let times = recorded_times(&kernel);
        assert_eq!(times.len(), 3);
        for (time, expected) in times.iter().zip([2.0, 3.5, 5.0]) {
            assert!((time - expected).abs() < 1e-12);
        }
        assert_eq!(kernel.time(), 10.0);
    }

    #[test]
    fn test_split_runs_match_single_run() {
        let mut single = relay(KernelConfig::default());
        single.simulate(10.0).unwrap();

        let mut split = relay(KernelConfig::default());
        split.prepare().unwrap();
        for duration in [0.3, 1.7, 2.2, 0.1, 5.7] {
            split.run(duration).unwrap();
        }
        split.cleanup().unwrap();
        assert_eq!(recorded_times(&single), recorded_times(&split));
    }

    #[test]
    fn test_lifecycle_errors() {
        let mut kernel = relay(KernelConfig::default());
        assert!(matches!(kernel.run(1.0), Err(KernelError::KernelState(_))));
        kernel.prepare().unwrap();
        assert!(matches!(kernel.run(0.05), Err(KernelError::BadParameter(_))));
        assert!(matches!(kernel.run(-1.0), Err(KernelError::BadParameter(_))));
        assert!(kernel.create("parrot_neuron", 1, &ParamDict::new()).is_err());
        let all = kernel.get_connections(&Default::default());
        assert!(kernel
            .set_connection_status(&[all[0].id], &params(&[("delay", 2.0)]))
            .is_err());
        assert!(kernel
            .set_connection_status(&[all[0].id], &params(&[("weight", 2.0)]))
            .is_ok());
        kernel.cleanup().unwrap();
        assert!(kernel.cleanup().is_err());
    }

    #[test]
    fn test_connect_between_runs_keeps_pending_spikes() {
        let mut kernel = relay(KernelConfig::default());
        kernel.simulate(2.3).unwrap();
        // the parrot spike at 2.0 ms is in flight to the first recorder
        let extra = kernel.create("spike_recorder", 1, &ParamDict::new()).unwrap();
        let parrot = crate::core::collection::NodeCollection::from_range(2, 2, 0);
        kernel
            .connect(&parrot, &extra, &ConnSpec::one_to_one(), &SynSpec::default().delay(0.5))
            .unwrap();
        kernel.simulate(7.7).unwrap();
        assert_eq!(recorded_times(&kernel).len(), 3);
        assert_eq!(kernel.get_events(4).unwrap().len(), 2);
    }
}
