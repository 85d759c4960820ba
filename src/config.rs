//! Kernel configuration.
//!
//! [`KernelConfig`] holds every global setting of the kernel. It can be persisted as JSON and is
//! modified at run time through partial [`KernelStatusUpdate`]s, which the kernel validates
//! against its lifecycle state before applying them.
use serde::{Deserialize, Deserializer, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use crate::core::time::TimeGrid;
use crate::core::vp::VpMap;
use crate::error::KernelError;

/// Default seed of the random number generators.
pub const DEFAULT_RNG_SEED: u64 = 143202461;

/// Global settings of the kernel.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// The simulation resolution (step size) in ms.
    pub resolution: f64,
    /// The number of tics per ms, i.e., the finest representable time.
    pub tics_per_ms: f64,
    /// The total number of virtual processes.
    pub total_num_virtual_procs: usize,
    /// The number of ranks the virtual processes are spread over.
    pub num_ranks: usize,
    /// A user-imposed lower bound on every synaptic delay in ms.
    pub min_delay: Option<f64>,
    /// A user-imposed upper bound on every synaptic delay in ms.
    pub max_delay: Option<f64>,
    /// Whether delays which are not multiple of the resolution are rounded instead of rejected.
    pub allow_offgrid_delays: bool,
    /// Whether waveform relaxation is used for delay-less (gap junction) couplings.
    pub use_wfr: bool,
    /// The communication interval of the waveform relaxation in ms.
    pub wfr_comm_interval: f64,
    /// The convergence tolerance of the waveform relaxation.
    pub wfr_tol: f64,
    /// The maximum number of waveform relaxation iterations per slice.
    pub wfr_max_iterations: usize,
    /// The seed of all random number generators.
    pub rng_seed: u64,
    /// Whether spikes are grouped per (source, target thread, synapse model) on the wire.
    pub use_compressed_spikes: bool,
    /// Whether structural plasticity creates and deletes connections during the simulation.
    pub use_structural_plasticity: bool,
    /// The interval in ms between two structural plasticity updates.
    pub structural_plasticity_update_interval: f64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        KernelConfig {
            resolution: 0.1,
            tics_per_ms: 1000.0,
            total_num_virtual_procs: 1,
            num_ranks: 1,
            min_delay: None,
            max_delay: None,
            allow_offgrid_delays: false,
            use_wfr: true,
            wfr_comm_interval: 1.0,
            wfr_tol: 1e-4,
            wfr_max_iterations: 15,
            rng_seed: DEFAULT_RNG_SEED,
            use_compressed_spikes: true,
            use_structural_plasticity: false,
            structural_plasticity_update_interval: 100.0,
        }
    }
}

impl KernelConfig {
    /// Returns the time grid described by the configuration.
    pub fn time_grid(&self) -> Result<TimeGrid, KernelError> {
        TimeGrid::build(self.resolution, self.tics_per_ms)
    }

    /// Returns the virtual process layout described by the configuration.
    pub fn vp_map(&self) -> Result<VpMap, KernelError> {
        VpMap::from_total(self.total_num_virtual_procs, self.num_ranks)
    }

    /// Aligns the dependent settings: without waveform relaxation, the communication interval
    /// is the resolution.
    pub fn normalize(&mut self) {
        if !self.use_wfr {
            self.wfr_comm_interval = self.resolution;
        }
    }

    /// Checks the consistency of the configuration, independently of the kernel state.
    pub fn validate(&self) -> Result<(), KernelError> {
        let grid = self.time_grid()?;
        self.vp_map()?;
        if let Some(min_delay) = self.min_delay {
            grid.delay_to_steps(min_delay, self.allow_offgrid_delays)?;
        }
        if let Some(max_delay) = self.max_delay {
            grid.delay_to_steps(max_delay, self.allow_offgrid_delays)?;
        }
        if let (Some(min_delay), Some(max_delay)) = (self.min_delay, self.max_delay) {
            if min_delay > max_delay {
                return Err(KernelError::BadDelay(format!(
                    "min_delay ({}) must not exceed max_delay ({})",
                    min_delay, max_delay
                )));
            }
        }
        if self.use_wfr && !(self.wfr_comm_interval >= grid.resolution()) {
            return Err(KernelError::BadParameter(format!(
                "wfr_comm_interval ({}) must not be smaller than the resolution ({})",
                self.wfr_comm_interval,
                grid.resolution()
            )));
        }
        if !(self.wfr_tol > 0.0) {
            return Err(KernelError::BadParameter(
                "wfr_tol must be positive".to_string(),
            ));
        }
        if self.wfr_max_iterations == 0 {
            return Err(KernelError::BadParameter(
                "wfr_max_iterations must be positive".to_string(),
            ));
        }
        if !(self.structural_plasticity_update_interval > 0.0) {
            return Err(KernelError::BadParameter(
                "structural_plasticity_update_interval must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Save the configuration to a JSON file.
    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> Result<(), KernelError> {
        let file = File::create(path).map_err(|e| KernelError::IOError(e.to_string()))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self)
            .map_err(|e| KernelError::IOError(e.to_string()))?;
        writer.flush().map_err(|e| KernelError::IOError(e.to_string()))
    }

    /// Load a configuration from a JSON file. Missing keys take their default value.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, KernelError> {
        let file = File::open(path).map_err(|e| KernelError::IOError(e.to_string()))?;
        let reader = BufReader::new(file);
        let mut config: KernelConfig =
            serde_json::from_reader(reader).map_err(|e| KernelError::IOError(e.to_string()))?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }
}

/// Reads a present field as `Some`, so that an explicit `null` becomes `Some(None)`.
fn present<'de, D>(deserializer: D) -> Result<Option<Option<f64>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<f64>::deserialize(deserializer).map(Some)
}

/// A partial update of the kernel configuration. Unset fields are left unchanged.
///
/// The delay bounds are cleared with `Some(None)`, or `null` in JSON.
#[derive(Debug, PartialEq, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelStatusUpdate {
    pub resolution: Option<f64>,
    pub tics_per_ms: Option<f64>,
    pub total_num_virtual_procs: Option<usize>,
    pub num_ranks: Option<usize>,
    #[serde(deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub min_delay: Option<Option<f64>>,
    #[serde(deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub max_delay: Option<Option<f64>>,
    pub allow_offgrid_delays: Option<bool>,
    pub use_wfr: Option<bool>,
    pub wfr_comm_interval: Option<f64>,
    pub wfr_tol: Option<f64>,
    pub wfr_max_iterations: Option<usize>,
    pub rng_seed: Option<u64>,
    pub use_compressed_spikes: Option<bool>,
    pub use_structural_plasticity: Option<bool>,
    pub structural_plasticity_update_interval: Option<f64>,
}

impl KernelStatusUpdate {
    /// Returns true if the update changes the time grid.
    pub fn changes_tick_base(&self) -> bool {
        self.resolution.is_some() || self.tics_per_ms.is_some()
    }

    /// Returns true if the update changes the virtual process layout.
    pub fn changes_vp_layout(&self) -> bool {
        self.total_num_virtual_procs.is_some() || self.num_ranks.is_some()
    }

    /// Returns a copy of the configuration with the update applied, without any state check.
    ///
    /// While waveform relaxation is disabled, the communication interval follows the resolution.
    pub fn apply_to(&self, config: &KernelConfig) -> KernelConfig {
        let mut new = config.clone();
        if let Some(resolution) = self.resolution {
            new.resolution = resolution;
        }
        if let Some(tics_per_ms) = self.tics_per_ms {
            new.tics_per_ms = tics_per_ms;
        }
        if let Some(total) = self.total_num_virtual_procs {
            new.total_num_virtual_procs = total;
        }
        if let Some(num_ranks) = self.num_ranks {
            new.num_ranks = num_ranks;
        }
        if let Some(min_delay) = self.min_delay {
            new.min_delay = min_delay;
        }
        if let Some(max_delay) = self.max_delay {
            new.max_delay = max_delay;
        }
        if let Some(allow) = self.allow_offgrid_delays {
            new.allow_offgrid_delays = allow;
        }
        if let Some(use_wfr) = self.use_wfr {
            new.use_wfr = use_wfr;
        }
        if let Some(interval) = self.wfr_comm_interval {
            new.wfr_comm_interval = interval;
        }
        if let Some(tol) = self.wfr_tol {
            new.wfr_tol = tol;
        }
        if let Some(max_iterations) = self.wfr_max_iterations {
            new.wfr_max_iterations = max_iterations;
        }
        if let Some(seed) = self.rng_seed {
            new.rng_seed = seed;
        }
        if let Some(compressed) = self.use_compressed_spikes {
            new.use_compressed_spikes = compressed;
        }
        if let Some(enabled) = self.use_structural_plasticity {
            new.use_structural_plasticity = enabled;
        }
        if let Some(interval) = self.structural_plasticity_update_interval {
            new.structural_plasticity_update_interval = interval;
        }
        new.normalize();
        new
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_is_valid() {
        assert!(KernelConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_configs() {
        let config = KernelConfig {
            total_num_virtual_procs: 3,
            num_ranks: 2,
            ..KernelConfig::default()
        };
        assert!(config.validate().is_err());

        let config = KernelConfig {
            wfr_comm_interval: 0.05,
            ..KernelConfig::default()
        };
        assert!(config.validate().is_err());

        let config = KernelConfig {
            min_delay: Some(2.0),
            max_delay: Some(1.0),
            ..KernelConfig::default()
        };
        assert!(matches!(config.validate(), Err(KernelError::BadDelay(_))));
    }

    #[test]
    fn test_comm_interval_follows_resolution_without_wfr() {
        let config = KernelConfig {
            use_wfr: false,
            wfr_comm_interval: 0.1,
            ..KernelConfig::default()
        };
        let update = KernelStatusUpdate {
            resolution: Some(0.5),
            ..KernelStatusUpdate::default()
        };
        assert_eq!(update.apply_to(&config).wfr_comm_interval, 0.5);

        let config = KernelConfig::default();
        assert_eq!(update.apply_to(&config).wfr_comm_interval, 1.0);
    }

    #[test]
    fn test_normalize_ignores_comm_interval_without_wfr() {
        let mut config = KernelConfig {
            resolution: 2.0,
            use_wfr: false,
            ..KernelConfig::default()
        };
        assert!(config.validate().is_ok());
        config.normalize();
        assert_eq!(config.wfr_comm_interval, 2.0);

        let mut config = KernelConfig {
            resolution: 2.0,
            ..KernelConfig::default()
        };
        config.normalize();
        assert_eq!(config.wfr_comm_interval, 1.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_delay_bounds_can_be_cleared() {
        let config = KernelConfig {
            min_delay: Some(0.5),
            max_delay: Some(4.0),
            ..KernelConfig::default()
        };
        let clear = KernelStatusUpdate {
            min_delay: Some(None),
            ..KernelStatusUpdate::default()
        };
        let cleared = clear.apply_to(&config);
        assert_eq!(cleared.min_delay, None);
        assert_eq!(cleared.max_delay, Some(4.0));

        let unchanged = KernelStatusUpdate::default().apply_to(&config);
        assert_eq!(unchanged.min_delay, Some(0.5));

        let update: KernelStatusUpdate =
            serde_json::from_str(r#"{"max_delay": null, "min_delay": 0.2}"#).unwrap();
        assert_eq!(update.max_delay, Some(None));
        assert_eq!(update.min_delay, Some(Some(0.2)));
        let update: KernelStatusUpdate = serde_json::from_str("{}").unwrap();
        assert_eq!(update.max_delay, None);
    }

    #[test]
    fn test_save_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("kernel.json");

        let config = KernelConfig {
            resolution: 0.01,
            total_num_virtual_procs: 4,
            num_ranks: 2,
            rng_seed: 12345,
            ..KernelConfig::default()
        };
        config.save_to(&path).unwrap();
        assert_eq!(KernelConfig::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_load_normalizes_comm_interval() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("kernel.json");
        std::fs::write(&path, r#"{"resolution": 2.0, "use_wfr": false}"#).unwrap();
        let config = KernelConfig::load_from(&path).unwrap();
        assert_eq!(config.wfr_comm_interval, 2.0);
    }

    #[test]
    fn test_load_partial() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("kernel.json");
        std::fs::write(&path, r#"{"resolution": 0.5, "wfr_comm_interval": 1.0}"#).unwrap();
        let config = KernelConfig::load_from(&path).unwrap();
        assert_eq!(config.resolution, 0.5);
        assert_eq!(config.tics_per_ms, 1000.0);
    }
}
