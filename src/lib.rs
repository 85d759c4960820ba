//! This crate provides a reproducible, parallel discrete-event simulation kernel for networks of
//! spiking point neurons.
//!
//! Nodes are distributed over virtual processes (VPs), connections are generated from declarative
//! rules, and time advances in slices bounded by the smallest connection delay, spikes being
//! exchanged between VPs at slice boundaries. For a fixed seed and total number of VPs, the
//! connections and the recorded spikes do not depend on how VPs are split into ranks and threads.
//!
//! # Building and Simulating a Network
//!
//! ```rust
//! use rusty_snn_kernel::config::KernelConfig;
//! use rusty_snn_kernel::connection::spec::{ConnSpec, SynSpec};
//! use rusty_snn_kernel::core::{params, ParamDict};
//! use rusty_snn_kernel::kernel::Kernel;
//!
//! let mut kernel = Kernel::with_config(KernelConfig {
//!     total_num_virtual_procs: 2,
//!     ..KernelConfig::default()
//! })
//! .unwrap();
//!
//! // A Poisson source driving 10 neurons, all observed by a spike recorder
//! let source = kernel.create("poisson_generator", 1, &params(&[("rate", 8000.0)])).unwrap();
//! let neurons = kernel.create("iaf_psc_delta", 10, &ParamDict::new()).unwrap();
//! let recorder = kernel.create("spike_recorder", 1, &ParamDict::new()).unwrap();
//!
//! kernel
//!     .connect(&source, &neurons, &ConnSpec::all_to_all(), &SynSpec::default().weight(20.0))
//!     .unwrap();
//! kernel
//!     .connect(&neurons, &neurons, &ConnSpec::fixed_indegree(3), &SynSpec::default().delay(1.5))
//!     .unwrap();
//! kernel
//!     .connect(&neurons, &recorder, &ConnSpec::all_to_all(), &SynSpec::default())
//!     .unwrap();
//! assert_eq!(kernel.num_connections(), 10 + 30 + 10);
//!
//! kernel.simulate(100.0).unwrap();
//! let events = kernel.get_events(recorder.get(0).unwrap()).unwrap();
//! assert!(!events.is_empty());
//! assert!(events.iter().all(|event| event.time <= 100.0));
//! ```
//!
//! # Modules
//!
//! - [`kernel`]: the simulation context, its lifecycle, the scheduler and the spike exchange
//! - [`connection`]: connection rules, storage and queries
//! - [`synapse`]: synapse models and per-connection state
//! - [`nodes`]: the built-in node models
//! - [`core`]: time grid, VP map, node collections, spatial layers and parameters
//! - [`config`]: kernel settings

pub mod config;
pub mod connection;
pub mod core;
pub mod error;
pub mod kernel;
pub mod nodes;
pub mod synapse;

/// The minimum number of virtual processes for them to be processed in parallel.
pub const MIN_VPS_PAR: usize = 2;
