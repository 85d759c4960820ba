//! The spike recorder, the recording sink of the kernel.
use serde::{Deserialize, Serialize};

use super::{Dynamics, Emission, StepContext};
use crate::core::time::TimeGrid;
use crate::core::{KernelRng, ParamDict};
use crate::error::KernelError;
use crate::nodes::buffer::InEvent;

/// A spike as seen by a recorder.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct RecordedSpike {
    /// The ID of the node that emitted the spike.
    pub sender: u64,
    /// The emission time in ms.
    pub time: f64,
    /// The step of the emission time.
    pub step: i64,
    /// The offset of the emission time, zero for grid-constrained senders.
    pub offset: f64,
    pub multiplicity: u32,
}

/// Records the spikes of the nodes connected to it, in delivery order.
///
/// Only spikes emitted in the window `(start, stop]` are kept.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct SpikeRecorder {
    start: f64,
    stop: f64,
    events: Vec<RecordedSpike>,
    #[serde(skip)]
    received: Vec<InEvent>,
}

impl Default for SpikeRecorder {
    fn default() -> Self {
        SpikeRecorder {
            start: 0.0,
            stop: f64::INFINITY,
            events: Vec::new(),
            received: Vec::new(),
        }
    }
}

impl SpikeRecorder {
    /// Returns the recorded spikes.
    pub fn events(&self) -> &[RecordedSpike] {
        &self.events
    }

    /// Returns the number of recorded spikes, counting multiplicities.
    pub fn num_spikes(&self) -> u64 {
        self.events.iter().map(|e| e.multiplicity as u64).sum()
    }

    /// Forget every recorded spike.
    pub fn clear(&mut self) {
        self.events.clear();
    }
}

impl Dynamics for SpikeRecorder {
    fn handle(&mut self, event: &InEvent) {
        self.received.push(event.clone());
    }

    fn update(&mut self, ctx: &StepContext, _rng: &mut KernelRng, _emitted: &mut Vec<Emission>) {
        for event in self.received.drain(..) {
            let emission = event.emission(ctx.step);
            let time = emission.to_ms(ctx.grid);
            if time > self.start && time <= self.stop {
                self.events.push(RecordedSpike {
                    sender: event.sender,
                    time,
                    step: emission.step,
                    offset: emission.offset,
                    multiplicity: event.multiplicity,
                });
            }
        }
    }

    fn get_status(&self) -> ParamDict {
        crate::core::params(&[
            ("start", self.start),
            ("stop", self.stop),
            ("n_events", self.events.len() as f64),
        ])
    }

    fn set_status(&mut self, params: &ParamDict, _grid: &TimeGrid) -> Result<(), KernelError> {
        let (mut start, mut stop) = (self.start, self.stop);
        let mut clear = false;
        for (key, value) in params.iter() {
            match key.as_str() {
                "start" => start = *value,
                "stop" => stop = *value,
                "n_events" if *value == 0.0 => clear = true,
                _ => {
                    return Err(KernelError::BadProperty(format!(
                        "Unknown or read-only property {} of spike_recorder",
                        key
                    )))
                }
            }
        }
        if stop < start {
            return Err(KernelError::BadProperty(
                "stop must not be earlier than start".to_string(),
            ));
        }
        self.start = start;
        self.stop = stop;
        if clear {
            self.clear();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{params, stream_rng};

    #[test]
    fn test_records_emission_times() {
        let grid = TimeGrid::default();
        let mut rng = stream_rng(0, 1);
        let mut recorder = SpikeRecorder::default();
        recorder.handle(&InEvent {
            sender: 3,
            weight: 1.0,
            multiplicity: 2,
            offset: 0.0,
            delay_steps: 10,
            receptor: 0,
        });
        recorder.handle(&InEvent {
            sender: 4,
            weight: 1.0,
            multiplicity: 1,
            offset: 0.04,
            delay_steps: 10,
            receptor: 0,
        });
        let ctx = StepContext {
            step: 14,
            grid: &grid,
            gap: None,
        };
        let mut emitted = vec![];
        recorder.update(&ctx, &mut rng, &mut emitted);

        let events = recorder.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].step, 5);
        assert!((events[0].time - 0.5).abs() < 1e-12);
        assert_eq!(events[1].step, 4);
        assert!((events[1].time - 0.44).abs() < 1e-12);
        assert_eq!(recorder.num_spikes(), 3);
        assert!(emitted.is_empty());

        recorder
            .set_status(&params(&[("n_events", 0.0)]), &grid)
            .unwrap();
        assert!(recorder.events().is_empty());
    }
}
