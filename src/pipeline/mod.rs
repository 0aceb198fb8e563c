//! The three-step-per-table compression pipeline and its orchestrator.
//!
//! Each r-table flows through: prune + line-point generation (`step_one`),
//! bucket sort + reverse-map emission (`step_two`), and map unpacking
//! (`step_three`). `orchestrator::Phase3` owns the buffers, sequences the
//! steps over tables 2..=7 and carries each table's unpacked map into the
//! next iteration. `distributor` is the shared prefix-sum scatter primitive.

pub mod distributor;
pub mod orchestrator;
pub mod step_one;
pub mod step_three;
pub mod step_two;

#[cfg(test)]
mod phase_tests;
