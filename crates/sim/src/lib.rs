//! `plantwire-sim`: deterministic plant simulation.
//!
//! Everything here is synchronous and takes its randomness from an injected
//! RNG, so a seeded run reproduces exactly. The async workers in
//! `plantwire-infra` own one instance of each model per machine.

pub mod fault;
pub mod machine;
pub mod patterns;
pub mod signal;
pub mod window;

pub use fault::{FaultEngine, FaultSettings, FaultState, Injection};
pub use machine::{MachineSettings, MachineStateModel, MachineTick, ShiftCalendar, ShiftWindow, Transition};
pub use patterns::{Direction, Participants, PatternSpec, eligible_patterns, pattern};
pub use window::{AnomalyScorer, StatWindow};
