//! Drivers built on the periodic-orbit functional: Newton's method for a
//! single orbit and pseudo-arclength continuation of a branch of orbits.

pub mod newton;
pub mod periodic;
pub mod types;

pub use newton::solve_periodic_orbit;
pub use periodic::continue_periodic_orbit;
pub use types::{
    ContinuationSettings, LinearStrategy, NewtonSettings, PeriodicBranch, PeriodicBranchPoint,
    PeriodicNewtonResult, TrapezoidConfig,
};
