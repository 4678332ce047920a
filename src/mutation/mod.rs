//! Mutations: side-effecting calls with merge, concat or switch
//! coordination of overlapping submissions.

mod runner;
mod state;

pub use runner::{MutationFn, MutationOptions, MutationRunner};
pub use state::{MapOperator, MutationState, MutationStatus};
