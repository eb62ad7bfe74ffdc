//! Vector-add offload routine.
//!
//! Adds two unified-memory vectors on the device (`Y[i] = X[i] + Y[i]`) and
//! times the whole allocate, initialize, launch, synchronize and free
//! sequence on the host.

mod kernel;
mod routine;

pub use kernel::VectorAdd;
pub use routine::{
    run, run_and_collect, Verification, VectorAddOptions, VectorAddReport, DEFAULT_LEN,
    DEFAULT_SYNC_TIMEOUT, EXPECTED_VALUE, X_INIT, Y_INIT,
};
