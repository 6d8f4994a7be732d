//! Controller implementations for raybots agents.
//!
//! The simulation core only knows the [`raybots_core::BrainRunner`] trait;
//! this crate supplies the baseline fully connected controller plus the
//! factory glue used to spawn a fresh one per agent at every generation
//! boundary.

mod feedforward;

pub use feedforward::{DenseLayer, FeedforwardBrain, FeedforwardError, FeedforwardSpec};

use raybots_core::{BrainFactory, ControllerSettings};
use std::sync::Arc;

/// Builds a brain factory producing randomly initialized feedforward
/// controllers for the given sensor size.
///
/// The topology is validated once here; the returned factory itself cannot
/// fail.
pub fn feedforward_factory(
    input_size: usize,
    settings: &ControllerSettings,
) -> Result<BrainFactory, FeedforwardError> {
    let spec = FeedforwardSpec::from_settings(input_size, settings)?;
    Ok(Box::new(move |rng| {
        Arc::new(FeedforwardBrain::random(&spec, rng))
    }))
}
