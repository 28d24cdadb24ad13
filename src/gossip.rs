//! Random peer sampling.
//!
//! Each node keeps a small partial view of the network and periodically
//! swaps halves of it with one random partner. Over repeated exchanges the
//! views converge on uniformly random samples of the whole mesh, which is
//! what the media layer draws its download sources from.

mod descriptor;
mod engine;

pub use descriptor::{Descriptor, View};
pub use engine::{gen_buffer, merge_view, select_remote, ExchangeRole, RpsEngine};

#[cfg(test)]
mod tests;
