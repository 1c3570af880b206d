//! Training side of the jet pipeline: the classifier, the training loop over
//! the `jetstream` batch stream and the diagnostic plot.
//!
//! The global allocator (mimalloc) is installed by `jetstream`.

pub mod model;
pub mod plot;
pub mod training;
