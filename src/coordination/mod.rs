//! Ordering and dispatch of queued requests
//!
//! 1. The dependency graph releases requests once their predecessor is out
//! 2. The sequencer stores requests and exposes the released queue
//! 3. The engine pops released requests and sends them in order

pub mod dependency;
pub mod engine;
pub mod sequencer;

pub use dependency::{DependencyGraph, Released, SelfLoop};
pub use engine::DeliveryEngine;
pub use sequencer::Sequencer;
