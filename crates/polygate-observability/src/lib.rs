//! Telemetry for the polygate gateway
//!
//! Cost and error tracking both rate against the shared request counter in
//! `counter`; neither reads from the other, which keeps the dependency
//! graph acyclic. Recent-record history uses fixed-capacity ring buffers;
//! snapshot getters deep-copy so callers never alias live state.

pub mod cost;
pub mod counter;
pub mod errors;
pub mod health;
pub mod ring;
pub mod tracing_init;

pub use cost::{CostRecord, CostSnapshot, CostTracker};
pub use counter::RequestCounter;
pub use errors::{ErrorRecord, ErrorSnapshot, ErrorTracker};
pub use health::{ReadinessCheck, ReadinessReport};
pub use ring::RingBuffer;
pub use tracing_init::init_tracing;
