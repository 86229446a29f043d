//! simcore-rs - Ядро дискретно-событийного моделирования на Rust

pub mod core;
pub mod error;
pub mod model;
pub mod persist;
pub mod random;
pub mod resources;

pub use error::SimError;
pub use model::Model;

pub mod prelude {
    pub use crate::core::{
        Duration, Event, EventContext, EventInstance, Priority, PriorityClass, Scheduler, SimTime,
    };
    pub use crate::model::{Entity, EntityParams, Model, RunState};
    pub use crate::persist::Snapshot;
    pub use crate::random::{RandomConsumer, SeedSource};
    pub use crate::SimError;
}
