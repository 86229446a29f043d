//! Ядро симуляции

mod event;
mod priority;
mod scheduler;
mod time;

pub use event::{Event, EventContext, EventInstance, EventRef, Handler, HandlerId};
pub use priority::{Priority, PriorityClass};
pub use scheduler::{ControlFlags, EventToken, Scheduler};
pub use time::{Duration, SimTime};
