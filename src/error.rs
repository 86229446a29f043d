//! Типы ошибок для симуляции

use thiserror::Error;

use crate::model::RunState;

#[derive(Error, Debug)]
pub enum SimError {
    #[error("Simulation error: {0}")]
    SimulationError(String),

    #[error("Invalid event time {0}: time must be a finite number")]
    InvalidTime(f64),

    #[error("Event time {time} is not after the current time {now}")]
    TimeNotInFuture { time: f64, now: f64 },

    #[error("Invalid priority value: NaN is not an ordered priority")]
    InvalidPriority,

    #[error("No events in the queue")]
    EmptyQueue,

    #[error("Immediate event scheduled from within immediate-event processing")]
    ImmediateRecursion,

    #[error("Immediate event scheduled outside of event processing")]
    ImmediateOutsideProcessing,

    #[error("Entity '{0}' is already bound to a model")]
    AlreadyBound(String),

    #[error("Entity with id '{0}' already exists in the model")]
    DuplicateEntity(String),

    #[error("Cannot start a run from state {from:?}")]
    InvalidTransition { from: RunState },

    #[error("Seed source has no base seed yet")]
    SeedSourceUninitialized,

    #[error("Snapshot has no value for key '{0}'")]
    MissingSnapshotKey(String),

    #[error("Snapshot refers to unknown event '{0}'")]
    UnknownEvent(String),

    #[error("Snapshot value error: {0}")]
    Snapshot(#[from] serde_json::Error),

    #[error("Snapshot encode error: {0}")]
    SnapshotEncode(#[from] ron::Error),

    #[error("Snapshot decode error: {0}")]
    SnapshotDecode(#[from] ron::error::SpannedError),

    #[error("Handler error: {0}")]
    Handler(anyhow::Error),
}

impl From<String> for SimError {
    fn from(s: String) -> Self {
        SimError::SimulationError(s)
    }
}

impl From<&str> for SimError {
    fn from(s: &str) -> Self {
        SimError::SimulationError(s.to_string())
    }
}
