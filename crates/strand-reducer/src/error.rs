use thiserror::Error;

use crate::worker::WorkerId;

const UNSYNCED_REDUCER: &str = "destroying a reducer that is still visible to unsynced child tasks, \
or unregistering a reducer that was never registered";

/// Misuse of the reducer subsystem detected at run time.
///
/// None of these are recoverable in production: they are handed to
/// [`crate::fatal::fatal`], which terminates the process.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReducerBug {
    #[error("reducer registered twice")]
    DoubleRegistration,

    #[error("{}", UNSYNCED_REDUCER)]
    UnsyncedReducer,

    #[error("hyperobject used by another hyperobject")]
    HyperobjectInUse,

    #[error("TLS reducer race")]
    ReducerRace,

    #[error("reference to unregistered hyperobject")]
    InvalidReducerId,

    #[error("reducer ids exhausted")]
    IdsExhausted,

    #[error("reducer map used with a worker from another runtime context")]
    PoolContextMismatch,

    #[error("reducer map is inconsistent: {0}")]
    MapCorrupted(&'static str),

    #[error("the leftmost reducer map cannot be merged into another map")]
    LeftmostMerge,

    #[error("reducer view alignment of {0} bytes exceeds the pool block alignment")]
    ViewAlignment(usize),

    #[error("worker {0} is already bound to another thread")]
    WorkerBusy(WorkerId),
}

/// Invalid runtime options.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}")]
    InvalidValue { var: &'static str, value: String },

    #[error("a runtime needs at least one worker")]
    ZeroWorkers,

    #[error("force_reduce requires exactly one worker, got {0}")]
    ForceReduceNeedsSingleWorker(usize),
}

/// Errors returned by the runtime API.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("worker {0} does not exist")]
    NoSuchWorker(WorkerId),

    #[error("worker {0} is already bound to a thread")]
    WorkerBusy(WorkerId),
}
