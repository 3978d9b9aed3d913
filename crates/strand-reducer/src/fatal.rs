//! The sink for reducer bugs.

use std::panic::Location;

use crate::error::ReducerBug;
use crate::worker::Worker;

/// Reports a reducer bug and terminates.
///
/// The bug is logged through `log::error!` and then the process aborts.
/// Unit tests and builds with the `recoverable-bugs` feature panic with the
/// bug's message instead, so the failure can be caught.
#[cold]
#[inline(never)]
#[track_caller]
pub fn fatal(w: Option<&Worker>, bug: ReducerBug) -> ! {
    let location = Location::caller();
    match w {
        Some(w) => log::error!("worker {}: {} ({})", w.id(), bug, location),
        None => log::error!("{} ({})", bug, location),
    }

    if cfg!(any(test, feature = "recoverable-bugs")) {
        panic!("{bug}");
    }

    eprintln!(
        "{}: strand: fatal reducer error on worker {:?}: {}",
        location,
        w.map(Worker::id),
        bug
    );
    std::process::abort()
}

/// Consistency check that only runs with debug assertions.
macro_rules! rt_assert {
    ($w:expr, $cond:expr, $bug:expr) => {
        if cfg!(debug_assertions) && !$cond {
            $crate::fatal::fatal($w, $bug)
        }
    };
}

pub(crate) use rt_assert;
