//! Fixtures shared by the unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::config::Options;
use crate::hyperobject::{Monoid, ReducerKey};
use crate::worker::Runtime;

pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A fresh runtime; tests never share the default one.
pub(crate) fn runtime(nworkers: usize) -> Runtime {
    init_logging();
    Runtime::new(Options {
        nworkers,
        force_reduce: false,
    })
    .unwrap()
}

/// A synthetic key that never aliases a real view.
pub(crate) fn key(i: usize) -> ReducerKey {
    ReducerKey::from_addr(0x1000 + i * 64).unwrap()
}

type Hook = Box<dyn Fn() + Send + Sync>;

/// Integer addition that counts its reduce calls.
#[derive(Default)]
pub(crate) struct Sum {
    reduces: AtomicUsize,
    hook: Mutex<Option<Hook>>,
}

impl Sum {
    pub(crate) fn reduces(&self) -> usize {
        self.reduces.load(Ordering::SeqCst)
    }

    /// Runs `hook` after every reduce.
    pub(crate) fn on_reduce(&self, hook: Hook) {
        *self.hook.lock() = Some(hook);
    }
}

impl Monoid for Sum {
    type View = i64;

    fn identity(&self) -> i64 {
        0
    }

    fn reduce(&self, left: &mut i64, right: &mut i64) {
        *left += *right;
        self.reduces.fetch_add(1, Ordering::SeqCst);
        if let Some(hook) = self.hook.lock().as_ref() {
            hook();
        }
    }
}

/// List concatenation: not commutative, so operand order shows.
#[derive(Default)]
pub(crate) struct Strings {
    reduces: AtomicUsize,
}

impl Strings {
    pub(crate) fn reduces(&self) -> usize {
        self.reduces.load(Ordering::SeqCst)
    }
}

impl Monoid for Strings {
    type View = Vec<String>;

    fn identity(&self) -> Vec<String> {
        Vec::new()
    }

    fn reduce(&self, left: &mut Vec<String>, right: &mut Vec<String>) {
        left.append(right);
        self.reduces.fetch_add(1, Ordering::SeqCst);
    }
}
