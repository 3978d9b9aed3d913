use std::fmt;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU32, Ordering};

/// Identity of a runtime's memory context.
///
/// Two pools with equal contexts may exchange blocks. Ids are issued from a
/// process-wide counter and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(NonZeroU32);

static NEXT_CONTEXT: AtomicU32 = AtomicU32::new(1);

impl ContextId {
    /// Issues a fresh context id.
    pub fn next() -> Self {
        let mut current = NEXT_CONTEXT.load(Ordering::Relaxed);
        loop {
            let Some(id) = NonZeroU32::new(current) else {
                exhausted();
            };
            let Some(next) = current.checked_add(1) else {
                exhausted();
            };
            match NEXT_CONTEXT.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Self(id),
                Err(actual) => current = actual,
            }
        }
    }

    pub fn get(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

#[cold]
fn exhausted() -> ! {
    log::error!("memory context ids exhausted");
    eprintln!("strand-alloc: memory context ids exhausted");
    std::process::abort()
}
