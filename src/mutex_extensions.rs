use std::sync::LockResult;

use tracing::warn;

pub trait IgnorePoisoned<T> {
    fn ignore_poisoned(self) -> T;
}

impl<T> IgnorePoisoned<T> for LockResult<T> {
    /// Takes the guard even if a previous holder panicked.
    fn ignore_poisoned(self) -> T {
        self.unwrap_or_else(|poisoned| {
            warn!("Mutex poisoned by a panicking holder, recovering.");
            poisoned.into_inner()
        })
    }
}
