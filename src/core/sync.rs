//! Poisoned-lock handling for the std mutexes used by the registry, watcher
//! and transport internals
//!
//! A panic while a std lock is held poisons it; these helpers turn that into
//! the caller's error type instead of propagating the panic.

use std::sync::LockResult;

/// Convert a poisoned mutex lock into an application error
///
/// # Examples
/// ```
/// use std::sync::Mutex;
/// use plugwatch::core::sync::handle_mutex_poison;
/// use plugwatch::plugin::api::PluginError;
///
/// let mutex = Mutex::new(42);
/// let guard = handle_mutex_poison(mutex.lock(), |message| PluginError::Watch { message })
///     .unwrap();
/// assert_eq!(*guard, 42);
/// ```
pub fn handle_mutex_poison<T, E>(
    result: LockResult<T>,
    error_constructor: impl FnOnce(String) -> E,
) -> Result<T, E> {
    result.map_err(|poison_err| {
        error_constructor(
            format!(
                "internal synchronisation error (mutex poisoned, a panic occurred while holding the lock): {}",
                poison_err
            )
        )
    })
}
