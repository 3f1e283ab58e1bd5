//! Generic error handling utilities
//!
//! Lets the binary report fatal errors from any subsystem the same way: a
//! short user-facing line at error level, and the full detail at debug level.

/// Trait for errors that can distinguish between user-actionable and system errors
///
/// When `is_user_actionable()` returns `true`, `user_message()` should return
/// `Some(message)` with a message the user can act on. Otherwise it returns
/// `None` and the caller falls back to a generic operation context.
pub trait ContextualError: std::error::Error {
    /// True for errors the user can fix directly, such as a bad config value
    /// or an unreadable plugin root. Transport failures and timeouts are
    /// system errors.
    fn is_user_actionable(&self) -> bool;

    /// The message to show when `is_user_actionable()` is true
    fn user_message(&self) -> Option<String>;
}

/// Log errors with appropriate detail level based on error specificity
///
/// # Examples
/// ```rust,no_run
/// # use plugwatch::core::error_handling::log_error_with_context;
/// # use plugwatch::app::cli::config::ConfigError;
/// let err = ConfigError::Invalid {
///     key: "poll-interval".to_string(),
///     message: "must be greater than zero".to_string(),
/// };
/// log_error_with_context(&err, "Loading configuration");
/// // Logs: "FATAL: poll-interval: must be greater than zero"
/// ```
pub fn log_error_with_context<E: ContextualError + std::fmt::Display + std::fmt::Debug>(
    error: &E,
    operation_context: &str,
) {
    match error.user_message() {
        Some(user_msg) if error.is_user_actionable() => log::error!("FATAL: {}", user_msg),
        _ => log::error!("FATAL: {}", operation_context),
    }
    log::debug!("DETAIL: {}", error);
    log::debug!("DEBUG_DETAILS: {:?}", error);
}
