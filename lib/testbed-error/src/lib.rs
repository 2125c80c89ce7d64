//! Errors raised while composing and starting a test environment.
//!
//! Failures the engine knows how to name (a bad version string, a build candidate missing from its manifest, two
//! services publishing one host port) are [`ProvisionError`] variants. Everything else, such as a failed `docker`
//! invocation or an unreadable compose file, travels as a [`GenericError`] carrying the file, URL or command involved.
#![deny(warnings)]
#![deny(missing_docs)]

use std::fmt::Display;

mod provision;
pub use self::provision::ProvisionError;

/// A failure outside the provisioning taxonomy, such as I/O, HTTP or a child process.
///
/// Rendered with `{:#}` or `{:?}`, it lists each step that was in progress, outermost first, down to the root cause.
pub type GenericError = anyhow::Error;

/// Builds a [`GenericError`] from a message, e.g. `generic_error!("No proxy named '{}'.", name)`.
///
/// A single non-literal argument is wrapped as-is, so an I/O or HTTP error keeps its causes.
#[macro_export]
macro_rules! generic_error {
    ($msg:literal $(,)?) => { $crate::_anyhow!($msg) };
    ($err:expr $(,)?) => { $crate::_anyhow!($err) };
    ($fmt:expr, $($arg:tt)*) => { $crate::_anyhow!($fmt, $($arg)*) };
}

#[doc(hidden)]
pub use anyhow::anyhow as _anyhow;

mod private {
    pub trait Sealed {}

    impl<T, E> Sealed for Result<T, E> {}
}

// Named apart from `snafu::ResultExt::context` so both traits can be imported by the same module.
/// Names the step that failed: which compose file was being written, which archive was being loaded.
pub trait ErrorContext<T, E>: private::Sealed {
    /// Wraps the error with a fixed description of the step.
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static;

    /// Wraps the error with a description formatted only on failure, for messages that embed paths or URLs.
    fn with_error_context<C, F>(self, f: F) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C;
}

impl<T, E> ErrorContext<T, E> for Result<T, E>
where
    Result<T, E>: anyhow::Context<T, E>,
{
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
    {
        <Self as anyhow::Context<T, E>>::context(self, context)
    }

    fn with_error_context<C, F>(self, f: F) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        <Self as anyhow::Context<T, E>>::with_context(self, f)
    }
}
