//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Structured logging adapters and sinks."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Context-carrying wrappers around `tracing::event!`.

#[doc(hidden)]
#[macro_export]
macro_rules! __deck_event {
    ($level:expr, $ctx:expr, $($arg:tt)+) => {{
        let ctx = &$ctx;
        tracing::event!(
            $level,
            user = ctx.user.unwrap_or(""),
            operation = ctx.operation.unwrap_or(""),
            seq = ctx.seq.unwrap_or_default(),
            state = ctx.state.unwrap_or(""),
            message = %format_args!($($arg)+)
        );
    }};
}

/// Emit an informational log enriched with lifecycle context.
#[macro_export]
macro_rules! deck_info {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__deck_event!(tracing::Level::INFO, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__deck_event!(tracing::Level::INFO, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit a debug log enriched with lifecycle context.
#[macro_export]
macro_rules! deck_debug {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__deck_event!(tracing::Level::DEBUG, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__deck_event!(tracing::Level::DEBUG, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit a warning enriched with lifecycle context.
#[macro_export]
macro_rules! deck_warn {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__deck_event!(tracing::Level::WARN, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__deck_event!(tracing::Level::WARN, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit an error log enriched with lifecycle context.
#[macro_export]
macro_rules! deck_error {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__deck_event!(tracing::Level::ERROR, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__deck_event!(tracing::Level::ERROR, $crate::LogContext::default(), $($arg)+)
    };
}
