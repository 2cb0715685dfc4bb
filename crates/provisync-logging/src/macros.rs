//! ---
//! ps_section: "03-persistence-logging"
//! ps_subsection: "module"
//! ps_type: "source"
//! ps_scope: "code"
//! ps_description: "Structured logging adapters and sinks."
//! ps_version: "v0.1.0"
//! ps_owner: "netops"
//! ---
#[doc(hidden)]
#[macro_export]
macro_rules! __ps_event {
    ($level:expr, $ctx:expr, $($arg:tt)+) => {{
        let ctx = &$ctx;
        tracing::event!(
            $level,
            device = ctx.device.unwrap_or(""),
            task = ctx.task.unwrap_or(""),
            run_id = ctx.run_id.unwrap_or(""),
            stage = ctx.stage.unwrap_or(""),
            message = %format_args!($($arg)+)
        );
    }};
}

/// Emit an informational log enriched with run context.
#[macro_export]
macro_rules! ps_info {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__ps_event!(tracing::Level::INFO, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__ps_event!(tracing::Level::INFO, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit a debug log enriched with run context.
#[macro_export]
macro_rules! ps_debug {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__ps_event!(tracing::Level::DEBUG, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__ps_event!(tracing::Level::DEBUG, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit a warning enriched with run context.
#[macro_export]
macro_rules! ps_warn {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__ps_event!(tracing::Level::WARN, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__ps_event!(tracing::Level::WARN, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit an error log enriched with run context.
#[macro_export]
macro_rules! ps_error {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__ps_event!(tracing::Level::ERROR, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__ps_event!(tracing::Level::ERROR, $crate::LogContext::default(), $($arg)+)
    };
}
