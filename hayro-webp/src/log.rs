//! Log macros that compile to nothing unless the `logging` feature is on.

macro_rules! llog {
    ($level:ident, $fmt:literal $(, $arg:expr)* $(,)?) => {{
        #[cfg(feature = "logging")]
        ::log::$level!($fmt $(, $arg)*);
        #[cfg(not(feature = "logging"))]
        { $(let _ = &$arg;)* }
    }};
}

/// Headers and state changes.
macro_rules! ldebug {
    ($($args:tt)*) => {
        llog!(debug, $($args)*)
    };
}

/// Per-row progress.
macro_rules! ltrace {
    ($($args:tt)*) => {
        llog!(trace, $($args)*)
    };
}

/// Suspicious input.
macro_rules! lwarn {
    ($($args:tt)*) => {
        llog!(warn, $($args)*)
    };
}
