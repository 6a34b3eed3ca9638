//! Logging macros routed through the `log` facade so library consumers pick the sink.

/// Fine grained progress reporting, noisier than [`debug!`](crate::debug).
#[macro_export]
macro_rules! verbose {
    ($($arg:tt)*) => {
        $crate::log::trace!($($arg)*)
    };
}

#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::log::debug!($($arg)*)
    };
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::log::info!($($arg)*)
    };
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::log::warn!($($arg)*)
    };
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::log::error!($($arg)*)
    };
}
