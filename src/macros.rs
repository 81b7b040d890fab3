//! Logging helper macros.
//!
//! The role loop, replication workers, FSM worker, and snapshot worker all
//! want every log line prefixed with the emitting node's own id, without
//! repeating `self.id` at every call site. These macros wrap the `log`
//! crate's level macros and splice that prefix in via the node's
//! `fmt::Display` impl.

/// Logs at `error` level with the node id prefix.
macro_rules! pf_error {
    ($self_:expr, $fmt:literal $(, $arg:expr)* $(,)?) => {
        log::error!(concat!("<{}> ", $fmt), $self_.id() $(, $arg)*)
    };
}

/// Logs at `warn` level with the node id prefix.
macro_rules! pf_warn {
    ($self_:expr, $fmt:literal $(, $arg:expr)* $(,)?) => {
        log::warn!(concat!("<{}> ", $fmt), $self_.id() $(, $arg)*)
    };
}

/// Logs at `info` level with the node id prefix.
macro_rules! pf_info {
    ($self_:expr, $fmt:literal $(, $arg:expr)* $(,)?) => {
        log::info!(concat!("<{}> ", $fmt), $self_.id() $(, $arg)*)
    };
}

/// Logs at `debug` level with the node id prefix.
macro_rules! pf_debug {
    ($self_:expr, $fmt:literal $(, $arg:expr)* $(,)?) => {
        log::debug!(concat!("<{}> ", $fmt), $self_.id() $(, $arg)*)
    };
}

/// Logs at `trace` level with the node id prefix.
macro_rules! pf_trace {
    ($self_:expr, $fmt:literal $(, $arg:expr)* $(,)?) => {
        log::trace!(concat!("<{}> ", $fmt), $self_.id() $(, $arg)*)
    };
}

/// Logs the given message at `error` level and then builds a
/// `RaftError::Msg` from it — saves writing the same string twice at every
/// fallible call site that wants its failure visible in the log.
macro_rules! logged_err {
    ($self_:expr, $fmt:literal $(, $arg:expr)*) => {{
        let msg = format!($fmt $(, $arg)*);
        pf_error!($self_, "{}", msg);
        Err(crate::RaftError::msg(msg))
    }};
}
