//! A single-threaded supervisor for a TLS-offloading tunneling reverse and
//! forward proxy: binds listening endpoints, dispatches signals into
//! configuration reload / log reopen / graceful termination, reaps exited
//! children, and hands accepted connections off to a worker backend.

#[macro_use]
mod macros;

pub mod accept_loop;
pub mod child_reaper;
pub mod config;
pub mod control;
pub mod endpoint_binder;
pub mod error;
pub mod lifecycle;
pub mod log_sink;
pub mod pollset;
pub mod privilege;
pub mod service;
pub mod signal_pipe;
mod sys;
pub mod supervisor;
pub mod tls;
pub mod worker;
