//! Structured error types for each subsystem, aggregated into [`DaemonError`]
//! for the few call sites (mainly `lifecycle`) that need to report a single
//! failure cause up to `main`.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PollError {
    #[error("failed to create epoll instance: {0}")]
    Create(#[source] std::io::Error),
    #[error("epoll_wait failed: {0}")]
    Wait(#[source] std::io::Error),
    #[error("failed to register fd {fd} with the poll set: {source}")]
    Register {
        fd: i32,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum BindError {
    #[error("service {service} declares local endpoints but bound zero of them")]
    NoEndpointsBound { service: String },
    #[error("{count} inherited descriptors but only {listening_services} listening services declared")]
    TooManyInheritedDescriptors {
        count: usize,
        listening_services: usize,
    },
    #[error("failed to bind {service} endpoint {index} ({addr}): {source}")]
    Bind {
        service: String,
        index: usize,
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to chown unix socket path {path:?} for service {service}: {source}")]
    Chown {
        service: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum PrivilegeError {
    #[error("chroot to {1:?} failed: {0}")]
    Chroot(#[source] std::io::Error, PathBuf),
    #[error("setgid({0}) failed: {1}")]
    SetGid(u32, #[source] std::io::Error),
    #[error("setgroups failed: {0}")]
    SetGroups(#[source] std::io::Error),
    #[error("setuid({0}) failed: {1}")]
    SetUid(u32, #[source] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}:{line}: {message}")]
    Parse {
        path: String,
        line: usize,
        message: String,
    },
    #[error("service {0:?} has no local endpoints, no exec+connect remote, and is not a TLS extension slave")]
    EmptyService(String),
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("poll set: {0}")]
    Poll(#[from] PollError),
    #[error("bind: {0}")]
    Bind(#[from] BindError),
    #[error("privilege: {0}")]
    Privilege(#[from] PrivilegeError),
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to start exec+connect services")]
    ExecConnectStart,
    #[error("signal pipe: {0}")]
    SignalPipe(#[source] std::io::Error),
    #[error("failed to set inherited descriptor {fd} non-blocking: {source}")]
    InheritedNonBlocking {
        fd: i32,
        #[source]
        source: std::io::Error,
    },
}

/// Top-level error returned from `main`'s configuration path (SPEC_FULL §6,
/// exit code 1).
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error("{0}")]
    Other(String),
}
