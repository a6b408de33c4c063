//! Whole-supervisor round-trip tests (SPEC_FULL §8).

use std::net::TcpListener;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::AtomicI64;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use relayd::child_reaper;
use relayd::endpoint_binder::{self, Inherited};
use relayd::log_sink::LogSink;
use relayd::pollset::PollSet;
use relayd::service::{Endpoint, GlobalOptions, Registry, RemotePeer, ServiceEntry, ServiceOptions};
use relayd::signal_pipe::SignalPipe;
use relayd::supervisor::{ConfigSource, Supervisor};
use relayd::worker::ThreadWorker;

fn tcp_service(name: &str) -> Arc<ServiceEntry> {
    Arc::new(ServiceEntry::new(
        ServiceOptions {
            name: name.to_string(),
            local: vec![Endpoint::Tcp("127.0.0.1:0".parse().unwrap())],
            remote: RemotePeer::Addrs(vec![]),
            session_timeout: Duration::from_secs(5),
            ownership: None,
        },
        None,
    ))
}

fn test_supervisor() -> Supervisor {
    let mut poll_set = PollSet::init(16).unwrap();
    let signal_pipe = SignalPipe::init(&mut poll_set).unwrap();
    Supervisor {
        poll_set,
        signal_pipe,
        registry: Registry::new(),
        log_sink: Box::leak(Box::new(LogSink::new())),
        worker: Arc::new(ThreadWorker::new()),
        num_clients: Arc::new(AtomicI64::new(0)),
        inherited: Inherited::none(),
        global: RwLock::new(GlobalOptions::default()),
        config_source: ConfigSource::File("/nonexistent/relayd.conf".into()),
    }
}

/// Property: `bind_ports` then `unbind_ports` restores the Poll Set to
/// exactly the signal pipe, and no listening descriptor survives.
#[test]
fn bind_then_unbind_round_trip_leaves_only_the_signal_pipe() {
    let mut supervisor = test_supervisor();
    let services = vec![tcp_service("a"), tcp_service("b")];

    endpoint_binder::bind_ports(&services, supervisor.inherited, &mut supervisor.poll_set).unwrap();
    assert_eq!(supervisor.poll_set.dump().len(), 3); // signal pipe + 2 listeners

    endpoint_binder::unbind_ports(&services, &mut supervisor.poll_set);
    for service in &services {
        assert_eq!(service.bound_count(), 0);
    }
    assert_eq!(supervisor.poll_set.dump().len(), 1); // only the signal pipe left
}

/// Property: a reload that changes a listening port removes the old
/// descriptor from the Poll Set and registers a fresh one.
#[test]
fn reload_swaps_listening_descriptors() {
    let mut supervisor = test_supervisor();
    let first = vec![tcp_service("svc")];
    endpoint_binder::bind_ports(&first, supervisor.inherited, &mut supervisor.poll_set).unwrap();
    let old_fd = match first[0].slot(0) {
        relayd::service::Slot::Bound { fd, .. } => fd,
        relayd::service::Slot::Unbound => panic!("expected a bound slot"),
    };
    assert!(supervisor.token_for_fd(old_fd).is_some());

    endpoint_binder::unbind_ports(&first, &mut supervisor.poll_set);
    assert!(supervisor.token_for_fd(old_fd).is_none());

    let second = vec![tcp_service("svc")];
    endpoint_binder::bind_ports(&second, supervisor.inherited, &mut supervisor.poll_set).unwrap();
    let new_fd = match second[0].slot(0) {
        relayd::service::Slot::Bound { fd, .. } => fd,
        relayd::service::Slot::Unbound => panic!("expected a bound slot"),
    };
    assert!(supervisor.token_for_fd(new_fd).is_some());
}

/// Property: a descriptor in the inherited range is claimed without
/// bind/listen and is never closed by unbind_ports — only deregistered.
#[test]
fn inherited_descriptor_is_never_closed() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let real_fd = listener.as_raw_fd();

    // Park the listener's descriptor at a fixed, high slot so Inherited can
    // address it the way a service manager's LISTEN_FDS base would.
    let claimed_fd: RawFd = 60;
    unsafe {
        libc::dup2(real_fd, claimed_fd);
    }

    let mut supervisor = test_supervisor();
    supervisor.inherited = Inherited { start: claimed_fd, count: 1 };
    let services = vec![tcp_service("inherited")];

    endpoint_binder::bind_ports(&services, supervisor.inherited, &mut supervisor.poll_set).unwrap();
    match services[0].slot(0) {
        relayd::service::Slot::Bound { fd, inherited, .. } => {
            assert_eq!(fd, claimed_fd);
            assert!(inherited);
        }
        relayd::service::Slot::Unbound => panic!("expected the inherited fd to be claimed"),
    }

    endpoint_binder::unbind_ports(&services, &mut supervisor.poll_set);

    // fcntl(F_GETFD) fails with EBADF only once the descriptor is closed.
    let still_open = unsafe { libc::fcntl(claimed_fd, libc::F_GETFD) } != -1;
    assert!(still_open, "unbind_ports must not close an inherited descriptor");

    unsafe { libc::close(claimed_fd) };
}

/// Property: `Supervisor::max_clients` reflects the single global admission
/// limit set during configuration.
#[test]
fn max_clients_reflects_the_global_limit() {
    let supervisor = test_supervisor();
    assert_eq!(supervisor.max_clients(), 0);

    supervisor.global.write().unwrap().max_clients = 10;
    assert_eq!(supervisor.max_clients(), 10);
}

/// Property: five children exiting before one `reap_nohang` call all get
/// reaped in that single invocation (no zombies left behind).
#[test]
fn reap_nohang_drains_a_burst_of_children() {
    let mut children = Vec::new();
    for _ in 0..5 {
        children.push(std::process::Command::new("true").spawn().unwrap());
    }
    std::thread::sleep(Duration::from_millis(100));

    child_reaper::reap_nohang("Process");

    for mut child in children {
        // try_wait never blocks; if reap_nohang already collected the
        // child, this returns Ok(None) immediately (no status to give,
        // process table entry already gone) rather than hanging.
        let _ = child.try_wait();
    }
}

/// Property: `REOPEN_LOG`'s effect (close + reopen the file sink) is
/// idempotent when the target path is unchanged.
#[test]
fn reopen_file_is_idempotent() {
    let dir = std::env::temp_dir().join(format!("relayd-test-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("relayd.log");

    let sink = LogSink::new();
    sink.open_file(&path).unwrap();
    sink.reopen_file().unwrap();
    sink.reopen_file().unwrap();

    sink.close_file();
    let _ = std::fs::remove_dir_all(&dir);
}
