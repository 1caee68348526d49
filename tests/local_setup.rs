use std::collections::VecDeque;
use std::io;
use std::net::{Ipv6Addr, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Mutex;
use std::time::Duration;

use std::cell::RefCell;

use tsp_local::{
    start_local, DescriptorBuilder, Error, Fork, Keepalive, LocalConfig, LocalSetup, NetTools,
    Pid, ProcessControl, ProcessOutcome, ScriptRunner, Settings, SetupOutcome, Status,
    TunnelDescriptor,
};

const CHILD: i32 = 4242;

/// Payload of the panic that stands in for `_exit` in the mock.
#[derive(Debug, PartialEq)]
struct ExitCode(i32);

#[derive(Debug, Clone, PartialEq)]
enum Call {
    Daemonize,
    Fork,
    Wait(i32),
    TryWait(i32),
    Kill(i32),
    Close(RawFd),
}

struct MockProcess {
    privileged: bool,
    daemonize_fails: bool,
    fork: Mutex<VecDeque<io::Result<Fork>>>,
    reaped_pid: i32,
    outcome: ProcessOutcome,
    /// `try_wait` answers "still running" this many times before reaping.
    running_polls: Mutex<u32>,
    close_fails: bool,
    calls: Mutex<Vec<Call>>,
}

impl Default for MockProcess {
    fn default() -> Self {
        MockProcess {
            privileged: true,
            daemonize_fails: false,
            fork: Mutex::new(VecDeque::new()),
            reaped_pid: CHILD,
            outcome: ProcessOutcome::exited(0),
            running_polls: Mutex::new(0),
            close_fails: false,
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl MockProcess {
    fn forking(results: Vec<io::Result<Fork>>) -> Self {
        MockProcess {
            fork: Mutex::new(results.into()),
            ..Default::default()
        }
    }
    fn parent() -> Self {
        Self::forking(vec![Ok(Fork::Parent(Pid::from_raw(CHILD)))])
    }
    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
    fn count(&self, call: &Call) -> usize {
        self.calls().iter().filter(|c| *c == call).count()
    }
    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

impl ProcessControl for MockProcess {
    fn is_privileged(&self) -> bool {
        self.privileged
    }
    fn daemonize(&self) -> io::Result<()> {
        self.record(Call::Daemonize);
        if self.daemonize_fails {
            return Err(io::Error::from_raw_os_error(libc::EPERM));
        }
        Ok(())
    }
    fn fork(&self) -> io::Result<Fork> {
        self.record(Call::Fork);
        self.fork
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(io::Error::from_raw_os_error(libc::EAGAIN)))
    }
    fn wait(&self, child: Pid) -> io::Result<(Pid, ProcessOutcome)> {
        self.record(Call::Wait(child.as_raw()));
        Ok((Pid::from_raw(self.reaped_pid), self.outcome))
    }
    fn try_wait(&self, child: Pid) -> io::Result<Option<(Pid, ProcessOutcome)>> {
        self.record(Call::TryWait(child.as_raw()));
        let mut polls = self.running_polls.lock().unwrap();
        if *polls > 0 {
            *polls -= 1;
            return Ok(None);
        }
        Ok(Some((Pid::from_raw(self.reaped_pid), self.outcome)))
    }
    fn kill(&self, child: Pid) -> io::Result<()> {
        self.record(Call::Kill(child.as_raw()));
        Ok(())
    }
    fn close(&self, fd: RawFd) -> io::Result<()> {
        self.record(Call::Close(fd));
        if self.close_fails {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        Ok(())
    }
    fn exit(&self, code: i32) -> ! {
        std::panic::panic_any(ExitCode(code))
    }
}

#[derive(Default)]
struct MockScript {
    fail: bool,
    runs: Mutex<u32>,
}

impl MockScript {
    fn failing() -> Self {
        MockScript {
            fail: true,
            ..Default::default()
        }
    }
    fn runs(&self) -> u32 {
        *self.runs.lock().unwrap()
    }
}

impl ScriptRunner for MockScript {
    fn run(&self, _tunnel: &TunnelDescriptor, _tools: &NetTools) -> tsp_local::Result<()> {
        *self.runs.lock().unwrap() += 1;
        if self.fail {
            return Err(Error::ScriptFailed(2));
        }
        Ok(())
    }
}

struct MockKeepalive {
    status: Status,
    runs: Mutex<Vec<(Ipv6Addr, Ipv6Addr, Duration)>>,
}

impl MockKeepalive {
    fn returning(status: Status) -> Self {
        MockKeepalive {
            status,
            runs: Mutex::new(Vec::new()),
        }
    }
    fn runs(&self) -> Vec<(Ipv6Addr, Ipv6Addr, Duration)> {
        self.runs.lock().unwrap().clone()
    }
}

impl Keepalive for MockKeepalive {
    fn run(&self, local: Ipv6Addr, remote: Ipv6Addr, interval: Duration) -> Status {
        self.runs.lock().unwrap().push((local, remote, interval));
        self.status
    }
}

fn tunnel(mode: &str, keepalive: Option<&str>) -> TunnelDescriptor {
    let builder = DescriptorBuilder::new()
        .mode_str(mode)
        .ipv4("192.0.2.10", "198.51.100.1")
        .ipv6("2001:db8::2", "2001:db8::1")
        .keepalive_address("2001:db8::ffff");
    match keepalive {
        Some(interval) => builder.keepalive(interval),
        None => builder,
    }
    .build()
    .unwrap()
}

fn socket() -> UdpSocket {
    UdpSocket::bind("127.0.0.1:0").unwrap()
}

thread_local! {
    static LOGGED: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
}

/// Keeps each test thread's log lines apart.
struct ThreadLogger;

impl log::Log for ThreadLogger {
    fn enabled(&self, _: &log::Metadata) -> bool {
        true
    }
    fn log(&self, record: &log::Record) {
        LOGGED.with(|l| l.borrow_mut().push(record.args().to_string()));
    }
    fn flush(&self) {}
}

fn capture_logs() {
    static LOGGER: ThreadLogger = ThreadLogger;
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(log::LevelFilter::Trace);
    }
    LOGGED.with(|l| l.borrow_mut().clear());
}

fn logged() -> Vec<String> {
    LOGGED.with(|l| l.borrow().clone())
}

fn config() -> LocalConfig {
    LocalConfig::default()
}

#[test]
fn non_root_never_forks() {
    let process = MockProcess {
        privileged: false,
        ..MockProcess::parent()
    };
    let script = MockScript::default();
    let keepalive = MockKeepalive::returning(Status::NoError);
    let setup = LocalSetup::new(&process, &script, &keepalive, config());

    let result = setup.start(&socket(), &tunnel("v6v4", None), &NetTools::default());
    assert!(matches!(result, Err(Error::NotPrivileged)));
    assert!(process.calls().is_empty());
    assert_eq!(script.runs(), 0);
}

#[test]
fn child_closes_tunnel_socket_before_script() {
    let process = MockProcess::forking(vec![Ok(Fork::Child)]);
    let script = MockScript::default();
    let keepalive = MockKeepalive::returning(Status::NoError);
    let setup = LocalSetup::new(&process, &script, &keepalive, config());
    let socket = socket();

    let exit = catch_unwind(AssertUnwindSafe(|| {
        setup.start(&socket, &tunnel("v6v4", Some("30")), &NetTools::default())
    }))
    .expect_err("child must not return");
    assert_eq!(exit.downcast_ref::<ExitCode>(), Some(&ExitCode(0)));
    assert_eq!(
        process.calls(),
        vec![Call::Daemonize, Call::Fork, Call::Close(socket.as_raw_fd())]
    );
    assert_eq!(script.runs(), 1);
    assert!(keepalive.runs().is_empty());
}

#[test]
fn child_exits_with_setup_failure_when_script_fails() {
    let process = MockProcess::forking(vec![Ok(Fork::Child)]);
    let script = MockScript::failing();
    let keepalive = MockKeepalive::returning(Status::NoError);
    let setup = LocalSetup::new(&process, &script, &keepalive, config());
    let socket = socket();

    let exit = catch_unwind(AssertUnwindSafe(|| {
        setup.start(&socket, &tunnel("v6v4", None), &NetTools::default())
    }))
    .expect_err("child must not return");
    assert_eq!(
        exit.downcast_ref::<ExitCode>(),
        Some(&ExitCode(Status::InterfaceSetupFailed.code()))
    );
    assert_eq!(process.count(&Call::Close(socket.as_raw_fd())), 1);
}

#[test]
fn child_skips_script_when_descriptor_cannot_be_released() {
    let process = MockProcess {
        close_fails: true,
        ..MockProcess::forking(vec![Ok(Fork::Child)])
    };
    let script = MockScript::default();
    let keepalive = MockKeepalive::returning(Status::NoError);
    let setup = LocalSetup::new(&process, &script, &keepalive, config());

    let exit = catch_unwind(AssertUnwindSafe(|| {
        setup.start(&socket(), &tunnel("v6v4", None), &NetTools::default())
    }))
    .expect_err("child must not return");
    assert_eq!(exit.downcast_ref::<ExitCode>(), Some(&ExitCode(1)));
    assert_eq!(script.runs(), 0);
}

#[test]
fn nat_traversal_mode_is_rejected() {
    let process = MockProcess::parent();
    let script = MockScript::default();
    let keepalive = MockKeepalive::returning(Status::NoError);
    let setup = LocalSetup::new(&process, &script, &keepalive, config());

    let result = setup.start(&socket(), &tunnel("V6UDPV4", Some("30")), &NetTools::default());
    assert!(matches!(result, Err(Error::UnsupportedMode(_))));
    assert_eq!(process.count(&Call::Fork), 0);
    assert_eq!(script.runs(), 0);
    assert!(keepalive.runs().is_empty());
}

#[test]
fn script_failure_skips_keepalive() {
    let process = MockProcess {
        outcome: ProcessOutcome::exited(1),
        ..MockProcess::parent()
    };
    let script = MockScript::default();
    let keepalive = MockKeepalive::returning(Status::NoError);
    let setup = LocalSetup::new(&process, &script, &keepalive, config());

    let result = setup.start(&socket(), &tunnel("v6v4", Some("30")), &NetTools::default());
    assert!(matches!(result, Err(Error::ScriptFailed(1))));
    assert_eq!(process.count(&Call::Wait(CHILD)), 1);
    assert!(keepalive.runs().is_empty());
}

#[test]
fn signaled_script_skips_keepalive() {
    let process = MockProcess {
        outcome: ProcessOutcome::signaled(libc::SIGSEGV),
        ..MockProcess::parent()
    };
    let script = MockScript::default();
    let keepalive = MockKeepalive::returning(Status::NoError);
    let setup = LocalSetup::new(&process, &script, &keepalive, config());

    let status = start_local(&setup, &socket(), &tunnel("v6v4", Some("30")), &NetTools::default());
    assert_eq!(status, Status::InterfaceSetupFailed);
    assert!(keepalive.runs().is_empty());
}

#[test]
fn wait_for_wrong_child_fails() {
    let process = MockProcess {
        reaped_pid: CHILD + 1,
        ..MockProcess::parent()
    };
    let script = MockScript::default();
    let keepalive = MockKeepalive::returning(Status::NoError);
    let setup = LocalSetup::new(&process, &script, &keepalive, config());

    let result = setup.start(&socket(), &tunnel("v6v4", Some("30")), &NetTools::default());
    assert!(matches!(
        result,
        Err(Error::WaitMismatch { expected: CHILD, found }) if found == CHILD + 1
    ));
    assert!(keepalive.runs().is_empty());
}

#[test]
fn no_keepalive_returns_configured() {
    for interval in [None, Some("abc"), Some("0")] {
        let process = MockProcess::parent();
        let script = MockScript::default();
        let keepalive = MockKeepalive::returning(Status::KeepaliveError);
        let setup = LocalSetup::new(&process, &script, &keepalive, config());

        let result = setup.start(&socket(), &tunnel("v6v4", interval), &NetTools::default());
        assert_eq!(result.unwrap(), SetupOutcome::Configured);
        assert!(keepalive.runs().is_empty());
        // Script runs only in the child, which this parent-side mock never becomes.
        assert_eq!(script.runs(), 0);
    }
}

#[test]
fn explicit_zero_interval_is_logged() {
    capture_logs();
    let process = MockProcess::parent();
    let script = MockScript::default();
    let keepalive = MockKeepalive::returning(Status::NoError);
    let setup = LocalSetup::new(&process, &script, &keepalive, config());

    let result = setup.start(&socket(), &tunnel("v6v4", Some("0")), &NetTools::default());
    assert_eq!(result.unwrap(), SetupOutcome::Configured);
    assert!(logged().iter().any(|l| l == "keepalive interval 0s"));

    capture_logs();
    let process = MockProcess::parent();
    let setup = LocalSetup::new(&process, &script, &keepalive, config());
    setup
        .start(&socket(), &tunnel("v6v4", None), &NetTools::default())
        .unwrap();
    assert!(!logged().iter().any(|l| l.starts_with("keepalive interval")));
}

#[test]
fn keepalive_status_is_forwarded() {
    let process = MockProcess::parent();
    let script = MockScript::default();
    let keepalive = MockKeepalive::returning(Status::KeepaliveTimeout);
    let setup = LocalSetup::new(&process, &script, &keepalive, config());

    let status = start_local(&setup, &socket(), &tunnel("v4v6", Some("25")), &NetTools::default());
    assert_eq!(status, Status::KeepaliveTimeout);
    assert_eq!(
        keepalive.runs(),
        vec![(
            "2001:db8::2".parse().unwrap(),
            "2001:db8::ffff".parse().unwrap(),
            Duration::from_secs(25)
        )]
    );
    assert_eq!(
        process.calls(),
        vec![Call::Daemonize, Call::Fork, Call::Wait(CHILD)]
    );
}

#[test]
fn daemonize_failure_never_forks() {
    let process = MockProcess {
        daemonize_fails: true,
        ..MockProcess::parent()
    };
    let script = MockScript::default();
    let keepalive = MockKeepalive::returning(Status::NoError);
    let setup = LocalSetup::new(&process, &script, &keepalive, config());

    let result = setup.start(&socket(), &tunnel("v6v4", None), &NetTools::default());
    assert!(matches!(result, Err(Error::Daemonize(_))));
    assert_eq!(process.calls(), vec![Call::Daemonize]);
}

#[test]
fn daemonize_can_be_disabled() {
    let process = MockProcess::parent();
    let script = MockScript::default();
    let keepalive = MockKeepalive::returning(Status::NoError);
    let config = LocalConfig {
        daemonize: false,
        ..config()
    };
    let setup = LocalSetup::new(&process, &script, &keepalive, config);

    let result = setup.start(&socket(), &tunnel("v6v4", None), &NetTools::default());
    assert_eq!(result.unwrap(), SetupOutcome::Configured);
    assert_eq!(process.calls(), vec![Call::Fork, Call::Wait(CHILD)]);
}

#[test]
fn fork_failure() {
    let process = MockProcess::forking(vec![]);
    let script = MockScript::default();
    let keepalive = MockKeepalive::returning(Status::NoError);
    let setup = LocalSetup::new(&process, &script, &keepalive, config());

    let status = start_local(&setup, &socket(), &tunnel("v6v4", None), &NetTools::default());
    assert_eq!(status, Status::InterfaceSetupFailed);
    assert_eq!(process.count(&Call::Fork), 1);
    assert_eq!(process.count(&Call::Wait(CHILD)), 0);
}

#[test]
fn bounded_wait_reaps_in_time() {
    let process = MockProcess {
        running_polls: Mutex::new(2),
        ..MockProcess::parent()
    };
    let script = MockScript::default();
    let keepalive = MockKeepalive::returning(Status::NoError);
    let config = LocalConfig {
        script_timeout: Some(Duration::from_secs(5)),
        ..config()
    };
    let setup = LocalSetup::new(&process, &script, &keepalive, config);

    let result = setup.start(&socket(), &tunnel("v6v4", None), &NetTools::default());
    assert_eq!(result.unwrap(), SetupOutcome::Configured);
    assert_eq!(process.count(&Call::TryWait(CHILD)), 3);
    assert_eq!(process.count(&Call::Kill(CHILD)), 0);
}

#[test]
fn bounded_wait_kills_hung_script() {
    let process = MockProcess {
        running_polls: Mutex::new(u32::MAX),
        ..MockProcess::parent()
    };
    let script = MockScript::default();
    let keepalive = MockKeepalive::returning(Status::NoError);
    let config = LocalConfig {
        script_timeout: Some(Duration::from_millis(150)),
        ..config()
    };
    let setup = LocalSetup::new(&process, &script, &keepalive, config);

    let result = setup.start(&socket(), &tunnel("v6v4", Some("30")), &NetTools::default());
    assert!(matches!(result, Err(Error::ScriptTimeout(_))));
    assert_eq!(process.count(&Call::Kill(CHILD)), 1);
    assert_eq!(process.count(&Call::Wait(CHILD)), 1);
    assert!(keepalive.runs().is_empty());
}

#[test]
fn oversized_timeout_waits_unbounded() {
    let process = MockProcess::parent();
    let script = MockScript::default();
    let keepalive = MockKeepalive::returning(Status::NoError);
    let settings: Settings = "script_timeout=18446744073709551615".parse().unwrap();
    let setup = LocalSetup::new(&process, &script, &keepalive, settings.local);

    let result = setup.start(&socket(), &tunnel("v6v4", None), &NetTools::default());
    assert_eq!(result.unwrap(), SetupOutcome::Configured);
    assert_eq!(process.calls(), vec![Call::Daemonize, Call::Fork, Call::Wait(CHILD)]);
}

#[test]
fn every_call_forks_again() {
    let process = MockProcess::forking(vec![
        Ok(Fork::Parent(Pid::from_raw(CHILD))),
        Ok(Fork::Parent(Pid::from_raw(CHILD))),
    ]);
    let script = MockScript::default();
    let keepalive = MockKeepalive::returning(Status::NoError);
    let setup = LocalSetup::new(&process, &script, &keepalive, config());
    let socket = socket();
    let tunnel = tunnel("v6v4", Some("10"));

    for _ in 0..2 {
        let outcome = setup.start(&socket, &tunnel, &NetTools::default()).unwrap();
        assert_eq!(outcome, SetupOutcome::Keepalive(Status::NoError));
    }
    assert_eq!(process.count(&Call::Fork), 2);
    assert_eq!(keepalive.runs().len(), 2);
}
