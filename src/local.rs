use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use crate::configuration::{LocalConfig, NetTools, TunnelDescriptor, TunnelMode};
use crate::error::{Error, Result, Status};
use crate::keepalive::Keepalive;
use crate::platform::{Fork, Pid, ProcessControl, ProcessOutcome};
use crate::script::ScriptRunner;

const WAIT_POLL: Duration = Duration::from_millis(100);

/// How a successful local setup ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SetupOutcome {
    /// Interface configured, no keepalive requested.
    Configured,
    /// Interface configured; the keepalive ran and ended with this status.
    Keepalive(Status),
}

impl SetupOutcome {
    pub fn status(&self) -> Status {
        match self {
            SetupOutcome::Configured => Status::NoError,
            SetupOutcome::Keepalive(status) => *status,
        }
    }
}

/// Privileged one-shot configuration of the local tunnel interface.
///
/// The configuration script runs in a forked child that never sees the
/// tunnel socket; the parent reaps it and then optionally hands over to
/// the keepalive for the rest of the tunnel's life.
pub struct LocalSetup<P, S, K> {
    process: P,
    script: S,
    keepalive: K,
    config: LocalConfig,
}

impl<P, S, K> LocalSetup<P, S, K>
where
    P: ProcessControl,
    S: ScriptRunner,
    K: Keepalive,
{
    pub fn new(process: P, script: S, keepalive: K, config: LocalConfig) -> Self {
        LocalSetup {
            process,
            script,
            keepalive,
            config,
        }
    }

    pub fn config(&self) -> &LocalConfig {
        &self.config
    }

    /// Configure the interface for `tunnel`, then run the keepalive if one
    /// was requested. Blocks for as long as the keepalive runs.
    pub fn start<F: AsRawFd>(
        &self,
        socket: &F,
        tunnel: &TunnelDescriptor,
        tools: &NetTools,
    ) -> Result<SetupOutcome> {
        if !self.process.is_privileged() {
            log::error!("must be root to configure the tunnel interface");
            return Err(Error::NotPrivileged);
        }

        let interval = tunnel.keepalive_interval();
        if tunnel.keepalive_interval.is_some() {
            log::info!("keepalive interval {interval}s");
        }

        // Checked before detaching so the failure still reaches the terminal.
        if !mode_supported(tunnel.mode) {
            log::error!("tunnel mode {} is not supported on this platform", tunnel.mode);
            return Err(Error::UnsupportedMode(tunnel.mode));
        }

        if self.config.daemonize {
            if let Err(e) = self.process.daemonize() {
                log::error!("unable to detach from the controlling terminal: {e}");
                return Err(Error::Daemonize(e));
            }
        }

        let child = match self.process.fork() {
            Ok(Fork::Child) => {
                let code = self.run_child(socket.as_raw_fd(), tunnel, tools);
                self.process.exit(code)
            }
            Ok(Fork::Parent(child)) => child,
            Err(e) => {
                log::error!("unable to fork: {e}");
                return Err(Error::Fork(e));
            }
        };

        let outcome = self.wait_child(child)?;
        if !outcome.exited {
            log::error!("script terminated abnormally (signal {})", outcome.code);
            return Err(Error::ScriptAbnormal);
        }
        if outcome.code != 0 {
            log::error!("script failed to execute correctly (exit code {})", outcome.code);
            return Err(Error::ScriptFailed(outcome.code));
        }
        log::info!("tunnel interface configured");

        if interval == 0 {
            return Ok(SetupOutcome::Configured);
        }
        let status = self.keepalive.run(
            tunnel.client_address_ipv6,
            tunnel.keepalive_address_ipv6,
            Duration::from_secs(interval),
        );
        Ok(SetupOutcome::Keepalive(status))
    }

    /// Body of the forked child; the return value is its exit code.
    pub(crate) fn run_child(&self, socket: RawFd, tunnel: &TunnelDescriptor, tools: &NetTools) -> i32 {
        if let Err(e) = self.process.close(socket) {
            log::error!("unable to release tunnel descriptor {socket}: {e}");
            return Status::InterfaceSetupFailed.code();
        }
        match self.script.run(tunnel, tools) {
            Ok(()) => Status::NoError.code(),
            Err(e) => {
                log::error!("{e}");
                Status::InterfaceSetupFailed.code()
            }
        }
    }

    fn wait_child(&self, child: Pid) -> Result<ProcessOutcome> {
        let (reaped, outcome) = match self.config.script_timeout {
            None => self.process.wait(child),
            Some(timeout) => self.wait_child_timeout(child, timeout)?,
        }
        .map_err(|e| {
            log::error!("unable to wait for the configuration script: {e}");
            Error::Wait(e)
        })?;
        if reaped != child {
            log::error!("wait returned pid {reaped}, expected {child}");
            return Err(Error::WaitMismatch {
                expected: child.as_raw(),
                found: reaped.as_raw(),
            });
        }
        Ok(outcome)
    }

    /// Outer `Err` is a timeout; the inner result is what the wait produced.
    fn wait_child_timeout(
        &self,
        child: Pid,
        timeout: Duration,
    ) -> Result<std::io::Result<(Pid, ProcessOutcome)>> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            log::warn!("script timeout {timeout:?} out of range, waiting without one");
            return Ok(self.process.wait(child));
        };
        loop {
            match self.process.try_wait(child) {
                Ok(Some(reaped)) => return Ok(Ok(reaped)),
                Ok(None) => {}
                Err(e) => return Ok(Err(e)),
            }
            let Some(left) = deadline.checked_duration_since(Instant::now()) else {
                break;
            };
            std::thread::sleep(left.min(WAIT_POLL));
        }
        log::error!("script did not finish within {timeout:?}, killing pid {child}");
        if let Err(e) = self.process.kill(child) {
            log::warn!("unable to kill pid {child}: {e}");
        }
        if let Err(e) = self.process.wait(child) {
            log::warn!("unable to reap pid {child}: {e}");
        }
        Err(Error::ScriptTimeout(timeout))
    }
}

/// NAT traversal needs a userspace tunnel this platform does not provide.
pub fn mode_supported(mode: TunnelMode) -> bool {
    !mode.is_nat_traversal()
}

/// Flat-status form of [`LocalSetup::start`].
pub fn start_local<P, S, K, F>(
    setup: &LocalSetup<P, S, K>,
    socket: &F,
    tunnel: &TunnelDescriptor,
    tools: &NetTools,
) -> Status
where
    P: ProcessControl,
    S: ScriptRunner,
    K: Keepalive,
    F: AsRawFd,
{
    match setup.start(socket, tunnel, tools) {
        Ok(outcome) => outcome.status(),
        Err(e) => e.status(),
    }
}
