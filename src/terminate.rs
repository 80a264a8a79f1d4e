//! Graceful-then-forceful termination of node processes.
//!
//! Nodes often install a SIGINT handler that flushes state (bag files, maps)
//! before exiting, so termination always starts with SIGINT and only escalates
//! to SIGTERM and then SIGKILL when the process outlives its grace period.

use std::io;
use std::process::ExitStatus;
use std::time::Duration;

use async_trait::async_trait;

const KILL_REAP_TIMEOUT: Duration = Duration::from_millis(500);

/// Signals used while stopping a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    SigInt,
    SigTerm,
    SigKill,
}

/// Grace periods between escalation steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownConfig {
    sigint_ms: u64,
    sigterm_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self::new(5_000, 2_000)
    }
}

impl ShutdownConfig {
    pub fn new(sigint_ms: u64, sigterm_ms: u64) -> Self {
        Self {
            sigint_ms,
            sigterm_ms,
        }
    }

    fn sigint_timeout(&self) -> Duration {
        Duration::from_millis(self.sigint_ms)
    }

    fn sigterm_timeout(&self) -> Duration {
        Duration::from_millis(self.sigterm_ms)
    }
}

/// How a termination ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Exited during the SIGINT grace period.
    Interrupted,
    /// Exited during the SIGTERM grace period.
    Terminated,
    /// Needed SIGKILL.
    Killed,
    /// A signal or liveness check failed, so the process is taken as gone.
    Gone,
}

/// A process that can be signalled and waited on.
#[async_trait]
pub trait Terminable: Send {
    fn send_signal(&mut self, signal: ProcessSignal) -> io::Result<()>;

    /// Waits up to `timeout` for an exit. `Ok(false)` means still running.
    async fn wait_exit(&mut self, timeout: Duration) -> io::Result<bool>;

    /// The exit status if the process has already exited. Never blocks.
    fn try_exit(&mut self) -> io::Result<Option<ExitStatus>>;
}

/// Runs the SIGINT → SIGTERM → SIGKILL escalation on `process`.
///
/// A failed signal or liveness check ends the escalation: the process most likely
/// exited between steps. This can also hide an unrelated wait failure.
pub async fn terminate<P>(process: &mut P, shutdown: ShutdownConfig, label: &str) -> Termination
where
    P: Terminable + ?Sized,
{
    let steps = [
        (ProcessSignal::SigInt, shutdown.sigint_timeout(), Termination::Interrupted),
        (ProcessSignal::SigTerm, shutdown.sigterm_timeout(), Termination::Terminated),
    ];

    for (signal, grace, outcome) in steps {
        if let Err(err) = process.send_signal(signal) {
            log::debug!("[{label}] {signal:?} not delivered ({err}), treating as exited");
            return Termination::Gone;
        }
        match process.wait_exit(grace).await {
            Ok(true) => return outcome,
            Ok(false) => log::debug!("[{label}] still alive after {signal:?} and {grace:?}"),
            Err(err) => {
                log::debug!("[{label}] liveness check failed ({err}), treating as exited");
                return Termination::Gone;
            }
        }
    }

    log::warn!("[{label}] did not exit gracefully, forcing kill");
    if let Err(err) = process.send_signal(ProcessSignal::SigKill) {
        log::debug!("[{label}] SIGKILL not delivered ({err})");
        return Termination::Gone;
    }
    let _ = process.wait_exit(KILL_REAP_TIMEOUT).await;
    Termination::Killed
}

#[async_trait]
impl Terminable for tokio::process::Child {
    fn send_signal(&mut self, signal: ProcessSignal) -> io::Result<()> {
        if signal == ProcessSignal::SigKill {
            #[cfg(unix)]
            {
                if let Some(pid) = self.id() {
                    // Take down grandchildren started through wrapper scripts too.
                    unsafe {
                        let _ = libc::kill(-(pid as i32), libc::SIGKILL);
                    }
                }
            }
            return self.start_kill();
        }
        let pid = self
            .id()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "process already reaped"))?;
        send_os_signal(pid, signal)
    }

    fn try_exit(&mut self) -> io::Result<Option<ExitStatus>> {
        self.try_wait()
    }

    async fn wait_exit(&mut self, timeout: Duration) -> io::Result<bool> {
        if timeout.is_zero() {
            return self.try_wait().map(|status| status.is_some());
        }
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(Ok(_)) => Ok(true),
            Ok(Err(err)) => Err(err),
            Err(_) => Ok(false),
        }
    }
}

#[cfg(unix)]
fn send_os_signal(pid: u32, signal: ProcessSignal) -> io::Result<()> {
    let sig = match signal {
        ProcessSignal::SigInt => libc::SIGINT,
        ProcessSignal::SigTerm => libc::SIGTERM,
        ProcessSignal::SigKill => libc::SIGKILL,
    };
    let pid = pid as i32;
    unsafe {
        let _ = libc::kill(-pid, sig);
        if libc::kill(pid, sig) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(windows)]
fn send_os_signal(pid: u32, _signal: ProcessSignal) -> io::Result<()> {
    use windows_sys::Win32::System::Console::{GenerateConsoleCtrlEvent, CTRL_BREAK_EVENT};
    // CTRL_BREAK is the closest console signal to both SIGINT and SIGTERM.
    let ok = unsafe { GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid) };
    if ok == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(not(unix), not(windows)))]
fn send_os_signal(_pid: u32, _signal: ProcessSignal) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "signals are not supported"))
}
