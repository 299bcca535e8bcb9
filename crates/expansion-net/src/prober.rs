//! Out-of-band host reachability checks.
//!
//! A probe opens a TCP connection to the host's port and closes it straight
//! away without sending anything; the host recognises such connections and
//! keeps listening. [`ServerProber`] repeats the probe on a timer in its own
//! task and publishes the latest [`ProbeReport`] on a watch channel. Probe
//! results only drive status text; they never change a session.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Outcome class of the latest probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStatus {
    /// No probe has completed yet.
    Unknown,
    /// Something accepted the connection.
    Reachable,
    /// Nothing listens on the port.
    Refused,
    /// No answer before the timeout.
    TimedOut,
    /// No route to the host.
    Unreachable,
    /// Any other failure.
    Failed,
}

impl fmt::Display for ProbeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProbeStatus::Unknown => "unknown",
            ProbeStatus::Reachable => "reachable",
            ProbeStatus::Refused => "refused",
            ProbeStatus::TimedOut => "timed out",
            ProbeStatus::Unreachable => "unreachable",
            ProbeStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Result of the latest probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    pub status: ProbeStatus,
    pub addr: SocketAddr,
    /// OS error text for failures.
    pub detail: Option<String>,
    /// Failed probes in a row, reset by a success.
    pub consecutive_failures: u32,
    /// When the probe finished.
    pub checked_at: Option<Instant>,
}

impl ProbeReport {
    fn unknown(addr: SocketAddr) -> Self {
        Self {
            status: ProbeStatus::Unknown,
            addr,
            detail: None,
            consecutive_failures: 0,
            checked_at: None,
        }
    }

    pub fn is_reachable(&self) -> bool {
        self.status == ProbeStatus::Reachable
    }

    /// One-line status text telling the player what to do.
    pub fn status_text(&self) -> String {
        let addr = self.addr;
        let port = addr.port();
        match self.status {
            ProbeStatus::Unknown => format!("Checking for a game at {addr}..."),
            ProbeStatus::Reachable => format!("A game is listening at {addr}."),
            ProbeStatus::Refused => format!(
                "No game is running at {addr}. Ask the host to start network mode, or check that port {port} is right."
            ),
            ProbeStatus::TimedOut => format!(
                "{addr} did not answer. Check the address and that no firewall blocks port {port}."
            ),
            ProbeStatus::Unreachable => {
                format!("{addr} cannot be reached. Check the address and your network connection.")
            }
            ProbeStatus::Failed => format!(
                "Checking {addr} failed: {}.",
                self.detail.as_deref().unwrap_or("unknown error")
            ),
        }
    }
}

/// Connect to `addr` and close at once.
pub async fn probe_once(addr: SocketAddr, timeout: Duration) -> ProbeReport {
    let (status, detail) = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            drop(stream);
            (ProbeStatus::Reachable, None)
        }
        Ok(Err(e)) => {
            let status = match e.kind() {
                std::io::ErrorKind::ConnectionRefused => ProbeStatus::Refused,
                std::io::ErrorKind::TimedOut => ProbeStatus::TimedOut,
                std::io::ErrorKind::HostUnreachable | std::io::ErrorKind::NetworkUnreachable => {
                    ProbeStatus::Unreachable
                }
                _ => ProbeStatus::Failed,
            };
            (status, Some(e.to_string()))
        }
        Err(_) => (ProbeStatus::TimedOut, None),
    };
    ProbeReport {
        status,
        addr,
        detail,
        consecutive_failures: u32::from(status != ProbeStatus::Reachable),
        checked_at: Some(Instant::now()),
    }
}

/// Probe timing.
#[derive(Debug, Clone)]
pub struct ProberConfig {
    /// Pause between probes. Default: 2 s.
    pub interval: Duration,
    /// Timeout of one probe. Default: 3 s.
    pub timeout: Duration,
}

impl Default for ProberConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            timeout: Duration::from_secs(3),
        }
    }
}

/// Periodic prober running in the background.
pub struct ServerProber {
    reports: watch::Receiver<ProbeReport>,
    stop_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl ServerProber {
    /// Start probing `addr`. The first probe runs immediately.
    pub fn spawn(addr: SocketAddr, config: ProberConfig) -> Self {
        let (report_tx, reports) = watch::channel(ProbeReport::unknown(addr));
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(probe_loop(addr, config, report_tx, stop_rx));
        Self {
            reports,
            stop_tx,
            task: Some(task),
        }
    }

    /// Subscribe to report updates.
    pub fn subscribe(&self) -> watch::Receiver<ProbeReport> {
        self.reports.clone()
    }

    /// Latest report.
    pub fn current(&self) -> ProbeReport {
        self.reports.borrow().clone()
    }

    /// Stop probing and wait for the task to end.
    pub async fn stop(mut self) {
        let _ = self.stop_tx.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ServerProber {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn probe_loop(
    addr: SocketAddr,
    config: ProberConfig,
    reports: watch::Sender<ProbeReport>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(config.interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut failures = 0u32;
    let mut last_status = ProbeStatus::Unknown;

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = crate::transport::wait_stopped(&mut stop_rx) => break,
        }

        let mut report = tokio::select! {
            report = probe_once(addr, config.timeout) => report,
            _ = crate::transport::wait_stopped(&mut stop_rx) => break,
        };
        failures = if report.is_reachable() { 0 } else { failures + 1 };
        report.consecutive_failures = failures;

        if report.status != last_status {
            tracing::info!("Host {addr} is {}", report.status);
            last_status = report.status;
        } else {
            tracing::trace!("Probe {addr}: {}", report.status);
        }
        reports.send_replace(report);
    }
}
