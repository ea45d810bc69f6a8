//! Cross-thread command/report queue pair between the RPC façade and the
//! event loop (§4.6, C7).
//!
//! The original signals command completion with a mutex + condition
//! variable and wakes the readiness wait with a self-pipe. Rust gives us a
//! one-shot channel for the former; for the latter we keep a `mio` registry
//! entry the façade writes a byte to, same pattern, different plumbing.

use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;

use crate::error::Result;
use crate::flow::{FlowId, FlowSettings, SourceSettings};
use crate::stats::Report;

/// Bound on undelivered interval reports (§4.6, §8 invariant 6).
pub const MAX_PENDING_REPORTS: usize = 250;
/// Largest batch `GetReports` hands back at once.
pub const MAX_REPORTS_PER_POLL: usize = 50;

#[derive(Debug, Clone)]
pub struct AddDestinationReply {
    pub flow_id: FlowId,
    pub listen_port: u16,
    pub real_send_buffer_size: i32,
    pub real_read_buffer_size: i32,
}

#[derive(Debug, Clone)]
pub struct AddSourceReply {
    pub flow_id: FlowId,
    pub cc_alg: Option<String>,
    pub real_send_buffer_size: i32,
    pub real_read_buffer_size: i32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StatusReply {
    pub started: bool,
    pub num_flows: usize,
}

/// `FLOWGRIND_API_VERSION` from `common.h`: bumped whenever the RPC method
/// signatures change, independent of the daemon's own release version.
pub const API_VERSION: u32 = 3;

/// `GetVersion`'s reply (§6 External Interfaces: `{version, api, os_name,
/// os_release}`), grounded in `fg_rpc_server.c`'s `method_get_version`,
/// which backs `os_name`/`os_release` with a single `uname(2)` call.
#[derive(Debug, Clone)]
pub struct GetVersionReply {
    pub version: String,
    pub api: u32,
    pub os_name: String,
    pub os_release: String,
}

impl GetVersionReply {
    pub fn current() -> GetVersionReply {
        let (os_name, os_release) = uname_fields();
        GetVersionReply { version: env!("CARGO_PKG_VERSION").to_string(), api: API_VERSION, os_name, os_release }
    }
}

#[cfg(target_os = "linux")]
fn uname_fields() -> (String, String) {
    unsafe {
        let mut buf: libc::utsname = std::mem::zeroed();
        if libc::uname(&mut buf) == 0 {
            (cstr_field(&buf.sysname), cstr_field(&buf.release))
        } else {
            log::warn!("uname() failed: {}", std::io::Error::last_os_error());
            ("unknown".to_string(), "unknown".to_string())
        }
    }
}

#[cfg(target_os = "linux")]
fn cstr_field(field: &[libc::c_char]) -> String {
    let bytes: Vec<u8> = field.iter().take_while(|&&c| c != 0).map(|&c| c as u8).collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

#[cfg(not(target_os = "linux"))]
fn uname_fields() -> (String, String) {
    ("unknown".to_string(), "unknown".to_string())
}

/// One command as it travels through the queue; `StopFlow(None)` means
/// "stop all flows" (§6 `StopFlow` `{flow_id or -1}`).
#[derive(Debug, Clone)]
pub enum Command {
    AddDestination(FlowSettings),
    AddSource(FlowSettings, SourceSettings),
    StartFlows { start_timestamp: crate::time::Timestamp },
    StopFlow(Option<FlowId>),
    GetStatus,
    GetVersion,
}

/// What a command reports back to the façade once processed.
#[derive(Debug)]
pub enum CommandReply {
    AddDestination(Result<AddDestinationReply>),
    AddSource(Result<AddSourceReply>),
    StartFlows(Result<()>),
    StopFlow(Result<()>),
    GetStatus(StatusReply),
    GetVersion(GetVersionReply),
}

struct PendingCommand {
    command: Command,
    reply_tx: Sender<CommandReply>,
}

/// Producer-side handle: the façade's view of the command queue.
pub struct CommandSender {
    inner: std::sync::Arc<Mutex<VecDeque<PendingCommand>>>,
    waker: mio::Waker,
}

impl CommandSender {
    /// Enqueues `command` and blocks on its completion signal, exactly as
    /// the façade's RPC handler thread does in the original (§4.6).
    pub fn submit(&self, command: Command) -> CommandReply {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.inner.lock().unwrap().push_back(PendingCommand { command, reply_tx });
        self.waker.wake().expect("failed to wake event loop");
        reply_rx.recv().expect("event loop dropped reply channel")
    }
}

/// Consumer-side handle: the event loop's view of the command queue.
pub struct CommandReceiver {
    inner: std::sync::Arc<Mutex<VecDeque<PendingCommand>>>,
}

impl CommandReceiver {
    /// Drains every pending command in FIFO order, invoking `handle` for
    /// each and sending its reply. No blocking I/O happens while the
    /// internal mutex is held (§4.6 "Locking discipline").
    pub fn drain(&self, mut handle: impl FnMut(Command) -> CommandReply) {
        let pending: Vec<PendingCommand> = {
            let mut guard = self.inner.lock().unwrap();
            guard.drain(..).collect()
        };
        for p in pending {
            let reply = handle(p.command);
            let _ = p.reply_tx.send(reply);
        }
    }
}

pub fn command_queue(waker: mio::Waker) -> (CommandSender, CommandReceiver) {
    let inner = std::sync::Arc::new(Mutex::new(VecDeque::new()));
    (
        CommandSender { inner: inner.clone(), waker },
        CommandReceiver { inner },
    )
}

/// Producer (event loop) / consumer (façade) report queue. Interval reports
/// are dropped once `MAX_PENDING_REPORTS` are queued; Final reports are
/// never dropped (§4.6, §5 "Backpressure").
#[derive(Default)]
pub struct ReportQueue {
    reports: Mutex<VecDeque<Report>>,
    dropped_interval_reports: Mutex<u64>,
}

impl ReportQueue {
    pub fn new() -> ReportQueue {
        ReportQueue::default()
    }

    pub fn push(&self, report: Report) {
        let mut guard = self.reports.lock().unwrap();
        if guard.len() >= MAX_PENDING_REPORTS && report.kind == crate::stats::ReportKind::Interval {
            *self.dropped_interval_reports.lock().unwrap() += 1;
            log::warn!("dropping interval report for flow {}: queue full", report.flow_id);
            return;
        }
        guard.push_back(report);
    }

    /// Returns up to [`MAX_REPORTS_PER_POLL`] reports plus whether more
    /// remain (§4.6 `GetReports`).
    pub fn poll(&self) -> (Vec<Report>, bool) {
        let mut guard = self.reports.lock().unwrap();
        let take = guard.len().min(MAX_REPORTS_PER_POLL);
        let batch: Vec<Report> = guard.drain(..take).collect();
        let has_more = !guard.is_empty();
        (batch, has_more)
    }

    pub fn dropped_interval_reports(&self) -> u64 {
        *self.dropped_interval_reports.lock().unwrap()
    }

    pub fn len(&self) -> usize {
        self.reports.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{KernelTcpInfo, ReportKind, Sample, StatusFlags};
    use crate::time::Timestamp;

    fn dummy_report(kind: ReportKind) -> Report {
        Report {
            flow_id: 1,
            kind,
            begin: Timestamp::ZERO,
            end: Timestamp::ZERO,
            bytes_read: 0,
            bytes_written: 0,
            request_blocks_read: 0,
            request_blocks_written: 0,
            response_blocks_read: 0,
            response_blocks_written: 0,
            rtt: Sample::default(),
            iat: Sample::default(),
            delay: Sample::default(),
            tcp_info: KernelTcpInfo::default(),
            pmtu: 0,
            imtu: None,
            status: StatusFlags(0),
        }
    }

    #[test]
    fn get_version_reports_the_crate_version_and_api_version() {
        let v = GetVersionReply::current();
        assert_eq!(v.version, env!("CARGO_PKG_VERSION"));
        assert_eq!(v.api, API_VERSION);
        assert!(!v.os_name.is_empty());
        assert!(!v.os_release.is_empty());
    }

    #[test]
    fn report_queue_drops_interval_reports_past_cap() {
        let q = ReportQueue::new();
        for _ in 0..MAX_PENDING_REPORTS + 10 {
            q.push(dummy_report(ReportKind::Interval));
        }
        assert_eq!(q.len(), MAX_PENDING_REPORTS);
        assert_eq!(q.dropped_interval_reports(), 10);
    }

    #[test]
    fn report_queue_never_drops_final_reports() {
        let q = ReportQueue::new();
        for _ in 0..MAX_PENDING_REPORTS {
            q.push(dummy_report(ReportKind::Interval));
        }
        q.push(dummy_report(ReportKind::Final));
        assert_eq!(q.len(), MAX_PENDING_REPORTS + 1);
    }

    #[test]
    fn poll_returns_at_most_fifty_and_flags_more() {
        let q = ReportQueue::new();
        for _ in 0..75 {
            q.push(dummy_report(ReportKind::Final));
        }
        let (batch, has_more) = q.poll();
        assert_eq!(batch.len(), MAX_REPORTS_PER_POLL);
        assert!(has_more);
        let (batch2, has_more2) = q.poll();
        assert_eq!(batch2.len(), 25);
        assert!(!has_more2);
    }
}
