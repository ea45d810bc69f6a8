//! `DaemonHandle`: the in-process API boundary a façade is built against
//! (§A). Spawns the event loop on its own thread and exposes the
//! command/report queue as ordinary method calls.

use std::sync::Arc;
use std::thread::JoinHandle;

use crate::error::Result;
use crate::flow::{FlowId, FlowSettings, SourceSettings};
use crate::queue::{
    AddDestinationReply, AddSourceReply, Command, CommandReply, CommandSender, GetVersionReply, ReportQueue,
    StatusReply,
};
use crate::scheduler::Scheduler;
use crate::stats::Report;
use crate::time::Timestamp;

/// Crate version, used by the `flowgrindd` binary's `-v`/`--version` output.
/// `get_version`'s own `{version, ...}` field is built independently by
/// [`GetVersionReply::current`](crate::queue::GetVersionReply::current).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct DaemonHandle {
    commands: CommandSender,
    reports: Arc<ReportQueue>,
    _scheduler_thread: JoinHandle<()>,
}

impl DaemonHandle {
    /// Spawns the event loop on a dedicated OS thread. The loop never exits
    /// on its own (§5); dropping the handle leaves it running, matching a
    /// long-running daemon process.
    pub fn spawn() -> std::io::Result<DaemonHandle> {
        let reports = Arc::new(ReportQueue::new());
        let (mut scheduler, commands) = Scheduler::new(reports.clone())?;
        let scheduler_thread = std::thread::Builder::new()
            .name("flowgrind-scheduler".into())
            .spawn(move || scheduler.run())?;
        Ok(DaemonHandle { commands, reports, _scheduler_thread: scheduler_thread })
    }

    fn submit(&self, command: Command) -> CommandReply {
        self.commands.submit(command)
    }

    pub fn add_destination(&self, settings: FlowSettings) -> Result<AddDestinationReply> {
        match self.submit(Command::AddDestination(settings)) {
            CommandReply::AddDestination(r) => r,
            _ => unreachable!("submit returned the wrong reply variant"),
        }
    }

    pub fn add_source(&self, settings: FlowSettings, source: SourceSettings) -> Result<AddSourceReply> {
        match self.submit(Command::AddSource(settings, source)) {
            CommandReply::AddSource(r) => r,
            _ => unreachable!("submit returned the wrong reply variant"),
        }
    }

    pub fn start_flows(&self, start_timestamp: Timestamp) -> Result<()> {
        match self.submit(Command::StartFlows { start_timestamp }) {
            CommandReply::StartFlows(r) => r,
            _ => unreachable!("submit returned the wrong reply variant"),
        }
    }

    /// `flow_id = None` stops every active flow (§6 `StopFlow`).
    pub fn stop_flow(&self, flow_id: Option<FlowId>) -> Result<()> {
        match self.submit(Command::StopFlow(flow_id)) {
            CommandReply::StopFlow(r) => r,
            _ => unreachable!("submit returned the wrong reply variant"),
        }
    }

    pub fn get_status(&self) -> StatusReply {
        match self.submit(Command::GetStatus) {
            CommandReply::GetStatus(r) => r,
            _ => unreachable!("submit returned the wrong reply variant"),
        }
    }

    /// Drains up to 50 queued reports (§4.6 `GetReports`); does not go
    /// through the command queue since it only touches the report side.
    pub fn get_reports(&self) -> (Vec<Report>, bool) {
        self.reports.poll()
    }

    /// `{version, api, os_name, os_release}` (§6 `GetVersion`).
    pub fn get_version(&self) -> GetVersionReply {
        match self.submit(Command::GetVersion) {
            CommandReply::GetVersion(r) => r,
            _ => unreachable!("submit returned the wrong reply variant"),
        }
    }
}
