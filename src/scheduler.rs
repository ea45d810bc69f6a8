//! The event loop: readiness-based multiplexing, per-flow scheduling,
//! interval/final reporting, teardown (§4.7, C8 — core of the core).
//!
//! The original rebuilds its `select()` fd sets from scratch every
//! iteration and lets the kernel tell it which sockets are ready. Here
//! sockets are never individually registered with `mio`: the only
//! registered source is the command `Waker`, and `Poll::poll`'s bounded
//! timeout is used purely as a sleep — every tick, every live flow's
//! sockets are probed non-blockingly regardless of which (if any) event
//! fired. This trades a little busy-polling for not having to track
//! per-socket registration/interest state across iterations, while still
//! honoring pacing and reporting deadlines without any I/O at all (§4.7
//! step 2).

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use mio::{Events, Poll, Token, Waker};

use crate::block::{self, Header, MIN_BLOCK_SIZE};
use crate::destination::{self, AcceptOutcome};
use crate::error::{is_transient, FlowgrindError};
use crate::flow::{Direction, Flow, FlowId, FlowState, Role};
use crate::flow_list::FlowList;
use crate::queue::{
    self, AddDestinationReply, AddSourceReply, Command, CommandReceiver, CommandReply, CommandSender, ReportQueue,
    StatusReply,
};
use crate::socket_opts;
use crate::source;
use crate::stats::{self, ReportKind};
use crate::time::Timestamp;
use crate::trafgen;

const WAKE_TOKEN: Token = Token(0);
const POLL_TIMEOUT: Duration = Duration::from_millis(10);
/// Consecutive no-progress response-send attempts before giving up
/// (§4.7 "Response send").
const RESPONSE_RETRY_LIMIT: u32 = 10_000;

pub struct Scheduler {
    flows: FlowList,
    commands: CommandReceiver,
    reports: Arc<ReportQueue>,
    poll: Poll,
    events: Events,
    started: bool,
}

impl Scheduler {
    /// Builds the event loop and its command queue together, since the
    /// queue's wake-up mechanism is registered against the loop's own
    /// `Poll` instance. Returns the scheduler plus the façade-side sender.
    pub fn new(reports: Arc<ReportQueue>) -> std::io::Result<(Scheduler, CommandSender)> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        let (sender, commands) = queue::command_queue(waker);
        let scheduler = Scheduler {
            flows: FlowList::new(),
            commands,
            reports,
            poll,
            events: Events::with_capacity(256),
            started: false,
        };
        Ok((scheduler, sender))
    }

    /// Runs until the process is killed; the event loop never cancels
    /// itself (§5).
    pub fn run(&mut self) -> ! {
        loop {
            if let Err(e) = self.poll.poll(&mut self.events, Some(POLL_TIMEOUT)) {
                if e.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                log::error!("fatal: readiness wait failed: {e}");
                std::process::abort();
            }

            let now = Timestamp::now();
            let woke = self.events.iter().any(|e| e.token() == WAKE_TOKEN);
            if woke {
                let flows = &mut self.flows;
                let reports = &self.reports;
                let started = &mut self.started;
                self.commands.drain(|cmd| handle_command(flows, reports, started, cmd, now));
            }

            self.emit_interval_reports(now);
            self.service_io(now);
            self.teardown_finished(now);
        }
    }

    fn emit_interval_reports(&mut self, now: Timestamp) {
        for (_, flow) in self.flows.iter_mut() {
            let Some(mut next) = flow.next_report_at else { continue };
            if flow.settings.reporting_interval <= 0.0 || next.is_after(now) {
                continue;
            }
            let begin = flow.last_report_at.unwrap_or(flow.first_report_at.unwrap_or(now));
            if !stats::is_premature(begin, now, flow.settings.reporting_interval) {
                let probe = mtu_probe(flow);
                let report = stats::build_report(flow, ReportKind::Interval, begin, now, Some(probe.as_ref()));
                self.reports.push(report);
                flow.stats.interval.reset();
            }
            flow.last_report_at = Some(now);
            while !next.is_after(now) {
                next = next.add(flow.settings.reporting_interval);
            }
            flow.next_report_at = Some(next);
        }
    }

    fn service_io(&mut self, now: Timestamp) {
        for idx in self.flows.indices() {
            let Some(flow) = self.flows.get_mut(idx) else { continue };
            if flow.state == FlowState::WaitAccept {
                try_accept(flow);
                continue;
            }
            if flow.state != FlowState::Grind {
                continue;
            }
            if flow.source.as_ref().is_some_and(|s| s.late_connect) && !flow.connect_called && flow.write.started(now) {
                if let (Some(stream), Some(addr)) = (flow.fd.as_ref(), flow.dest_addr) {
                    match source::connect_now(stream, addr) {
                        Ok(()) => flow.connect_called = true,
                        Err(e) => flow.fail(format!("late connect failed: {e}")),
                    }
                }
            }
            service_write(flow, now);
            service_read(flow, now);
        }
    }

    fn teardown_finished(&mut self, now: Timestamp) {
        for idx in self.flows.indices() {
            let done = self.flows.get(idx).is_some_and(|f| f.both_finished() || f.last_error.is_some());
            if !done {
                continue;
            }
            if let Some(flow) = self.flows.remove(idx) {
                let begin = flow.first_report_at.unwrap_or(now);
                let probe = mtu_probe(&flow);
                let report = stats::build_report(&flow, ReportKind::Final, begin, now, Some(probe.as_ref()));
                self.reports.push(report);
                log::info!("flow {}: destroyed", flow.id);
            }
        }
        if self.flows.is_empty() {
            self.started = false;
        }
    }
}

#[cfg(target_os = "linux")]
fn mtu_probe(flow: &Flow) -> Box<dyn stats::MtuProbe + '_> {
    match &flow.fd {
        Some(stream) => {
            Box::new(stats::LinuxMtuProbe { fd: std::os::unix::io::AsRawFd::as_raw_fd(stream) })
        }
        None => Box::new(stats::NullMtuProbe),
    }
}

#[cfg(not(target_os = "linux"))]
fn mtu_probe(_flow: &Flow) -> Box<dyn stats::MtuProbe + '_> {
    Box::new(stats::NullMtuProbe)
}

fn try_accept(flow: &mut Flow) {
    let Some(listener) = flow.listenfd.take() else { return };
    let real_send = flow.listen_real_send_buffer_size;
    let real_read = flow.listen_real_read_buffer_size;
    match destination::accept_data(&listener, flow, real_send, real_read) {
        Ok(AcceptOutcome::Accepted(stream)) => {
            flow.fd = Some(stream);
            flow.connect_called = true;
        }
        Ok(AcceptOutcome::WouldBlock) => {
            flow.listenfd = Some(listener);
        }
        Err(e) => flow.fail(format!("accept failed: {e}")),
    }
}

/// Write-side state machine (§4.7 "Write path (`write_data`)").
fn service_write(flow: &mut Flow, now: Timestamp) {
    if flow.write.finished {
        return;
    }
    if !flow.write.started(now) {
        return;
    }
    if flow.write.past_stop(now) {
        flow.write.finished = true;
        if flow.settings.shutdown {
            if let Some(stream) = &flow.fd {
                let _ = stream.shutdown(std::net::Shutdown::Write);
            }
        }
        return;
    }
    if flow.next_write_at.is_after(now) {
        return;
    }

    loop {
        if flow.write_progress.at_boundary() {
            let max = flow.settings.maximum_block_size;
            let size = trafgen::next_request_size(&mut flow.rng, &flow.settings.request_trafgen_options, max);
            let response_size =
                trafgen::next_response_size(&mut flow.rng, &flow.settings.response_trafgen_options, max);
            flow.write_progress.current_block_size = size;
            let mut header = Header::new(&mut flow.write_buf[..]);
            header.build_request(size, response_size, Timestamp::now());
        }

        let Some(stream) = flow.fd.as_mut() else { return };
        let start = flow.write_progress.in_block_bytes as usize;
        let end = flow.write_progress.current_block_size as usize;
        match stream.write(&flow.write_buf[start..end]) {
            Ok(0) => {
                flow.fail("wrote zero bytes");
                return;
            }
            Ok(n) => {
                flow.stats.record_write_block(n as u64);
                flow.write_progress.in_block_bytes += n as i32;
            }
            Err(e) if is_transient(&e) => break,
            Err(e) => {
                flow.fail(format!("premature end of test: {e}"));
                return;
            }
        }

        if flow.write_progress.complete() {
            flow.write_progress.in_block_bytes = 0;
            flow.last_block_written_at = Some(now);
            flow.stats.record_request_block_written();

            let gap = trafgen::next_interpacket_gap(
                &mut flow.rng,
                &flow.settings.interpacket_gap_trafgen_options,
                flow.settings.maximum_block_size,
                flow.settings.write_rate,
            );
            if gap > 0.0 {
                flow.next_write_at = flow.next_write_at.add(gap);
                if now.is_after(flow.next_write_at) {
                    log::warn!("flow {}: incipient congestion, new block scheduled in the past", flow.id);
                    flow.congestion_count += 1;
                    if flow.congestion_count > crate::flow::CONGESTION_LIMIT && flow.settings.flow_control {
                        flow.fail("congestion limit exceeded");
                        return;
                    }
                }
            }
            if flow.settings.cork {
                if let Some(stream) = &flow.fd {
                    if socket_opts::toggle_tcp_cork(stream).is_err() {
                        log::debug!("flow {}: failed to re-cork test socket", flow.id);
                    }
                }
            }
        }

        if !flow.settings.pushy {
            break;
        }
    }
}

enum ReadOutcome {
    Progress,
    WouldBlock,
    Eof,
    Error(std::io::Error),
}

fn try_read(flow: &mut Flow, bytes: usize) -> ReadOutcome {
    if flow.fd.is_none() {
        return ReadOutcome::WouldBlock;
    }
    let start = flow.read_progress.in_block_bytes as usize;
    let stream = flow.fd.as_mut().unwrap();
    match stream.read(&mut flow.read_buf[start..start + bytes]) {
        Ok(0) => ReadOutcome::Eof,
        Ok(n) => {
            flow.stats.record_read_block(n as u64);
            flow.read_progress.in_block_bytes += n as i32;
            ReadOutcome::Progress
        }
        Err(e) if is_transient(&e) => ReadOutcome::WouldBlock,
        Err(e) => ReadOutcome::Error(e),
    }
}

/// Read-side state machine (§4.7 "Read path (`read_data`)").
fn service_read(flow: &mut Flow, now: Timestamp) {
    if !flow.connect_called {
        return;
    }
    if flow.read.finished {
        return;
    }
    if flow.read.past_stop(now) {
        flow.read.finished = true;
        return;
    }

    let min_header = MIN_BLOCK_SIZE as usize;

    loop {
        if (flow.read_progress.in_block_bytes as usize) < min_header {
            let remaining = min_header - flow.read_progress.in_block_bytes as usize;
            match try_read(flow, remaining) {
                ReadOutcome::WouldBlock => return,
                ReadOutcome::Eof => {
                    flow.read.finished = true;
                    return;
                }
                ReadOutcome::Error(e) => {
                    flow.fail(format!("premature end of test: {e}"));
                    return;
                }
                ReadOutcome::Progress => {}
            }
            if (flow.read_progress.in_block_bytes as usize) < min_header {
                return;
            }
        }

        let max = flow.settings.maximum_block_size;
        let header = Header::new(&flow.read_buf[..]);
        if let Some(size) = block::validate_block_size(header.this_block_size(), max) {
            flow.read_progress.current_block_size = size;
        } else {
            log::warn!("flow {}: parsed illegal block size {}, ignoring", flow.id, header.this_block_size());
        }
        let requested_response_size = block::validate_request_block_size(header.request_block_size(), max);
        if requested_response_size.is_none() {
            log::warn!("flow {}: parsed illegal request size {}, ignoring", flow.id, header.request_block_size());
        }

        if (flow.read_progress.in_block_bytes as usize) < flow.read_progress.current_block_size as usize {
            let remaining = flow.read_progress.current_block_size as usize - flow.read_progress.in_block_bytes as usize;
            match try_read(flow, remaining) {
                ReadOutcome::WouldBlock => return,
                ReadOutcome::Eof => {
                    flow.read.finished = true;
                    return;
                }
                ReadOutcome::Error(e) => {
                    flow.fail(format!("premature end of test: {e}"));
                    return;
                }
                ReadOutcome::Progress => {}
            }
        }

        if flow.read_progress.complete() {
            flow.read_progress.in_block_bytes = 0;
            let echoed = Header::new(&flow.read_buf[..]).timestamp();

            match requested_response_size {
                Some(block::RESPONSE_BLOCK) => {
                    flow.stats.record_response_block_read();
                    let rtt = echoed.diff(now);
                    if rtt < 0.0 {
                        log::warn!("flow {}: received malformed rtt block, ignoring", flow.id);
                    } else {
                        flow.stats.record_rtt(rtt);
                    }
                    flow.last_block_read_at = Some(now);
                }
                Some(size) => {
                    flow.stats.record_request_block_read();
                    if let Some(last) = flow.last_block_read_at {
                        let iat = last.diff(now);
                        if iat < 0.0 {
                            log::warn!("flow {}: calculated malformed iat, ignoring", flow.id);
                        } else {
                            flow.stats.record_iat(iat);
                        }
                    }
                    flow.last_block_read_at = Some(now);
                    let delay = echoed.diff(now);
                    if delay < 0.0 {
                        log::warn!("flow {}: calculated malformed delay, ignoring", flow.id);
                    } else {
                        flow.stats.record_delay(delay);
                    }

                    if size >= MIN_BLOCK_SIZE && !flow.read.finished {
                        send_response(flow, size, echoed);
                    }
                }
                None => {}
            }
        }

        if !flow.settings.pushy {
            break;
        }
    }
}

/// Busy-loops the response write to completion or gives up after
/// [`RESPONSE_RETRY_LIMIT`] consecutive `EAGAIN`s with no bytes sent
/// (§4.7 "Response send", grounded in `daemon.c`'s `send_response`).
fn send_response(flow: &mut Flow, size: i32, echoed_timestamp: Timestamp) {
    {
        let mut header = Header::new(&mut flow.response_buf[..]);
        header.build_response(size, echoed_timestamp);
    }
    let mut written = 0usize;
    let mut attempts = 0u32;
    loop {
        let Some(stream) = flow.fd.as_mut() else { return };
        match stream.write(&flow.response_buf[written..size as usize]) {
            Ok(n) => {
                flow.stats.record_write_block(n as u64);
                written += n;
                if written >= size as usize {
                    flow.stats.record_response_block_written();
                    return;
                }
            }
            Err(e) if is_transient(&e) => {
                attempts += 1;
                if attempts >= RESPONSE_RETRY_LIMIT && written == 0 {
                    log::warn!("flow {}: dropping response block after {} attempts", flow.id, attempts);
                    return;
                }
            }
            Err(e) => {
                log::warn!("flow {}: premature end of test sending response: {e}", flow.id);
                flow.read.finished = true;
                return;
            }
        }
    }
}

fn handle_command(
    flows: &mut FlowList,
    reports: &ReportQueue,
    started: &mut bool,
    cmd: Command,
    now: Timestamp,
) -> CommandReply {
    match cmd {
        Command::AddDestination(settings) => CommandReply::AddDestination(add_destination(flows, settings)),
        Command::AddSource(settings, source_settings) => {
            CommandReply::AddSource(add_source(flows, settings, source_settings))
        }
        Command::StartFlows { start_timestamp: _ } => {
            // The controller's absolute start timestamp is intentionally
            // ignored (§9 Open Question): flows start ~immediately.
            for (_, flow) in flows.iter_mut() {
                flow.write.start_at = Some(now.add(flow.settings.delay[Direction::Write as usize]));
                flow.read.start_at = Some(now.add(flow.settings.delay[Direction::Read as usize]));
                if flow.settings.duration[Direction::Write as usize] >= 0.0 {
                    flow.write.stop_at =
                        Some(flow.write.start_at.unwrap().add(flow.settings.duration[Direction::Write as usize]));
                }
                if flow.settings.duration[Direction::Read as usize] >= 0.0 {
                    flow.read.stop_at =
                        Some(flow.read.start_at.unwrap().add(flow.settings.duration[Direction::Read as usize]));
                }
                flow.next_write_at = flow.write.start_at.unwrap();
                flow.first_report_at = Some(now);
                if flow.settings.reporting_interval > 0.0 {
                    flow.next_report_at = Some(now.add(flow.settings.reporting_interval));
                }
                if flow.state != FlowState::WaitAccept {
                    flow.state = FlowState::Grind;
                }
            }
            *started = true;
            CommandReply::StartFlows(Ok(()))
        }
        Command::StopFlow(target) => {
            let ids: Vec<FlowId> = match target {
                Some(id) => vec![id],
                None => flows.iter().map(|(_, f)| f.id).collect(),
            };
            for id in ids {
                if let Some(idx) = flows.find_by_id(id) {
                    if let Some(flow) = flows.remove(idx) {
                        let begin = flow.first_report_at.unwrap_or(now);
                        let probe = mtu_probe(&flow);
                        let report = stats::build_report(&flow, ReportKind::Final, begin, now, Some(probe.as_ref()));
                        reports.push(report);
                    }
                }
            }
            CommandReply::StopFlow(Ok(()))
        }
        Command::GetStatus => CommandReply::GetStatus(StatusReply { started: *started, num_flows: flows.len() }),
        Command::GetVersion => CommandReply::GetVersion(queue::GetVersionReply::current()),
    }
}

fn add_destination(
    flows: &mut FlowList,
    settings: crate::flow::FlowSettings,
) -> crate::error::Result<AddDestinationReply> {
    if settings.maximum_block_size < MIN_BLOCK_SIZE {
        return Err(FlowgrindError::Admission("maximum_block_size below MIN_BLOCK_SIZE".into()));
    }
    let mut flow = Flow::new(0, Role::Destination, settings.clone(), None);
    let handles = destination::create_listen_socket(&settings.bind_address, &flow)?;
    flow.listen_real_send_buffer_size = handles.real_send_buffer_size;
    flow.listen_real_read_buffer_size = handles.real_read_buffer_size;
    flow.listenfd = Some(handles.listener);

    let idx = flows.insert(flow).map_err(|e| FlowgrindError::Admission(e.to_string()))?;
    let flow = flows.get_mut(idx).unwrap();
    flow.id = idx as FlowId;
    log::info!("flow {}: admitted as destination, listening on port {}", flow.id, handles.listen_port);

    Ok(AddDestinationReply {
        flow_id: flow.id,
        listen_port: handles.listen_port,
        real_send_buffer_size: flow.listen_real_send_buffer_size,
        real_read_buffer_size: flow.listen_real_read_buffer_size,
    })
}

fn add_source(
    flows: &mut FlowList,
    settings: crate::flow::FlowSettings,
    source_settings: crate::flow::SourceSettings,
) -> crate::error::Result<AddSourceReply> {
    if settings.maximum_block_size < MIN_BLOCK_SIZE {
        return Err(FlowgrindError::Admission("maximum_block_size below MIN_BLOCK_SIZE".into()));
    }
    let connect_immediately = !source_settings.late_connect;
    let (sock, addr) = source::create_socket(
        &source_settings.destination_host,
        source_settings.destination_port,
        &settings,
        connect_immediately,
    )?;
    socket_opts::apply_flow_settings(&sock.stream, &settings)?;
    let cc_alg = socket_opts::get_congestion_control(&sock.stream);
    let real_send_buffer_size = sock.real_send_buffer_size;
    let real_read_buffer_size = sock.real_read_buffer_size;

    let host = source_settings.destination_host.clone();
    let mut flow = Flow::new(0, Role::Source, settings, Some(source_settings));
    flow.dest_addr = Some(addr);
    flow.connect_called = connect_immediately;
    flow.fd = Some(sock.stream);
    if connect_immediately {
        flow.state = FlowState::Grind;
    }

    let idx = flows.insert(flow).map_err(|e| FlowgrindError::Admission(e.to_string()))?;
    let flow = flows.get_mut(idx).unwrap();
    flow.id = idx as FlowId;
    log::info!("flow {}: admitted as source ({}:{})", flow.id, host, addr.port());

    Ok(AddSourceReply { flow_id: flow.id, cc_alg, real_send_buffer_size, real_read_buffer_size })
}
