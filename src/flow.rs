//! Per-flow state (§3 "Flow", §4.5 C5).
//!
//! A `Flow` is owned exclusively by the scheduler once admitted; nothing
//! outside the event loop thread ever touches its fields (§5 "Shared-resource
//! policy").

use mio::net::{TcpListener, TcpStream};

use crate::block::MIN_BLOCK_SIZE;
use crate::math::{Distribution, FlowRng};
use crate::stats::Accumulators;
use crate::time::Timestamp;

pub type FlowId = i32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Source,
    Destination,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    WaitConnect,
    WaitAccept,
    Grind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Write,
    Read,
}

pub const MAX_EXTRA_SOCKET_OPTIONS: usize = 10;
pub const MAX_EXTRA_SOCKET_OPTION_VALUE_LEN: usize = 100;
pub const MAX_FLOWS: usize = 2048;
/// Consecutive late sends before a `flow_control`-enabled flow is aborted (§4.7).
pub const CONGESTION_LIMIT: u32 = 10_000;

/// One `(distribution, param_one, param_two)` traffic generator (§4.3).
#[derive(Debug, Clone, Copy)]
pub struct TrafgenOptions {
    pub distribution: Distribution,
    pub param_one: f64,
    pub param_two: f64,
}

impl Default for TrafgenOptions {
    fn default() -> Self {
        TrafgenOptions { distribution: Distribution::Constant, param_one: 0.0, param_two: 0.0 }
    }
}

/// An opaque `(level, optname, value)` socket option, applied verbatim via
/// `setsockopt` (common.h's `_extra_socket_options`).
#[derive(Debug, Clone)]
pub struct ExtraSocketOption {
    pub level: i32,
    pub optname: i32,
    pub value: Vec<u8>,
}

/// Per-direction schedule: when it starts, when (if ever) it stops, and
/// whether it has run to completion.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectionSchedule {
    pub start_at: Option<Timestamp>,
    pub stop_at: Option<Timestamp>,
    pub finished: bool,
}

impl DirectionSchedule {
    pub fn started(&self, now: Timestamp) -> bool {
        matches!(self.start_at, Some(t) if !t.is_after(now))
    }

    pub fn past_stop(&self, now: Timestamp) -> bool {
        matches!(self.stop_at, Some(t) if !t.is_after(now))
    }
}

/// Settings carried into a flow at admission; immutable once the flow starts
/// (§3 "Settings").
#[derive(Debug, Clone)]
pub struct FlowSettings {
    pub bind_address: String,

    pub delay: [f64; 2],
    pub duration: [f64; 2],

    pub reporting_interval: f64,

    pub requested_send_buffer_size: i32,
    pub requested_read_buffer_size: i32,

    pub maximum_block_size: i32,

    pub traffic_dump: bool,
    pub so_debug: bool,
    pub route_record: bool,
    pub pushy: bool,
    pub shutdown: bool,

    pub write_rate: Option<u32>,

    pub random_seed: u64,

    pub flow_control: bool,
    pub byte_counting: bool,

    pub cork: bool,
    pub nonagle: bool,
    pub cc_alg: Option<String>,
    pub elcn: bool,
    pub lcd: bool,
    pub mtcp: bool,
    pub dscp: u8,
    pub ipmtudiscover: bool,

    pub request_trafgen_options: TrafgenOptions,
    pub response_trafgen_options: TrafgenOptions,
    pub interpacket_gap_trafgen_options: TrafgenOptions,

    pub extra_socket_options: Vec<ExtraSocketOption>,
}

impl Default for FlowSettings {
    fn default() -> Self {
        FlowSettings {
            bind_address: String::new(),
            delay: [0.0, 0.0],
            duration: [0.0, 0.0],
            reporting_interval: 0.0,
            requested_send_buffer_size: 0,
            requested_read_buffer_size: 0,
            maximum_block_size: MIN_BLOCK_SIZE,
            traffic_dump: false,
            so_debug: false,
            route_record: false,
            pushy: false,
            shutdown: false,
            write_rate: None,
            random_seed: 0,
            flow_control: false,
            byte_counting: false,
            cork: false,
            nonagle: false,
            cc_alg: None,
            elcn: false,
            lcd: false,
            mtcp: false,
            dscp: 0,
            ipmtudiscover: false,
            request_trafgen_options: TrafgenOptions::default(),
            response_trafgen_options: TrafgenOptions::default(),
            interpacket_gap_trafgen_options: TrafgenOptions::default(),
            extra_socket_options: Vec::new(),
        }
    }
}

/// Source-only admission parameters (§3 "Source role additionally carries").
#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub destination_host: String,
    pub destination_port: u16,
    pub late_connect: bool,
}

/// Block-boundary progress for one direction of I/O.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockProgress {
    pub current_block_size: i32,
    pub in_block_bytes: i32,
}

impl BlockProgress {
    pub fn at_boundary(&self) -> bool {
        self.in_block_bytes == 0
    }

    pub fn complete(&self) -> bool {
        self.in_block_bytes >= self.current_block_size && self.current_block_size > 0
    }
}

pub struct Flow {
    pub id: FlowId,
    pub role: Role,
    pub state: FlowState,
    pub settings: FlowSettings,
    pub source: Option<SourceSettings>,

    pub fd: Option<TcpStream>,
    pub listenfd: Option<TcpListener>,
    /// Destination address, for a source flow that has not connected yet.
    pub dest_addr: Option<std::net::SocketAddr>,
    /// Whether `connect()` has been issued (always true immediately for
    /// eager-connect sources; set at first scheduled write for late ones).
    pub connect_called: bool,
    /// Listen socket's realized buffer sizes, to compare against the
    /// accepted socket's (§4.8 "verify realized buffer sizes match").
    pub listen_real_send_buffer_size: i32,
    pub listen_real_read_buffer_size: i32,

    pub write_buf: Vec<u8>,
    pub read_buf: Vec<u8>,
    /// Separate from `write_buf` so a response triggered mid-read never
    /// clobbers an in-flight generated write block.
    pub response_buf: Vec<u8>,

    pub write: DirectionSchedule,
    pub read: DirectionSchedule,

    pub write_progress: BlockProgress,
    pub read_progress: BlockProgress,
    /// Size of response requested by the peer for the block currently being
    /// written (0 if none).
    pub current_response_size: i32,

    pub next_write_at: Timestamp,
    pub last_block_written_at: Option<Timestamp>,
    pub last_block_read_at: Option<Timestamp>,

    pub first_report_at: Option<Timestamp>,
    pub last_report_at: Option<Timestamp>,
    pub next_report_at: Option<Timestamp>,

    pub congestion_count: u32,

    pub rng: FlowRng,
    pub stats: Accumulators,
    pub last_error: Option<String>,
    /// Response write back-off counter (§4.7 "Response send").
    pub response_retry_count: u32,
}

impl Flow {
    pub fn new(id: FlowId, role: Role, settings: FlowSettings, source: Option<SourceSettings>) -> Flow {
        let rng = FlowRng::new(settings.random_seed);
        let buf_size = settings.maximum_block_size.max(MIN_BLOCK_SIZE) as usize;
        Flow {
            id,
            role,
            state: match role {
                Role::Source => FlowState::WaitConnect,
                Role::Destination => FlowState::WaitAccept,
            },
            settings,
            source,
            fd: None,
            listenfd: None,
            dest_addr: None,
            connect_called: false,
            listen_real_send_buffer_size: 0,
            listen_real_read_buffer_size: 0,
            write_buf: vec![0u8; buf_size],
            read_buf: vec![0u8; buf_size],
            response_buf: vec![0u8; buf_size],
            write: DirectionSchedule::default(),
            read: DirectionSchedule::default(),
            write_progress: BlockProgress::default(),
            read_progress: BlockProgress::default(),
            current_response_size: 0,
            next_write_at: Timestamp::ZERO,
            last_block_written_at: None,
            last_block_read_at: None,
            first_report_at: None,
            last_report_at: None,
            next_report_at: None,
            congestion_count: 0,
            rng,
            stats: Accumulators::default(),
            last_error: None,
            response_retry_count: 0,
        }
    }

    pub fn both_finished(&self) -> bool {
        self.write.finished && self.read.finished
    }

    pub fn direction(&self, dir: Direction) -> &DirectionSchedule {
        match dir {
            Direction::Write => &self.write,
            Direction::Read => &self.read,
        }
    }

    pub fn direction_mut(&mut self, dir: Direction) -> &mut DirectionSchedule {
        match dir {
            Direction::Write => &mut self.write,
            Direction::Read => &mut self.read,
        }
    }

    /// Records a terminal flow error (§7); does not itself destroy the flow.
    pub fn fail(&mut self, message: impl Into<String>) {
        let message = message.into();
        log::warn!("flow {}: {}", self.id, message);
        self.last_error = Some(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_source_flow_starts_in_wait_connect() {
        let f = Flow::new(1, Role::Source, FlowSettings::default(), None);
        assert_eq!(f.state, FlowState::WaitConnect);
        assert!(!f.both_finished());
    }

    #[test]
    fn new_destination_flow_starts_in_wait_accept() {
        let f = Flow::new(2, Role::Destination, FlowSettings::default(), None);
        assert_eq!(f.state, FlowState::WaitAccept);
    }

    #[test]
    fn direction_schedule_started_and_past_stop() {
        let now = Timestamp::new(100, 0);
        let mut d = DirectionSchedule::default();
        d.start_at = Some(Timestamp::new(50, 0));
        d.stop_at = Some(Timestamp::new(150, 0));
        assert!(d.started(now));
        assert!(!d.past_stop(now));
        d.stop_at = Some(Timestamp::new(100, 0));
        assert!(d.past_stop(now));
    }

    #[test]
    fn block_progress_boundary_and_complete() {
        let mut p = BlockProgress { current_block_size: 10, in_block_bytes: 0 };
        assert!(p.at_boundary());
        assert!(!p.complete());
        p.in_block_bytes = 10;
        assert!(p.complete());
    }
}
