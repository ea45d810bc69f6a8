//! Per-flow statistics aggregation and report construction (§3 "Report",
//! §4.9, C11).

use crate::flow::{Direction, DirectionSchedule, Flow};
use crate::time::Timestamp;

/// Running min/max/sum/count for one sampled quantity (RTT, IAT, or delay).
#[derive(Debug, Clone, Copy)]
pub struct Sample {
    pub min: f64,
    pub max: f64,
    pub sum: f64,
    pub count: u64,
}

impl Default for Sample {
    fn default() -> Self {
        Sample { min: f64::INFINITY, max: f64::NEG_INFINITY, sum: 0.0, count: 0 }
    }
}

impl Sample {
    pub fn record(&mut self, value: f64) {
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.sum += value;
        self.count += 1;
    }

    /// `None` when no sample was ever recorded (§4.9 "not reported when no
    /// samples exist").
    pub fn avg(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    pub fn min_opt(&self) -> Option<f64> {
        (self.count > 0).then_some(self.min)
    }

    pub fn max_opt(&self) -> Option<f64> {
        (self.count > 0).then_some(self.max)
    }
}

/// One accumulator slot (Interval or Final); a flow keeps two, side by side.
#[derive(Debug, Clone, Default)]
pub struct Accumulator {
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub request_blocks_read: u32,
    pub request_blocks_written: u32,
    pub response_blocks_read: u32,
    pub response_blocks_written: u32,
    pub rtt: Sample,
    pub iat: Sample,
    pub delay: Sample,
    pub tcp_info: KernelTcpInfo,
}

impl Accumulator {
    pub fn reset(&mut self) {
        *self = Accumulator::default();
    }
}

/// A flow carries one accumulator reset every interval and one kept for its
/// whole lifetime.
#[derive(Debug, Clone, Default)]
pub struct Accumulators {
    pub interval: Accumulator,
    pub total: Accumulator,
}

impl Accumulators {
    pub fn record_write_block(&mut self, bytes: u64) {
        self.interval.bytes_written += bytes;
        self.total.bytes_written += bytes;
    }

    pub fn record_read_block(&mut self, bytes: u64) {
        self.interval.bytes_read += bytes;
        self.total.bytes_read += bytes;
    }

    pub fn record_request_block_written(&mut self) {
        self.interval.request_blocks_written += 1;
        self.total.request_blocks_written += 1;
    }

    pub fn record_response_block_written(&mut self) {
        self.interval.response_blocks_written += 1;
        self.total.response_blocks_written += 1;
    }

    pub fn record_request_block_read(&mut self) {
        self.interval.request_blocks_read += 1;
        self.total.request_blocks_read += 1;
    }

    pub fn record_response_block_read(&mut self) {
        self.interval.response_blocks_read += 1;
        self.total.response_blocks_read += 1;
    }

    pub fn record_rtt(&mut self, seconds: f64) {
        self.interval.rtt.record(seconds);
        self.total.rtt.record(seconds);
    }

    pub fn record_iat(&mut self, seconds: f64) {
        self.interval.iat.record(seconds);
        self.total.iat.record(seconds);
    }

    pub fn record_delay(&mut self, seconds: f64) {
        self.interval.delay.record(seconds);
        self.total.delay.record(seconds);
    }
}

/// Flowgrind's view of the kernel's `tcp_info`; zeros when unavailable
/// (§4.9, common.h's `_fg_tcp_info`).
#[derive(Debug, Clone, Copy, Default)]
pub struct KernelTcpInfo {
    pub snd_cwnd: i32,
    pub snd_ssthresh: i32,
    pub unacked: i32,
    pub sacked: i32,
    pub lost: i32,
    pub retrans: i32,
    pub retransmits: i32,
    pub fackets: i32,
    pub reordering: i32,
    pub rtt: i32,
    pub rttvar: i32,
    pub rto: i32,
    pub backoff: i32,
    pub snd_mss: i32,
    pub ca_state: i32,
    pub has_tcp_info: bool,
}

/// Capability trait for OS-specific kernel TCP counter collection (§9
/// "OS-specific TCP counters").
pub trait KernelTcpSampler {
    fn sample(&self) -> KernelTcpInfo;
}

/// Fallback sampler for platforms without a `TCP_INFO`-style getsockopt.
pub struct NullTcpSampler;

impl KernelTcpSampler for NullTcpSampler {
    fn sample(&self) -> KernelTcpInfo {
        KernelTcpInfo::default()
    }
}

#[cfg(target_os = "linux")]
pub struct LinuxTcpSampler<'a> {
    pub fd: std::os::unix::io::RawFd,
    _marker: std::marker::PhantomData<&'a ()>,
}

#[cfg(target_os = "linux")]
impl<'a> LinuxTcpSampler<'a> {
    pub fn new(fd: std::os::unix::io::RawFd) -> LinuxTcpSampler<'a> {
        LinuxTcpSampler { fd, _marker: std::marker::PhantomData }
    }
}

#[cfg(target_os = "linux")]
impl<'a> KernelTcpSampler for LinuxTcpSampler<'a> {
    fn sample(&self) -> KernelTcpInfo {
        let mut info: libc::tcp_info = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::tcp_info>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                self.fd,
                libc::IPPROTO_TCP,
                libc::TCP_INFO,
                &mut info as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if rc != 0 {
            return KernelTcpInfo::default();
        }
        KernelTcpInfo {
            snd_cwnd: info.tcpi_snd_cwnd as i32,
            snd_ssthresh: info.tcpi_snd_ssthresh as i32,
            unacked: info.tcpi_unacked as i32,
            sacked: info.tcpi_sacked as i32,
            lost: info.tcpi_lost as i32,
            retrans: info.tcpi_retrans as i32,
            retransmits: info.tcpi_retransmits as i32,
            fackets: info.tcpi_fackets as i32,
            reordering: info.tcpi_reordering as i32,
            rtt: info.tcpi_rtt as i32,
            rttvar: info.tcpi_rttvar as i32,
            rto: info.tcpi_rto as i32,
            backoff: info.tcpi_backoff as i32,
            snd_mss: info.tcpi_snd_mss as i32,
            ca_state: info.tcpi_ca_state as i32,
            has_tcp_info: true,
        }
    }
}

/// Capability trait for path/interface MTU probing (§9 "capability trait"
/// pattern; §H "get_imtu/get_pmtu").
pub trait MtuProbe {
    fn path_mtu(&self) -> i32;
    fn interface_mtu(&self) -> i32;
}

pub struct NullMtuProbe;

impl MtuProbe for NullMtuProbe {
    fn path_mtu(&self) -> i32 {
        0
    }
    fn interface_mtu(&self) -> i32 {
        0
    }
}

#[cfg(target_os = "linux")]
pub struct LinuxMtuProbe {
    pub fd: std::os::unix::io::RawFd,
}

#[cfg(target_os = "linux")]
impl MtuProbe for LinuxMtuProbe {
    fn path_mtu(&self) -> i32 {
        let mut mtu: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                self.fd,
                libc::IPPROTO_IP,
                libc::IP_MTU,
                &mut mtu as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if rc == 0 { mtu } else { 0 }
    }

    /// Finds the interface the flow's socket is bound to via `SIOCGIFCONF`
    /// and reads its MTU with `SIOCGIFMTU` (`fg_socket.c`'s `get_imtu`).
    fn interface_mtu(&self) -> i32 {
        const MAX_IFACES: usize = 20;
        let mut local: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut local_len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        if unsafe { libc::getsockname(self.fd, &mut local as *mut _ as *mut libc::sockaddr, &mut local_len) } < 0 {
            return 0;
        }

        let mut ifreqs: [libc::ifreq; MAX_IFACES] = unsafe { std::mem::zeroed() };
        let mut ifconf: libc::ifconf = unsafe { std::mem::zeroed() };
        ifconf.ifc_len = std::mem::size_of_val(&ifreqs) as libc::c_int;
        ifconf.ifc_ifcu.ifcu_buf = ifreqs.as_mut_ptr() as *mut libc::c_char;
        if unsafe { libc::ioctl(self.fd, libc::SIOCGIFCONF, &mut ifconf) } < 0 {
            return 0;
        }

        let nifaces = ifconf.ifc_len as usize / std::mem::size_of::<libc::ifreq>();
        let local_addr = &local as *const _ as *const libc::sockaddr_in;
        let local_ip = unsafe { (*local_addr).sin_addr.s_addr };

        for ifr in ifreqs.iter_mut().take(nifaces) {
            let ifr_addr = unsafe { &ifr.ifr_ifru.ifru_addr as *const _ as *const libc::sockaddr_in };
            if unsafe { (*ifr_addr).sin_addr.s_addr } != local_ip {
                continue;
            }
            if unsafe { libc::ioctl(self.fd, libc::SIOCGIFMTU, ifr) } < 0 {
                return 0;
            }
            let mtu = unsafe { ifr.ifr_ifru.ifru_mtu };
            return if mtu > 0 { mtu } else { 0 };
        }
        0
    }
}

/// Report kind (§3 "Report").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    Interval,
    Final,
}

/// Read/write micro-state encoded as ASCII letters into a 16-bit word,
/// reproduced verbatim from `daemon.c`'s `report_flow` (§H).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusFlags(pub u16);

impl StatusFlags {
    const DELAYED: u16 = b'd' as u16;
    const LIVE: u16 = b'l' as u16;
    const OFF: u16 = b'o' as u16;
    const FINISHED: u16 = b'f' as u16;
    const CLOSED: u16 = b'c' as u16;
    const NORMAL: u16 = b'n' as u16;

    fn direction_byte(now: Timestamp, sched: &DirectionSchedule, duration: f64, bytes: u64, flow_finished: bool) -> u16 {
        let in_delay = matches!(sched.start_at, Some(t) if t.is_after(now));
        let sending = !in_delay && (sched.stop_at.is_none() || !sched.past_stop(now));
        if bytes == 0 {
            if in_delay {
                Self::DELAYED
            } else if sending {
                Self::LIVE
            } else if duration == 0.0 {
                Self::OFF
            } else {
                Self::FINISHED
            }
        } else if !sending && !flow_finished {
            Self::CLOSED
        } else {
            Self::NORMAL
        }
    }

    /// `flow->statistics[type].bytes_{read,written}` and `now` come from the
    /// accumulator being reported and the report's `end` timestamp.
    pub fn compute(flow: &Flow, now: Timestamp, acc: &Accumulator) -> StatusFlags {
        let read_byte = Self::direction_byte(
            now,
            &flow.read,
            flow.settings.duration[Direction::Read as usize],
            acc.bytes_read,
            flow.both_finished(),
        );
        let write_byte = Self::direction_byte(
            now,
            &flow.write,
            flow.settings.duration[Direction::Write as usize],
            acc.bytes_written,
            flow.both_finished(),
        );
        StatusFlags((read_byte << 8) | write_byte)
    }
}

/// A measurement sample, either an Interval snapshot or the Final summary
/// (§3 "Report").
#[derive(Debug, Clone)]
pub struct Report {
    pub flow_id: crate::flow::FlowId,
    pub kind: ReportKind,
    pub begin: Timestamp,
    pub end: Timestamp,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub request_blocks_read: u32,
    pub request_blocks_written: u32,
    pub response_blocks_read: u32,
    pub response_blocks_written: u32,
    pub rtt: Sample,
    pub iat: Sample,
    pub delay: Sample,
    pub tcp_info: KernelTcpInfo,
    pub pmtu: i32,
    pub imtu: Option<i32>,
    pub status: StatusFlags,
}

/// Builds a report from a flow's accumulator slot (§4.9). `mtu` is `None`
/// when the flow's socket has already been released.
pub fn build_report(
    flow: &Flow,
    kind: ReportKind,
    begin: Timestamp,
    end: Timestamp,
    mtu: Option<&dyn MtuProbe>,
) -> Report {
    let acc = match kind {
        ReportKind::Interval => &flow.stats.interval,
        ReportKind::Final => &flow.stats.total,
    };
    let status = StatusFlags::compute(flow, end, acc);
    let (pmtu, imtu) = match mtu {
        Some(probe) => (probe.path_mtu(), (kind == ReportKind::Final).then(|| probe.interface_mtu())),
        None => (0, None),
    };
    Report {
        flow_id: flow.id,
        kind,
        begin,
        end,
        bytes_read: acc.bytes_read,
        bytes_written: acc.bytes_written,
        request_blocks_read: acc.request_blocks_read,
        request_blocks_written: acc.request_blocks_written,
        response_blocks_read: acc.response_blocks_read,
        response_blocks_written: acc.response_blocks_written,
        rtt: acc.rtt,
        iat: acc.iat,
        delay: acc.delay,
        tcp_info: acc.tcp_info,
        pmtu,
        imtu,
        status,
    }
}

/// A report is discarded when its covered duration is under 20% of the
/// configured interval (§4.9 "protects against very-early wake-ups").
pub fn is_premature(begin: Timestamp, end: Timestamp, reporting_interval: f64) -> bool {
    reporting_interval > 0.0 && end.diff(begin) < 0.2 * reporting_interval
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_min_max_avg_absent_without_data() {
        let s = Sample::default();
        assert_eq!(s.avg(), None);
        assert_eq!(s.min_opt(), None);
    }

    #[test]
    fn sample_accumulates_correctly() {
        let mut s = Sample::default();
        s.record(1.0);
        s.record(3.0);
        assert_eq!(s.min, 1.0);
        assert_eq!(s.max, 3.0);
        assert_eq!(s.avg(), Some(2.0));
    }

    #[test]
    fn accumulators_reset_only_touches_interval_slot() {
        let mut acc = Accumulators::default();
        acc.record_write_block(100);
        acc.interval.reset();
        assert_eq!(acc.interval.bytes_written, 0);
        assert_eq!(acc.total.bytes_written, 100);
    }

    #[test]
    fn is_premature_flags_short_reports() {
        let begin = Timestamp::new(0, 0);
        assert!(is_premature(begin, Timestamp::new(0, 100_000_000), 1.0));
        assert!(!is_premature(begin, Timestamp::new(1, 0), 1.0));
        assert!(!is_premature(begin, Timestamp::new(0, 1), 0.0));
    }

    #[test]
    fn status_flags_pack_read_high_write_low() {
        let mut flow = Flow::new(1, crate::flow::Role::Source, crate::flow::FlowSettings::default(), None);
        let now = Timestamp::new(10, 0);
        flow.read.start_at = Some(Timestamp::new(20, 0));
        flow.write.start_at = Some(Timestamp::new(20, 0));
        let acc = Accumulator::default();
        let status = StatusFlags::compute(&flow, now, &acc);
        assert_eq!((status.0 >> 8) as u8, b'd');
        assert_eq!((status.0 & 0xff) as u8, b'd');
    }
}
