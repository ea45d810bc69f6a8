//! TCP option application shared by the source and destination roles
//! (§4.8 "TCP options applied per flow"), grounded in `fg_socket.c`.
//!
//! Every option here either succeeds or fails admission outright — there is
//! no soft-fail path, matching "failing to apply a requested option fails
//! admission."

use std::os::unix::io::AsRawFd;

use mio::net::TcpStream;

use crate::error::{FlowgrindError, Result};
use crate::flow::{ExtraSocketOption, FlowSettings};

const TCP_ELCN: libc::c_int = 20;
const TCP_LCD: libc::c_int = 21;
const TCP_MTCP: libc::c_int = 15;

fn setsockopt_raw(fd: libc::c_int, level: libc::c_int, name: libc::c_int, value: &[u8]) -> std::io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            value.as_ptr() as *const libc::c_void,
            value.len() as libc::socklen_t,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

fn setsockopt_int(fd: libc::c_int, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> std::io::Result<()> {
    setsockopt_raw(fd, level, name, &value.to_ne_bytes())
}

fn admission(context: &str, err: std::io::Error) -> FlowgrindError {
    FlowgrindError::Admission(format!("{context}: {err}"))
}

/// Sets one side's socket buffer size, returning the kernel-realized value
/// (`fg_socket.c`'s `set_window_size_directed`); `0` means "just read it
/// back without setting."
pub fn set_window_size_directed(fd: libc::c_int, window: i32, direction: libc::c_int) -> Result<i32> {
    let mut w: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(fd, libc::SOL_SOCKET, direction, &mut w as *mut _ as *mut libc::c_void, &mut len)
    };
    if rc != 0 {
        return Err(admission("read socket buffer size", std::io::Error::last_os_error()));
    }
    if window <= 0 {
        return Ok(w);
    }

    let mut try_size = window;
    loop {
        if setsockopt_int(fd, libc::SOL_SOCKET, direction, try_size).is_ok() {
            break;
        }
        try_size = try_size * 7 / 8;
        if try_size <= w {
            break;
        }
    }

    let rc = unsafe {
        libc::getsockopt(fd, libc::SOL_SOCKET, direction, &mut w as *mut _ as *mut libc::c_void, &mut len)
    };
    if rc != 0 {
        return Err(admission("read back socket buffer size", std::io::Error::last_os_error()));
    }
    Ok(w)
}

/// Realized `(send, receive)` buffer sizes after requesting `window` bytes
/// on both (`0` leaves them at whatever the kernel already has).
pub fn set_window_size(fd: &TcpStream, window: i32) -> Result<(i32, i32)> {
    let raw = fd.as_raw_fd();
    let send = set_window_size_directed(raw, window, libc::SO_SNDBUF)?;
    let recv = set_window_size_directed(raw, window, libc::SO_RCVBUF)?;
    Ok((send, recv))
}

pub fn set_dscp(fd: &TcpStream, dscp: u8) -> Result<()> {
    if dscp & !0x3F != 0 {
        return Err(FlowgrindError::Admission(format!("dscp value {dscp} out of range")));
    }
    setsockopt_int(fd.as_raw_fd(), libc::IPPROTO_IP, libc::IP_TOS, (dscp as libc::c_int) << 2)
        .map_err(|e| admission("set dscp", e))
}

pub fn set_congestion_control_raw(fd: libc::c_int, cc_alg: &str) -> Result<()> {
    setsockopt_raw(fd, libc::IPPROTO_TCP, libc::TCP_CONGESTION, cc_alg.as_bytes())
        .map_err(|e| admission("set congestion control", e))
}

pub fn set_congestion_control(fd: &TcpStream, cc_alg: &str) -> Result<()> {
    set_congestion_control_raw(fd.as_raw_fd(), cc_alg)
}

/// Reads back the kernel-negotiated congestion control algorithm (§H
/// "Congestion-control readback").
pub fn get_congestion_control(fd: &TcpStream) -> Option<String> {
    let mut buf = [0u8; libc::TCP_CA_NAME_MAX as usize];
    let mut len = buf.len() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_CONGESTION,
            buf.as_mut_ptr() as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return None;
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    std::str::from_utf8(&buf[..end]).ok().map(|s| s.to_string())
}

pub fn set_elcn(fd: &TcpStream, enabled: bool) -> Result<()> {
    setsockopt_int(fd.as_raw_fd(), libc::IPPROTO_TCP, TCP_ELCN, enabled as libc::c_int)
        .map_err(|e| admission("set elcn", e))
}

pub fn set_lcd(fd: &TcpStream) -> Result<()> {
    setsockopt_int(fd.as_raw_fd(), libc::IPPROTO_TCP, TCP_LCD, 1).map_err(|e| admission("set lcd", e))
}

pub fn set_mtcp_raw(fd: libc::c_int) -> Result<()> {
    setsockopt_int(fd, libc::IPPROTO_TCP, TCP_MTCP, 1).map_err(|e| admission("set mtcp", e))
}

pub fn set_mtcp(fd: &TcpStream) -> Result<()> {
    set_mtcp_raw(fd.as_raw_fd())
}

pub fn set_nodelay(fd: &TcpStream) -> Result<()> {
    setsockopt_int(fd.as_raw_fd(), libc::IPPROTO_TCP, libc::TCP_NODELAY, 1).map_err(|e| admission("set nodelay", e))
}

pub fn set_so_debug(fd: &TcpStream) -> Result<()> {
    setsockopt_int(fd.as_raw_fd(), libc::SOL_SOCKET, libc::SO_DEBUG, 1).map_err(|e| admission("set so_debug", e))
}

pub fn set_tcp_cork(fd: &TcpStream, on: bool) -> Result<()> {
    setsockopt_int(fd.as_raw_fd(), libc::IPPROTO_TCP, libc::TCP_CORK, on as libc::c_int)
        .map_err(|e| admission("set tcp_cork", e))
}

/// Clears then re-sets `TCP_CORK` to flush any partially-built segment at a
/// block boundary (`fg_socket.c`'s `toggle_tcp_cork`).
pub fn toggle_tcp_cork(fd: &TcpStream) -> Result<()> {
    set_tcp_cork(fd, false)?;
    set_tcp_cork(fd, true)
}

pub fn set_ip_mtu_discover(fd: &TcpStream) -> Result<()> {
    setsockopt_int(fd.as_raw_fd(), libc::IPPROTO_IP, libc::IP_MTU_DISCOVER, libc::IP_PMTUDISC_DO)
        .map_err(|e| admission("set ip_mtu_discover", e))
}

pub fn set_route_record(fd: &TcpStream) -> Result<()> {
    const NROUTES: libc::c_int = 9;
    const IPOPT_NOP: u8 = 1;
    const IPOPT_RR: u8 = 7;
    const IPOPT_MINOFF: u8 = 4;

    let raw = fd.as_raw_fd();
    setsockopt_int(raw, libc::IPPROTO_IP, libc::IP_RECVOPTS, 1).map_err(|e| admission("enable IP_RECVOPTS", e))?;

    let mut rspace = [0u8; 3 + 4 * NROUTES as usize + 1];
    rspace[0] = IPOPT_NOP;
    rspace[1] = IPOPT_RR;
    rspace[2] = (rspace.len() - 1) as u8;
    rspace[3] = IPOPT_MINOFF;
    setsockopt_raw(raw, libc::IPPROTO_IP, libc::IP_OPTIONS, &rspace).map_err(|e| admission("set IP_OPTIONS", e))?;

    setsockopt_int(raw, libc::IPPROTO_TCP, libc::IP_TTL, NROUTES).map_err(|e| admission("set route_record ttl", e))
}

pub fn set_extra_socket_option(fd: &TcpStream, opt: &ExtraSocketOption) -> Result<()> {
    setsockopt_raw(fd.as_raw_fd(), opt.level, opt.optname, &opt.value)
        .map_err(|e| admission(&format!("extra socket option {}/{}", opt.level, opt.optname), e))
}

/// Applies every option `FlowSettings` asks for, in the order the original
/// source would have set them (§4.8). Returns the realized send/receive
/// buffer sizes.
pub fn apply_flow_settings(fd: &TcpStream, settings: &FlowSettings) -> Result<(i32, i32)> {
    let send_buf = settings.requested_send_buffer_size;
    let read_buf = settings.requested_read_buffer_size;
    let raw = fd.as_raw_fd();
    let real_send = set_window_size_directed(raw, send_buf, libc::SO_SNDBUF)?;
    let real_read = set_window_size_directed(raw, read_buf, libc::SO_RCVBUF)?;

    if let Some(cc_alg) = &settings.cc_alg {
        set_congestion_control(fd, cc_alg)?;
    }
    if settings.elcn {
        set_elcn(fd, true)?;
    }
    if settings.lcd {
        set_lcd(fd)?;
    }
    if settings.cork {
        set_tcp_cork(fd, true)?;
    }
    if settings.so_debug {
        set_so_debug(fd)?;
    }
    if settings.mtcp {
        set_mtcp(fd)?;
    }
    if settings.nonagle {
        set_nodelay(fd)?;
    }
    if settings.route_record {
        set_route_record(fd)?;
    }
    if settings.dscp != 0 {
        set_dscp(fd, settings.dscp)?;
    }
    if settings.ipmtudiscover {
        set_ip_mtu_discover(fd)?;
    }
    for opt in &settings.extra_socket_options {
        set_extra_socket_option(fd, opt)?;
    }

    Ok((real_send, real_read))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dscp_out_of_range_is_rejected_before_touching_the_socket() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = std::net::TcpStream::connect(addr).unwrap();
        let mio_stream = TcpStream::from_std(stream);
        let err = set_dscp(&mio_stream, 0x7F).unwrap_err();
        assert!(matches!(err, FlowgrindError::Admission(_)));
    }

    #[test]
    fn window_size_zero_only_reads_back() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = std::net::TcpStream::connect(addr).unwrap();
        let mio_stream = TcpStream::from_std(stream);
        let (send, recv) = set_window_size(&mio_stream, 0).unwrap();
        assert!(send > 0 && recv > 0);
    }
}
