//! Source role: connect (eager or late), send-side admission (§4.8
//! "Source", C9), grounded in `source.c`.

use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, FromRawFd};

use mio::net::TcpStream;

use crate::error::{FlowgrindError, Result};
use crate::flow::FlowSettings;
use crate::socket_opts;

/// Result of creating the data socket (`source.c`'s `name2socket`): the
/// socket itself plus the buffer sizes the kernel actually granted.
pub struct SourceSocket {
    pub stream: TcpStream,
    pub real_send_buffer_size: i32,
    pub real_read_buffer_size: i32,
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| FlowgrindError::Admission(format!("getaddrinfo({host}:{port}) failed: {e}")))?
        .next()
        .ok_or_else(|| FlowgrindError::Admission(format!("no address found for {host}:{port}")))
}

/// Creates the data socket, applies buffer sizes, and optionally connects
/// immediately. Late-connecting flows get a socket with buffer sizes
/// already applied but `connect()` deferred to `connect_now`.
pub fn create_socket(host: &str, port: u16, settings: &FlowSettings, connect_immediately: bool) -> Result<(SourceSocket, SocketAddr)> {
    let addr = resolve(host, port)?;

    let domain = if addr.is_ipv4() { libc::AF_INET } else { libc::AF_INET6 };
    let raw = unsafe { libc::socket(domain, libc::SOCK_STREAM, 0) };
    if raw < 0 {
        return Err(FlowgrindError::Io(std::io::Error::last_os_error()));
    }

    let real_send_buffer_size =
        socket_opts::set_window_size_directed(raw, settings.requested_send_buffer_size, libc::SO_SNDBUF)?;
    let real_read_buffer_size =
        socket_opts::set_window_size_directed(raw, settings.requested_read_buffer_size, libc::SO_RCVBUF)?;

    set_nonblocking_raw(raw)?;

    if connect_immediately {
        connect_raw(raw, addr)?;
    }

    let stream = unsafe { TcpStream::from_std(std::net::TcpStream::from_raw_fd(raw)) };
    Ok((SourceSocket { stream, real_send_buffer_size, real_read_buffer_size }, addr))
}

fn set_nonblocking_raw(fd: libc::c_int) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    let flags = if flags == -1 { 0 } else { flags };
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc == -1 {
        Err(FlowgrindError::Admission(format!("set non-blocking failed: {}", std::io::Error::last_os_error())))
    } else {
        Ok(())
    }
}

fn sockaddr_from(addr: SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr { s_addr: u32::from_ne_bytes(v4.ip().octets()) },
                sin_zero: [0; 8],
            };
            unsafe { std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin) };
            std::mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: 0,
                sin6_addr: libc::in6_addr { s6_addr: v6.ip().octets() },
                sin6_scope_id: 0,
            };
            unsafe { std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6) };
            std::mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

/// Issues the non-blocking connect; `EINPROGRESS` is not an error (§4.8,
/// §4.7 "connect now").
fn connect_raw(fd: libc::c_int, addr: SocketAddr) -> Result<()> {
    let (storage, len) = sockaddr_from(addr);
    let rc = unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EINPROGRESS) {
        Ok(())
    } else {
        Err(FlowgrindError::Admission(format!("connect() failed: {err}")))
    }
}

/// Issues the deferred connect for a late-connecting flow, at the moment of
/// its scheduled first write (§4.8 "When `late_connect`, connect at the
/// moment of scheduled first write").
pub fn connect_now(stream: &TcpStream, addr: SocketAddr) -> Result<()> {
    connect_raw(stream.as_raw_fd(), addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_localhost_succeeds() {
        let addr = resolve("127.0.0.1", 80).unwrap();
        assert!(addr.is_ipv4());
    }

    #[test]
    fn create_socket_late_connect_does_not_connect_yet() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let settings = FlowSettings::default();
        let (sock, addr) = create_socket("127.0.0.1", port, &settings, false).unwrap();
        assert!(sock.real_send_buffer_size > 0);
        // Connect is deferred; issuing it now should still succeed (EINPROGRESS or immediate).
        connect_now(&sock.stream, addr).unwrap();
    }
}
