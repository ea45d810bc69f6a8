//! Destination role: listen, accept, transition into Grind (§4.8
//! "Destination", C10), grounded in `destination.c`.

use std::net::SocketAddr;

use mio::net::{TcpListener, TcpStream};

use crate::error::{FlowgrindError, Result};
use crate::flow::{Flow, FlowState};
use crate::socket_opts;

/// Everything `AddDestination` needs to hand back to the caller (§6).
pub struct ListenHandles {
    pub listener: TcpListener,
    pub listen_port: u16,
    pub real_send_buffer_size: i32,
    pub real_read_buffer_size: i32,
}

/// Creates the data-connection listen socket (`destination.c`'s
/// `create_listen_socket` + the buffer-size calls `add_flow_destination`
/// makes right after).
pub fn create_listen_socket(bind_address: &str, flow: &Flow) -> Result<ListenHandles> {
    let addr: SocketAddr = if bind_address.is_empty() {
        "0.0.0.0:0".parse().unwrap()
    } else {
        format!("{bind_address}:0")
            .parse()
            .map_err(|_| FlowgrindError::Admission(format!("invalid bind address {bind_address}")))?
    };

    let listener = TcpListener::bind(addr).map_err(|e| FlowgrindError::Admission(format!("bind failed: {e}")))?;
    let raw = std::os::unix::io::AsRawFd::as_raw_fd(&listener);

    // mtcp and congestion control must be set before listen(); mio's bind
    // already calls listen() internally, so we set them immediately after
    // bind but before any connection can be accepted.
    if flow.settings.mtcp {
        socket_opts::set_mtcp_raw(raw)?;
    }
    if let Some(cc_alg) = &flow.settings.cc_alg {
        socket_opts::set_congestion_control_raw(raw, cc_alg)?;
    }

    let real_send_buffer_size =
        socket_opts::set_window_size_directed(raw, flow.settings.requested_send_buffer_size, libc::SO_SNDBUF)?;
    let real_read_buffer_size =
        socket_opts::set_window_size_directed(raw, flow.settings.requested_read_buffer_size, libc::SO_RCVBUF)?;

    let listen_port = listener.local_addr().map_err(FlowgrindError::Io)?.port();

    Ok(ListenHandles { listener, listen_port, real_send_buffer_size, real_read_buffer_size })
}

/// Outcome of one non-blocking accept attempt.
pub enum AcceptOutcome {
    /// No connection pending yet.
    WouldBlock,
    /// Accepted and fully set up; the flow is ready for Grind.
    Accepted(TcpStream),
}

/// Accepts a pending connection and applies per-flow options
/// (`destination.c`'s `accept_data`).
pub fn accept_data(
    listener: &TcpListener,
    flow: &mut Flow,
    real_listen_send_buffer_size: i32,
    real_listen_read_buffer_size: i32,
) -> Result<AcceptOutcome> {
    let (stream, _peer) = match listener.accept() {
        Ok(pair) => pair,
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(AcceptOutcome::WouldBlock),
        Err(e) => return Err(FlowgrindError::Admission(format!("accept() failed: {e}"))),
    };

    let (real_send, real_read) = socket_opts::apply_flow_settings(&stream, &flow.settings)?;
    if real_send != real_listen_send_buffer_size {
        log::warn!(
            "flow {}: test socket send buffer ({}) does not match listen socket's ({})",
            flow.id,
            real_send,
            real_listen_send_buffer_size
        );
    }
    if real_read != real_listen_read_buffer_size {
        log::warn!(
            "flow {}: test socket receive buffer ({}) does not match listen socket's ({})",
            flow.id,
            real_read,
            real_listen_read_buffer_size
        );
    }

    flow.state = FlowState::Grind;
    log::info!("flow {}: data connection accepted", flow.id);
    Ok(AcceptOutcome::Accepted(stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{FlowSettings, Role};

    #[test]
    fn create_listen_socket_picks_an_ephemeral_port() {
        let flow = Flow::new(1, Role::Destination, FlowSettings::default(), None);
        let handles = create_listen_socket("127.0.0.1", &flow).unwrap();
        assert!(handles.listen_port > 0);
    }

    #[test]
    fn accept_before_any_connection_would_block() {
        let flow_settings = FlowSettings::default();
        let mut flow = Flow::new(1, Role::Destination, flow_settings, None);
        let handles = create_listen_socket("127.0.0.1", &flow).unwrap();
        let outcome = accept_data(
            &handles.listener,
            &mut flow,
            handles.real_send_buffer_size,
            handles.real_read_buffer_size,
        )
        .unwrap();
        assert!(matches!(outcome, AcceptOutcome::WouldBlock));
    }
}
