//! Non-blocking connection-oriented endpoint.
//!
//! Wraps a TCP socket with the state machine and three-way progress contract
//! the async scheduler interprets: a call either makes progress
//! ([`Progress::Ready`]), would block ([`Progress::WouldBlock`]), or fails
//! with an error whose structured code is also recorded into the
//! thread-scoped last-error slot.

use crate::option::{OptionStore, SocketOption, SocketOptionKey};
use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use readymux_poll::{record_error, EndpointId, ErrorCode};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, ErrorKind};
use std::mem::MaybeUninit;
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::AsRawFd;
use thiserror::Error;
use tracing::debug;

/// Endpoint lifecycle states.
///
/// `Broken` means no operation will ever succeed again on this handle;
/// `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    /// Created, not yet bound or connected.
    Init,
    /// Bound to a local address.
    Opened,
    /// Accepting incoming connections.
    Listening,
    /// Connection attempt in flight.
    Connecting,
    /// Connection established.
    Connected,
    /// Unrecoverable transport failure.
    Broken,
    /// Close in progress.
    Closing,
    /// Closed and released.
    Closed,
}

/// Endpoint errors.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("endpoint is not in a valid state for this operation")]
    InvalidState,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("transport failure ({code}): {message}")]
    Transport { code: ErrorCode, message: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Outcome of a non-blocking call that made progress or could not proceed
/// without blocking.
#[derive(Debug, PartialEq, Eq)]
pub enum Progress<T> {
    Ready(T),
    WouldBlock,
}

/// Out-of-band notification that an endpoint transitioned to
/// [`EndpointState::Broken`].
#[derive(Debug, Clone)]
pub struct LossEvent {
    pub id: EndpointId,
    pub code: ErrorCode,
    pub message: String,
}

/// Non-blocking connection-oriented endpoint.
///
/// Non-blocking mode is forced at construction and cannot be disabled, so a
/// scheduler-managed handle can never be driven in blocking mode by mistake.
pub struct Endpoint {
    socket: Socket,
    state: RwLock<EndpointState>,
    opts: Mutex<OptionStore>,
    loss_tx: Sender<LossEvent>,
    loss_rx: Receiver<LossEvent>,
}

impl Endpoint {
    /// Creates a new unbound endpoint.
    pub fn new(ipv6: bool) -> Result<Self, NetError> {
        let domain = if ipv6 { Domain::IPV6 } else { Domain::IPV4 };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| record_io(ErrorCode::Resource, e))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| record_io(ErrorCode::SockFail, e))?;
        Ok(Self::from_socket(socket, EndpointState::Init))
    }

    /// Wraps a freshly accepted socket; the endpoint is born connected.
    fn from_accepted(socket: Socket) -> Result<Self, NetError> {
        socket
            .set_nonblocking(true)
            .map_err(|e| record_io(ErrorCode::SockFail, e))?;
        Ok(Self::from_socket(socket, EndpointState::Connected))
    }

    fn from_socket(socket: Socket, state: EndpointState) -> Self {
        let (loss_tx, loss_rx) = unbounded();
        Endpoint {
            socket,
            state: RwLock::new(state),
            opts: Mutex::new(OptionStore::default()),
            loss_tx,
            loss_rx,
        }
    }

    /// The registry token for this endpoint.
    pub fn id(&self) -> EndpointId {
        EndpointId::from_raw(self.socket.as_raw_fd())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EndpointState {
        *self.state.read()
    }

    fn set_state(&self, new_state: EndpointState) {
        *self.state.write() = new_state;
    }

    /// True once the endpoint has an established connection.
    pub fn is_connected(&self) -> bool {
        self.state() == EndpointState::Connected
    }

    /// True once the endpoint has been closed.
    pub fn is_closed(&self) -> bool {
        self.state() == EndpointState::Closed
    }

    /// Receiver side of the connection-loss notification channel.
    ///
    /// Exactly one event is published per transition to
    /// [`EndpointState::Broken`].
    pub fn loss_events(&self) -> Receiver<LossEvent> {
        self.loss_rx.clone()
    }

    /// Binds the endpoint to a local address.
    pub fn bind(&self, addr: SocketAddr) -> Result<(), NetError> {
        if self.state() != EndpointState::Init {
            record_error(ErrorCode::InvalidArgument, "endpoint is already bound");
            return Err(NetError::InvalidState);
        }
        self.socket
            .set_reuse_address(true)
            .map_err(|e| record_io(ErrorCode::SockFail, e))?;
        self.socket
            .bind(&addr.into())
            .map_err(|e| record_io(ErrorCode::SockFail, e))?;
        self.set_state(EndpointState::Opened);
        Ok(())
    }

    /// Starts listening for incoming connections.
    pub fn listen(&self, backlog: i32) -> Result<(), NetError> {
        if self.state() != EndpointState::Opened {
            record_error(ErrorCode::InvalidArgument, "endpoint is not bound");
            return Err(NetError::InvalidState);
        }
        self.socket
            .listen(backlog)
            .map_err(|e| record_io(ErrorCode::SockFail, e))?;
        self.set_state(EndpointState::Listening);
        Ok(())
    }

    /// Initiates a connection attempt.
    ///
    /// Returns `Ready` on the rare immediate completion; `WouldBlock` means
    /// the attempt is in flight and completion must be confirmed with
    /// [`Endpoint::finish_connect`] after write readiness.
    pub fn try_connect(&self, addr: SocketAddr) -> Result<Progress<()>, NetError> {
        match self.state() {
            EndpointState::Init | EndpointState::Opened => {}
            _ => {
                record_error(ErrorCode::InvalidArgument, "endpoint cannot connect");
                return Err(NetError::InvalidState);
            }
        }
        match self.socket.connect(&addr.into()) {
            Ok(()) => {
                self.set_state(EndpointState::Connected);
                Ok(Progress::Ready(()))
            }
            Err(e)
                if e.raw_os_error() == Some(libc::EINPROGRESS)
                    || e.kind() == ErrorKind::WouldBlock =>
            {
                self.set_state(EndpointState::Connecting);
                Ok(Progress::WouldBlock)
            }
            Err(e) => Err(record_io(classify(&e), e)),
        }
    }

    /// Confirms an in-flight connection attempt.
    ///
    /// `Ready` means the connection is established; `WouldBlock` means the
    /// attempt is still in flight.
    pub fn finish_connect(&self) -> Result<Progress<()>, NetError> {
        match self.state() {
            EndpointState::Connected => return Ok(Progress::Ready(())),
            EndpointState::Connecting => {}
            _ => {
                record_error(ErrorCode::InvalidArgument, "no connection attempt in flight");
                return Err(NetError::InvalidState);
            }
        }
        if let Some((code, message)) = self.probe_error() {
            return Err(NetError::Transport { code, message });
        }
        // getpeername succeeds exactly once the handshake has completed.
        match self.socket.peer_addr() {
            Ok(_) => {
                self.set_state(EndpointState::Connected);
                Ok(Progress::Ready(()))
            }
            Err(_) => Ok(Progress::WouldBlock),
        }
    }

    /// Accepts one pending connection, if any.
    pub fn try_accept(&self) -> Result<Progress<(Endpoint, SocketAddr)>, NetError> {
        if self.state() != EndpointState::Listening {
            record_error(ErrorCode::InvalidArgument, "endpoint is not listening");
            return Err(NetError::InvalidState);
        }
        match self.socket.accept() {
            Ok((socket, addr)) => {
                let peer = addr.as_socket().ok_or_else(|| {
                    record_error(ErrorCode::SockFail, "invalid peer address");
                    NetError::InvalidArgument("invalid peer address".into())
                })?;
                Ok(Progress::Ready((Endpoint::from_accepted(socket)?, peer)))
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(Progress::WouldBlock),
            Err(e) => Err(record_io(classify(&e), e)),
        }
    }

    /// Sends as many bytes as the socket will take without blocking.
    pub fn try_send(&self, buf: &[u8]) -> Result<Progress<usize>, NetError> {
        self.require_connected()?;
        match self.socket.send(buf) {
            Ok(n) => Ok(Progress::Ready(n)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(Progress::WouldBlock),
            Err(e) if is_disconnect(&e) => Err(self.broken(ErrorCode::ConnLost, e.to_string())),
            Err(e) => Err(record_io(ErrorCode::SockFail, e)),
        }
    }

    /// Receives available bytes into `buf` without blocking.
    ///
    /// Observing end-of-stream (the peer closed the connection) transitions
    /// the endpoint to `Broken` and fails with a transport error.
    pub fn try_recv(&self, buf: &mut [u8]) -> Result<Progress<usize>, NetError> {
        self.require_connected()?;
        if buf.is_empty() {
            return Ok(Progress::Ready(0));
        }
        let uninit = unsafe {
            std::slice::from_raw_parts_mut(buf.as_mut_ptr() as *mut MaybeUninit<u8>, buf.len())
        };
        match self.socket.recv(uninit) {
            Ok(0) => Err(self.broken(ErrorCode::ConnLost, "peer closed the connection".into())),
            Ok(n) => Ok(Progress::Ready(n)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(Progress::WouldBlock),
            Err(e) if is_disconnect(&e) => Err(self.broken(ErrorCode::ConnLost, e.to_string())),
            Err(e) => Err(record_io(ErrorCode::SockFail, e)),
        }
    }

    /// Non-destructive liveness probe (`MSG_PEEK`).
    ///
    /// Returns false after transitioning the endpoint to `Broken` when peer
    /// teardown is detected. Alive, not-connected and inconclusive probes
    /// all return true.
    pub fn probe_liveness(&self) -> bool {
        if self.state() != EndpointState::Connected {
            return self.state() != EndpointState::Broken;
        }
        let mut probe = [MaybeUninit::<u8>::uninit()];
        match self.socket.peek(&mut probe) {
            Ok(0) => {
                self.broken(ErrorCode::ConnLost, "peer closed the connection".into());
                false
            }
            Ok(_) => true,
            Err(e) if e.kind() == ErrorKind::WouldBlock => true,
            Err(e) if is_disconnect(&e) => {
                self.broken(ErrorCode::ConnLost, e.to_string());
                false
            }
            Err(_) => true,
        }
    }

    /// Drains the socket-level pending error, transitioning to `Broken` and
    /// publishing a loss notification when one is found.
    pub fn probe_error(&self) -> Option<(ErrorCode, String)> {
        match self.socket.take_error() {
            Ok(Some(e)) => {
                let code = classify(&e);
                let message = e.to_string();
                self.broken(code, message.clone());
                Some((code, message))
            }
            Ok(None) => None,
            Err(_) => None,
        }
    }

    /// Closes the endpoint. Idempotent: closing an already closed endpoint
    /// is a no-op.
    pub fn close(&self) -> Result<(), NetError> {
        {
            let mut state = self.state.write();
            match *state {
                EndpointState::Closed => return Ok(()),
                _ => *state = EndpointState::Closing,
            }
        }
        // The peer may already be gone; a failed shutdown still closes.
        let _ = self.socket.shutdown(Shutdown::Both);
        self.set_state(EndpointState::Closed);
        debug!(id = self.id().as_raw(), "endpoint closed");
        Ok(())
    }

    /// The local address the endpoint is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, NetError> {
        self.socket
            .local_addr()
            .map_err(|e| record_io(ErrorCode::SockFail, e))?
            .as_socket()
            .ok_or_else(|| NetError::InvalidArgument("invalid local address".into()))
    }

    /// The remote address the endpoint is connected to.
    pub fn peer_addr(&self) -> Result<SocketAddr, NetError> {
        self.socket
            .peer_addr()
            .map_err(|e| record_io(ErrorCode::NotConnected, e))?
            .as_socket()
            .ok_or_else(|| NetError::InvalidArgument("invalid peer address".into()))
    }

    /// Sets a socket option. The tagged variant ties each key to its value
    /// type, so a mismatch is unrepresentable.
    pub fn set_option(&self, option: SocketOption) -> Result<(), NetError> {
        match option {
            SocketOption::ReceiveTimeout(timeout) => {
                self.opts.lock().receive_timeout = timeout;
            }
            SocketOption::SendTimeout(timeout) => {
                self.opts.lock().send_timeout = timeout;
            }
            SocketOption::ReceiveBuffer(size) => self
                .socket
                .set_recv_buffer_size(size)
                .map_err(|e| record_io(ErrorCode::SockFail, e))?,
            SocketOption::SendBuffer(size) => self
                .socket
                .set_send_buffer_size(size)
                .map_err(|e| record_io(ErrorCode::SockFail, e))?,
            SocketOption::ReuseAddress(reuse) => self
                .socket
                .set_reuse_address(reuse)
                .map_err(|e| record_io(ErrorCode::SockFail, e))?,
            SocketOption::Linger(linger) => self
                .socket
                .set_linger(linger)
                .map_err(|e| record_io(ErrorCode::SockFail, e))?,
        }
        Ok(())
    }

    /// Reads the current value of a socket option.
    pub fn get_option(&self, key: SocketOptionKey) -> Result<SocketOption, NetError> {
        Ok(match key {
            SocketOptionKey::ReceiveTimeout => {
                SocketOption::ReceiveTimeout(self.opts.lock().receive_timeout)
            }
            SocketOptionKey::SendTimeout => {
                SocketOption::SendTimeout(self.opts.lock().send_timeout)
            }
            SocketOptionKey::ReceiveBuffer => SocketOption::ReceiveBuffer(
                self.socket
                    .recv_buffer_size()
                    .map_err(|e| record_io(ErrorCode::SockFail, e))?,
            ),
            SocketOptionKey::SendBuffer => SocketOption::SendBuffer(
                self.socket
                    .send_buffer_size()
                    .map_err(|e| record_io(ErrorCode::SockFail, e))?,
            ),
            SocketOptionKey::ReuseAddress => SocketOption::ReuseAddress(
                self.socket
                    .reuse_address()
                    .map_err(|e| record_io(ErrorCode::SockFail, e))?,
            ),
            SocketOptionKey::Linger => SocketOption::Linger(
                self.socket
                    .linger()
                    .map_err(|e| record_io(ErrorCode::SockFail, e))?,
            ),
        })
    }

    fn require_connected(&self) -> Result<(), NetError> {
        match self.state() {
            EndpointState::Connected => Ok(()),
            EndpointState::Broken => {
                record_error(ErrorCode::ConnLost, "endpoint is broken");
                Err(NetError::Transport {
                    code: ErrorCode::ConnLost,
                    message: "endpoint is broken".into(),
                })
            }
            EndpointState::Closed | EndpointState::Closing => {
                record_error(ErrorCode::Closed, "endpoint is closed");
                Err(NetError::InvalidState)
            }
            _ => {
                record_error(ErrorCode::NotConnected, "endpoint is not connected");
                Err(NetError::InvalidState)
            }
        }
    }

    /// Transitions to `Broken` and publishes exactly one loss event per
    /// endpoint lifetime.
    fn broken(&self, code: ErrorCode, message: String) -> NetError {
        let first = {
            let mut state = self.state.write();
            match *state {
                EndpointState::Broken | EndpointState::Closing | EndpointState::Closed => false,
                _ => {
                    *state = EndpointState::Broken;
                    true
                }
            }
        };
        record_error(code, message.clone());
        if first {
            debug!(id = self.id().as_raw(), %code, "endpoint broken");
            let _ = self.loss_tx.send(LossEvent {
                id: self.id(),
                code,
                message: message.clone(),
            });
        }
        NetError::Transport { code, message }
    }
}

fn classify(e: &io::Error) -> ErrorCode {
    match e.raw_os_error() {
        Some(libc::ECONNREFUSED) => ErrorCode::ConnRefused,
        Some(libc::ECONNRESET) | Some(libc::EPIPE) | Some(libc::ECONNABORTED) => {
            ErrorCode::ConnLost
        }
        Some(libc::ETIMEDOUT) => ErrorCode::ConnSetup,
        Some(libc::ENOTCONN) => ErrorCode::NotConnected,
        _ => ErrorCode::SockFail,
    }
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::ECONNRESET) | Some(libc::EPIPE) | Some(libc::ECONNABORTED)
    )
}

fn record_io(code: ErrorCode, e: io::Error) -> NetError {
    record_error(code, e.to_string());
    NetError::Io(e)
}
