// This module contains the client-side session: bootstrap plus the loop
// that drives a single transfer from the initial request until it closes.
//
// A session is created when the user asks for a download or an upload. It
// works in roughly the following stages:
//
// 1. Resolve the server, bind a local socket on a random port (the client's
//    transfer ID), and open the local file for the chosen direction.
// 2. Enter a phase of send and wait cycles. Each cycle puts the packet the
//    session is answerable for on the wire, then waits for the server's
//    reply up to a deadline. A reply advances the state machine in
//    crate::transfer and swaps in the next packet; silence retransmits the
//    same bytes with exponentially growing spacing until the retry budget
//    runs out.
// 3. Eventually the transfer reaches a terminal state: the final ack of a
//    download goes out unconfirmed, the final data block of an upload is
//    acknowledged, the server reports an error, or the budget is exhausted.
//
// The server answers the first request from a freshly chosen port, its
// transfer ID for the session. The first reply fixes that ID; packets from
// anyone else are answered with an error packet and otherwise ignored.

use crate::tftp::{ErrorCode, FileMode, Packet, SocketError, TftpSocket};
use crate::transfer::{Action, State, Transfer};
use rand::Rng;
use std::error;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;
use tokio::io;
use tokio::time::Instant;

/// Spacing before the first retransmission; doubles on every resend of the
/// same packet.
const INITIAL_BACKOFF: Duration = Duration::from_millis(50);

/// How many times a packet is put on the wire before the transfer is
/// abandoned.
const MAX_ATTEMPTS: u32 = 6;

/// How many random local ports to try before giving up on a candidate
/// endpoint.
const BIND_ATTEMPTS: u32 = 16;

/// Which side of the transfer this client drives.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Direction {
    /// Download: read the remote file into a local one.
    Read,
    /// Upload: write a local file to the remote name.
    Write,
}

/// An object responsible for driving one transfer.
pub struct ClientSession {
    /// The TFTP socket used to send and receive packets.
    sock: TftpSocket,

    /// The address packets are sent to. Starts as the server's well-known
    /// endpoint; rebound to the server's transfer ID when the first reply
    /// arrives.
    remote: SocketAddr,

    /// Whether the server's transfer ID has been fixed yet.
    tid_locked: bool,

    /// The state machine and local file for this transfer.
    transfer: Transfer,

    /// Encoded bytes of the packet this session is answerable for
    /// retransmitting. Overwritten only when the state machine advances.
    pending: Vec<u8>,

    /// Absolute deadline for the next retransmission; unset right after a
    /// state advance, so the next loop pass sends immediately and re-arms.
    deadline: Option<Instant>,

    /// Current retransmission spacing.
    backoff: Duration,

    /// Wait cycles left for the outstanding packet.
    retries_left: u32,
}

async fn send_error_packet(sock: &TftpSocket, dst: SocketAddr, code: ErrorCode, message: String) {
    // Error packet is sent as a courtesy, we don't care how it goes.
    let _ = sock.send(&Packet::Error { code, message }, dst).await;
}

/// Attempts to bind a datagram socket on a random port, in the address
/// family of the remote endpoint. The random port is the transfer ID this
/// client presents to the server.
fn bind_random_socket(remote: &SocketAddr) -> Result<TftpSocket, ClientError> {
    let mut rng = rand::thread_rng();
    for _ in 0..BIND_ATTEMPTS {
        let local: SocketAddr = match remote {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, rng.gen_range(1024..65535)).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, rng.gen_range(1024..65535)).into(),
        };
        match TftpSocket::bind(local) {
            Ok(sock) => return Ok(sock),
            Err(e) => log::warn!("couldn't bind {local}: {e}"),
        }
    }
    Err(ClientError::Resolve(format!("no usable local port for {remote}")))
}

/// Resolves `host:port` and binds a local socket for the first candidate
/// endpoint that accepts one. The winning candidate becomes the initial
/// remote endpoint; the server re-chooses its port once the transfer starts.
fn open_session_socket(host: &str, port: u16) -> Result<(TftpSocket, SocketAddr), ClientError> {
    let candidates = (host, port)
        .to_socket_addrs()
        .map_err(|e| ClientError::Resolve(format!("{host}:{port}: {e}")))?;

    let mut found_any = false;
    for remote in candidates {
        found_any = true;
        match bind_random_socket(&remote) {
            Ok(sock) => return Ok((sock, remote)),
            Err(e) => log::warn!("skipping candidate {remote}: {e}"),
        }
    }

    if found_any {
        Err(ClientError::Resolve(format!("no candidate endpoint for {host}:{port} allowed a socket")))
    } else {
        Err(ClientError::Resolve(format!("no addresses found for {host}:{port}")))
    }
}

impl ClientSession {
    /// Resolves the server, opens the local file, and stages the initial
    /// request packet. The transfer itself runs in [`ClientSession::run`].
    pub async fn connect(
        host: &str,
        port: u16,
        direction: Direction,
        remote_path: &str,
        local_path: &Path,
        mode: FileMode,
    ) -> Result<ClientSession, ClientError> {
        let (sock, remote) = open_session_socket(host, port)?;
        if let Ok(local) = sock.local_addr() {
            log::debug!("bound local port {} for server {remote}", local.port());
        }

        let (transfer, request) = match direction {
            Direction::Read => (
                Transfer::new_download(local_path).await?,
                Packet::ReadReq { path: remote_path.to_string(), mode },
            ),
            Direction::Write => (
                Transfer::new_upload(local_path).await?,
                Packet::WriteReq { path: remote_path.to_string(), mode },
            ),
        };

        let pending = request.to_bytes()?;
        Ok(ClientSession {
            sock,
            remote,
            tid_locked: false,
            transfer,
            pending,
            deadline: None,
            backoff: INITIAL_BACKOFF,
            retries_left: MAX_ATTEMPTS,
        })
    }

    /// Does the work of sending and receiving packets until the transfer
    /// completes, the server reports an error, or the retry budget runs out.
    pub async fn run(&mut self) -> Result<(), ClientError> {
        loop {
            let now = Instant::now();
            let deadline = match self.deadline {
                // The state machine just advanced: put its packet on the wire
                // and arm the timer from scratch.
                None => {
                    self.sock.send_to(&self.pending, self.remote).await?;
                    if self.transfer.state() == State::LastAckSent {
                        // The final ack confirms nothing for us; it is on the
                        // wire and the transfer is over.
                        log::info!("transfer complete");
                        return Ok(());
                    }
                    self.backoff = INITIAL_BACKOFF;
                    let deadline = now + self.backoff;
                    self.deadline = Some(deadline);
                    deadline
                }
                // The deadline passed with no usable reply: resend the same
                // bytes and back off.
                Some(deadline) if now >= deadline => {
                    log::debug!("no reply within {:?}, retransmitting", self.backoff);
                    self.sock.send_to(&self.pending, self.remote).await?;
                    self.backoff *= 2;
                    let deadline = now + self.backoff;
                    self.deadline = Some(deadline);
                    deadline
                }
                Some(deadline) => deadline,
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.sock.recv_with_timeout(remaining).await {
                Ok((packet, src)) => {
                    if !self.check_source(src).await {
                        continue;
                    }
                    log::debug!("got packet from {src}: {packet:?}");

                    match self.transfer.process_packet(&packet).await {
                        Action::SendAndAwait(p) => {
                            self.pending = p.to_bytes()?;
                            self.deadline = None;
                            self.retries_left = MAX_ATTEMPTS;
                        }
                        Action::SendAndClose(p) => {
                            // Sent on the next loop pass, which also ends the
                            // session.
                            self.pending = p.to_bytes()?;
                            self.deadline = None;
                        }
                        Action::Close => {
                            log::info!("transfer complete");
                            return Ok(());
                        }
                        Action::PeerError { code, message } => {
                            return Err(ClientError::Peer { code, message });
                        }
                        Action::Abort { packet, reason } => {
                            // Courtesy error for the server; we don't care
                            // how it goes.
                            let _ = self.sock.send(&packet, self.remote).await;
                            return Err(ClientError::LocalIo(reason));
                        }
                        Action::Ignore => {}
                    }
                }
                Err(SocketError::Timeout(_)) => {
                    self.retries_left -= 1;
                    if self.retries_left == 0 {
                        log::error!("timeout, aborting");
                        return Err(ClientError::TimedOut);
                    }
                }
                // A datagram arrived but was not a TFTP packet. The peer is
                // silent from our point of view: neither the timer nor the
                // retry budget moves.
                Err(SocketError::PacketParse(msg)) => {
                    log::debug!("dropping malformed datagram: {msg}");
                }
                Err(e) => return Err(ClientError::Socket(e)),
            }
        }
    }

    /// Checks a datagram's source against the server's transfer ID. The
    /// first reply fixes the ID; strangers afterwards get an error packet
    /// sent back and their datagrams are not processed.
    async fn check_source(&mut self, src: SocketAddr) -> bool {
        if !self.tid_locked {
            self.tid_locked = true;
            if src != self.remote {
                log::debug!("server moved to transfer port {}", src.port());
            }
            self.remote = src;
            return true;
        }
        if src == self.remote {
            return true;
        }
        log::warn!("dropping packet from unexpected source {src}");
        send_error_packet(
            &self.sock,
            src,
            ErrorCode::UnknownTid,
            "packet from unknown transfer id".to_string(),
        )
        .await;
        false
    }
}

#[derive(Debug)]
pub enum ClientError {
    /// The host could not be resolved, or no candidate endpoint permitted
    /// socket creation.
    Resolve(String),
    /// The socket failed for a non-transient reason, or an outbound packet
    /// could not be encoded.
    Socket(SocketError),
    /// The local file could not be opened.
    File(io::Error),
    /// The transfer died on a local read or write fault, after a courtesy
    /// error packet went out to the server.
    LocalIo(String),
    /// The server ended the transfer with an error packet.
    Peer { code: ErrorCode, message: String },
    /// The retry budget for the outstanding packet ran out.
    TimedOut,
}

impl error::Error for ClientError {}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Resolve(msg) => write!(f, "cannot reach server: {msg}"),
            Self::Socket(e) => write!(f, "transport error: {e}"),
            Self::File(e) => write!(f, "local file error: {e}"),
            Self::LocalIo(msg) => write!(f, "transfer aborted: {msg}"),
            Self::Peer { code, message } => write!(f, "server error {}: {}", code.code(), message),
            Self::TimedOut => write!(f, "timeout, aborting"),
        }
    }
}

impl From<io::Error> for ClientError {
    fn from(e: io::Error) -> ClientError {
        ClientError::File(e)
    }
}

impl From<SocketError> for ClientError {
    fn from(e: SocketError) -> ClientError {
        ClientError::Socket(e)
    }
}
