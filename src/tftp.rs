// TFTP wire format, RFC 1350.
//
// Every packet starts with a 2-byte big-endian opcode:
//
// opcode   operation
// 1        Read req (RRQ):   filename NUL mode NUL
// 2        Write req (WRQ):  filename NUL mode NUL
// 3        Data (DATA):      block # (2 bytes), 0-512 bytes of data
// 4        ACK:              block # (2 bytes)
// 5        ERROR:            error code (2 bytes), message NUL
//
// A data block shorter than 512 bytes marks the end of the transfer, so no
// packet is ever longer than 516 bytes. Block numbers, opcodes, and error
// codes are big-endian 16-bit integers.

use async_io::Async;
use std::error;
use std::fmt;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;
use tokio::time::error::Elapsed;
use tokio::time::timeout;

/// Largest legal packet: 2-byte opcode, 2-byte block number, 512 bytes of data.
pub const MAX_PACKET_LEN: usize = 516;

/// Payload bytes carried by a full data block; a shorter block ends the transfer.
pub const BLOCK_LEN: usize = 512;

///////////////////////////////////////////////////////////////
// Error-handling objects

/// Represents an error returned from the TFTP socket handler.
#[derive(Debug)]
pub enum SocketError {
    IO(io::Error),
    /// A received datagram did not decode as a TFTP packet. The caller should
    /// drop the datagram and keep waiting; the peer is silent from our point
    /// of view.
    PacketParse(String),
    /// An outbound packet would not fit in the 516-byte envelope.
    Encode(String),
    Timeout(Elapsed),
}

impl error::Error for SocketError {}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SocketError::IO(e) => write!(f, "socket IO error: {e}"),
            SocketError::PacketParse(e) => write!(f, "packet parsing error: {e}"),
            SocketError::Encode(e) => write!(f, "packet encoding error: {e}"),
            SocketError::Timeout(e) => write!(f, "socket IO timeout: {e}"),
        }
    }
}

impl From<io::Error> for SocketError {
    fn from(e: io::Error) -> Self {
        SocketError::IO(e)
    }
}

impl From<Elapsed> for SocketError {
    fn from(e: Elapsed) -> Self {
        SocketError::Timeout(e)
    }
}

pub type TftpResult<T> = Result<T, SocketError>;

/// Represents the mode for a file the client wishes to read or write.
///
/// The payload is treated as opaque bytes no matter the mode; the mode is
/// echoed on the wire only.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FileMode {
    NetAscii,
    Octet,
    Mail,
}

impl FileMode {
    /// Canonical lowercase spelling used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            FileMode::NetAscii => "netascii",
            FileMode::Octet => "octet",
            FileMode::Mail => "mail",
        }
    }
}

/// Represents a TFTP error code surfaced by a TFTP error packet.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ErrorCode {
    Undefined,
    FileNotFound,
    AccessViolation,
    DiskFull,
    Illegal,
    UnknownTid,
    FileAlreadyExists,
    NoSuchUser,
}

impl ErrorCode {
    pub fn code(&self) -> u16 {
        match self {
            ErrorCode::Undefined => 0,
            ErrorCode::FileNotFound => 1,
            ErrorCode::AccessViolation => 2,
            ErrorCode::DiskFull => 3,
            ErrorCode::Illegal => 4,
            ErrorCode::UnknownTid => 5,
            ErrorCode::FileAlreadyExists => 6,
            ErrorCode::NoSuchUser => 7,
        }
    }

    /// Unknown codes fold into the catch-all `Undefined`.
    pub fn from_code(raw: u16) -> ErrorCode {
        match raw {
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::Illegal,
            5 => ErrorCode::UnknownTid,
            6 => ErrorCode::FileAlreadyExists,
            7 => ErrorCode::NoSuchUser,
            _ => ErrorCode::Undefined,
        }
    }
}

impl From<io::ErrorKind> for ErrorCode {
    fn from(kind: io::ErrorKind) -> ErrorCode {
        match kind {
            io::ErrorKind::NotFound => ErrorCode::FileNotFound,
            io::ErrorKind::PermissionDenied => ErrorCode::AccessViolation,
            io::ErrorKind::AlreadyExists => ErrorCode::FileAlreadyExists,
            _ => ErrorCode::Undefined,
        }
    }
}

/// An enum representing a TFTP packet and its associated data.
#[derive(Debug, PartialEq)]
pub enum Packet {
    /// A read request packet
    ReadReq {
        /// The file path the client wants to read.
        path: String,

        /// The file mode.
        mode: FileMode,
    },

    /// A write request packet
    WriteReq {
        path: String,
        mode: FileMode,
    },

    /// A data packet
    Data {
        /// The block number for this data packet.
        block: u16,

        /// The contents of the data itself.
        data: Vec<u8>,
    },

    /// An acknowledgment packet
    Ack {
        /// The block being acknowledged.
        block: u16,
    },

    /// An error packet.
    Error {
        code: ErrorCode,
        message: String,
    },
}

fn u16_from_buffer(buf: &[u8]) -> u16 {
    (u16::from(buf[0]) << 8) + u16::from(buf[1])
}

fn push_u16(buf: &mut Vec<u8>, val: u16) {
    buf.extend_from_slice(&val.to_be_bytes());
}

/// Given a buffer, assumes the string begins at the beginning of the buffer and concatenates until
/// it finds a 0 byte, which it assumes terminates the string.
///
/// Returns the string extracted from the buffer as well as the position of the 0 byte in the
/// buffer it was given (or the size of the buffer, if no 0 byte was encountered)
fn string_from_buffer(buf: &[u8]) -> (String, usize) {
    let mut s = String::new();
    for i in 0..buf.len() {
        let c = buf[i];
        if c == 0x00 {
            return (s, i);
        }
        s.push(char::from(c));
    }

    (s, buf.len())
}

/// Utility function for obtaining the TFTP OpCode from a buffer
#[derive(Debug, PartialEq)]
pub enum OpCode { Rrq, Wrq, Data, Ack, Error }

fn retrieve_op_code(buf: &[u8]) -> TftpResult<OpCode> {
    let rawcode = u16_from_buffer(&buf[..2]);
    match rawcode {
        1 => Ok(OpCode::Rrq),
        2 => Ok(OpCode::Wrq),
        3 => Ok(OpCode::Data),
        4 => Ok(OpCode::Ack),
        5 => Ok(OpCode::Error),
        _ => Err(SocketError::PacketParse(
            format!("Unknown opcode retrieved: {rawcode}"))),
    }
}

fn parse_path_and_mode(buf: &[u8]) -> TftpResult<(String, FileMode)> {
    let (path, path_end) = string_from_buffer(buf);

    if path_end == buf.len() {
        return Err(SocketError::PacketParse("Request does not contain a mode, but it needs to!".to_string()));
    }

    let rest = &buf[path_end + 1..];
    let (raw_mode, mode_end) = string_from_buffer(rest);

    if mode_end == rest.len() {
        return Err(SocketError::PacketParse("Mode must be terminated with a null byte!".to_string()));
    }

    let mode = match raw_mode.to_lowercase().as_str() {
        "netascii" => FileMode::NetAscii,
        "octet" => FileMode::Octet,
        "mail" => FileMode::Mail,
        _ => return Err(SocketError::PacketParse(format!("Unknown file mode: '{raw_mode}'"))),
    };

    Ok((path, mode))
}

fn parse_read_req(buf: &[u8]) -> TftpResult<Packet> {
    let (path, mode) = parse_path_and_mode(&buf[2..])?;
    Ok(Packet::ReadReq { path, mode })
}

fn parse_write_req(buf: &[u8]) -> TftpResult<Packet> {
    let (path, mode) = parse_path_and_mode(&buf[2..])?;
    Ok(Packet::WriteReq { path, mode })
}

fn parse_data(buf: &[u8]) -> TftpResult<Packet> {
    let block = u16_from_buffer(&buf[2..4]);
    let data = &buf[4..];
    if data.len() > BLOCK_LEN {
        return Err(SocketError::PacketParse(
            format!("Data payload is {} bytes, over the {BLOCK_LEN}-byte block limit", data.len())));
    }
    Ok(Packet::Data { block, data: Vec::from(data) })
}

fn parse_ack(buf: &[u8]) -> TftpResult<Packet> {
    let block = u16_from_buffer(&buf[2..4]);
    Ok(Packet::Ack { block })
}

fn parse_error(buf: &[u8]) -> TftpResult<Packet> {
    let code = ErrorCode::from_code(u16_from_buffer(&buf[2..4]));

    let rest = &buf[4..];
    let (message, msg_end) = string_from_buffer(rest);
    if msg_end == rest.len() {
        return Err(SocketError::PacketParse("Error message must be terminated with a null byte!".to_string()));
    }
    Ok(Packet::Error { code, message })
}

fn encode_request(buf: &mut Vec<u8>, opcode: u16, path: &str, mode: FileMode) -> TftpResult<()> {
    if 2 + path.len() + 1 + mode.as_str().len() + 1 > MAX_PACKET_LEN {
        return Err(SocketError::Encode(
            format!("File name '{path}' does not fit in a request packet")));
    }
    push_u16(buf, opcode);
    buf.extend_from_slice(path.as_bytes());
    buf.push(0x00);
    buf.extend_from_slice(mode.as_str().as_bytes());
    buf.push(0x00);
    Ok(())
}

impl Packet {
    pub fn parse_from_buf(buf: &[u8]) -> TftpResult<Packet> {
        if buf.len() < 4 {
            return Err(SocketError::PacketParse("Packet too short!".to_string()));
        }

        match retrieve_op_code(&buf[..2])? {
            OpCode::Rrq => parse_read_req(buf),
            OpCode::Wrq => parse_write_req(buf),
            OpCode::Data => parse_data(buf),
            OpCode::Ack => parse_ack(buf),
            OpCode::Error => parse_error(buf),
        }
    }

    /// Serializes the packet into wire bytes.
    ///
    /// Inputs that would overflow the 516-byte envelope are programming
    /// errors in this client and are reported as fatal rather than truncated.
    pub fn to_bytes(&self) -> TftpResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(MAX_PACKET_LEN);
        match self {
            Packet::ReadReq { path, mode } => encode_request(&mut buf, 1, path, *mode)?,
            Packet::WriteReq { path, mode } => encode_request(&mut buf, 2, path, *mode)?,
            Packet::Data { block, data } => {
                if data.len() > BLOCK_LEN {
                    return Err(SocketError::Encode(
                        format!("Data payload is {} bytes, over the {BLOCK_LEN}-byte block limit", data.len())));
                }
                push_u16(&mut buf, 3);
                push_u16(&mut buf, *block);
                buf.extend_from_slice(data);
            }
            Packet::Ack { block } => {
                push_u16(&mut buf, 4);
                push_u16(&mut buf, *block);
            }
            Packet::Error { code, message } => {
                if 2 + 2 + message.len() + 1 > MAX_PACKET_LEN {
                    return Err(SocketError::Encode(
                        format!("Error message of {} bytes does not fit in a packet", message.len())));
                }
                push_u16(&mut buf, 5);
                push_u16(&mut buf, code.code());
                buf.extend_from_slice(message.as_bytes());
                buf.push(0x00);
            }
        }
        Ok(buf)
    }
}

///////////////////////////////////////////////////////////////
/// Wrapper around a UDP socket that parses TFTP headers and
/// returns the packets in a more structured format.
pub struct TftpSocket {
    sock: Async<UdpSocket>,
}

impl TftpSocket {
    pub fn bind(addr: SocketAddr) -> TftpResult<TftpSocket> {
        Ok(TftpSocket {
            sock: Async::<UdpSocket>::bind(addr)?,
        })
    }

    /// The local address the socket is bound to. Its port is this side's
    /// transfer ID.
    pub fn local_addr(&self) -> TftpResult<SocketAddr> {
        Ok(self.sock.get_ref().local_addr()?)
    }

    /// Sends one datagram holding exactly `buf`. UDP sends are
    /// all-or-nothing, so a non-error return means the whole buffer went out.
    pub async fn send_to(&self, buf: &[u8], dst: SocketAddr) -> TftpResult<()> {
        self.sock.send_to(buf, dst).await?;
        Ok(())
    }

    /// Encodes and sends a packet. One-shot messages go through here;
    /// packets that may be retransmitted are encoded once and re-sent
    /// verbatim through [`TftpSocket::send_to`].
    pub async fn send(&self, packet: &Packet, dst: SocketAddr) -> TftpResult<()> {
        self.send_to(&packet.to_bytes()?, dst).await
    }

    /// Waits up to `ttl` for one datagram and decodes it.
    ///
    /// The three failure cases stay distinguishable for the caller:
    /// `Timeout` (nothing arrived), `PacketParse` (a datagram arrived but was
    /// malformed), and `IO` (the socket itself failed).
    pub async fn recv_with_timeout(&mut self, ttl: Duration) -> TftpResult<(Packet, SocketAddr)> {
        let mut buf = [0; MAX_PACKET_LEN + 1];
        let (total_written, src) = timeout(ttl, self.sock.recv_from(&mut buf)).await??;

        if total_written > MAX_PACKET_LEN {
            return Err(SocketError::PacketParse(
                format!("Oversized datagram ({total_written} bytes) from {src}")));
        }

        let packet = Packet::parse_from_buf(&buf[..total_written])?;
        Ok((packet, src))
    }
}
