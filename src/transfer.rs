// This module contains the per-transfer state machine, the half of the
// protocol engine that knows nothing about sockets or timers.
//
// A transfer is created when the user asks for a download or an upload. The
// download side expects data packets from the server, writes them to the
// local file, and answers acks. The upload side expects acks, reads the next
// block from the local file, and answers data packets. These operations are
// similar enough to expose the same API to the session loop, but what
// happens on each incoming packet is distinct, so each direction keeps its
// own processing routine.
//
// Processing a packet never touches the network. It returns an Action that
// tells the session loop what to put on the wire and whether the transfer is
// still alive; the loop owns retransmission, timeouts, and the socket. This
// split is what makes the state machine testable against scripted packets.

use crate::tftp::{self, Packet, BLOCK_LEN};
use std::path::Path;
use tokio::fs::File;
use tokio::io::{self, AsyncReadExt, AsyncWriteExt};

/// Protocol states of one transfer, client side.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum State {
    /// Read request sent; waiting for the first data block.
    RrqSent,
    /// Write request sent; waiting for the server to acknowledge block 0.
    WrqSent,
    /// Acknowledged a full data block; waiting for the next one.
    AckSent,
    /// Acknowledged the final short data block; the ack goes out once and
    /// the transfer is over.
    LastAckSent,
    /// Sent a full data block; waiting for its acknowledgment.
    DataSent,
    /// Sent the final short data block; waiting for its acknowledgment.
    LastDataSent,
    /// Transfer finished or aborted.
    Closed,
}

/// Represents what the session loop should do in response to processing a
/// packet.
#[derive(Debug, PartialEq)]
pub enum Action {
    /// Send the packet and wait for the peer's reply.
    SendAndAwait(Packet),

    /// Send the packet once; nothing in it needs confirmation, so the
    /// transfer is complete as soon as it is on the wire.
    SendAndClose(Packet),

    /// The transfer is complete with nothing further to send.
    Close,

    /// The peer terminated the transfer with an error packet.
    PeerError { code: tftp::ErrorCode, message: String },

    /// A local fault ended the transfer; the packet is a courtesy error for
    /// the peer.
    Abort { packet: Packet, reason: String },

    /// Stale or unexpected packet. Keep waiting; neither the retransmission
    /// timer nor the retry budget should be touched.
    Ignore,
}

/// One transfer in either direction.
#[derive(Debug)]
pub enum Transfer {
    Download(Download),
    Upload(Upload),
}

impl Transfer {
    /// Opens (creating or truncating) the local file a download writes into.
    pub async fn new_download(path: &Path) -> Result<Transfer, io::Error> {
        match File::create(path).await {
            Ok(f) => Ok(Transfer::Download(Download::new(f))),
            Err(e) => Err(e),
        }
    }

    /// Opens the local file an upload reads from.
    pub async fn new_upload(path: &Path) -> Result<Transfer, io::Error> {
        match File::open(path).await {
            Ok(f) => Ok(Transfer::Upload(Upload::new(f))),
            Err(e) => Err(e),
        }
    }

    pub fn state(&self) -> State {
        match self {
            Transfer::Download(t) => t.state,
            Transfer::Upload(t) => t.state,
        }
    }

    /// Given an incoming packet, processes it and describes the action the
    /// session loop should take.
    pub async fn process_packet(&mut self, packet: &Packet) -> Action {
        match self {
            Transfer::Download(t) => t.process_data(packet).await,
            Transfer::Upload(t) => t.process_ack(packet).await,
        }
    }
}

#[derive(Debug)]
pub struct Download {
    f: File,
    state: State,
    /// Block number of the next data packet we expect.
    block: u16,
}

impl Download {
    fn new(f: File) -> Download {
        Download {
            f,
            state: State::RrqSent,
            block: 1,
        }
    }

    async fn process_data(&mut self, packet: &Packet) -> Action {
        match packet {
            Packet::Data { block, data } if *block == self.block => {
                if let Err(e) = write_block_to_file(&mut self.f, data).await {
                    self.state = State::Closed;
                    return Action::Abort {
                        packet: Packet::Error {
                            code: e.kind().into(),
                            message: "local write failed".to_string(),
                        },
                        reason: format!("cannot write block {} to the local file: {e}", self.block),
                    };
                }

                let ack = Packet::Ack { block: self.block };
                self.block = self.block.wrapping_add(1);
                if data.len() < BLOCK_LEN {
                    self.state = State::LastAckSent;
                    Action::SendAndClose(ack)
                } else {
                    self.state = State::AckSent;
                    Action::SendAndAwait(ack)
                }
            }
            Packet::Data { block, .. } => {
                // Duplicated or reordered in transit; our ack will be
                // retransmitted if the server is actually stuck.
                log::debug!("ignoring data block {block} while expecting {}", self.block);
                Action::Ignore
            }
            Packet::Error { code, message } => {
                self.state = State::Closed;
                Action::PeerError { code: *code, message: message.clone() }
            }
            other => {
                log::debug!("unexpected packet while downloading: {other:?}");
                Action::Ignore
            }
        }
    }
}

#[derive(Debug)]
pub struct Upload {
    f: File,
    state: State,
    /// Block number of the data packet we last sent; 0 until the write
    /// request itself is acknowledged.
    block: u16,
}

impl Upload {
    fn new(f: File) -> Upload {
        Upload {
            f,
            state: State::WrqSent,
            block: 0,
        }
    }

    async fn process_ack(&mut self, packet: &Packet) -> Action {
        match packet {
            Packet::Ack { block } if *block == self.block => {
                if self.state == State::LastDataSent {
                    self.state = State::Closed;
                    return Action::Close;
                }

                match read_block_from_file(&mut self.f, BLOCK_LEN).await {
                    Ok(data) => {
                        self.block = self.block.wrapping_add(1);
                        self.state = if data.len() == BLOCK_LEN {
                            State::DataSent
                        } else {
                            State::LastDataSent
                        };
                        Action::SendAndAwait(Packet::Data { block: self.block, data })
                    }
                    Err(e) => {
                        self.state = State::Closed;
                        Action::Abort {
                            packet: Packet::Error {
                                code: e.kind().into(),
                                message: "local read failed".to_string(),
                            },
                            reason: format!(
                                "cannot read block {} from the local file: {e}",
                                self.block.wrapping_add(1)
                            ),
                        }
                    }
                }
            }
            Packet::Ack { block } => {
                // Acks for blocks the server already confirmed, e.g. from a
                // duplicated datagram.
                log::debug!("ignoring ack for block {block} while waiting on {}", self.block);
                Action::Ignore
            }
            Packet::Error { code, message } => {
                self.state = State::Closed;
                Action::PeerError { code: *code, message: message.clone() }
            }
            other => {
                log::debug!("unexpected packet while uploading: {other:?}");
                Action::Ignore
            }
        }
    }
}

async fn read_block_from_file(f: &mut File, block_size: usize) -> Result<Vec<u8>, io::Error> {
    let mut buf = vec![0_u8; block_size];
    let mut cursor = 0;

    // Reading works this way because we have no guarantee that a particular call to read will
    // actually fill the buffer all the way. To compensate for this, if we don't fully fill the
    // buffer on the call to read, we pass a progressively smaller slice of the buffer that we
    // populate the buffer.
    loop {
        match f.read(&mut buf[cursor..]).await {
            Ok(s) => {
                if cursor + s == buf.len() {
                    return Ok(buf);
                } else if s == 0 {
                    buf.truncate(cursor + s);
                    return Ok(buf);
                } else {
                    cursor += s;
                    continue;
                };
            }
            Err(e) => return Err(e),
        };
    }
}

async fn write_block_to_file(f: &mut File, buf: &[u8]) -> Result<(), io::Error> {
    let mut cursor = 0;
    while cursor < buf.len() {
        cursor += f.write(&buf[cursor..]).await?;
    }
    // The block must be on its way to disk before the ack goes out.
    f.flush().await?;
    Ok(())
}
