//! A TFTP client compliant with RFC 1350.
//!
//! The crate is split along the protocol's natural seams: [`tftp`] holds the
//! wire codec and the datagram socket wrapper, [`transfer`] holds the
//! per-transfer state machine and the local file I/O, and [`client`] owns the
//! session: bootstrap, the lockstep send/wait loop, retransmission with
//! exponential backoff, and transfer-ID tracking.

pub mod client;
pub mod tftp;
pub mod transfer;
