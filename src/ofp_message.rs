use thiserror::Error;

use crate::ofp_header::OfpHeader;

/// Errors surfaced while decoding an OpenFlow message body. The event loop
/// logs these and keeps reading; they never tear down a connection on their
/// own.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unsupported OpenFlow message type {0}")]
    UnsupportedMessage(u8),
    #[error("truncated OpenFlow message: {0}")]
    Truncated(&'static str),
    #[error("malformed OpenFlow field: {0}")]
    Malformed(&'static str),
}

/// Byte-level contract of one OpenFlow protocol version: how big a message
/// is on the wire, and how it converts to and from framed bytes.
pub trait OfpMessage: Sized {
    /// Wire size of `msg`, OpenFlow header included.
    fn size_of(msg: &Self) -> usize;
    /// Header carrying `xid`, typed and sized for `msg`.
    fn header_of(xid: u32, msg: &Self) -> OfpHeader;
    /// Consume `msg` into its framed wire bytes, header first.
    fn marshal(xid: u32, msg: Self) -> Vec<u8>;
    /// Decode the body `buf` described by `header` into the transaction id
    /// and message. Unknown types and mangled bodies surface as a
    /// [`ProtocolError`] so the session loop can log and skip them rather
    /// than die.
    fn parse(header: &OfpHeader, buf: &[u8]) -> Result<(u32, Self), ProtocolError>;
}
