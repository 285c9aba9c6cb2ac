//! Named error types for protocol, control-socket, and ACL parsing
//! failures. Operational failures (I/O, OS calls) stay as `io::Error` or
//! `color_eyre::Report` and are wrapped with `.wrap_err` at call sites.

use thiserror::Error;

/// A malformed or unexpected piece of NBD wire traffic.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The fixed magic number at the start of a request didn't match.
    #[error("bad request magic {0:#x}")]
    BadMagic(u32),
    /// An NBD command type outside `READ/WRITE/DISCONNECT/FLUSH`.
    #[error("unsupported command type {0}")]
    UnknownCommand(u16),
    /// `from + len` overflowed `u64` or ran past the export.
    #[error("request range out of bounds")]
    OutOfRange,
}

/// Failure parsing a CIDR entry passed on the command line or over the
/// control socket.
#[derive(Debug, Error)]
pub enum AclParseError {
    /// The string wasn't `addr` or `addr/bits`.
    #[error("invalid CIDR syntax: {0}")]
    Syntax(String),
    /// The address portion didn't parse as an IPv4 or IPv6 address.
    #[error("invalid address: {0}")]
    Address(String),
    /// The prefix length exceeded the address family's bit width.
    #[error("prefix length {0} exceeds address width")]
    PrefixTooLong(u8),
}

/// Failure dispatching a control-socket command.
#[derive(Debug, Error)]
pub enum ControlError {
    /// The first line wasn't a recognised command name.
    #[error("unknown command {0:?}")]
    UnknownCommand(String),
    /// A command was missing a required argument, or got too many.
    #[error("wrong number of arguments for {0}")]
    WrongArity(&'static str),
    /// An argument failed to parse as the expected type.
    #[error("invalid argument: {0}")]
    BadArgument(String),
    /// `mirror` was issued while one was already in flight.
    #[error("a mirror is already running")]
    MirrorAlreadyRunning,
}

/// Failure during a live-migration attempt, distinct from the
/// recoverable per-request / per-connection / process-fatal tiers:
/// these always leave the attempt in a terminal, supervisor-visible
/// state rather than tearing down anything else.
#[derive(Debug, Error)]
pub enum MirrorError {
    /// `connect()` to the peer failed or timed out.
    #[error("could not connect to mirror peer")]
    Connect(#[source] std::io::Error),
    /// The peer never sent a hello within the timeout.
    #[error("mirror peer did not send a hello in time")]
    NoHello,
    /// The peer's hello was malformed.
    #[error("mirror peer rejected the connection")]
    Rejected,
    /// The peer's advertised export size didn't match ours.
    #[error("mirror peer size {peer} does not match local size {local}")]
    SizeMismatch {
        /// Size advertised by the peer.
        peer: u64,
        /// Size of our own export.
        local: u64,
    },
    /// A socket error during the transfer loop. Non-terminal: the
    /// supervisor may retry.
    #[error("mirror transfer failed")]
    Transfer(#[source] std::io::Error),
}
