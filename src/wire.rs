//! On-the-wire layout of the NBD handshake and transmission messages.
//!
//! This implements the old-style (pre-negotiation) handshake flexnbd
//! speaks: a fixed 152-byte hello frame, no option haggling. Request and
//! reply headers follow the transmission-phase layout from the NBD
//! protocol, read and written big-endian with `byteorder`.

use crate::error::ProtocolError;
use bitflags::bitflags;
use byteorder::{ReadBytesExt, WriteBytesExt, BE};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::io::{self, Read, Write};

/// `NBDMAGIC` as a big-endian `u64`.
pub const MAGIC_PASSWD: u64 = 0x4e42444d41474943;
/// Fixed second magic of the old-style hello, distinguishing it from the
/// newer `IHAVEOPT` negotiation this server doesn't speak.
pub const MAGIC_INIT: u64 = 0x0004_2028_1861_2253;
/// Magic preceding every client request header.
pub const REQUEST_MAGIC: u32 = 0x2560_9513;
/// Magic preceding every simple reply header.
pub const REPLY_MAGIC: u32 = 0x6744_6698;

bitflags! {
    /// Flags advertised by the server in the hello frame.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InitFlags: u16 {
        /// The flags field itself is meaningful (always set by us).
        const HAS_FLAGS = 1 << 0;
        /// Server implements `FLUSH`.
        const SEND_FLUSH = 1 << 2;
        /// Server honors the `FUA` command flag.
        const SEND_FUA = 1 << 3;
    }
}

bitflags! {
    /// Per-request flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CmdFlags: u16 {
        /// Forced Unit Access: reply only after the write is durable.
        const FUA = 1 << 0;
    }
}

/// NBD command types this server understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum Cmd {
    /// Read a range.
    Read = 0,
    /// Write a range.
    Write = 1,
    /// Orderly shutdown of the transmission phase.
    Disconnect = 2,
    /// Flush all prior writes to stable storage.
    Flush = 3,
}

/// NBD error codes, carrying the same values as the corresponding errno
/// so replies can be built directly from `io::Error::kind()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum ErrorType {
    /// Success.
    Ok = 0,
    /// Operation not permitted.
    EPerm = 1,
    /// I/O error.
    EIo = 5,
    /// Out of memory.
    ENoMem = 12,
    /// Invalid argument, or a command this server doesn't support.
    EInval = 22,
    /// No space left on device, or request ran past the export.
    ENoSpc = 28,
    /// Value too large (overflowed a 32-bit length).
    EOverflow = 75,
    /// Malformed wire message.
    EBadMsg = 74,
}

impl ErrorType {
    /// Map an `io::ErrorKind` to the closest NBD error code.
    pub fn from_io_kind(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::PermissionDenied => ErrorType::EPerm,
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => ErrorType::EInval,
            io::ErrorKind::OutOfMemory => ErrorType::ENoMem,
            _ => ErrorType::EIo,
        }
    }
}

/// The fixed hello frame the server sends right after accept.
#[derive(Debug, Clone, Copy)]
pub struct InitMessage {
    /// Size of the export, in bytes.
    pub size: u64,
    /// Advertised server flags.
    pub flags: InitFlags,
}

impl InitMessage {
    /// Write the 152-byte hello: magic, magic, size, flags, 124 bytes of
    /// padding.
    pub fn put<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u64::<BE>(MAGIC_PASSWD)?;
        w.write_u64::<BE>(MAGIC_INIT)?;
        w.write_u64::<BE>(self.size)?;
        w.write_u16::<BE>(self.flags.bits())?;
        w.write_all(&[0u8; 124])?;
        w.flush()
    }

    /// Read and validate a hello frame sent by a peer (used by the
    /// mirror engine and the one-shot client, both of which connect
    /// outward to another flexnbd).
    pub fn get<R: Read>(r: &mut R) -> Result<Self, ProtocolError> {
        let passwd = r.read_u64::<BE>().map_err(|_| ProtocolError::BadMagic(0))?;
        if passwd != MAGIC_PASSWD {
            return Err(ProtocolError::BadMagic(passwd as u32));
        }
        let magic = r.read_u64::<BE>().map_err(|_| ProtocolError::BadMagic(0))?;
        if magic != MAGIC_INIT {
            return Err(ProtocolError::BadMagic(magic as u32));
        }
        let size = r.read_u64::<BE>().map_err(|_| ProtocolError::BadMagic(0))?;
        let flags = r.read_u16::<BE>().map_err(|_| ProtocolError::BadMagic(0))?;
        let flags = InitFlags::from_bits_truncate(flags);
        let mut pad = [0u8; 124];
        r.read_exact(&mut pad).map_err(|_| ProtocolError::BadMagic(0))?;
        Ok(InitMessage { size, flags })
    }
}

/// A client request header (the payload, for `WRITE`, is read separately
/// by the handler so it can take the sparse-preserving path without
/// buffering the whole thing up front).
#[derive(Debug, Clone, Copy)]
pub struct Request {
    /// Command-specific flags (only `FUA` today).
    pub flags: CmdFlags,
    /// The command type.
    pub typ: Cmd,
    /// Opaque client-chosen correlation handle, echoed in the reply.
    pub handle: u64,
    /// Starting byte offset within the export.
    pub from: u64,
    /// Length of the operation in bytes.
    pub len: u32,
}

impl Request {
    /// Read and validate a request header.
    pub fn get<R: Read>(r: &mut R) -> Result<Self, ProtocolError> {
        let magic = r.read_u32::<BE>().map_err(|_| ProtocolError::BadMagic(0))?;
        if magic != REQUEST_MAGIC {
            return Err(ProtocolError::BadMagic(magic));
        }
        let flags = r.read_u16::<BE>().map_err(|_| ProtocolError::BadMagic(0))?;
        let flags = CmdFlags::from_bits_truncate(flags);
        let typ = r.read_u16::<BE>().map_err(|_| ProtocolError::BadMagic(0))?;
        let typ = Cmd::try_from_primitive(typ).map_err(|_| ProtocolError::UnknownCommand(typ))?;
        let handle = r.read_u64::<BE>().map_err(|_| ProtocolError::BadMagic(0))?;
        let from = r.read_u64::<BE>().map_err(|_| ProtocolError::BadMagic(0))?;
        let len = r.read_u32::<BE>().map_err(|_| ProtocolError::BadMagic(0))?;
        Ok(Request { flags, typ, handle, from, len })
    }

    /// Write a request header (used by the outbound one-shot client and
    /// the mirror engine, both of which act as an NBD client).
    pub fn put<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u32::<BE>(REQUEST_MAGIC)?;
        w.write_u16::<BE>(self.flags.bits())?;
        w.write_u16::<BE>(self.typ.into())?;
        w.write_u64::<BE>(self.handle)?;
        w.write_u64::<BE>(self.from)?;
        w.write_u32::<BE>(self.len)
    }
}

/// A simple reply header (no structured-reply chunking).
#[derive(Debug, Clone, Copy)]
pub struct Reply {
    /// `Ok` on success, otherwise the NBD error code.
    pub error: ErrorType,
    /// Echoes the request's handle.
    pub handle: u64,
}

impl Reply {
    /// Write the reply header. For `READ`, the caller writes `data`
    /// immediately afterward.
    pub fn put<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u32::<BE>(REPLY_MAGIC)?;
        w.write_u32::<BE>(self.error.into())?;
        w.write_u64::<BE>(self.handle)
    }

    /// Read a reply header (client side).
    pub fn get<R: Read>(r: &mut R) -> Result<Self, ProtocolError> {
        let magic = r.read_u32::<BE>().map_err(|_| ProtocolError::BadMagic(0))?;
        if magic != REPLY_MAGIC {
            return Err(ProtocolError::BadMagic(magic));
        }
        let error = r.read_u32::<BE>().map_err(|_| ProtocolError::BadMagic(0))?;
        let error = ErrorType::try_from_primitive(error).unwrap_or(ErrorType::EIo);
        let handle = r.read_u64::<BE>().map_err(|_| ProtocolError::BadMagic(0))?;
        Ok(Reply { error, handle })
    }
}

/// The fixed 8-byte handle the mirror engine stamps on every request it
/// sends, so replies can be told apart from anything a control-socket
/// mediated client might be doing concurrently (there is none, but the
/// handle still needs to be *some* stable value to match on).
pub const MIRROR_HANDLE: u64 = u64::from_be_bytes(*b".MIRROR.");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_message_roundtrips() {
        let msg = InitMessage { size: 123456, flags: InitFlags::HAS_FLAGS | InitFlags::SEND_FLUSH };
        let mut buf = Vec::new();
        msg.put(&mut buf).unwrap();
        assert_eq!(buf.len(), 8 + 8 + 8 + 2 + 124);
        let got = InitMessage::get(&mut &buf[..]).unwrap();
        assert_eq!(got.size, msg.size);
        assert_eq!(got.flags, msg.flags);
    }

    #[test]
    fn request_roundtrips_high_bit_offset() {
        let req = Request {
            flags: CmdFlags::FUA,
            typ: Cmd::Write,
            handle: 42,
            from: 0x8000_0000_0000_0000,
            len: 4096,
        };
        let mut buf = Vec::new();
        req.put(&mut buf).unwrap();
        let got = Request::get(&mut &buf[..]).unwrap();
        assert_eq!(got.from, req.from);
        assert_eq!(got.typ, req.typ);
        assert_eq!(got.flags, req.flags);
    }

    #[test]
    fn bad_request_magic_is_rejected() {
        let mut buf = vec![0u8; 22];
        buf[3] = 1; // garbage magic
        let err = Request::get(&mut &buf[..]);
        assert!(matches!(err, Err(ProtocolError::BadMagic(_))));
    }

    #[test]
    fn unknown_command_is_rejected() {
        let mut buf = Vec::new();
        buf.write_u32::<BE>(REQUEST_MAGIC).unwrap();
        buf.write_u16::<BE>(0).unwrap();
        buf.write_u16::<BE>(9999).unwrap();
        buf.write_u64::<BE>(0).unwrap();
        buf.write_u64::<BE>(0).unwrap();
        buf.write_u32::<BE>(0).unwrap();
        let err = Request::get(&mut &buf[..]);
        assert!(matches!(err, Err(ProtocolError::UnknownCommand(9999))));
    }
}
