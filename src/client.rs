//! A one-shot NBD client used by the `read`/`write` CLI subcommands and
//! by the mirror engine's outbound connection. Speaks the same
//! old-style hello this crate's server sends, no option negotiation.

use crate::wire::{Cmd, CmdFlags, ErrorType, InitMessage, Reply, Request};
use color_eyre::eyre::{bail, WrapErr};
use color_eyre::Result;
use std::io::{Read, Write};

/// A connected NBD client.
pub struct Client<IO: Read + Write> {
    conn: IO,
    size: u64,
    next_handle: u64,
}

impl<IO: Read + Write> Client<IO> {
    /// Perform the hello and return a ready-to-use client.
    pub fn new(mut stream: IO) -> Result<Self> {
        let hello = InitMessage::get(&mut stream).wrap_err("reading server hello")?;
        Ok(Client { conn: stream, size: hello.size, next_handle: 1 })
    }

    /// Size of the export, as reported in the hello.
    pub fn size(&self) -> u64 {
        self.size
    }

    fn handle(&mut self) -> u64 {
        let h = self.next_handle;
        self.next_handle += 1;
        h
    }

    /// Read `len` bytes starting at `offset`.
    pub fn read(&mut self, offset: u64, len: u32) -> Result<Vec<u8>> {
        let handle = self.handle();
        Request { flags: CmdFlags::empty(), typ: Cmd::Read, handle, from: offset, len }.put(&mut self.conn)?;
        let reply = Reply::get(&mut self.conn).wrap_err("reading read reply header")?;
        if !matches!(reply.error, ErrorType::Ok) {
            bail!("read failed: {:?}", reply.error);
        }
        let mut buf = vec![0u8; len as usize];
        self.conn.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Write `data` at `offset`.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let handle = self.handle();
        Request { flags: CmdFlags::empty(), typ: Cmd::Write, handle, from: offset, len: data.len() as u32 }.put(&mut self.conn)?;
        self.conn.write_all(data)?;
        let reply = Reply::get(&mut self.conn).wrap_err("reading write reply")?;
        if !matches!(reply.error, ErrorType::Ok) {
            bail!("write failed: {:?}", reply.error);
        }
        Ok(())
    }

    /// Flush all writes.
    pub fn flush(&mut self) -> Result<()> {
        let handle = self.handle();
        Request { flags: CmdFlags::empty(), typ: Cmd::Flush, handle, from: 0, len: 0 }.put(&mut self.conn)?;
        let reply = Reply::get(&mut self.conn).wrap_err("reading flush reply")?;
        if !matches!(reply.error, ErrorType::Ok) {
            bail!("flush failed: {:?}", reply.error);
        }
        Ok(())
    }

    /// Send `DISCONNECT` and consume the client.
    pub fn disconnect(mut self) -> Result<()> {
        let handle = self.handle();
        Request { flags: CmdFlags::empty(), typ: Cmd::Disconnect, handle, from: 0, len: 0 }.put(&mut self.conn)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};

    #[test]
    fn hello_then_read_write_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server_thread = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            InitMessage { size: 65536, flags: crate::wire::InitFlags::HAS_FLAGS }.put(&mut stream).unwrap();
            let req = Request::get(&mut stream).unwrap();
            assert_eq!(req.typ, Cmd::Write);
            let mut data = vec![0u8; req.len as usize];
            std::io::Read::read_exact(&mut stream, &mut data).unwrap();
            Reply { error: ErrorType::Ok, handle: req.handle }.put(&mut stream).unwrap();

            let req = Request::get(&mut stream).unwrap();
            assert_eq!(req.typ, Cmd::Read);
            Reply { error: ErrorType::Ok, handle: req.handle }.put(&mut stream).unwrap();
            stream.write_all(&data).unwrap();
        });

        let stream = TcpStream::connect(addr).unwrap();
        let mut client = Client::new(stream).unwrap();
        assert_eq!(client.size(), 65536);
        client.write(0, b"hello world").unwrap();
        let got = client.read(0, 11).unwrap();
        assert_eq!(&got, b"hello world");
        server_thread.join().unwrap();
    }
}
