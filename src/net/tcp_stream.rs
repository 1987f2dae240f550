// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Abstraction over the connected-socket primitive a worker drives.
//!
//! Every connection socket (TCP carrier under a TLS or HTTP/2 overlay, or a
//! bare TCP connection) is driven through this trait rather than naming
//! `mio::net::TcpStream` directly, so a fake implementation could stand in
//! for one in tests without touching a real file descriptor.

use std::io::{Error, Result};
use std::net::{Shutdown, SocketAddr};

use socket2::{Domain, Protocol, Socket, Type};

/// Initiates a non-blocking connect to `peer`, optionally binding to
/// `local` first (§6 `connect_tcp`/`connect_tls` take an explicit source
/// address). `EINPROGRESS`/`WouldBlock` from the non-blocking `connect(2)`
/// is expected and not an error; the caller drives completion from the
/// writable wakeup, same as `mio::net::TcpStream::connect`.
pub fn connect(peer: SocketAddr, local: Option<SocketAddr>) -> Result<mio::net::TcpStream> {
    let domain = if peer.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    if let Some(addr) = local {
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
    }
    match socket.connect(&peer.into()) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
        #[cfg(unix)]
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) => return Err(e),
    }
    let std_stream: std::net::TcpStream = socket.into();
    Ok(mio::net::TcpStream::from_std(std_stream))
}

/// A non-blocking, pollable TCP connection.
pub trait TcpStream {
    /// Peer address, authoritative once the connect completes (§4.3 —
    /// dual-stack connects may resolve to a different address than
    /// requested).
    fn peer_addr(&self) -> Result<SocketAddr>;

    /// Local address this connection is bound to.
    fn local_addr(&self) -> Result<SocketAddr>;

    /// Initiates shutdown of the send, receive, or both halves.
    fn shutdown(&self, how: Shutdown) -> Result<()>;

    /// Toggles Nagle's algorithm.
    fn set_nodelay(&self, nodelay: bool) -> Result<()>;

    /// Current Nagle setting.
    fn nodelay(&self) -> Result<bool>;

    /// Sets the IP TTL.
    fn set_ttl(&self, ttl: u32) -> Result<()>;

    /// Current IP TTL.
    fn ttl(&self) -> Result<u32>;

    /// Takes and clears the socket's pending error, if any.
    fn take_error(&self) -> Result<Option<Error>>;

    /// Peeks at incoming bytes without consuming them — used to sniff the
    /// HTTP/2 connection preface before a request/response parser is
    /// committed to for a plaintext connection.
    fn peek(&self, buf: &mut [u8]) -> Result<usize>;
}

impl TcpStream for mio::net::TcpStream {
    #[inline]
    fn peer_addr(&self) -> Result<SocketAddr> {
        Self::peer_addr(self)
    }

    #[inline]
    fn local_addr(&self) -> Result<SocketAddr> {
        Self::local_addr(self)
    }

    #[inline]
    fn shutdown(&self, how: Shutdown) -> Result<()> {
        Self::shutdown(self, how)
    }

    #[inline]
    fn set_nodelay(&self, nodelay: bool) -> Result<()> {
        Self::set_nodelay(self, nodelay)
    }

    #[inline]
    fn nodelay(&self) -> Result<bool> {
        Self::nodelay(self)
    }

    #[inline]
    fn set_ttl(&self, ttl: u32) -> Result<()> {
        Self::set_ttl(self, ttl)
    }

    #[inline]
    fn ttl(&self) -> Result<u32> {
        Self::ttl(self)
    }

    #[inline]
    fn take_error(&self) -> Result<Option<Error>> {
        Self::take_error(self)
    }

    #[inline]
    fn peek(&self, buf: &mut [u8]) -> Result<usize> {
        Self::peek(self, buf)
    }
}
