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

//! Abstraction over the listening-socket primitive, plus the bind-retry
//! fallback ladder §4.3 specifies.

use std::io::{Error, ErrorKind, Result};
use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};

use crate::error::NetError;

/// A non-blocking, pollable TCP listener.
pub trait TcpListener<S> {
    /// Accepts a single pending connection, or `WouldBlock` if none is ready.
    fn accept(&self) -> Result<(S, SocketAddr)>;

    /// The address this listener is bound to.
    fn local_addr(&self) -> Result<SocketAddr>;

    /// Sets the IP TTL.
    fn set_ttl(&self, ttl: u32) -> Result<()>;

    /// Current IP TTL.
    fn ttl(&self) -> Result<u32>;

    /// Takes and clears the socket's pending error, if any.
    fn take_error(&self) -> Result<Option<Error>>;
}

type MTcpListener = mio::net::TcpListener;
type MTcpStream = mio::net::TcpStream;

impl TcpListener<MTcpStream> for MTcpListener {
    #[inline]
    fn accept(&self) -> Result<(MTcpStream, SocketAddr)> {
        Self::accept(self)
    }

    #[inline]
    fn local_addr(&self) -> Result<SocketAddr> {
        Self::local_addr(self)
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
}

/// Binds a listening socket at `addr`, following §4.3's delayed-error
/// fallback ladder:
///
/// 1. Plain `bind` + `listen`.
/// 2. On `EADDRINUSE`, retry with `SO_REUSEADDR` and `SO_REUSEPORT` set.
/// 3. On `EADDRNOTAVAIL`, retry with `IP_FREEBIND` set (Linux only; other
///    platforms fall straight through to the classified error).
///
/// If none of the attempts succeed, returns the classified [`NetError`]
/// (`AddrInUse` / `AddrNotAvailable`) rather than the raw `io::Error`.
///
/// `reuseport` skips straight to the `SO_REUSEADDR|SO_REUSEPORT` attempt —
/// used when binding one same-address replica listener per worker (§11),
/// where the plain first attempt would otherwise only ever succeed for the
/// first replica and EADDRINUSE every one after it.
pub fn bind_with_fallback(addr: SocketAddr, backlog: i32, reuseport: bool) -> crate::error::Result<MTcpListener> {
    if reuseport {
        return match try_bind(addr, true, false) {
            Ok(sock) => finish(sock, addr, backlog),
            Err(e) if e.kind() == ErrorKind::AddrNotAvailable => match try_bind(addr, true, true) {
                Ok(sock) => finish(sock, addr, backlog),
                Err(_) => Err(NetError::AddrNotAvailable(addr)),
            },
            Err(_) => Err(NetError::AddrInUse(addr)),
        };
    }

    match try_bind(addr, false, false) {
        Ok(sock) => return finish(sock, addr, backlog),
        Err(e) if e.kind() == ErrorKind::AddrInUse => {
            log::warn!("bind {addr} hit EADDRINUSE, retrying with SO_REUSEADDR|SO_REUSEPORT");
        }
        Err(e) if e.kind() == ErrorKind::AddrNotAvailable => {
            log::warn!("bind {addr} hit EADDRNOTAVAIL, retrying with IP_FREEBIND");
            return match try_bind(addr, false, true) {
                Ok(sock) => finish(sock, addr, backlog),
                Err(_) => Err(NetError::AddrNotAvailable(addr)),
            };
        }
        Err(e) => return Err(NetError::Io(e)),
    }

    match try_bind(addr, true, false) {
        Ok(sock) => finish(sock, addr, backlog),
        Err(_) => Err(NetError::AddrInUse(addr)),
    }
}

fn try_bind(addr: SocketAddr, reuse: bool, freebind: bool) -> Result<Socket> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;

    if reuse {
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
    }

    if freebind {
        set_freebind(&socket)?;
    }

    socket.bind(&addr.into())?;

    // Probe success: on platforms where bind's own error is delayed until
    // the first syscall depending on it, `getsockname` forces the issue.
    let _ = socket.local_addr()?;

    Ok(socket)
}

#[cfg(target_os = "linux")]
fn set_freebind(socket: &Socket) -> Result<()> {
    use std::os::unix::io::AsRawFd;
    let fd = socket.as_raw_fd();
    let val: libc::c_int = 1;
    // Safety: `fd` names a socket owned by `socket` for the duration of
    // this call; `val` is a valid `c_int` the kernel reads, matching
    // `IP_FREEBIND`'s documented `int` option type.
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_IP,
            libc::IP_FREEBIND,
            &val as *const libc::c_int as *const libc::c_void,
            std::mem::size_of_val(&val) as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_freebind(_socket: &Socket) -> Result<()> {
    Err(Error::new(ErrorKind::AddrNotAvailable, "IP_FREEBIND unsupported on this platform"))
}

fn finish(socket: Socket, addr: SocketAddr, backlog: i32) -> crate::error::Result<MTcpListener> {
    socket.listen(backlog)?;
    let std_listener: std::net::TcpListener = socket.into();
    let listener = MTcpListener::from_std(std_listener);
    log::debug!("listening on {addr}");
    Ok(listener)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_retry_reuseport_succeeds_after_first_listener() {
        // Port 0 asks the OS to choose a free port, so we discover it from
        // the first bind, then re-target the second at the exact address.
        let first = bind_with_fallback("127.0.0.1:0".parse().unwrap(), 128, false).unwrap();
        let addr = first.local_addr().unwrap();

        let second = bind_with_fallback(addr, 128, false);
        assert!(
            second.is_ok(),
            "expected REUSEADDR|REUSEPORT fallback to succeed, got {second:?}"
        );
    }
}
