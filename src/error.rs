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

//! Error taxonomy for the network manager.
//!
//! Every public operation returns [`Result<T>`], whose error variants map
//! onto the fixed kinds a consumer needs to branch on (`ErrorKind`) without
//! caring which concrete failure produced them.

use std::io;

/// Coarse error taxonomy a caller can match on to decide recovery policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Operation completed normally; never carried by an `Err`.
    Success,
    /// Shutdown, `cancel_read`, or a closing listener canceled the operation.
    Canceled,
    /// A connect or read timer fired without being deferred.
    TimedOut,
    /// Accept failed outright because the quota was exhausted.
    Quota,
    /// Accept succeeded but the quota is at its soft threshold.
    SoftQuota,
    /// The peer closed its side of the stream.
    Eof,
    /// The transport reported a reset.
    ConnectionReset,
    /// Bind failed after exhausting the `REUSEADDR`/`FREEBIND` fallbacks.
    AddrInUse,
    /// Bind failed and the address is not available on this host.
    AddrNotAvailable,
    /// The operation targeted a socket with no carrier.
    NotConnected,
    /// TLS handshake or record-layer failure.
    TlsError,
    /// The peer's certificate was rejected.
    TlsBadPeerCert,
    /// ALPN negotiation did not select the protocol the listener requires.
    AlpnError,
    /// HTTP/2 framing or `content-type` violation.
    InvalidProto,
    /// Unclassified failure.
    Failure,
}

/// Errors produced by network manager operations.
///
/// Variant-to-kind mapping implements the table in the error handling
/// design: each row is one variant, `kind()` collapses back to the coarse
/// taxonomy the consumer branches on.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// §7 `CANCELED`.
    #[error("operation canceled")]
    Canceled,
    /// §7 `TIMEDOUT`.
    #[error("operation timed out")]
    TimedOut,
    /// §7 `QUOTA`.
    #[error("quota exhausted")]
    Quota,
    /// §7 `SOFTQUOTA` — not a failure; accept succeeded under a warning.
    #[error("soft quota threshold reached")]
    SoftQuota,
    /// §7 `EOF`.
    #[error("peer closed the stream")]
    Eof,
    /// §7 `CONNECTIONRESET`.
    #[error("connection reset by peer")]
    ConnectionReset,
    /// §7 `ADDRINUSE`.
    #[error("address already in use: {0}")]
    AddrInUse(std::net::SocketAddr),
    /// §7 `ADDRNOTAVAIL`.
    #[error("address not available: {0}")]
    AddrNotAvailable(std::net::SocketAddr),
    /// §7 `NOTCONNECTED`.
    #[error("operation attempted on a socket with no carrier")]
    NotConnected,
    /// §7 `TLSERROR`.
    #[error("tls error: {0}")]
    TlsError(#[from] rustls::Error),
    /// §7 `TLSBADPEERCERT`.
    #[error("peer certificate rejected")]
    TlsBadPeerCert,
    /// §7 `DOTALPNERROR` / `HTTP2ALPNERROR`.
    #[error("ALPN negotiation did not select the required protocol")]
    AlpnError,
    /// §7 `INVALIDPROTO`.
    #[error("invalid protocol framing: {0}")]
    InvalidProto(&'static str),
    /// §7 `INVALIDPROTO` — malformed HTTP/2 framing specifically.
    #[error("http/2 framing error: {0}")]
    Http2FrameError(String),
    /// Underlying OS I/O failure, not otherwise classified above.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// §7 `FAILURE` — unclassified.
    #[error("unclassified failure: {0}")]
    Failure(&'static str),
}

impl NetError {
    /// Collapses a concrete error into the coarse kind a caller matches on.
    pub fn kind(&self) -> ErrorKind {
        match self {
            NetError::Canceled => ErrorKind::Canceled,
            NetError::TimedOut => ErrorKind::TimedOut,
            NetError::Quota => ErrorKind::Quota,
            NetError::SoftQuota => ErrorKind::SoftQuota,
            NetError::Eof => ErrorKind::Eof,
            NetError::ConnectionReset => ErrorKind::ConnectionReset,
            NetError::AddrInUse(_) => ErrorKind::AddrInUse,
            NetError::AddrNotAvailable(_) => ErrorKind::AddrNotAvailable,
            NetError::NotConnected => ErrorKind::NotConnected,
            NetError::TlsError(_) => ErrorKind::TlsError,
            NetError::TlsBadPeerCert => ErrorKind::TlsBadPeerCert,
            NetError::AlpnError => ErrorKind::AlpnError,
            NetError::InvalidProto(_) => ErrorKind::InvalidProto,
            NetError::Http2FrameError(_) => ErrorKind::InvalidProto,
            NetError::Io(e) => match e.kind() {
                io::ErrorKind::ConnectionReset => ErrorKind::ConnectionReset,
                io::ErrorKind::NotConnected => ErrorKind::NotConnected,
                io::ErrorKind::TimedOut => ErrorKind::TimedOut,
                _ => ErrorKind::Failure,
            },
            NetError::Failure(_) => ErrorKind::Failure,
        }
    }

    /// Whether this error is carrier-fatal: it must close the transport and
    /// fail every stream multiplexed on top of it, rather than only the
    /// operation that observed it.
    pub fn is_carrier_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::TlsError
                | ErrorKind::TlsBadPeerCert
                | ErrorKind::AlpnError
                | ErrorKind::ConnectionReset
        )
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, NetError>;
