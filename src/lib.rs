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

//! A multi-threaded, event-driven transport core for DNS traffic over
//! TCP, TLS, and HTTP/2 DoH, with quota-gated admission control.
//!
//! [`NetworkManager`] owns a fixed pool of worker threads, each driving
//! its own `mio` event loop. A socket lives on exactly one worker for its
//! entire life; every cross-thread operation against it is marshalled as
//! a [`event::NetEvent`] enqueued on that worker's inbox and a
//! [`handle::Handle`] is the only consumer-facing reference to it.

pub mod buffer;
pub mod config;
pub mod error;
pub mod event;
pub mod handle;
pub mod http;
pub mod listenlist;
pub mod manager;
pub mod net;
pub mod quota;
pub mod socket;
pub mod tcp;
pub mod timer;
pub mod tls;
pub mod worker;

pub use config::NetmgrConfig;
pub use error::{ErrorKind, NetError, Result};
pub use handle::Handle;
pub use manager::{DohMethod, NetworkManager};
pub use quota::Quota;
pub use socket::{AcceptCb, ConnectCb, DohClientCb, DohRecvCb, RecvCb, RecvResult, SendCb, SocketId};
