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

//! HTTP/2 session multiplexing (§4.5): tracks streams over one carrier
//! connection and turns frames into DoH-shaped events.
//!
//! Header blocks spanning CONTINUATION frames are not supported; DoH
//! request/response headers are small enough to fit a single HEADERS
//! frame in practice.

use std::collections::HashMap;

use crate::error::{NetError, Result};
use crate::http::frame::{Frame, FrameDecoder, FrameType};
use crate::http::hpack::HpackContext;

/// A higher-level event produced by feeding bytes into a session.
#[derive(Debug)]
pub enum Http2Event {
    /// The peer's connection preface and initial SETTINGS were accepted.
    Ready,
    /// A request's headers completed (server-side).
    RequestHeaders { stream_id: u32, method: String, path: String, end_stream: bool },
    /// A response's headers completed (client-side).
    ResponseHeaders { stream_id: u32, status: u16, content_type: String, end_stream: bool },
    /// A DATA frame was delivered for a stream.
    Data { stream_id: u32, bytes: Vec<u8>, end_stream: bool },
    /// The peer reset a stream.
    StreamReset { stream_id: u32 },
    /// A new request's HEADERS arrived but the session already has
    /// `max_concurrent_streams` open; the stream was refused without being
    /// dispatched (§4.5) and the caller should send `RST_STREAM
    /// (REFUSED_STREAM)`.
    StreamRefused { stream_id: u32 },
    /// The peer is closing the connection.
    GoAway,
    /// A PING frame arrived; the caller is expected to reply with
    /// [`Http2Session::encode_ping_ack`].
    Ping,
}

#[derive(Debug, Default)]
struct StreamState {
    header_block: Vec<u8>,
    headers_done: bool,
}

/// One HTTP/2 connection's worth of multiplexing state.
pub struct Http2Session {
    is_server: bool,
    preface_seen: bool,
    decoder: FrameDecoder,
    hpack_send: HpackContext,
    hpack_recv: HpackContext,
    streams: HashMap<u32, StreamState>,
    next_client_stream_id: u32,
    max_concurrent_streams: u32,
}

impl Http2Session {
    /// Creates a session. `is_server` selects whether the connection
    /// preface is expected (server) or sent (client).
    pub fn new(is_server: bool, max_concurrent_streams: u32) -> Self {
        Self {
            is_server,
            preface_seen: !is_server,
            decoder: FrameDecoder::new(),
            hpack_send: HpackContext::new(),
            hpack_recv: HpackContext::new(),
            streams: HashMap::new(),
            next_client_stream_id: 1,
            max_concurrent_streams,
        }
    }

    /// The connection preface plus an initial SETTINGS frame, written once
    /// at session start.
    pub fn initial_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        if !self.is_server {
            out.extend_from_slice(crate::http::frame::PREFACE);
        }
        out.extend_from_slice(&Frame::settings(false).encode());
        out
    }

    /// Feeds newly received bytes and returns every event they produced.
    pub fn receive(&mut self, bytes: &[u8]) -> Result<Vec<Http2Event>> {
        let mut input = bytes;
        if self.is_server && !self.preface_seen {
            let preface = crate::http::frame::PREFACE;
            if input.len() < preface.len() {
                // Wait for the rest of the preface before buffering frames.
                return Ok(Vec::new());
            }
            if &input[..preface.len()] != preface {
                return Err(NetError::Http2FrameError("missing connection preface".into()));
            }
            input = &input[preface.len()..];
            self.preface_seen = true;
        }

        self.decoder.feed(input);
        let frames = self.decoder.drain_frames()?;
        let mut events = Vec::with_capacity(frames.len());
        for frame in frames {
            self.handle_frame(frame, &mut events)?;
        }
        Ok(events)
    }

    fn handle_frame(&mut self, frame: Frame, events: &mut Vec<Http2Event>) -> Result<()> {
        match frame.frame_type {
            FrameType::Settings => {
                if frame.flags & crate::http::frame::FLAG_ACK == 0 {
                    events.push(Http2Event::Ready);
                }
            }
            FrameType::Ping => {
                events.push(Http2Event::Ping);
            }
            FrameType::GoAway => events.push(Http2Event::GoAway),
            FrameType::RstStream => events.push(Http2Event::StreamReset { stream_id: frame.stream_id }),
            FrameType::WindowUpdate => {}
            FrameType::Headers => self.handle_headers(frame, events)?,
            FrameType::Continuation => {
                return Err(NetError::Http2FrameError(
                    "continuation frames are not supported".into(),
                ))
            }
            FrameType::Data => {
                let end_stream = frame.end_stream();
                events.push(Http2Event::Data {
                    stream_id: frame.stream_id,
                    bytes: frame.payload,
                    end_stream,
                });
            }
            FrameType::Unknown(_) => {}
        }
        Ok(())
    }

    fn handle_headers(&mut self, frame: Frame, events: &mut Vec<Http2Event>) -> Result<()> {
        if !frame.end_headers() {
            return Err(NetError::Http2FrameError(
                "header block fragmentation across frames is not supported".into(),
            ));
        }
        let block = frame.header_block_fragment().to_vec();
        let end_stream = frame.end_stream();
        let headers = self.hpack_recv.decode(&block)?;

        let is_new_stream = !self.streams.contains_key(&frame.stream_id);
        if self.is_server && is_new_stream && self.streams.len() >= self.max_concurrent_streams as usize {
            events.push(Http2Event::StreamRefused { stream_id: frame.stream_id });
            return Ok(());
        }

        self.streams.entry(frame.stream_id).or_default().headers_done = true;

        if self.is_server {
            let mut method = String::new();
            let mut path = String::new();
            for (name, value) in headers {
                match name.as_str() {
                    ":method" => method = value,
                    ":path" => path = value,
                    _ => {}
                }
            }
            events.push(Http2Event::RequestHeaders { stream_id: frame.stream_id, method, path, end_stream });
        } else {
            let mut status = 0u16;
            let mut content_type = String::new();
            for (name, value) in headers {
                match name.as_str() {
                    ":status" => status = value.parse().unwrap_or(0),
                    "content-type" => content_type = value,
                    _ => {}
                }
            }
            events.push(Http2Event::ResponseHeaders {
                stream_id: frame.stream_id,
                status,
                content_type,
                end_stream,
            });
        }
        Ok(())
    }

    /// Builds a new client-initiated stream id (odd, monotonically
    /// increasing per RFC 7540 §5.1.1).
    fn allocate_stream_id(&mut self) -> u32 {
        let id = self.next_client_stream_id;
        self.next_client_stream_id += 2;
        id
    }

    /// Encodes a GET-shaped DoH request and returns its stream id plus the
    /// bytes to write to the carrier.
    pub fn encode_get_request(&mut self, authority: &str, path_with_query: &str) -> (u32, Vec<u8>) {
        let stream_id = self.allocate_stream_id();
        let block = self.hpack_send.encode(&[
            (":method", "GET"),
            (":scheme", "https"),
            (":authority", authority),
            (":path", path_with_query),
            ("accept", "application/dns-message"),
        ]);
        (stream_id, Frame::headers(stream_id, block, true).encode())
    }

    /// Encodes a POST-shaped DoH request (headers + body in one DATA
    /// frame) and returns its stream id plus the bytes to write.
    pub fn encode_post_request(&mut self, authority: &str, path: &str, body: &[u8]) -> (u32, Vec<u8>) {
        let stream_id = self.allocate_stream_id();
        let block = self.hpack_send.encode(&[
            (":method", "POST"),
            (":scheme", "https"),
            (":authority", authority),
            (":path", path),
            ("content-type", "application/dns-message"),
        ]);
        let mut out = Frame::headers(stream_id, block, false).encode();
        out.extend_from_slice(&Frame::data(stream_id, body.to_vec(), true).encode());
        (stream_id, out)
    }

    /// Encodes a `200 application/dns-message` response on `stream_id`.
    pub fn encode_response(&mut self, stream_id: u32, body: &[u8]) -> Vec<u8> {
        let block =
            self.hpack_send.encode(&[(":status", "200"), ("content-type", "application/dns-message")]);
        let mut out = Frame::headers(stream_id, block, false).encode();
        out.extend_from_slice(&Frame::data(stream_id, body.to_vec(), true).encode());
        out
    }

    /// Encodes an error response with the given status and no body.
    pub fn encode_error_response(&mut self, stream_id: u32, status: u16) -> Vec<u8> {
        let status = status.to_string();
        let block = self.hpack_send.encode(&[(":status", status.as_str())]);
        Frame::headers(stream_id, block, true).encode()
    }

    /// Encodes a PING ack for a received PING payload.
    pub fn encode_ping_ack(&self) -> Vec<u8> {
        Frame::ping([0; 8], true).encode()
    }

    /// Encodes a GOAWAY announcing the connection is closing.
    pub fn encode_goaway(&self, last_stream_id: u32) -> Vec<u8> {
        Frame::go_away(last_stream_id, 0).encode()
    }

    /// Encodes an RST_STREAM(REFUSED_STREAM) for a stream that exceeded
    /// `max_concurrent_streams` and was never dispatched (§4.5).
    pub fn encode_refused_stream(&self, stream_id: u32) -> Vec<u8> {
        Frame::rst_stream(stream_id, crate::http::frame::ERROR_REFUSED_STREAM).encode()
    }

    /// Drops bookkeeping for a completed or reset stream.
    pub fn close_stream(&mut self, stream_id: u32) {
        self.streams.remove(&stream_id);
    }

    /// Configured cap on concurrently open server-side streams, enforced
    /// against new `RequestHeaders` as they arrive.
    pub fn max_concurrent_streams(&self) -> u32 {
        self.max_concurrent_streams
    }
}

impl std::fmt::Debug for Http2Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Http2Session")
            .field("is_server", &self.is_server)
            .field("streams", &self.streams.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_session_parses_preface_and_get_request() {
        let mut server = Http2Session::new(true, 100);
        let mut client = Http2Session::new(false, 100);

        let mut bytes = client.initial_bytes();
        let (stream_id, req) = client.encode_get_request("dns.example.com", "/dns-query?dns=abc");
        bytes.extend_from_slice(&req);

        let events = server.receive(&bytes).unwrap();
        let found = events.iter().any(|e| matches!(
            e,
            Http2Event::RequestHeaders { stream_id: sid, method, path, end_stream: true }
                if *sid == stream_id && method == "GET" && path == "/dns-query?dns=abc"
        ));
        assert!(found, "expected a RequestHeaders event, got {events:?}");
    }

    #[test]
    fn client_session_parses_response_and_body() {
        let mut server = Http2Session::new(true, 100);
        let mut client = Http2Session::new(false, 100);
        client.initial_bytes();

        let resp = server.encode_response(1, b"dns-response-bytes");
        let events = client.receive(&resp).unwrap();

        assert!(events.iter().any(|e| matches!(e, Http2Event::ResponseHeaders { status: 200, .. })));
        assert!(events.iter().any(|e| matches!(e, Http2Event::Data { bytes, end_stream: true, .. } if bytes == b"dns-response-bytes")));
    }

    #[test]
    fn server_refuses_stream_over_max_concurrent_streams() {
        let mut server = Http2Session::new(true, 1);
        let mut client = Http2Session::new(false, 1);

        let mut bytes = client.initial_bytes();
        let (first_id, req1) = client.encode_get_request("dns.example.com", "/dns-query?dns=aaa");
        let (second_id, req2) = client.encode_get_request("dns.example.com", "/dns-query?dns=bbb");
        bytes.extend_from_slice(&req1);
        bytes.extend_from_slice(&req2);

        let events = server.receive(&bytes).unwrap();
        assert!(events
            .iter()
            .any(|e| matches!(e, Http2Event::RequestHeaders { stream_id, .. } if *stream_id == first_id)));
        assert!(events
            .iter()
            .any(|e| matches!(e, Http2Event::StreamRefused { stream_id } if *stream_id == second_id)));
    }
}
