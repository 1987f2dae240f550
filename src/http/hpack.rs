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

//! HPACK header compression (RFC 7541), via the `hpack` crate. Each
//! direction of a connection keeps its own dynamic table, so a session
//! holds one encoder and one decoder.

use crate::error::{NetError, Result};

/// A (name, value) header pair, decoded from UTF-8 where possible.
pub type Header = (String, String);

/// Wraps the per-connection encode/decode dynamic tables.
pub struct HpackContext {
    encoder: hpack::Encoder<'static>,
    decoder: hpack::Decoder<'static>,
}

impl HpackContext {
    /// Creates fresh encode/decode contexts with empty dynamic tables.
    pub fn new() -> Self {
        Self { encoder: hpack::Encoder::new(), decoder: hpack::Decoder::new() }
    }

    /// Encodes header pairs into a single header block.
    pub fn encode(&mut self, headers: &[(&str, &str)]) -> Vec<u8> {
        let pairs: Vec<(&[u8], &[u8])> =
            headers.iter().map(|(n, v)| (n.as_bytes(), v.as_bytes())).collect();
        self.encoder.encode(pairs)
    }

    /// Decodes a header block into name/value pairs.
    pub fn decode(&mut self, block: &[u8]) -> Result<Vec<Header>> {
        let pairs = self
            .decoder
            .decode(block)
            .map_err(|_| NetError::Http2FrameError("hpack decompression failed".into()))?;
        Ok(pairs
            .into_iter()
            .map(|(n, v)| (String::from_utf8_lossy(&n).into_owned(), String::from_utf8_lossy(&v).into_owned()))
            .collect())
    }
}

impl Default for HpackContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HpackContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HpackContext").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_pseudo_headers() {
        let mut enc = HpackContext::new();
        let block = enc.encode(&[(":method", "GET"), (":path", "/dns-query")]);

        let mut dec = HpackContext::new();
        let headers = dec.decode(&block).unwrap();
        assert_eq!(headers[0], (":method".to_string(), "GET".to_string()));
        assert_eq!(headers[1], (":path".to_string(), "/dns-query".to_string()));
    }
}
