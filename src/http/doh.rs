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

//! DoH request/response shaping (§4.5, RFC 8484): turning a raw DNS
//! message into an HTTP/2 request and back.

use crate::error::{NetError, Result};
use crate::http::url;

/// Builds the `:path` for a GET-shaped DoH request.
pub fn get_path(base_path: &str, dns_message: &[u8]) -> String {
    format!("{base_path}?dns={}", url::encode_dns_param(dns_message))
}

/// Recovers the DNS message a request carried, dispatching on method.
///
/// For `GET`, the message is the `dns` query parameter on `path`. For
/// `POST`, it is `body` verbatim. Any other method is rejected.
pub fn extract_request_message(method: &str, path: &str, body: &[u8]) -> Result<Vec<u8>> {
    match method {
        "GET" => {
            let query = path
                .split_once('?')
                .map(|(_, q)| q)
                .ok_or(NetError::InvalidProto("GET DoH request missing query string"))?;
            let param = url::parse_dns_param(query)?;
            url::decode_dns_param(&param)
        }
        "POST" => Ok(body.to_vec()),
        _ => Err(NetError::InvalidProto("unsupported DoH method")),
    }
}

/// Splits a `:path` into its base path and query string, if any.
pub fn split_path(path: &str) -> (&str, Option<&str>) {
    match path.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_request_round_trips_dns_message() {
        let message = b"\x00\x01\x00\x01message";
        let path = get_path("/dns-query", message);
        let recovered = extract_request_message("GET", &path, b"").unwrap();
        assert_eq!(recovered, message);
    }

    #[test]
    fn post_request_uses_body_verbatim() {
        let message = b"raw-dns-message";
        let recovered = extract_request_message("POST", "/dns-query", message).unwrap();
        assert_eq!(recovered, message);
    }

    #[test]
    fn unsupported_method_is_rejected() {
        assert!(extract_request_message("PUT", "/dns-query", b"").is_err());
    }
}
