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

//! DoH URL parsing and the base64url conversions the `dns` query parameter
//! needs (§4.5).
//!
//! This is deliberately narrow: not a general-purpose URL crate, just the
//! `scheme://host[:port]/path?query` shape a DoH target needs.

use crate::error::{NetError, Result};

/// A parsed DoH target URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DohUrl {
    pub use_tls: bool,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub query: Option<String>,
}

/// Parses `scheme://host[:port]/path?query`. `host` may be a hostname, an
/// IPv4 literal, or a bracketed IPv6 literal. Missing ports default per
/// scheme: 443 for `https`, 80 for `http`.
pub fn parse_url(input: &str) -> Result<DohUrl> {
    let (scheme, rest) = input
        .split_once("://")
        .ok_or(NetError::InvalidProto("url missing scheme"))?;
    let use_tls = match scheme {
        "https" => true,
        "http" => false,
        _ => return Err(NetError::InvalidProto("url scheme must be http or https")),
    };

    let (authority, path_and_query) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };
    if authority.is_empty() {
        return Err(NetError::InvalidProto("url missing host"));
    }

    let (host, port) = split_host_port(authority, use_tls)?;

    let (path, query) = match path_and_query.split_once('?') {
        Some((p, q)) => (p.to_string(), Some(q.to_string())),
        None => (path_and_query.to_string(), None),
    };

    Ok(DohUrl { use_tls, host, port, path, query })
}

fn split_host_port(authority: &str, use_tls: bool) -> Result<(String, u16)> {
    let default_port = if use_tls { 443 } else { 80 };
    if let Some(rest) = authority.strip_prefix('[') {
        // Bracketed IPv6 literal: `[::1]` or `[::1]:port`.
        let (host, after) = rest
            .split_once(']')
            .ok_or(NetError::InvalidProto("unterminated ipv6 literal"))?;
        if after.is_empty() {
            return Ok((host.to_string(), default_port));
        }
        let port_str = after
            .strip_prefix(':')
            .ok_or(NetError::InvalidProto("malformed port after ipv6 literal"))?;
        let port: u16 = port_str
            .parse()
            .map_err(|_| NetError::InvalidProto("malformed port after ipv6 literal"))?;
        Ok((host.to_string(), port))
    } else if let Some((host, port_str)) = authority.rsplit_once(':') {
        // Guard against a bare IPv6 literal without brackets colliding
        // with the host:port split.
        if host.contains(':') {
            Ok((authority.to_string(), default_port))
        } else {
            let port: u16 =
                port_str.parse().map_err(|_| NetError::InvalidProto("malformed port"))?;
            Ok((host.to_string(), port))
        }
    } else {
        Ok((authority.to_string(), default_port))
    }
}

/// Percent-decodes `input`, rejecting malformed escapes.
fn percent_decode(input: &str) -> Result<Vec<u8>> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if i + 2 >= bytes.len() {
                return Err(NetError::InvalidProto("truncated percent-encoding"));
            }
            let hi = hex_digit(bytes[i + 1])?;
            let lo = hex_digit(bytes[i + 2])?;
            out.push((hi << 4) | lo);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    Ok(out)
}

fn hex_digit(b: u8) -> Result<u8> {
    match b {
        b'0'..=b'9' => Ok(b - b'0'),
        b'a'..=b'f' => Ok(b - b'a' + 10),
        b'A'..=b'F' => Ok(b - b'A' + 10),
        _ => Err(NetError::InvalidProto("invalid percent-encoding")),
    }
}

/// Extracts the `dns` query parameter's value (§4.5): last `dns=` wins,
/// percent-decoded, and validated against the base64url alphabet.
pub fn parse_dns_param(query: &str) -> Result<String> {
    let mut found: Option<&str> = None;
    for pair in query.split('&') {
        if let Some(value) = pair.strip_prefix("dns=") {
            found = Some(value);
        }
    }
    let raw = found.ok_or(NetError::InvalidProto("missing dns query parameter"))?;
    let decoded = percent_decode(raw)?;
    let value = String::from_utf8(decoded).map_err(|_| NetError::InvalidProto("dns param is not utf-8"))?;
    if value.is_empty() || !value.bytes().all(is_base64url_char) {
        return Err(NetError::InvalidProto("dns param is not valid base64url"));
    }
    Ok(value)
}

fn is_base64url_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'-' || b == b'_'
}

/// Converts base64url to standard base64: `-`→`+`, `_`→`/`, then pads with
/// `=` to a multiple of four. Rejects input already containing `=` or `%`.
pub fn base64url_to_base64(input: &str) -> Result<String> {
    if input.bytes().any(|b| b == b'=' || b == b'%') {
        return Err(NetError::InvalidProto("base64url input must not contain '=' or '%'"));
    }
    let mut out: String = input
        .chars()
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            other => other,
        })
        .collect();
    while out.len() % 4 != 0 {
        out.push('=');
    }
    Ok(out)
}

/// Converts standard base64 to base64url: inverse substitutions, padding
/// stripped. Rejects input already containing `-` or `_`.
pub fn base64_to_base64url(input: &str) -> Result<String> {
    if input.bytes().any(|b| b == b'-' || b == b'_') {
        return Err(NetError::InvalidProto("base64 input must not contain '-' or '_'"));
    }
    let out: String = input
        .trim_end_matches('=')
        .chars()
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            other => other,
        })
        .collect();
    Ok(out)
}

/// Decodes a `dns` query-parameter value directly to the raw DNS message
/// bytes it represents.
pub fn decode_dns_param(value: &str) -> Result<Vec<u8>> {
    use base64::Engine;
    let std_b64 = base64url_to_base64(value)?;
    base64::engine::general_purpose::STANDARD
        .decode(std_b64)
        .map_err(|_| NetError::InvalidProto("dns param is not valid base64"))
}

/// Encodes raw DNS message bytes into a `dns` query-parameter value.
pub fn encode_dns_param(message: &[u8]) -> String {
    use base64::Engine;
    let std_b64 = base64::engine::general_purpose::STANDARD.encode(message);
    base64_to_base64url(&std_b64).expect("standard base64 output never contains '-' or '_'")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_https_url_with_default_port() {
        let url = parse_url("https://dns.example.com/dns-query?dns=abc").unwrap();
        assert!(url.use_tls);
        assert_eq!(url.host, "dns.example.com");
        assert_eq!(url.port, 443);
        assert_eq!(url.path, "/dns-query");
        assert_eq!(url.query.as_deref(), Some("dns=abc"));
    }

    #[test]
    fn parses_bracketed_ipv6_literal_with_port() {
        let url = parse_url("http://[::1]:8080/x").unwrap();
        assert_eq!(url.host, "::1");
        assert_eq!(url.port, 8080);
    }

    #[test]
    fn dns_param_last_wins() {
        let q = "title=%D0%92&dns=AAABAAABAAAAAAAAAWE-&veaction=edit";
        let value = parse_dns_param(q).unwrap();
        assert_eq!(value, "AAABAAABAAAAAAAAAWE-");
        assert_eq!(value.len(), 20);
    }

    #[test]
    fn rejects_malformed_percent_encoding() {
        assert!(parse_dns_param("dns=abc%2").is_err());
    }

    #[test]
    fn base64url_round_trips_through_base64() {
        let original = "AAABAAABAAAAAAAAAWE-";
        let std_form = base64url_to_base64(original).unwrap();
        let back = base64_to_base64url(&std_form).unwrap();
        assert_eq!(back, original);
    }

    #[test]
    fn base64url_rejects_padding_and_percent() {
        assert!(base64url_to_base64("abc=").is_err());
        assert!(base64url_to_base64("abc%20").is_err());
    }

    #[test]
    fn dns_param_decodes_to_original_bytes() {
        let body = b"hello dns message";
        let encoded = encode_dns_param(body);
        let decoded = decode_dns_param(&encoded).unwrap();
        assert_eq!(decoded, body);
    }
}
