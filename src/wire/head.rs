// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) Matrix Construct Developers, Authors & Contributors

use http::StatusCode;

use crate::error::{BrokerError, ProtocolError};

/// Fields pulled out of a parsed HTTP/1.1 response head (spec: `response
/// head` incl. status, content-type, content-length/transfer-encoding —
/// modeled on `ircd::http::response::head` in `original_source`).
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub content_length: Option<usize>,
    pub chunked: bool,
    pub content_type: Option<String>,
}

/// Attempts to parse a complete HTTP/1.1 response head out of `buf`.
///
/// Returns `Ok(None)` if `buf` does not yet contain a full head (more
/// bytes are needed — the AWAIT_HEAD state stays put). Returns
/// `Ok(Some((head, consumed)))` where `consumed` is the number of bytes
/// of `buf` occupied by the head, including the terminating CRLFCRLF.
pub fn try_parse_response_head(
    buf: &[u8],
) -> Result<Option<(ResponseHead, usize)>, BrokerError> {
    const MAX_HEADERS: usize = 64;
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut headers);

    match resp.parse(buf) {
        Ok(httparse::Status::Partial) => Ok(None),
        Ok(httparse::Status::Complete(consumed)) => {
            let code = resp.code.ok_or_else(|| {
                BrokerError::Protocol(ProtocolError::MalformedHead(
                    "missing status code".into(),
                ))
            })?;
            let status = StatusCode::from_u16(code).map_err(|_| {
                BrokerError::Protocol(ProtocolError::MalformedHead(format!(
                    "invalid status code {code}"
                )))
            })?;

            let mut content_length = None;
            let mut chunked = false;
            let mut content_type = None;

            for h in resp.headers.iter() {
                if h.name.eq_ignore_ascii_case("content-length") {
                    let v = std::str::from_utf8(h.value).map_err(|_| {
                        BrokerError::Protocol(ProtocolError::MalformedHead(
                            "non-utf8 Content-Length".into(),
                        ))
                    })?;
                    let len: usize = v.trim().parse().map_err(|_| {
                        BrokerError::Protocol(ProtocolError::MalformedHead(format!(
                            "invalid Content-Length {v:?}"
                        )))
                    })?;
                    content_length = Some(len);
                } else if h.name.eq_ignore_ascii_case("transfer-encoding") {
                    let v = String::from_utf8_lossy(h.value);
                    if v.to_ascii_lowercase().contains("chunked") {
                        chunked = true;
                    }
                } else if h.name.eq_ignore_ascii_case("content-type") {
                    content_type = Some(String::from_utf8_lossy(h.value).into_owned());
                }
            }

            Ok(Some((
                ResponseHead {
                    status,
                    content_length,
                    chunked,
                    content_type,
                },
                consumed,
            )))
        },
        Err(e) => Err(BrokerError::Protocol(ProtocolError::MalformedHead(
            e.to_string(),
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fixed_length_head() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nContent-Type: application/json\r\n\r\nhello";
        let (head, consumed) = try_parse_response_head(raw).unwrap().unwrap();
        assert_eq!(head.status, StatusCode::OK);
        assert_eq!(head.content_length, Some(5));
        assert!(!head.chunked);
        assert_eq!(head.content_type.as_deref(), Some("application/json"));
        assert_eq!(&raw[consumed..], b"hello");
    }

    #[test]
    fn parses_chunked_head() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n";
        let (head, consumed) = try_parse_response_head(raw).unwrap().unwrap();
        assert!(head.chunked);
        assert_eq!(head.content_length, None);
        assert_eq!(&raw[consumed..], b"5\r\nhello\r\n0\r\n\r\n");
    }

    #[test]
    fn partial_head_returns_none() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Len";
        assert!(try_parse_response_head(raw).unwrap().is_none());
    }

    #[test]
    fn malformed_status_line_is_an_error() {
        let raw = b"not an http response\r\n\r\n";
        assert!(try_parse_response_head(raw).is_err());
    }
}
