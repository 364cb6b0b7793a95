// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) Matrix Construct Developers, Authors & Contributors

//! Chunk-header line scanning (spec §4.3.2; terminator is a zero-size
//! chunk followed by trailing CRLFCRLF, spec §6).

use crate::error::{BrokerError, ProtocolError};

/// Looks for a CRLF-terminated line within `buf`. Returns the byte length
/// of the line including the CRLF, or `None` if no terminator has arrived
/// yet.
pub fn find_line_end(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n").map(|i| i + 2)
}

/// Parses a chunk-size line (`<hex-size>[;ext...]\r\n`) into the chunk
/// size. Chunk extensions are accepted and ignored.
pub fn parse_chunk_size_line(line: &[u8]) -> Result<usize, BrokerError> {
    let line = line
        .strip_suffix(b"\r\n")
        .ok_or_else(|| {
            BrokerError::Protocol(ProtocolError::InvalidChunkSize(
                "missing CRLF".into(),
            ))
        })?;
    let hex_part = line
        .split(|&b| b == b';')
        .next()
        .unwrap_or(line);
    let s = std::str::from_utf8(hex_part).map_err(|_| {
        BrokerError::Protocol(ProtocolError::InvalidChunkSize("non-utf8".into()))
    })?;
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Err(BrokerError::Protocol(ProtocolError::InvalidChunkSize(
            "empty size field".into(),
        )));
    }
    usize::from_str_radix(trimmed, 16).map_err(|_| {
        BrokerError::Protocol(ProtocolError::InvalidChunkSize(format!(
            "not valid hex: {trimmed:?}"
        )))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_line_end() {
        let buf = b"5\r\nhello\r\n";
        assert_eq!(find_line_end(buf), Some(3));
    }

    #[test]
    fn no_terminator_yet() {
        assert_eq!(find_line_end(b"5"), None);
    }

    #[test]
    fn parses_plain_size() {
        assert_eq!(parse_chunk_size_line(b"1a\r\n").unwrap(), 0x1a);
    }

    #[test]
    fn parses_size_with_extension() {
        assert_eq!(parse_chunk_size_line(b"ff;foo=bar\r\n").unwrap(), 0xff);
    }

    #[test]
    fn zero_size_is_terminator() {
        assert_eq!(parse_chunk_size_line(b"0\r\n").unwrap(), 0);
    }

    #[test]
    fn rejects_non_hex() {
        assert!(parse_chunk_size_line(b"zz\r\n").is_err());
    }
}
