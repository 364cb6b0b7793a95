// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) Matrix Construct Developers, Authors & Contributors

//! The closed error taxonomy a Tag's promise resolves to (spec §7).
//!
//! Unifies the original exception-carrying-promise-mixed-with-HTTP-status
//! design into one sum type (see the REDESIGN FLAG on this in spec §9):
//! every terminal outcome of a Tag is either an `http::StatusCode` or one
//! of these variants.

use std::time::Instant;

use http::StatusCode;
use thiserror::Error;

/// Everything that can fail between `submit()` and a Tag's promise being
/// fulfilled.
#[derive(Error, Debug, Clone)]
pub enum BrokerError {
    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("resource: {0}")]
    Resource(#[from] ResourceError),

    #[error("logical: {0}")]
    Logical(#[from] LogicalError),

    #[error("http {status}: {content_type:?}")]
    Http {
        status: StatusCode,
        content_type: Option<String>,
        /// Truncated response body, kept for diagnostics.
        body: Vec<u8>,
    },
}

#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("connection refused")]
    ConnectRefused,
    #[error("timed out")]
    Timeout,
    #[error("connection reset")]
    Reset,
    #[error("eof mid-message")]
    EofMidMessage,
    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(String),
    #[error("DNS resolution failed: {0}")]
    ResolveError(String),
    #[error("NXDOMAIN")]
    NxDomain,
    #[error("io error: {0}")]
    Io(String),
}

#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    #[error("malformed head: {0}")]
    MalformedHead(String),
    #[error("invalid chunk size: {0}")]
    InvalidChunkSize(String),
    #[error(
        "content-length inconsistent with actual read (expected {expected}, got {got})"
    )]
    ContentLengthMismatch { expected: usize, got: usize },
    #[error("header size exceeded limit of {limit} bytes")]
    HeaderSizeExceeded { limit: usize },
}

#[derive(Error, Debug, Clone)]
pub enum ResourceError {
    #[error("content exceeds allocated buffer and truncation is disabled")]
    BufferOverrun,
    #[error("content exceeds content_length_maxalloc ({cap} bytes)")]
    AllocCapExceeded { cap: usize },
}

#[derive(Error, Debug, Clone)]
pub enum LogicalError {
    #[error("request was canceled")]
    Canceled,
    #[error("peer is error-gated until {until:?}")]
    PeerErrorGated { until: Instant },
    #[error("link is closed, no new submits accepted")]
    LinkFinished,
    #[error("no capacity: all links full and link_max reached")]
    NoCapacity,
}

impl BrokerError {
    /// Whether this error represents a Tag that never touched the network
    /// (fail-fast gating, cancellation before commit).
    pub fn is_fail_fast(&self) -> bool {
        matches!(
            self,
            BrokerError::Logical(LogicalError::PeerErrorGated { .. })
                | BrokerError::Logical(LogicalError::Canceled)
        )
    }
}
