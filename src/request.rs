// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) Matrix Construct Developers, Authors & Contributors

//! User-provided, immutable Request description (spec §3).

use std::{fmt, rc::Rc};

use bytes::Bytes;

use crate::cfg::config::RequestDefaults;

/// Called after each successful write slice while inside the content
/// region of the write path (spec §4.3.1).
pub type ProgressFn = Rc<dyn Fn(usize)>;

/// Per-request option bundle (spec §3, §6). Defaults come from
/// `RequestDefaults`; any field here overrides the Peer/Link-wide default.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub http_exceptions: bool,
    pub content_length_maxalloc: usize,
    pub contiguous_content: bool,
    pub chunks_reserve: usize,
    pub truncate_content: bool,
    pub priority: i16,
}

impl From<&RequestDefaults> for RequestOptions {
    fn from(d: &RequestDefaults) -> Self {
        Self {
            http_exceptions: d.http_exceptions,
            content_length_maxalloc: d.content_length_maxalloc,
            contiguous_content: d.contiguous_content,
            chunks_reserve: d.chunks_reserve,
            truncate_content: d.truncate_content,
            priority: d.priority,
        }
    }
}

/// One outgoing HTTP/1.1 request: a head (request line + headers,
/// including `Host`/`Content-Length`/`Authorization`) and a content body.
///
/// The buffer carrying the response body lives with the caller, not here;
/// the Tag borrows it for the duration of the read and returns the
/// unconsumed remainder (spec §4.4 `read_buffer`). `out` mirrors that for
/// the write side: bytes to be sent, already framed by the caller.
pub struct Request {
    pub out: RequestOut,
    /// Buffer the caller wants the response content written into. If
    /// `None`, content is dynamically allocated (spec glossary: "Dynamic
    /// content").
    pub in_content: Option<Vec<u8>>,
    pub progress: Option<ProgressFn>,
    pub options: RequestOptions,
}

pub struct RequestOut {
    pub head: Bytes,
    pub content: Bytes,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("head_len", &self.out.head.len())
            .field("content_len", &self.out.content.len())
            .field("options", &self.options)
            .finish()
    }
}

impl Request {
    pub fn new(head: Bytes, content: Bytes, options: RequestOptions) -> Self {
        Self {
            out: RequestOut { head, content },
            in_content: None,
            progress: None,
            options,
        }
    }

    pub fn with_progress(mut self, cb: ProgressFn) -> Self {
        self.progress = Some(cb);
        self
    }

    pub fn with_in_buffer(mut self, buf: Vec<u8>) -> Self {
        self.in_content = Some(buf);
        self
    }
}

/// Builds a minimal HTTP/1.1 request head: request line plus `Host`,
/// `Content-Length` (or `Transfer-Encoding: chunked` if `content` is
/// empty and `chunked` is requested), and an optional `Authorization`
/// pass-through, terminated by CRLFCRLF (spec §6).
pub fn build_head(
    method: &str,
    path: &str,
    host: &str,
    content_len: usize,
    authorization: Option<&str>,
    extra_headers: &[(&str, &str)],
) -> Bytes {
    let mut s = String::with_capacity(256 + content_len.min(64));
    s.push_str(method);
    s.push(' ');
    s.push_str(path);
    s.push_str(" HTTP/1.1\r\n");
    s.push_str("Host: ");
    s.push_str(host);
    s.push_str("\r\n");
    s.push_str("Content-Length: ");
    s.push_str(&content_len.to_string());
    s.push_str("\r\n");
    if let Some(auth) = authorization {
        s.push_str("Authorization: ");
        s.push_str(auth);
        s.push_str("\r\n");
    }
    for (k, v) in extra_headers {
        s.push_str(k);
        s.push_str(": ");
        s.push_str(v);
        s.push_str("\r\n");
    }
    s.push_str("\r\n");
    Bytes::from(s.into_bytes())
}
