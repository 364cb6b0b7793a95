// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) Matrix Construct Developers, Authors & Contributors

//! The Tag component (spec §4.4): per-request bookkeeping multiplexed
//! onto a Link — write/read progress counters, the head/content parse
//! state machine, and the one-shot promise a submitter awaits.
//!
//! Field layout is grounded in `original_source/include/ircd/server/tag.h`
//! (`tag::state`); the promise is realized with `tokio::sync::oneshot`
//! rather than `ctx::promise<http::code>` since a Tag yields exactly one
//! terminal value in this runtime (see the concurrency note in
//! `DESIGN.md`).

use std::{cell::RefCell, rc::Rc};

use bytes::Bytes;
use http::StatusCode;
use tokio::sync::oneshot;

use crate::{
    error::{BrokerError, ProtocolError, ResourceError},
    request::{Request, RequestOptions},
    wire::{chunked, head::try_parse_response_head},
};

/// Byte-granular write/read progress, mirroring `tag::state` in
/// `original_source`.
#[derive(Debug, Default, Clone)]
pub struct TagState {
    pub written: usize,
    pub head_read: usize,
    pub content_read: usize,
    pub content_length: usize,
    pub chunk_read: usize,
    /// `None` while scanning for the next chunk-size line.
    pub chunk_length: Option<usize>,
    pub status: Option<StatusCode>,
}

/// What the Tag ultimately delivers to the submitter on success.
#[derive(Debug, Clone)]
pub enum TagContent {
    Fixed(Bytes),
    Chunks(Vec<Bytes>),
}

#[derive(Debug, Clone)]
pub struct TagOutcome {
    pub status: StatusCode,
    pub content: TagContent,
}

pub type TagPromise = oneshot::Receiver<Result<TagOutcome, BrokerError>>;

/// Body bytes kept on an `http_exceptions` rejection, for diagnostics only.
const HTTP_EXCEPTION_BODY_CAP: usize = 4096;

/// Where `drive_chunked` is within one chunk's `<size>\r\n<data>\r\n` frame.
enum ChunkStep {
    /// Scanning `pending` for the `<hex-size>[;ext]\r\n` line.
    SizeLine,
    /// Consuming chunk data; `remaining` bytes of it are still outstanding.
    Data { remaining: usize },
    /// Consuming the CRLF that follows chunk data; `remaining` of its 2
    /// bytes are still outstanding. `then_done` is set when this trailer
    /// follows the terminal zero-size chunk.
    Trailer { remaining: usize, then_done: bool },
}

enum ReadPhase {
    Head { buf: Vec<u8> },
    FixedContent {
        buf: Vec<u8>,
        consumed: usize,
        status: StatusCode,
        content_type: Option<String>,
    },
    ChunkedContent {
        contiguous: Option<Vec<u8>>,
        chunks: Vec<Bytes>,
        pending: Vec<u8>,
        status: StatusCode,
        content_type: Option<String>,
        step: ChunkStep,
    },
    Done,
}

/// One in-flight request multiplexed onto a Link's FIFO.
pub struct Tag {
    pub id: u64,
    state: RefCell<TagState>,
    phase: RefCell<ReadPhase>,
    promise: RefCell<Option<oneshot::Sender<Result<TagOutcome, BrokerError>>>>,
    pub request: Rc<Request>,
    committed: RefCell<bool>,
    abandoned: RefCell<bool>,
    canceled: RefCell<bool>,
}

impl Tag {
    pub fn new(id: u64, request: Rc<Request>) -> (Rc<Self>, TagPromise) {
        let (tx, rx) = oneshot::channel();
        let tag = Rc::new(Self {
            id,
            state: RefCell::new(TagState::default()),
            phase: RefCell::new(ReadPhase::Head { buf: Vec::new() }),
            promise: RefCell::new(Some(tx)),
            request,
            committed: RefCell::new(false),
            abandoned: RefCell::new(false),
            canceled: RefCell::new(false),
        });
        (tag, rx)
    }

    fn options(&self) -> &RequestOptions {
        &self.request.options
    }

    // -- write-side accessors (spec §4.4) ---------------------------------

    pub fn write_size(&self) -> usize {
        self.request.out.head.len() + self.request.out.content.len()
    }

    pub fn write_completed(&self) -> usize {
        self.state.borrow().written
    }

    pub fn write_remaining(&self) -> usize {
        self.write_size() - self.write_completed()
    }

    /// Borrows the next slice of the outgoing head+content that hasn't
    /// been written yet.
    pub fn make_write_buffer(&self) -> Bytes {
        let written = self.write_completed();
        let head_len = self.request.out.head.len();
        if written < head_len {
            self.request.out.head.slice(written..)
        } else {
            let content_off = written - head_len;
            self.request.out.content.slice(content_off..)
        }
    }

    pub fn wrote_buffer(&self, n: usize) {
        self.state.borrow_mut().written += n;
        if !*self.committed.borrow() {
            *self.committed.borrow_mut() = true;
        }
    }

    // -- read-side accessors -----------------------------------------------

    pub fn read_size(&self) -> usize {
        self.state.borrow().content_length
    }

    pub fn read_completed(&self) -> usize {
        self.state.borrow().content_read
    }

    /// The declared `Content-Length` while mid-read of a non-chunked body,
    /// if the head has been parsed. `None` before the head arrives or once
    /// the body turned out to be chunked (no single known total).
    pub fn known_content_length(&self) -> Option<usize> {
        match &*self.phase.borrow() {
            ReadPhase::FixedContent { .. } => Some(self.state.borrow().content_length),
            _ => None,
        }
    }

    pub fn committed(&self) -> bool {
        *self.committed.borrow()
    }

    pub fn abandoned(&self) -> bool {
        *self.abandoned.borrow()
    }

    pub fn canceled(&self) -> bool {
        *self.canceled.borrow()
    }

    pub fn abandon(&self) {
        *self.abandoned.borrow_mut() = true;
    }

    /// Marks the Tag canceled. Per the resolved design-note (DESIGN.md
    /// Open Question 2), an uncommitted Tag's progress callback is not
    /// invoked on cancellation; `canceled()` is the only observable
    /// signal.
    pub fn cancel(&self) {
        *self.canceled.borrow_mut() = true;
    }

    pub fn is_done(&self) -> bool {
        matches!(&*self.phase.borrow(), ReadPhase::Done)
    }

    /// Feeds newly-received bytes through the head/content parse state
    /// machine. Returns `Ok(true)` once the Tag has reached a terminal
    /// state (its promise has been fulfilled) and `Ok(false)` if more
    /// bytes are still needed. `buf` is the unconsumed remainder handed
    /// back to the Link for the next Tag or the next read.
    pub fn read_buffer<'a>(&self, buf: &'a [u8]) -> Result<(bool, &'a [u8]), BrokerError> {
        let mut rest = buf;
        loop {
            let advance = self.step(rest)?;
            match advance {
                Some(n) => {
                    rest = &rest[n..];
                    if self.is_done() {
                        return Ok((true, rest));
                    }
                    if n == 0 {
                        return Ok((false, rest));
                    }
                },
                None => return Ok((false, rest)),
            }
        }
    }

    /// Runs one step of the state machine against `buf`, returning the
    /// number of bytes of `buf` consumed, or `None` if `buf` is exhausted
    /// without making progress. When a step finishes the Tag mid-`buf`
    /// (the remainder belongs to whatever the Link reads next — the next
    /// Tag's head, on a pipelined connection), the returned count is
    /// strictly less than `buf.len()`.
    fn step(&self, buf: &[u8]) -> Result<Option<usize>, BrokerError> {
        if buf.is_empty() && !self.is_done() {
            return Ok(None);
        }

        let current = std::mem::replace(&mut *self.phase.borrow_mut(), ReadPhase::Done);
        match current {
            ReadPhase::Head { mut buf: head_buf } => {
                head_buf.extend_from_slice(buf);
                let max = self.request.options.content_length_maxalloc;
                if head_buf.len() > max {
                    return Err(BrokerError::Protocol(ProtocolError::HeaderSizeExceeded {
                        limit: max,
                    }));
                }

                match try_parse_response_head(&head_buf)? {
                    None => {
                        *self.phase.borrow_mut() = ReadPhase::Head { buf: head_buf };
                        Ok(Some(buf.len()))
                    },
                    Some((head, head_len)) => {
                        // Bytes of `buf` that landed after the head boundary;
                        // everything before it (including anything from
                        // earlier partial-head calls) was already accounted
                        // for when those calls reported full consumption.
                        let leftover = head_buf.split_off(head_len);

                        self.state.borrow_mut().status = Some(head.status);
                        self.state.borrow_mut().head_read = head_len;

                        if head.chunked {
                            let (outcome, remaining_pending, spillover) =
                                self.drive_chunked(
                                    head.status,
                                    head.content_type.clone(),
                                    if self.options().contiguous_content {
                                        Some(Vec::new())
                                    } else {
                                        None
                                    },
                                    Vec::with_capacity(self.options().chunks_reserve),
                                    leftover,
                                    ChunkStep::SizeLine,
                                )?;
                            match outcome {
                                Some((status, content_type, content)) => {
                                    self.complete(status, content_type, content);
                                    Ok(Some(buf.len() - spillover))
                                },
                                None => {
                                    *self.phase.borrow_mut() = remaining_pending;
                                    Ok(Some(buf.len()))
                                },
                            }
                        } else {
                            let len = head.content_length.unwrap_or(0);
                            self.state.borrow_mut().content_length = len;
                            let mut fixed_buf = Vec::new();
                            let mut consumed = 0usize;
                            let take = self.accumulate_fixed(&mut fixed_buf, &mut consumed, &leftover, len)?;
                            let spillover = leftover.len() - take;
                            if consumed >= len {
                                self.complete(
                                    head.status,
                                    head.content_type.clone(),
                                    TagContent::Fixed(Bytes::from(fixed_buf)),
                                );
                                Ok(Some(buf.len() - spillover))
                            } else {
                                *self.phase.borrow_mut() = ReadPhase::FixedContent {
                                    buf: fixed_buf,
                                    consumed,
                                    status: head.status,
                                    content_type: head.content_type.clone(),
                                };
                                Ok(Some(buf.len()))
                            }
                        }
                    },
                }
            },
            ReadPhase::FixedContent { mut buf: acc, mut consumed, status, content_type } => {
                let len = self.state.borrow().content_length;
                let take = self.accumulate_fixed(&mut acc, &mut consumed, buf, len)?;
                if consumed >= len {
                    self.complete(status, content_type, TagContent::Fixed(Bytes::from(acc)));
                } else {
                    *self.phase.borrow_mut() =
                        ReadPhase::FixedContent { buf: acc, consumed, status, content_type };
                }
                Ok(Some(take))
            },
            ReadPhase::ChunkedContent { contiguous, chunks, mut pending, status, content_type, step } => {
                pending.extend_from_slice(buf);
                let (outcome, remaining_pending, spillover) =
                    self.drive_chunked(status, content_type, contiguous, chunks, pending, step)?;
                match outcome {
                    Some((status, content_type, content)) => {
                        self.complete(status, content_type, content);
                        Ok(Some(buf.len() - spillover))
                    },
                    None => {
                        *self.phase.borrow_mut() = remaining_pending;
                        Ok(Some(buf.len()))
                    },
                }
            },
            ReadPhase::Done => Ok(Some(0)),
        }
    }

    /// Feeds up to `len - *consumed` bytes of `input` into `acc` (subject to
    /// `accept_content_bytes`' truncation/overrun policy) and advances
    /// `*consumed` by the number of *protocol* bytes accounted for, which
    /// may exceed what actually lands in `acc` when truncating — completion
    /// is judged against `consumed`, not `acc.len()`, so a capped buffer
    /// still reaches `Done` instead of waiting forever for bytes that will
    /// never be appended. Returns the number of bytes taken from `input`.
    fn accumulate_fixed(
        &self,
        acc: &mut Vec<u8>,
        consumed: &mut usize,
        input: &[u8],
        len: usize,
    ) -> Result<usize, BrokerError> {
        let need = len - *consumed;
        let take = need.min(input.len());
        // The declared Content-Length is a known total ahead of time, so an
        // overrun here is a buffer-for-this-body problem, not the opaque
        // running cap a chunked body (no known total) hits.
        self.accept_content_bytes(acc, &input[..take], true)?;
        *consumed += take;
        self.state.borrow_mut().content_read = *consumed;
        Ok(take)
    }

    fn accept_content_bytes(
        &self,
        acc: &mut Vec<u8>,
        bytes: &[u8],
        known_total: bool,
    ) -> Result<(), BrokerError> {
        let cap = self.options().content_length_maxalloc;
        if acc.len() + bytes.len() > cap {
            if self.options().truncate_content {
                let room = cap.saturating_sub(acc.len());
                acc.extend_from_slice(&bytes[..room]);
            } else if known_total {
                return Err(BrokerError::Resource(ResourceError::BufferOverrun));
            } else {
                return Err(BrokerError::Resource(ResourceError::AllocCapExceeded { cap }));
            }
        } else {
            acc.extend_from_slice(bytes);
        }
        Ok(())
    }

    /// Drains as many complete chunks as `pending` allows. Returns
    /// `(Some((status, content_type, content)), Done, spillover)` once the
    /// terminal zero-size chunk and its trailing CRLF have been seen, with
    /// `spillover` bytes of `pending` left over (they belong to whatever
    /// comes next on the Link), or `(None, ChunkedContent{..}, 0)` if more
    /// bytes are needed.
    #[allow(clippy::too_many_arguments)]
    fn drive_chunked(
        &self,
        status: StatusCode,
        content_type: Option<String>,
        mut contiguous: Option<Vec<u8>>,
        mut chunks: Vec<Bytes>,
        mut pending: Vec<u8>,
        mut step: ChunkStep,
    ) -> Result<(Option<(StatusCode, Option<String>, TagContent)>, ReadPhase, usize), BrokerError> {
        loop {
            match step {
                ChunkStep::SizeLine => {
                    let Some(line_end) = chunked::find_line_end(&pending) else {
                        return Ok((
                            None,
                            ReadPhase::ChunkedContent {
                                contiguous,
                                chunks,
                                pending,
                                status,
                                content_type,
                                step,
                            },
                            0,
                        ));
                    };
                    let size = chunked::parse_chunk_size_line(&pending[..line_end])?;
                    pending.drain(..line_end);
                    self.state.borrow_mut().chunk_length = Some(size);
                    self.state.borrow_mut().chunk_read = 0;
                    step = if size == 0 {
                        ChunkStep::Trailer { remaining: 2, then_done: true }
                    } else {
                        ChunkStep::Data { remaining: size }
                    };
                },
                ChunkStep::Data { remaining } => {
                    let take = pending.len().min(remaining);
                    let chunk_bytes: Vec<u8> = pending.drain(..take).collect();
                    match &mut contiguous {
                        // No declared total for a chunked body: a cap hit here
                        // is the opaque running allocation cap, not an overrun
                        // of a known-size buffer.
                        Some(acc) => self.accept_content_bytes(acc, &chunk_bytes, false)?,
                        None if !chunk_bytes.is_empty() => chunks.push(Bytes::from(chunk_bytes)),
                        None => {},
                    }
                    self.state.borrow_mut().chunk_read += take;
                    self.state.borrow_mut().content_read += take;
                    let remaining = remaining - take;
                    if remaining > 0 {
                        return Ok((
                            None,
                            ReadPhase::ChunkedContent {
                                contiguous,
                                chunks,
                                pending,
                                status,
                                content_type,
                                step: ChunkStep::Data { remaining },
                            },
                            0,
                        ));
                    }
                    step = ChunkStep::Trailer { remaining: 2, then_done: false };
                },
                ChunkStep::Trailer { remaining, then_done } => {
                    let take = pending.len().min(remaining);
                    pending.drain(..take);
                    let remaining = remaining - take;
                    if remaining > 0 {
                        return Ok((
                            None,
                            ReadPhase::ChunkedContent {
                                contiguous,
                                chunks,
                                pending,
                                status,
                                content_type,
                                step: ChunkStep::Trailer { remaining, then_done },
                            },
                            0,
                        ));
                    }
                    if then_done {
                        let spillover = pending.len();
                        let content = match contiguous.take() {
                            Some(buf) => TagContent::Fixed(Bytes::from(buf)),
                            None => TagContent::Chunks(std::mem::take(&mut chunks)),
                        };
                        return Ok((Some((status, content_type, content)), ReadPhase::Done, spillover));
                    }
                    step = ChunkStep::SizeLine;
                },
            }
        }
    }

    /// Fulfills the promise for a fully-read response: a plain success
    /// unless `http_exceptions` is set and `status` is itself an error
    /// (spec §4.3.2/§7), in which case the promise is rejected with
    /// `BrokerError::Http` carrying the status, content-type, and a
    /// truncated copy of the body instead.
    fn complete(&self, status: StatusCode, content_type: Option<String>, content: TagContent) {
        if self.options().http_exceptions && status.as_u16() >= 300 {
            let body = match &content {
                TagContent::Fixed(b) => b.to_vec(),
                TagContent::Chunks(chunks) => chunks.iter().flat_map(|c| c.to_vec()).collect(),
            };
            self.resolve(Err(BrokerError::Http {
                status,
                content_type,
                body: crate::utils::truncate_for_diagnostics(&body, HTTP_EXCEPTION_BODY_CAP),
            }));
        } else {
            self.resolve(Ok(TagOutcome { status, content }));
        }
    }

    fn resolve(&self, outcome: Result<TagOutcome, BrokerError>) {
        if let Some(tx) = self.promise.borrow_mut().take() {
            let _ = tx.send(outcome);
        }
    }

    /// Fails the Tag out-of-band (link error, timeout, cancellation).
    pub fn fail(&self, err: BrokerError) {
        *self.phase.borrow_mut() = ReadPhase::Done;
        self.resolve(Err(err));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{RequestOptions, build_head};

    fn opts() -> RequestOptions {
        RequestOptions {
            http_exceptions: true,
            content_length_maxalloc: 1024,
            contiguous_content: true,
            chunks_reserve: 4,
            truncate_content: false,
            priority: 0,
        }
    }

    fn make_request() -> Rc<Request> {
        let head = build_head("GET", "/x", "example.org", 0, None, &[]);
        Rc::new(Request::new(head, Bytes::new(), opts()))
    }

    #[test]
    fn fixed_length_body_in_one_shot() {
        let (tag, mut rx) = Tag::new(0, make_request());
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
        let (done, rest) = tag.read_buffer(raw).unwrap();
        assert!(done);
        assert!(rest.is_empty());
        let outcome = rx.try_recv().unwrap().unwrap();
        assert_eq!(outcome.status, StatusCode::OK);
        match outcome.content {
            TagContent::Fixed(b) => assert_eq!(&b[..], b"hello"),
            _ => panic!("expected fixed content"),
        }
    }

    #[test]
    fn fixed_length_body_split_across_reads() {
        let (tag, mut rx) = Tag::new(0, make_request());
        let head = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\n";
        let (done, _) = tag.read_buffer(head).unwrap();
        assert!(!done);
        assert!(rx.try_recv().is_err());

        let (done, rest) = tag.read_buffer(b"hello").unwrap();
        assert!(done);
        assert!(rest.is_empty());
        let outcome = rx.try_recv().unwrap().unwrap();
        match outcome.content {
            TagContent::Fixed(b) => assert_eq!(&b[..], b"hello"),
            _ => panic!("expected fixed content"),
        }
    }

    #[test]
    fn chunked_body_is_reassembled_contiguously() {
        let (tag, mut rx) = Tag::new(0, make_request());
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let (done, rest) = tag.read_buffer(raw).unwrap();
        assert!(done);
        assert!(rest.is_empty());
        let outcome = rx.try_recv().unwrap().unwrap();
        match outcome.content {
            TagContent::Fixed(b) => assert_eq!(&b[..], b"hello world"),
            _ => panic!("expected contiguous content"),
        }
    }

    #[test]
    fn chunked_body_kept_as_separate_chunks_when_not_contiguous() {
        let mut options = opts();
        options.contiguous_content = false;
        let head = build_head("GET", "/x", "example.org", 0, None, &[]);
        let request = Rc::new(Request::new(head, Bytes::new(), options));
        let (tag, mut rx) = Tag::new(0, request);

        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nhi\r\n0\r\n\r\n";
        let (done, _) = tag.read_buffer(raw).unwrap();
        assert!(done);
        let outcome = rx.try_recv().unwrap().unwrap();
        match outcome.content {
            TagContent::Chunks(chunks) => {
                assert_eq!(chunks.len(), 1);
                assert_eq!(&chunks[0][..], b"hi");
            },
            _ => panic!("expected chunk list"),
        }
    }

    #[test]
    fn buffer_overrun_without_truncation_is_an_error() {
        let mut options = opts();
        options.content_length_maxalloc = 4;
        let head = build_head("GET", "/x", "example.org", 0, None, &[]);
        let request = Rc::new(Request::new(head, Bytes::new(), options));
        let (tag, _rx) = Tag::new(0, request);

        // Content-Length is a known total ahead of time, so this is a
        // buffer overrun, not the opaque running cap a chunked body hits.
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nhello world";
        let err = tag.read_buffer(raw).unwrap_err();
        assert!(matches!(err, BrokerError::Resource(ResourceError::BufferOverrun)));
    }

    #[test]
    fn chunked_alloc_cap_exceeded_without_truncation_is_an_error() {
        let mut options = opts();
        options.content_length_maxalloc = 4;
        let head = build_head("GET", "/x", "example.org", 0, None, &[]);
        let request = Rc::new(Request::new(head, Bytes::new(), options));
        let (tag, _rx) = Tag::new(0, request);

        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n";
        let err = tag.read_buffer(raw).unwrap_err();
        assert!(matches!(err, BrokerError::Resource(ResourceError::AllocCapExceeded { .. })));
    }

    #[test]
    fn fixed_length_response_leaves_next_tags_bytes_unconsumed() {
        let (tag, mut rx) = Tag::new(0, make_request());
        let mut raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello".to_vec();
        let next_head = b"HTTP/1.1 204 No Content\r\n\r\n";
        raw.extend_from_slice(next_head);

        let (done, rest) = tag.read_buffer(&raw).unwrap();
        assert!(done);
        assert_eq!(rest, &next_head[..]);
        let outcome = rx.try_recv().unwrap().unwrap();
        match outcome.content {
            TagContent::Fixed(b) => assert_eq!(&b[..], b"hello"),
            _ => panic!("expected fixed content"),
        }
    }

    #[test]
    fn chunked_response_leaves_next_tags_bytes_unconsumed() {
        let (tag, mut rx) = Tag::new(0, make_request());
        let mut raw =
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nhi\r\n0\r\n\r\n".to_vec();
        let next_head = b"HTTP/1.1 204 No Content\r\n\r\n";
        raw.extend_from_slice(next_head);

        let (done, rest) = tag.read_buffer(&raw).unwrap();
        assert!(done);
        assert_eq!(rest, &next_head[..]);
        let outcome = rx.try_recv().unwrap().unwrap();
        match outcome.content {
            TagContent::Fixed(b) => assert_eq!(&b[..], b"hi"),
            _ => panic!("expected fixed content"),
        }
    }

    #[test]
    fn chunked_trailer_split_across_reads_still_finds_next_head() {
        let (tag, mut rx) = Tag::new(0, make_request());
        let head = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nhi\r\n0\r\n";
        let (done, _) = tag.read_buffer(head).unwrap();
        assert!(!done);

        let (done, rest) = tag.read_buffer(b"\r\nGET").unwrap();
        assert!(done);
        assert_eq!(rest, b"GET");
        let outcome = rx.try_recv().unwrap().unwrap();
        match outcome.content {
            TagContent::Fixed(b) => assert_eq!(&b[..], b"hi"),
            _ => panic!("expected fixed content"),
        }
    }

    #[test]
    fn truncate_content_drains_overflow_fixed_length() {
        let mut options = opts();
        options.content_length_maxalloc = 5;
        options.truncate_content = true;
        let head = build_head("GET", "/x", "example.org", 0, None, &[]);
        let request = Rc::new(Request::new(head, Bytes::new(), options));
        let (tag, mut rx) = Tag::new(0, request);

        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 11\r\n\r\nhello world";
        let (done, rest) = tag.read_buffer(raw).unwrap();
        assert!(done);
        assert!(rest.is_empty());
        let outcome = rx.try_recv().unwrap().unwrap();
        match outcome.content {
            TagContent::Fixed(b) => assert_eq!(&b[..], b"hello"),
            _ => panic!("expected truncated fixed content"),
        }
    }

    /// Resolves DESIGN.md Open Question 3: with `contiguous_content` and
    /// `truncate_content` both set, a chunked body is truncated at the
    /// reassembly boundary rather than per-chunk-buffer.
    #[test]
    fn truncate_content_drains_overflow_chunked_contiguous() {
        let mut options = opts();
        options.content_length_maxalloc = 7;
        options.truncate_content = true;
        let head = build_head("GET", "/x", "example.org", 0, None, &[]);
        let request = Rc::new(Request::new(head, Bytes::new(), options));
        let (tag, mut rx) = Tag::new(0, request);

        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let (done, rest) = tag.read_buffer(raw).unwrap();
        assert!(done);
        assert!(rest.is_empty());
        let outcome = rx.try_recv().unwrap().unwrap();
        match outcome.content {
            TagContent::Fixed(b) => assert_eq!(&b[..], b"hello w"),
            _ => panic!("expected truncated contiguous content"),
        }
    }

    #[test]
    fn http_exceptions_rejects_error_status_with_truncated_body() {
        let (tag, mut rx) = Tag::new(0, make_request());
        let raw = b"HTTP/1.1 404 Not Found\r\nContent-Type: text/plain\r\nContent-Length: 9\r\n\r\nnot found";
        let (done, _) = tag.read_buffer(raw).unwrap();
        assert!(done);
        let err = rx.try_recv().unwrap().unwrap_err();
        match err {
            BrokerError::Http { status, content_type, body } => {
                assert_eq!(status, StatusCode::NOT_FOUND);
                assert_eq!(content_type.as_deref(), Some("text/plain"));
                assert_eq!(&body[..], b"not found");
            },
            _ => panic!("expected BrokerError::Http"),
        }
    }

    #[test]
    fn error_status_is_delivered_as_success_when_http_exceptions_disabled() {
        let mut options = opts();
        options.http_exceptions = false;
        let head = build_head("GET", "/x", "example.org", 0, None, &[]);
        let request = Rc::new(Request::new(head, Bytes::new(), options));
        let (tag, mut rx) = Tag::new(0, request);

        let raw = b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 2\r\n\r\nhi";
        let (done, _) = tag.read_buffer(raw).unwrap();
        assert!(done);
        let outcome = rx.try_recv().unwrap().unwrap();
        assert_eq!(outcome.status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn write_buffer_tracks_head_then_content() {
        let head = build_head("POST", "/x", "example.org", 3, None, &[]);
        let request = Rc::new(Request::new(head.clone(), Bytes::from_static(b"abc"), opts()));
        let (tag, _rx) = Tag::new(0, request);
        assert_eq!(tag.make_write_buffer(), head);
        tag.wrote_buffer(head.len());
        assert_eq!(&tag.make_write_buffer()[..], b"abc");
        assert!(tag.committed());
    }
}
