// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) Matrix Construct Developers, Authors & Contributors

//! The Link component (spec §4.3): one TCP/TLS connection to a Peer,
//! carrying a FIFO of Tags pipelined onto it. A Link owns exactly one
//! [`crate::socket::Socket`] and drives it with two concurrent loops, the
//! way `original_source/include/ircd/server/link.h` describes a link's
//! queue of tags driven independently on its write and read sides.
//!
//! Admission is bounded by `tag_max` (total queued, committed or not) and
//! `tag_commit_max` (how many may be simultaneously in flight awaiting a
//! response) — the same two-tier bound the teacher's `Pool` applies to
//! concurrent sessions in `client/pool_sessions.rs`.

pub mod states;

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    rc::Rc,
};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite},
    sync::Notify,
};
use tracing::{debug, warn};

use crate::{
    error::{BrokerError, LogicalError, ProtocolError, TransportError},
    link::states::{WriteCtx, WriteState},
    state_machine::drive,
    tag::Tag,
};

const READ_SCRATCH_SIZE: usize = 64 * 1024;

/// A single connection to a Peer, pipelining a FIFO of Tags onto one
/// socket. Generic over the byte stream so tests can drive it against
/// [`crate::socket::MockSocket`] instead of a real `Socket`.
pub struct Link {
    pub id: u64,
    pending: RefCell<VecDeque<Rc<Tag>>>,
    inflight: RefCell<VecDeque<Rc<Tag>>>,
    tag_max: usize,
    tag_commit_max: usize,
    closed: Cell<bool>,
    /// Set for a dedicated, over-cap Link opened under priority
    /// `i16::MIN` (spec §3 Link `exclude` state, §4.5 selection step 1:
    /// "not `exclude`"). An excluded Link is never handed out by ordinary
    /// selection; it only ever carries the one Tag it was opened for.
    exclude: Cell<bool>,
    activity: Notify,
    write_total: Cell<u64>,
    read_total: Cell<u64>,
}

impl Link {
    pub fn new(id: u64, tag_max: usize, tag_commit_max: usize) -> Rc<Self> {
        Rc::new(Self {
            id,
            pending: RefCell::new(VecDeque::new()),
            inflight: RefCell::new(VecDeque::new()),
            tag_max,
            tag_commit_max,
            closed: Cell::new(false),
            exclude: Cell::new(false),
            activity: Notify::new(),
            write_total: Cell::new(0),
            read_total: Cell::new(0),
        })
    }

    pub fn is_excluded(&self) -> bool {
        self.exclude.get()
    }

    pub fn set_excluded(&self, excluded: bool) {
        self.exclude.set(excluded);
    }

    pub fn queue_len(&self) -> usize {
        self.pending.borrow().len() + self.inflight.borrow().len()
    }

    pub fn committed_len(&self) -> usize {
        self.inflight.borrow().len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    /// Lifetime bytes written/read on this Link (spec §4.5 `write_total`/
    /// `read_total`, aggregated by the owning Peer across all its Links).
    pub fn write_total(&self) -> u64 {
        self.write_total.get()
    }

    pub fn read_total(&self) -> u64 {
        self.read_total.get()
    }

    /// Marks every queued Tag canceled without removing committed ones;
    /// an uncommitted Tag is erased the next time `admit_pending` sees it,
    /// a committed one keeps draining so the Link can keep pipelining
    /// (spec §4.4: "a canceled committed Tag must still be read to
    /// completion").
    pub fn cancel_all(&self) {
        for tag in self.pending.borrow().iter() {
            tag.cancel();
        }
        for tag in self.inflight.borrow().iter() {
            tag.cancel();
        }
    }

    /// Cancels the one Tag carrying `request`, if it is queued here
    /// (§4.6's per-request `cancel`, distinct from [`Self::cancel_all`]'s
    /// bulk cancel). Returns whether a match was found.
    pub fn cancel_request(&self, request: &crate::request::Request) -> bool {
        let ptr = request as *const crate::request::Request;
        for tag in self.pending.borrow().iter() {
            if Rc::as_ptr(&tag.request) == ptr {
                tag.cancel();
                return true;
            }
        }
        for tag in self.inflight.borrow().iter() {
            if Rc::as_ptr(&tag.request) == ptr {
                tag.cancel();
                return true;
            }
        }
        false
    }

    /// Whether another Tag can be queued here without exceeding `tag_max`.
    pub fn can_admit(&self) -> bool {
        !self.closed.get() && self.queue_len() < self.tag_max
    }

    /// Queues `tag` for writing. Rejected once the Link is closed or full.
    pub fn submit(&self, tag: Rc<Tag>) -> Result<(), BrokerError> {
        if self.closed.get() {
            return Err(BrokerError::Logical(LogicalError::LinkFinished));
        }
        if !self.can_admit() {
            return Err(BrokerError::Logical(LogicalError::NoCapacity));
        }
        self.pending.borrow_mut().push_back(tag);
        self.activity.notify_one();
        Ok(())
    }

    /// Marks the Link as accepting no further submits. Tags already queued
    /// still drain through `run`.
    pub fn finish(&self) {
        self.closed.set(true);
        self.activity.notify_one();
    }

    /// Fails every queued Tag (pending and in flight) with `err` and empties
    /// both queues. Used only on hard teardown ([`Peer::close`]), where
    /// there is no other Link left to redispatch onto.
    pub fn fail_all(&self, err: BrokerError) {
        for tag in self.inflight.borrow_mut().drain(..) {
            tag.fail(err.clone());
        }
        for tag in self.pending.borrow_mut().drain(..) {
            tag.fail(err.clone());
        }
    }

    /// Fails every committed (in-flight) Tag with `err` and empties that
    /// queue. Used on a transport failure, where uncommitted Tags are
    /// handed back for redispatch instead (spec §4.3.3/§7: only a Tag
    /// whose request was already sent has no safe way to replay it
    /// elsewhere).
    fn fail_committed(&self, err: BrokerError) {
        for tag in self.inflight.borrow_mut().drain(..) {
            tag.fail(err.clone());
        }
    }

    /// Drains every uncommitted Tag without failing it, for the caller to
    /// redispatch onto a different Link.
    fn drain_pending(&self) -> Vec<Rc<Tag>> {
        self.pending.borrow_mut().drain(..).collect()
    }

    /// Drives `socket` until the Link closes and drains, or a transport
    /// error occurs. On error, committed Tags are failed in place and
    /// uncommitted ones are returned alongside the error for the caller to
    /// redispatch (spec §4.3.3/§7).
    pub async fn run<S>(&self, socket: S) -> Result<(), (BrokerError, Vec<Rc<Tag>>)>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut read_half, mut write_half) = tokio::io::split(socket);
        let result = tokio::try_join!(
            self.write_loop(&mut write_half),
            self.read_loop(&mut read_half),
        );
        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(link = self.id, error = %e, "link failed, failing committed tags");
                self.fail_committed(e.clone());
                let pending = self.drain_pending();
                Err((e, pending))
            },
        }
    }

    fn admit_pending(&self) {
        let mut admitted_any = false;
        {
            let mut pending = self.pending.borrow_mut();
            let mut inflight = self.inflight.borrow_mut();
            while inflight.len() < self.tag_commit_max {
                let Some(tag) = pending.pop_front() else { break };
                if tag.canceled() {
                    tag.fail(BrokerError::Logical(LogicalError::Canceled));
                    continue;
                }
                inflight.push_back(tag);
                admitted_any = true;
            }
        }
        // Wakes the read loop too: a freshly-admitted tag may now be the
        // front of `inflight` with nothing else to prompt it to look.
        if admitted_any {
            self.activity.notify_one();
        }
    }

    fn next_writable(&self) -> Option<Rc<Tag>> {
        self.inflight
            .borrow()
            .iter()
            .find(|t| t.write_remaining() > 0)
            .cloned()
    }

    fn fully_drained(&self) -> bool {
        self.pending.borrow().is_empty()
            && self.inflight.borrow().iter().all(|t| t.is_done())
    }

    async fn write_loop<W>(&self, writer: &mut W) -> Result<(), BrokerError>
    where
        W: AsyncWrite + Unpin,
    {
        loop {
            self.admit_pending();

            let Some(tag) = self.next_writable() else {
                if self.closed.get() && self.pending.borrow().is_empty() {
                    return Ok(());
                }
                // No `!self.closed.get()` guard here: once closed, we may
                // still be waiting on `tag_commit_max` headroom to free up
                // (a pending tag can't be admitted until an inflight one
                // finishes), and that wait must still yield via `notified`
                // rather than spin — `admit_pending`/the read loop wake us.
                let notified = self.activity.notified();
                if self.next_writable().is_none() {
                    notified.await;
                }
                continue;
            };

            let mut ctx = WriteCtx { writer, tag: tag.as_ref() };
            let written = drive(WriteState::initial(&tag), &mut ctx, |_r| async {}).await?;
            self.write_total.set(self.write_total.get() + written as u64);
        }
    }

    async fn read_loop<R>(&self, reader: &mut R) -> Result<(), BrokerError>
    where
        R: AsyncRead + Unpin,
    {
        let mut carry: Vec<u8> = Vec::new();
        let mut scratch = vec![0u8; READ_SCRATCH_SIZE];

        loop {
            while !carry.is_empty() {
                let Some(tag) = self.inflight.borrow().front().cloned() else { break };
                let (done, rest) = match tag.read_buffer(&carry) {
                    Ok(r) => r,
                    Err(e) => {
                        tag.fail(e.clone());
                        return Err(e);
                    },
                };
                let consumed = carry.len() - rest.len();
                if done {
                    self.inflight.borrow_mut().pop_front();
                    self.activity.notify_one();
                }
                if consumed == 0 {
                    break;
                }
                carry.drain(..consumed);
            }

            if carry.is_empty() && self.inflight.borrow().is_empty() {
                if self.closed.get() && self.fully_drained() {
                    return Ok(());
                }
                let notified = self.activity.notified();
                if self.inflight.borrow().is_empty() {
                    notified.await;
                }
                continue;
            }

            let n = reader
                .read(&mut scratch)
                .await
                .map_err(|e| BrokerError::Transport(TransportError::Io(e.to_string())))?;
            if n == 0 {
                // A known-length body cut short by EOF is distinguishable
                // from a bare mid-message EOF (spec §7): the former names
                // exactly how much was promised versus delivered.
                let err = match self.inflight.borrow().front() {
                    Some(tag) => match tag.known_content_length() {
                        Some(expected) if tag.read_completed() < expected => {
                            BrokerError::Protocol(ProtocolError::ContentLengthMismatch {
                                expected,
                                got: tag.read_completed(),
                            })
                        },
                        _ => BrokerError::Transport(TransportError::EofMidMessage),
                    },
                    None => BrokerError::Transport(TransportError::EofMidMessage),
                };
                if let Some(tag) = self.inflight.borrow().front() {
                    tag.fail(err.clone());
                }
                return Err(err);
            }
            debug!(link = self.id, bytes = n, "link read");
            self.read_total.set(self.read_total.get() + n as u64);
            carry.extend_from_slice(&scratch[..n]);
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::{
        request::{Request, RequestOptions, build_head},
        socket::MockSocket,
        tag::TagContent,
    };

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

    fn get_request(path: &str) -> Rc<Request> {
        let head = build_head("GET", path, "example.org", 0, None, &[]);
        Rc::new(Request::new(head, Bytes::new(), opts()))
    }

    #[tokio::test]
    async fn single_request_round_trips() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (client, mut server) = MockSocket::pair(4096);
                let link = Link::new(0, 8, 4);
                let (tag, rx) = Tag::new(0, get_request("/x"));
                link.submit(tag).unwrap();

                let link_for_server = Rc::clone(&link);
                let server_task = tokio::task::spawn_local(async move {
                    use tokio::io::{AsyncReadExt, AsyncWriteExt};
                    let mut buf = vec![0u8; 4096];
                    let n = server.read(&mut buf).await.unwrap();
                    assert!(n > 0);
                    server
                        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                        .await
                        .unwrap();
                    link_for_server.finish();
                });

                link.run(client).await.unwrap();
                server_task.await.unwrap();

                let outcome = rx.await.unwrap().unwrap();
                match outcome.content {
                    TagContent::Fixed(b) => assert_eq!(&b[..], b"ok"),
                    _ => panic!("expected fixed content"),
                }
            })
            .await;
    }

    #[tokio::test]
    async fn pipelined_requests_are_matched_in_order() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (client, mut server) = MockSocket::pair(8192);
                let link = Link::new(0, 8, 4);
                let (tag_a, rx_a) = Tag::new(0, get_request("/a"));
                let (tag_b, rx_b) = Tag::new(1, get_request("/b"));
                link.submit(tag_a).unwrap();
                link.submit(tag_b).unwrap();

                let link_for_server = Rc::clone(&link);
                let server_task = tokio::task::spawn_local(async move {
                    use tokio::io::{AsyncReadExt, AsyncWriteExt};
                    let mut buf = vec![0u8; 8192];
                    let _ = server.read(&mut buf).await.unwrap();
                    server
                        .write_all(
                            b"HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\nA\
HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\nB",
                        )
                        .await
                        .unwrap();
                    link_for_server.finish();
                });

                link.run(client).await.unwrap();
                server_task.await.unwrap();

                let outcome_a = rx_a.await.unwrap().unwrap();
                let outcome_b = rx_b.await.unwrap().unwrap();
                match (outcome_a.content, outcome_b.content) {
                    (TagContent::Fixed(a), TagContent::Fixed(b)) => {
                        assert_eq!(&a[..], b"A");
                        assert_eq!(&b[..], b"B");
                    },
                    _ => panic!("expected fixed content"),
                }
            })
            .await;
    }

    #[tokio::test]
    async fn eof_short_of_declared_length_is_a_content_length_mismatch() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (client, mut server) = MockSocket::pair(4096);
                let link = Link::new(0, 8, 4);
                let (tag, rx) = Tag::new(0, get_request("/x"));
                link.submit(tag).unwrap();

                let server_task = tokio::task::spawn_local(async move {
                    use tokio::io::{AsyncReadExt, AsyncWriteExt};
                    let mut buf = vec![0u8; 4096];
                    let _ = server.read(&mut buf).await.unwrap();
                    server
                        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nab")
                        .await
                        .unwrap();
                    drop(server);
                });

                let result = link.run(client).await;
                server_task.await.unwrap();

                match result {
                    Err((BrokerError::Protocol(ProtocolError::ContentLengthMismatch {
                        expected,
                        got,
                    }), _pending)) => {
                        assert_eq!(expected, 10);
                        assert_eq!(got, 2);
                    },
                    other => panic!("expected ContentLengthMismatch, got {other:?}"),
                }
                match rx.await.unwrap() {
                    Err(BrokerError::Protocol(ProtocolError::ContentLengthMismatch { .. })) => {},
                    other => panic!("expected tag to fail with ContentLengthMismatch, got {other:?}"),
                }
            })
            .await;
    }
}
