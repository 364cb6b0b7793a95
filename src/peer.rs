// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) Matrix Construct Developers, Authors & Contributors

//! The Peer component (spec §4.5): a logical destination, represented as
//! a set of Links, with link admission/selection, DNS resolution (via the
//! shared [`crate::resolver::Resolver`]), connect-racing, and an
//! error-gate slot. Field shape follows
//! `original_source/include/ircd/server/peer.h` (`peer::err`,
//! `write_bytes`/`read_bytes`, `link_min`/`link_max`), realized
//! single-threaded with `Rc<RefCell<_>>` in place of the original's
//! `std::list<link>` under the single reactor thread.

use std::{cell::RefCell, rc::Rc, time::Duration};

use tokio::{task::JoinHandle, time::Instant};
use tracing::{info, warn};

use crate::{
    cfg::config::Config,
    error::{BrokerError, LogicalError, TransportError},
    ids::IdGen,
    link::Link,
    request::Request,
    resolver::{Resolver, record::ResolvedRecord},
    socket::Socket,
    tag::{Tag, TagPromise},
};

/// Per-Peer knobs distilled from [`Config`] at Peer construction time.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub link_min: usize,
    pub link_max: usize,
    pub tag_max: usize,
    pub tag_commit_max: usize,
    pub error_clear: Duration,
    pub connect_timeout: Duration,
}

impl From<&Config> for PeerConfig {
    fn from(cfg: &Config) -> Self {
        Self {
            link_min: cfg.link_min_default,
            link_max: cfg.link_max_default,
            tag_max: cfg.tag_max_default,
            tag_commit_max: cfg.tag_commit_max_default,
            error_clear: cfg.error_clear_default,
            connect_timeout: cfg.async_timeout,
        }
    }
}

/// One logical federation destination: a growable set of Links opened
/// against its resolved addresses, selected per-submit by §4.5's
/// algorithm.
pub struct Peer {
    pub id: u64,
    pub destination: String,
    resolver: Rc<Resolver>,
    cfg: PeerConfig,
    links: RefCell<Vec<Rc<Link>>>,
    handles: RefCell<Vec<JoinHandle<()>>>,
    link_ids: IdGen,
    tag_ids: IdGen,
    error: RefCell<Option<(BrokerError, Instant)>>,
    write_total_closed: std::cell::Cell<u64>,
    read_total_closed: std::cell::Cell<u64>,
}

impl Peer {
    pub fn new(
        id: u64,
        destination: impl Into<String>,
        resolver: Rc<Resolver>,
        cfg: PeerConfig,
    ) -> Rc<Self> {
        Rc::new(Self {
            id,
            destination: destination.into(),
            resolver,
            cfg,
            links: RefCell::new(Vec::new()),
            handles: RefCell::new(Vec::new()),
            link_ids: IdGen::new(),
            tag_ids: IdGen::new(),
            error: RefCell::new(None),
            write_total_closed: std::cell::Cell::new(0),
            read_total_closed: std::cell::Cell::new(0),
        })
    }

    pub fn link_count(&self) -> usize {
        self.links.borrow().len()
    }

    pub fn tag_count(&self) -> usize {
        self.links.borrow().iter().map(|l| l.queue_len()).sum()
    }

    pub fn write_total(&self) -> u64 {
        self.write_total_closed.get()
            + self.links.borrow().iter().map(|l| l.write_total()).sum::<u64>()
    }

    pub fn read_total(&self) -> u64 {
        self.read_total_closed.get()
            + self.links.borrow().iter().map(|l| l.read_total()).sum::<u64>()
    }

    pub fn err_has(&self) -> bool {
        self.error.borrow().is_some()
    }

    /// Attaches `request` to some Link, selected per §4.5, opening a new
    /// Link or the Peer's initial Link(s) if needed.
    pub async fn submit(self: &Rc<Self>, request: Rc<Request>) -> Result<TagPromise, BrokerError> {
        if let Some(err) = self.gated_error() {
            return Err(err);
        }

        let priority = request.options.priority;
        let tag_id = self.tag_ids.next();
        let (tag, rx) = Tag::new(tag_id, request);

        // Priority i16::MIN requests a dedicated, over-cap Link (spec §6,
        // resolved in DESIGN.md Open Question 4): always opens fresh.
        if priority == i16::MIN {
            return match self.open_link().await {
                Ok(link) => {
                    link.set_excluded(true);
                    link.submit(tag)?;
                    Ok(rx)
                },
                Err(e) => {
                    self.set_error(e.clone());
                    tag.fail(e.clone());
                    Err(e)
                },
            };
        }

        self.dispatch_tag(tag).await?;
        Ok(rx)
    }

    /// Selects or opens a Link for `tag` and queues it there, per §4.5's
    /// algorithm. Shared by [`Self::submit`] (a fresh Tag) and
    /// [`Self::redispatch`] (an uncommitted Tag drained from a failed
    /// Link).
    async fn dispatch_tag(self: &Rc<Self>, tag: Rc<Tag>) -> Result<(), BrokerError> {
        loop {
            if let Some(link) = self.select_link() {
                match link.submit(Rc::clone(&tag)) {
                    Ok(()) => return Ok(()),
                    // Raced with the link filling up or closing between
                    // selection and submit; try again.
                    Err(_) => continue,
                }
            }

            if self.links.borrow().len() < self.cfg.link_max {
                match self.open_link().await {
                    Ok(_) => continue,
                    Err(e) => {
                        self.set_error(e.clone());
                        tag.fail(e.clone());
                        return Err(e);
                    },
                }
            }

            let least_loaded = self
                .links
                .borrow()
                .iter()
                .filter(|l| !l.is_closed() && !l.is_excluded() && l.queue_len() < self.cfg.tag_max)
                .min_by_key(|l| (l.queue_len(), l.id))
                .cloned();
            return match least_loaded {
                Some(link) => {
                    link.submit(tag)?;
                    Ok(())
                },
                None => {
                    let err = BrokerError::Logical(LogicalError::NoCapacity);
                    tag.fail(err.clone());
                    Err(err)
                },
            };
        }
    }

    /// Hands uncommitted Tags drained from a failed Link back into ordinary
    /// selection onto another Link (spec §4.3.3/§7). A Tag that can't find
    /// a home (no capacity, resolution failure) is failed in place by
    /// `dispatch_tag`; the caller already holds no reference to wait on, so
    /// each Tag is redispatched on its own task rather than serialized.
    fn redispatch(self: &Rc<Self>, tags: Vec<Rc<Tag>>) {
        for tag in tags {
            if tag.canceled() {
                tag.fail(BrokerError::Logical(LogicalError::Canceled));
                continue;
            }
            let peer = Rc::clone(self);
            tokio::task::spawn_local(async move {
                let _ = peer.dispatch_tag(tag).await;
            });
        }
    }

    /// Cancels every Tag on every Link of this Peer.
    pub fn cancel(&self) {
        for link in self.links.borrow().iter() {
            link.cancel_all();
        }
    }

    /// Cancels the one Tag carrying `request`, wherever it's queued among
    /// this Peer's Links. Returns whether a match was found.
    pub fn cancel_request(&self, request: &Request) -> bool {
        self.links.borrow().iter().any(|link| link.cancel_request(request))
    }

    /// Tears the Peer down: aborts all Link-driving tasks and fails
    /// whatever Tags were still queued. Idempotent.
    pub fn close(&self) {
        for handle in self.handles.borrow_mut().drain(..) {
            handle.abort();
        }
        for link in self.links.borrow_mut().drain(..) {
            link.finish();
            link.fail_all(BrokerError::Logical(LogicalError::LinkFinished));
        }
    }

    /// Link selection algorithm (spec §4.5): not `exclude`, ready, with
    /// spare capacity, preferring links under `tag_commit_max`, tie-broken
    /// by smallest queue then smallest id.
    fn select_link(&self) -> Option<Rc<Link>> {
        let links = self.links.borrow();
        let mut candidates: Vec<&Rc<Link>> = links
            .iter()
            .filter(|l| !l.is_closed() && !l.is_excluded() && l.queue_len() < self.cfg.tag_max)
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let under_commit: Vec<&Rc<Link>> = candidates
            .iter()
            .copied()
            .filter(|l| l.committed_len() < self.cfg.tag_commit_max)
            .collect();
        if !under_commit.is_empty() {
            candidates = under_commit;
        }

        candidates.into_iter().min_by_key(|l| (l.queue_len(), l.id)).cloned()
    }

    fn gated_error(&self) -> Option<BrokerError> {
        let mut slot = self.error.borrow_mut();
        match slot.as_ref() {
            Some((err, until)) if Instant::now() < *until => Some(err.clone()),
            Some(_) => {
                *slot = None;
                None
            },
            None => None,
        }
    }

    fn set_error(&self, err: BrokerError) {
        warn!(peer = %self.destination, error = %err, "peer entering error-gated state");
        *self.error.borrow_mut() = Some((err, Instant::now() + self.cfg.error_clear));
    }

    /// Resolves the destination, races a connect attempt against each
    /// candidate address, and spawns the winning Link's driving task.
    async fn open_link(self: &Rc<Self>) -> Result<Rc<Link>, BrokerError> {
        let records = self.resolver.resolve(&self.destination).await?;
        let socket = self.connect_race(&records).await?;

        let link_id = self.link_ids.next();
        let link = Link::new(link_id, self.cfg.tag_max, self.cfg.tag_commit_max);
        self.links.borrow_mut().push(Rc::clone(&link));
        info!(peer = %self.destination, link = link_id, "link opened");

        let peer = Rc::clone(self);
        let link_for_task = Rc::clone(&link);
        let handle = tokio::task::spawn_local(async move {
            if let Err((e, pending)) = link_for_task.run(socket).await {
                peer.set_error(e);
                peer.redispatch(pending);
            }
            peer.remove_link(link_for_task.id);
        });
        self.handles.borrow_mut().push(handle);

        Ok(link)
    }

    /// Races a connect attempt against every candidate in parallel; the
    /// first success wins and the rest are dropped (spec §4.5 resolution
    /// pipeline step 3).
    async fn connect_race(&self, records: &[ResolvedRecord]) -> Result<Socket, BrokerError> {
        if records.is_empty() {
            return Err(BrokerError::Transport(TransportError::NxDomain));
        }

        let mut set = tokio::task::JoinSet::new();
        for rec in records.iter().cloned() {
            let timeout = self.cfg.connect_timeout;
            set.spawn_local(async move { Socket::connect_tls(rec.addr, &rec.host, timeout).await });
        }

        let mut last_err = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(socket)) => return Ok(socket),
                Ok(Err(e)) => last_err = Some(e),
                Err(_join_err) => {},
            }
        }
        Err(last_err.unwrap_or(BrokerError::Transport(TransportError::ConnectRefused)))
    }

    fn remove_link(&self, id: u64) {
        let mut links = self.links.borrow_mut();
        if let Some(pos) = links.iter().position(|l| l.id == id) {
            let link = links.remove(pos);
            self.write_total_closed.set(self.write_total_closed.get() + link.write_total());
            self.read_total_closed.set(self.read_total_closed.get() + link.read_total());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn test_cfg() -> PeerConfig {
        PeerConfig {
            link_min: 1,
            link_max: 2,
            tag_max: 4,
            tag_commit_max: 2,
            error_clear: Duration::from_millis(50),
            connect_timeout: Duration::from_millis(500),
        }
    }

    #[test]
    fn select_link_prefers_smallest_queue() {
        let resolver = Rc::new(Resolver::new(Default::default()).unwrap());
        let peer = Peer::new(0, "example.org", resolver, test_cfg());

        let opts = || crate::request::RequestOptions {
            http_exceptions: true,
            content_length_maxalloc: 1024,
            contiguous_content: true,
            chunks_reserve: 4,
            truncate_content: false,
            priority: 0,
        };

        let full = Link::new(0, 4, 2);
        for i in 0..2u64 {
            let head = crate::request::build_head("GET", "/x", "example.org", 0, None, &[]);
            let req = Rc::new(Request::new(head, bytes::Bytes::new(), opts()));
            let (tag, _rx) = Tag::new(i, req);
            full.submit(tag).unwrap();
        }

        let light = Link::new(1, 4, 2);

        *peer.links.borrow_mut() = vec![full, Rc::clone(&light)];
        let selected = peer.select_link().unwrap();
        assert_eq!(selected.id, light.id);
    }

    #[test]
    fn select_link_skips_excluded_links() {
        let resolver = Rc::new(Resolver::new(Default::default()).unwrap());
        let peer = Peer::new(0, "example.org", resolver, test_cfg());

        let dedicated = Link::new(0, 4, 2);
        dedicated.set_excluded(true);
        let ordinary = Link::new(1, 4, 2);

        *peer.links.borrow_mut() = vec![dedicated, Rc::clone(&ordinary)];
        let selected = peer.select_link().unwrap();
        assert_eq!(selected.id, ordinary.id);
    }

    #[tokio::test]
    async fn redispatch_lands_uncommitted_tags_on_another_link() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let resolver = Rc::new(Resolver::new(Default::default()).unwrap());
                let peer = Peer::new(0, "example.org", resolver, test_cfg());

                let spare = Link::new(0, 4, 2);
                *peer.links.borrow_mut() = vec![Rc::clone(&spare)];

                let opts = crate::request::RequestOptions {
                    http_exceptions: true,
                    content_length_maxalloc: 1024,
                    contiguous_content: true,
                    chunks_reserve: 4,
                    truncate_content: false,
                    priority: 0,
                };
                let head = crate::request::build_head("GET", "/x", "example.org", 0, None, &[]);
                let req = Rc::new(Request::new(head, bytes::Bytes::new(), opts));
                let (tag, _rx) = Tag::new(0, req);

                peer.redispatch(vec![tag]);
                // Drive the spawned redispatch task to completion.
                for _ in 0..8 {
                    tokio::task::yield_now().await;
                }

                assert_eq!(spare.queue_len(), 1);
            })
            .await;
    }

    #[test]
    fn cancel_request_cancels_only_the_matching_tag() {
        let resolver = Rc::new(Resolver::new(Default::default()).unwrap());
        let peer = Peer::new(0, "example.org", resolver, test_cfg());

        let opts = || crate::request::RequestOptions {
            http_exceptions: true,
            content_length_maxalloc: 1024,
            contiguous_content: true,
            chunks_reserve: 4,
            truncate_content: false,
            priority: 0,
        };
        let head_a = crate::request::build_head("GET", "/a", "example.org", 0, None, &[]);
        let head_b = crate::request::build_head("GET", "/b", "example.org", 0, None, &[]);
        let req_a = Rc::new(Request::new(head_a, bytes::Bytes::new(), opts()));
        let req_b = Rc::new(Request::new(head_b, bytes::Bytes::new(), opts()));
        let (tag_a, _rx_a) = Tag::new(0, Rc::clone(&req_a));
        let (tag_b, _rx_b) = Tag::new(1, Rc::clone(&req_b));

        let link = Link::new(0, 4, 2);
        link.submit(Rc::clone(&tag_a)).unwrap();
        link.submit(Rc::clone(&tag_b)).unwrap();
        *peer.links.borrow_mut() = vec![link];

        assert!(peer.cancel_request(&req_a));
        assert!(tag_a.canceled());
        assert!(!tag_b.canceled());

        // Idempotent: the Tag is still queued (cancel doesn't dequeue it),
        // so a second cancel finds it again rather than erroring.
        assert!(peer.cancel_request(&req_a));
    }

    #[test]
    fn error_gate_clears_after_cooldown() {
        let resolver = Rc::new(Resolver::new(Default::default()).unwrap());
        let peer = Peer::new(0, "example.org", resolver, test_cfg());
        assert!(peer.gated_error().is_none());

        peer.set_error(BrokerError::Transport(TransportError::NxDomain));
        assert!(peer.gated_error().is_some());
    }
}
