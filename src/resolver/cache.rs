// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) Matrix Construct Developers, Authors & Contributors

//! TTL-memoized resolution cache with in-flight request dedup, the same
//! "don't resolve the same key twice concurrently" shape as the teacher's
//! `Pool` session registry (`src/client/pool_sessions.rs`), realized here
//! single-threaded with `Rc<RefCell<_>>` instead of `DashMap`.

use std::{cell::RefCell, collections::HashMap, rc::Rc, time::Duration};

use tokio::{sync::Notify, time::Instant};

use crate::{error::BrokerError, resolver::record::ResolvedRecord};

enum Slot {
    Ready {
        records: Rc<Vec<ResolvedRecord>>,
        expires_at: Instant,
    },
    InFlight {
        notify: Rc<Notify>,
    },
}

#[derive(Default)]
pub struct ResolverCache {
    entries: RefCell<HashMap<String, Slot>>,
}

impl ResolverCache {
    pub fn new() -> Self {
        Self {
            entries: RefCell::new(HashMap::new()),
        }
    }

    /// Returns cached records for `key` if present and unexpired, resolving
    /// via `resolve` otherwise. Concurrent callers for the same `key` while
    /// a resolution is in flight wait on it rather than issuing their own
    /// lookup.
    pub async fn get_or_resolve<F, Fut>(
        &self,
        key: &str,
        min_ttl: Duration,
        resolve: F,
    ) -> Result<Rc<Vec<ResolvedRecord>>, BrokerError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<(Vec<ResolvedRecord>, Duration), BrokerError>>,
    {
        loop {
            let wait_on = {
                let mut entries = self.entries.borrow_mut();
                match entries.get(key) {
                    Some(Slot::Ready { records, expires_at }) if *expires_at > Instant::now() => {
                        return Ok(Rc::clone(records));
                    },
                    Some(Slot::InFlight { notify }) => Some(Rc::clone(notify)),
                    _ => {
                        entries.insert(
                            key.to_owned(),
                            Slot::InFlight {
                                notify: Rc::new(Notify::new()),
                            },
                        );
                        None
                    },
                }
            };

            let Some(notify) = wait_on else {
                break;
            };
            notify.notified().await;
        }

        let result = resolve().await;
        let notify = match self.entries.borrow().get(key) {
            Some(Slot::InFlight { notify }) => Rc::clone(notify),
            _ => Rc::new(Notify::new()),
        };

        match result {
            Ok((records, ttl)) => {
                let ttl = ttl.max(min_ttl);
                let records = Rc::new(records);
                self.entries.borrow_mut().insert(
                    key.to_owned(),
                    Slot::Ready {
                        records: Rc::clone(&records),
                        expires_at: Instant::now() + ttl,
                    },
                );
                notify.notify_waiters();
                Ok(records)
            },
            Err(e) => {
                self.entries.borrow_mut().remove(key);
                notify.notify_waiters();
                Err(e)
            },
        }
    }

    pub fn invalidate(&self, key: &str) {
        self.entries.borrow_mut().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, rc::Rc as StdRc};

    use super::*;

    fn rec(port: u16) -> ResolvedRecord {
        ResolvedRecord {
            addr: SocketAddr::from(([127, 0, 0, 1], port)),
            host: "example.org".into(),
            priority: 0,
            weight: 0,
            ttl_secs: 60,
        }
    }

    #[tokio::test]
    async fn caches_across_calls_within_ttl() {
        let cache = ResolverCache::new();
        let calls = StdRc::new(RefCell::new(0));
        for _ in 0..3 {
            let calls = StdRc::clone(&calls);
            cache
                .get_or_resolve("example.org", Duration::from_secs(1), || async move {
                    *calls.borrow_mut() += 1;
                    Ok((vec![rec(8448)], Duration::from_secs(60)))
                })
                .await
                .unwrap();
        }
        assert_eq!(*calls.borrow(), 1);
    }

    #[tokio::test]
    async fn dedups_concurrent_in_flight_resolution() {
        use std::cell::Cell;
        let cache = Rc::new(ResolverCache::new());
        let calls = Rc::new(Cell::new(0));

        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let c1 = Rc::clone(&cache);
                let calls1 = Rc::clone(&calls);
                let t1 = tokio::task::spawn_local(async move {
                    c1.get_or_resolve("example.org", Duration::from_secs(1), || async move {
                        calls1.set(calls1.get() + 1);
                        tokio::task::yield_now().await;
                        Ok((vec![rec(1)], Duration::from_secs(60)))
                    })
                    .await
                });
                let c2 = Rc::clone(&cache);
                let t2 = tokio::task::spawn_local(async move {
                    c2.get_or_resolve("example.org", Duration::from_secs(1), || async {
                        unreachable!("second caller must not resolve independently")
                    })
                    .await
                });
                let (r1, r2) = tokio::join!(t1, t2);
                r1.unwrap().unwrap();
                r2.unwrap().unwrap();
            })
            .await;

        assert_eq!(calls.get(), 1);
    }
}
