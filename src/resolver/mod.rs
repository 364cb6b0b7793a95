// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) Matrix Construct Developers, Authors & Contributors

//! DNS resolution component (spec §4.2): SRV lookup with AAAA/A fallback,
//! TTL-cached, single-flight per destination. Built on `hickory-resolver`,
//! the crate `denoland-deno`'s dependency table uses for the same concern.

pub mod cache;
pub mod record;

use std::{net::SocketAddr, time::Duration};

use hickory_resolver::{
    Resolver as HickoryResolver,
    config::{ResolverConfig as HickoryConfig, ResolverOpts},
    name_server::TokioConnectionProvider,
};
use rand::Rng;

use crate::{
    cfg::config::ResolverConfig,
    error::{BrokerError, TransportError},
    resolver::{cache::ResolverCache, record::ResolvedRecord},
};

const DEFAULT_PORT: u16 = 8448;

/// Resolves federation destinations to a weighted, priority-ordered list
/// of candidate addresses, caching results by destination name.
pub struct Resolver {
    inner: HickoryResolver<TokioConnectionProvider>,
    cache: ResolverCache,
    cfg: ResolverConfig,
}

impl Resolver {
    pub fn new(cfg: ResolverConfig) -> Result<Self, BrokerError> {
        let builder = HickoryResolver::builder_with_config(
            HickoryConfig::default(),
            TokioConnectionProvider::default(),
        );
        let inner = builder.with_options(ResolverOpts::default()).build();
        Ok(Self {
            inner,
            cache: ResolverCache::new(),
            cfg,
        })
    }

    /// Resolves `destination` (a Matrix server name, e.g. `matrix.org` or
    /// `matrix.org:8448`) into candidate addresses: explicit port skips SRV
    /// entirely (spec §4.2, "explicit port disables SRV"), otherwise a
    /// `_matrix-fed._tcp` SRV lookup is attempted first and AAAA/A of the
    /// bare name is the fallback when no SRV record exists.
    pub async fn resolve(
        &self,
        destination: &str,
    ) -> Result<std::rc::Rc<Vec<ResolvedRecord>>, BrokerError> {
        let min_ttl = Duration::from_secs(self.cfg.min_ttl_secs);

        if let Some((host, port)) = split_explicit_port(destination) {
            return self
                .cache
                .get_or_resolve(destination, min_ttl, || async move {
                    self.resolve_host(host, port).await
                })
                .await;
        }

        self.cache
            .get_or_resolve(destination, min_ttl, || async move {
                self.resolve_with_srv(destination).await
            })
            .await
    }

    async fn resolve_with_srv(
        &self,
        destination: &str,
    ) -> Result<(Vec<ResolvedRecord>, Duration), BrokerError> {
        let srv_name = format!("_matrix-fed._tcp.{destination}.");
        match self.srv_lookup_with_retry(&srv_name).await {
            Ok(srv) => {
                let mut out = Vec::new();
                let mut min_ttl = u32::MAX;
                for r in srv.iter() {
                    min_ttl = min_ttl.min(r.ttl());
                    let target = r.target().to_utf8();
                    let target = target.trim_end_matches('.');
                    let (records, _) = self.resolve_host(target, r.port()).await?;
                    for mut rec in records {
                        rec.priority = r.priority();
                        rec.weight = r.weight();
                        out.push(rec);
                    }
                }
                weighted_shuffle_same_priority(&mut out);
                let ttl = if min_ttl == u32::MAX { 60 } else { min_ttl as u64 };
                Ok((out, Duration::from_secs(ttl)))
            },
            Err(_) => self.resolve_host(destination, DEFAULT_PORT).await,
        }
    }

    async fn resolve_host(
        &self,
        host: &str,
        port: u16,
    ) -> Result<(Vec<ResolvedRecord>, Duration), BrokerError> {
        let lookup = self.lookup_ip_with_retry(host).await?;

        let mut records: Vec<ResolvedRecord> = lookup
            .iter()
            .map(|ip| ResolvedRecord {
                addr: SocketAddr::new(ip, port),
                host: host.to_owned(),
                priority: 0,
                weight: 0,
                ttl_secs: self.cfg.min_ttl_secs,
            })
            .collect();

        if !self.cfg_enable_ipv6() {
            records.retain(|r| r.addr.is_ipv4());
        }

        if records.is_empty() {
            return Err(BrokerError::Transport(TransportError::NxDomain));
        }

        Ok((records, Duration::from_secs(self.cfg.min_ttl_secs)))
    }

    fn cfg_enable_ipv6(&self) -> bool {
        self.cfg.enable_ipv6
    }

    /// Runs `self.inner.lookup_ip(host)`, retrying up to `cfg.retries` times
    /// with exponential backoff when an attempt exceeds `cfg.lookup_timeout`
    /// (spec §4.2 failure semantics: "timeout → retry up to N times with
    /// exponential backoff"). NXDOMAIN and other resolve errors are fatal
    /// and returned immediately without retry.
    async fn lookup_ip_with_retry(
        &self,
        host: &str,
    ) -> Result<hickory_resolver::lookup_ip::LookupIp, BrokerError> {
        let mut attempt = 0;
        loop {
            match tokio::time::timeout(self.cfg.lookup_timeout, self.inner.lookup_ip(host)).await {
                Ok(Ok(lookup)) => return Ok(lookup),
                Ok(Err(e)) => {
                    return Err(if e.is_no_records_found() {
                        BrokerError::Transport(TransportError::NxDomain)
                    } else {
                        BrokerError::Transport(TransportError::ResolveError(e.to_string()))
                    });
                },
                Err(_elapsed) if attempt < self.cfg.retries => {
                    tokio::time::sleep(crate::utils::exponential_backoff(
                        self.cfg.backoff_initial,
                        attempt,
                    ))
                    .await;
                    attempt += 1;
                },
                Err(_elapsed) => return Err(BrokerError::Transport(TransportError::Timeout)),
            }
        }
    }

    /// Same retry/backoff policy as [`Self::lookup_ip_with_retry`], applied
    /// to the SRV lookup.
    async fn srv_lookup_with_retry(
        &self,
        srv_name: &str,
    ) -> Result<hickory_resolver::lookup::SrvLookup, BrokerError> {
        let mut attempt = 0;
        loop {
            match tokio::time::timeout(self.cfg.lookup_timeout, self.inner.srv_lookup(srv_name))
                .await
            {
                Ok(Ok(srv)) => return Ok(srv),
                Ok(Err(e)) => {
                    return Err(if e.is_no_records_found() {
                        BrokerError::Transport(TransportError::NxDomain)
                    } else {
                        BrokerError::Transport(TransportError::ResolveError(e.to_string()))
                    });
                },
                Err(_elapsed) if attempt < self.cfg.retries => {
                    tokio::time::sleep(crate::utils::exponential_backoff(
                        self.cfg.backoff_initial,
                        attempt,
                    ))
                    .await;
                    attempt += 1;
                },
                Err(_elapsed) => return Err(BrokerError::Transport(TransportError::Timeout)),
            }
        }
    }
}

fn split_explicit_port(destination: &str) -> Option<(&str, u16)> {
    let (host, port) = destination.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    Some((host, port))
}

/// Orders candidates by ascending priority; within equal priority, performs
/// an RFC 2782 weighted-random shuffle (resolved Open Question: SRV weight
/// tie-breaking).
fn weighted_shuffle_same_priority(records: &mut [ResolvedRecord]) {
    records.sort_by_key(|r| r.priority);
    let mut start = 0;
    while start < records.len() {
        let end = records[start..]
            .iter()
            .position(|r| r.priority != records[start].priority)
            .map(|i| start + i)
            .unwrap_or(records.len());
        weighted_shuffle_range(&mut records[start..end]);
        start = end;
    }
}

fn weighted_shuffle_range(group: &mut [ResolvedRecord]) {
    let mut rng = rand::rng();
    for i in 0..group.len() {
        let total: u32 = group[i..].iter().map(|r| r.weight as u32 + 1).sum();
        let mut pick = rng.random_range(0..total);
        let mut chosen = i;
        for (j, r) in group[i..].iter().enumerate() {
            let w = r.weight as u32 + 1;
            if pick < w {
                chosen = i + j;
                break;
            }
            pick -= w;
        }
        group.swap(i, chosen);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_port_is_split_out() {
        assert_eq!(split_explicit_port("matrix.org:8448"), Some(("matrix.org", 8448)));
        assert_eq!(split_explicit_port("matrix.org"), None);
    }

    #[test]
    fn weighted_shuffle_preserves_priority_order() {
        let mut records = vec![
            ResolvedRecord {
                addr: SocketAddr::from(([127, 0, 0, 1], 1)),
                host: "a".into(),
                priority: 1,
                weight: 0,
                ttl_secs: 60,
            },
            ResolvedRecord {
                addr: SocketAddr::from(([127, 0, 0, 1], 2)),
                host: "b".into(),
                priority: 0,
                weight: 0,
                ttl_secs: 60,
            },
        ];
        weighted_shuffle_same_priority(&mut records);
        assert_eq!(records[0].priority, 0);
        assert_eq!(records[1].priority, 1);
    }
}
