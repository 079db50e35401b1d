//! Cached MX resolution with implicit-MX fallback.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use dashmap::DashMap;
use mail_auth::common::cache::NoCache;
use mail_auth::{IpLookupStrategy, MessageAuthenticator, MX};

const CACHE_TTL: Duration = Duration::from_secs(5 * 60);
const MAX_ADDRS_PER_HOST: usize = 8;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MxRecord {
    pub host: String,
    pub preference: u16,
}

#[derive(Clone, Debug)]
pub struct ResolvedHost {
    pub host: String,
    /// IPv4 first, then IPv6.
    pub addrs: Vec<IpAddr>,
}

pub struct MxResolver {
    resolver: MessageAuthenticator,
    cache: DashMap<String, (Instant, Arc<Vec<MxRecord>>)>,
}

impl MxResolver {
    pub fn new() -> Result<Self> {
        let resolver = MessageAuthenticator::new_system_conf()
            .context("building DNS resolver from system configuration")?;
        Ok(Self {
            resolver,
            cache: DashMap::new(),
        })
    }

    /// MX records sorted ascending by preference. A domain with no MX
    /// gets the implicit record pointing at itself (RFC 5321 §5.1).
    pub async fn lookup(&self, domain: &str) -> Result<Arc<Vec<MxRecord>>> {
        let domain = domain.to_lowercase();
        if let Some(entry) = self.cache.get(&domain) {
            let (stored_at, records) = entry.value();
            if stored_at.elapsed() < CACHE_TTL {
                return Ok(records.clone());
            }
        }

        let records = match self
            .resolver
            .mx_lookup(&domain, None::<&NoCache<String, Arc<Vec<MX>>>>)
            .await
        {
            Ok(mx) => order_records(&mx),
            Err(mail_auth::Error::DnsRecordNotFound(_)) => Vec::new(),
            Err(e) => return Err(anyhow::anyhow!("MX lookup for {} failed: {}", domain, e)),
        };
        let records = if records.is_empty() {
            vec![MxRecord {
                host: domain.clone(),
                preference: 0,
            }]
        } else {
            records
        };

        let records = Arc::new(records);
        self.cache
            .insert(domain, (Instant::now(), records.clone()));
        Ok(records)
    }

    /// MX records with each exchange resolved to addresses, IPv4 before
    /// IPv6; exchanges that do not resolve are dropped.
    pub async fn lookup_with_fallback(&self, domain: &str) -> Result<Vec<ResolvedHost>> {
        let records = self.lookup(domain).await?;
        let mut out = Vec::new();
        for record in records.iter() {
            let addrs = self.resolve_host(&record.host).await;
            if addrs.is_empty() {
                tracing::debug!(host = %record.host, "MX host does not resolve, skipping");
                continue;
            }
            out.push(ResolvedHost {
                host: record.host.clone(),
                addrs,
            });
        }
        Ok(out)
    }

    async fn resolve_host(&self, host: &str) -> Vec<IpAddr> {
        let mut addrs = Vec::new();
        for strategy in [IpLookupStrategy::Ipv4Only, IpLookupStrategy::Ipv6Only] {
            match self
                .resolver
                .ip_lookup(
                    host,
                    strategy,
                    MAX_ADDRS_PER_HOST,
                    None::<&NoCache<String, Arc<Vec<std::net::Ipv4Addr>>>>,
                    None::<&NoCache<String, Arc<Vec<std::net::Ipv6Addr>>>>,
                )
                .await
            {
                Ok(ips) => addrs.extend(ips),
                Err(mail_auth::Error::DnsRecordNotFound(_)) => {}
                Err(e) => {
                    tracing::debug!(host = %host, err = %e, "address lookup failed");
                }
            }
        }
        addrs
    }
}

/// Flattens and sorts the raw MX answer: ascending preference, each
/// exchange kept in answer order within its preference level.
fn order_records(mx: &[MX]) -> Vec<MxRecord> {
    let mut out = Vec::new();
    let mut sorted: Vec<&MX> = mx.iter().collect();
    sorted.sort_by_key(|m| m.preference);
    for record in sorted {
        for host in &record.exchanges {
            // a null MX ("." per RFC 7505) means the domain accepts no mail
            if host == "." || host.is_empty() {
                continue;
            }
            out.push(MxRecord {
                host: host.trim_end_matches('.').to_lowercase(),
                preference: record.preference,
            });
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders_by_preference_and_flattens() {
        let raw = vec![
            MX {
                exchanges: vec!["mx2.example.com.".into()],
                preference: 20,
            },
            MX {
                exchanges: vec!["mx1a.example.com".into(), "mx1b.example.com".into()],
                preference: 10,
            },
        ];
        let ordered = order_records(&raw);
        assert_eq!(
            ordered,
            vec![
                MxRecord {
                    host: "mx1a.example.com".into(),
                    preference: 10
                },
                MxRecord {
                    host: "mx1b.example.com".into(),
                    preference: 10
                },
                MxRecord {
                    host: "mx2.example.com".into(),
                    preference: 20
                },
            ]
        );
    }

    #[test]
    fn null_mx_is_dropped() {
        let raw = vec![MX {
            exchanges: vec![".".into()],
            preference: 0,
        }];
        assert!(order_records(&raw).is_empty());
    }
}
