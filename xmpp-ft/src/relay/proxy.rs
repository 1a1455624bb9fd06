//! SOCKS5 proxy (proxy65) directory
//!
//! Each configured proxy JID is asked for its streamhost with a bytestream
//! `get` query. The answer is cached per session; the first proxy to resolve
//! becomes the default and is offered first from then on.

use std::collections::HashMap;

use tracing::{debug, info, warn};
use xmpp_ft_common::Jid;
use xmpp_ft_common::stanza::{BytestreamQuery, Iq, IqPayload, IqType};

use crate::constants::PROXY_QUERY_ID_PREFIX;
use crate::record::{HostState, Streamhost};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyState {
    Unresolved,
    /// Discovery query in flight
    Resolving(String),
    Resolved { jid: Jid, host: String, port: u16 },
    Failed,
}

#[derive(Debug, Default)]
pub struct ProxyDirectory {
    proxies: HashMap<String, ProxyState>,
    default_proxy: Option<String>,
    next_query: u64,
}

impl ProxyDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn state(&self, proxy: &str) -> ProxyState {
        self.proxies
            .get(proxy)
            .cloned()
            .unwrap_or(ProxyState::Unresolved)
    }

    pub fn default_proxy(&self) -> Option<&str> {
        self.default_proxy.as_deref()
    }

    pub fn set_default(&mut self, proxy: &str) {
        self.default_proxy = Some(proxy.to_string());
    }

    /// Discovery queries for every proxy that is neither resolved nor pending
    pub fn discovery_queries(&mut self, configured: &[String]) -> Vec<Iq> {
        let mut queries = Vec::new();
        for proxy in configured {
            if !matches!(self.state(proxy), ProxyState::Unresolved) {
                continue;
            }
            let Ok(to) = Jid::parse(proxy) else {
                warn!(proxy = %proxy, "skipping invalid proxy JID");
                self.proxies.insert(proxy.clone(), ProxyState::Failed);
                continue;
            };
            self.next_query += 1;
            let id = format!("{}{}", PROXY_QUERY_ID_PREFIX, self.next_query);
            debug!(proxy = %proxy, id = %id, "querying proxy streamhost");
            self.proxies
                .insert(proxy.clone(), ProxyState::Resolving(id.clone()));
            queries.push(Iq::new(
                IqType::Get,
                id,
                Some(to),
                IqPayload::Bytestream(BytestreamQuery::default()),
            ));
        }
        queries
    }

    fn pending(&self, id: &str) -> Option<String> {
        self.proxies.iter().find_map(|(proxy, state)| match state {
            ProxyState::Resolving(query) if query == id => Some(proxy.clone()),
            _ => None,
        })
    }

    /// Whether `id` belongs to one of our discovery queries
    #[must_use]
    pub fn owns_query(&self, id: &str) -> bool {
        self.pending(id).is_some()
    }

    /// Record a discovery answer; returns false if the id is not ours
    pub fn handle_result(&mut self, id: &str, query: &BytestreamQuery) -> bool {
        let Some(proxy) = self.pending(id) else {
            return false;
        };

        let resolved = query.streamhosts.iter().find_map(|entry| {
            let jid = Jid::parse(entry.jid.as_deref()?).ok()?;
            let host = entry.host.clone()?;
            let port = entry.port.as_deref()?.parse().ok()?;
            Some(ProxyState::Resolved { jid, host, port })
        });

        match resolved {
            Some(state) => {
                info!(proxy = %proxy, "proxy resolved");
                if self.default_proxy.is_none() {
                    self.default_proxy = Some(proxy.clone());
                }
                self.proxies.insert(proxy, state);
            }
            None => {
                warn!(proxy = %proxy, "proxy answered without a usable streamhost");
                self.proxies.insert(proxy, ProxyState::Failed);
            }
        }
        true
    }

    /// Record a discovery error; returns false if the id is not ours
    pub fn handle_error(&mut self, id: &str) -> bool {
        let Some(proxy) = self.pending(id) else {
            return false;
        };
        warn!(proxy = %proxy, "proxy discovery failed");
        if self.default_proxy.as_deref() == Some(proxy.as_str()) {
            self.default_proxy = None;
        }
        self.proxies.insert(proxy, ProxyState::Failed);
        true
    }

    /// Forget a proxy that failed during a transfer so it is queried again
    pub fn invalidate(&mut self, proxy: &Jid) {
        let key = self.proxies.iter().find_map(|(name, state)| match state {
            ProxyState::Resolved { jid, .. } if jid == proxy => Some(name.clone()),
            _ => None,
        });
        if let Some(name) = key {
            debug!(proxy = %name, "invalidating proxy");
            if self.default_proxy.as_deref() == Some(name.as_str()) {
                self.default_proxy = None;
            }
            self.proxies.remove(&name);
        }
    }

    /// `configured` with the default proxy moved to the front
    #[must_use]
    pub fn ordered(&self, configured: &[String]) -> Vec<String> {
        let mut ordered = configured.to_vec();
        if let Some(default) = &self.default_proxy
            && let Some(pos) = ordered.iter().position(|p| p == default)
        {
            let proxy = ordered.remove(pos);
            ordered.insert(0, proxy);
        }
        ordered
    }

    /// Resolved proxies as streamhosts for one transfer
    #[must_use]
    pub fn streamhosts(
        &self,
        configured: &[String],
        initiator: &Jid,
        target: &Jid,
        request_id: &str,
    ) -> Vec<Streamhost> {
        self.ordered(configured)
            .iter()
            .filter_map(|proxy| match self.proxies.get(proxy)? {
                ProxyState::Resolved { jid, host, port } => Some(Streamhost {
                    jid: jid.clone(),
                    host: host.clone(),
                    port: *port,
                    initiator: initiator.clone(),
                    target: target.clone(),
                    request_id: request_id.to_string(),
                    state: HostState::Pending,
                    idx: None,
                }),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xmpp_ft_common::stanza::StreamhostEntry;

    fn jid(s: &str) -> Jid {
        Jid::parse(s).unwrap()
    }

    fn answer(proxy: &str, host: &str) -> BytestreamQuery {
        BytestreamQuery {
            streamhosts: vec![StreamhostEntry::new(&jid(proxy), host, 7777)],
            ..Default::default()
        }
    }

    fn resolve(dir: &mut ProxyDirectory, configured: &[String], host: &str) {
        for iq in dir.discovery_queries(configured) {
            let proxy = iq.to.unwrap().to_string();
            assert!(dir.handle_result(&iq.id, &answer(&proxy, host)));
        }
    }

    #[test]
    fn test_discovery_queries_once() {
        let mut dir = ProxyDirectory::new();
        let configured = vec!["proxy.a.org".to_string(), "proxy.b.org".to_string()];

        let queries = dir.discovery_queries(&configured);
        assert_eq!(queries.len(), 2);
        assert!(queries.iter().all(|q| q.kind == IqType::Get));
        assert!(queries.iter().all(|q| q.id.starts_with(PROXY_QUERY_ID_PREFIX)));

        // still pending, nothing new to ask
        assert!(dir.discovery_queries(&configured).is_empty());
    }

    #[test]
    fn test_first_resolved_becomes_default() {
        let mut dir = ProxyDirectory::new();
        let configured = vec!["proxy.a.org".to_string(), "proxy.b.org".to_string()];
        let queries = dir.discovery_queries(&configured);

        // b answers first
        assert!(dir.handle_result(&queries[1].id, &answer("proxy.b.org", "198.51.100.2")));
        assert!(dir.handle_result(&queries[0].id, &answer("proxy.a.org", "198.51.100.1")));
        assert_eq!(dir.default_proxy(), Some("proxy.b.org"));
        assert_eq!(dir.ordered(&configured), vec!["proxy.b.org", "proxy.a.org"]);

        let hosts = dir.streamhosts(
            &configured,
            &jid("alice@example.com/a"),
            &jid("bob@example.com/b"),
            "id_s1",
        );
        assert_eq!(hosts.len(), 2);
        assert_eq!(hosts[0].host, "198.51.100.2");
        assert_eq!(hosts[0].request_id, "id_s1");
    }

    #[test]
    fn test_error_marks_failed() {
        let mut dir = ProxyDirectory::new();
        let configured = vec!["proxy.a.org".to_string()];
        let queries = dir.discovery_queries(&configured);

        assert!(dir.handle_error(&queries[0].id));
        assert_eq!(dir.state("proxy.a.org"), ProxyState::Failed);
        assert!(!dir.handle_error("px_unknown"));
        assert!(dir.streamhosts(&configured, &jid("a@b/c"), &jid("d@e/f"), "x").is_empty());
    }

    #[test]
    fn test_answer_without_streamhost_fails() {
        let mut dir = ProxyDirectory::new();
        let configured = vec!["proxy.a.org".to_string()];
        let queries = dir.discovery_queries(&configured);

        assert!(dir.handle_result(&queries[0].id, &BytestreamQuery::default()));
        assert_eq!(dir.state("proxy.a.org"), ProxyState::Failed);
        assert_eq!(dir.default_proxy(), None);
    }

    #[test]
    fn test_invalidate_allows_new_query() {
        let mut dir = ProxyDirectory::new();
        let configured = vec!["proxy.a.org".to_string()];
        resolve(&mut dir, &configured, "198.51.100.1");
        assert_eq!(dir.default_proxy(), Some("proxy.a.org"));

        dir.invalidate(&jid("proxy.a.org"));
        assert_eq!(dir.default_proxy(), None);
        assert_eq!(dir.discovery_queries(&configured).len(), 1);
    }
}
