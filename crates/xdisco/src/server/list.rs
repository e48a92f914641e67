use std::collections::HashMap;

use dashmap::DashMap;

use super::Server;
use crate::lookup::Rendezvous;

/// An immutable snapshot of a server set: sorted by `id`, keyed for O(1)
/// lookup, with a consistent-hash ring precomputed over `Host` (spec
/// §4.1-§4.2). Snapshots are never mutated after construction; a new
/// snapshot is built from scratch on every change.
#[derive(Debug, Clone)]
pub struct ServerList {
    sorted: Vec<Server>,
    by_id: HashMap<String, Server>,
    host_to_id: HashMap<String, String>,
    ring: Rendezvous,
}

impl ServerList {
    /// Build a snapshot from a plain sequence, sorting by `id` ascending
    /// so two snapshots with identical membership are bit-identical.
    pub fn new(mut list: Vec<Server>) -> Self {
        list.sort_by(|a, b| a.id.cmp(&b.id));

        let mut by_id = HashMap::with_capacity(list.len());
        let mut host_to_id = HashMap::with_capacity(list.len());
        let mut buckets = Vec::with_capacity(list.len());
        for s in &list {
            buckets.push(s.host.clone());
            host_to_id.insert(s.host.clone(), s.id.clone());
            by_id.insert(s.id.clone(), s.clone());
        }

        Self {
            sorted: list,
            by_id,
            host_to_id,
            ring: Rendezvous::new(buckets),
        }
    }

    /// Build a snapshot from a concurrent map keyed by backend key (the
    /// Service's internal registry); values are sorted by `id`.
    pub fn from_concurrent_map(map: &DashMap<String, Server>) -> Self {
        let list: Vec<Server> = map.iter().map(|e| e.value().clone()).collect();
        Self::new(list)
    }

    pub fn has(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Server> {
        self.by_id.get(id)
    }

    pub fn get_all(&self) -> &[Server] {
        &self.sorted
    }

    pub fn get_map(&self) -> &HashMap<String, Server> {
        &self.by_id
    }

    pub fn size(&self) -> usize {
        self.sorted.len()
    }

    /// Returns every server that matches **any** key/value pair in
    /// `filter` (OR semantics, not AND — see spec §9 open questions).
    pub fn get_by_labels(&self, filter: &HashMap<String, String>) -> Vec<&Server> {
        self.sorted
            .iter()
            .filter(|s| {
                filter
                    .iter()
                    .any(|(k, v)| s.get_label(k).map(|lv| lv == v).unwrap_or(false))
            })
            .collect()
    }

    pub fn for_each(&self, mut visitor: impl FnMut(&str, &Server)) {
        for (id, s) in &self.by_id {
            visitor(id, s);
        }
    }

    /// `ring.get(id)` to obtain a `Host`, then the `Server` whose address
    /// matches it (spec §4.1 invariant: every ring bucket is the `Host` of
    /// exactly one server in the same snapshot).
    pub fn lookup(&self, key: &str) -> Option<&Server> {
        if self.ring.is_empty() {
            return None;
        }
        let host = self.ring.get(key);
        let id = self.host_to_id.get(&host)?;
        self.by_id.get(id)
    }

    pub fn dump(&self) -> String {
        if self.sorted.is_empty() {
            return "empty".to_string();
        }
        let mut lines = vec!["=== serverlist ===".to_string()];
        for s in &self.sorted {
            lines.push(format!("{}\n\t{:?}", s.key(), s));
        }
        lines.push("===".to_string());
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make(id: &str, host: &str) -> Server {
        Server::new(id, "kind", host)
    }

    #[test]
    fn sorted_and_immutable_view() {
        let list = ServerList::new(vec![make("3", "h3"), make("1", "h1"), make("2", "h2")]);
        let ids: Vec<&str> = list.get_all().iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
    }

    #[test]
    fn lookup_resolves_to_a_member() {
        let list = ServerList::new(vec![make("a", "host-a"), make("b", "host-b"), make("c", "host-c")]);
        let found = list.lookup("some-routing-key").expect("lookup must resolve");
        assert!(["a", "b", "c"].contains(&found.id.as_str()));
    }

    #[test]
    fn empty_list_lookup_is_none() {
        let list = ServerList::new(vec![]);
        assert!(list.lookup("anything").is_none());
    }

    #[test]
    fn get_by_labels_is_or_semantics() {
        let mut s1 = make("1", "h1");
        s1.labels.insert("az".to_string(), "us-east".to_string());
        let mut s2 = make("2", "h2");
        s2.labels.insert("az".to_string(), "us-west".to_string());
        let list = ServerList::new(vec![s1, s2]);

        let mut filter = HashMap::new();
        filter.insert("az".to_string(), "us-east".to_string());
        filter.insert("unrelated".to_string(), "whatever".to_string());
        let matched = list.get_by_labels(&filter);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].id, "1");
    }
}
