//! Consistent hashing of metric names onto a fleet of destination daemons.
//!
//! Positions live in a deliberately small 16-bit space: with ~100 virtual
//! replicas per token and tens of tokens, collisions are frequent but load
//! imbalance stays within a few percent, and the whole ring fits in cache.

use std::{
    collections::{
        HashMap,
        HashSet,
    },
    fmt,
};

/// Virtual positions inserted per token.
pub const DEFAULT_REPLICA_COUNT: usize = 100;

/// One destination identity on the ring. Multiple instances may share a
/// host, so the token is the `(host, instance)` pair; the port is carried
/// separately by [`DestinationRing`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Token {
    pub host: String,
    pub instance: Option<String>,
}

impl Token {
    pub fn new(host: impl Into<String>, instance: Option<String>) -> Self {
        Self {
            host: host.into(),
            instance,
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.instance {
            Some(instance) => write!(f, "{}:{instance}", self.host),
            None => write!(f, "{}", self.host),
        }
    }
}

/// A sorted ring of `(position, token)` entries. Equal positions keep
/// insertion order; lookups are lower-bound searches mod the ring length.
#[derive(Clone, Debug)]
pub struct ConsistentHashRing {
    ring: Vec<(u16, Token)>,
    tokens: HashSet<Token>,
    replica_count: usize,
}

/// The first 16 bits of `md5(key)`.
pub fn ring_position(key: &str) -> u16 {
    let digest = md5::compute(key.as_bytes());
    u16::from_be_bytes([digest[0], digest[1]])
}

impl ConsistentHashRing {
    pub fn new(tokens: impl IntoIterator<Item = Token>, replica_count: usize) -> Self {
        let mut ring = Self {
            ring: Vec::new(),
            tokens: HashSet::new(),
            replica_count,
        };
        for token in tokens {
            ring.add_node(token);
        }
        ring
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }

    pub fn tokens(&self) -> impl Iterator<Item = &Token> {
        self.tokens.iter()
    }

    /// Insert `replica_count` virtual positions for the token, each hashed
    /// from `"<token>:<i>"`. Stable insert: replicas landing on an occupied
    /// position go after the entries already there.
    pub fn add_node(&mut self, token: Token) {
        self.tokens.insert(token.clone());
        for i in 0..self.replica_count {
            let position = ring_position(&format!("{token}:{i}"));
            let index = self.ring.partition_point(|(p, _)| *p <= position);
            self.ring.insert(index, (position, token.clone()));
        }
    }

    pub fn remove_node(&mut self, token: &Token) {
        self.tokens.remove(token);
        self.ring.retain(|(_, t)| t != token);
    }

    /// The token owning `key`: the least ring entry at or after the key's
    /// position, wrapping past the end.
    pub fn node_for(&self, key: &str) -> Option<&Token> {
        if self.ring.is_empty() {
            return None;
        }
        let position = ring_position(key);
        let index = self.ring.partition_point(|(p, _)| *p < position) % self.ring.len();
        Some(&self.ring[index].1)
    }

    /// Up to `n` distinct tokens, walking the ring in order from the key's
    /// position. Stops early once the whole ring has been traversed.
    pub fn nodes_for(&self, key: &str, n: usize) -> Vec<&Token> {
        let mut nodes: Vec<&Token> = Vec::new();
        if self.ring.is_empty() {
            return nodes;
        }
        let position = ring_position(key);
        let start = self.ring.partition_point(|(p, _)| *p < position) % self.ring.len();
        for offset in 0..self.ring.len() {
            if nodes.len() >= n {
                break;
            }
            let (_, token) = &self.ring[(start + offset) % self.ring.len()];
            if !nodes.contains(&token) {
                nodes.push(token);
            }
        }
        nodes
    }
}

/// A destination daemon: where the ring token lives on the network.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Destination {
    pub host: String,
    pub port: u16,
    pub instance: Option<String>,
}

impl Destination {
    pub fn token(&self) -> Token {
        Token::new(self.host.clone(), self.instance.clone())
    }

    /// Parse `host:port` or `host:port:instance`.
    pub fn parse(spec: &str) -> anyhow::Result<Self> {
        let mut parts = spec.split(':');
        let host = parts
            .next()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| anyhow::anyhow!("Destination '{spec}' is missing a host"))?;
        let port = parts
            .next()
            .ok_or_else(|| anyhow::anyhow!("Destination '{spec}' is missing a port"))?
            .parse()?;
        let instance = parts.next().map(String::from);
        anyhow::ensure!(
            parts.next().is_none(),
            "Destination '{spec}' has trailing components"
        );
        Ok(Self {
            host: host.to_owned(),
            port,
            instance,
        })
    }
}

/// The ring plus the token-to-port map, with replica placement deduplicated
/// by host so two replicas of one metric never share a physical machine.
#[derive(Clone, Debug)]
pub struct DestinationRing {
    ring: ConsistentHashRing,
    ports: HashMap<Token, u16>,
    replication_factor: usize,
}

impl DestinationRing {
    pub fn new(
        destinations: Vec<Destination>,
        replication_factor: usize,
    ) -> anyhow::Result<Self> {
        let distinct_hosts: HashSet<&str> =
            destinations.iter().map(|d| d.host.as_str()).collect();
        anyhow::ensure!(
            replication_factor <= distinct_hosts.len(),
            "REPLICATION_FACTOR={replication_factor} cannot exceed servers={}",
            distinct_hosts.len(),
        );
        let ports = destinations
            .iter()
            .map(|d| (d.token(), d.port))
            .collect::<HashMap<_, _>>();
        let ring = ConsistentHashRing::new(
            destinations.into_iter().map(|d| d.token()),
            DEFAULT_REPLICA_COUNT,
        );
        Ok(Self {
            ring,
            ports,
            replication_factor,
        })
    }

    pub fn ring(&self) -> &ConsistentHashRing {
        &self.ring
    }

    pub fn port(&self, token: &Token) -> Option<u16> {
        self.ports.get(token).copied()
    }

    /// The token whose cache is authoritative for `metric`.
    pub fn node_for(&self, metric: &str) -> Option<&Token> {
        self.ring.node_for(metric)
    }

    /// The replica set for `metric`: `replication_factor` destinations on
    /// distinct hosts, in ring order.
    pub fn destinations_for(&self, metric: &str) -> Vec<(String, u16)> {
        let mut used_hosts: HashSet<&str> = HashSet::new();
        let mut destinations = Vec::with_capacity(self.replication_factor);
        for token in self.ring.nodes_for(metric, self.ring.token_count()) {
            if destinations.len() >= self.replication_factor {
                break;
            }
            if !used_hosts.insert(token.host.as_str()) {
                continue;
            }
            if let Some(port) = self.ports.get(token) {
                destinations.push((token.host.clone(), *port));
            }
        }
        destinations
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::{
        ConsistentHashRing,
        Destination,
        DestinationRing,
        Token,
        DEFAULT_REPLICA_COUNT,
    };

    fn token(host: &str) -> Token {
        Token::new(host, None)
    }

    fn ring_of(hosts: &[&str]) -> ConsistentHashRing {
        ConsistentHashRing::new(hosts.iter().map(|h| token(h)), DEFAULT_REPLICA_COUNT)
    }

    #[test]
    fn test_node_for_is_deterministic() {
        let ring = ring_of(&["a", "b", "c"]);
        let first = ring.node_for("foo.bar").cloned();
        for _ in 0..10 {
            assert_eq!(ring.node_for("foo.bar").cloned(), first);
        }
    }

    #[test]
    fn test_nodes_for_yields_distinct_tokens() {
        let ring = ring_of(&["a", "b", "c", "d"]);
        for key in ["foo.bar", "carbon.agents.a1.cpu", "x"] {
            let nodes = ring.nodes_for(key, 3);
            assert_eq!(nodes.len(), 3);
            let mut deduped = nodes.clone();
            deduped.dedup();
            assert_eq!(deduped.len(), 3);
        }
    }

    #[test]
    fn test_nodes_for_caps_at_distinct_token_count() {
        let ring = ring_of(&["a", "b"]);
        assert_eq!(ring.nodes_for("foo", 5).len(), 2);
    }

    #[test]
    fn test_remove_node_drops_all_replicas() {
        let mut ring = ring_of(&["a", "b"]);
        ring.remove_node(&token("a"));
        assert_eq!(ring.token_count(), 1);
        for key in ["one", "two", "three"] {
            assert_eq!(ring.node_for(key), Some(&token("b")));
        }
    }

    #[test]
    fn test_empty_ring() {
        let ring = ring_of(&[]);
        assert!(ring.node_for("foo").is_none());
        assert!(ring.nodes_for("foo", 2).is_empty());
    }

    #[test]
    fn test_ring_balance() {
        // Sanity bound from the design: 10 tokens at 100 replicas each keep
        // per-token load within +/-20% of the mean over a uniform sample.
        let hosts: Vec<String> = (0..10).map(|i| format!("host{i}")).collect();
        let ring = ConsistentHashRing::new(
            hosts.iter().map(|h| token(h)),
            DEFAULT_REPLICA_COUNT,
        );
        let mut loads: HashMap<Token, usize> = HashMap::new();
        let samples = 1_000_000;
        for i in 0..samples {
            let node = ring.node_for(&format!("metric.sample.{i}")).unwrap();
            *loads.entry(node.clone()).or_default() += 1;
        }
        let mean = samples as f64 / hosts.len() as f64;
        for (node, load) in loads {
            let skew = (load as f64 - mean).abs() / mean;
            assert!(skew < 0.2, "token {node} has load {load}, skew {skew:.3}");
        }
    }

    #[test]
    fn test_destination_parse() {
        assert_eq!(
            Destination::parse("cache1:2003").unwrap(),
            Destination {
                host: "cache1".to_owned(),
                port: 2003,
                instance: None,
            }
        );
        assert_eq!(
            Destination::parse("cache1:2003:a").unwrap(),
            Destination {
                host: "cache1".to_owned(),
                port: 2003,
                instance: Some("a".to_owned()),
            }
        );
        assert!(Destination::parse("cache1").is_err());
        assert!(Destination::parse(":2003").is_err());
        assert!(Destination::parse("cache1:nope").is_err());
    }

    #[test]
    fn test_replication_factor_cannot_exceed_host_count() {
        let destinations = vec![
            Destination::parse("a:2003:0").unwrap(),
            Destination::parse("a:2004:1").unwrap(),
        ];
        // Two instances, one host: factor 2 must be rejected.
        assert!(DestinationRing::new(destinations, 2).is_err());
    }

    #[test]
    fn test_destinations_span_distinct_hosts() {
        let destinations = vec![
            Destination::parse("a:2003").unwrap(),
            Destination::parse("b:2003").unwrap(),
        ];
        let ring = DestinationRing::new(destinations, 2).unwrap();
        let replicas = ring.destinations_for("foo.bar");
        assert_eq!(replicas.len(), 2);
        let mut hosts: Vec<_> = replicas.iter().map(|(h, _)| h.as_str()).collect();
        hosts.sort();
        assert_eq!(hosts, vec!["a", "b"]);
        // Deterministic order on repeated calls.
        assert_eq!(ring.destinations_for("foo.bar"), replicas);
    }

    #[test]
    fn test_multiple_instances_per_host_collapse_for_replication() {
        let destinations = vec![
            Destination::parse("a:2003:0").unwrap(),
            Destination::parse("a:2004:1").unwrap(),
            Destination::parse("b:2003:0").unwrap(),
        ];
        let ring = DestinationRing::new(destinations, 2).unwrap();
        for key in ["m1", "m2", "m3", "m4"] {
            let replicas = ring.destinations_for(key);
            assert_eq!(replicas.len(), 2);
            assert_ne!(replicas[0].0, replicas[1].0);
        }
    }
}
