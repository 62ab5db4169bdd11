//! Relationship graph between documents
//!
//! One node per document, one directed edge per resolved link. Edges carry
//! their provenance: structural links (declared in front matter) weigh
//! more than links in running text. Besides plain one-hop neighbours the
//! graph answers "ontology" queries: documents that share a topic node with
//! the seed are returned as siblings even though they never link to each
//! other directly.

mod alias;

pub use alias::AliasMap;

use crate::config::GraphConfig;
use crate::retrieval::scoring::{centrality, hub_penalty};
use ahash::{HashMap, HashMapExt, HashSet};
use serde::{Deserialize, Serialize};

/// Provenance of an edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EdgeKind {
    /// Declared in front matter
    Structural,
    /// Written in the body text
    Body,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    Outgoing,
    Incoming,
    #[default]
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NeighborMode {
    /// One hop only
    Direct,
    /// One hop plus siblings reached through topic nodes
    #[default]
    Ontology,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NeighborQuery {
    pub direction: Direction,
    pub mode: NeighborMode,
    /// Per-hop decay; the configured decay when `None`
    pub decay: Option<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub path: String,
    pub score: f32,
    pub hops: u8,
    /// Topic node a sibling was reached through
    pub via: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    pub path: String,
    pub title: String,
    pub headers: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GraphStats {
    pub nodes: usize,
    pub edges: usize,
    pub topics: usize,
}

/// Serializable form of a [`RelationshipGraph`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<(String, String, EdgeKind)>,
}

pub struct RelationshipGraph {
    config: GraphConfig,
    nodes: HashMap<String, GraphNode>,
    outgoing: HashMap<String, HashMap<String, EdgeKind>>,
    incoming: HashMap<String, HashMap<String, EdgeKind>>,
}

impl RelationshipGraph {
    pub fn new(config: &GraphConfig) -> Self {
        Self {
            config: config.clone(),
            nodes: HashMap::new(),
            outgoing: HashMap::new(),
            incoming: HashMap::new(),
        }
    }

    /// Swap traversal settings (topic folders, decay, weights)
    pub fn set_config(&mut self, config: &GraphConfig) {
        self.config = config.clone();
    }

    /// Insert or update a node's metadata
    pub fn upsert_node(&mut self, path: &str, title: &str, headers: Vec<String>) {
        self.nodes.insert(
            path.to_string(),
            GraphNode {
                path: path.to_string(),
                title: title.to_string(),
                headers,
            },
        );
    }

    /// Replace every outgoing edge of `path`. Self links are ignored and a
    /// target linked twice keeps the structural kind.
    pub fn set_outgoing(&mut self, path: &str, targets: Vec<(String, EdgeKind)>) {
        self.clear_outgoing(path);

        let mut edges: HashMap<String, EdgeKind> = HashMap::new();
        for (target, kind) in targets {
            if target == path {
                continue;
            }
            let entry = edges.entry(target).or_insert(kind);
            if kind == EdgeKind::Structural {
                *entry = EdgeKind::Structural;
            }
        }

        for (target, kind) in &edges {
            self.incoming
                .entry(target.clone())
                .or_default()
                .insert(path.to_string(), *kind);
        }
        if !edges.is_empty() {
            self.outgoing.insert(path.to_string(), edges);
        }
    }

    /// Add a single edge, keeping the stronger kind if one exists
    pub fn add_edge(&mut self, from: &str, to: &str, kind: EdgeKind) {
        if from == to {
            return;
        }
        let current = self
            .outgoing
            .get(from)
            .and_then(|edges| edges.get(to))
            .copied();
        let kind = match current {
            Some(EdgeKind::Structural) => EdgeKind::Structural,
            _ => kind,
        };
        self.outgoing
            .entry(from.to_string())
            .or_default()
            .insert(to.to_string(), kind);
        self.incoming
            .entry(to.to_string())
            .or_default()
            .insert(from.to_string(), kind);
    }

    fn clear_outgoing(&mut self, path: &str) {
        if let Some(old) = self.outgoing.remove(path) {
            for target in old.keys() {
                if let Some(sources) = self.incoming.get_mut(target) {
                    sources.remove(path);
                    if sources.is_empty() {
                        self.incoming.remove(target);
                    }
                }
            }
        }
    }

    fn clear_incoming(&mut self, path: &str) {
        if let Some(old) = self.incoming.remove(path) {
            for source in old.keys() {
                if let Some(targets) = self.outgoing.get_mut(source) {
                    targets.remove(path);
                    if targets.is_empty() {
                        self.outgoing.remove(source);
                    }
                }
            }
        }
    }

    /// Remove a node and every edge touching it. Returns the nodes that
    /// linked to it.
    pub fn remove_node(&mut self, path: &str) -> Vec<String> {
        let sources: Vec<String> = self
            .incoming
            .get(path)
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default();
        self.clear_outgoing(path);
        self.clear_incoming(path);
        self.nodes.remove(path);
        sources
    }

    /// Move a node, keeping its edges in both directions
    pub fn rename_node(&mut self, from: &str, to: &str) -> bool {
        let Some(mut node) = self.nodes.remove(from) else {
            return false;
        };
        let outgoing = self.outgoing.get(from).cloned().unwrap_or_default();
        let incoming = self.incoming.get(from).cloned().unwrap_or_default();
        self.clear_outgoing(from);
        self.clear_incoming(from);
        self.remove_node(to);

        node.path = to.to_string();
        self.nodes.insert(to.to_string(), node);
        for (target, kind) in outgoing {
            self.add_edge(to, &target, kind);
        }
        for (source, kind) in incoming {
            self.add_edge(&source, to, kind);
        }
        true
    }

    pub fn contains(&self, path: &str) -> bool {
        self.nodes.contains_key(path)
    }

    pub fn node(&self, path: &str) -> Option<&GraphNode> {
        self.nodes.get(path)
    }

    pub fn in_degree(&self, path: &str) -> usize {
        self.incoming.get(path).map_or(0, |s| s.len())
    }

    pub fn out_degree(&self, path: &str) -> usize {
        self.outgoing.get(path).map_or(0, |t| t.len())
    }

    pub fn degree(&self, path: &str) -> usize {
        self.in_degree(path) + self.out_degree(path)
    }

    pub fn max_degree(&self) -> usize {
        self.nodes
            .keys()
            .map(|path| self.degree(path))
            .max()
            .unwrap_or(0)
    }

    /// Node lives under one of the topic folders
    pub fn in_topic_region(&self, path: &str) -> bool {
        self.config
            .topic_folders
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }

    /// Node is in the topic region and has enough inbound links to act as
    /// a hub for siblings
    pub fn is_topic(&self, path: &str) -> bool {
        self.in_topic_region(path) && self.in_degree(path) >= self.config.hub_degree_threshold
    }

    fn edge_weight(&self, kind: EdgeKind) -> f32 {
        match kind {
            EdgeKind::Structural => self.config.structural_edge_weight,
            EdgeKind::Body => self.config.body_edge_weight,
        }
    }

    fn penalised(&self, score: f32, path: &str) -> f32 {
        hub_penalty(score, self.degree(path), self.config.hub_degree_threshold)
    }

    fn adjacent(&self, path: &str, direction: Direction) -> Vec<(&str, EdgeKind)> {
        let mut out = Vec::new();
        if matches!(direction, Direction::Outgoing | Direction::Both) {
            if let Some(targets) = self.outgoing.get(path) {
                out.extend(targets.iter().map(|(p, k)| (p.as_str(), *k)));
            }
        }
        if matches!(direction, Direction::Incoming | Direction::Both) {
            if let Some(sources) = self.incoming.get(path) {
                out.extend(sources.iter().map(|(p, k)| (p.as_str(), *k)));
            }
        }
        out
    }

    /// Neighbours of `path`, best score first. Direct neighbours score
    /// `decay * edge_weight`; topic siblings score
    /// `decay^2 * weight_in * weight_out` damped by the topic's degree.
    /// Hubs are damped by `1 + ln(degree)` once above the hub threshold.
    pub fn neighbors(&self, path: &str, query: NeighborQuery) -> Vec<Neighbor> {
        if !self.contains(path) {
            return Vec::new();
        }
        let decay = query.decay.unwrap_or(self.config.decay);
        let mut best: HashMap<String, Neighbor> = HashMap::new();

        let mut offer = |candidate: &str, score: f32, hops: u8, via: Option<&str>| {
            if candidate == path || score <= 0.0 {
                return;
            }
            let better = best.get(candidate).map_or(true, |n| score > n.score);
            if better {
                best.insert(
                    candidate.to_string(),
                    Neighbor {
                        path: candidate.to_string(),
                        score,
                        hops,
                        via: via.map(str::to_string),
                    },
                );
            }
        };

        for (neighbor, kind) in self.adjacent(path, query.direction) {
            let score = self.penalised(decay * self.edge_weight(kind), neighbor);
            offer(neighbor, score, 1, None);

            if query.mode != NeighborMode::Ontology || !self.is_topic(neighbor) {
                continue;
            }
            // Siblings are the other notes linking into the topic, whatever
            // direction reached it
            let first_leg = decay * self.edge_weight(kind);
            for (sibling, sibling_kind) in self.adjacent(neighbor, Direction::Incoming) {
                if self.is_topic(sibling) {
                    continue;
                }
                let raw = first_leg * decay * self.edge_weight(sibling_kind);
                let through_topic = self.penalised(raw, neighbor);
                let score = self.penalised(through_topic, sibling);
                offer(sibling, score, 2, Some(neighbor));
            }
        }

        let mut neighbors: Vec<Neighbor> = best.into_values().collect();
        neighbors.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.path.cmp(&b.path)));
        neighbors
    }

    /// Normalised degree centrality for each path (0 for unknown paths)
    pub fn centralities(&self, paths: &[String]) -> Vec<f32> {
        let max_degree = self.max_degree();
        paths
            .iter()
            .map(|p| centrality(self.degree(p), max_degree))
            .collect()
    }

    /// Drop nodes (and their edges) that are not in `valid`. Returns the
    /// number of nodes removed.
    pub fn prune_orphans(&mut self, valid: &HashSet<String>) -> usize {
        let stale: Vec<String> = self
            .nodes
            .keys()
            .filter(|p| !valid.contains(*p))
            .cloned()
            .collect();
        for path in &stale {
            self.remove_node(path);
        }
        if !stale.is_empty() {
            tracing::debug!("Pruned {} orphan graph nodes", stale.len());
        }
        stale.len()
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.outgoing.clear();
        self.incoming.clear();
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn stats(&self) -> GraphStats {
        GraphStats {
            nodes: self.nodes.len(),
            edges: self.outgoing.values().map(|t| t.len()).sum(),
            topics: self.nodes.keys().filter(|p| self.is_topic(p)).count(),
        }
    }

    pub fn to_snapshot(&self) -> GraphSnapshot {
        let mut nodes: Vec<GraphNode> = self.nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.path.cmp(&b.path));

        let mut edges: Vec<(String, String, EdgeKind)> = self
            .outgoing
            .iter()
            .flat_map(|(from, targets)| {
                targets
                    .iter()
                    .map(move |(to, kind)| (from.clone(), to.clone(), *kind))
            })
            .collect();
        edges.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));

        GraphSnapshot { nodes, edges }
    }

    pub fn from_snapshot(snapshot: GraphSnapshot, config: &GraphConfig) -> Self {
        let mut graph = Self::new(config);
        for node in snapshot.nodes {
            graph.nodes.insert(node.path.clone(), node);
        }
        for (from, to, kind) in snapshot.edges {
            graph.add_edge(&from, &to, kind);
        }
        graph
    }
}
