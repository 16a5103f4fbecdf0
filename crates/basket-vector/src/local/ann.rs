//! Candidate generation for the local index.
//!
//! Each structure only proposes slots; the caller scores candidates exactly
//! and applies filters. `Flat` proposes everything, `Ivf` the members of the
//! closest inverted lists, `Graph` the beam of a greedy walk over a
//! navigable small-world graph.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

use basket_core::config::{LocalIndexConfig, LocalIndexKind, Metric};
use basket_core::similarity::{distance_to_similarity, dot, euclidean_distance};

const KMEANS_ITERATIONS: usize = 10;

/// Similarity under `metric`. Cosine assumes both sides are unit length.
pub fn similarity(metric: Metric, a: &[f32], b: &[f32]) -> f32 {
    match metric {
        Metric::Cosine => dot(a, b).clamp(-1.0, 1.0),
        Metric::Euclidean => distance_to_similarity(euclidean_distance(a, b)),
    }
}

#[derive(Debug, Clone, Copy)]
struct Scored(f32, usize);

impl PartialEq for Scored {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for Scored {}
impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Scored {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0).then_with(|| other.1.cmp(&self.1))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ivf {
    /// Empty until enough vectors exist to train `nlist` centroids.
    pub centroids: Vec<Vec<f32>>,
    pub lists: Vec<Vec<u32>>,
}

impl Ivf {
    pub fn is_trained(&self) -> bool {
        !self.centroids.is_empty()
    }

    fn nearest_list(&self, metric: Metric, v: &[f32]) -> usize {
        self.centroids
            .iter()
            .enumerate()
            .map(|(i, c)| Scored(similarity(metric, c, v), i))
            .max()
            .map_or(0, |s| s.1)
    }

    /// k-means with evenly spaced seeds, so training is deterministic.
    pub fn train(vectors: &[Vec<f32>], nlist: usize, metric: Metric) -> Self {
        let n = vectors.len();
        if nlist == 0 || n < nlist {
            return Self::default();
        }
        let mut ivf = Self {
            centroids: (0..nlist).map(|i| vectors[i * n / nlist].clone()).collect(),
            lists: vec![Vec::new(); nlist],
        };
        let dim = vectors[0].len();
        let mut assignment = vec![0usize; n];
        for _ in 0..KMEANS_ITERATIONS {
            let mut changed = false;
            for (slot, v) in vectors.iter().enumerate() {
                let best = ivf.nearest_list(metric, v);
                if assignment[slot] != best {
                    assignment[slot] = best;
                    changed = true;
                }
            }
            let mut sums = vec![vec![0f32; dim]; nlist];
            let mut counts = vec![0usize; nlist];
            for (slot, v) in vectors.iter().enumerate() {
                counts[assignment[slot]] += 1;
                for (s, x) in sums[assignment[slot]].iter_mut().zip(v) {
                    *s += x;
                }
            }
            for (c, (sum, count)) in ivf.centroids.iter_mut().zip(sums.into_iter().zip(counts)) {
                // empty clusters keep their previous centroid
                if count > 0 {
                    #[allow(clippy::cast_precision_loss)]
                    let inv = 1.0 / count as f32;
                    *c = sum.into_iter().map(|x| x * inv).collect();
                    if metric == Metric::Cosine {
                        *c = basket_core::similarity::l2_normalize(c);
                    }
                }
            }
            if !changed {
                break;
            }
        }
        for (slot, v) in vectors.iter().enumerate() {
            let list = ivf.nearest_list(metric, v);
            ivf.lists[list].push(to_u32(slot));
        }
        ivf
    }

    pub fn insert(&mut self, slot: usize, v: &[f32], metric: Metric) {
        if self.is_trained() {
            let list = self.nearest_list(metric, v);
            self.lists[list].push(to_u32(slot));
        }
    }

    /// Members of the `nprobe` closest lists, probing further until at least `want` slots are proposed.
    fn candidates(&self, metric: Metric, query: &[f32], nprobe: usize, want: usize) -> Vec<usize> {
        let mut order: Vec<Scored> =
            self.centroids.iter().enumerate().map(|(i, c)| Scored(similarity(metric, c, query), i)).collect();
        order.sort_by(|a, b| b.cmp(a));
        let mut out = Vec::new();
        for (scanned, Scored(_, list)) in order.into_iter().enumerate() {
            if scanned >= nprobe.max(1) && out.len() >= want {
                break;
            }
            out.extend(self.lists[list].iter().map(|&s| s as usize));
        }
        out
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Graph {
    pub neighbors: Vec<Vec<u32>>,
    pub entry: Option<u32>,
}

impl Graph {
    fn beam(&self, vectors: &[Vec<f32>], metric: Metric, query: &[f32], ef: usize) -> Vec<Scored> {
        let Some(entry) = self.entry.map(|e| e as usize) else { return Vec::new() };
        let ef = ef.max(1);
        let mut visited = HashSet::from([entry]);
        let first = Scored(similarity(metric, &vectors[entry], query), entry);
        let mut frontier = BinaryHeap::from([first]);
        // min-heap of the best `ef` seen so far
        let mut best = BinaryHeap::from([std::cmp::Reverse(first)]);
        while let Some(current) = frontier.pop() {
            let worst = best.peek().map_or(f32::MIN, |r| r.0 .0);
            if best.len() >= ef && current.0 < worst {
                break;
            }
            for &n in &self.neighbors[current.1] {
                let n = n as usize;
                if !visited.insert(n) {
                    continue;
                }
                let s = Scored(similarity(metric, &vectors[n], query), n);
                let worst = best.peek().map_or(f32::MIN, |r| r.0 .0);
                if best.len() < ef || s.0 > worst {
                    frontier.push(s);
                    best.push(std::cmp::Reverse(s));
                    if best.len() > ef {
                        best.pop();
                    }
                }
            }
        }
        let mut out: Vec<Scored> = best.into_iter().map(|r| r.0).collect();
        out.sort_by(|a, b| b.cmp(a));
        out
    }

    pub fn insert(&mut self, slot: usize, vectors: &[Vec<f32>], metric: Metric, degree: usize, ef: usize) {
        let degree = degree.max(1);
        let found = self.beam(vectors, metric, &vectors[slot], ef.max(degree));
        self.neighbors.push(Vec::new());
        if self.entry.is_none() {
            self.entry = Some(to_u32(slot));
            return;
        }
        for Scored(_, n) in found.into_iter().take(degree) {
            self.neighbors[slot].push(to_u32(n));
            self.neighbors[n].push(to_u32(slot));
            if self.neighbors[n].len() > degree * 2 {
                self.prune(n, vectors, metric, degree * 2);
            }
        }
    }

    fn prune(&mut self, node: usize, vectors: &[Vec<f32>], metric: Metric, keep: usize) {
        let mut scored: Vec<Scored> = self.neighbors[node]
            .iter()
            .map(|&n| Scored(similarity(metric, &vectors[node], &vectors[n as usize]), n as usize))
            .collect();
        scored.sort_by(|a, b| b.cmp(a));
        self.neighbors[node] = scored.into_iter().take(keep).map(|s| to_u32(s.1)).collect();
    }
}

/// Index variant chosen by `LocalIndexKind`.
#[derive(Debug, Clone, PartialEq)]
pub enum AnnStructure {
    Flat,
    Ivf(Ivf),
    Graph(Graph),
}

impl AnnStructure {
    pub fn empty(kind: LocalIndexKind) -> Self {
        match kind {
            LocalIndexKind::Flat => Self::Flat,
            LocalIndexKind::Ivf => Self::Ivf(Ivf::default()),
            LocalIndexKind::Graph => Self::Graph(Graph::default()),
        }
    }

    pub fn kind(&self) -> LocalIndexKind {
        match self {
            Self::Flat => LocalIndexKind::Flat,
            Self::Ivf(_) => LocalIndexKind::Ivf,
            Self::Graph(_) => LocalIndexKind::Graph,
        }
    }

    /// Build from scratch over `vectors` (slots `0..len`).
    pub fn build(vectors: &[Vec<f32>], settings: &LocalIndexConfig) -> Self {
        match settings.kind {
            LocalIndexKind::Flat => Self::Flat,
            LocalIndexKind::Ivf => Self::Ivf(Ivf::train(vectors, settings.nlist, settings.metric)),
            LocalIndexKind::Graph => {
                let mut g = Graph::default();
                for slot in 0..vectors.len() {
                    g.insert(slot, vectors, settings.metric, settings.graph_degree, settings.ef_search);
                }
                Self::Graph(g)
            }
        }
    }

    /// Register `slot`, which must already be the last entry of `vectors`.
    pub fn insert(&mut self, slot: usize, vectors: &[Vec<f32>], settings: &LocalIndexConfig) {
        match self {
            Self::Flat => {}
            Self::Ivf(ivf) if !ivf.is_trained() && vectors.len() >= settings.nlist => {
                *ivf = Ivf::train(vectors, settings.nlist, settings.metric);
            }
            Self::Ivf(ivf) => ivf.insert(slot, &vectors[slot], settings.metric),
            Self::Graph(g) => g.insert(slot, vectors, settings.metric, settings.graph_degree, settings.ef_search),
        }
    }

    /// Slots worth scoring exactly for a query that wants `want` results.
    pub fn candidates(
        &self,
        vectors: &[Vec<f32>],
        query: &[f32],
        want: usize,
        settings: &LocalIndexConfig,
    ) -> Vec<usize> {
        match self {
            Self::Ivf(ivf) if ivf.is_trained() => ivf.candidates(settings.metric, query, settings.nprobe, want),
            Self::Graph(g) if g.entry.is_some() => {
                g.beam(vectors, settings.metric, query, settings.ef_search.max(want)).into_iter().map(|s| s.1).collect()
            }
            _ => (0..vectors.len()).collect(),
        }
    }
}

pub(crate) fn to_u32(slot: usize) -> u32 {
    u32::try_from(slot).unwrap_or(u32::MAX)
}
