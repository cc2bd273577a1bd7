//! Hand-tuned ring orderings per interconnect shape.
//!
//! Each entry lists the mesh links the shape assumes (by physical slot, i.e.
//! position of the device in ordinal order) and the ring permutations laid
//! over those links. Entries are fixed data; adding a topology means adding
//! an entry here. Every entry is validated once on first use.

use std::sync::LazyLock;

use indexmap::IndexMap;

use super::TopologyId;
use crate::types::MAX_RINGS;

/// Ring permutations and link graph for one (topology, device count).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyTable {
    pub id: TopologyId,
    pub n_dev: usize,
    /// Undirected mesh links, by slot.
    pub links: Vec<(usize, usize)>,
    /// Ring orderings, by slot.
    pub rings: Vec<Vec<usize>>,
}

impl TopologyTable {
    /// True if slots `a` and `b` share a declared link.
    pub fn has_link(&self, a: usize, b: usize) -> bool {
        self.links
            .iter()
            .any(|&(x, y)| (x == a && y == b) || (x == b && y == a))
    }

    fn validate(&self) -> Result<(), String> {
        if self.rings.is_empty() || self.rings.len() > MAX_RINGS {
            return Err(format!("{} rings", self.rings.len()));
        }
        for ring in &self.rings {
            if !is_permutation(ring, self.n_dev) {
                return Err(format!("ring {ring:?} is not a permutation of 0..{}", self.n_dev));
            }
            for pos in 0..ring.len() {
                let (a, b) = (ring[pos], ring[(pos + 1) % ring.len()]);
                if self.n_dev > 1 && !self.has_link(a, b) {
                    return Err(format!("ring {ring:?} uses missing link {a}-{b}"));
                }
            }
        }
        Ok(())
    }
}

/// True if `order` visits each of `0..n` exactly once.
pub(crate) fn is_permutation(order: &[usize], n: usize) -> bool {
    if order.len() != n {
        return false;
    }
    let mut seen = vec![false; n];
    for &slot in order {
        if slot >= n || seen[slot] {
            return false;
        }
        seen[slot] = true;
    }
    true
}

fn complete_graph(n: usize) -> Vec<(usize, usize)> {
    let mut links = Vec::with_capacity(n * (n - 1) / 2);
    for a in 0..n {
        for b in (a + 1)..n {
            links.push((a, b));
        }
    }
    links
}

/// Two fully linked quads plus one link per slot across the quads.
fn hybrid_cube_mesh(cross: [(usize, usize); 4]) -> Vec<(usize, usize)> {
    let mut links = Vec::with_capacity(16);
    for quad in [[0, 1, 2, 3], [4, 5, 6, 7]] {
        for i in 0..4 {
            for j in (i + 1)..4 {
                links.push((quad[i], quad[j]));
            }
        }
    }
    links.extend(cross);
    links
}

fn builtin_tables() -> Vec<TopologyTable> {
    let mut tables = vec![
        TopologyTable {
            id: TopologyId::CubeMesh,
            n_dev: 8,
            links: hybrid_cube_mesh([(0, 4), (1, 5), (2, 6), (3, 7)]),
            rings: vec![vec![0, 1, 2, 3, 7, 6, 5, 4], vec![0, 3, 2, 6, 7, 4, 5, 1]],
        },
        TopologyTable {
            id: TopologyId::BigBasin,
            n_dev: 8,
            links: hybrid_cube_mesh([(0, 6), (1, 7), (2, 4), (3, 5)]),
            rings: vec![vec![0, 1, 2, 3, 5, 4, 7, 6], vec![0, 2, 4, 5, 6, 7, 1, 3]],
        },
        TopologyTable {
            id: TopologyId::HalfCubeMesh,
            n_dev: 4,
            links: complete_graph(4),
            rings: vec![vec![0, 1, 2, 3], vec![0, 3, 1, 2]],
        },
    ];

    let fully_connected: [(usize, &[&[usize]]); 7] = [
        (2, &[&[0, 1]]),
        (3, &[&[0, 1, 2]]),
        (4, &[&[0, 1, 2, 3], &[0, 2, 1, 3]]),
        (5, &[&[0, 1, 2, 3, 4], &[0, 2, 4, 1, 3]]),
        (6, &[&[0, 1, 2, 3, 4, 5], &[0, 2, 4, 1, 5, 3]]),
        (7, &[&[0, 1, 2, 3, 4, 5, 6], &[0, 2, 4, 6, 1, 3, 5]]),
        (8, &[&[0, 1, 2, 3, 4, 5, 6, 7], &[0, 3, 6, 1, 4, 7, 2, 5]]),
    ];
    for (n_dev, rings) in fully_connected {
        tables.push(TopologyTable {
            id: TopologyId::FullyConnected,
            n_dev,
            links: complete_graph(n_dev),
            rings: rings.iter().map(|r| r.to_vec()).collect(),
        });
    }
    tables
}

static TABLES: LazyLock<IndexMap<(TopologyId, usize), TopologyTable>> = LazyLock::new(|| {
    let mut map = IndexMap::new();
    for table in builtin_tables() {
        match table.validate() {
            Ok(()) => {
                map.insert((table.id, table.n_dev), table);
            }
            Err(e) => tracing::error!(
                topology = %table.id,
                n_dev = table.n_dev,
                "dropping invalid ring table: {e}"
            ),
        }
    }
    map
});

/// Look up the table for a topology and device count.
pub fn lookup(id: TopologyId, n_dev: usize) -> Option<&'static TopologyTable> {
    TABLES.get(&(id, n_dev))
}

/// All tables in detection priority order.
pub fn all() -> impl Iterator<Item = &'static TopologyTable> {
    TABLES.values()
}
