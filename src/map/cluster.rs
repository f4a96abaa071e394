//! Zoom-dependent point clustering.
//!
//! The index is a stack of R-trees, one per integer zoom level. The level
//! above `max_zoom` holds the raw points; each lower level is built from the
//! one above it by greedily merging nodes that fall within the cluster radius
//! (measured in pixels at that zoom). Coordinates are kept in the unit Web
//! Mercator square, so the radius at zoom `z` is `radius / (extent * 2^z)`.

use std::collections::BTreeSet;

use rayon::prelude::*;
use rstar::primitives::GeomWithData;
use rstar::{RTree, AABB};

use crate::config::ClusterConfig;
use crate::entity::{Entity, EntityId};
use crate::map::geo::{lat_y, lng_x, Coordinate, GeoBounds};
use crate::map::viewport::MAX_ZOOM;

type IndexedNode = GeomWithData<[f64; 2], usize>;

/// Opaque handle to a cluster in a particular index build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClusterId {
    generation: u64,
    index: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClusterOrPoint {
    Cluster {
        id: ClusterId,
        coordinate: Coordinate,
        count: usize,
    },
    Point {
        id: EntityId,
        coordinate: Coordinate,
    },
}

impl ClusterOrPoint {
    pub fn coordinate(&self) -> Coordinate {
        match self {
            ClusterOrPoint::Cluster { coordinate, .. } | ClusterOrPoint::Point { coordinate, .. } => *coordinate,
        }
    }

    pub fn count(&self) -> usize {
        match self {
            ClusterOrPoint::Cluster { count, .. } => *count,
            ClusterOrPoint::Point { .. } => 1,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum NodeSource {
    Point(usize),
    Cluster(usize),
}

#[derive(Debug, Clone, Copy)]
struct Node {
    x: f64,
    y: f64,
    num_points: usize,
    source: NodeSource,
}

#[derive(Debug)]
struct ClusterRecord {
    /// Zoom at which the cluster was formed; its children live one level up.
    zoom: u8,
    children: Vec<usize>,
}

#[derive(Debug, Default)]
struct Level {
    nodes: Vec<Node>,
    tree: RTree<IndexedNode>,
}

impl Level {
    fn new(nodes: Vec<Node>) -> Self {
        let tree = RTree::bulk_load(
            nodes
                .iter()
                .enumerate()
                .map(|(i, n)| GeomWithData::new([n.x, n.y], i))
                .collect(),
        );
        Self { nodes, tree }
    }
}

#[derive(Debug, Clone)]
struct IndexedPoint {
    id: EntityId,
    coordinate: Coordinate,
}

/// Spatial index over the filtered entity set. Rebuilt wholesale by [`ClusterIndex::load`].
#[derive(Debug)]
pub struct ClusterIndex {
    options: ClusterConfig,
    generation: u64,
    points: Vec<IndexedPoint>,
    clusters: Vec<ClusterRecord>,
    /// `levels[i]` is zoom `min_zoom + i`; the last level holds the raw points.
    levels: Vec<Level>,
}

impl ClusterIndex {
    /// Zoom bounds are clamped to the viewport's range.
    pub fn new(mut options: ClusterConfig) -> Self {
        options.max_zoom = options.max_zoom.min(MAX_ZOOM as u8);
        options.min_zoom = options.min_zoom.min(options.max_zoom);
        Self {
            options,
            generation: 0,
            points: Vec::new(),
            clusters: Vec::new(),
            levels: Vec::new(),
        }
    }

    pub fn options(&self) -> &ClusterConfig {
        &self.options
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn load_entities(&mut self, entities: &[Entity]) {
        self.load(entities.iter().map(|e| (e.id.clone(), e.coordinate())));
    }

    /// Replaces the whole index with `points`.
    pub fn load(&mut self, points: impl IntoIterator<Item = (EntityId, Coordinate)>) {
        self.generation += 1;
        self.points = points
            .into_iter()
            .map(|(id, coordinate)| IndexedPoint { id, coordinate })
            .collect();
        self.clusters.clear();
        self.levels.clear();

        let raw: Vec<Node> = self
            .points
            .par_iter()
            .enumerate()
            .map(|(i, p)| {
                let [x, y] = p.coordinate.to_mercator();
                Node {
                    x,
                    y,
                    num_points: 1,
                    source: NodeSource::Point(i),
                }
            })
            .collect();

        let min_zoom = self.options.min_zoom;
        let max_zoom = self.options.max_zoom.max(min_zoom);
        let mut levels = vec![Level::new(raw)];
        for zoom in (min_zoom..=max_zoom).rev() {
            let Some(above) = levels.last() else {
                break;
            };
            let nodes = self.cluster_level(above, zoom);
            levels.push(Level::new(nodes));
        }
        levels.reverse();
        self.levels = levels;

        log::debug!(
            "cluster index rebuilt: {} points, {} clusters across zooms {}..={}",
            self.points.len(),
            self.clusters.len(),
            min_zoom,
            max_zoom
        );
    }

    fn cluster_level(&mut self, above: &Level, zoom: u8) -> Vec<Node> {
        let radius = self.options.radius / (self.options.extent * 2f64.powi(zoom as i32));
        let mut visited = vec![false; above.nodes.len()];
        let mut next = Vec::with_capacity(above.nodes.len());

        for i in 0..above.nodes.len() {
            if visited[i] {
                continue;
            }
            visited[i] = true;
            let node = above.nodes[i];

            let mut neighbors: Vec<usize> = above
                .tree
                .locate_within_distance([node.x, node.y], radius * radius)
                .map(|g| g.data)
                .filter(|&j| !visited[j])
                .collect();
            neighbors.sort_unstable();

            let num_points = node.num_points + neighbors.iter().map(|&j| above.nodes[j].num_points).sum::<usize>();

            if num_points > node.num_points && num_points >= self.options.min_points {
                let mut wx = node.x * node.num_points as f64;
                let mut wy = node.y * node.num_points as f64;
                for &j in &neighbors {
                    visited[j] = true;
                    let n = &above.nodes[j];
                    wx += n.x * n.num_points as f64;
                    wy += n.y * n.num_points as f64;
                }
                let mut children = Vec::with_capacity(neighbors.len() + 1);
                children.push(i);
                children.extend(neighbors);
                self.clusters.push(ClusterRecord { zoom, children });
                next.push(Node {
                    x: wx / num_points as f64,
                    y: wy / num_points as f64,
                    num_points,
                    source: NodeSource::Cluster(self.clusters.len() - 1),
                });
            } else {
                next.push(node);
                if num_points > 1 {
                    for j in neighbors {
                        visited[j] = true;
                        next.push(above.nodes[j]);
                    }
                }
            }
        }

        next
    }

    fn level_for(&self, zoom: f64) -> Option<&Level> {
        let min_zoom = self.options.min_zoom as f64;
        let top = self.levels.len().checked_sub(1)?;
        let z = (zoom.floor().max(min_zoom) - min_zoom) as usize;
        self.levels.get(z.min(top))
    }

    fn to_result(&self, node: &Node) -> ClusterOrPoint {
        match node.source {
            NodeSource::Point(i) => ClusterOrPoint::Point {
                id: self.points[i].id.clone(),
                coordinate: self.points[i].coordinate,
            },
            NodeSource::Cluster(c) => ClusterOrPoint::Cluster {
                id: ClusterId {
                    generation: self.generation,
                    index: c,
                },
                coordinate: Coordinate::from_mercator(node.x, node.y),
                count: node.num_points,
            },
        }
    }

    /// Clusters and points inside any of `bboxes` at `zoom`.
    ///
    /// Each box must not cross the antimeridian; use [`ClusterIndex::query_bounds`]
    /// for raw viewport bounds. Results are ordered and deduplicated, so equal
    /// inputs give equal outputs.
    pub fn query(&self, bboxes: &[GeoBounds], zoom: f64) -> Vec<ClusterOrPoint> {
        let Some(level) = self.level_for(zoom) else {
            return Vec::new();
        };
        let mut hits = BTreeSet::new();
        for bbox in bboxes {
            let envelope = AABB::from_corners(
                [lng_x(bbox.west()), lat_y(bbox.north())],
                [lng_x(bbox.east()), lat_y(bbox.south())],
            );
            hits.extend(level.tree.locate_in_envelope_intersecting(&envelope).map(|g| g.data));
        }
        hits.into_iter().map(|i| self.to_result(&level.nodes[i])).collect()
    }

    pub fn query_bounds(&self, bounds: &GeoBounds, zoom: f64) -> Vec<ClusterOrPoint> {
        self.query(&bounds.split_antimeridian(), zoom)
    }

    fn record(&self, id: ClusterId) -> Option<&ClusterRecord> {
        if id.generation != self.generation {
            return None;
        }
        self.clusters.get(id.index)
    }

    fn level_at(&self, zoom: u8) -> Option<&Level> {
        let offset = zoom.checked_sub(self.options.min_zoom)? as usize;
        self.levels.get(offset)
    }

    /// Direct children of a cluster, one zoom level above where it formed.
    pub fn children(&self, id: ClusterId) -> Option<Vec<ClusterOrPoint>> {
        let record = self.record(id)?;
        let level = self.level_at(record.zoom + 1)?;
        Some(record.children.iter().map(|&i| self.to_result(&level.nodes[i])).collect())
    }

    /// The smallest zoom at which the cluster splits into more than one marker.
    /// `None` for handles from an earlier build.
    pub fn expansion_zoom(&self, id: ClusterId) -> Option<u8> {
        let mut record = self.record(id)?;
        let mut zoom = record.zoom;
        while zoom <= self.options.max_zoom {
            zoom += 1;
            if record.children.len() != 1 {
                break;
            }
            let level = self.level_at(record.zoom + 1)?;
            match level.nodes[record.children[0]].source {
                NodeSource::Cluster(c) => record = &self.clusters[c],
                NodeSource::Point(_) => break,
            }
        }
        Some(zoom)
    }

    /// Member entity ids of a cluster, skipping `offset` and returning at most `limit`.
    pub fn leaves(&self, id: ClusterId, limit: usize, offset: usize) -> Option<Vec<EntityId>> {
        let record = self.record(id)?;
        let mut out = Vec::new();
        let mut skipped = 0;
        self.append_leaves(record, limit, offset, &mut skipped, &mut out);
        Some(out)
    }

    fn append_leaves(&self, record: &ClusterRecord, limit: usize, offset: usize, skipped: &mut usize, out: &mut Vec<EntityId>) {
        let Some(level) = self.level_at(record.zoom + 1) else {
            return;
        };
        for &child in &record.children {
            if out.len() >= limit {
                return;
            }
            let node = &level.nodes[child];
            match node.source {
                NodeSource::Cluster(c) => {
                    if *skipped + node.num_points <= offset {
                        *skipped += node.num_points;
                    } else {
                        self.append_leaves(&self.clusters[c], limit, offset, skipped, out);
                    }
                }
                NodeSource::Point(p) => {
                    if *skipped < offset {
                        *skipped += 1;
                    } else {
                        out.push(self.points[p].id.clone());
                    }
                }
            }
        }
    }
}
