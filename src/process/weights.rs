use indexmap::IndexMap;

use crate::{
    mesh::{BoneLink, SkeletalMesh},
    process::FLOAT_TOLERANCE,
    verbose, warn,
};

/// Per-vertex bone influences after capping, plus the largest weight dropped
/// anywhere in the mesh.
#[derive(Debug, Default)]
pub struct VertexWeights {
    /// Capped and renormalized links, parallel to the mesh vertices, each
    /// list sorted ascending by bone. May shrink further during partition
    /// pre-reduction.
    pub links: Vec<Vec<BoneLink>>,
    /// The largest single weight discarded while capping or reducing.
    pub lost_weight: f64,
}

/// Sorts links descending by weight, keeps at most `max_count` and
/// renormalizes the remainder to sum to 1. Returns the largest discarded
/// weight. Never fails.
pub fn reduce_links(links: &mut Vec<BoneLink>, max_count: usize) -> f64 {
    links.sort_by(|from, to| to.weight.partial_cmp(&from.weight).unwrap_or(std::cmp::Ordering::Less));

    let mut lost_weight = 0.0_f64;
    if links.len() > max_count {
        lost_weight = links[max_count..].iter().map(|link| link.weight).fold(0.0, f64::max);
        links.truncate(max_count);
    }

    let total: f64 = links.iter().map(|link| link.weight).sum();
    if total > FLOAT_TOLERANCE {
        for link in links.iter_mut() {
            link.weight /= total;
        }
    }

    lost_weight
}

/// Builds the derived per-vertex weight lists the partitioner and encoder
/// work on: duplicate links merged, zero-influence vertices recovered to the
/// root bone, influence counts capped and weights renormalized.
pub fn gather_weights(mesh: &SkeletalMesh, max_bones_per_vertex: usize) -> VertexWeights {
    let root_bone = mesh.skeleton.root().unwrap_or(0);

    let mut links = Vec::with_capacity(mesh.links.len());
    let mut lost_weight = 0.0_f64;
    let mut unweighted = Vec::new();

    for (vertex_index, raw_links) in mesh.links.iter().enumerate() {
        // Merge duplicate links to the same bone; drop dead weights.
        let mut merged: IndexMap<usize, f64> = IndexMap::new();
        for link in raw_links {
            if link.weight <= 0.0 {
                continue;
            }
            *merged.entry(link.bone).or_insert(0.0) += link.weight;
        }
        let mut vertex_links: Vec<BoneLink> = merged.into_iter().map(|(bone, weight)| BoneLink { bone, weight }).collect();

        if vertex_links.is_empty() {
            unweighted.push(vertex_index);
            vertex_links.push(BoneLink { bone: root_bone, weight: 1.0 });
        }

        lost_weight = lost_weight.max(reduce_links(&mut vertex_links, max_bones_per_vertex));

        // The encoder matches weight columns between vertices by bone order.
        vertex_links.sort_by(|from, to| from.bone.cmp(&to.bone));
        links.push(vertex_links);
    }

    if !unweighted.is_empty() {
        warn!(
            "{} vertices of \"{}\" have no weights and were assigned to the root bone: {:?}",
            unweighted.len(),
            mesh.name,
            unweighted
        );
    }
    if let (Some(min_bones), Some(max_bones)) =
        (links.iter().map(Vec::len).min(), links.iter().map(Vec::len).max())
    {
        verbose!("Counted a minimum of {min_bones} and a maximum of {max_bones} bones per vertex.");
    }

    VertexWeights { links, lost_weight }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(bone: usize, weight: f64) -> BoneLink {
        BoneLink { bone, weight }
    }

    #[test]
    fn reduce_keeps_heaviest_links() {
        let mut links = vec![link(0, 0.1), link(1, 0.5), link(2, 0.3), link(3, 0.1)];
        let lost = reduce_links(&mut links, 2);
        assert_eq!(lost, 0.1);
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].bone, 1);
        assert_eq!(links[1].bone, 2);
        let total: f64 = links.iter().map(|l| l.weight).sum();
        assert!((total - 1.0).abs() < 1e-6);
    }

    #[test]
    fn reduce_normalizes_without_truncation() {
        let mut links = vec![link(0, 2.0), link(1, 2.0)];
        let lost = reduce_links(&mut links, 4);
        assert_eq!(lost, 0.0);
        assert!((links[0].weight - 0.5).abs() < 1e-6);
        assert!((links[1].weight - 0.5).abs() < 1e-6);
    }

    #[test]
    fn gather_merges_duplicates_and_sorts_by_bone() {
        let mesh = SkeletalMesh {
            vertices: vec![Default::default()],
            links: vec![vec![link(3, 0.25), link(1, 0.5), link(3, 0.25)]],
            ..Default::default()
        };
        let weights = gather_weights(&mesh, 4);
        assert_eq!(weights.links[0], vec![link(1, 0.5), link(3, 0.5)]);
    }

    #[test]
    fn gather_recovers_unweighted_vertices() {
        let mesh = SkeletalMesh {
            vertices: vec![Default::default(); 2],
            links: vec![vec![link(2, 1.0)], Vec::new()],
            ..Default::default()
        };
        let weights = gather_weights(&mesh, 4);
        assert_eq!(weights.links[1], vec![link(0, 1.0)]);
        assert_eq!(weights.lost_weight, 0.0);
    }

    #[test]
    fn gather_reports_the_largest_lost_weight() {
        let mesh = SkeletalMesh {
            vertices: vec![Default::default(); 2],
            links: vec![
                vec![link(0, 0.4), link(1, 0.3), link(2, 0.2), link(3, 0.1)],
                vec![link(0, 0.5), link(1, 0.25), link(2, 0.25)],
            ],
            ..Default::default()
        };
        let weights = gather_weights(&mesh, 2);
        assert!((weights.lost_weight - 0.25).abs() < 1e-12);
        for vertex_links in &weights.links {
            assert!(vertex_links.len() <= 2);
            let total: f64 = vertex_links.iter().map(|l| l.weight).sum();
            assert!((total - 1.0).abs() < 1e-6);
        }
    }
}
