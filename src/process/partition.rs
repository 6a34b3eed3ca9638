use indexmap::{IndexMap, IndexSet};
use thiserror::Error as ThisError;

use crate::{
    mesh::{BoneLink, SkeletalMesh},
    process::{FLOAT_TOLERANCE, PartitionSettings, weights::VertexWeights},
    verbose,
};

#[derive(Debug, ThisError)]
pub enum ProcessingPartitionError {
    #[error("Cannot Remove Any More Bones From Triangle {0}; Increase The Bones Per Partition Limit")]
    CapacityError(usize),
}

/// A group of triangles whose union of bone influences stays within the
/// partition limit. Lives for the duration of one export call.
#[derive(Debug, Default)]
pub struct Partition {
    /// Global bone indices, in insertion order.
    pub bones: IndexSet<usize>,
    /// Indices into the mesh triangle list. Disjoint across partitions.
    pub triangles: Vec<usize>,
    /// The body part tag shared by every triangle in this partition.
    pub body_part: Option<i32>,
}

/// Splits the mesh triangles into partitions honoring the bone limit and the
/// per-triangle body part tags.
///
/// Pre-reduction may strip bones from `weights` (renormalizing the affected
/// vertices) so that every single triangle fits the limit; lost weight is
/// accumulated there. Triangles are consumed strictly in input order, which
/// keeps the output deterministic at the cost of optimality.
pub fn partition_triangles(
    mesh: &SkeletalMesh,
    weights: &mut VertexWeights,
    settings: &PartitionSettings,
) -> Result<Vec<Partition>, ProcessingPartitionError> {
    let max_bones = settings.max_bones_per_partition;
    let part_of = |triangle_index: usize| mesh.body_parts.as_ref().map_or(0, |parts| parts[triangle_index]);

    // Degenerate triangles never reach a partition.
    let mut remaining: Vec<usize> = Vec::with_capacity(mesh.triangles.len());
    for (triangle_index, triangle) in mesh.triangles.iter().enumerate() {
        if triangle[0] == triangle[1] || triangle[1] == triangle[2] || triangle[0] == triangle[2] {
            verbose!("Skipping degenerate triangle {triangle_index}.");
            continue;
        }
        remaining.push(triangle_index);
    }

    reduce_triangle_bones(mesh, weights, &remaining, max_bones)?;

    // Greedy region growth: seed a partition with the first unassigned
    // triangle, sweep in triangles whose bones are already covered, then grow
    // along shared vertices while the bone budget allows.
    let mut partitions: Vec<Partition> = Vec::new();
    while !remaining.is_empty() {
        let mut partition = Partition::default();
        let mut used_vertices: IndexSet<usize> = IndexSet::new();

        let mut add_triangles = true;
        while add_triangles {
            let mut deferred = Vec::with_capacity(remaining.len());
            for &triangle_index in &remaining {
                let bones = triangle_bones(&mesh.triangles[triangle_index], &weights.links);
                let tag = part_of(triangle_index);
                if partition.bones.is_empty() || (partition.body_part == Some(tag) && bones.is_subset(&partition.bones)) {
                    partition.bones.extend(bones);
                    partition.triangles.push(triangle_index);
                    used_vertices.extend(mesh.triangles[triangle_index]);
                    partition.body_part.get_or_insert(tag);
                } else {
                    deferred.push(triangle_index);
                }
            }
            remaining = deferred;

            add_triangles = false;
            if partition.bones.len() < max_bones {
                let mut deferred = Vec::with_capacity(remaining.len());
                for &triangle_index in &remaining {
                    let triangle = mesh.triangles[triangle_index];
                    if triangle.iter().any(|vertex| used_vertices.contains(vertex))
                        && partition.body_part == Some(part_of(triangle_index))
                    {
                        let bones = triangle_bones(&triangle, &weights.links);
                        let additional = bones.iter().filter(|bone| !partition.bones.contains(*bone)).count();
                        if partition.bones.len() + additional <= max_bones {
                            partition.bones.extend(bones);
                            partition.triangles.push(triangle_index);
                            used_vertices.extend(triangle);
                            add_triangles = true;
                            continue;
                        }
                    }
                    deferred.push(triangle_index);
                }
                remaining = deferred;
            }
        }

        partitions.push(partition);
    }
    verbose!("Created {} small partitions.", partitions.len());

    merge_partitions(&mut partitions, max_bones);
    verbose!("Merged into {} partitions.", partitions.len());

    if settings.maximize_bone_sharing {
        share_partition_bones(&mut partitions, max_bones);
    }

    if !settings.body_part_order.is_empty() {
        sort_partitions(&mut partitions, &settings.body_part_order, settings.maximize_bone_sharing);
    }

    Ok(partitions)
}

/// All bones influencing a triangle, in vertex/link order.
fn triangle_bones(triangle: &[usize; 3], links: &[Vec<BoneLink>]) -> IndexSet<usize> {
    let mut bones = IndexSet::new();
    for &vertex in triangle {
        for link in &links[vertex] {
            bones.insert(link.bone);
        }
    }
    bones
}

/// Strips bones from triangles whose influence set exceeds the partition
/// limit, least influential first. A bone that is some vertex's sole
/// influence is locked; if only locked bones remain the limit is unreachable.
fn reduce_triangle_bones(
    mesh: &SkeletalMesh,
    weights: &mut VertexWeights,
    triangles: &[usize],
    max_bones: usize,
) -> Result<(), ProcessingPartitionError> {
    for &triangle_index in triangles {
        let triangle = mesh.triangles[triangle_index];
        loop {
            let bones = triangle_bones(&triangle, &weights.links);
            if bones.len() <= max_bones {
                break;
            }

            // Sum each bone's weight over the triangle to find the least
            // influential one that is safe to remove.
            let mut bone_weights: IndexMap<usize, f64> = bones.iter().map(|&bone| (bone, 0.0)).collect();
            let mut locked: IndexSet<usize> = IndexSet::new();
            for &vertex in &triangle {
                let vertex_links = &weights.links[vertex];
                if let [sole] = vertex_links.as_slice() {
                    locked.insert(sole.bone);
                }
                for link in vertex_links {
                    *bone_weights.entry(link.bone).or_insert(0.0) += link.weight;
                }
            }

            let mut least: Option<(usize, f64)> = None;
            for (&bone, &weight) in &bone_weights {
                if locked.contains(&bone) {
                    continue;
                }
                if least.is_none_or(|(_, least_weight)| weight <= least_weight) {
                    least = Some((bone, weight));
                }
            }
            let Some((least_bone, _)) = least else {
                return Err(ProcessingPartitionError::CapacityError(triangle_index));
            };

            for &vertex in &triangle {
                let vertex_links = &mut weights.links[vertex];
                let Some(position) = vertex_links.iter().position(|link| link.bone == least_bone) else {
                    continue;
                };
                weights.lost_weight = weights.lost_weight.max(vertex_links[position].weight);
                vertex_links.remove(position);

                let total: f64 = vertex_links.iter().map(|link| link.weight).sum();
                if total > FLOAT_TOLERANCE {
                    for link in vertex_links.iter_mut() {
                        link.weight /= total;
                    }
                }
            }
        }
    }
    Ok(())
}

/// Merges partition pairs with equal tags whose combined bone set stays
/// within the limit, repeating until a fixed point.
fn merge_partitions(partitions: &mut Vec<Partition>, max_bones: usize) {
    let mut merged = true;
    while merged {
        merged = false;
        let mut combined: Vec<Partition> = Vec::with_capacity(partitions.len());
        let mut absorbed = vec![false; partitions.len()];
        for first in 0..partitions.len() {
            if absorbed[first] {
                continue;
            }
            let mut partition = std::mem::take(&mut partitions[first]);
            absorbed[first] = true;
            for second in first + 1..partitions.len() {
                if absorbed[second] || partitions[second].body_part != partition.body_part {
                    continue;
                }
                let additional = partitions[second].bones.iter().filter(|bone| !partition.bones.contains(*bone)).count();
                if partition.bones.len() + additional <= max_bones {
                    let other = std::mem::take(&mut partitions[second]);
                    partition.bones.extend(other.bones);
                    partition.triangles.extend(other.triangles);
                    absorbed[second] = true;
                    merged = true;
                }
            }
            combined.push(partition);
        }
        *partitions = combined;
    }
}

/// Groups partitions so each group literally shares one bone list, minimizing
/// the number of distinct bone palettes uploaded together. Group members end
/// up adjacent in the partition list.
fn share_partition_bones(partitions: &mut Vec<Partition>, max_bones: usize) {
    verbose!("Maximizing shared bones.");
    let mut grouped: Vec<Partition> = Vec::with_capacity(partitions.len());
    while let Some(seed) = partitions.pop() {
        let mut shared_bones = seed.bones.clone();
        let mut shared: Vec<Partition> = vec![seed];

        let mut kept = Vec::with_capacity(partitions.len());
        for other in partitions.drain(..) {
            let additional = other.bones.iter().filter(|bone| !shared_bones.contains(*bone)).count();
            if shared_bones.len() + additional <= max_bones {
                shared_bones.extend(other.bones.iter().copied());
                shared.push(other);
            } else {
                kept.push(other);
            }
        }
        *partitions = kept;

        for partition in &mut shared {
            partition.bones = shared_bones.clone();
        }
        grouped.extend(shared);
    }
    *partitions = grouped;
}

/// Stably orders partitions by the caller's body part priority list; unlisted
/// parts are appended in first-seen order. With shared bone groups the sort
/// happens within each group, and whole groups are ordered by their first
/// member's priority.
fn sort_partitions(partitions: &mut Vec<Partition>, body_part_order: &[i32], bone_sharing: bool) {
    let mut order_map: IndexMap<i32, usize> = IndexMap::new();
    for &body_part in body_part_order {
        let next = order_map.len();
        order_map.entry(body_part).or_insert(next);
    }
    for partition in partitions.iter() {
        let next = order_map.len();
        order_map.entry(partition.body_part.unwrap_or(0)).or_insert(next);
    }

    if bone_sharing {
        // Find the runs of identical bone sets left by the sharing pass.
        let mut runs: Vec<(usize, usize)> = Vec::new();
        let mut start = 0;
        while start < partitions.len() {
            let mut end = start + 1;
            while end < partitions.len() && partitions[end].bones == partitions[start].bones {
                end += 1;
            }
            partitions[start..end].sort_by_key(|partition| order_map[&partition.body_part.unwrap_or(0)]);
            runs.push((start, end));
            start = end;
        }
        runs.sort_by_key(|&(run_start, _)| order_map[&partitions[run_start].body_part.unwrap_or(0)]);

        let mut taken: Vec<Option<Partition>> = partitions.drain(..).map(Some).collect();
        for (run_start, run_end) in runs {
            for index in run_start..run_end {
                partitions.push(taken[index].take().expect("Each Partition Belongs To Exactly One Run"));
            }
        }
    } else {
        partitions.sort_by_key(|partition| order_map[&partition.body_part.unwrap_or(0)]);
    }
}
