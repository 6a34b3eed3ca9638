use indexmap::IndexSet;
use thiserror::Error as ThisError;

use crate::{
    mesh::{BoneLink, SkeletalMesh},
    process::{MAX_PARTITION_INDICES, PartitionSettings, SkinPartitionBlock, VERTEX_CACHE_SIZE, partition::Partition},
    verbose,
};

#[derive(Debug, ThisError)]
pub enum ProcessingEncodeError {
    #[error("Partition Has Too Many Vertices For 16-Bit Indices: {0}")]
    VertexOverflow(usize),
    #[error("Partition Has Too Many Triangles For 16-Bit Indices: {0}")]
    TriangleOverflow(usize),
    #[error("Padding Bones Requires Equal Bones Per Partition And Bones Per Vertex Limits")]
    PaddingMismatch,
}

/// Builds the final block for one partition: remapped vertices, fixed-width
/// weight and bone index rows, and either a triangle list or strips.
pub fn encode_partition(
    mesh: &SkeletalMesh,
    links: &[Vec<BoneLink>],
    partition: &Partition,
    settings: &PartitionSettings,
) -> Result<SkinPartitionBlock, ProcessingEncodeError> {
    let mut triangles: Vec<[usize; 3]> = partition.triangles.iter().map(|&index| mesh.triangles[index]).collect();
    if settings.optimize_vertex_cache {
        triangles = cache_optimized_triangles(&triangles, mesh.vertices.len());
    }

    let strips = if settings.stripify {
        let strips = stable_stripify(&triangles);
        verbose!("Stripified {} triangles into {} strips.", triangles.len(), strips.len());
        if settings.stitch_strips && strips.len() > 1 {
            vec![stitch_strips(&strips)]
        } else {
            strips
        }
    } else {
        Vec::new()
    };

    // Partition-local vertex list in first-encounter order; the primitive
    // order decides the encounter order.
    let mut vertex_map: IndexSet<usize> = IndexSet::new();
    if settings.stripify {
        for strip in &strips {
            vertex_map.extend(strip.iter().copied());
        }
    } else {
        for triangle in &triangles {
            vertex_map.extend(triangle.iter().copied());
        }
    }

    if vertex_map.len() > MAX_PARTITION_INDICES {
        return Err(ProcessingEncodeError::VertexOverflow(vertex_map.len()));
    }
    let num_triangles = if settings.stripify {
        strips.iter().map(|strip| strip.len() - 2).sum()
    } else {
        triangles.len()
    };
    if num_triangles > MAX_PARTITION_INDICES {
        return Err(ProcessingEncodeError::TriangleOverflow(num_triangles));
    }

    // Global bone list, ascending; padded with the dummy bone 0 if requested.
    let mut bones: Vec<usize> = partition.bones.iter().copied().collect();
    bones.sort_unstable();
    let num_bones = if settings.pad_bones { settings.max_bones_per_partition } else { bones.len() };
    debug_assert!(bones.len() <= num_bones, "Partition Bone Set Exceeds The Partition Limit!");
    let mut bone_slots: Vec<u32> = bones.iter().map(|&bone| bone as u32).collect();
    bone_slots.resize(num_bones, 0);

    let columns = settings.max_bones_per_vertex;
    let mut vertex_weights = Vec::with_capacity(vertex_map.len());
    let mut bone_indices = Vec::with_capacity(vertex_map.len());
    for &vertex in &vertex_map {
        let vertex_links = &links[vertex];
        debug_assert!(!vertex_links.is_empty() && vertex_links.len() <= columns);

        let mut weight_row = vec![0.0_f32; columns];
        let mut index_row = vec![0_u8; columns];
        let mut used = vec![false; num_bones];
        for (slot, link) in vertex_links.iter().enumerate() {
            let local = bones.iter().position(|&bone| bone == link.bone).expect("Partition Bones Should Cover Its Vertices");
            weight_row[slot] = link.weight as f32;
            index_row[slot] = local as u8;
            used[local] = true;
        }

        if settings.pad_bones {
            // Unused slots still need unique bone indices; hand out the
            // spare local indices in ascending order.
            let mut spare = (0..num_bones).filter(|&index| !used[index]);
            for slot in index_row.iter_mut().skip(vertex_links.len()) {
                *slot = spare.next().expect("Padded Partitions Have A Spare Bone Per Unused Slot") as u8;
            }
        }

        // Final slot order: by bone index when padded, largest weight first
        // otherwise.
        let mut row: Vec<(u8, f32)> = index_row.iter().copied().zip(weight_row.iter().copied()).collect();
        if settings.pad_bones {
            row.sort_by_key(|&(bone, _)| bone);
        } else {
            row.sort_by(|from, to| to.1.partial_cmp(&from.1).unwrap_or(std::cmp::Ordering::Less));
        }
        for (slot, (bone, weight)) in row.into_iter().enumerate() {
            index_row[slot] = bone;
            weight_row[slot] = weight;
        }

        vertex_weights.push(weight_row);
        bone_indices.push(index_row);
    }

    let local = |vertex: usize| vertex_map.get_index_of(&vertex).expect("Mapped Vertices Cover All Primitives") as u16;
    let (block_triangles, block_strips) = if settings.stripify {
        let strips = strips.iter().map(|strip| strip.iter().map(|&vertex| local(vertex)).collect()).collect();
        (Vec::new(), strips)
    } else {
        let triangles = triangles
            .iter()
            .map(|triangle| [local(triangle[0]), local(triangle[1]), local(triangle[2])])
            .collect();
        (triangles, Vec::new())
    };

    Ok(SkinPartitionBlock {
        bones: bone_slots,
        num_weights_per_vertex: columns,
        vertex_map: vertex_map.iter().map(|&vertex| vertex as u16).collect(),
        vertex_weights,
        bone_indices,
        triangles: block_triangles,
        strips: block_strips,
        has_vertex_map: true,
        has_vertex_weights: true,
        has_bone_indices: true,
        has_faces: true,
    })
}

/// Reorders triangles to minimize post-transform vertex cache misses.
///
/// Translation of
/// https://github.com/zeux/meshoptimizer/blob/73583c335e541c139821d0de2bf5f12960a04941/src/vcacheoptimizer.cpp#L169
pub fn cache_optimized_triangles(triangles: &[[usize; 3]], vertex_count: usize) -> Vec<[usize; 3]> {
    if triangles.is_empty() {
        return Vec::new();
    }

    let triangle_count = triangles.len();
    let index_count = triangle_count * 3;

    struct TriangleAdjacency {
        counts: Vec<usize>,
        offsets: Vec<usize>,
        data: Vec<usize>,
    }

    let mut adjacency = TriangleAdjacency {
        counts: vec![0; vertex_count],
        offsets: vec![0; vertex_count],
        data: vec![0; index_count],
    };

    for triangle in triangles {
        for &vertex_index in triangle {
            adjacency.counts[vertex_index] += 1;
        }
    }

    let mut offset = 0;
    for vertex_index in 0..vertex_count {
        adjacency.offsets[vertex_index] = offset;
        offset += adjacency.counts[vertex_index];
    }

    for (triangle_index, triangle) in triangles.iter().enumerate() {
        for &index in triangle {
            adjacency.data[adjacency.offsets[index]] = triangle_index;
            adjacency.offsets[index] += 1;
        }
    }

    for vertex_index in 0..vertex_count {
        adjacency.offsets[vertex_index] -= adjacency.counts[vertex_index];
    }

    const VALENCE_SIZE: usize = 8;
    const CACHE_SCORES: [f64; VERTEX_CACHE_SIZE + 1] = [
        0.0, 0.779, 0.791, 0.789, 0.981, 0.843, 0.726, 0.847, 0.882, 0.867, 0.799, 0.642, 0.613, 0.600, 0.568, 0.372, 0.234,
    ];
    const VALENCE_SCORES: [f64; VALENCE_SIZE + 1] = [0.0, 0.995, 0.713, 0.450, 0.404, 0.059, 0.005, 0.147, 0.006];

    let mut vertex_scores = vec![0.0; vertex_count];
    for vertex_index in 0..vertex_count {
        vertex_scores[vertex_index] = VALENCE_SCORES[adjacency.counts[vertex_index].min(VALENCE_SIZE)]
    }

    let mut triangle_scores = vec![0.0; triangle_count];
    for (triangle_index, triangle) in triangles.iter().enumerate() {
        for &index in triangle {
            triangle_scores[triangle_index] += vertex_scores[index];
        }
    }

    let mut triangle_emitted = vec![false; triangle_count];
    let mut destination = Vec::with_capacity(triangle_count);

    let mut cache = [0; VERTEX_CACHE_SIZE + 4];
    let mut cache_count = 0;

    let mut current_triangle_index = 0;
    let mut input_cursor = 1;

    loop {
        let current_triangle = triangles[current_triangle_index];
        destination.push(current_triangle);

        triangle_emitted[current_triangle_index] = true;
        triangle_scores[current_triangle_index] = 0.0;

        let mut cache_write = 0;
        let mut cache_new = [0; VERTEX_CACHE_SIZE + 4];
        cache_new[cache_write] = current_triangle[0];
        cache_write += 1;
        cache_new[cache_write] = current_triangle[1];
        cache_write += 1;
        cache_new[cache_write] = current_triangle[2];
        cache_write += 1;

        for &cached_index in cache.iter().take(cache_count) {
            cache_new[cache_write] = cached_index;
            if cached_index != current_triangle[0] && cached_index != current_triangle[1] && cached_index != current_triangle[2] {
                cache_write += 1;
            }
        }

        cache = cache_new;
        cache_count = cache_write.min(VERTEX_CACHE_SIZE);

        for vertex_index in current_triangle {
            let neighbors_start = adjacency.offsets[vertex_index];
            let neighbors_end = neighbors_start + adjacency.counts[vertex_index];
            let neighbor_last = adjacency.data[neighbors_end - 1];
            let neighbors = &mut adjacency.data[neighbors_start..neighbors_end];
            for neighbor_triangle in neighbors {
                if *neighbor_triangle == current_triangle_index {
                    *neighbor_triangle = neighbor_last;
                    adjacency.counts[vertex_index] -= 1;
                    break;
                }
            }
        }

        let mut best_triangle = None;
        let mut best_score = 0.0;

        for (cache_index, &cached_index) in cache.iter().take(cache_write).enumerate() {
            if adjacency.counts[cached_index] == 0 {
                continue;
            }

            let cache_position = if cache_index < VERTEX_CACHE_SIZE { cache_index + 1 } else { 0 };
            let score = CACHE_SCORES[cache_position] + VALENCE_SCORES[adjacency.counts[cached_index].min(VALENCE_SIZE)];
            let score_difference = score - vertex_scores[cached_index];

            vertex_scores[cached_index] = score;

            let neighbors_start = adjacency.offsets[cached_index];
            let neighbors_end = neighbors_start + adjacency.counts[cached_index];
            let neighbors = &adjacency.data[neighbors_start..neighbors_end];
            for &neighbor in neighbors {
                let neighbor_score = triangle_scores[neighbor] + score_difference;

                if best_score < neighbor_score {
                    best_triangle = Some(neighbor);
                    best_score = neighbor_score;
                }

                triangle_scores[neighbor] = neighbor_score;
            }
        }

        if best_triangle.is_none() {
            while input_cursor < triangle_count {
                if !triangle_emitted[input_cursor] {
                    best_triangle = Some(input_cursor);
                    break;
                }
                input_cursor += 1;
            }
        }

        if let Some(next_triangle) = best_triangle {
            current_triangle_index = next_triangle;
            continue;
        }

        break;
    }

    destination
}

/// Builds triangle strips without reordering triangles: a strip only keeps
/// growing while the next triangle in the list continues it.
pub fn stable_stripify(triangles: &[[usize; 3]]) -> Vec<Vec<usize>> {
    let mut strips: Vec<Vec<usize>> = Vec::new();
    let mut strip: Vec<usize> = Vec::new();

    for triangle in triangles {
        if strip.is_empty() {
            strip.extend(triangle);
            continue;
        }

        if strip.len() == 3 {
            // A lone starting triangle can still rotate to meet the newcomer.
            let rotations = [
                [strip[0], strip[1], strip[2]],
                [strip[1], strip[2], strip[0]],
                [strip[2], strip[0], strip[1]],
            ];
            let extension = rotations
                .iter()
                .find_map(|rotation| strip_extension(rotation[1], rotation[2], triangle, 1).map(|vertex| (*rotation, vertex)));
            if let Some((rotation, vertex)) = extension {
                strip = rotation.to_vec();
                strip.push(vertex);
                continue;
            }
        } else {
            let position = strip.len() - 2;
            let from = strip[strip.len() - 2];
            let to = strip[strip.len() - 1];
            if let Some(vertex) = strip_extension(from, to, triangle, position) {
                strip.push(vertex);
                continue;
            }
        }

        strips.push(std::mem::replace(&mut strip, triangle.to_vec()));
    }

    if !strip.is_empty() {
        strips.push(strip);
    }
    strips
}

/// Returns the third vertex if `triangle` continues a strip whose trailing
/// edge is `(from, to)` at triangle `position`. Odd positions read the edge
/// reversed, since strip winding alternates.
fn strip_extension(from: usize, to: usize, triangle: &[usize; 3], position: usize) -> Option<usize> {
    let (edge_start, edge_end) = if position % 2 == 0 { (from, to) } else { (to, from) };
    for rotation in 0..3 {
        if triangle[rotation] == edge_start && triangle[(rotation + 1) % 3] == edge_end {
            return Some(triangle[(rotation + 2) % 3]);
        }
    }
    None
}

/// Joins strips into one long strip bridged by degenerate triangles,
/// duplicating vertices so every original triangle keeps its winding.
pub fn stitch_strips(strips: &[Vec<usize>]) -> Vec<usize> {
    let mut stitched: Vec<usize> = Vec::new();
    for strip in strips {
        if strip.is_empty() {
            continue;
        }
        if stitched.is_empty() {
            stitched.extend(strip);
            continue;
        }

        let last = *stitched.last().expect("Stitched Strip Is Not Empty");
        stitched.push(last);
        stitched.push(strip[0]);
        if stitched.len() % 2 != 0 {
            // The strip's first triangle must land on an even position.
            stitched.push(strip[0]);
        }
        stitched.extend(strip);
    }
    stitched
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::partition::partition_triangles;
    use crate::process::weights::gather_weights;
    use crate::utilities::mathematics::Vector3;

    /// The triangles a strip encodes, unwound and with degenerates dropped.
    fn unwind_strip(strip: &[usize]) -> Vec<[usize; 3]> {
        let mut triangles = Vec::new();
        for position in 0..strip.len() - 2 {
            let (a, b, c) = (strip[position], strip[position + 1], strip[position + 2]);
            if a == b || b == c || a == c {
                continue;
            }
            triangles.push(if position % 2 == 0 { [a, b, c] } else { [b, a, c] });
        }
        triangles
    }

    fn normalized(mut triangle: [usize; 3]) -> [usize; 3] {
        // Rotate the smallest index first; winding is preserved.
        while triangle[0] != *triangle.iter().min().unwrap() {
            triangle.rotate_left(1);
        }
        triangle
    }

    #[test]
    fn stripify_joins_adjacent_triangles() {
        let strips = stable_stripify(&[[0, 1, 2], [2, 1, 3]]);
        assert_eq!(strips, vec![vec![0, 1, 2, 3]]);
    }

    #[test]
    fn stripify_breaks_on_disconnected_triangles() {
        let strips = stable_stripify(&[[0, 1, 2], [3, 4, 5]]);
        assert_eq!(strips.len(), 2);
    }

    #[test]
    fn strips_preserve_triangles_and_winding() {
        let triangles = [[0, 1, 2], [2, 1, 3], [2, 3, 4], [5, 6, 7]];
        let strips = stable_stripify(&triangles);
        let mut unwound: Vec<[usize; 3]> = strips.iter().flat_map(|strip| unwind_strip(strip)).collect();
        let mut expected: Vec<[usize; 3]> = triangles.iter().map(|&t| normalized(t)).collect();
        unwound = unwound.into_iter().map(normalized).collect();
        unwound.sort();
        expected.sort();
        assert_eq!(unwound, expected);
    }

    #[test]
    fn stitching_keeps_winding_across_strips() {
        let triangles = [[0, 1, 2], [3, 4, 5], [5, 4, 6]];
        let strips = stable_stripify(&triangles);
        assert_eq!(strips.len(), 2);
        let stitched = stitch_strips(&strips);
        let unwound: Vec<[usize; 3]> = unwind_strip(&stitched).into_iter().map(normalized).collect();
        let expected: Vec<[usize; 3]> = triangles.iter().map(|&t| normalized(t)).collect();
        assert_eq!(unwound, expected);
    }

    #[test]
    fn cache_optimization_permutes_without_loss() {
        let triangles = vec![[0, 1, 2], [2, 1, 3], [4, 5, 6], [2, 3, 4], [6, 5, 7]];
        let mut optimized = cache_optimized_triangles(&triangles, 8);
        assert_eq!(optimized.len(), triangles.len());
        optimized.sort();
        let mut expected = triangles.clone();
        expected.sort();
        assert_eq!(optimized, expected);
    }

    /// A one-partition mesh over the given bones, every vertex fully weighted
    /// to one bone.
    fn encode_single(settings: &PartitionSettings, vertex_bones: Vec<usize>, triangles: Vec<[usize; 3]>) -> SkinPartitionBlock {
        let mesh = SkeletalMesh {
            vertices: vec![Vector3::ZERO; vertex_bones.len()],
            triangles,
            links: vertex_bones.iter().map(|&bone| vec![BoneLink { bone, weight: 1.0 }]).collect(),
            ..Default::default()
        };
        let mut weights = gather_weights(&mesh, settings.max_bones_per_vertex);
        let partitions = partition_triangles(&mesh, &mut weights, settings).unwrap();
        assert_eq!(partitions.len(), 1);
        encode_partition(&mesh, &weights.links, &partitions[0], settings).unwrap()
    }

    #[test]
    fn vertex_map_is_in_first_encounter_order() {
        let settings = PartitionSettings {
            optimize_vertex_cache: false,
            ..Default::default()
        };
        let block = encode_single(&settings, vec![0, 0, 0, 0], vec![[2, 1, 3], [3, 1, 0]]);
        assert_eq!(block.vertex_map, vec![2, 1, 3, 0]);
        assert_eq!(block.triangles, vec![[0, 1, 2], [2, 1, 3]]);
        assert!(block.strips.is_empty());
        assert!(block.has_vertex_map && block.has_vertex_weights && block.has_bone_indices && block.has_faces);
    }

    #[test]
    fn default_policy_zeroes_unused_slots() {
        let settings = PartitionSettings {
            optimize_vertex_cache: false,
            ..Default::default()
        };
        let block = encode_single(&settings, vec![1, 2, 1], vec![[0, 1, 2]]);
        assert_eq!(block.bones, vec![1, 2]);
        assert_eq!(block.num_weights_per_vertex, 4);
        for (weights, indices) in block.vertex_weights.iter().zip(&block.bone_indices) {
            assert_eq!(weights.len(), 4);
            // One real influence, the rest dummy.
            assert_eq!(weights[0], 1.0);
            assert!(weights[1..].iter().all(|&weight| weight == 0.0));
            assert!(indices[1..].iter().all(|&index| index == 0));
        }
    }

    #[test]
    fn padded_policy_fills_unique_sorted_indices() {
        let settings = PartitionSettings {
            pad_bones: true,
            optimize_vertex_cache: false,
            ..Default::default()
        };
        let block = encode_single(&settings, vec![1, 2, 1], vec![[0, 1, 2]]);
        // Bone list padded to the partition limit with the dummy bone.
        assert_eq!(block.bones, vec![1, 2, 0, 0]);
        for indices in &block.bone_indices {
            let mut sorted = indices.clone();
            sorted.sort_unstable();
            assert_eq!(&sorted, indices, "Padded Rows Are Sorted By Bone Index");
            sorted.dedup();
            assert_eq!(sorted.len(), indices.len(), "Padded Rows Are Unique");
        }
    }

    #[test]
    fn stripified_block_has_no_triangle_list() {
        let settings = PartitionSettings {
            stripify: true,
            optimize_vertex_cache: false,
            ..Default::default()
        };
        let block = encode_single(&settings, vec![0, 0, 0, 0], vec![[0, 1, 2], [2, 1, 3]]);
        assert!(block.triangles.is_empty());
        assert_eq!(block.strips, vec![vec![0, 1, 2, 3]]);
        assert_eq!(block.num_triangles(), 2);
    }

    #[test]
    fn oversized_partitions_overflow() {
        let triangle_count = 22_000;
        let triangles: Vec<[usize; 3]> = (0..triangle_count).map(|i| [3 * i, 3 * i + 1, 3 * i + 2]).collect();
        let settings = PartitionSettings {
            optimize_vertex_cache: false,
            ..Default::default()
        };
        let mesh = SkeletalMesh {
            vertices: vec![Vector3::ZERO; triangle_count * 3],
            triangles: triangles.clone(),
            links: vec![vec![BoneLink { bone: 0, weight: 1.0 }]; triangle_count * 3],
            ..Default::default()
        };
        let weights = gather_weights(&mesh, settings.max_bones_per_vertex);
        let partition = Partition {
            bones: [0].into_iter().collect(),
            triangles: (0..triangle_count).collect(),
            body_part: Some(0),
        };
        let error = encode_partition(&mesh, &weights.links, &partition, &settings).unwrap_err();
        assert!(matches!(error, ProcessingEncodeError::VertexOverflow(_)));
    }
}
