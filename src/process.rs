use bitflags::bitflags;
use thiserror::Error as ThisError;

use crate::{
    debug, info,
    mesh::SkeletalMesh,
    utilities::mathematics::{Matrix3, Vector3},
    warn,
};

pub mod encode;
pub mod partition;
pub mod transforms;
pub mod weights;

use encode::{ProcessingEncodeError, encode_partition};
use partition::{Partition, ProcessingPartitionError, partition_triangles};
use transforms::{ProcessingTransformError, resolve_bind_poses};
use weights::gather_weights;

/// Everything the binary writer needs to emit NiSkinData and NiSkinPartition
/// blocks for one mesh.
#[derive(Debug, Default)]
pub struct ProcessedSkin {
    /// The overall skin transform, the inverse of the geometry's transform
    /// relative to the skeleton root.
    pub skin_transform: BindPose,
    /// Per-bone inverse bind transforms relative to the skeleton root,
    /// corrected for the geometry transform. Parallel to the skeleton bones.
    pub bind_poses: Vec<BindPose>,
    /// Finalized partition records, in output order.
    pub partitions: Vec<SkinPartitionBlock>,
    /// Dismemberment records, parallel to [`partitions`][Self::partitions].
    /// Only meaningful for target formats with per-body-part dismemberment.
    pub body_parts: Vec<BodyPartRecord>,
    /// The largest weight fraction discarded anywhere while capping bone
    /// influences. The caller decides whether this is fatal.
    pub lost_weight: f64,
}

/// A transform decomposed into the uniform scale, rotation and translation
/// the NIF format stores per node.
#[derive(Clone, Copy, Debug)]
pub struct BindPose {
    pub scale: f64,
    pub rotation: Matrix3,
    pub translation: Vector3,
}

impl Default for BindPose {
    fn default() -> Self {
        Self {
            scale: 1.0,
            rotation: Matrix3::IDENTITY,
            translation: Vector3::ZERO,
        }
    }
}

/// One finalized skin partition, mirroring the NiSkinPartition block layout.
#[derive(Debug, Default)]
pub struct SkinPartitionBlock {
    /// Global bone indices, ascending. Padded with the dummy bone 0 up to the
    /// partition limit when bone padding is enabled.
    pub bones: Vec<u32>,
    /// Number of weight columns per vertex. Always the bones-per-vertex limit.
    pub num_weights_per_vertex: usize,
    /// Global vertex indices touched by this partition, in first-encounter
    /// order of its triangles or strips.
    pub vertex_map: Vec<u16>,
    /// Weight rows, one per mapped vertex, unused columns zero.
    pub vertex_weights: Vec<Vec<f32>>,
    /// Partition-local bone index rows, parallel to the weight rows.
    pub bone_indices: Vec<Vec<u8>>,
    /// Triangles in partition-local indices. Empty when stripified.
    pub triangles: Vec<[u16; 3]>,
    /// Triangle strips in partition-local indices. Empty when not stripified.
    pub strips: Vec<Vec<u16>>,
    pub has_vertex_map: bool,
    pub has_vertex_weights: bool,
    pub has_bone_indices: bool,
    pub has_faces: bool,
}

impl SkinPartitionBlock {
    /// The number of triangles this partition draws, counting strip bridges.
    pub fn num_triangles(&self) -> usize {
        if self.strips.is_empty() {
            self.triangles.len()
        } else {
            self.strips.iter().map(|strip| strip.len() - 2).sum()
        }
    }
}

bitflags! {
    /// Per-partition dismemberment flags as stored by BSDismemberSkinInstance.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct PartitionFlags: u16 {
        const EDITOR_VISIBLE = 0x0001;
        const START_NET_BONESET = 0x0100;
    }
}

/// Dismemberment data for one partition.
#[derive(Debug, Default)]
pub struct BodyPartRecord {
    pub body_part: i32,
    pub flags: PartitionFlags,
}

/// Caller-selected limits and policies for one export.
#[derive(Clone, Debug)]
pub struct PartitionSettings {
    /// Maximum size of a partition's bone set.
    pub max_bones_per_partition: usize,
    /// Maximum bone influences kept per vertex. Also the fixed number of
    /// weight columns in the output.
    pub max_bones_per_vertex: usize,
    /// Emit triangle strips instead of a triangle list.
    pub stripify: bool,
    /// Stitch all strips of a partition into one with degenerate bridges.
    pub stitch_strips: bool,
    /// Force every partition's bone count to the partition limit and keep
    /// per-vertex bone indices unique and sorted, unused slots included.
    /// Requires the two bone limits to be equal.
    pub pad_bones: bool,
    /// Group partitions so they literally share one bone list, minimizing
    /// distinct bone palettes.
    pub maximize_bone_sharing: bool,
    /// Body part numbers in the order their partitions should appear.
    /// Unlisted parts are appended in first-seen order.
    pub body_part_order: Vec<i32>,
    /// Reorder each partition's triangles for vertex cache locality before
    /// encoding.
    pub optimize_vertex_cache: bool,
    /// Lost weight above this is logged as a warning.
    pub weight_loss_threshold: f64,
}

impl Default for PartitionSettings {
    fn default() -> Self {
        Self {
            max_bones_per_partition: 4,
            max_bones_per_vertex: 4,
            stripify: false,
            stitch_strips: false,
            pad_bones: false,
            maximize_bone_sharing: false,
            body_part_order: Vec::new(),
            optimize_vertex_cache: true,
            weight_loss_threshold: 0.005,
        }
    }
}

#[derive(Debug, ThisError)]
pub enum ProcessingSkinError {
    #[error("Failed To Resolve Bind Transforms: {0}")]
    ProcessingTransformError(#[from] ProcessingTransformError),
    #[error("Failed To Partition Triangles: {0}")]
    ProcessingPartitionError(#[from] ProcessingPartitionError),
    #[error("Failed To Encode Skin Partitions: {0}")]
    ProcessingEncodeError(#[from] ProcessingEncodeError),
}

/// Size of the post-transform vertex cache the triangle reordering targets.
pub const VERTEX_CACHE_SIZE: usize = 16;

/// Largest vertex or triangle count a partition may address with 16-bit indices.
pub const MAX_PARTITION_INDICES: usize = u16::MAX as usize;

/// The tolerance for floating point numbers until they are considered equal.
pub const FLOAT_TOLERANCE: f64 = f32::EPSILON as f64;

/// Runs the full pipeline over one mesh snapshot: bind pose resolution,
/// weight reduction, partitioning and per-partition encoding.
pub fn process_skin(mesh: &SkeletalMesh, settings: &PartitionSettings) -> Result<ProcessedSkin, ProcessingSkinError> {
    debug_assert_eq!(mesh.links.len(), mesh.vertices.len(), "Mesh Links Must Be Parallel To Vertices!");
    debug_assert!(
        mesh.triangles.iter().all(|triangle| triangle.iter().all(|&vertex| vertex < mesh.vertices.len())),
        "Triangle Indices Must Be In Range!"
    );
    debug_assert!(
        mesh.body_parts.as_ref().is_none_or(|parts| parts.len() == mesh.triangles.len()),
        "Body Part Tags Must Be Parallel To Triangles!"
    );

    if settings.pad_bones && settings.max_bones_per_partition != settings.max_bones_per_vertex {
        return Err(ProcessingEncodeError::PaddingMismatch.into());
    }
    if mesh.vertices.len() > MAX_PARTITION_INDICES {
        return Err(ProcessingEncodeError::VertexOverflow(mesh.vertices.len()).into());
    }

    debug!("Resolving bind poses for \"{}\".", mesh.name);
    let (skin_transform, bind_poses) = resolve_bind_poses(mesh)?;

    debug!("Gathering vertex weights.");
    let mut weights = gather_weights(mesh, settings.max_bones_per_vertex);

    debug!("Partitioning triangles.");
    let partitions = partition_triangles(mesh, &mut weights, settings)?;
    info!("Skin of \"{}\" has {} partitions.", mesh.name, partitions.len());

    let body_parts = body_part_records(&partitions);

    debug!("Encoding skin partitions.");
    let mut blocks = Vec::with_capacity(partitions.len());
    for partition in &partitions {
        blocks.push(encode_partition(mesh, &weights.links, partition, settings)?);
    }

    if weights.lost_weight > settings.weight_loss_threshold {
        warn!(
            "Lost {:.6} in vertex weights while creating a skin partition for \"{}\".",
            weights.lost_weight, mesh.name
        );
    }

    Ok(ProcessedSkin {
        skin_transform,
        bind_poses,
        partitions: blocks,
        body_parts,
        lost_weight: weights.lost_weight,
    })
}

/// Builds the dismemberment records: a partition starts a new bone palette
/// exactly when it does not share its bone set with its predecessor, and cap
/// body parts are invisible in the editor.
fn body_part_records(partitions: &[Partition]) -> Vec<BodyPartRecord> {
    let mut records = Vec::with_capacity(partitions.len());
    let mut previous: Option<&Partition> = None;
    for partition in partitions {
        let body_part = partition.body_part.unwrap_or(0);
        let mut flags = PartitionFlags::empty();
        if previous.is_none_or(|last| last.bones != partition.bones) {
            flags.insert(PartitionFlags::START_NET_BONESET);
        }
        if body_part < 100 || body_part >= 1000 {
            flags.insert(PartitionFlags::EDITOR_VISIBLE);
        }
        records.push(BodyPartRecord { body_part, flags });
        previous = Some(partition);
    }
    records
}
