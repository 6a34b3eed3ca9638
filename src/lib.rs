//! Skin partitioning and bind pose composition for NIF export.
//!
//! The scene exporter hands this crate an immutable [`SkeletalMesh`] snapshot
//! (vertices, triangles, raw per-vertex bone weights and the bone hierarchy)
//! together with [`PartitionSettings`]. [`process_skin`] derives the bind pose
//! transforms the NiSkinData block stores for every bone and splits the
//! triangles into NiSkinPartition-shaped records that respect the hardware
//! limits on bones per partition and bones per vertex, optionally stripified
//! and reordered for vertex cache locality. Reading and writing the NIF
//! container itself is the binary writer's job, not ours.

pub mod mesh;
pub mod process;
pub mod utilities;

#[doc(hidden)]
pub use log;

pub use mesh::{Bone, BoneLink, SkeletalMesh, Skeleton};
pub use process::{
    BindPose, BodyPartRecord, PartitionFlags, PartitionSettings, ProcessedSkin, ProcessingSkinError, SkinPartitionBlock,
    process_skin,
};
