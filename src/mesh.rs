use indexmap::IndexMap;

use crate::utilities::mathematics::{Matrix4, Vector3};

/// Snapshot of one skinned mesh as handed over by the scene exporter.
///
/// The engine never mutates a snapshot; weight reduction and partitioning
/// produce new derived structures.
#[derive(Debug, Default)]
pub struct SkeletalMesh {
    /// Name of the exported geometry, used in diagnostics.
    pub name: String,
    /// Vertex positions.
    pub vertices: Vec<Vector3>,
    /// Triangles as indices into [`vertices`][Self::vertices].
    ///
    /// Indices must be distinct and in range. Triangles with repeated indices
    /// are treated as degenerate and skipped.
    pub triangles: Vec<[usize; 3]>,
    /// Raw bone influences per vertex, parallel to [`vertices`][Self::vertices].
    ///
    /// Weights need not be normalized or capped; duplicate entries for the
    /// same bone are merged during processing.
    pub links: Vec<Vec<BoneLink>>,
    /// Body part tags per triangle, parallel to [`triangles`][Self::triangles].
    ///
    /// Triangles with different tags never share a partition. When [`None`]
    /// every triangle is tagged 0.
    pub body_parts: Option<Vec<i32>>,
    /// The bone hierarchy deforming this mesh.
    pub skeleton: Skeleton,
    /// The geometry's transform relative to the skeleton root.
    pub transform: Matrix4,
}

/// A single bone influence on a vertex.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoneLink {
    /// An index into the skeleton's bone list.
    pub bone: usize,
    pub weight: f64,
}

/// A flat arena of bones mapped by name.
///
/// Parents always precede their children, so a single forward pass can
/// compose world transforms.
#[derive(Debug, Default)]
pub struct Skeleton {
    pub bones: IndexMap<String, Bone>,
}

impl Skeleton {
    /// Returns the index of the first root bone, if any bones exist.
    pub fn root(&self) -> Option<usize> {
        self.bones.values().position(|bone| bone.parent.is_none())
    }
}

/// Data of a bone in a skeleton.
#[derive(Debug)]
pub struct Bone {
    /// An index to the skeleton that the bone is parented to.
    ///
    /// Is [`None`] when the bone is a root bone. Storing an index instead of
    /// a reference makes parent cycles unrepresentable.
    pub parent: Option<usize>,
    /// The rest transform relative to the parent.
    ///
    /// If [`parent`][Self::parent] is [`None`] then the transform is relative
    /// to the skeleton root.
    pub rest: Matrix4,
}
