use thiserror::Error as ThisError;

use crate::{
    mesh::{SkeletalMesh, Skeleton},
    process::BindPose,
    utilities::mathematics::{Matrix3, Matrix4, Vector3},
};

/// Axis scales may differ by this much before a transform is rejected as
/// non-uniform. Rather large to accommodate sloppy source scenes.
pub const UNIFORM_SCALE_TOLERANCE: f64 = 0.02;

#[derive(Debug, ThisError)]
pub enum ProcessingTransformError {
    #[error("\"{0}\" Has Non-Uniform Scale ({1:.4}, {2:.4}, {3:.4}); Apply Scale Before Exporting")]
    NonUniformScale(String, f64, f64, f64),
}

/// Decomposes an affine transform into uniform scale, rotation and translation.
///
/// The per-axis scales are the square roots of the diagonal of `R·Rᵗ`; the
/// NIF format only stores one scale per node, so axes that disagree beyond
/// [`UNIFORM_SCALE_TOLERANCE`] reject the transform. A negative determinant
/// flips the sign of the scale. `name` identifies the offending bone or
/// object in the error.
pub fn decompose_srt(name: &str, transform: &Matrix4) -> Result<(f64, Matrix3, Vector3), ProcessingTransformError> {
    let rotation_part = transform.matrix3;
    let gram = rotation_part * rotation_part.transpose();
    let axis_scales = Vector3::new(gram.x_axis.x.sqrt(), gram.y_axis.y.sqrt(), gram.z_axis.z.sqrt());

    if (axis_scales.x - axis_scales.y).abs() + (axis_scales.y - axis_scales.z).abs() > UNIFORM_SCALE_TOLERANCE {
        return Err(ProcessingTransformError::NonUniformScale(
            name.to_string(),
            axis_scales.x,
            axis_scales.y,
            axis_scales.z,
        ));
    }

    let mut scale = axis_scales.x;
    if rotation_part.determinant() < 0.0 {
        scale = -scale;
    }

    Ok((scale, rotation_part * (1.0 / scale), transform.translation))
}

/// Composes a bone's rest transform with its parent chain, terminating at the
/// named ancestor (exclusive) or the skeleton root.
///
/// Pure; recomputing is cheap enough that callers composing every bone should
/// prefer [`resolve_bind_poses`] which reuses parent results.
pub fn rest_pose(skeleton: &Skeleton, bone: usize, ancestor: Option<usize>) -> Matrix4 {
    if ancestor == Some(bone) {
        return Matrix4::IDENTITY;
    }

    let (_, bone_data) = skeleton.bones.get_index(bone).expect("Bone Index Should Be Valid");
    match bone_data.parent {
        Some(parent) if ancestor != Some(parent) => rest_pose(skeleton, parent, ancestor) * bone_data.rest,
        _ => bone_data.rest,
    }
}

/// Derives the decomposed skin transform and per-bone bind poses for a mesh.
///
/// NiSkinData stores the inverse of the geometry transform overall, and per
/// bone the inverse of its bind pose relative to the skeleton root corrected
/// for the geometry transform.
pub fn resolve_bind_poses(mesh: &SkeletalMesh) -> Result<(BindPose, Vec<BindPose>), ProcessingTransformError> {
    let skeleton = &mesh.skeleton;

    // Compose every bone's rest pose up to the skeleton root in one pass;
    // parents precede children in the arena.
    let mut root_transforms: Vec<Matrix4> = Vec::with_capacity(skeleton.bones.len());
    for (bone_index, bone) in skeleton.bones.values().enumerate() {
        let transform = match bone.parent {
            Some(parent) => {
                debug_assert!(parent < bone_index, "Parent Bones Must Precede Their Children!");
                root_transforms[parent] * bone.rest
            }
            None => bone.rest,
        };
        root_transforms.push(transform);
    }

    let geometry_inverse = mesh.transform.inverse();
    let (scale, rotation, translation) = decompose_srt(&mesh.name, &geometry_inverse)?;
    let skin_transform = BindPose { scale, rotation, translation };

    let mut bind_poses = Vec::with_capacity(skeleton.bones.len());
    for (bone_index, bone_name) in skeleton.bones.keys().enumerate() {
        let offset = root_transforms[bone_index].inverse() * mesh.transform;
        let (scale, rotation, translation) = decompose_srt(bone_name, &offset)?;
        bind_poses.push(BindPose { scale, rotation, translation });
    }

    Ok((skin_transform, bind_poses))
}
