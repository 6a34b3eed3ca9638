pub type Matrix3 = glam::DMat3;
pub type Matrix4 = glam::DAffine3;
pub type Vector3 = glam::DVec3;
