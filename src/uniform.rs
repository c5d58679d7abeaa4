//! Per-frame transforms for the vertex shader.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};

const ROTATION_TIME_SCALE: f32 = 0.1;

/// Per-image transforms read by the vertex shader at binding 0.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct UniformBufferObject {
    pub model: [[f32; 4]; 4],
    pub view: [[f32; 4]; 4],
    pub proj: [[f32; 4]; 4],
}

impl UniformBufferObject {
    /// Model spins about +Z at 9 degrees per second, seen from (2, 2, 2).
    pub fn at(elapsed_secs: f32, aspect: f32) -> Self {
        let time = elapsed_secs * ROTATION_TIME_SCALE;
        let model = Mat4::from_rotation_z(time * 90f32.to_radians());

        let view = Mat4::look_at_rh(Vec3::new(2.0, 2.0, 2.0), Vec3::ZERO, Vec3::Z);

        let mut proj = Mat4::perspective_rh(45f32.to_radians(), aspect, 0.1, 10.0);
        // Clip space Y points down.
        proj.y_axis.y *= -1.0;

        Self {
            model: model.to_cols_array_2d(),
            view: view.to_cols_array_2d(),
            proj: proj.to_cols_array_2d(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec4;

    fn mat(m: [[f32; 4]; 4]) -> Mat4 {
        Mat4::from_cols_array_2d(&m)
    }

    #[test]
    fn model_starts_at_identity() {
        let ubo = UniformBufferObject::at(0.0, 4.0 / 3.0);
        assert_eq!(mat(ubo.model), Mat4::IDENTITY);
    }

    #[test]
    fn model_quarter_turn_after_ten_seconds() {
        let ubo = UniformBufferObject::at(10.0, 1.0);
        let x = mat(ubo.model) * Vec4::new(1.0, 0.0, 0.0, 1.0);
        assert!((x.x).abs() < 1e-5);
        assert!((x.y - 1.0).abs() < 1e-5);
    }

    #[test]
    fn view_and_projection_ignore_time() {
        let a = UniformBufferObject::at(0.0, 1.5);
        let b = UniformBufferObject::at(12.5, 1.5);
        assert_eq!(a.view, b.view);
        assert_eq!(a.proj, b.proj);
        assert_ne!(a.model, b.model);
    }

    #[test]
    fn projection_flips_y() {
        let ubo = UniformBufferObject::at(0.0, 1.0);
        let reference = Mat4::perspective_rh(45f32.to_radians(), 1.0, 0.1, 10.0);
        assert_eq!(ubo.proj[1][1], -reference.y_axis.y);
    }

    #[test]
    fn origin_lands_inside_clip_volume() {
        let ubo = UniformBufferObject::at(3.0, 16.0 / 9.0);
        let clip = mat(ubo.proj) * mat(ubo.view) * mat(ubo.model) * Vec4::new(0.0, 0.0, 0.0, 1.0);
        let ndc = clip / clip.w;
        assert!(ndc.x.abs() < 1e-5 && ndc.y.abs() < 1e-5);
        assert!(ndc.z > 0.0 && ndc.z < 1.0);
    }

    #[test]
    fn layout_is_three_matrices() {
        assert_eq!(std::mem::size_of::<UniformBufferObject>(), 3 * 64);
    }
}
