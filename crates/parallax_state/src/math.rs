//! # View Math
//!
//! The camera view matrix derived from each player's camera block, and
//! the sphere-vs-frustum test the scheduler uses to slow the cadence of
//! entities the client is not looking at.

use glam::{Mat4, Quat, Vec3, Vec4, Vec4Swizzles};
use once_cell::sync::Lazy;

/// Clip planes of the fixed replication projection (90° fov, 4:3,
/// 0.1..1000), extracted once.
struct ViewClips {
    near: Vec4,
    far: Vec4,
    top: Vec4,
    bottom: Vec4,
    left: Vec4,
    right: Vec4,
}

impl ViewClips {
    fn new(matrix: Mat4) -> Self {
        let tp = matrix.transpose();

        Self {
            left: tp * Vec4::new(1.0, 0.0, 0.0, 1.0),
            right: tp * Vec4::new(-1.0, 0.0, 0.0, 1.0),
            bottom: tp * Vec4::new(0.0, 1.0, 0.0, 1.0),
            top: tp * Vec4::new(0.0, -1.0, 0.0, 1.0),
            near: tp * Vec4::new(0.0, 0.0, 1.0, 1.0),
            far: tp * Vec4::new(0.0, 0.0, -1.0, 1.0),
        }
    }
}

static PROJECTION_CLIPS: Lazy<ViewClips> = Lazy::new(|| {
    ViewClips::new(Mat4::perspective_rh_gl(
        std::f32::consts::FRAC_PI_2,
        4.0 / 3.0,
        0.1,
        1000.0,
    ))
});

/// Tests a sphere against the replication frustum in view space.
#[must_use]
pub fn is_in_frustum(pos: Vec3, radius: f32, view_matrix: &Mat4) -> bool {
    let view_coords = *view_matrix * pos.extend(1.0);

    let test_plane = |plane: Vec4| {
        let m = view_coords.xyz() * plane.xyz();
        m.x + m.y + m.z + plane.w + radius >= 0.0
    };

    let clips = &*PROJECTION_CLIPS;

    test_plane(clips.near)
        && test_plane(clips.bottom)
        && test_plane(clips.top)
        && test_plane(clips.left)
        && test_plane(clips.right)
        && test_plane(clips.far)
}

/// Builds a view matrix from a camera translation and the two synced
/// rotation angles (pitch around X, heading around Z).
#[must_use]
pub fn build_view_matrix(translation: Vec3, camera_x: f32, camera_z: f32) -> Mat4 {
    let rotation = Quat::from_euler(glam::EulerRot::XYZ, camera_x, 0.0, camera_z);
    (Mat4::from_translation(translation) * Mat4::from_quat(rotation)).inverse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_camera_sees_ahead() {
        // camera at origin looking down -Z (identity view)
        let view = Mat4::IDENTITY;

        assert!(is_in_frustum(Vec3::new(0.0, 0.0, -10.0), 1.0, &view));
        assert!(!is_in_frustum(Vec3::new(0.0, 0.0, 10.0), 1.0, &view));
    }

    #[test]
    fn test_radius_recovers_edge_objects() {
        let view = Mat4::IDENTITY;

        // just behind the near plane: a zero radius misses, a fat one hits
        let pos = Vec3::new(0.0, 0.0, 0.05);
        assert!(!is_in_frustum(pos, 0.0, &view));
        assert!(is_in_frustum(pos, 15.0, &view));
    }

    #[test]
    fn test_view_matrix_recenters_camera() {
        let cam_pos = Vec3::new(10.0, 20.0, 30.0);
        let view = build_view_matrix(cam_pos, 0.0, 0.0);

        let at_camera = view * cam_pos.extend(1.0);
        assert!(at_camera.xyz().length() < 1e-4);
    }
}
