use glam::Vec3;

/// Camera basis handed to the driver on every render step.
///
/// `right` and the re-orthogonalized `up` are derived from `direction` at
/// construction so the driver always receives an orthonormal frame.
#[derive(Clone, Copy, Debug)]
pub struct Camera {
    pub eye: Vec3,
    pub direction: Vec3,
    pub up: Vec3,
    pub right: Vec3,
    pub sensor_width: f32,
    pub sensor_height: f32,
    pub tmin: f32,
    pub tmax: f32,
}

impl Camera {
    pub fn new(
        eye: Vec3,
        direction: Vec3,
        up: Vec3,
        fov_degrees: f32,
        aspect_ratio: f32,
        tmin: f32,
        tmax: f32,
    ) -> Self {
        let direction = direction.normalize_or_zero();
        let right = direction.cross(up).normalize_or_zero();
        let up = right.cross(direction);

        let sensor_height = 2.0 * (fov_degrees.to_radians() / 2.0).tan();
        let sensor_width = sensor_height * aspect_ratio;

        Self {
            eye,
            direction,
            up,
            right,
            sensor_width,
            sensor_height,
            tmin,
            tmax,
        }
    }
}
