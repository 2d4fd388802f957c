//! Orientation Processor
//!
//! Fuses accelerometer and magnetometer readings into the 4x4 rotation matrix
//! streamed to the peer.

use std::time::Duration;

/// Standard gravity in m/s^2
pub const STANDARD_GRAVITY: f32 = 9.806_65;

/// Below this squared magnitude the accelerometer is considered in free fall
const FREE_FALL_GRAVITY_SQUARED: f32 = 0.01 * STANDARD_GRAVITY * STANDARD_GRAVITY;

/// Minimum magnitude of the east vector (gravity x geomagnetic)
const MIN_EAST_MAGNITUDE: f32 = 0.1;

/// Row-major 4x4 rotation matrix from device coordinates to world coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RotationMatrix(pub [f32; 16]);

impl RotationMatrix {
    pub const IDENTITY: Self = Self([
        1.0, 0.0, 0.0, 0.0, //
        0.0, 1.0, 0.0, 0.0, //
        0.0, 0.0, 1.0, 0.0, //
        0.0, 0.0, 0.0, 1.0,
    ]);

    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.0[row * 4 + col]
    }

    pub fn as_array(&self) -> &[f32; 16] {
        &self.0
    }

    /// Largest absolute element-wise difference to `other`.
    pub fn max_abs_diff(&self, other: &Self) -> f32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f32::max)
    }
}

impl Default for RotationMatrix {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Compute the rotation matrix for a device given its gravity and geomagnetic
/// vectors (both in device coordinates).
///
/// Rows are East (H), North (M) and Up (A); the fourth row and column are the
/// homogeneous identity. Returns `None` when the device is in free fall or
/// the magnetic field is (nearly) parallel to gravity.
pub fn rotation_matrix(gravity: [f32; 3], geomagnetic: [f32; 3]) -> Option<RotationMatrix> {
    let [mut ax, mut ay, mut az] = gravity;
    let [ex, ey, ez] = geomagnetic;

    let norm_sq_a = ax * ax + ay * ay + az * az;
    if norm_sq_a < FREE_FALL_GRAVITY_SQUARED {
        return None;
    }

    let mut hx = ey * az - ez * ay;
    let mut hy = ez * ax - ex * az;
    let mut hz = ex * ay - ey * ax;
    let norm_h = (hx * hx + hy * hy + hz * hz).sqrt();
    if norm_h < MIN_EAST_MAGNITUDE {
        return None;
    }

    let inv_h = 1.0 / norm_h;
    hx *= inv_h;
    hy *= inv_h;
    hz *= inv_h;

    let inv_a = 1.0 / norm_sq_a.sqrt();
    ax *= inv_a;
    ay *= inv_a;
    az *= inv_a;

    let mx = ay * hz - az * hy;
    let my = az * hx - ax * hz;
    let mz = ax * hy - ay * hx;

    Some(RotationMatrix([
        hx, hy, hz, 0.0, //
        mx, my, mz, 0.0, //
        ax, ay, az, 0.0, //
        0.0, 0.0, 0.0, 1.0,
    ]))
}

/// A single raw sensor sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SensorReading {
    /// Acceleration including gravity, m/s^2
    Accelerometer([f32; 3]),
    /// Ambient magnetic field, micro tesla
    Magnetometer([f32; 3]),
}

/// Keeps the latest gravity and geomagnetic vectors and recomputes the
/// rotation matrix on every reading.
#[derive(Debug, Clone, Default)]
pub struct SensorFusion {
    gravity: [f32; 3],
    geomagnetic: [f32; 3],
}

impl SensorFusion {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a reading and return the updated matrix, if one can be derived.
    pub fn update(&mut self, reading: SensorReading) -> Option<RotationMatrix> {
        match reading {
            SensorReading::Accelerometer(values) => self.gravity = values,
            SensorReading::Magnetometer(values) => self.geomagnetic = values,
        }
        rotation_matrix(self.gravity, self.geomagnetic)
    }

    pub fn reset(&mut self) {
        self.gravity = [0.0; 3];
        self.geomagnetic = [0.0; 3];
    }
}

/// Deterministic stand-in for real hardware: a device lying flat that yaws
/// at a constant rate inside a fixed earth magnetic field.
#[derive(Debug, Clone)]
pub struct SimulatedImu {
    yaw_rate_deg_per_sec: f32,
    yaw_deg: f32,
    /// Earth field in world coordinates (x east, y north, z up), micro tesla
    field_north: f32,
    field_down: f32,
}

impl SimulatedImu {
    pub fn new(yaw_rate_deg_per_sec: f32) -> Self {
        Self {
            yaw_rate_deg_per_sec,
            yaw_deg: 0.0,
            field_north: 22.0,
            field_down: 42.0,
        }
    }

    pub fn yaw_deg(&self) -> f32 {
        self.yaw_deg
    }

    /// Advance the simulation by `dt` and return one accelerometer and one
    /// magnetometer reading.
    pub fn sample(&mut self, dt: Duration) -> [SensorReading; 2] {
        self.yaw_deg = (self.yaw_deg + self.yaw_rate_deg_per_sec * dt.as_secs_f32()) % 360.0;
        let (sin, cos) = self.yaw_deg.to_radians().sin_cos();

        [
            SensorReading::Accelerometer([0.0, 0.0, STANDARD_GRAVITY]),
            SensorReading::Magnetometer([
                self.field_north * sin,
                self.field_north * cos,
                -self.field_down,
            ]),
        ]
    }
}
