//! Remote Gyro Sensor
//!
//! Streams a rotation matrix fused from accelerometer and magnetometer
//! readings to a single peer over a point-to-point byte-stream link.

pub mod app;
pub mod domain;
pub mod infrastructure;
