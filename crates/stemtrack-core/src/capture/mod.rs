//! Multi-device capture: backends, the stream pool, recording sessions
//! and latency calibration

pub mod backend;
pub mod calibrate;
pub mod pool;
pub mod session;

pub use backend::{CaptureBackend, CaptureStream, CpalCaptureBackend, InputDevice};
pub use calibrate::LatencyCalibrator;
pub use pool::DeviceStreamPool;
pub use session::{DeviceTake, RecordingSession};
