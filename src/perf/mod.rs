//! The Performance Monitor Layer (§4.5): perf-event FFI, the energy-meter
//! wire client, and the polymorphic `PerformanceMonitor` itself.

pub mod clustsafe;
pub mod ffi;
pub mod monitor;
pub mod sensor;

pub use monitor::PerformanceMonitor;
