//! Device classes and hardware capability probing

pub mod cpu;
pub mod device;

pub use device::{probe_for, AcceleratorProbe, Capability, CapabilityProbe, DeviceClass, HostProbe};
