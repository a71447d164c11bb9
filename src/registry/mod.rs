//! Name -> instance registries for devices, pipelines and tasks.
//!
//! Registries hold short locks only. Anything that can block (device I/O,
//! store I/O, thread joins) runs after the map lock is released.

mod device;
mod pipeline;
mod task;

pub use device::DeviceRegistry;
pub use pipeline::PipelineRegistry;
pub use task::TaskRegistry;
