//! Core Device Memory
//!
//! - [`DeviceAllocator`]: memory type classification and buffer/image allocation
//! - [`DeviceArena`]: bump suballocation inside a single device buffer

pub mod allocator;
pub mod device_arena;

pub use allocator::{Buffer, DeviceAllocator, MemoryClass, MemoryTypeTable};
pub use device_arena::{DeviceArena, DeviceSpan};
