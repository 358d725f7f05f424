//! Error Types
//!
//! This module defines the error types used throughout the engine core.
//!
//! # Overview
//!
//! The main error type [`FloeError`] covers every failure mode the core can
//! surface:
//! - Host and device memory exhaustion
//! - Native device call failures and synchronisation misuse
//! - Swapchain invalidation (the only recoverable class)
//! - Asset I/O and decoding errors
//! - Configuration errors
//!
//! Contract violations (draw capacity overrun, out-of-order checkpoint
//! release, over-excluded scratch requests) are not represented here; they
//! are programmer errors and trip assertions instead.
//!
//! # Usage
//!
//! All public APIs return [`Result<T>`] which is an alias for
//! `std::result::Result<T, FloeError>`.
//!
//! ```rust,ignore
//! use floe::errors::{FloeError, Result};
//!
//! fn load() -> Result<()> {
//!     Err(FloeError::Config("max_draws must be non-zero".into()))
//! }
//! ```

use thiserror::Error;

use crate::renderer::core::allocator::MemoryClass;

/// The main error type for the Floe engine core.
#[derive(Error, Debug)]
pub enum FloeError {
    // ========================================================================
    // Host Memory Errors
    // ========================================================================
    /// A host arena push would cross its reservation ceiling.
    #[error("Host arena exhausted: push of {requested} bytes exceeds the {reserve}-byte reservation")]
    ArenaExhausted {
        /// Bytes requested by the failing push
        requested: usize,
        /// Hard reservation of the arena
        reserve: usize,
    },

    // ========================================================================
    // Device Memory Errors
    // ========================================================================
    /// No memory type satisfies the request, not even the host-visible fallback.
    #[error("No compatible memory type for {class:?} (type bits {type_bits:#x})")]
    NoCompatibleMemoryType {
        /// Hardware-reported compatible type mask
        type_bits: u32,
        /// Requested memory class
        class: MemoryClass,
    },

    /// The device refused an allocation.
    #[error("Out of device memory: {requested} bytes requested")]
    OutOfDeviceMemory {
        /// Size of the failed allocation
        requested: u64,
    },

    /// A device arena suballocation would cross the backing buffer's capacity.
    #[error("Device arena '{label}' exhausted: {requested} bytes at offset {offset}, capacity {capacity}")]
    DeviceArenaExhausted {
        /// Arena label
        label: String,
        /// Aligned offset the push started at
        offset: u64,
        /// Bytes requested
        requested: u64,
        /// Capacity of the backing buffer
        capacity: u64,
    },

    /// A fixed capacity ceiling (meshes, textures, geometry bytes) was hit.
    #[error("{what} capacity exceeded (limit {limit})")]
    CapacityExceeded {
        /// Which ceiling
        what: &'static str,
        /// Configured limit
        limit: u64,
    },

    /// A native device call failed.
    #[error("Device error: {0}")]
    Device(String),

    // ========================================================================
    // Synchronisation Errors
    // ========================================================================
    /// A fence was waited on although no submission will ever signal it.
    #[error("Fence {0} waited on but never signaled")]
    FenceNeverSignaled(u32),

    /// A submission or present waited on a semaphore nothing signaled.
    #[error("Semaphore {0} waited on but never signaled")]
    SemaphoreNeverSignaled(u32),

    /// A resource was accessed from a queue family that does not own it.
    #[error("Queue ownership violation: {0}")]
    QueueOwnership(String),

    // ========================================================================
    // Presentation Errors
    // ========================================================================
    /// The presentation surface no longer matches the swapchain.
    #[error("Swapchain is out of date")]
    SwapchainOutOfDate,

    /// Rebuilding the swapchain did not produce a usable image.
    #[error("Swapchain rebuild did not converge after {attempts} attempts")]
    SwapchainRebuildExhausted {
        /// Rebuilds performed before giving up
        attempts: u32,
    },

    // ========================================================================
    // Asset Errors
    // ========================================================================
    /// File I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A mesh file is truncated or inconsistent with its header.
    #[error("Malformed mesh file '{path}': {reason}")]
    MeshFormat {
        /// Source path
        path: String,
        /// What was wrong
        reason: String,
    },

    /// Image decoding error.
    #[error("Image decode error: {0}")]
    ImageDecode(#[from] image::ImageError),

    /// Pixel data does not match the texture it targets.
    #[error("Texture {id} expects {expected} bytes of pixel data, got {actual}")]
    TextureDataMismatch {
        /// Target texture id
        id: u32,
        /// Bytes implied by extent and format
        expected: usize,
        /// Bytes supplied
        actual: usize,
    },

    /// The id does not name a live resource.
    #[error("Unknown {kind} id {id}")]
    UnknownResource {
        /// Resource kind
        kind: &'static str,
        /// Offending id
        id: u32,
    },

    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Settings failed validation.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Settings could not be parsed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FloeError {
    /// Whether the error belongs to the recoverable presentation class.
    #[inline]
    #[must_use]
    pub fn is_out_of_date(&self) -> bool {
        matches!(self, Self::SwapchainOutOfDate)
    }
}

/// Alias for `Result<T, FloeError>`.
pub type Result<T> = std::result::Result<T, FloeError>;
