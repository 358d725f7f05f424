//! Renderer Settings
//!
//! Every capacity ceiling of the core lives here instead of in constants
//! scattered across modules. Overflowing any of them is a hard error, never
//! silent truncation.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use floe::renderer::settings::RendererSettings;
//!
//! let settings = RendererSettings {
//!     max_draws: 4096,
//!     ..Default::default()
//! };
//!
//! // Or from a partial JSON document; missing fields keep their defaults.
//! let settings = RendererSettings::from_json_str(r#"{ "max_meshes": 256 }"#)?;
//! ```

use serde::{Deserialize, Serialize};

use crate::errors::{FloeError, Result};
use crate::memory::ArenaSettings;
use crate::renderer::hal::Format;

const MIB: u64 = 1 << 20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererSettings {
    /// Mesh handle directory size.
    pub max_meshes: u32,
    /// Texture ids, including the reserved null texture 0.
    pub max_textures: u32,
    /// Draw records per frame.
    pub max_draws: u32,

    pub vertex_buffer_size: u64,
    pub index_buffer_size: u64,
    /// Host-visible upload staging arena.
    pub staging_size: u64,
    /// Device-local arena shared by non-dedicated images.
    pub image_arena_size: u64,
    /// Per-frame uniform staging and the device uniform buffer.
    pub uniform_size: u64,

    /// Swapchain rebuilds attempted per frame before giving up.
    pub max_swapchain_rebuilds: u32,
    /// Threads per cull workgroup.
    pub cull_workgroup_size: u32,
    pub swapchain_format: Format,

    /// Sizing of the scratch arenas.
    pub scratch: ArenaSettings,
}

impl Default for RendererSettings {
    fn default() -> Self {
        Self {
            max_meshes: 1024,
            max_textures: 1024,
            max_draws: 65535,
            vertex_buffer_size: 64 * MIB,
            index_buffer_size: 64 * MIB,
            staging_size: 256 * MIB,
            image_arena_size: 256 * MIB,
            uniform_size: 16 * MIB,
            max_swapchain_rebuilds: 3,
            cull_workgroup_size: 64,
            swapchain_format: Format::Bgra8UnormSrgb,
            scratch: ArenaSettings::default(),
        }
    }
}

impl RendererSettings {
    /// Parse and validate settings from JSON.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        let counts = [
            ("max_meshes", u64::from(self.max_meshes)),
            ("max_draws", u64::from(self.max_draws)),
            ("max_swapchain_rebuilds", u64::from(self.max_swapchain_rebuilds)),
            ("vertex_buffer_size", self.vertex_buffer_size),
            ("index_buffer_size", self.index_buffer_size),
            ("staging_size", self.staging_size),
            ("image_arena_size", self.image_arena_size),
            ("uniform_size", self.uniform_size),
        ];
        if let Some((name, _)) = counts.iter().find(|(_, value)| *value == 0) {
            return Err(FloeError::Config(format!("{name} must be non-zero")));
        }
        if self.max_textures < 2 {
            return Err(FloeError::Config(
                "max_textures must leave room beyond the null texture".into(),
            ));
        }
        if !self.cull_workgroup_size.is_power_of_two() {
            return Err(FloeError::Config(format!(
                "cull_workgroup_size must be a power of two, got {}",
                self.cull_workgroup_size
            )));
        }
        if self.scratch.reserve_size == 0 {
            return Err(FloeError::Config("scratch.reserve_size must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        RendererSettings::default().validate().unwrap();
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let settings = RendererSettings::from_json_str(r#"{ "max_meshes": 8, "scratch": { "commit_size": 8192 } }"#).unwrap();
        assert_eq!(settings.max_meshes, 8);
        assert_eq!(settings.max_draws, 65535);
        assert_eq!(settings.scratch.commit_size, 8192);
        assert_eq!(settings.scratch.reserve_size, ArenaSettings::default().reserve_size);
    }

    #[test]
    fn rejects_bad_workgroup() {
        let err = RendererSettings::from_json_str(r#"{ "cull_workgroup_size": 48 }"#).unwrap_err();
        assert!(matches!(err, FloeError::Config(_)));
    }

    #[test]
    fn rejects_zero_capacity() {
        let settings = RendererSettings {
            max_draws: 0,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }
}
