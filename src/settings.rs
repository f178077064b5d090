//! Kernel settings and quality presets
//!
//! Persisted as JSON next to whatever drives the simulation.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::consts::{DEFAULT_BOUNDS_PADDING, DEFAULT_CELL_SIZE};

/// Quality preset levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum QualityPreset {
    Low,
    #[default]
    Medium,
    High,
}

impl QualityPreset {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityPreset::Low => "Low",
            QualityPreset::Medium => "Medium",
            QualityPreset::High => "High",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "low" => Some(QualityPreset::Low),
            "medium" | "med" => Some(QualityPreset::Medium),
            "high" => Some(QualityPreset::High),
            _ => None,
        }
    }

    /// GPU cell capacity (insertions beyond this are dropped)
    pub fn max_per_cell(&self) -> u32 {
        match self {
            QualityPreset::Low => 16,
            QualityPreset::Medium => 32,
            QualityPreset::High => 64,
        }
    }

    /// Maximum GPU grid cells per axis
    pub fn gpu_grid_cells(&self) -> u32 {
        match self {
            QualityPreset::Low => 64,
            QualityPreset::Medium => 128,
            QualityPreset::High => 256,
        }
    }

    /// Constrain passes per step (joint chains converge with more)
    pub fn constrain_iterations(&self) -> u32 {
        match self {
            QualityPreset::Low => 1,
            QualityPreset::Medium => 2,
            QualityPreset::High => 4,
        }
    }

    /// Maximum CPU grid cells per axis
    pub fn cpu_grid_cells(&self) -> u32 {
        match self {
            QualityPreset::Low => 256,
            QualityPreset::Medium => 512,
            QualityPreset::High => 1024,
        }
    }

    /// GPU particle buffer capacity
    pub fn max_particles(&self) -> u32 {
        match self {
            QualityPreset::Low => 4_096,
            QualityPreset::Medium => 16_384,
            QualityPreset::High => 65_536,
        }
    }
}

/// Engine tuning knobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelSettings {
    /// Quality preset the capacity fields were derived from
    pub quality: QualityPreset,

    // === Spatial index ===
    /// Cell edge length in world units
    pub cell_size: f32,
    /// Padding around the viewport as a fraction of its extent
    pub bounds_padding: f32,
    /// GPU per-cell capacity
    pub max_per_cell: u32,
    /// GPU grid cells per axis
    pub gpu_grid_cells: u32,
    /// CPU grid cells per axis; zooming out widens cells past this
    pub cpu_grid_cells: u32,

    // === Pipeline ===
    /// Constrain passes per step
    pub constrain_iterations: u32,
    /// Compute workgroup width
    pub workgroup_size: u32,
    /// GPU particle buffer capacity
    pub max_particles: u32,
}

impl Default for KernelSettings {
    fn default() -> Self {
        Self::from_preset(QualityPreset::Medium)
    }
}

impl KernelSettings {
    /// Create settings from a quality preset (applies preset defaults)
    pub fn from_preset(preset: QualityPreset) -> Self {
        let mut settings = Self {
            quality: preset,
            cell_size: DEFAULT_CELL_SIZE,
            bounds_padding: DEFAULT_BOUNDS_PADDING,
            max_per_cell: 0,
            gpu_grid_cells: 0,
            cpu_grid_cells: 0,
            constrain_iterations: 0,
            workgroup_size: 64,
            max_particles: 0,
        };
        settings.apply_preset(preset);
        settings
    }

    /// Apply a quality preset (updates preset-dependent fields)
    pub fn apply_preset(&mut self, preset: QualityPreset) {
        self.quality = preset;
        self.max_per_cell = preset.max_per_cell();
        self.gpu_grid_cells = preset.gpu_grid_cells();
        self.cpu_grid_cells = preset.cpu_grid_cells();
        self.constrain_iterations = preset.constrain_iterations();
        self.max_particles = preset.max_particles();
    }

    /// Constrain passes, never zero
    pub fn effective_constrain_iterations(&self) -> u32 {
        self.constrain_iterations.max(1)
    }

    pub fn from_json(json: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Load settings from a JSON file, falling back to defaults if it does not exist
    pub fn load(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            log::info!("No settings at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let json = std::fs::read_to_string(path)?;
        let settings = Self::from_json(&json)?;
        log::info!("Loaded settings from {} ({})", path.display(), settings.quality.as_str());
        Ok(settings)
    }

    /// Save settings as pretty JSON
    pub fn save(&self, path: impl AsRef<Path>) -> crate::Result<()> {
        std::fs::write(path.as_ref(), self.to_json()?)?;
        log::info!("Settings saved");
        Ok(())
    }
}
