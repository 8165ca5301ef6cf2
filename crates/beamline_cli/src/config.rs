//! JSON configuration shared by every subcommand.

use anyhow::{bail, Context, Result};
use beamline_core::bunch::BunchFileFormat;
use beamline_core::lattice::TranslatorSettings;
use beamline_core::units::ReferenceParticle;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Every section falls back to the BTF defaults when absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub reference: ReferenceParticle,
    pub bunch_format: BunchFileFormat,
    pub translator: TranslatorSettings,
}

impl CliConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: CliConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        self.reference.validate().context("Invalid reference particle")?;
        let tolerance = self.translator.drift_tolerance;
        if !tolerance.is_finite() || tolerance < 0.0 {
            bail!(
                "translator.drift_tolerance must be a non-negative length, got {}",
                tolerance
            );
        }
        Ok(())
    }
}
