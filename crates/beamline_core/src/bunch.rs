//! Particle bunches, their text file formats and second-order moments.

use anyhow::{bail, Context, Result};
use nalgebra::{Matrix2, Matrix6, Vector6};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::units::{EnergyUnit, ReferenceParticle};

/// Phase-space coordinates of one particle.
pub type Coordinates = [f64; 6];

/// Unit convention shared by every particle of a bunch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "convention", rename_all = "snake_case")]
pub enum Convention {
    /// (x [m], x' [rad], y [m], y' [rad], z [m], ΔE [energy_unit]).
    TimeOfFlight { energy_unit: EnergyUnit },
    /// (x [m], px, y [m], py, t [m], pt), momenta normalised to the reference.
    NormalizedMomentum,
}

impl Convention {
    pub fn column_names(&self) -> [&'static str; 6] {
        match self {
            Convention::TimeOfFlight { .. } => ["x", "xp", "y", "yp", "z", "de"],
            Convention::NormalizedMomentum => ["x", "px", "y", "py", "t", "pt"],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Bunch {
    pub reference: ReferenceParticle,
    pub convention: Convention,
    pub particles: Vec<Coordinates>,
    /// Per-particle ids when the source file provided them.
    pub ids: Option<Vec<u64>>,
}

/// Layout of a time-of-flight bunch dump.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct BunchFileFormat {
    pub header_lines: usize,
    pub energy_unit: EnergyUnit,
}

impl Default for BunchFileFormat {
    fn default() -> Self {
        Self {
            header_lines: 15,
            energy_unit: EnergyUnit::Gev,
        }
    }
}

impl Bunch {
    pub fn new(
        reference: ReferenceParticle,
        convention: Convention,
        particles: Vec<Coordinates>,
    ) -> Self {
        Self {
            reference,
            convention,
            particles,
            ids: None,
        }
    }

    pub fn len(&self) -> usize {
        self.particles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }

    /// Parses a whitespace-delimited dump with columns
    /// `x x' y y' z ΔE [id [phase]]`.
    pub fn parse_time_of_flight(
        text: &str,
        format: &BunchFileFormat,
        reference: ReferenceParticle,
    ) -> Result<Bunch> {
        let mut particles = Vec::new();
        let mut ids = Vec::new();
        let mut all_ids = true;

        for (line_index, line) in text.lines().enumerate().skip(format.header_lines) {
            let line_no = line_index + 1;
            if line.trim().is_empty() {
                continue;
            }
            let columns: Vec<&str> = line.split_whitespace().collect();
            if columns.len() < 6 {
                bail!(
                    "Line {}: expected at least 6 columns, found {}.",
                    line_no,
                    columns.len()
                );
            }
            let mut coords = [0.0; 6];
            for (slot, token) in coords.iter_mut().zip(&columns[..6]) {
                *slot = token
                    .parse::<f64>()
                    .with_context(|| format!("Line {}: invalid number '{}'.", line_no, token))?;
            }
            particles.push(coords);

            match columns.get(6).and_then(|token| token.parse::<f64>().ok()) {
                Some(id) if all_ids && id >= 0.0 && id.fract() == 0.0 => ids.push(id as u64),
                _ => all_ids = false,
            }
        }

        let mut bunch = Bunch::new(
            reference,
            Convention::TimeOfFlight {
                energy_unit: format.energy_unit,
            },
            particles,
        );
        if all_ids && !bunch.is_empty() {
            bunch.ids = Some(ids);
        }
        Ok(bunch)
    }

    pub fn read_time_of_flight(
        path: &Path,
        format: &BunchFileFormat,
        reference: ReferenceParticle,
    ) -> Result<Bunch> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read bunch file {}", path.display()))?;
        Self::parse_time_of_flight(&text, format, reference)
            .with_context(|| format!("Failed to parse bunch file {}", path.display()))
    }

    /// Comma-separated rendering with a header row named after the convention.
    pub fn to_csv(&self) -> Result<String> {
        if let Some(ids) = &self.ids {
            if ids.len() != self.particles.len() {
                bail!(
                    "Bunch has {} ids for {} particles",
                    ids.len(),
                    self.particles.len()
                );
            }
        }
        let names = self.convention.column_names();
        let mut out = String::new();
        if self.ids.is_some() {
            out.push_str("id,");
        }
        out.push_str(&names.join(","));
        out.push('\n');
        for (index, coords) in self.particles.iter().enumerate() {
            let mut row: Vec<String> = Vec::with_capacity(7);
            if let Some(ids) = &self.ids {
                row.push(ids[index].to_string());
            }
            row.extend(coords.iter().map(|v| format!("{:.12e}", v)));
            out.push_str(&row.join(","));
            out.push('\n');
        }
        Ok(out)
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let text = self.to_csv()?;
        fs::write(path, text)
            .with_context(|| format!("Failed to write bunch file {}", path.display()))
    }

    pub fn moments(&self) -> Result<BunchMoments> {
        BunchMoments::from_particles(&self.particles)
    }
}

/// First and second moments of a particle distribution.
#[derive(Debug, Clone, PartialEq)]
pub struct BunchMoments {
    pub centroid: Vector6<f64>,
    pub covariance: Matrix6<f64>,
}

impl BunchMoments {
    pub fn from_particles(particles: &[Coordinates]) -> Result<Self> {
        if particles.is_empty() {
            bail!("Cannot compute moments of an empty bunch.");
        }
        let count = particles.len() as f64;

        let mut centroid = Vector6::zeros();
        for coords in particles {
            centroid += Vector6::from_column_slice(coords);
        }
        centroid /= count;

        let mut covariance = Matrix6::zeros();
        for coords in particles {
            let delta = Vector6::from_column_slice(coords) - centroid;
            covariance += delta * delta.transpose();
        }
        covariance /= count;

        Ok(Self {
            centroid,
            covariance,
        })
    }

    /// RMS sizes of the three position-like coordinates (x, y, z or t).
    pub fn rms_sizes(&self) -> [f64; 3] {
        [0, 2, 4].map(|i| self.covariance[(i, i)].max(0.0).sqrt())
    }

    /// RMS emittances √det Σ of the three 2×2 diagonal blocks.
    pub fn rms_emittances(&self) -> [f64; 3] {
        [0, 2, 4].map(|i| {
            let block: Matrix2<f64> = self.covariance.fixed_view::<2, 2>(i, i).into_owned();
            block.determinant().max(0.0).sqrt()
        })
    }
}
