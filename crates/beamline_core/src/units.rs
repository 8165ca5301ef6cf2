//! Energy units and the design (reference) particle.
//!
//! Every energy that enters a conversion carries its unit. Values are only
//! ever normalised through [`Energy::to_mev`], so a GeV energy deviation can
//! never be divided by a MeV rest mass by accident.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::coordinates::ConversionError;

/// Speed of light in vacuum [m/s].
pub const SPEED_OF_LIGHT: f64 = 2.997_924_58e8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnergyUnit {
    Ev,
    Kev,
    Mev,
    Gev,
}

impl EnergyUnit {
    /// Number of MeV in one unit.
    pub fn mev_per_unit(self) -> f64 {
        match self {
            EnergyUnit::Ev => 1e-6,
            EnergyUnit::Kev => 1e-3,
            EnergyUnit::Mev => 1.0,
            EnergyUnit::Gev => 1e3,
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "ev" => Some(EnergyUnit::Ev),
            "kev" => Some(EnergyUnit::Kev),
            "mev" => Some(EnergyUnit::Mev),
            "gev" => Some(EnergyUnit::Gev),
            _ => None,
        }
    }
}

impl fmt::Display for EnergyUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EnergyUnit::Ev => "eV",
            EnergyUnit::Kev => "keV",
            EnergyUnit::Mev => "MeV",
            EnergyUnit::Gev => "GeV",
        };
        f.write_str(label)
    }
}

/// An energy value tagged with its unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Energy {
    pub value: f64,
    pub unit: EnergyUnit,
}

impl Energy {
    pub fn new(value: f64, unit: EnergyUnit) -> Self {
        Self { value, unit }
    }

    pub fn mev(value: f64) -> Self {
        Self::new(value, EnergyUnit::Mev)
    }

    pub fn gev(value: f64) -> Self {
        Self::new(value, EnergyUnit::Gev)
    }

    pub fn to_mev(self) -> f64 {
        self.value * self.unit.mev_per_unit()
    }

    pub fn to_unit(self, unit: EnergyUnit) -> Energy {
        Energy::new(self.to_mev() / unit.mev_per_unit(), unit)
    }
}

impl fmt::Display for Energy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.value, self.unit)
    }
}

/// Rest mass and kinetic energy of the design particle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReferenceParticle {
    pub mass: Energy,
    pub kinetic_energy: Energy,
}

impl Default for ReferenceParticle {
    fn default() -> Self {
        Self::btf_hminus()
    }
}

impl ReferenceParticle {
    pub fn new(mass: Energy, kinetic_energy: Energy) -> Self {
        Self {
            mass,
            kinetic_energy,
        }
    }

    /// 2.5 MeV H⁻ beam of the SNS Beam Test Facility.
    pub fn btf_hminus() -> Self {
        Self::new(Energy::mev(938.79), Energy::mev(2.5))
    }

    pub fn mass_mev(&self) -> f64 {
        self.mass.to_mev()
    }

    pub fn kinetic_energy_mev(&self) -> f64 {
        self.kinetic_energy.to_mev()
    }

    /// γ₀ = 1 + E_kin / m₀.
    pub fn gamma(&self) -> f64 {
        1.0 + self.kinetic_energy_mev() / self.mass_mev()
    }

    /// β₀ = √(γ₀² − 1) / γ₀.
    pub fn beta(&self) -> f64 {
        let gamma = self.gamma();
        (gamma * gamma - 1.0).sqrt() / gamma
    }

    /// Reference momentum P₀ = γ₀β₀m₀ [MeV/c].
    pub fn momentum_mev(&self) -> f64 {
        self.gamma() * self.beta() * self.mass_mev()
    }

    /// Magnetic rigidity Bρ [T·m].
    pub fn rigidity(&self) -> f64 {
        self.momentum_mev() * 1e6 / SPEED_OF_LIGHT
    }

    /// Rejects references whose β₀ would be zero, imaginary or NaN.
    pub fn validate(&self) -> Result<(), ConversionError> {
        let mass = self.mass_mev();
        let kinetic = self.kinetic_energy_mev();
        if !mass.is_finite() || !kinetic.is_finite() || mass <= 0.0 {
            return Err(ConversionError::NonPhysicalReference {
                mass_mev: mass,
                kinetic_energy_mev: kinetic,
                gamma: f64::NAN,
            });
        }
        let gamma = self.gamma();
        if !(gamma > 1.0) || !gamma.is_finite() {
            return Err(ConversionError::NonPhysicalReference {
                mass_mev: mass,
                kinetic_energy_mev: kinetic,
                gamma,
            });
        }
        Ok(())
    }
}
