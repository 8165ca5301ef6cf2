//! Conversion between the time-of-flight and normalized-momentum conventions.
//!
//! Time-of-flight: (x, x', y, y', z, ΔE) with slopes in rad and ΔE in an
//! explicit [`EnergyUnit`]. Normalized-momentum: (x, px, y, py, t, pt) with
//! t = z/β₀ in metres and momenta divided by β₀γ₀.

use thiserror::Error;

use crate::bunch::{Bunch, Convention, Coordinates};
use crate::units::{EnergyUnit, ReferenceParticle};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConversionError {
    #[error(
        "non-physical reference particle (m0 = {mass_mev} MeV, E_kin = {kinetic_energy_mev} MeV, gamma0 = {gamma})"
    )]
    NonPhysicalReference {
        mass_mev: f64,
        kinetic_energy_mev: f64,
        gamma: f64,
    },
    #[error("particle {index}: transverse velocity beta_{plane} = {beta} is not below 1")]
    NonPhysicalSlope {
        index: usize,
        plane: char,
        beta: f64,
    },
    #[error("bunch is in {found:?} convention, expected {expected}")]
    WrongConvention {
        expected: &'static str,
        found: Convention,
    },
}

/// Reference quantities shared by every particle of one conversion.
#[derive(Debug, Clone, Copy)]
struct Kinematics {
    mass_mev: f64,
    beta0: f64,
    beta_gamma0: f64,
}

impl Kinematics {
    fn new(reference: &ReferenceParticle) -> Result<Self, ConversionError> {
        reference.validate()?;
        let beta0 = reference.beta();
        Ok(Self {
            mass_mev: reference.mass_mev(),
            beta0,
            beta_gamma0: beta0 * reference.gamma(),
        })
    }

    fn slope_to_momentum(
        &self,
        slope: f64,
        index: usize,
        plane: char,
    ) -> Result<f64, ConversionError> {
        let beta = self.beta0 * slope;
        if !(beta.abs() < 1.0) {
            return Err(ConversionError::NonPhysicalSlope { index, plane, beta });
        }
        let gamma = 1.0 / (1.0 - beta * beta).sqrt();
        Ok(beta * gamma / self.beta_gamma0)
    }

    fn momentum_to_slope(&self, momentum: f64) -> f64 {
        let beta_gamma = momentum * self.beta_gamma0;
        let beta = beta_gamma / (1.0 + beta_gamma * beta_gamma).sqrt();
        beta / self.beta0
    }
}

/// Converts one particle; `energy_unit` is the unit of the ΔE column.
pub fn time_of_flight_to_normalized(
    coords: &Coordinates,
    energy_unit: EnergyUnit,
    reference: &ReferenceParticle,
) -> Result<Coordinates, ConversionError> {
    let kin = Kinematics::new(reference)?;
    convert_forward(&kin, 0, coords, energy_unit)
}

/// Inverse of [`time_of_flight_to_normalized`], ΔE expressed in `energy_unit`.
pub fn normalized_to_time_of_flight(
    coords: &Coordinates,
    energy_unit: EnergyUnit,
    reference: &ReferenceParticle,
) -> Result<Coordinates, ConversionError> {
    let kin = Kinematics::new(reference)?;
    Ok(convert_inverse(&kin, coords, energy_unit))
}

fn convert_forward(
    kin: &Kinematics,
    index: usize,
    coords: &Coordinates,
    energy_unit: EnergyUnit,
) -> Result<Coordinates, ConversionError> {
    let [x, xp, y, yp, z, de] = *coords;
    let delta_gamma = de * energy_unit.mev_per_unit() / kin.mass_mev;
    Ok([
        x,
        kin.slope_to_momentum(xp, index, 'x')?,
        y,
        kin.slope_to_momentum(yp, index, 'y')?,
        z / kin.beta0,
        delta_gamma / kin.beta_gamma0,
    ])
}

fn convert_inverse(
    kin: &Kinematics,
    coords: &Coordinates,
    energy_unit: EnergyUnit,
) -> Coordinates {
    let [x, px, y, py, t, pt] = *coords;
    let delta_gamma = pt * kin.beta_gamma0;
    [
        x,
        kin.momentum_to_slope(px),
        y,
        kin.momentum_to_slope(py),
        t * kin.beta0,
        delta_gamma * kin.mass_mev / energy_unit.mev_per_unit(),
    ]
}

/// Converts a whole time-of-flight bunch. The reference is validated before
/// any particle is touched, and the first non-physical slope aborts the call.
pub fn to_normalized_momentum(bunch: &Bunch) -> Result<Bunch, ConversionError> {
    let energy_unit = match bunch.convention {
        Convention::TimeOfFlight { energy_unit } => energy_unit,
        found => {
            return Err(ConversionError::WrongConvention {
                expected: "time-of-flight",
                found,
            })
        }
    };
    let kin = Kinematics::new(&bunch.reference)?;

    let particles = bunch
        .particles
        .iter()
        .enumerate()
        .map(|(index, coords)| convert_forward(&kin, index, coords, energy_unit))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Bunch {
        reference: bunch.reference,
        convention: Convention::NormalizedMomentum,
        particles,
        ids: bunch.ids.clone(),
    })
}

pub fn to_time_of_flight(bunch: &Bunch, energy_unit: EnergyUnit) -> Result<Bunch, ConversionError> {
    if bunch.convention != Convention::NormalizedMomentum {
        return Err(ConversionError::WrongConvention {
            expected: "normalized-momentum",
            found: bunch.convention,
        });
    }
    let kin = Kinematics::new(&bunch.reference)?;
    let particles = bunch
        .particles
        .iter()
        .map(|coords| convert_inverse(&kin, coords, energy_unit))
        .collect();

    Ok(Bunch {
        reference: bunch.reference,
        convention: Convention::TimeOfFlight { energy_unit },
        particles,
        ids: bunch.ids.clone(),
    })
}
