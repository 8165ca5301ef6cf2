//! The `beamline_core` crate holds the numerical glue shared by beam-dynamics
//! studies that move data between simulation codes.
//!
//! Key components:
//! - **Units**: `Energy` values tagged with their unit and the `ReferenceParticle`.
//! - **Bunch**: particle coordinates under a named `Convention`, file IO and moments.
//! - **Coordinates**: time-of-flight ↔ normalized-momentum conversion.
//! - **Magnets**: calibration tables, current ↔ integrated-gradient conversion, setpoints.
//! - **Lattice**: XML beamline layouts flattened into MAD-X text with explicit drifts.
pub mod bunch;
pub mod coordinates;
pub mod lattice;
pub mod magnets;
pub mod units;
