//! Beamline descriptions and their translation to MAD-X lattice text.
//!
//! A [`Beamline`] is read from the XML layout (segments of positioned
//! elements) and flattened by [`translate`] into a [`MadxLattice`] where every
//! gap between elements is an explicit, named drift.

mod parse;
mod translate;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::coordinates::ConversionError;

pub use translate::{
    next_drift_name, translate, xml_to_madx, CompositeLine, MadxElement, MadxLattice,
    QuadOverride, TranslationReport, TranslatorSettings,
};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LatticeError {
    #[error("malformed beamline XML: {0}")]
    Xml(String),
    #[error("{tag} '{owner}' is missing required attribute '{attribute}'")]
    MissingAttribute {
        tag: String,
        owner: String,
        attribute: &'static str,
    },
    #[error("{owner}: attribute '{attribute}' has invalid number '{value}'")]
    InvalidNumber {
        owner: String,
        attribute: &'static str,
        value: String,
    },
    #[error("element '{name}' has unknown type '{kind}'")]
    UnknownElementType { name: String, kind: String },
    #[error(
        "segment {segment}: element '{element}' starts at {start:.6} m but the previous element ends at {previous_end:.6} m"
    )]
    Overlap {
        segment: String,
        element: String,
        start: f64,
        previous_end: f64,
    },
    #[error(
        "segment {segment}: declared length {declared:.6} m is shorter than its content ({content:.6} m)"
    )]
    SegmentTooShort {
        segment: String,
        declared: f64,
        content: f64,
    },
    #[error("no free drift name left after '{0}'")]
    DriftNamesExhausted(String),
    #[error(transparent)]
    Reference(#[from] ConversionError),
}

/// Element type together with the fields only that type carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ElementKind {
    /// `field` is the gradient [T/m] from the layout file.
    Quadrupole { field: f64 },
    Bend {
        theta: f64,
        ea1: f64,
        ea2: f64,
        kls: f64,
    },
    Marker,
    Drift,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatticeElement {
    pub name: String,
    pub length: f64,
    /// Longitudinal position of the element centre within its segment [m].
    pub position: f64,
    pub kind: ElementKind,
}

impl LatticeElement {
    pub fn start(&self) -> f64 {
        self.position - 0.5 * self.length
    }

    /// Extent `(start, end)` the element occupies in the flat line. Markers
    /// are emitted with zero length, so they sit at their centre and the
    /// surrounding drifts absorb their declared length.
    pub fn footprint(&self) -> (f64, f64) {
        match self.kind {
            ElementKind::Marker => (self.position, self.position),
            _ => (self.start(), self.position + 0.5 * self.length),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub name: String,
    pub length: f64,
    pub elements: Vec<LatticeElement>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Beamline {
    pub segments: Vec<Segment>,
}

impl Beamline {
    pub fn segment(&self, name: &str) -> Option<&Segment> {
        self.segments.iter().find(|s| s.name == name)
    }

    pub fn total_length(&self) -> f64 {
        self.segments.iter().map(|s| s.length).sum()
    }
}
