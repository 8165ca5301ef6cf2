//! Magnet calibration: current setpoint ↔ integrated gradient.
//!
//! Each quadrupole has coefficients (A, B) with GL = A·I + B·I². Lookups are
//! case-insensitive and a missing calibration is reported as
//! [`Conversion::Unknown`] instead of an error, because incomplete hardware
//! tables are normal.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::warn;

/// Outcome of a calibration lookup.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Conversion {
    Known(f64),
    Unknown,
}

impl Conversion {
    pub fn value(self) -> Option<f64> {
        match self {
            Conversion::Known(v) => Some(v),
            Conversion::Unknown => None,
        }
    }

    pub fn is_known(self) -> bool {
        matches!(self, Conversion::Known(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coefficients {
    pub a: f64,
    pub b: f64,
}

impl Coefficients {
    pub fn current_to_gradient(&self, current: f64) -> f64 {
        self.a * current + self.b * current * current
    }

    /// Root of B·I² + A·I − GL = 0 on the branch that reduces to GL/A as
    /// B → 0, or `None` if no real root exists.
    pub fn gradient_to_current(&self, gradient: f64) -> Option<f64> {
        let Coefficients { a, b } = *self;
        if a == 0.0 && b == 0.0 {
            return Some(0.0);
        }
        if b == 0.0 {
            return Some(gradient / a);
        }
        if a == 0.0 {
            let ratio = gradient / b;
            return (ratio >= 0.0).then(|| ratio.sqrt());
        }
        let discriminant = a * a + 4.0 * gradient * b;
        if discriminant < 0.0 {
            return None;
        }
        // (A/2B)(√(1 + 4·GL·B/A²) − 1), rationalised against cancellation.
        Some(2.0 * gradient / (a + a.signum() * discriminant.sqrt()))
    }
}

/// A line that could not be read as a calibration entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedLine {
    pub line_no: usize,
    pub text: String,
    pub reason: String,
}

/// Immutable magnet name → (A, B) table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoefficientTable {
    entries: BTreeMap<String, Coefficients>,
    skipped: Vec<SkippedLine>,
}

impl CoefficientTable {
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, Coefficients)>,
        S: AsRef<str>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|(name, coeffs)| (name.as_ref().to_lowercase(), coeffs))
                .collect(),
            skipped: Vec::new(),
        }
    }

    /// Parses `NAME, A, B[, ...]` lines. `#` comments and blank lines are
    /// ignored; malformed lines are skipped with a warning.
    pub fn parse(text: &str) -> Self {
        let mut entries = BTreeMap::new();
        let mut skipped = Vec::new();

        for (index, raw) in text.lines().enumerate() {
            let line = raw.trim_end_matches('\r');
            if line.trim().is_empty() || line.starts_with('#') {
                continue;
            }
            match parse_coefficient_line(line) {
                Ok((name, coeffs)) => {
                    entries.insert(name, coeffs);
                }
                Err(reason) => {
                    warn!(line = index + 1, "Skipped line '{}': {}", line, reason);
                    skipped.push(SkippedLine {
                        line_no: index + 1,
                        text: line.to_string(),
                        reason,
                    });
                }
            }
        }

        Self { entries, skipped }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read coefficient table {}", path.display()))?;
        Ok(Self::parse(&text))
    }

    pub fn get(&self, name: &str) -> Option<Coefficients> {
        self.entries.get(&name.to_lowercase()).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn skipped(&self) -> &[SkippedLine] {
        &self.skipped
    }
}

fn parse_coefficient_line(line: &str) -> Result<(String, Coefficients), String> {
    let tokens: Vec<&str> = line.split(", ").collect();
    if tokens.len() < 3 {
        return Err(format!(
            "expected a name and two coefficients, found {} field(s)",
            tokens.len()
        ));
    }
    let name = tokens[0].trim();
    if name.is_empty() {
        return Err("empty magnet name".to_string());
    }
    let parse = |token: &str| {
        token
            .trim()
            .parse::<f64>()
            .map_err(|_| format!("invalid coefficient '{}'", token.trim()))
    };
    let a = parse(tokens[1])?;
    let b = parse(tokens[2])?;
    Ok((name.to_lowercase(), Coefficients { a, b }))
}

/// Converts between setpoint current and integrated gradient using an
/// injected [`CoefficientTable`].
#[derive(Debug, Clone)]
pub struct MagnetConverter {
    table: CoefficientTable,
}

impl MagnetConverter {
    pub fn new(table: CoefficientTable) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &CoefficientTable {
        &self.table
    }

    /// Current [A] → integrated gradient GL [T].
    pub fn c2gl(&self, name: &str, current: f64) -> Conversion {
        match self.table.get(name) {
            Some(coeffs) => Conversion::Known(coeffs.current_to_gradient(current)),
            None => {
                warn!(
                    "Do not know conversion factor for element {}, gradient value not assigned",
                    name
                );
                Conversion::Unknown
            }
        }
    }

    /// Integrated gradient GL [T] → current [A].
    pub fn gl2c(&self, name: &str, gradient: f64) -> Conversion {
        let Some(coeffs) = self.table.get(name) else {
            warn!(
                "Do not know conversion factor for element {}, current not assigned",
                name
            );
            return Conversion::Unknown;
        };
        match coeffs.gradient_to_current(gradient) {
            Some(current) => Conversion::Known(current),
            None => {
                warn!(
                    "Gradient {} T is out of range for element {} (A = {}, B = {})",
                    gradient, name, coeffs.a, coeffs.b
                );
                Conversion::Unknown
            }
        }
    }

    pub fn currents_to_gradients(&self, currents: &Setpoints) -> BTreeMap<String, Conversion> {
        currents
            .iter()
            .map(|(name, current)| (name.to_string(), self.c2gl(name, current)))
            .collect()
    }

    pub fn gradients_to_currents(&self, gradients: &Setpoints) -> BTreeMap<String, Conversion> {
        gradients
            .iter()
            .map(|(name, gradient)| (name.to_string(), self.gl2c(name, gradient)))
            .collect()
    }
}

/// Magnet name → value mapping (currents or gradients), names lower-cased.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Setpoints {
    values: BTreeMap<String, f64>,
}

impl Setpoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, value: f64) {
        self.values.insert(name.to_lowercase(), value);
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(&name.to_lowercase()).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Matched-design quadrupole currents [A] for the BTF straight line.
    pub fn btf_design() -> Self {
        [
            ("QH01", 219.061),
            ("QV02", 285.240),
            ("QH03", 6.879),
            ("QV04", -4.475),
            ("QH05", 0.0),
            ("QH06", 3.828),
            ("QV07", -3.782),
            ("QH08", 3.573),
            ("QV09", -3.218),
            ("QH10", 4.935),
            ("QH30", 5.753),
            ("QV31", -4.355),
            ("QH32", 6.155),
            ("QV33", -4.237),
        ]
        .into_iter()
        .collect()
    }

    /// Reads an `.mstate` settings document. The first child of the root
    /// holds one item per power supply; `setpoint_pv` looks like
    /// `SYS:PS_QH01` and `param` names the attribute holding the value.
    pub fn from_mstate(text: &str, param: &str) -> Result<Self> {
        let doc = roxmltree::Document::parse(text).context("Failed to parse mstate XML")?;
        let mut setpoints = Setpoints::new();

        let Some(group) = doc.root_element().children().find(|n| n.is_element()) else {
            warn!("mstate document has no settings group");
            return Ok(setpoints);
        };

        for item in group.children().filter(|n| n.is_element()) {
            let pos = doc.text_pos_at(item.range().start);
            match mstate_entry(item, param) {
                Ok((name, value)) => setpoints.insert(&name, value),
                Err(reason) => warn!(row = pos.row, "Skipped mstate item: {}", reason),
            }
        }
        Ok(setpoints)
    }

    pub fn load_mstate(path: &Path, param: &str) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read mstate file {}", path.display()))?;
        Self::from_mstate(&text, param)
            .with_context(|| format!("Failed to load setpoints from {}", path.display()))
    }
}

impl<S: AsRef<str>> FromIterator<(S, f64)> for Setpoints {
    fn from_iter<T: IntoIterator<Item = (S, f64)>>(iter: T) -> Self {
        let mut setpoints = Setpoints::new();
        for (name, value) in iter {
            setpoints.insert(name.as_ref(), value);
        }
        setpoints
    }
}

fn mstate_entry(item: roxmltree::Node<'_, '_>, param: &str) -> Result<(String, f64), String> {
    let pv = item
        .attribute("setpoint_pv")
        .ok_or_else(|| "missing setpoint_pv attribute".to_string())?;
    let supply = pv
        .split(':')
        .nth(1)
        .ok_or_else(|| format!("setpoint_pv '{}' has no device part", pv))?;
    let magnet = supply
        .split('_')
        .nth(1)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| format!("power supply '{}' has no magnet suffix", supply))?;
    let raw = item
        .attribute(param)
        .ok_or_else(|| format!("{} has no '{}' attribute", pv, param))?;
    let value = raw
        .trim()
        .parse::<f64>()
        .map_err(|_| format!("{}: invalid {} value '{}'", pv, param, raw))?;
    Ok((magnet.to_lowercase(), value))
}
