use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::{Beamline, ElementKind, LatticeElement, LatticeError, Segment};
use crate::magnets::{Conversion, MagnetConverter, Setpoints};
use crate::units::ReferenceParticle;

/// A named line built by concatenating segment lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositeLine {
    pub name: String,
    pub members: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslatorSettings {
    /// Gaps smaller than this [m] are ignored; overlaps larger are errors.
    pub drift_tolerance: f64,
    /// Drift-name counter to start from when a segment begins.
    pub counter_resets: BTreeMap<String, String>,
    pub composite_lines: Vec<CompositeLine>,
    pub use_sequence: Option<String>,
}

impl Default for TranslatorSettings {
    /// BTF layout: the stub leaves the main line after QV06.
    fn default() -> Self {
        let composite = |name: &str, members: &[&str]| CompositeLine {
            name: name.to_string(),
            members: members.iter().map(|m| m.to_string()).collect(),
        };
        Self {
            drift_tolerance: 1e-6,
            counter_resets: [("STUB".to_string(), "06".to_string())].into_iter().collect(),
            composite_lines: vec![
                composite("BEND2", &["MEBT1", "MEBT2"]),
                composite("BEND1", &["MEBT1", "STUB"]),
            ],
            use_sequence: Some("BEND2".to_string()),
        }
    }
}

/// One MAD-X element definition.
#[derive(Debug, Clone, PartialEq)]
pub enum MadxElement {
    Drift {
        length: f64,
    },
    Quadrupole {
        length: f64,
        k1: f64,
    },
    Monitor,
    SBend {
        length: f64,
        angle: f64,
        k1: f64,
        e1: f64,
        e2: f64,
    },
}

impl MadxElement {
    pub fn length(&self) -> f64 {
        match *self {
            MadxElement::Drift { length }
            | MadxElement::Quadrupole { length, .. }
            | MadxElement::SBend { length, .. } => length,
            MadxElement::Monitor => 0.0,
        }
    }
}

impl fmt::Display for MadxElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            MadxElement::Drift { length } => write!(f, "DRIFT, L={:.3};", length),
            MadxElement::Quadrupole { length, k1 } => {
                write!(f, "QUADRUPOLE, L={:.3}, K1={:.3};", length, k1)
            }
            MadxElement::Monitor => write!(f, "MONITOR, L=0.0;"),
            MadxElement::SBend {
                length,
                angle,
                k1,
                e1,
                e2,
            } => write!(
                f,
                "SBEND, L={:.3}, ANGLE={:.3}, K1={:.3}, E1={:.3}, E2={:.3};",
                length, angle, k1, e1, e2
            ),
        }
    }
}

/// Flattened lattice ready to be written as MAD-X text.
#[derive(Debug, Clone, PartialEq)]
pub struct MadxLattice {
    /// Unique element definitions in order of first appearance.
    pub definitions: Vec<(String, MadxElement)>,
    /// Segment name → element names in beam order.
    pub lines: Vec<(String, Vec<String>)>,
    pub composite_lines: Vec<CompositeLine>,
    pub use_sequence: Option<String>,
}

impl MadxLattice {
    pub fn definition(&self, name: &str) -> Option<&MadxElement> {
        self.definitions
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, element)| element)
    }

    pub fn line(&self, segment: &str) -> Option<&[String]> {
        self.lines
            .iter()
            .find(|(n, _)| n == segment)
            .map(|(_, names)| names.as_slice())
    }

    /// Sum of element lengths along one segment line.
    pub fn line_length(&self, segment: &str) -> Option<f64> {
        let names = self.line(segment)?;
        names
            .iter()
            .map(|name| self.definition(name).map(MadxElement::length))
            .sum()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (name, element) in &self.definitions {
            out.push_str(&format!("{}: {}\n", name, element));
        }
        out.push('\n');
        for (name, members) in &self.lines {
            out.push_str(&format!("{}: LINE=({});\n", name, members.join(",")));
        }
        if !self.composite_lines.is_empty() || self.use_sequence.is_some() {
            out.push('\n');
        }
        for line in &self.composite_lines {
            out.push_str(&format!("{}: LINE=({});\n", line.name, line.members.join(",")));
        }
        if let Some(sequence) = &self.use_sequence {
            out.push_str(&format!("USE,SEQUENCE={};\n", sequence));
        }
        out
    }
}

/// A quadrupole whose strength was replaced from live magnet settings.
#[derive(Debug, Clone, PartialEq)]
pub struct QuadOverride {
    pub name: String,
    pub current: f64,
    pub file_k1: f64,
    pub k1: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TranslationReport {
    pub overrides: Vec<QuadOverride>,
    /// Quadrupoles with a setpoint but no usable calibration.
    pub unresolved: Vec<String>,
    pub synthesized_drifts: usize,
}

/// Returns `DR{counter}a`, advancing the trailing letter past every name
/// already in `taken`.
pub fn next_drift_name(counter: &str, taken: &HashSet<String>) -> Result<String, LatticeError> {
    let stem = format!("DR{}", counter);
    for letter in 'a'..='z' {
        let candidate = format!("{}{}", stem, letter);
        if !taken.contains(&candidate) {
            return Ok(candidate);
        }
    }
    Err(LatticeError::DriftNamesExhausted(format!("{}z", stem)))
}

/// Drift counter taken from a quadrupole name: everything after the
/// two-letter family prefix (`QH10` → `10`, `QV10A` → `10A`).
fn quad_counter(name: &str) -> Option<&str> {
    let (offset, _) = name.char_indices().nth(2)?;
    Some(&name[offset..])
}

struct Translator<'a> {
    rigidity: f64,
    live: Option<(&'a Setpoints, &'a MagnetConverter)>,
    settings: &'a TranslatorSettings,
    taken: HashSet<String>,
    counter: String,
    definitions: Vec<(String, MadxElement)>,
    defined: HashMap<String, usize>,
    report: TranslationReport,
}

impl<'a> Translator<'a> {
    fn define(&mut self, name: &str, element: MadxElement) {
        match self.defined.get(name) {
            Some(&index) => {
                if self.definitions[index].1 != element {
                    warn!(
                        "Element {} redefined as '{}', keeping '{}'",
                        name, element, self.definitions[index].1
                    );
                }
            }
            None => {
                self.defined.insert(name.to_string(), self.definitions.len());
                self.definitions.push((name.to_string(), element));
            }
        }
    }

    fn push_drift(&mut self, length: f64, line: &mut Vec<String>) -> Result<(), LatticeError> {
        let name = next_drift_name(&self.counter, &self.taken)?;
        debug!("Drift {} with L = {:.6} m", name, length);
        self.taken.insert(name.clone());
        self.define(&name, MadxElement::Drift { length });
        self.report.synthesized_drifts += 1;
        line.push(name);
        Ok(())
    }

    fn quad_k1(&mut self, element: &LatticeElement, field: f64) -> f64 {
        let file_k1 = -field / self.rigidity;
        let Some((setpoints, converter)) = self.live else {
            return file_k1;
        };
        let Some(current) = setpoints.get(&element.name) else {
            return file_k1;
        };
        if element.length <= 0.0 {
            warn!(
                "{} has zero length, setpoint {} A ignored",
                element.name, current
            );
            self.report.unresolved.push(element.name.clone());
            return file_k1;
        }
        match converter.c2gl(&element.name, current) {
            Conversion::Known(gradient) => {
                let k1 = gradient / element.length / self.rigidity;
                info!(
                    "{} setting changed from {:.6} to {:.6} m^-2",
                    element.name, file_k1, k1
                );
                self.report.overrides.push(QuadOverride {
                    name: element.name.clone(),
                    current,
                    file_k1,
                    k1,
                });
                k1
            }
            Conversion::Unknown => {
                warn!(
                    "{}: no calibration for setpoint {} A, keeping K1 = {:.6} from the layout",
                    element.name, current, file_k1
                );
                self.report.unresolved.push(element.name.clone());
                file_k1
            }
        }
    }

    fn element(&mut self, element: &LatticeElement) -> MadxElement {
        match element.kind {
            ElementKind::Quadrupole { field } => {
                let k1 = self.quad_k1(element, field);
                if let Some(counter) = quad_counter(&element.name) {
                    self.counter = counter.to_string();
                }
                MadxElement::Quadrupole {
                    length: element.length,
                    k1,
                }
            }
            ElementKind::Bend {
                theta,
                ea1,
                ea2,
                kls,
            } => MadxElement::SBend {
                length: element.length,
                angle: theta,
                k1: kls,
                e1: ea1,
                e2: ea2,
            },
            ElementKind::Marker => MadxElement::Monitor,
            ElementKind::Drift => MadxElement::Drift {
                length: element.length,
            },
        }
    }

    fn segment(&mut self, segment: &Segment) -> Result<Vec<String>, LatticeError> {
        if let Some(counter) = self.settings.counter_resets.get(&segment.name) {
            self.counter = counter.clone();
        }
        let tolerance = self.settings.drift_tolerance;

        let mut ordered: Vec<&LatticeElement> = segment.elements.iter().collect();
        ordered.sort_by(|a, b| a.position.total_cmp(&b.position));

        let mut line = Vec::with_capacity(ordered.len() * 2 + 1);
        let mut s = 0.0;
        for element in ordered {
            let (start, end) = element.footprint();
            let gap = start - s;
            if gap < -tolerance {
                return Err(LatticeError::Overlap {
                    segment: segment.name.clone(),
                    element: element.name.clone(),
                    start,
                    previous_end: s,
                });
            }
            if gap > tolerance {
                self.push_drift(gap, &mut line)?;
            }
            let translated = self.element(element);
            self.define(&element.name, translated);
            line.push(element.name.clone());
            s = end;
        }

        let remaining = segment.length - s;
        if remaining < -tolerance {
            return Err(LatticeError::SegmentTooShort {
                segment: segment.name.clone(),
                declared: segment.length,
                content: s,
            });
        }
        if remaining > tolerance {
            self.push_drift(remaining, &mut line)?;
        }
        Ok(line)
    }
}

/// Flattens `beamline` into MAD-X definitions and lines. When `live` is
/// given, quadrupoles with a setpoint get K1 = GL(I) / L / Bρ.
pub fn translate(
    beamline: &Beamline,
    reference: &ReferenceParticle,
    live: Option<(&Setpoints, &MagnetConverter)>,
    settings: &TranslatorSettings,
) -> Result<(MadxLattice, TranslationReport), LatticeError> {
    reference.validate()?;
    let rigidity = reference.rigidity();

    let taken = beamline
        .segments
        .iter()
        .flat_map(|segment| segment.elements.iter().map(|e| e.name.clone()))
        .collect();
    let mut translator = Translator {
        rigidity,
        live,
        settings,
        taken,
        counter: "00".to_string(),
        definitions: Vec::new(),
        defined: HashMap::new(),
        report: TranslationReport::default(),
    };

    let mut lines = Vec::with_capacity(beamline.segments.len());
    for segment in &beamline.segments {
        let line = translator.segment(segment)?;
        lines.push((segment.name.clone(), line));
    }

    let lattice = MadxLattice {
        definitions: translator.definitions,
        lines,
        composite_lines: settings.composite_lines.clone(),
        use_sequence: settings.use_sequence.clone(),
    };
    Ok((lattice, translator.report))
}

/// Translates `xml_path` and writes `<save_dir>/<stem>.madx`. The file is
/// rendered in memory and moved into place only once fully written.
pub fn xml_to_madx(
    xml_path: &Path,
    save_dir: &Path,
    reference: &ReferenceParticle,
    live: Option<(&Setpoints, &MagnetConverter)>,
    settings: &TranslatorSettings,
) -> Result<(PathBuf, TranslationReport)> {
    let beamline = Beamline::load(xml_path)?;
    let (lattice, report) = translate(&beamline, reference, live, settings)
        .with_context(|| format!("Failed to translate {}", xml_path.display()))?;

    let stem = xml_path
        .file_stem()
        .with_context(|| format!("{} has no file name", xml_path.display()))?;
    let mut file_name = stem.to_os_string();
    file_name.push(".madx");
    let output = save_dir.join(file_name);

    fs::create_dir_all(save_dir)
        .with_context(|| format!("Failed to create {}", save_dir.display()))?;
    write_atomically(&output, &lattice.render())?;
    info!(
        "Wrote {} ({} elements, {} drifts synthesized)",
        output.display(),
        lattice.definitions.len(),
        report.synthesized_drifts
    );
    Ok((output, report))
}

fn write_atomically(path: &Path, contents: &str) -> Result<()> {
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    let written = fs::write(&tmp, contents)
        .and_then(|_| fs::rename(&tmp, path))
        .with_context(|| format!("Failed to write {}", path.display()));
    if written.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    written
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::magnets::{CoefficientTable, Coefficients};

    fn quad(name: &str, position: f64, field: f64) -> LatticeElement {
        LatticeElement {
            name: name.to_string(),
            length: 1.0,
            position,
            kind: ElementKind::Quadrupole { field },
        }
    }

    fn single_segment(name: &str, length: f64, elements: Vec<LatticeElement>) -> Beamline {
        Beamline {
            segments: vec![Segment {
                name: name.to_string(),
                length,
                elements,
            }],
        }
    }

    fn bare_settings() -> TranslatorSettings {
        TranslatorSettings {
            counter_resets: BTreeMap::new(),
            composite_lines: Vec::new(),
            use_sequence: None,
            ..TranslatorSettings::default()
        }
    }

    #[test]
    fn gaps_are_filled_with_named_drifts() {
        let beamline = single_segment(
            "CELL",
            8.0,
            vec![quad("QH01", 2.0, 1.0), quad("QV02", 6.0, -1.0)],
        );
        let (lattice, report) = translate(
            &beamline,
            &ReferenceParticle::btf_hminus(),
            None,
            &bare_settings(),
        )
        .expect("translation should succeed");

        let line = lattice.line("CELL").expect("segment line");
        assert_eq!(line, ["DR00a", "QH01", "DR01a", "QV02", "DR02a"]);
        let drift_lengths: Vec<f64> = ["DR00a", "DR01a", "DR02a"]
            .iter()
            .map(|name| lattice.definition(name).expect("drift defined").length())
            .collect();
        assert_eq!(drift_lengths, [1.5, 3.0, 1.5]);
        assert_eq!(report.synthesized_drifts, 3);
        let total = lattice.line_length("CELL").expect("line length");
        assert!((total - 8.0).abs() < 1e-12, "total length {total}");
    }

    #[test]
    fn drift_name_collision_advances_letter() {
        let taken: HashSet<String> = ["DR06a", "DR06b"].iter().map(|s| s.to_string()).collect();
        assert_eq!(next_drift_name("06", &taken).expect("free name"), "DR06c");
        assert_eq!(next_drift_name("07", &taken).expect("free name"), "DR07a");
    }

    #[test]
    fn counter_is_the_quad_name_after_its_family_prefix() {
        assert_eq!(quad_counter("QH01"), Some("01"));
        assert_eq!(quad_counter("QV10A"), Some("10A"));
        assert_eq!(quad_counter("QH"), None);

        let beamline = single_segment("S", 4.0, vec![quad("QV10A", 1.0, 1.0)]);
        let (lattice, _) = translate(
            &beamline,
            &ReferenceParticle::btf_hminus(),
            None,
            &bare_settings(),
        )
        .expect("translation");
        assert_eq!(lattice.line("S").expect("line"), ["DR00a", "QV10A", "DR10Aa"]);
    }

    #[test]
    fn drift_names_run_out_after_z() {
        let taken: HashSet<String> = ('a'..='z').map(|c| format!("DR01{c}")).collect();
        assert!(matches!(
            next_drift_name("01", &taken),
            Err(LatticeError::DriftNamesExhausted(_))
        ));
    }

    #[test]
    fn file_gradient_sets_k1() {
        let reference = ReferenceParticle::btf_hminus();
        let beamline = single_segment("S", 1.0, vec![quad("QH01", 0.5, 2.0)]);
        let (lattice, _) =
            translate(&beamline, &reference, None, &bare_settings()).expect("translation");
        match lattice.definition("QH01") {
            Some(MadxElement::Quadrupole { k1, .. }) => {
                assert!((k1 + 2.0 / reference.rigidity()).abs() < 1e-12)
            }
            other => panic!("expected quadrupole, got {other:?}"),
        }
    }

    #[test]
    fn setpoints_override_known_quads_only() {
        let reference = ReferenceParticle::btf_hminus();
        let converter = MagnetConverter::new(CoefficientTable::from_entries([(
            "qh01",
            Coefficients { a: 0.01, b: 0.0 },
        )]));
        let setpoints: Setpoints = [("QH01", 5.0), ("QV02", 3.0)].into_iter().collect();
        let beamline = single_segment(
            "S",
            8.0,
            vec![quad("QH01", 2.0, 1.0), quad("QV02", 6.0, -1.0)],
        );
        let (lattice, report) = translate(
            &beamline,
            &reference,
            Some((&setpoints, &converter)),
            &bare_settings(),
        )
        .expect("translation");

        assert_eq!(report.overrides.len(), 1);
        assert_eq!(report.overrides[0].name, "QH01");
        assert_eq!(report.unresolved, ["QV02"]);
        let expected = 0.05 / 1.0 / reference.rigidity();
        assert!((report.overrides[0].k1 - expected).abs() < 1e-12);
        match lattice.definition("QV02") {
            Some(MadxElement::Quadrupole { k1, .. }) => {
                assert!((k1 - 1.0 / reference.rigidity()).abs() < 1e-12)
            }
            other => panic!("expected quadrupole, got {other:?}"),
        }
    }

    #[test]
    fn counter_reset_applies_per_segment() {
        let beamline = Beamline {
            segments: vec![
                Segment {
                    name: "MEBT1".to_string(),
                    length: 3.0,
                    elements: vec![quad("QH09", 1.0, 1.0)],
                },
                Segment {
                    name: "STUB".to_string(),
                    length: 2.0,
                    elements: vec![],
                },
            ],
        };
        let (lattice, _) = translate(
            &beamline,
            &ReferenceParticle::btf_hminus(),
            None,
            &TranslatorSettings::default(),
        )
        .expect("translation");
        assert_eq!(lattice.line("MEBT1").expect("line"), ["DR00a", "QH09", "DR09a"]);
        assert_eq!(lattice.line("STUB").expect("line"), ["DR06a"]);
    }

    #[test]
    fn overlapping_elements_are_rejected() {
        let beamline = single_segment(
            "S",
            4.0,
            vec![quad("QH01", 1.0, 1.0), quad("QV02", 1.5, 1.0)],
        );
        let err = translate(
            &beamline,
            &ReferenceParticle::btf_hminus(),
            None,
            &bare_settings(),
        )
        .expect_err("overlap must fail");
        assert!(matches!(err, LatticeError::Overlap { .. }), "{err}");
    }

    #[test]
    fn short_segment_is_rejected_not_clamped() {
        let beamline = single_segment("S", 2.0, vec![quad("QH01", 2.0, 1.0)]);
        let err = translate(
            &beamline,
            &ReferenceParticle::btf_hminus(),
            None,
            &bare_settings(),
        )
        .expect_err("short segment must fail");
        match err {
            LatticeError::SegmentTooShort {
                declared, content, ..
            } => {
                assert_eq!(declared, 2.0);
                assert_eq!(content, 2.5);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn marker_length_is_absorbed_by_neighbouring_drifts() {
        let beamline = single_segment(
            "S",
            2.0,
            vec![LatticeElement {
                name: "BPM01".to_string(),
                length: 0.2,
                position: 1.0,
                kind: ElementKind::Marker,
            }],
        );
        let (lattice, _) = translate(
            &beamline,
            &ReferenceParticle::btf_hminus(),
            None,
            &bare_settings(),
        )
        .expect("translation");
        assert_eq!(lattice.line("S").expect("line"), ["DR00a", "BPM01", "DR00b"]);
        assert_eq!(lattice.definition("DR00a").expect("drift").length(), 1.0);
        assert_eq!(lattice.definition("DR00b").expect("drift").length(), 1.0);
        let total = lattice.line_length("S").expect("line length");
        assert!((total - 2.0).abs() < 1e-12, "total length {total}");
    }

    #[test]
    fn render_lists_definitions_lines_and_directives() {
        let beamline = single_segment(
            "MEBT1",
            2.0,
            vec![
                LatticeElement {
                    name: "BPM01".to_string(),
                    length: 0.0,
                    position: 0.5,
                    kind: ElementKind::Marker,
                },
                LatticeElement {
                    name: "DH01".to_string(),
                    length: 0.5,
                    position: 1.75,
                    kind: ElementKind::Bend {
                        theta: 0.7854,
                        ea1: 0.1,
                        ea2: 0.2,
                        kls: 0.0,
                    },
                },
            ],
        );
        let settings = TranslatorSettings {
            composite_lines: vec![CompositeLine {
                name: "ALL".to_string(),
                members: vec!["MEBT1".to_string()],
            }],
            use_sequence: Some("ALL".to_string()),
            ..bare_settings()
        };
        let (lattice, _) = translate(
            &beamline,
            &ReferenceParticle::btf_hminus(),
            None,
            &settings,
        )
        .expect("translation");
        let expected = "\
DR00a: DRIFT, L=0.500;
BPM01: MONITOR, L=0.0;
DR00b: DRIFT, L=1.000;
DH01: SBEND, L=0.500, ANGLE=0.785, K1=0.000, E1=0.100, E2=0.200;

MEBT1: LINE=(DR00a,BPM01,DR00b,DH01);

ALL: LINE=(MEBT1);
USE,SEQUENCE=ALL;
";
        assert_eq!(lattice.render(), expected);
        let (again, _) = translate(
            &beamline,
            &ReferenceParticle::btf_hminus(),
            None,
            &settings,
        )
        .expect("translation");
        assert_eq!(again.render(), expected);
    }
}
