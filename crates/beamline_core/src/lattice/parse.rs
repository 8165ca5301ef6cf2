use anyhow::{Context, Result};
use roxmltree::{Document, Node};
use std::fs;
use std::path::Path;

use super::{Beamline, ElementKind, LatticeElement, LatticeError, Segment};

impl Beamline {
    /// Parses the XML layout: the root's children are segments carrying
    /// `name` and `length`; their children are elements carrying `name`,
    /// `length`, `pos` and `type`, with type parameters on the last child.
    pub fn from_xml(text: &str) -> Result<Beamline, LatticeError> {
        let doc = Document::parse(text).map_err(|err| LatticeError::Xml(err.to_string()))?;
        let segments = doc
            .root_element()
            .children()
            .filter(Node::is_element)
            .map(parse_segment)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Beamline { segments })
    }

    pub fn load(path: &Path) -> Result<Beamline> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read beamline file {}", path.display()))?;
        Self::from_xml(&text).with_context(|| format!("Failed to parse {}", path.display()))
    }
}

fn parse_segment(node: Node<'_, '_>) -> Result<Segment, LatticeError> {
    let name = required(node, "name", "?")?.to_string();
    let length = number(node, "length", &name)?;
    let elements = node
        .children()
        .filter(Node::is_element)
        .map(|child| parse_element(child, &name))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Segment {
        name,
        length,
        elements,
    })
}

fn parse_element(node: Node<'_, '_>, segment: &str) -> Result<LatticeElement, LatticeError> {
    let full_name = required(node, "name", segment)?;
    // Layout names look like `BTF_MEBT_Mag:QH01`.
    let name = full_name
        .split_once(':')
        .map_or(full_name, |(_, short)| short)
        .to_string();
    let length = number(node, "length", &name)?;
    let position = number(node, "pos", &name)?;
    let kind_name = required(node, "type", &name)?;

    let params = node.children().filter(Node::is_element).last();
    let param = |attribute: &'static str| match params {
        Some(p) => number(p, attribute, &name),
        None => Err(LatticeError::MissingAttribute {
            tag: node.tag_name().name().to_string(),
            owner: name.clone(),
            attribute,
        }),
    };

    let kind = match kind_name.to_ascii_uppercase().as_str() {
        "QUAD" => ElementKind::Quadrupole {
            field: param("field")?,
        },
        "BEND" => ElementKind::Bend {
            theta: param("theta")?,
            ea1: param("ea1")?,
            ea2: param("ea2")?,
            kls: param("kls")?,
        },
        "MARKER" => ElementKind::Marker,
        "DRIFT" => ElementKind::Drift,
        _ => {
            return Err(LatticeError::UnknownElementType {
                name,
                kind: kind_name.to_string(),
            })
        }
    };

    Ok(LatticeElement {
        name,
        length,
        position,
        kind,
    })
}

fn required<'a>(
    node: Node<'a, '_>,
    attribute: &'static str,
    owner: &str,
) -> Result<&'a str, LatticeError> {
    node.attribute(attribute)
        .ok_or_else(|| LatticeError::MissingAttribute {
            tag: node.tag_name().name().to_string(),
            owner: owner.to_string(),
            attribute,
        })
}

fn number(node: Node<'_, '_>, attribute: &'static str, owner: &str) -> Result<f64, LatticeError> {
    let raw = required(node, attribute, owner)?;
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| LatticeError::InvalidNumber {
            owner: owner.to_string(),
            attribute,
            value: raw.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use crate::lattice::{Beamline, ElementKind, LatticeError};

    const LAYOUT: &str = r#"<?xml version="1.0"?>
<xdxf>
  <sequence name="MEBT1" length="2.0">
    <node name="BTF_MEBT_Mag:QH01" type="QUAD" length="0.1" pos="0.5">
      <parameters field="-1.25"/>
    </node>
    <node name="BTF_MEBT_Diag:BPM01" type="MARKER" length="0.0" pos="0.9"/>
    <node name="BTF_MEBT_Mag:DH01" type="BEND" length="0.4" pos="1.5">
      <parameters theta="0.785" ea1="0.1" ea2="0.2" kls="0.0"/>
    </node>
  </sequence>
</xdxf>"#;

    #[test]
    fn parses_segments_and_typed_elements() {
        let beamline = Beamline::from_xml(LAYOUT).expect("layout should parse");
        assert_eq!(beamline.segments.len(), 1);
        let segment = beamline.segment("MEBT1").expect("segment exists");
        assert_eq!(segment.length, 2.0);
        let names: Vec<&str> = segment.elements.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["QH01", "BPM01", "DH01"]);
        assert_eq!(
            segment.elements[0].kind,
            ElementKind::Quadrupole { field: -1.25 }
        );
        assert_eq!(segment.elements[1].kind, ElementKind::Marker);
        match segment.elements[2].kind {
            ElementKind::Bend { theta, ea2, .. } => {
                assert_eq!(theta, 0.785);
                assert_eq!(ea2, 0.2);
            }
            ref other => panic!("expected bend, got {other:?}"),
        }
    }

    #[test]
    fn quad_without_field_is_a_lookup_error() {
        let xml = r#"<root><seg name="S" length="1.0">
            <e name="X:QH01" type="QUAD" length="0.1" pos="0.5"><p other="1"/></e>
        </seg></root>"#;
        let err = Beamline::from_xml(xml).expect_err("missing field must fail");
        assert_eq!(
            err,
            LatticeError::MissingAttribute {
                tag: "p".to_string(),
                owner: "QH01".to_string(),
                attribute: "field",
            }
        );
    }

    #[test]
    fn unknown_type_and_bad_numbers_are_rejected() {
        let unknown = r#"<root><seg name="S" length="1.0">
            <e name="X:RF01" type="RFGAP" length="0.1" pos="0.5"/>
        </seg></root>"#;
        assert!(matches!(
            Beamline::from_xml(unknown),
            Err(LatticeError::UnknownElementType { .. })
        ));

        let bad = r#"<root><seg name="S" length="one"/></root>"#;
        assert!(matches!(
            Beamline::from_xml(bad),
            Err(LatticeError::InvalidNumber { attribute: "length", .. })
        ));

        assert!(matches!(
            Beamline::from_xml("<root><unclosed></root>"),
            Err(LatticeError::Xml(_))
        ));
    }
}
