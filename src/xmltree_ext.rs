use std::borrow::Cow;
use std::io::{Read, Write};

use http::StatusCode;
use xml::EmitterConfig;
use xml::common::XmlVersion;
use xml::writer::EventWriter;
use xml::writer::XmlEvent as XmlWEvent;
use xmltree::{self, Element, XMLNode};

use crate::{DavError, DavResult};

pub(crate) const NS_DAV_URI: &str = "DAV:";
pub(crate) const NS_SABRE_URI: &str = "http://sabredav.org/ns";
pub(crate) const NS_OWNCLOUD_URI: &str = "http://owncloud.org/ns";

pub(crate) trait ElementExt {
    fn parse2<R: Read>(r: R) -> Result<Element, DavError>;
    fn child_elems(&self) -> impl Iterator<Item = &Element>;
    fn is(&self, ns: &str, name: &str) -> bool;
    fn text_content(&self) -> String;
    fn has_children(&self) -> bool;
    fn inner_xml(&self) -> DavResult<String>;
}

impl ElementExt for Element {
    fn parse2<R: Read>(r: R) -> Result<Element, DavError> {
        match Element::parse(r) {
            Ok(elems) => Ok(elems),
            Err(xmltree::ParseError::MalformedXml(_)) => Err(DavError::XmlParseError),
            Err(_) => Err(DavError::XmlReadError),
        }
    }

    fn child_elems(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|n| match n {
            XMLNode::Element(e) => Some(e),
            _ => None,
        })
    }

    fn is(&self, ns: &str, name: &str) -> bool {
        self.name == name && self.namespace.as_deref() == Some(ns)
    }

    fn text_content(&self) -> String {
        self.get_text().map(|t| t.trim().to_string()).unwrap_or_default()
    }

    fn has_children(&self) -> bool {
        self.children.iter().any(|n| match n {
            XMLNode::Element(_) => true,
            XMLNode::Text(t) => !t.trim().is_empty(),
            _ => false,
        })
    }

    // serialize the children, as found in e.g. a lock owner.
    fn inner_xml(&self) -> DavResult<String> {
        let mut out = Vec::new();
        for node in &self.children {
            match node {
                XMLNode::Element(e) => {
                    let cfg = EmitterConfig::new().write_document_declaration(false);
                    e.write_with_config(&mut out, cfg)
                        .map_err(|_| DavError::Status(StatusCode::INTERNAL_SERVER_ERROR))?;
                }
                XMLNode::Text(t) => {
                    out.extend_from_slice(xml::escape::escape_str_pcdata(t).as_bytes())
                }
                _ => {}
            }
        }
        String::from_utf8(out).map_err(|_| DavError::XmlParseError)
    }
}

pub(crate) fn emitter<W: Write>(w: W) -> DavResult<EventWriter<W>> {
    let mut emitter = EventWriter::new_with_config(
        w,
        EmitterConfig {
            perform_indent: false,
            indent_string: Cow::Borrowed(""),
            ..Default::default()
        },
    );
    emitter.write(XmlWEvent::StartDocument {
        version: XmlVersion::Version10,
        encoding: Some("UTF-8"),
        standalone: None,
    })?;
    Ok(emitter)
}

// <name>text</name>
pub(crate) fn write_elem<W: Write>(
    emitter: &mut EventWriter<W>,
    name: &str,
    text: &str,
) -> DavResult<()> {
    emitter.write(XmlWEvent::start_element(name))?;
    if !text.is_empty() {
        emitter.write(XmlWEvent::characters(text))?;
    }
    emitter.write(XmlWEvent::end_element())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_walk() {
        let xml = r#"<?xml version="1.0"?>
            <d:lockinfo xmlns:d="DAV:">
              <d:lockscope><d:exclusive/></d:lockscope>
              <d:owner><d:href>mailto:a@b</d:href></d:owner>
            </d:lockinfo>"#;
        let root = Element::parse2(xml.as_bytes()).unwrap();
        assert!(root.is(NS_DAV_URI, "lockinfo"));
        let names: Vec<_> = root.child_elems().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["lockscope", "owner"]);
        let owner = root.child_elems().nth(1).unwrap();
        assert!(owner.has_children());
        assert!(owner.inner_xml().unwrap().contains("mailto:a@b"));
    }

    #[test]
    fn malformed() {
        assert!(Element::parse2("<a><b></a>".as_bytes()).is_err());
    }

    #[test]
    fn write() {
        let mut em = emitter(Vec::new()).unwrap();
        em.write(XmlWEvent::start_element("d:prop").ns("d", NS_DAV_URI))
            .unwrap();
        write_elem(&mut em, "d:getetag", "a&b").unwrap();
        write_elem(&mut em, "d:resourcetype", "").unwrap();
        em.write(XmlWEvent::end_element()).unwrap();
        let s = String::from_utf8(em.into_inner()).unwrap();
        assert!(s.contains("<d:getetag>a&amp;b</d:getetag>"));
        assert!(s.contains("<d:resourcetype />") || s.contains("<d:resourcetype/>"));
    }
}
