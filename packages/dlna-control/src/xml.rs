//! Thin pull-reader and builder-writer over xml-rs.
//!
//! The reader supports documents where an element contains either text or
//! child elements; that is all UPnP descriptions, SOAP envelopes and GENA
//! property sets need. The writer builds namespaced documents through nested
//! closures.

use std::io::{Read, Write};

use xml::{
    EmitterConfig, EventReader, EventWriter,
    common::XmlVersion,
    name::OwnedName,
    reader,
    writer,
};

use crate::error::{Error, Result};

type Map<K, V> = std::collections::BTreeMap<K, V>;

/// An XML name made up of an optional namespace and a local name.
#[derive(Clone, PartialEq, Eq, Debug)]
pub(crate) struct XmlName {
    pub(crate) namespace: Option<String>,
    pub(crate) local_name: String,
}

impl XmlName {
    pub(crate) fn local(local_name: &str) -> Self {
        Self {
            namespace: None,
            local_name: local_name.to_owned(),
        }
    }

    pub(crate) fn qualified(namespace: &str, local_name: &str) -> Self {
        Self {
            namespace: Some(namespace.to_owned()),
            local_name: local_name.to_owned(),
        }
    }

    /// A reference form that is easy to match against.
    pub(crate) fn as_ref(&self) -> (Option<&str>, &str) {
        (self.namespace.as_deref(), &self.local_name)
    }
}

impl From<OwnedName> for XmlName {
    fn from(name: OwnedName) -> Self {
        XmlName {
            namespace: name.namespace,
            local_name: name.local_name,
        }
    }
}

impl<'a> From<(&'a str, &'a str)> for XmlName {
    fn from((ns, local): (&'a str, &'a str)) -> XmlName {
        XmlName::qualified(ns, local)
    }
}

/// An element start as seen by [`XmlReader`].
pub(crate) struct Element {
    pub(crate) name: XmlName,
}

pub(crate) struct XmlReader<R: Read> {
    reader: EventReader<R>,
}

impl<R: Read> XmlReader<R> {
    pub(crate) fn new(reader: R) -> Self {
        Self {
            reader: EventReader::new(reader),
        }
    }

    /// The next child element of the current element, or `None` when the
    /// current element closes.
    pub(crate) fn next_element(&mut self) -> Result<Option<Element>> {
        loop {
            match self.reader.next()? {
                reader::XmlEvent::EndDocument => {
                    return Err(Error::Parse("unexpected end of XML document".into()));
                }
                reader::XmlEvent::StartElement { name, .. } => {
                    return Ok(Some(Element { name: name.into() }));
                }
                reader::XmlEvent::EndElement { .. } => return Ok(None),
                _ => {}
            }
        }
    }

    /// The text content of the current element, consuming up to its end tag.
    /// `None` when the element held no character data.
    pub(crate) fn text(&mut self) -> Result<Option<String>> {
        let mut content = String::new();
        let mut saw_text = false;

        loop {
            match self.reader.next()? {
                reader::XmlEvent::EndDocument => {
                    return Err(Error::Parse("unexpected end of XML document".into()));
                }
                reader::XmlEvent::StartElement { name, .. } => {
                    return Err(Error::Parse(format!(
                        "unexpected element {} where text was expected",
                        name
                    )));
                }
                reader::XmlEvent::EndElement { .. } => break,
                reader::XmlEvent::CData(text) | reader::XmlEvent::Characters(text) => {
                    content += &text;
                    saw_text = true;
                }
                reader::XmlEvent::Whitespace(text) => content += &text,
                _ => {}
            }
        }

        if saw_text { Ok(Some(content)) } else { Ok(None) }
    }

    /// Consumes the rest of the current element, children included.
    pub(crate) fn skip(&mut self) -> Result<()> {
        let mut depth = 1u32;
        loop {
            match self.reader.next()? {
                reader::XmlEvent::EndDocument => {
                    return Err(Error::Parse("unexpected end of XML document".into()));
                }
                reader::XmlEvent::StartElement { .. } => depth += 1,
                reader::XmlEvent::EndElement { .. } => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(());
                    }
                }
                _ => {}
            }
        }
    }
}

/// A new element being written; attributes and prefixes accumulate until the
/// content closure runs.
#[must_use]
pub(crate) struct ElementBuilder<'a, W: Write> {
    previous_prefixes: Map<String, String>,
    tag_name: XmlName,
    attributes: Vec<(XmlName, String)>,
    new_prefixes: Map<String, String>,
    writer: &'a mut XmlWriter<W>,
}

impl<W: Write> ElementBuilder<'_, W> {
    fn to_name(&self, xml_name: &XmlName) -> OwnedName {
        match &xml_name.namespace {
            Some(ns) => {
                let prefix = self
                    .writer
                    .known_prefixes
                    .get(ns)
                    .cloned()
                    .unwrap_or_default();
                OwnedName::qualified(
                    &xml_name.local_name,
                    ns,
                    if prefix.is_empty() { None } else { Some(prefix) },
                )
            }
            None => OwnedName::local(&xml_name.local_name),
        }
    }

    fn ensure_prefix(&mut self, namespace: String, is_element: bool) {
        if self.previous_prefixes.contains_key(&namespace)
            || self.new_prefixes.contains_key(&namespace)
        {
            return;
        }

        if is_element {
            self.new_prefixes.insert(namespace, String::new());
        } else {
            for candidate in 'a'..='z' {
                let candidate = candidate.to_string();
                if !self.new_prefixes.values().any(|p| *p == candidate) {
                    self.new_prefixes.insert(namespace, candidate);
                    return;
                }
            }
        }
    }

    fn build(&mut self) -> Result<()> {
        if let Some(ns) = self.tag_name.namespace.clone() {
            self.ensure_prefix(ns, true);
        }
        let attr_namespaces: Vec<String> = self
            .attributes
            .iter()
            .filter_map(|(name, _)| name.namespace.clone())
            .collect();
        for ns in attr_namespaces {
            self.ensure_prefix(ns, false);
        }

        for (uri, prefix) in &self.new_prefixes {
            self.writer
                .known_prefixes
                .insert(uri.clone(), prefix.clone());
        }

        let element_name = self.to_name(&self.tag_name);
        let mut event = writer::XmlEvent::start_element(element_name.borrow());

        for (uri, prefix) in &self.new_prefixes {
            event = if prefix.is_empty() {
                event.default_ns(uri)
            } else {
                event.ns(prefix, uri)
            };
        }

        let attrs: Vec<(OwnedName, &String)> = self
            .attributes
            .iter()
            .map(|(name, value)| (self.to_name(name), value))
            .collect();
        for (name, value) in attrs.iter() {
            event = event.attr(name.borrow(), value);
        }

        self.writer.writer.write(event)?;
        Ok(())
    }

    fn done(self) -> Result<()> {
        self.writer.writer.write(writer::XmlEvent::end_element())?;
        self.writer.known_prefixes = self.previous_prefixes;
        Ok(())
    }

    pub(crate) fn attr<N: Into<XmlName>, D: ToString>(mut self, name: N, value: D) -> Self {
        self.attributes.push((name.into(), value.to_string()));
        self
    }

    /// Declares a namespace prefix on this element.
    pub(crate) fn prefix(mut self, prefix: &str, uri: &str) -> Self {
        self.new_prefixes.insert(uri.to_owned(), prefix.to_owned());
        self
    }

    pub(crate) fn text<T: ToString>(self, text: T) -> Result<()> {
        self.contents(|writer| {
            writer
                .writer
                .write(writer::XmlEvent::characters(&text.to_string()))?;
            Ok(())
        })
    }

    pub(crate) fn contents<F>(mut self, cb: F) -> Result<()>
    where
        F: for<'b> FnOnce(&'b mut XmlWriter<W>) -> Result<()>,
    {
        self.build()?;
        cb(self.writer)?;
        self.done()
    }
}

pub(crate) struct XmlWriter<W: Write> {
    writer: EventWriter<W>,
    known_prefixes: Map<String, String>,
}

impl<W: Write> XmlWriter<W> {
    /// Writes a full document with an XML declaration, rooted in whatever
    /// the closure produces.
    pub(crate) fn write_document<F>(sink: W, root: F) -> Result<()>
    where
        F: for<'a> FnOnce(&'a mut XmlWriter<W>) -> Result<()>,
    {
        let mut writer = EmitterConfig::new().create_writer(sink);
        writer.write(writer::XmlEvent::StartDocument {
            version: XmlVersion::Version10,
            encoding: Some("utf-8"),
            standalone: None,
        })?;

        root(&mut XmlWriter {
            writer,
            known_prefixes: Map::new(),
        })
    }

    /// Opens a namespaced element.
    pub(crate) fn element_ns<T: Into<XmlName>>(&mut self, tag_name: T) -> ElementBuilder<'_, W> {
        ElementBuilder {
            previous_prefixes: self.known_prefixes.clone(),
            tag_name: tag_name.into(),
            attributes: Vec::new(),
            new_prefixes: Map::new(),
            writer: self,
        }
    }

    /// Opens an element with no namespace.
    pub(crate) fn element(&mut self, tag_name: &str) -> ElementBuilder<'_, W> {
        ElementBuilder {
            previous_prefixes: self.known_prefixes.clone(),
            tag_name: XmlName::local(tag_name),
            attributes: Vec::new(),
            new_prefixes: Map::new(),
            writer: self,
        }
    }
}
