//! XML utilities using quick-xml for generating, parsing and editing libvirt descriptors
//!
//! Descriptors are parsed into a small owned DOM ([`XmlNode`]), edited in place and
//! serialized back through [`XmlWriter`], so no XML is ever assembled by string
//! concatenation.

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::reader::Reader;
use quick_xml::writer::Writer;
use std::io::Cursor;

use crate::error::{ProvisionError, Result};

fn xml_err(context: &str, e: impl std::fmt::Display) -> ProvisionError {
    ProvisionError::Xml(format!("{context}: {e}"))
}

/// A builder for creating XML documents with quick-xml
pub struct XmlWriter {
    writer: Writer<Cursor<Vec<u8>>>,
}

impl std::fmt::Debug for XmlWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XmlWriter")
            .field("len", &self.writer.get_ref().get_ref().len())
            .finish()
    }
}

impl XmlWriter {
    /// Create a new XML writer
    pub fn new() -> Self {
        Self {
            writer: Writer::new(Cursor::new(Vec::new())),
        }
    }

    /// Start an XML element with attributes
    pub fn start_element(&mut self, name: &str, attributes: &[(&str, &str)]) -> Result<()> {
        let mut elem = BytesStart::new(name);
        for (key, value) in attributes {
            elem.push_attribute((*key, *value));
        }
        self.writer
            .write_event(Event::Start(elem))
            .map_err(|e| xml_err("Failed to write start element", e))?;
        Ok(())
    }

    /// Write a simple element with text content
    pub fn write_text_element(&mut self, name: &str, text: &str) -> Result<()> {
        self.start_element(name, &[])?;
        self.write_text(text)?;
        self.end_element(name)?;
        Ok(())
    }

    /// Write a simple element with text content and attributes
    pub fn write_text_element_with_attrs(
        &mut self,
        name: &str,
        text: &str,
        attributes: &[(&str, &str)],
    ) -> Result<()> {
        self.start_element(name, attributes)?;
        if !text.is_empty() {
            self.write_text(text)?;
        }
        self.end_element(name)?;
        Ok(())
    }

    /// Write a self-closing element with attributes
    pub fn write_empty_element(&mut self, name: &str, attributes: &[(&str, &str)]) -> Result<()> {
        let mut elem = BytesStart::new(name);
        for (key, value) in attributes {
            elem.push_attribute((*key, *value));
        }
        self.writer
            .write_event(Event::Empty(elem))
            .map_err(|e| xml_err("Failed to write empty element", e))?;
        Ok(())
    }

    /// Write text content
    pub fn write_text(&mut self, text: &str) -> Result<()> {
        if !text.is_empty() {
            self.writer
                .write_event(Event::Text(BytesText::new(text)))
                .map_err(|e| xml_err("Failed to write text", e))?;
        }
        Ok(())
    }

    /// End an XML element
    pub fn end_element(&mut self, name: &str) -> Result<()> {
        self.writer
            .write_event(Event::End(BytesEnd::new(name)))
            .map_err(|e| xml_err("Failed to write end element", e))?;
        Ok(())
    }

    /// Write a parsed node and all of its descendants
    pub fn write_node(&mut self, node: &XmlNode) -> Result<()> {
        let attrs: Vec<(&str, &str)> = node
            .attributes
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        if node.children.is_empty() && node.text.is_empty() {
            return self.write_empty_element(&node.name, &attrs);
        }
        self.start_element(&node.name, &attrs)?;
        self.write_text(&node.text)?;
        for child in &node.children {
            self.write_node(child)?;
        }
        self.end_element(&node.name)
    }

    /// Get the generated XML as a string
    pub fn into_string(self) -> Result<String> {
        let bytes = self.writer.into_inner().into_inner();
        String::from_utf8(bytes).map_err(|e| xml_err("Failed to convert XML to string", e))
    }
}

impl Default for XmlWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Simple DOM node for XML parsing
///
/// Attributes keep their document order so that a parse/serialize cycle
/// produces a stable descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XmlNode {
    /// Element name, including any namespace prefix
    pub name: String,
    /// Attributes in document order
    pub attributes: Vec<(String, String)>,
    /// Concatenated text content (whitespace trimmed)
    pub text: String,
    /// Child elements in document order
    pub children: Vec<XmlNode>,
}

impl XmlNode {
    /// Create an empty element
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Builder-style attribute setter
    pub fn with_attr(mut self, key: &str, value: impl Into<String>) -> Self {
        self.set_attr(key, value);
        self
    }

    /// Builder-style text setter
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    /// Builder-style child append
    pub fn with_child(mut self, child: XmlNode) -> Self {
        self.children.push(child);
        self
    }

    /// Look up an attribute value
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Set an attribute, replacing any existing value in place
    pub fn set_attr(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.attributes.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = value,
            None => self.attributes.push((key.to_string(), value)),
        }
    }

    /// Find first element by name (recursive search)
    pub fn find(&self, element_name: &str) -> Option<&XmlNode> {
        if self.name == element_name {
            return Some(self);
        }

        for child in &self.children {
            if let Some(found) = child.find(element_name) {
                return Some(found);
            }
        }

        None
    }

    /// Mutable variant of [`XmlNode::find`]
    pub fn find_mut(&mut self, element_name: &str) -> Option<&mut XmlNode> {
        if self.name == element_name {
            return Some(self);
        }
        self.children
            .iter_mut()
            .find_map(|child| child.find_mut(element_name))
    }

    /// Collect every element with this name, in document order
    pub fn find_all(&self, element_name: &str) -> Vec<&XmlNode> {
        let mut found = Vec::new();
        self.collect_named(element_name, &mut found);
        found
    }

    fn collect_named<'a>(&'a self, element_name: &str, out: &mut Vec<&'a XmlNode>) {
        if self.name == element_name {
            out.push(self);
        }
        for child in &self.children {
            child.collect_named(element_name, out);
        }
    }

    /// Apply `f` to every element with this name
    pub fn for_each_named_mut(&mut self, element_name: &str, f: &mut impl FnMut(&mut XmlNode)) {
        if self.name == element_name {
            f(self);
        }
        for child in &mut self.children {
            child.for_each_named_mut(element_name, f);
        }
    }

    /// First direct child with this name
    pub fn child(&self, element_name: &str) -> Option<&XmlNode> {
        self.children.iter().find(|c| c.name == element_name)
    }

    /// Mutable first direct child with this name
    pub fn child_mut(&mut self, element_name: &str) -> Option<&mut XmlNode> {
        self.children.iter_mut().find(|c| c.name == element_name)
    }

    /// Direct children with this name
    pub fn children_named<'a>(
        &'a self,
        element_name: &'a str,
    ) -> impl Iterator<Item = &'a XmlNode> + 'a {
        self.children.iter().filter(move |c| c.name == element_name)
    }

    /// Return the direct child with this name, creating it if absent
    pub fn ensure_child(&mut self, element_name: &str) -> &mut XmlNode {
        let idx = match self.children.iter().position(|c| c.name == element_name) {
            Some(idx) => idx,
            None => {
                self.children.push(XmlNode::new(element_name));
                self.children.len() - 1
            }
        };
        &mut self.children[idx]
    }

    /// Remove every descendant element with this name; returns how many were removed
    pub fn remove_descendants(&mut self, element_name: &str) -> usize {
        let before = self.children.len();
        self.children.retain(|c| c.name != element_name);
        let mut removed = before - self.children.len();
        for child in &mut self.children {
            removed += child.remove_descendants(element_name);
        }
        removed
    }

    /// Get text content of this node
    pub fn text_content(&self) -> &str {
        &self.text
    }

    /// Serialize this node and its descendants
    pub fn to_xml(&self) -> Result<String> {
        let mut writer = XmlWriter::new();
        writer.write_node(self)?;
        writer.into_string()
    }
}

fn node_from_start(e: &BytesStart<'_>) -> Result<XmlNode> {
    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    let mut attributes = Vec::new();

    for attr in e.attributes() {
        let attr = attr.map_err(|e| xml_err("Invalid attribute", e))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| xml_err("Invalid attribute value", e))?
            .into_owned();
        attributes.push((key, value));
    }

    Ok(XmlNode {
        name,
        attributes,
        text: String::new(),
        children: Vec::new(),
    })
}

/// Parse XML string into a simple DOM structure
pub fn parse_xml_dom(xml: &str) -> Result<XmlNode> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();

    let mut stack: Vec<XmlNode> = Vec::new();
    let mut root: Option<XmlNode> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                stack.push(node_from_start(&e)?);
            }
            Ok(Event::Empty(e)) => {
                let node = node_from_start(&e)?;

                // Add to parent or set as root
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(node);
                } else if root.is_none() {
                    root = Some(node);
                }
            }
            Ok(Event::End(_)) => {
                if let Some(completed_node) = stack.pop() {
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(completed_node);
                    } else {
                        root = Some(completed_node);
                    }
                }
            }
            Ok(Event::Text(e)) => {
                let text = e.unescape().map_err(|e| xml_err("Invalid text", e))?;
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&text);
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(xml_err("Failed to parse XML", e)),
            _ => {}
        }
        buf.clear();
    }

    if !stack.is_empty() {
        return Err(ProvisionError::Xml("Unterminated element".into()));
    }
    root.ok_or_else(|| ProvisionError::Xml("No root element found in XML".into()))
}
