use std::collections::HashMap;

use anyhow::{anyhow, bail, Error};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::xml::namespaces;
use crate::xml::{Element, Node};
use crate::xmpp::stream_header::StreamHeader;

fn escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// Serializes elements onto an async writer, tracking which namespaces are
/// in scope so elements inside the stream's default namespace come out
/// unprefixed. Every write is flushed; delivery is best-effort and a
/// failed write is fatal for the connection that owns this writer.
pub struct StreamWriter<W: AsyncWrite + Unpin> {
    writer: W,
    namespaces: Vec<HashMap<String, String>>, // stacked namespace to prefix map
}

impl<W: AsyncWrite + Unpin> StreamWriter<W> {
    pub fn new(writer: W) -> Self {
        let mut namespaces = HashMap::new();
        namespaces.insert(namespaces::XML.to_string(), "xml".to_string());
        namespaces.insert(namespaces::XMLNS.to_string(), "xmlns".to_string());
        let namespaces = vec![namespaces];

        Self { writer, namespaces }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    pub async fn write_stream_header(
        &mut self,
        header: &StreamHeader,
        include_xml_declaration: bool,
    ) -> Result<(), Error> {
        if include_xml_declaration {
            self.write_xml_declaration().await?;
        }

        let Some(ref from) = header.from else {
            bail!("`from` field is required in outgoing stream header");
        };

        let mut stream_element = Element::new("stream", Some(namespaces::XMPP_STREAMS));
        stream_element.set_attribute("from", None, &from.to_string());
        if let Some(ref to) = header.to {
            stream_element.set_attribute("to", None, &to.to_string());
        }
        if let Some(ref id) = header.id {
            stream_element.set_attribute("id", None, &id.to_string());
        }
        stream_element.set_attribute("version", None, "1.0");
        stream_element.set_attribute("lang", Some(namespaces::XML), "en");
        stream_element.set_attribute("xmlns", None, namespaces::XMPP_CLIENT);
        stream_element.set_attribute("stream", Some(namespaces::XMLNS), namespaces::XMPP_STREAMS);

        let opening_tag = self.build_opening_tag(&stream_element, false);
        self.write_str(&opening_tag).await
    }

    pub async fn write_stream_close(&mut self) -> Result<(), Error> {
        let stream_element = Element::new("stream", Some(namespaces::XMPP_STREAMS));
        let closing_tag = self.build_closing_tag(&stream_element);
        self.write_str(&closing_tag).await
    }

    pub async fn write_xml_element(&mut self, element: &Element) -> Result<(), Error> {
        let xml = self.build_xml_element(element);
        self.write_str(&xml).await
    }

    async fn write_str(&mut self, string: &str) -> Result<(), Error> {
        tracing::trace!(xml = string, "writing");
        self.writer
            .write_all(string.as_bytes())
            .await
            .map_err(|err| anyhow!(err))?;

        self.writer.flush().await.map_err(|err| anyhow!(err))
    }

    async fn write_xml_declaration(&mut self) -> Result<(), Error> {
        self.write_str("<?xml version='1.0'?>").await
    }

    fn lookup_namespace_prefix(&self, namespace: &str) -> Option<&str> {
        for namespaces in self.namespaces.iter().rev() {
            if let Some(prefix) = namespaces.get(namespace) {
                return Some(prefix);
            }
        }

        None
    }

    fn build_xml_element(&mut self, element: &Element) -> String {
        let mut xml = String::new();

        if !element.children.is_empty() {
            xml.push_str(&self.build_opening_tag(element, false));
            xml.push_str(&self.build_children(element));
            xml.push_str(&self.build_closing_tag(element));
        } else {
            xml.push_str(&self.build_opening_tag(element, true));
        }

        xml
    }

    fn build_opening_tag(&mut self, element: &Element, self_closing: bool) -> String {
        let mut xml = String::new();

        // namespace declarations on this element take effect for the
        // element's own name lookup as well, so collect them first
        let mut namespaces = HashMap::new();
        for ((attribute, namespace), value) in &element.attributes {
            match namespace {
                Some(namespace) => {
                    if namespace == namespaces::XMLNS {
                        namespaces.insert(value.clone(), attribute.clone());
                    }
                }
                None => {
                    if attribute == "xmlns" {
                        namespaces.insert(value.clone(), String::new());
                    }
                }
            }
        }
        self.namespaces.push(namespaces);

        match &element.namespace {
            Some(namespace) => match self.lookup_namespace_prefix(namespace) {
                Some("") | None => {
                    // undeclared namespaces fall back to the stream default
                    xml.push_str(&format!(
                        "<{}{}",
                        element.name,
                        self.build_attributes(element)
                    ));
                }
                Some(prefix) => {
                    xml.push_str(&format!(
                        "<{}:{}{}",
                        prefix,
                        element.name,
                        self.build_attributes(element)
                    ));
                }
            },
            None => {
                xml.push_str(&format!(
                    "<{}{}",
                    element.name,
                    self.build_attributes(element)
                ));
            }
        }

        if self_closing {
            self.namespaces.pop();
            xml.push_str("/>");
        } else {
            xml.push('>');
        }

        xml
    }

    fn build_attributes(&self, element: &Element) -> String {
        let mut xml = String::new();

        for ((attribute, namespace), value) in &element.attributes {
            match namespace {
                Some(namespace) => match self.lookup_namespace_prefix(namespace) {
                    Some("") | None => {}
                    Some(prefix) => {
                        xml.push_str(&format!(r#" {}:{}="{}""#, prefix, attribute, escape(value)));
                    }
                },
                None => {
                    xml.push_str(&format!(r#" {}="{}""#, attribute, escape(value)));
                }
            }
        }

        xml
    }

    fn build_children(&mut self, element: &Element) -> String {
        let mut xml = String::new();

        for child in &element.children {
            match child {
                Node::Element(child_element) => {
                    xml.push_str(&self.build_xml_element(child_element));
                }
                Node::Text(text) => {
                    xml.push_str(&escape(text));
                }
                Node::CData(cdata) => {
                    xml.push_str(&format!("<![CDATA[{}]]>", cdata));
                }
                Node::Comment(comment) => {
                    xml.push_str(&format!("<!--{}-->", comment));
                }
                Node::ProcessingInstruction(pi) => {
                    xml.push_str(&format!("<?{}?>", pi));
                }
            }
        }

        xml
    }

    fn build_closing_tag(&mut self, element: &Element) -> String {
        let mut xml = String::new();

        match &element.namespace {
            Some(namespace) => match self.lookup_namespace_prefix(namespace) {
                Some("") | None => {
                    xml.push_str(&format!("</{}>", element.name));
                }
                Some(prefix) => {
                    xml.push_str(&format!("</{}:{}>", prefix, element.name));
                }
            },
            None => {
                xml.push_str(&format!("</{}>", element.name));
            }
        }

        self.namespaces.pop();

        xml
    }
}

#[cfg(test)]
mod tests {
    use crate::xmpp::stream::StreamId;

    use super::*;

    #[tokio::test]
    async fn writes_self_closing_element() {
        let mut sink: Vec<u8> = Vec::new();
        let mut writer = StreamWriter::new(&mut sink);
        writer
            .write_xml_element(&Element::new("presence", None))
            .await
            .unwrap();
        drop(writer);
        assert_eq!(String::from_utf8(sink).unwrap(), "<presence/>");
    }

    #[tokio::test]
    async fn escapes_text_and_attributes() {
        let mut sink: Vec<u8> = Vec::new();
        let mut writer = StreamWriter::new(&mut sink);
        let mut element = Element::new("message", None);
        element.set_attribute("subject", None, "a \"b\" & c");
        element.with_child("body", None, |body| {
            body.add_text("1 < 2 & 3 > 2");
        });
        writer.write_xml_element(&element).await.unwrap();
        drop(writer);
        let output = String::from_utf8(sink).unwrap();
        assert!(output.contains("1 &lt; 2 &amp; 3 &gt; 2"));
        assert!(output.contains(r#"subject="a &quot;b&quot; &amp; c""#));
    }

    #[tokio::test]
    async fn writes_comments_and_processing_instructions() {
        let mut sink: Vec<u8> = Vec::new();
        let mut writer = StreamWriter::new(&mut sink);
        let mut element = Element::new("message", None);
        element.add_comment("seen");
        element.add_processing_instruction("target data");
        element.with_child("body", None, |body| {
            body.add_text("hi");
        });
        writer.write_xml_element(&element).await.unwrap();
        drop(writer);
        let output = String::from_utf8(sink).unwrap();
        assert!(output.contains("<!--seen-->"));
        assert!(output.contains("<?target data?>"));
        assert!(output.contains("<body>hi</body>"));
    }

    #[tokio::test]
    async fn stream_header_declares_namespaces() {
        let mut sink: Vec<u8> = Vec::new();
        let mut writer = StreamWriter::new(&mut sink);
        let header = StreamHeader {
            from: Some("localhost".parse().unwrap()),
            to: Some("alice@localhost".parse().unwrap()),
            id: Some(StreamId::new()),
            language: None,
        };
        writer.write_stream_header(&header, true).await.unwrap();
        drop(writer);
        let output = String::from_utf8(sink).unwrap();
        assert!(output.starts_with("<?xml version='1.0'?>"));
        assert!(output.contains("<stream:stream"));
        assert!(output.contains(r#"xmlns="jabber:client""#));
        assert!(output.contains(r#"from="localhost""#));
        assert!(output.contains(r#"id=""#));
    }

    #[tokio::test]
    async fn elements_in_stream_default_namespace_are_unprefixed() {
        let mut sink: Vec<u8> = Vec::new();
        let mut writer = StreamWriter::new(&mut sink);
        let header = StreamHeader {
            from: Some("localhost".parse().unwrap()),
            to: None,
            id: None,
            language: None,
        };
        writer.write_stream_header(&header, false).await.unwrap();

        let mut message = Element::new("message", Some(namespaces::XMPP_CLIENT));
        message.with_child("body", Some(namespaces::XMPP_CLIENT), |body| {
            body.add_text("hi");
        });
        writer.write_xml_element(&message).await.unwrap();
        writer.write_stream_close().await.unwrap();
        drop(writer);
        let output = String::from_utf8(sink).unwrap();
        assert!(output.contains("<message><body>hi</body></message>"));
        assert!(output.ends_with("</stream:stream>"));
    }
}
