use std::pin::Pin;
use std::task::{ready, Context, Poll};

use anyhow::{anyhow, Error};
use bytes::{Buf, BytesMut};
use rustyxml::{Event, Parser, ParserError, StartTag};
use tokio::io::{AsyncRead, ReadBuf};
use tokio_stream::Stream;

use crate::xml::{namespaces, Element};
use crate::xmpp::stream_header::{LanguageTag, StreamHeader};

use super::{Frame, StreamParser};

const MIN_BUFFER_SIZE: usize = 256;

fn is_stream_tag(name: &str, namespace: Option<&str>) -> bool {
    name == "stream" && namespace == Some(namespaces::XMPP_STREAMS)
}

fn element_from_tag(tag: &StartTag) -> Element {
    let mut element = Element::new(&tag.name, tag.ns.as_deref());
    for ((name, namespace), value) in &tag.attributes {
        element.set_attribute(name, namespace.as_deref(), value);
    }
    element
}

fn stream_header_from_tag(tag: &StartTag) -> StreamHeader {
    StreamHeader {
        from: tag
            .attributes
            .get(&("from".to_string(), None))
            .and_then(|jid| jid.parse().ok()),
        to: tag
            .attributes
            .get(&("to".to_string(), None))
            .and_then(|jid| jid.parse().ok()),
        id: None,
        language: tag
            .attributes
            .get(&("lang".to_string(), Some(namespaces::XML.to_string())))
            .map(|lang| LanguageTag(lang.to_string())),
    }
}

/// Incremental, namespace-aware parser over an async byte stream.
///
/// RustyXML's pull parser does the tokenizing and namespace resolution;
/// the element stack here turns its events into whole top-level elements.
/// (RustyXML's own `ElementBuilder` is not used: its element type is not
/// `Send`, and per-connection parsers live inside spawned tasks.)
pub struct RustyXmlStreamParser<R: AsyncRead + Unpin> {
    reader: R,
    buffer: Box<[u8]>,
    carry: BytesMut,
    parser: Parser,
    open_elements: Vec<Element>,
}

impl<R: AsyncRead + Unpin> RustyXmlStreamParser<R> {
    fn handle_event(&mut self, event: Result<Event, ParserError>) -> Result<Option<Frame>, Error> {
        let event = match event {
            Ok(event) => event,
            Err(err) => return Err(anyhow!(err).context("ill-formed XML")),
        };

        match event {
            Event::ElementStart(tag) => {
                if is_stream_tag(&tag.name, tag.ns.as_deref()) {
                    if !self.open_elements.is_empty() {
                        return Err(anyhow!("stream header inside an open element"));
                    }
                    return Ok(Some(Frame::StreamStart(stream_header_from_tag(&tag))));
                }
                self.open_elements.push(element_from_tag(&tag));
                Ok(None)
            }
            Event::ElementEnd(tag) => {
                if is_stream_tag(&tag.name, tag.ns.as_deref()) {
                    if !self.open_elements.is_empty() {
                        return Err(anyhow!("stream closed inside an open element"));
                    }
                    return Ok(Some(Frame::StreamEnd));
                }
                let element = self
                    .open_elements
                    .pop()
                    .ok_or_else(|| anyhow!("closing tag without an open element"))?;
                if !element.validate(&tag.name, tag.ns.as_deref()) {
                    return Err(anyhow!("mismatched closing tag </{}>", tag.name));
                }
                match self.open_elements.last_mut() {
                    Some(parent) => {
                        parent.add_child(element);
                        Ok(None)
                    }
                    None => Ok(Some(Frame::XmlFragment(element))),
                }
            }
            Event::Characters(text) => {
                if let Some(open) = self.open_elements.last_mut() {
                    open.add_text(&text);
                }
                Ok(None)
            }
            Event::CDATA(text) => {
                if let Some(open) = self.open_elements.last_mut() {
                    open.add_cdata(&text);
                }
                Ok(None)
            }
            Event::Comment(text) => {
                if let Some(open) = self.open_elements.last_mut() {
                    open.add_comment(&text);
                }
                Ok(None)
            }
            // a top-level PI is the XML declaration and carries no content
            // for the stream itself
            Event::PI(text) => {
                if let Some(open) = self.open_elements.last_mut() {
                    open.add_processing_instruction(&text);
                }
                Ok(None)
            }
        }
    }

    fn feed_carry(&mut self) -> Result<(), Error> {
        let valid_len = match std::str::from_utf8(&self.carry) {
            Ok(_) => self.carry.len(),
            // an incomplete trailing codepoint stays in the carry buffer
            // until the next read completes it
            Err(err) if err.error_len().is_none() => err.valid_up_to(),
            Err(err) => return Err(anyhow!(err).context("stream is not valid UTF-8")),
        };

        // valid_len bounds a checked prefix
        let chunk = std::str::from_utf8(&self.carry[..valid_len]).unwrap();
        self.parser.feed_str(chunk);
        self.carry.advance(valid_len);
        Ok(())
    }
}

impl<R: AsyncRead + Unpin> Stream for RustyXmlStreamParser<R> {
    type Item = Result<Frame, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let me = &mut *self;

        loop {
            while let Some(event) = me.parser.next() {
                match me.handle_event(event) {
                    Ok(Some(frame)) => return Poll::Ready(Some(Ok(frame))),
                    Ok(None) => {}
                    Err(err) => return Poll::Ready(Some(Err(err))),
                }
            }

            let mut read_buf = ReadBuf::new(&mut me.buffer);
            match ready!(Pin::new(&mut me.reader).poll_read(cx, &mut read_buf)) {
                Ok(()) => {}
                Err(err) => return Poll::Ready(Some(Err(err.into()))),
            }

            let filled = read_buf.filled().len();
            if filled == 0 {
                return Poll::Ready(None);
            }
            drop(read_buf);

            me.carry.extend_from_slice(&me.buffer[..filled]);
            if let Err(err) = me.feed_carry() {
                return Poll::Ready(Some(Err(err)));
            }
        }
    }
}

impl<R: AsyncRead + Unpin> StreamParser<R> for RustyXmlStreamParser<R> {
    fn new(reader: R, buffer_size: usize) -> Self {
        Self {
            reader,
            buffer: vec![0; buffer_size.max(MIN_BUFFER_SIZE)].into_boxed_slice(),
            carry: BytesMut::new(),
            parser: Parser::new(),
            open_elements: Vec::new(),
        }
    }

    fn into_inner(self) -> R {
        self.reader
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;
    use tokio_stream::StreamExt;

    use super::*;

    const STREAM_OPEN: &str = "<?xml version='1.0'?>\
        <stream:stream xmlns='jabber:client' \
        xmlns:stream='http://etherx.jabber.org/streams' \
        from='alice@localhost' to='localhost' version='1.0'>";

    #[tokio::test]
    async fn emits_stream_start_with_header_attributes() {
        let mut parser = RustyXmlStreamParser::new(STREAM_OPEN.as_bytes(), 4096);
        match parser.next().await {
            Some(Ok(Frame::StreamStart(header))) => {
                assert_eq!(header.to, Some("localhost".parse().unwrap()));
                assert_eq!(header.from, Some("alice@localhost".parse().unwrap()));
            }
            other => panic!("expected stream start, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn emits_one_frame_per_top_level_element() {
        let xml = format!(
            "{STREAM_OPEN}\
             <message to='bob@localhost'><body>hi</body></message>\
             <presence/>\
             </stream:stream>"
        );
        let mut parser = RustyXmlStreamParser::new(xml.as_bytes(), 4096);

        assert!(matches!(parser.next().await, Some(Ok(Frame::StreamStart(_)))));

        match parser.next().await {
            Some(Ok(Frame::XmlFragment(element))) => {
                assert!(element.validate("message", Some("jabber:client")));
                assert_eq!(element.attribute("to", None), Some("bob@localhost"));
                let body = element.find_child("body", Some("jabber:client")).unwrap();
                assert_eq!(body.text(), "hi");
            }
            other => panic!("expected message fragment, got {other:?}"),
        }

        match parser.next().await {
            Some(Ok(Frame::XmlFragment(element))) => {
                assert!(element.validate("presence", Some("jabber:client")));
            }
            other => panic!("expected presence fragment, got {other:?}"),
        }

        assert!(matches!(parser.next().await, Some(Ok(Frame::StreamEnd))));
        assert!(parser.next().await.is_none());
    }

    #[tokio::test]
    async fn reassembles_elements_split_across_reads() {
        let (client, server) = tokio::io::duplex(4096);
        let mut parser = RustyXmlStreamParser::new(server, 64);

        let mut client = client;
        let xml = format!("{STREAM_OPEN}<message><bo");
        client.write_all(xml.as_bytes()).await.unwrap();

        assert!(matches!(parser.next().await, Some(Ok(Frame::StreamStart(_)))));

        client.write_all(b"dy>hello</body></message>").await.unwrap();
        match parser.next().await {
            Some(Ok(Frame::XmlFragment(element))) => {
                assert_eq!(element.text(), "hello");
            }
            other => panic!("expected fragment, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn comments_survive_into_the_element_tree() {
        let xml = format!("{STREAM_OPEN}<message><!--seen--><body>hi</body></message>");
        let mut parser = RustyXmlStreamParser::new(xml.as_bytes(), 4096);
        assert!(matches!(parser.next().await, Some(Ok(Frame::StreamStart(_)))));

        let element = match parser.next().await {
            Some(Ok(Frame::XmlFragment(element))) => element,
            other => panic!("expected message fragment, got {other:?}"),
        };
        assert_eq!(element.text(), "hi");

        let mut sink: Vec<u8> = Vec::new();
        let mut writer = crate::xml::stream_writer::StreamWriter::new(&mut sink);
        writer.write_xml_element(&element).await.unwrap();
        drop(writer);
        let output = String::from_utf8(sink).unwrap();
        assert!(output.contains("<!--seen-->"));
    }

    #[tokio::test]
    async fn ill_formed_xml_is_fatal() {
        let xml = format!("{STREAM_OPEN}<message><body></message>");
        let mut parser = RustyXmlStreamParser::new(xml.as_bytes(), 4096);
        assert!(matches!(parser.next().await, Some(Ok(Frame::StreamStart(_)))));
        assert!(matches!(parser.next().await, Some(Err(_))));
    }

    #[tokio::test]
    async fn eof_ends_the_stream() {
        let mut parser = RustyXmlStreamParser::new(&b""[..], 4096);
        assert!(parser.next().await.is_none());
    }
}
