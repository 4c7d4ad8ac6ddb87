use anyhow::Error;
use tokio::io::AsyncRead;
use tokio_stream::Stream;

use crate::xmpp::stream_header::StreamHeader;

use super::Element;

pub mod rusty_xml;

/// One event of an XMPP stream: the opening `<stream:stream>` tag, a
/// complete top-level child element, or the stream closing tag. Ill-formed
/// input surfaces as the stream's `Err` item and is fatal for the
/// connection.
#[derive(Debug)]
pub enum Frame {
    StreamStart(StreamHeader),
    XmlFragment(Element),
    StreamEnd,
}

pub trait StreamParser<R: AsyncRead + Unpin>: Stream<Item = Result<Frame, Error>> + Unpin {
    /// Wraps `reader` with a fresh parser. `buffer_size` is the
    /// per-connection read buffer; every connection owns its own.
    fn new(reader: R, buffer_size: usize) -> Self;

    fn into_inner(self) -> R;
}
