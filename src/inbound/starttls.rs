use anyhow::{bail, Error};

use crate::xml::stream_parser::StreamParser;
use crate::xml::{namespaces, Element};
use crate::xmpp::stream::{Connection, XmppStream};
use tokio::io::ReadHalf;

pub(super) struct StarttlsNegotiator {
    _private: (),
}

impl StarttlsNegotiator {
    pub fn advertise_feature() -> Element {
        let mut starttls = Element::new("starttls", Some(namespaces::XMPP_STARTTLS));
        starttls.set_attribute("xmlns", None, namespaces::XMPP_STARTTLS);
        starttls
    }

    pub fn claims(element: &Element) -> bool {
        element.validate("starttls", Some(namespaces::XMPP_STARTTLS))
    }

    /// Acks with `<proceed/>` and runs the handshake on the same socket.
    /// A handshake failure is fatal for the connection.
    pub async fn negotiate_feature<C, P>(
        stream: &mut XmppStream<C, P>,
        element: &Element,
    ) -> Result<(), Error>
    where
        C: Connection,
        P: StreamParser<ReadHalf<C>>,
    {
        if !Self::claims(element) {
            bail!("expected starttls element");
        }

        let mut proceed = Element::new("proceed", Some(namespaces::XMPP_STARTTLS));
        proceed.set_attribute("xmlns", None, namespaces::XMPP_STARTTLS);

        stream.writer().write_xml_element(&proceed).await?;
        stream.upgrade_to_tls().await?;

        Ok(())
    }
}
