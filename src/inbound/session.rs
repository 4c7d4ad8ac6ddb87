use anyhow::{bail, Error};
use tokio::io::ReadHalf;

use crate::xml::stream_parser::StreamParser;
use crate::xml::{namespaces, Element};
use crate::xmpp::stream::{Connection, XmppStream};

/// IM session establishment (RFC 3921). Nothing is tracked beyond the
/// acknowledgement; it exists so that clients which negotiate it get the
/// answer they expect.
pub(super) struct SessionNegotiator {
    _private: (),
}

impl SessionNegotiator {
    pub fn advertise_feature() -> Element {
        let mut session = Element::new("session", Some(namespaces::XMPP_SESSION));
        session.set_attribute("xmlns", None, namespaces::XMPP_SESSION);
        session
    }

    pub fn claims(element: &Element) -> bool {
        element.name() == "iq"
            && element
                .find_child("session", Some(namespaces::XMPP_SESSION))
                .is_some()
    }

    pub async fn negotiate_feature<C, P>(
        stream: &mut XmppStream<C, P>,
        element: &Element,
    ) -> Result<(), Error>
    where
        C: Connection,
        P: StreamParser<ReadHalf<C>>,
    {
        if element.attribute("type", None) != Some("set") {
            bail!("session request is not of type set");
        }
        let Some(request_id) = element.attribute("id", None) else {
            bail!("session request does not have an id");
        };

        let mut response = Element::new("iq", None);
        response.set_attribute("id", None, request_id);
        response.set_attribute("type", None, "result");
        stream.writer().write_xml_element(&response).await?;

        Ok(())
    }
}
