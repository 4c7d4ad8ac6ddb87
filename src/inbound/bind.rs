use anyhow::{bail, Error};
use tokio::io::ReadHalf;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::services::router::{RouterError, RouterHandle};
use crate::xml::stream_parser::StreamParser;
use crate::xml::{namespaces, Element};
use crate::xmpp::jid::Jid;
use crate::xmpp::stanza::Stanza;
use crate::xmpp::stream::{Connection, XmppStream};

pub(super) struct ResourceBindingNegotiator {
    _private: (),
}

impl ResourceBindingNegotiator {
    pub fn advertise_feature() -> Element {
        let mut bind = Element::new("bind", Some(namespaces::XMPP_BIND));
        bind.set_attribute("xmlns", None, namespaces::XMPP_BIND);
        bind
    }

    pub fn claims(element: &Element) -> bool {
        element.name() == "iq"
            && element.find_child("bind", Some(namespaces::XMPP_BIND)).is_some()
    }

    /// Binds a resource to the authenticated bare `entity` and registers
    /// the full JID's route, with the connection's stanza channel as the
    /// target. `Ok(None)` means the requested resource was already bound
    /// under the same bare JID; the conflict has been answered and the
    /// client may retry with another resource.
    pub async fn negotiate_feature<C, P>(
        stream: &mut XmppStream<C, P>,
        element: &Element,
        entity: &Jid,
        router: &RouterHandle,
        stanza_tx: &mpsc::Sender<Stanza>,
    ) -> Result<Option<Jid>, Error>
    where
        C: Connection,
        P: StreamParser<ReadHalf<C>>,
    {
        if element.attribute("type", None) != Some("set") {
            bail!("bind request is not of type set");
        }
        let Some(request_id) = element.attribute("id", None) else {
            bail!("bind request does not have an id");
        };
        let Some(bind_request) = element.find_child("bind", Some(namespaces::XMPP_BIND)) else {
            bail!("expected bind request");
        };

        let resource = match bind_request.find_child("resource", Some(namespaces::XMPP_BIND)) {
            Some(requested) if !requested.text().is_empty() => requested.text(),
            _ => Uuid::new_v4().to_string(),
        };
        let full_jid = entity.with_resource(&resource);

        // registering before answering means no stanza can race the bind
        match router
            .register_stanza_route(full_jid.clone(), Box::new(stanza_tx.clone()))
            .await
        {
            Ok(()) => {}
            Err(RouterError::DuplicateRoute(_)) => {
                debug!(%full_jid, "resource already bound");
                let mut response = Element::new("iq", None);
                response.set_attribute("id", None, request_id);
                response.set_attribute("type", None, "error");
                response.with_child("error", None, |error| {
                    error.set_attribute("type", None, "cancel");
                    error.with_child(
                        "conflict",
                        Some(namespaces::XMPP_STANZA_ERRORS),
                        |conflict| {
                            conflict.set_attribute("xmlns", None, namespaces::XMPP_STANZA_ERRORS);
                        },
                    );
                });
                stream.writer().write_xml_element(&response).await?;
                return Ok(None);
            }
            Err(err) => bail!(err),
        }

        let mut response = Element::new("iq", None);
        response.set_attribute("id", None, request_id);
        response.set_attribute("type", None, "result");
        response.with_child("bind", Some(namespaces::XMPP_BIND), |bind| {
            bind.set_attribute("xmlns", None, namespaces::XMPP_BIND);
            bind.with_child("jid", Some(namespaces::XMPP_BIND), |jid| {
                jid.add_text(&full_jid.to_string());
            });
        });
        stream.writer().write_xml_element(&response).await?;

        debug!(%full_jid, "resource bound");
        Ok(Some(full_jid))
    }
}
