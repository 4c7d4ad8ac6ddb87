use anyhow::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::services::router::{RouteTarget, RouterHandle};
use crate::xml::{namespaces, Element};
use crate::xmpp::jid::Jid;
use crate::xmpp::stanza::{IqType, Stanza};

/// Handlers for traffic addressed to the server itself: the stanza route
/// on the bare server JID and the request-IQ namespaces every client
/// expects an answer for. Unroutable stanzas are dropped by the router;
/// unanswerable requests are answered here with `service-unavailable`.
pub async fn activate(router: &RouterHandle) -> Result<(), Error> {
    let domain = router.server_jid().clone();
    let outbound = router.stanza_sender();

    router
        .register_stanza_route(
            domain.clone(),
            Box::new(ServerStanzaHandler {
                domain: domain.clone(),
                outbound: outbound.clone(),
            }),
        )
        .await?;
    router
        .register_iq_route(
            namespaces::ROSTER,
            Box::new(RosterHandler {
                domain: domain.clone(),
                outbound: outbound.clone(),
            }),
        )
        .await?;
    router
        .register_iq_route(
            namespaces::DISCO_INFO,
            Box::new(DiscoInfoHandler {
                domain: domain.clone(),
                outbound: outbound.clone(),
            }),
        )
        .await?;
    router
        .register_iq_route(
            namespaces::DISCO_ITEMS,
            Box::new(DiscoItemsHandler { domain, outbound }),
        )
        .await?;

    Ok(())
}

fn submit(outbound: &mpsc::Sender<Stanza>, stanza: Stanza) -> bool {
    if outbound.try_send(stanza).is_err() {
        warn!("router queue full, dropping reply");
        return false;
    }
    true
}

/// The entity a reply speaks for: whatever address the request named, or
/// the server when the request had none.
fn responder(stanza: &Stanza, domain: &Jid) -> Jid {
    stanza.to().unwrap_or_else(|| domain.clone())
}

struct ServerStanzaHandler {
    domain: Jid,
    outbound: mpsc::Sender<Stanza>,
}

impl RouteTarget for ServerStanzaHandler {
    fn deliver(&mut self, stanza: &Stanza) -> bool {
        match stanza.iq_type() {
            Some(IqType::Get) | Some(IqType::Set) => {
                let Some(requester) = stanza.from() else {
                    info!("request without a sender, dropping");
                    return true;
                };
                let reply = Stanza::iq_error(
                    stanza,
                    &responder(stanza, &self.domain),
                    &requester,
                    "cancel",
                    "service-unavailable",
                );
                submit(&self.outbound, reply)
            }
            _ => {
                info!("dropping stanza addressed to the server");
                true
            }
        }
    }
}

struct RosterHandler {
    domain: Jid,
    outbound: mpsc::Sender<Stanza>,
}

impl RouteTarget for RosterHandler {
    fn deliver(&mut self, stanza: &Stanza) -> bool {
        let Some(requester) = stanza.from() else {
            info!("roster request without a sender, dropping");
            return true;
        };

        // rosters are not persisted; every client starts empty
        let mut query = Element::new("query", Some(namespaces::ROSTER));
        query.set_attribute("xmlns", None, namespaces::ROSTER);
        let reply = Stanza::iq_result(stanza, &responder(stanza, &self.domain), &requester, Some(query));
        submit(&self.outbound, reply)
    }
}

struct DiscoInfoHandler {
    domain: Jid,
    outbound: mpsc::Sender<Stanza>,
}

impl RouteTarget for DiscoInfoHandler {
    fn deliver(&mut self, stanza: &Stanza) -> bool {
        let Some(requester) = stanza.from() else {
            info!("disco#info request without a sender, dropping");
            return true;
        };

        let mut query = Element::new("query", Some(namespaces::DISCO_INFO));
        query.set_attribute("xmlns", None, namespaces::DISCO_INFO);
        query.with_child("identity", Some(namespaces::DISCO_INFO), |identity| {
            identity.set_attribute("category", None, "server");
            identity.set_attribute("type", None, "im");
            identity.set_attribute("name", None, "colloquy");
        });
        for feature in [namespaces::DISCO_INFO, namespaces::DISCO_ITEMS, namespaces::MUC] {
            query.with_child("feature", Some(namespaces::DISCO_INFO), |child| {
                child.set_attribute("var", None, feature);
            });
        }
        let reply = Stanza::iq_result(stanza, &responder(stanza, &self.domain), &requester, Some(query));
        submit(&self.outbound, reply)
    }
}

struct DiscoItemsHandler {
    domain: Jid,
    outbound: mpsc::Sender<Stanza>,
}

impl RouteTarget for DiscoItemsHandler {
    fn deliver(&mut self, stanza: &Stanza) -> bool {
        let Some(requester) = stanza.from() else {
            info!("disco#items request without a sender, dropping");
            return true;
        };

        let mut query = Element::new("query", Some(namespaces::DISCO_ITEMS));
        query.set_attribute("xmlns", None, namespaces::DISCO_ITEMS);
        query.with_child("item", Some(namespaces::DISCO_ITEMS), |item| {
            item.set_attribute("jid", None, &format!("conference.{}", self.domain.domain()));
        });
        let reply = Stanza::iq_result(stanza, &responder(stanza, &self.domain), &requester, Some(query));
        submit(&self.outbound, reply)
    }
}
