use std::collections::HashMap;

use anyhow::Error;
use tokio::select;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::services::router::RouterHandle;
use crate::xml::{namespaces, Element};
use crate::xmpp::jid::{Jid, WILDCARD};
use crate::xmpp::stanza::{IqType, Stanza, StanzaKind};

const MUC_SUBDOMAIN: &str = "conference";
const STANZA_CHANNEL_BUFFER_SIZE: usize = 64;
const DISCONNECT_CHANNEL_BUFFER_SIZE: usize = 16;

/// Multi-User Chat (XEP-0045, the small end of it). Lives at
/// `conference.<server domain>` and is wired up exclusively through the
/// public registration surface: a wildcard stanza route for the rooms and
/// a disconnect listener for occupant cleanup. Reflected traffic is
/// re-submitted through the router like any other stanza.
pub async fn activate(router: &RouterHandle) -> Result<(), Error> {
    let service_domain = format!("{}.{}", MUC_SUBDOMAIN, router.server_jid().domain());

    let (stanza_tx, stanza_rx) = mpsc::channel(STANZA_CHANNEL_BUFFER_SIZE);
    let (disconnect_tx, disconnect_rx) = mpsc::channel(DISCONNECT_CHANNEL_BUFFER_SIZE);

    let pattern = Jid::new(Some(WILDCARD), &service_domain, Some(WILDCARD));
    router.register_stanza_route(pattern, Box::new(stanza_tx)).await?;
    router.add_client_disconnect_listener(disconnect_tx).await?;

    let mut muc = Muc {
        service_domain,
        stanzas: stanza_rx,
        disconnects: disconnect_rx,
        outbound: router.stanza_sender(),
        rooms: HashMap::new(),
    };
    tokio::spawn(async move {
        muc.run().await;
    });

    Ok(())
}

struct Occupant {
    nick: String,
    real_jid: Jid,
}

#[derive(Default)]
struct Room {
    occupants: Vec<Occupant>,
}

struct Muc {
    service_domain: String,
    stanzas: mpsc::Receiver<Stanza>,
    disconnects: mpsc::Receiver<Jid>,
    outbound: mpsc::Sender<Stanza>,
    rooms: HashMap<String, Room>,
}

impl Muc {
    async fn run(&mut self) {
        loop {
            select! {
                Some(stanza) = self.stanzas.recv() => {
                    self.handle_stanza(&stanza);
                }
                Some(jid) = self.disconnects.recv() => {
                    self.handle_disconnect(&jid);
                }
                else => return,
            }
        }
    }

    fn handle_stanza(&mut self, stanza: &Stanza) {
        let (Some(to), Some(from)) = (stanza.to(), stanza.from()) else {
            info!("unaddressed stanza at the conference service, dropping");
            return;
        };

        match stanza.kind() {
            StanzaKind::Presence => self.handle_presence(stanza, &to, &from),
            StanzaKind::Message => self.handle_message(stanza, &to, &from),
            StanzaKind::Iq => {
                if matches!(stanza.iq_type(), Some(IqType::Get) | Some(IqType::Set)) {
                    let responder = to.to_bare();
                    let reply = Stanza::iq_error(
                        stanza,
                        &responder,
                        &from,
                        "cancel",
                        "service-unavailable",
                    );
                    self.submit(reply);
                }
            }
            StanzaKind::Other => {}
        }
    }

    fn handle_presence(&mut self, stanza: &Stanza, to: &Jid, from: &Jid) {
        let (Some(room_name), Some(nick)) = (to.local(), to.resource()) else {
            info!(%to, "presence without a room or nick, dropping");
            return;
        };

        if stanza.element.attribute("type", None) == Some("unavailable") {
            self.leave(room_name, from);
            return;
        }

        self.join(room_name, nick, from);
    }

    fn join(&mut self, room_name: &str, nick: &str, real_jid: &Jid) {
        let nick_holder = self
            .rooms
            .get(room_name)
            .and_then(|room| room.occupants.iter().find(|o| o.nick == nick))
            .map(|occupant| occupant.real_jid.clone());
        match nick_holder {
            Some(holder) if holder != *real_jid => {
                debug!(room_name, nick, "nick already taken");
                let reply =
                    presence_error(&self.occupant_jid(room_name, nick), real_jid, "conflict");
                self.submit(reply);
                return;
            }
            // re-join of a present occupant, nothing to do
            Some(_) => return,
            None => {}
        }

        let room = self.rooms.entry(room_name.to_string()).or_default();
        room.occupants.push(Occupant {
            nick: nick.to_string(),
            real_jid: real_jid.clone(),
        });
        debug!(room_name, nick, "occupant joined");

        // the new occupant learns who is here, everyone learns about the
        // new occupant (including the occupant itself, which is how the
        // join is confirmed)
        let occupants: Vec<(String, Jid)> = self
            .rooms
            .get(room_name)
            .map(|room| {
                room.occupants
                    .iter()
                    .map(|o| (o.nick.clone(), o.real_jid.clone()))
                    .collect()
            })
            .unwrap_or_default();

        for (other_nick, _) in occupants.iter().filter(|(n, _)| n != nick) {
            let presence = occupant_presence(
                &self.occupant_jid(room_name, other_nick),
                real_jid,
                None,
                false,
            );
            self.submit(presence);
        }
        let joined = self.occupant_jid(room_name, nick);
        for (_, other_jid) in &occupants {
            let presence = occupant_presence(&joined, other_jid, None, other_jid == real_jid);
            self.submit(presence);
        }
    }

    fn leave(&mut self, room_name: &str, real_jid: &Jid) {
        let Some(room) = self.rooms.get_mut(room_name) else {
            return;
        };
        let Some(index) = room.occupants.iter().position(|o| o.real_jid == *real_jid) else {
            return;
        };

        let occupant = room.occupants.remove(index);
        debug!(room_name, nick = occupant.nick, "occupant left");

        let departed = self.occupant_jid(room_name, &occupant.nick);
        let remaining: Vec<Jid> = self
            .rooms
            .get(room_name)
            .map(|room| room.occupants.iter().map(|o| o.real_jid.clone()).collect())
            .unwrap_or_default();
        let goodbye_to = std::iter::once(real_jid.clone()).chain(remaining);
        for jid in goodbye_to {
            let presence =
                occupant_presence(&departed, &jid, Some("unavailable"), jid == *real_jid);
            self.submit(presence);
        }

        if self
            .rooms
            .get(room_name)
            .is_some_and(|room| room.occupants.is_empty())
        {
            debug!(room_name, "room is empty, dropping it");
            self.rooms.remove(room_name);
        }
    }

    fn handle_message(&mut self, stanza: &Stanza, to: &Jid, from: &Jid) {
        if stanza.element.attribute("type", None) != Some("groupchat") {
            info!("non-groupchat message at the conference service, dropping");
            return;
        }
        let Some(room_name) = to.local() else {
            return;
        };
        let Some(room) = self.rooms.get(room_name) else {
            info!(room_name, "message to a room that does not exist, dropping");
            return;
        };
        let Some(sender) = room.occupants.iter().find(|o| o.real_jid == *from) else {
            info!(room_name, %from, "message from a non-occupant, dropping");
            return;
        };

        let reflected_from = self.occupant_jid(room_name, &sender.nick);
        let recipients: Vec<Jid> = room.occupants.iter().map(|o| o.real_jid.clone()).collect();
        for recipient in recipients {
            let mut reflection = stanza.clone();
            reflection.set_from(&reflected_from);
            reflection.set_to(&recipient);
            self.submit(reflection);
        }
    }

    fn handle_disconnect(&mut self, jid: &Jid) {
        let rooms_with_member: Vec<String> = self
            .rooms
            .iter()
            .filter(|(_, room)| room.occupants.iter().any(|o| o.real_jid == *jid))
            .map(|(name, _)| name.clone())
            .collect();

        for room_name in rooms_with_member {
            self.leave(&room_name, jid);
        }
    }

    fn occupant_jid(&self, room_name: &str, nick: &str) -> Jid {
        Jid::new(Some(room_name), &self.service_domain, Some(nick))
    }

    fn submit(&self, stanza: Stanza) {
        if self.outbound.try_send(stanza).is_err() {
            warn!("router queue full, dropping reflected stanza");
        }
    }
}

/// Occupant presence with the `muc#user` extension: an `<item/>` carrying
/// the occupant's affiliation and role, and status code 110 on the
/// presence that tells a client about itself.
fn occupant_presence(from: &Jid, to: &Jid, presence_type: Option<&str>, own: bool) -> Stanza {
    let leaving = presence_type == Some("unavailable");
    let mut stanza = Stanza::presence(from, to, presence_type);
    stanza
        .element
        .with_child("x", Some(namespaces::MUC_USER), |x| {
            x.set_attribute("xmlns", None, namespaces::MUC_USER);
            x.with_child("item", Some(namespaces::MUC_USER), |item| {
                item.set_attribute("affiliation", None, if leaving { "none" } else { "member" });
                item.set_attribute("role", None, if leaving { "none" } else { "participant" });
            });
            if own {
                x.with_child("status", Some(namespaces::MUC_USER), |status| {
                    status.set_attribute("code", None, "110");
                });
            }
        });
    stanza
}

fn presence_error(from: &Jid, to: &Jid, condition: &str) -> Stanza {
    let mut presence = Element::new("presence", Some(namespaces::XMPP_CLIENT));
    presence.set_attribute("from", None, &from.to_string());
    presence.set_attribute("to", None, &to.to_string());
    presence.set_attribute("type", None, "error");
    presence.with_child("error", Some(namespaces::XMPP_CLIENT), |error| {
        error.set_attribute("type", None, "cancel");
        error.with_child(condition, Some(namespaces::XMPP_STANZA_ERRORS), |child| {
            child.set_attribute("xmlns", None, namespaces::XMPP_STANZA_ERRORS);
        });
    });
    Stanza::new(presence)
}

#[cfg(test)]
mod tests {
    use crate::xml::Element;

    use super::*;

    fn muc_with_outbound() -> (Muc, mpsc::Receiver<Stanza>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let (_stanza_tx, stanza_rx) = mpsc::channel(1);
        let (_disconnect_tx, disconnect_rx) = mpsc::channel(1);
        let muc = Muc {
            service_domain: "conference.localhost".to_string(),
            stanzas: stanza_rx,
            disconnects: disconnect_rx,
            outbound: outbound_tx,
            rooms: HashMap::new(),
        };
        (muc, outbound_rx)
    }

    fn presence(from: &str, to: &str, presence_type: Option<&str>) -> Stanza {
        Stanza::presence(&from.parse().unwrap(), &to.parse().unwrap(), presence_type)
    }

    fn groupchat(from: &str, to: &str, body: &str) -> Stanza {
        let mut message = Element::new("message", Some(namespaces::XMPP_CLIENT));
        message.set_attribute("from", None, from);
        message.set_attribute("to", None, to);
        message.set_attribute("type", None, "groupchat");
        message.with_child("body", Some(namespaces::XMPP_CLIENT), |b| b.add_text(body));
        Stanza::new(message)
    }

    fn drain(rx: &mut mpsc::Receiver<Stanza>) -> Vec<Stanza> {
        let mut stanzas = Vec::new();
        while let Ok(stanza) = rx.try_recv() {
            stanzas.push(stanza);
        }
        stanzas
    }

    #[test]
    fn joining_creates_the_room_and_confirms_presence() {
        let (mut muc, mut outbound) = muc_with_outbound();

        muc.handle_stanza(&presence(
            "alice@localhost/home",
            "tea@conference.localhost/wonderland",
            None,
        ));

        assert_eq!(muc.rooms.len(), 1);
        let confirmations = drain(&mut outbound);
        assert_eq!(confirmations.len(), 1);
        assert_eq!(
            confirmations[0].from(),
            Some("tea@conference.localhost/wonderland".parse().unwrap())
        );
        assert_eq!(
            confirmations[0].to(),
            Some("alice@localhost/home".parse().unwrap())
        );

        // self-presence carries the muc#user payload with status 110
        let x = confirmations[0]
            .element
            .find_child("x", Some(namespaces::MUC_USER))
            .unwrap();
        let item = x.find_child("item", Some(namespaces::MUC_USER)).unwrap();
        assert_eq!(item.attribute("role", None), Some("participant"));
        let status = x.find_child("status", Some(namespaces::MUC_USER)).unwrap();
        assert_eq!(status.attribute("code", None), Some("110"));
    }

    #[test]
    fn second_occupant_sees_and_is_seen() {
        let (mut muc, mut outbound) = muc_with_outbound();

        muc.handle_stanza(&presence(
            "alice@localhost/home",
            "tea@conference.localhost/alice",
            None,
        ));
        drain(&mut outbound);

        muc.handle_stanza(&presence(
            "bob@localhost/work",
            "tea@conference.localhost/bob",
            None,
        ));

        let stanzas = drain(&mut outbound);
        // alice's presence to bob, then bob's join to both occupants
        assert_eq!(stanzas.len(), 3);
        assert!(stanzas.iter().any(|s| {
            s.to() == Some("bob@localhost/work".parse().unwrap())
                && s.from() == Some("tea@conference.localhost/alice".parse().unwrap())
        }));
        // only bob's own reflection carries the self-presence status
        let with_status = stanzas
            .iter()
            .filter(|s| {
                s.element
                    .find_child("x", Some(namespaces::MUC_USER))
                    .and_then(|x| x.find_child("status", Some(namespaces::MUC_USER)))
                    .is_some()
            })
            .count();
        assert_eq!(with_status, 1);
        assert!(stanzas.iter().any(|s| {
            s.to() == Some("alice@localhost/home".parse().unwrap())
                && s.from() == Some("tea@conference.localhost/bob".parse().unwrap())
        }));
    }

    #[test]
    fn groupchat_messages_reflect_to_every_occupant() {
        let (mut muc, mut outbound) = muc_with_outbound();
        muc.handle_stanza(&presence(
            "alice@localhost/home",
            "tea@conference.localhost/alice",
            None,
        ));
        muc.handle_stanza(&presence(
            "bob@localhost/work",
            "tea@conference.localhost/bob",
            None,
        ));
        drain(&mut outbound);

        muc.handle_stanza(&groupchat(
            "alice@localhost/home",
            "tea@conference.localhost",
            "hello room",
        ));

        let reflections = drain(&mut outbound);
        assert_eq!(reflections.len(), 2);
        for reflection in &reflections {
            assert_eq!(
                reflection.from(),
                Some("tea@conference.localhost/alice".parse().unwrap())
            );
            assert_eq!(reflection.element.text(), "hello room");
        }
    }

    #[test]
    fn messages_from_non_occupants_are_dropped() {
        let (mut muc, mut outbound) = muc_with_outbound();
        muc.handle_stanza(&presence(
            "alice@localhost/home",
            "tea@conference.localhost/alice",
            None,
        ));
        drain(&mut outbound);

        muc.handle_stanza(&groupchat(
            "mallory@localhost/x",
            "tea@conference.localhost",
            "let me in",
        ));
        assert!(drain(&mut outbound).is_empty());
    }

    #[test]
    fn taken_nick_conflicts() {
        let (mut muc, mut outbound) = muc_with_outbound();
        muc.handle_stanza(&presence(
            "alice@localhost/home",
            "tea@conference.localhost/march-hare",
            None,
        ));
        drain(&mut outbound);

        muc.handle_stanza(&presence(
            "bob@localhost/work",
            "tea@conference.localhost/march-hare",
            None,
        ));
        let replies = drain(&mut outbound);
        assert_eq!(replies.len(), 1);
        assert!(replies[0]
            .element
            .find_child("error", Some(namespaces::XMPP_CLIENT))
            .is_some());
    }

    #[test]
    fn leaving_empties_and_drops_the_room() {
        let (mut muc, mut outbound) = muc_with_outbound();
        muc.handle_stanza(&presence(
            "alice@localhost/home",
            "tea@conference.localhost/alice",
            None,
        ));
        drain(&mut outbound);

        muc.handle_stanza(&presence(
            "alice@localhost/home",
            "tea@conference.localhost/alice",
            Some("unavailable"),
        ));

        let goodbyes = drain(&mut outbound);
        assert_eq!(goodbyes.len(), 1);
        assert_eq!(
            goodbyes[0].element.attribute("type", None),
            Some("unavailable")
        );
        let item = goodbyes[0]
            .element
            .find_child("x", Some(namespaces::MUC_USER))
            .unwrap()
            .find_child("item", Some(namespaces::MUC_USER))
            .unwrap();
        assert_eq!(item.attribute("role", None), Some("none"));
        assert!(muc.rooms.is_empty());
    }

    #[test]
    fn disconnect_removes_the_occupant_from_all_rooms() {
        let (mut muc, mut outbound) = muc_with_outbound();
        muc.handle_stanza(&presence(
            "alice@localhost/home",
            "tea@conference.localhost/alice",
            None,
        ));
        muc.handle_stanza(&presence(
            "alice@localhost/home",
            "chess@conference.localhost/alice",
            None,
        ));
        muc.handle_stanza(&presence(
            "bob@localhost/work",
            "tea@conference.localhost/bob",
            None,
        ));
        drain(&mut outbound);

        muc.handle_disconnect(&"alice@localhost/home".parse().unwrap());

        assert_eq!(muc.rooms.len(), 1);
        assert_eq!(muc.rooms.get("tea").unwrap().occupants.len(), 1);
        let goodbyes = drain(&mut outbound);
        assert!(goodbyes
            .iter()
            .all(|s| s.element.attribute("type", None) == Some("unavailable")));
    }
}
