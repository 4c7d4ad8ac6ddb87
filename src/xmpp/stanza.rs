use crate::xml::{namespaces, Element};
use crate::xmpp::jid::Jid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaKind {
    Message,
    Presence,
    Iq,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IqType {
    Get,
    Set,
    Result,
    Error,
}

/// One top-level XMPP stream element. The wrapped element is kept as
/// parsed so re-serialization preserves whatever the sender put in it.
///
/// Stanzas are short-lived: the dispatch that produced one owns it, and
/// delivery targets clone what they need instead of retaining the
/// dispatch's copy.
#[derive(Debug, Clone)]
pub struct Stanza {
    pub element: Element,
}

impl Stanza {
    pub fn new(element: Element) -> Self {
        Self { element }
    }

    pub fn kind(&self) -> StanzaKind {
        match self.element.name() {
            "message" => StanzaKind::Message,
            "presence" => StanzaKind::Presence,
            "iq" => StanzaKind::Iq,
            _ => StanzaKind::Other,
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.element.attribute("id", None)
    }

    /// The `to` address, if present and well-formed. An absent address
    /// means the stanza is for the server itself.
    pub fn to(&self) -> Option<Jid> {
        self.element
            .attribute("to", None)
            .and_then(|jid| jid.parse().ok())
    }

    pub fn from(&self) -> Option<Jid> {
        self.element
            .attribute("from", None)
            .and_then(|jid| jid.parse().ok())
    }

    pub fn set_from(&mut self, jid: &Jid) {
        self.element.set_attribute("from", None, &jid.to_string());
    }

    pub fn set_to(&mut self, jid: &Jid) {
        self.element.set_attribute("to", None, &jid.to_string());
    }

    pub fn iq_type(&self) -> Option<IqType> {
        if self.kind() != StanzaKind::Iq {
            return None;
        }
        match self.element.attribute("type", None) {
            Some("get") => Some(IqType::Get),
            Some("set") => Some(IqType::Set),
            Some("result") => Some(IqType::Result),
            Some("error") => Some(IqType::Error),
            _ => None,
        }
    }

    /// The single child element whose namespace keys IQ routing. `None`
    /// unless the stanza is an IQ with exactly one child element.
    pub fn iq_payload(&self) -> Option<&Element> {
        if self.kind() != StanzaKind::Iq {
            return None;
        }
        let mut children = self.element.child_elements();
        let payload = children.next()?;
        if children.next().is_some() {
            return None;
        }
        Some(payload)
    }

    /// An empty or payload-carrying `<iq type='result'>` answering
    /// `request`.
    pub fn iq_result(request: &Stanza, from: &Jid, to: &Jid, payload: Option<Element>) -> Stanza {
        let mut iq = Element::new("iq", Some(namespaces::XMPP_CLIENT));
        if let Some(id) = request.id() {
            iq.set_attribute("id", None, id);
        }
        iq.set_attribute("type", None, "result");
        iq.set_attribute("from", None, &from.to_string());
        iq.set_attribute("to", None, &to.to_string());
        if let Some(payload) = payload {
            iq.add_child(payload);
        }
        Stanza::new(iq)
    }

    /// An `<iq type='error'>` answering `request` with the given defined
    /// condition from `urn:ietf:params:xml:ns:xmpp-stanzas`.
    pub fn iq_error(
        request: &Stanza,
        from: &Jid,
        to: &Jid,
        error_type: &str,
        condition: &str,
    ) -> Stanza {
        let mut iq = Element::new("iq", Some(namespaces::XMPP_CLIENT));
        if let Some(id) = request.id() {
            iq.set_attribute("id", None, id);
        }
        iq.set_attribute("type", None, "error");
        iq.set_attribute("from", None, &from.to_string());
        iq.set_attribute("to", None, &to.to_string());
        iq.with_child("error", Some(namespaces::XMPP_CLIENT), |error| {
            error.set_attribute("type", None, error_type);
            error.with_child(condition, Some(namespaces::XMPP_STANZA_ERRORS), |condition| {
                condition.set_attribute("xmlns", None, namespaces::XMPP_STANZA_ERRORS);
            });
        });
        Stanza::new(iq)
    }

    pub fn presence(from: &Jid, to: &Jid, presence_type: Option<&str>) -> Stanza {
        let mut presence = Element::new("presence", Some(namespaces::XMPP_CLIENT));
        presence.set_attribute("from", None, &from.to_string());
        presence.set_attribute("to", None, &to.to_string());
        if let Some(presence_type) = presence_type {
            presence.set_attribute("type", None, presence_type);
        }
        Stanza::new(presence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iq_with_payload(payload_namespace: &str) -> Stanza {
        let mut iq = Element::new("iq", Some(namespaces::XMPP_CLIENT));
        iq.set_attribute("id", None, "r1");
        iq.set_attribute("type", None, "get");
        iq.with_child("query", Some(payload_namespace), |_| {});
        Stanza::new(iq)
    }

    #[test]
    fn kind_follows_element_name() {
        assert_eq!(
            Stanza::new(Element::new("message", None)).kind(),
            StanzaKind::Message
        );
        assert_eq!(
            Stanza::new(Element::new("presence", None)).kind(),
            StanzaKind::Presence
        );
        assert_eq!(Stanza::new(Element::new("iq", None)).kind(), StanzaKind::Iq);
        assert_eq!(
            Stanza::new(Element::new("handshake", None)).kind(),
            StanzaKind::Other
        );
    }

    #[test]
    fn addresses_parse_lazily() {
        let mut element = Element::new("message", None);
        element.set_attribute("to", None, "bob@localhost/work");
        let stanza = Stanza::new(element);
        assert_eq!(stanza.to(), Some("bob@localhost/work".parse().unwrap()));
        assert_eq!(stanza.from(), None);
    }

    #[test]
    fn malformed_address_reads_as_absent() {
        let mut element = Element::new("message", None);
        element.set_attribute("to", None, "@@");
        assert_eq!(Stanza::new(element).to(), None);
    }

    #[test]
    fn iq_payload_requires_exactly_one_child() {
        let stanza = iq_with_payload(namespaces::ROSTER);
        assert_eq!(stanza.iq_payload().unwrap().namespace(), Some(namespaces::ROSTER));

        let mut two_children = Element::new("iq", None);
        two_children.with_child("a", None, |_| {});
        two_children.with_child("b", None, |_| {});
        assert!(Stanza::new(two_children).iq_payload().is_none());

        assert!(Stanza::new(Element::new("iq", None)).iq_payload().is_none());
    }

    #[test]
    fn iq_payload_only_for_iq_stanzas() {
        let mut message = Element::new("message", None);
        message.with_child("body", None, |_| {});
        assert!(Stanza::new(message).iq_payload().is_none());
    }

    #[test]
    fn result_echoes_request_id() {
        let request = iq_with_payload(namespaces::ROSTER);
        let from: Jid = "localhost".parse().unwrap();
        let to: Jid = "alice@localhost/home".parse().unwrap();
        let result = Stanza::iq_result(&request, &from, &to, None);
        assert_eq!(result.id(), Some("r1"));
        assert_eq!(result.iq_type(), Some(IqType::Result));
        assert_eq!(result.to(), Some(to));
    }

    #[test]
    fn error_carries_condition() {
        let request = iq_with_payload(namespaces::XMPP_BIND);
        let from: Jid = "localhost".parse().unwrap();
        let to: Jid = "alice@localhost/home".parse().unwrap();
        let error = Stanza::iq_error(&request, &from, &to, "cancel", "conflict");
        assert_eq!(error.iq_type(), Some(IqType::Error));
        let error_child = error
            .element
            .find_child("error", Some(namespaces::XMPP_CLIENT))
            .unwrap();
        assert!(error_child
            .find_child("conflict", Some(namespaces::XMPP_STANZA_ERRORS))
            .is_some());
    }
}
