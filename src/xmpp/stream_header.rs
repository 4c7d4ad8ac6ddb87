use std::fmt::{Display, Formatter};

use crate::xmpp::jid::Jid;
use crate::xmpp::stream::StreamId;

#[derive(Debug, Clone)]
pub struct LanguageTag(pub String);

impl Display for LanguageTag {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Attributes of a `<stream:stream>` opening tag, either received from the
/// peer or about to be written.
#[derive(Debug, Default)]
pub struct StreamHeader {
    pub from: Option<Jid>,
    pub to: Option<Jid>,
    pub id: Option<StreamId>,
    pub language: Option<LanguageTag>,
}
