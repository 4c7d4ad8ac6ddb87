use std::fmt::Display;
use std::str::FromStr;

use anyhow::{anyhow, bail, Error};
use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use base64::prelude::*;
use password_hash::{rand_core::OsRng, PasswordHashString, SaltString};
use tokio::io::ReadHalf;
use tokio_stream::StreamExt;
use tracing::debug;

use crate::services::store::StoreHandle;
use crate::xml::stream_parser::{Frame, StreamParser};
use crate::xml::{namespaces, Element};
use crate::xmpp::jid::Jid;
use crate::xmpp::stream::{Connection, XmppStream};

#[derive(thiserror::Error, Debug)]
pub enum SaslError {
    #[error("the SASL mechanism `{0}` is not supported")]
    UnsupportedMechanism(String),
}

enum Mechanism {
    Plain,
}

impl Mechanism {
    fn to_element(&self) -> Element {
        let mut mechanism = Element::new("mechanism", Some(namespaces::XMPP_SASL));
        mechanism.add_text(&self.to_string());
        mechanism
    }
}

impl TryFrom<&str> for Mechanism {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "PLAIN" => Ok(Mechanism::Plain),
            _ => bail!(SaslError::UnsupportedMechanism(value.into())),
        }
    }
}

impl Display for Mechanism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mechanism::Plain => write!(f, "PLAIN"),
        }
    }
}

/// The `authzid NUL authcid NUL passwd` payload of RFC 4616. The
/// authorization identity is accepted but ignored; clients of this server
/// only ever act as themselves.
fn parse_plain_payload(text: &str) -> Result<(String, String), &'static str> {
    let payload = BASE64_STANDARD
        .decode(text)
        .map_err(|_| "incorrect-encoding")?;

    let parts: Vec<&[u8]> = payload.split(|byte| *byte == 0).collect();
    if parts.len() != 3 {
        return Err("incorrect-encoding");
    }

    let authcid = std::str::from_utf8(parts[1]).map_err(|_| "incorrect-encoding")?;
    let password = std::str::from_utf8(parts[2]).map_err(|_| "incorrect-encoding")?;
    if authcid.is_empty() {
        return Err("incorrect-encoding");
    }

    Ok((authcid.to_string(), password.to_string()))
}

pub struct SaslNegotiator {
    _private: (),
}

impl SaslNegotiator {
    pub fn advertise_feature() -> Element {
        let mut mechanisms = Element::new("mechanisms", Some(namespaces::XMPP_SASL));
        mechanisms.set_attribute("xmlns", None, namespaces::XMPP_SASL);
        mechanisms.add_child(Mechanism::Plain.to_element());
        mechanisms
    }

    pub fn claims(element: &Element) -> bool {
        element.validate("auth", Some(namespaces::XMPP_SASL))
    }

    /// Runs the SASL exchange to completion. A failed attempt answers
    /// `<failure/>` and waits for the client to try again or abort; the
    /// bare JID of the authenticated user is returned on success.
    pub async fn negotiate_feature<C, P>(
        stream: &mut XmppStream<C, P>,
        element: &Element,
        store: StoreHandle,
        domain: &Jid,
    ) -> Result<Jid, Error>
    where
        C: Connection,
        P: StreamParser<ReadHalf<C>>,
    {
        if !Self::claims(element) {
            bail!("expected auth element");
        }

        let mut auth = element.clone();

        loop {
            match Self::check_credentials(&auth, &store, domain).await {
                Ok(jid) => {
                    let mut success = Element::new("success", Some(namespaces::XMPP_SASL));
                    success.set_attribute("xmlns", None, namespaces::XMPP_SASL);
                    stream.writer().write_xml_element(&success).await?;
                    debug!(%jid, "authenticated");
                    return Ok(jid);
                }
                Err(condition) => {
                    debug!(condition, "authentication attempt failed");
                    let mut failure = Element::new("failure", Some(namespaces::XMPP_SASL));
                    failure.set_attribute("xmlns", None, namespaces::XMPP_SASL);
                    failure.with_child(condition, Some(namespaces::XMPP_SASL), |_| {});
                    stream.writer().write_xml_element(&failure).await?;
                }
            }

            let Some(Ok(Frame::XmlFragment(next))) = stream.reader().next().await else {
                bail!("peer abandoned authentication");
            };

            if Self::claims(&next) {
                auth = next;
            } else if next.validate("abort", Some(namespaces::XMPP_SASL)) {
                bail!("authentication aborted");
            } else {
                bail!("unexpected element during authentication");
            }
        }
    }

    async fn check_credentials(
        auth: &Element,
        store: &StoreHandle,
        domain: &Jid,
    ) -> Result<Jid, &'static str> {
        let mechanism = auth
            .attribute("mechanism", None)
            .ok_or("invalid-mechanism")?;
        let Ok(Mechanism::Plain) = Mechanism::try_from(mechanism) else {
            return Err("invalid-mechanism");
        };

        let (authcid, password) = parse_plain_payload(&auth.text())?;
        let jid = Jid::new(Some(&authcid), domain.domain(), None);

        let stored = store
            .get_stored_password(jid.clone())
            .await
            .ok_or("not-authorized")?;
        if stored.verify(&password) {
            Ok(jid)
        } else {
            Err("not-authorized")
        }
    }
}

pub trait StoredPassword: FromStr + Display {
    fn new(plaintext: &str) -> Result<Self, Error>
    where
        Self: Sized;

    fn verify(&self, plaintext: &str) -> bool;
}

/// An argon2 hash in PHC string form, as kept by the credential store.
pub struct StoredPasswordArgon2 {
    pub hash: PasswordHashString,
}

impl StoredPassword for StoredPasswordArgon2 {
    fn new(plaintext: &str) -> Result<Self, Error> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = Argon2::default()
            .hash_password(plaintext.as_bytes(), &salt)
            .map_err(|err| anyhow!(err))?
            .serialize();
        Ok(Self { hash })
    }

    fn verify(&self, plaintext: &str) -> bool {
        Argon2::default()
            .verify_password(plaintext.as_bytes(), &self.hash.password_hash())
            .is_ok()
    }
}

impl FromStr for StoredPasswordArgon2 {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hash = PasswordHashString::new(s).map_err(|err| anyhow!(err))?;
        Ok(Self { hash })
    }
}

impl Display for StoredPasswordArgon2 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.hash.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(payload: &[u8]) -> String {
        BASE64_STANDARD.encode(payload)
    }

    #[test]
    fn plain_payload_splits_on_nul() {
        let (authcid, password) = parse_plain_payload(&encode(b"\0alice\0secret")).unwrap();
        assert_eq!(authcid, "alice");
        assert_eq!(password, "secret");
    }

    #[test]
    fn plain_payload_with_authzid() {
        let (authcid, password) =
            parse_plain_payload(&encode(b"alice@localhost\0alice\0secret")).unwrap();
        assert_eq!(authcid, "alice");
        assert_eq!(password, "secret");
    }

    #[test]
    fn malformed_plain_payloads_are_rejected() {
        assert!(parse_plain_payload("!!!not base64!!!").is_err());
        assert!(parse_plain_payload(&encode(b"no separators")).is_err());
        assert!(parse_plain_payload(&encode(b"\0alice\0se\0cret")).is_err());
        assert!(parse_plain_payload(&encode(b"\0\0secret")).is_err());
    }

    #[test]
    fn unsupported_mechanisms_are_rejected() {
        assert!(Mechanism::try_from("PLAIN").is_ok());
        assert!(Mechanism::try_from("SCRAM-SHA-1").is_err());
        assert!(Mechanism::try_from("EXTERNAL").is_err());
    }

    #[test]
    fn stored_password_roundtrips_through_phc_string() {
        let stored = StoredPasswordArgon2::new("secret").unwrap();
        let reparsed: StoredPasswordArgon2 = stored.to_string().parse().unwrap();
        assert!(reparsed.verify("secret"));
        assert!(!reparsed.verify("guess"));
    }

    #[test]
    fn advertisement_lists_plain() {
        let mechanisms = SaslNegotiator::advertise_feature();
        assert!(mechanisms.validate("mechanisms", Some(namespaces::XMPP_SASL)));
        assert_eq!(mechanisms.text(), "PLAIN");
    }
}
