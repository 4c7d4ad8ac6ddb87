use std::collections::HashSet;

use anyhow::{anyhow, bail, Error};
use tokio::select;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use crate::services::router::RouterHandle;
use crate::services::store::StoreHandle;
use crate::xml::stream_parser::{Frame, StreamParser};
use crate::xml::{namespaces, Element};
use crate::xmpp::jid::Jid;
use crate::xmpp::stanza::{Stanza, StanzaKind};
use crate::xmpp::stream::{Connection, StreamId, XmppStream};
use crate::xmpp::stream_header::StreamHeader;
use tokio::io::ReadHalf;

use self::bind::ResourceBindingNegotiator;
use self::sasl::SaslNegotiator;
use self::session::SessionNegotiator;
use self::starttls::StarttlsNegotiator;

mod bind;
pub mod connection;
pub mod sasl;
mod session;
mod starttls;

const STANZA_CHANNEL_BUFFER_SIZE: usize = 8;

#[derive(Debug, Hash, Eq, PartialEq)]
enum StreamFeature {
    Tls,
    Authentication,
    ResourceBinding,
    Session,
}

struct StreamInfo {
    stream_id: StreamId,
    /// Bare JID once SASL is done.
    entity: Option<Jid>,
    /// Full JID once a resource is bound; its presence is also what makes
    /// teardown deregister the self-route exactly once.
    bound_jid: Option<Jid>,
    features: HashSet<StreamFeature>,
}

impl Default for StreamInfo {
    fn default() -> Self {
        StreamInfo {
            stream_id: StreamId::new(),
            entity: None,
            bound_jid: None,
            features: HashSet::new(),
        }
    }
}

pub struct InboundStreamSettings {
    pub domain: Jid,
    pub buffer_size: usize,
}

/// Drives one client connection from TCP accept to session, then routes
/// its stanzas. The negotiation walk is: (optional) STARTTLS, SASL,
/// resource binding, (optional) session establishment, with a stream
/// restart after STARTTLS and after SASL success.
pub struct InboundStream<C, P>
where
    C: Connection,
    P: StreamParser<ReadHalf<C>>,
{
    stream: XmppStream<C, P>,
    info: StreamInfo,
    router: RouterHandle,
    store: StoreHandle,
    stanza_tx: Sender<Stanza>,
    stanza_rx: Receiver<Stanza>,
    settings: InboundStreamSettings,
}

impl<C, P> InboundStream<C, P>
where
    C: Connection,
    P: StreamParser<ReadHalf<C>>,
{
    pub fn new(
        connection: C,
        router: RouterHandle,
        store: StoreHandle,
        settings: InboundStreamSettings,
    ) -> Self {
        let stream = XmppStream::new(connection, settings.buffer_size);
        let info = StreamInfo::default();
        let (stanza_tx, stanza_rx) = mpsc::channel(STANZA_CHANNEL_BUFFER_SIZE);

        InboundStream {
            stream,
            info,
            router,
            store,
            stanza_tx,
            stanza_rx,
            settings,
        }
    }

    pub async fn handle(&mut self) {
        if let Err(error) = self.inner_handle().await {
            debug!(%error, "closing stream after error");
            let _ = self.send_stream_error("internal-server-error").await;
        }
        self.teardown().await;
    }

    async fn inner_handle(&mut self) -> Result<(), Error> {
        self.exchange_stream_headers().await?;
        self.advertise_features().await?;

        loop {
            select! {
                frame = self.stream.reader().next() => {
                    match frame {
                        Some(Ok(Frame::XmlFragment(element))) => {
                            self.process_element(element).await?;
                        }
                        Some(Ok(Frame::StreamStart(_))) => {
                            bail!("unexpected stream restart");
                        }
                        Some(Ok(Frame::StreamEnd)) | None => {
                            debug!("peer closed the stream");
                            return Ok(());
                        }
                        Some(Err(error)) => {
                            warn!(%error, "parse error, dropping connection");
                            let _ = self.send_stream_error("bad-format").await;
                            return Ok(());
                        }
                    }
                }
                Some(stanza) = self.stanza_rx.recv() => {
                    self.stream.writer().write_xml_element(&stanza.element).await?;
                }
            }
        }
    }

    async fn process_element(&mut self, element: Element) -> Result<(), Error> {
        if !self.info.features.contains(&StreamFeature::Tls)
            && self.stream.is_starttls_allowed()
            && StarttlsNegotiator::claims(&element)
        {
            StarttlsNegotiator::negotiate_feature(&mut self.stream, &element).await?;
            self.info.features.insert(StreamFeature::Tls);
            return self.restart_stream().await;
        }

        if !self.info.features.contains(&StreamFeature::Authentication)
            && SaslNegotiator::claims(&element)
        {
            let entity = SaslNegotiator::negotiate_feature(
                &mut self.stream,
                &element,
                self.store.clone(),
                &self.settings.domain,
            )
            .await?;
            self.info.entity = Some(entity);
            self.info.features.insert(StreamFeature::Authentication);
            return self.restart_stream().await;
        }

        if self.info.features.contains(&StreamFeature::Authentication)
            && !self.info.features.contains(&StreamFeature::ResourceBinding)
            && ResourceBindingNegotiator::claims(&element)
        {
            let entity = self
                .info
                .entity
                .clone()
                .ok_or_else(|| anyhow!("no authenticated entity to bind"))?;
            let bound = ResourceBindingNegotiator::negotiate_feature(
                &mut self.stream,
                &element,
                &entity,
                &self.router,
                &self.stanza_tx,
            )
            .await?;
            // a conflict leaves the stream unbound; the client may retry
            if let Some(full_jid) = bound {
                self.info.bound_jid = Some(full_jid);
                self.info.features.insert(StreamFeature::ResourceBinding);
            }
            return Ok(());
        }

        if self.info.features.contains(&StreamFeature::ResourceBinding)
            && !self.info.features.contains(&StreamFeature::Session)
            && SessionNegotiator::claims(&element)
        {
            SessionNegotiator::negotiate_feature(&mut self.stream, &element).await?;
            self.info.features.insert(StreamFeature::Session);
            return Ok(());
        }

        self.submit_stanza(element).await
    }

    async fn submit_stanza(&mut self, element: Element) -> Result<(), Error> {
        let Some(bound_jid) = self.info.bound_jid.clone() else {
            bail!("stanza before resource binding");
        };

        let mut stanza = Stanza::new(element);
        if stanza.kind() == StanzaKind::Other {
            bail!("unknown top-level element");
        }

        // the server, not the client, asserts the sender address
        stanza.set_from(&bound_jid);
        self.router
            .send_stanza(stanza)
            .await
            .map_err(|err| anyhow!(err))
    }

    fn negotiable_features(&self) -> Vec<StreamFeature> {
        let mut features = Vec::new();

        if self.stream.is_starttls_allowed() && !self.info.features.contains(&StreamFeature::Tls) {
            features.push(StreamFeature::Tls);
        }

        if !self.info.features.contains(&StreamFeature::Authentication) {
            features.push(StreamFeature::Authentication);
        }

        if self.info.features.contains(&StreamFeature::Authentication)
            && !self.info.features.contains(&StreamFeature::ResourceBinding)
        {
            features.push(StreamFeature::ResourceBinding);
            features.push(StreamFeature::Session);
        }

        features
    }

    async fn advertise_features(&mut self) -> Result<(), Error> {
        let mut features = Element::new("features", Some(namespaces::XMPP_STREAMS));
        for feature in self.negotiable_features() {
            features.add_child(match feature {
                StreamFeature::Tls => StarttlsNegotiator::advertise_feature(),
                StreamFeature::Authentication => SaslNegotiator::advertise_feature(),
                StreamFeature::ResourceBinding => ResourceBindingNegotiator::advertise_feature(),
                StreamFeature::Session => SessionNegotiator::advertise_feature(),
            });
        }

        self.stream.writer().write_xml_element(&features).await
    }

    /// The restart mandated after STARTTLS and SASL: all parse state is
    /// dropped with the old parser, the peer opens a new stream, and a
    /// fresh header and features advertisement go out.
    async fn restart_stream(&mut self) -> Result<(), Error> {
        self.stream.reset();
        self.info.stream_id = StreamId::new();
        self.exchange_stream_headers().await?;
        self.advertise_features().await
    }

    async fn exchange_stream_headers(&mut self) -> Result<(), Error> {
        let frame = self
            .stream
            .reader()
            .next()
            .await
            .ok_or_else(|| anyhow!("stream closed by peer"))??;

        let Frame::StreamStart(_) = frame else {
            bail!("expected stream header");
        };

        let outbound_header = StreamHeader {
            from: Some(self.settings.domain.clone()),
            to: self.info.bound_jid.clone().or_else(|| self.info.entity.clone()),
            id: Some(self.info.stream_id.clone()),
            language: None,
        };

        self.stream
            .writer()
            .write_stream_header(&outbound_header, true)
            .await
    }

    async fn send_stream_error(&mut self, condition: &str) -> Result<(), Error> {
        let mut error = Element::new("error", Some(namespaces::XMPP_STREAMS));
        error.with_child(condition, Some(namespaces::XMPP_STREAM_ERRORS), |condition| {
            condition.set_attribute("xmlns", None, namespaces::XMPP_STREAM_ERRORS);
        });
        self.stream.writer().write_xml_element(&error).await
    }

    /// Safe to run no matter how far negotiation got, and safe to run
    /// twice; deregistration happens at most once because the bound JID is
    /// taken out.
    async fn teardown(&mut self) {
        if let Some(jid) = self.info.bound_jid.take() {
            self.router.client_disconnected(jid).await;
        }
        let _ = self.stream.writer().write_stream_close().await;
    }
}
