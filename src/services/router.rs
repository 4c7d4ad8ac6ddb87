use std::collections::HashMap;

use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::xmpp::jid::Jid;
use crate::xmpp::stanza::{IqType, Stanza, StanzaKind};

const STANZA_CHANNEL_BUFFER_SIZE: usize = 64;
const MANAGEMENT_CHANNEL_BUFFER_SIZE: usize = 16;

#[derive(thiserror::Error, Debug)]
pub enum RouterError {
    #[error("a route for {0} is already registered")]
    DuplicateRoute(Jid),
    #[error("an IQ route for {0} is already registered")]
    DuplicateIqRoute(String),
    #[error("the router is shutting down")]
    ShuttingDown,
    #[error("the router is gone")]
    Closed,
}

/// The callback half of a route. Delivery is synchronous and must not
/// block; `true` means delivered, `false` means the target could not take
/// the stanza. The router only logs a failed delivery, it never removes
/// the route on its own.
pub trait RouteTarget: Send {
    fn deliver(&mut self, stanza: &Stanza) -> bool;
}

/// Client connections and actor-style components are both reached through
/// a stanza channel; a full channel is a failed delivery (the peer is too
/// slow and gets disconnected rather than throttled).
impl RouteTarget for mpsc::Sender<Stanza> {
    fn deliver(&mut self, stanza: &Stanza) -> bool {
        self.try_send(stanza.clone()).is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

struct StanzaRoute {
    pattern: Jid,
    target: Box<dyn RouteTarget>,
}

enum ManagementCommand {
    RegisterStanzaRoute {
        pattern: Jid,
        target: Box<dyn RouteTarget>,
        reply: oneshot::Sender<Result<(), RouterError>>,
    },
    DeregisterStanzaRoute {
        pattern: Jid,
    },
    RegisterIqRoute {
        namespace: String,
        target: Box<dyn RouteTarget>,
        reply: oneshot::Sender<Result<(), RouterError>>,
    },
    DeregisterIqRoute {
        namespace: String,
    },
    AddDisconnectListener {
        listener: mpsc::Sender<Jid>,
        reply: oneshot::Sender<ListenerId>,
    },
    RemoveDisconnectListener {
        id: ListenerId,
    },
    ClientDisconnected {
        jid: Jid,
    },
    Shutdown,
}

/// The routing fabric. Owns the ordered stanza-route table (first match
/// wins, insertion order breaks ties) and the IQ-route table keyed by
/// payload namespace. Runs as a single task, so a lookup always completes
/// before the matched target runs, and table mutations triggered from
/// inside a delivery arrive as queued commands instead of invalidating a
/// traversal in progress.
struct Router {
    server_jid: Jid,
    stanzas: mpsc::Receiver<Stanza>,
    management: mpsc::Receiver<ManagementCommand>,
    stanza_routes: Vec<StanzaRoute>,
    iq_routes: HashMap<String, Box<dyn RouteTarget>>,
    disconnect_listeners: Vec<(ListenerId, mpsc::Sender<Jid>)>,
    next_listener_id: u64,
    shutting_down: bool,
}

impl Router {
    async fn run(&mut self) {
        loop {
            select! {
                Some(stanza) = self.stanzas.recv() => {
                    self.route_stanza(stanza);
                }
                command = self.management.recv() => {
                    match command {
                        Some(command) => self.handle_management_command(command),
                        None => return,
                    }
                }
            }
        }
    }

    fn route_stanza(&mut self, stanza: Stanza) {
        // request IQs dispatch on their payload namespace first; responses
        // always travel by address
        if stanza.kind() == StanzaKind::Iq
            && matches!(stanza.iq_type(), Some(IqType::Get) | Some(IqType::Set))
        {
            if let Some(namespace) = stanza.iq_payload().and_then(|p| p.namespace()) {
                let namespace = namespace.to_string();
                if let Some(target) = self.iq_routes.get_mut(&namespace) {
                    if !target.deliver(&stanza) {
                        warn!(namespace, "IQ route refused delivery");
                    }
                    return;
                }
            }
        }

        let to = stanza.to().unwrap_or_else(|| self.server_jid.clone());
        match self
            .stanza_routes
            .iter_mut()
            .find(|route| route.pattern.matches(&to))
        {
            Some(route) => {
                if !route.target.deliver(&stanza) {
                    warn!(pattern = %route.pattern, "route refused delivery");
                }
            }
            None => {
                info!(%to, "no route, dropping stanza");
            }
        }
    }

    fn handle_management_command(&mut self, command: ManagementCommand) {
        match command {
            ManagementCommand::RegisterStanzaRoute {
                pattern,
                target,
                reply,
            } => {
                let _ = reply.send(self.register_stanza_route(pattern, target));
            }
            ManagementCommand::DeregisterStanzaRoute { pattern } => {
                self.deregister_stanza_route(&pattern);
            }
            ManagementCommand::RegisterIqRoute {
                namespace,
                target,
                reply,
            } => {
                let _ = reply.send(self.register_iq_route(namespace, target));
            }
            ManagementCommand::DeregisterIqRoute { namespace } => {
                if self.iq_routes.remove(&namespace).is_none() {
                    warn!(namespace, "deregistering unknown IQ route");
                }
            }
            ManagementCommand::AddDisconnectListener { listener, reply } => {
                let id = ListenerId(self.next_listener_id);
                self.next_listener_id += 1;
                self.disconnect_listeners.push((id, listener));
                let _ = reply.send(id);
            }
            ManagementCommand::RemoveDisconnectListener { id } => {
                let before = self.disconnect_listeners.len();
                self.disconnect_listeners.retain(|(listener_id, _)| *listener_id != id);
                if self.disconnect_listeners.len() == before {
                    warn!(?id, "removing unknown disconnect listener");
                }
            }
            ManagementCommand::ClientDisconnected { jid } => {
                self.deregister_stanza_route(&jid);
                for (_, listener) in &self.disconnect_listeners {
                    let _ = listener.try_send(jid.clone());
                }
            }
            ManagementCommand::Shutdown => {
                debug!("router shutting down");
                self.shutting_down = true;
            }
        }
    }

    fn register_stanza_route(
        &mut self,
        pattern: Jid,
        target: Box<dyn RouteTarget>,
    ) -> Result<(), RouterError> {
        if self.shutting_down {
            warn!(%pattern, "rejecting route registration during shutdown");
            return Err(RouterError::ShuttingDown);
        }
        if self.stanza_routes.iter().any(|route| route.pattern == pattern) {
            warn!(%pattern, "duplicate route registration ignored");
            return Err(RouterError::DuplicateRoute(pattern));
        }
        debug!(%pattern, "route registered");
        self.stanza_routes.push(StanzaRoute { pattern, target });
        Ok(())
    }

    fn deregister_stanza_route(&mut self, pattern: &Jid) {
        match self
            .stanza_routes
            .iter()
            .position(|route| route.pattern == *pattern)
        {
            Some(index) => {
                self.stanza_routes.remove(index);
                debug!(%pattern, "route deregistered");
            }
            None => {
                warn!(%pattern, "deregistering unknown route");
            }
        }
    }

    fn register_iq_route(
        &mut self,
        namespace: String,
        target: Box<dyn RouteTarget>,
    ) -> Result<(), RouterError> {
        if self.shutting_down {
            warn!(namespace, "rejecting IQ route registration during shutdown");
            return Err(RouterError::ShuttingDown);
        }
        if self.iq_routes.contains_key(&namespace) {
            warn!(namespace, "duplicate IQ route registration ignored");
            return Err(RouterError::DuplicateIqRoute(namespace));
        }
        debug!(namespace, "IQ route registered");
        self.iq_routes.insert(namespace, target);
        Ok(())
    }
}

/// Cloneable handle to the router task; this is the registration surface
/// components and connections program against.
#[derive(Clone)]
pub struct RouterHandle {
    server_jid: Jid,
    stanzas: mpsc::Sender<Stanza>,
    management: mpsc::Sender<ManagementCommand>,
}

impl RouterHandle {
    pub fn new(server_jid: Jid) -> Self {
        let (stanzas_tx, stanzas_rx) = mpsc::channel(STANZA_CHANNEL_BUFFER_SIZE);
        let (management_tx, management_rx) = mpsc::channel(MANAGEMENT_CHANNEL_BUFFER_SIZE);
        let mut router = Router {
            server_jid: server_jid.clone(),
            stanzas: stanzas_rx,
            management: management_rx,
            stanza_routes: Vec::new(),
            iq_routes: HashMap::new(),
            disconnect_listeners: Vec::new(),
            next_listener_id: 0,
            shutting_down: false,
        };
        tokio::spawn(async move {
            router.run().await;
        });

        RouterHandle {
            server_jid,
            stanzas: stanzas_tx,
            management: management_tx,
        }
    }

    pub fn server_jid(&self) -> &Jid {
        &self.server_jid
    }

    /// A sender components can hold to re-submit stanzas from inside a
    /// synchronous delivery; submissions queue behind the dispatch that
    /// produced them.
    pub fn stanza_sender(&self) -> mpsc::Sender<Stanza> {
        self.stanzas.clone()
    }

    pub async fn send_stanza(&self, stanza: Stanza) -> Result<(), RouterError> {
        self.stanzas
            .send(stanza)
            .await
            .map_err(|_| RouterError::Closed)
    }

    pub async fn register_stanza_route(
        &self,
        pattern: Jid,
        target: Box<dyn RouteTarget>,
    ) -> Result<(), RouterError> {
        let (reply, rx) = oneshot::channel();
        self.management
            .send(ManagementCommand::RegisterStanzaRoute {
                pattern,
                target,
                reply,
            })
            .await
            .map_err(|_| RouterError::Closed)?;
        rx.await.map_err(|_| RouterError::Closed)?
    }

    pub async fn deregister_stanza_route(&self, pattern: Jid) {
        let _ = self
            .management
            .send(ManagementCommand::DeregisterStanzaRoute { pattern })
            .await;
    }

    pub async fn register_iq_route(
        &self,
        namespace: &str,
        target: Box<dyn RouteTarget>,
    ) -> Result<(), RouterError> {
        let (reply, rx) = oneshot::channel();
        self.management
            .send(ManagementCommand::RegisterIqRoute {
                namespace: namespace.to_string(),
                target,
                reply,
            })
            .await
            .map_err(|_| RouterError::Closed)?;
        rx.await.map_err(|_| RouterError::Closed)?
    }

    pub async fn deregister_iq_route(&self, namespace: &str) {
        let _ = self
            .management
            .send(ManagementCommand::DeregisterIqRoute {
                namespace: namespace.to_string(),
            })
            .await;
    }

    pub async fn add_client_disconnect_listener(
        &self,
        listener: mpsc::Sender<Jid>,
    ) -> Result<ListenerId, RouterError> {
        let (reply, rx) = oneshot::channel();
        self.management
            .send(ManagementCommand::AddDisconnectListener { listener, reply })
            .await
            .map_err(|_| RouterError::Closed)?;
        rx.await.map_err(|_| RouterError::Closed)
    }

    pub async fn remove_client_disconnect_listener(&self, id: ListenerId) {
        let _ = self
            .management
            .send(ManagementCommand::RemoveDisconnectListener { id })
            .await;
    }

    /// Tears down a client's presence in the fabric: its self-route is
    /// removed and every disconnect listener hears about the JID. Safe to
    /// call for a JID that never finished binding.
    pub async fn client_disconnected(&self, jid: Jid) {
        let _ = self
            .management
            .send(ManagementCommand::ClientDisconnected { jid })
            .await;
    }

    pub async fn shutdown(&self) {
        let _ = self.management.send(ManagementCommand::Shutdown).await;
    }
}
