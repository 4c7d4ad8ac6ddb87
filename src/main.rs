use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::select;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::inbound::connection::TcpConnection;
use crate::inbound::sasl::{StoredPassword, StoredPasswordArgon2};
use crate::inbound::{InboundStream, InboundStreamSettings};
use crate::services::router::RouterHandle;
use crate::services::store::{SqliteStoreBackend, StoreHandle};
use crate::settings::Settings;
use crate::xml::stream_parser::rusty_xml::RustyXmlStreamParser;
use crate::xmpp::jid::Jid;

mod components;
mod inbound;
mod services;
mod settings;
mod xml;
mod xmpp;

type Error = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    AddUser { bare_jid: String, password: String },
    RemoveUser { bare_jid: String },
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = Settings::init()?;

    let store_backend = SqliteStoreBackend::new(&settings).await?;
    let store = StoreHandle::new(store_backend);

    let cli = Cli::parse();
    match cli.command {
        Some(Commands::AddUser { bare_jid, password }) => {
            let bare_jid = bare_jid.parse::<Jid>()?.to_bare();
            let stored_password = StoredPasswordArgon2::new(&password)?.to_string();
            store.add_user(bare_jid, stored_password).await?;
        }
        Some(Commands::RemoveUser { bare_jid }) => {
            let bare_jid = bare_jid.parse::<Jid>()?.to_bare();
            store.remove_user(bare_jid).await?;
        }
        None => serve(settings, store).await?,
    }

    Ok(())
}

async fn serve(settings: Settings, store: StoreHandle) -> Result<(), Error> {
    let listener =
        TcpListener::bind((settings.listen_addr.as_str(), settings.listen_port)).await?;
    info!(
        addr = %settings.listen_addr,
        port = settings.listen_port,
        domain = %settings.domain,
        tls = settings.tls.is_some(),
        "listening for client streams"
    );

    let router = RouterHandle::new(settings.domain.clone());
    components::core::activate(&router).await?;
    components::muc::activate(&router).await?;

    loop {
        select! {
            accepted = listener.accept() => {
                let (socket, peer_addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!(%err, "accept failed");
                        continue;
                    }
                };
                debug!(%peer_addr, "accepted connection");

                let connection = TcpConnection::new(
                    socket,
                    settings.tls.as_ref().map(|tls| tls.server_config.clone()),
                );
                let stream_settings = InboundStreamSettings {
                    domain: settings.domain.clone(),
                    buffer_size: settings.buffer_size,
                };
                let router = router.clone();
                let store = store.clone();

                tokio::spawn(async move {
                    let mut stream = InboundStream::<_, RustyXmlStreamParser<_>>::new(
                        connection,
                        router,
                        store,
                        stream_settings,
                    );
                    stream.handle().await;
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                router.shutdown().await;
                return Ok(());
            }
        }
    }
}
