use anyhow::{anyhow, Error};
use futures::Future;
use tokio::{
    select,
    sync::{mpsc, oneshot},
};
use tracing::warn;

use crate::inbound::sasl::StoredPasswordArgon2;
use crate::xmpp::jid::Jid;

#[cfg(test)]
use crate::inbound::sasl::StoredPassword;

pub mod sqlite;

pub use sqlite::SqliteStoreBackend;

enum Query {
    GetStoredPassword {
        jid: Jid,
        tx: oneshot::Sender<Option<StoredPasswordArgon2>>,
    },
}

enum Command {
    AddUser {
        jid: Jid,
        stored_password: String,
        tx: oneshot::Sender<Result<(), Error>>,
    },
    RemoveUser {
        jid: Jid,
        tx: oneshot::Sender<Result<(), Error>>,
    },
}

struct Store<B>
where
    B: StoreBackend,
{
    queries: mpsc::Receiver<Query>,
    commands: mpsc::Receiver<Command>,
    backend: B,
}

impl<B> Store<B>
where
    B: StoreBackend,
{
    async fn run(&mut self) {
        loop {
            select! {
                Some(query) = self.queries.recv() => {
                    self.handle_query(query).await;
                }
                Some(command) = self.commands.recv() => {
                    self.handle_command(command).await;
                }
                else => return,
            }
        }
    }

    async fn handle_query(&mut self, query: Query) {
        match query {
            Query::GetStoredPassword { jid, tx } => {
                let result = self
                    .backend
                    .get_stored_password(jid)
                    .await
                    .and_then(|s| s.as_str().parse::<StoredPasswordArgon2>().ok());
                if tx.send(result).is_err() {
                    warn!("credential query abandoned before the answer");
                }
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::AddUser {
                jid,
                stored_password,
                tx,
            } => {
                let _ = tx.send(self.backend.add_user(jid, stored_password).await);
            }
            Command::RemoveUser { jid, tx } => {
                let _ = tx.send(self.backend.remove_user(jid).await);
            }
        }
    }
}

/// Cloneable handle to the credential store task.
#[derive(Clone)]
pub struct StoreHandle {
    queries: mpsc::Sender<Query>,
    commands: mpsc::Sender<Command>,
}

impl StoreHandle {
    pub fn new<B>(backend: B) -> Self
    where
        B: StoreBackend + Send + 'static,
    {
        let (queries_tx, queries_rx) = mpsc::channel(8);
        let (commands_tx, commands_rx) = mpsc::channel(8);
        let mut store = Store {
            queries: queries_rx,
            commands: commands_rx,
            backend,
        };
        tokio::spawn(async move {
            store.run().await;
        });

        StoreHandle {
            queries: queries_tx,
            commands: commands_tx,
        }
    }

    /// The stored password for a bare JID, or `None` for an unknown user.
    pub async fn get_stored_password(&self, jid: Jid) -> Option<StoredPasswordArgon2> {
        let (tx, rx) = oneshot::channel();
        let msg = Query::GetStoredPassword {
            jid: jid.to_bare(),
            tx,
        };

        if self.queries.send(msg).await.is_err() {
            return None;
        }
        rx.await.unwrap_or(None)
    }

    pub async fn add_user(&self, jid: Jid, stored_password: String) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        let msg = Command::AddUser {
            jid: jid.to_bare(),
            stored_password,
            tx,
        };

        self.commands
            .send(msg)
            .await
            .map_err(|_| anyhow!("store is gone"))?;
        rx.await.map_err(|_| anyhow!("store is gone"))?
    }

    pub async fn remove_user(&self, jid: Jid) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        let msg = Command::RemoveUser {
            jid: jid.to_bare(),
            tx,
        };

        self.commands
            .send(msg)
            .await
            .map_err(|_| anyhow!("store is gone"))?;
        rx.await.map_err(|_| anyhow!("store is gone"))?
    }
}

pub trait StoreBackend {
    fn get_stored_password(&self, jid: Jid) -> impl Future<Output = Option<String>> + Send;

    fn add_user(
        &mut self,
        jid: Jid,
        stored_password: String,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    fn remove_user(&mut self, jid: Jid) -> impl Future<Output = Result<(), Error>> + Send;
}

#[cfg(test)]
pub(crate) struct StubStoreBackend {
    pub users: std::collections::HashMap<String, String>,
}

#[cfg(test)]
impl StubStoreBackend {
    /// A backend holding the given `(bare_jid, plaintext password)` pairs.
    pub fn with_users(users: &[(&str, &str)]) -> Self {
        let users = users
            .iter()
            .map(|(jid, password)| {
                let stored = StoredPasswordArgon2::new(password).unwrap().to_string();
                (jid.to_string(), stored)
            })
            .collect();
        Self { users }
    }
}

#[cfg(test)]
impl StoreBackend for StubStoreBackend {
    async fn get_stored_password(&self, jid: Jid) -> Option<String> {
        self.users.get(&jid.to_bare().to_string()).cloned()
    }

    async fn add_user(&mut self, jid: Jid, stored_password: String) -> Result<(), Error> {
        self.users.insert(jid.to_bare().to_string(), stored_password);
        Ok(())
    }

    async fn remove_user(&mut self, jid: Jid) -> Result<(), Error> {
        self.users.remove(&jid.to_bare().to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn known_user_verifies_with_the_right_password() {
        let store = StoreHandle::new(StubStoreBackend::with_users(&[("alice@localhost", "secret")]));
        let jid: Jid = "alice@localhost/home".parse().unwrap();

        let stored = store.get_stored_password(jid).await.unwrap();
        assert!(stored.verify("secret"));
        assert!(!stored.verify("wrong"));
    }

    #[tokio::test]
    async fn unknown_user_has_no_stored_password() {
        let store = StoreHandle::new(StubStoreBackend::with_users(&[]));
        let jid: Jid = "nobody@localhost".parse().unwrap();
        assert!(store.get_stored_password(jid).await.is_none());
    }

    #[tokio::test]
    async fn add_and_remove_roundtrip() {
        let store = StoreHandle::new(StubStoreBackend::with_users(&[]));
        let jid: Jid = "carol@localhost".parse().unwrap();

        let stored = StoredPasswordArgon2::new("pw").unwrap().to_string();
        store.add_user(jid.clone(), stored).await.unwrap();
        assert!(store.get_stored_password(jid.clone()).await.is_some());

        store.remove_user(jid.clone()).await.unwrap();
        assert!(store.get_stored_password(jid).await.is_none());
    }
}
