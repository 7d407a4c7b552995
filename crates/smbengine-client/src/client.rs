//! Client entry point: configuration, identity and client-scoped tables.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;
use uuid::Uuid;

use crate::breaks::BreakDispatcher;
use crate::config::ClientConfig;
use crate::connection::{Connection, WeakConnection};
use crate::error::{ClientError, Result};
use crate::lease::LeaseTable;

/// Tables shared by every connection a client opens. Breaks can arrive on
/// any channel of a session, so routing is not per connection.
#[derive(Debug, Clone)]
pub struct ClientScope {
    /// Break waiters and queued notifications.
    pub breaks: Arc<BreakDispatcher>,
    /// Leases held by any handle of this client.
    pub leases: Arc<LeaseTable>,
}

impl Default for ClientScope {
    fn default() -> Self {
        let breaks = Arc::new(BreakDispatcher::new());
        Self {
            leases: Arc::new(LeaseTable::new(breaks.clone())),
            breaks,
        }
    }
}

/// An SMB client: configuration, identity and the connections it opened.
#[derive(Debug)]
pub struct Client {
    config: ClientConfig,
    scope: ClientScope,
    /// Weak so that dropping the last user handle still closes a connection.
    connections: Mutex<Vec<WeakConnection>>,
}

impl Client {
    /// A client with `config`; a client GUID is generated when none is set.
    pub fn new(mut config: ClientConfig) -> Self {
        config.client_guid.get_or_insert_with(Uuid::new_v4);
        Self {
            config,
            scope: ClientScope::default(),
            connections: Mutex::new(Vec::new()),
        }
    }

    /// Configuration in effect.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Identifier sent at negotiation.
    pub fn client_guid(&self) -> Uuid {
        self.config.client_guid.unwrap_or_default()
    }

    /// Client-scoped break and lease tables.
    pub fn scope(&self) -> &ClientScope {
        &self.scope
    }

    /// Opens a TCP connection to `addr` and negotiates on it.
    pub async fn connect(&self, addr: &str) -> Result<Connection> {
        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let stream = tokio::time::timeout(timeout, tokio::net::TcpStream::connect(addr))
            .await
            .map_err(|_| ClientError::ConnectTimeout {
                addr: addr.to_string(),
                timeout_ms: self.config.connect_timeout_ms,
            })??;
        stream.set_nodelay(true)?;
        debug!(addr, "TCP connected");
        self.establish(stream, addr).await
    }

    /// Negotiates over an already connected stream.
    pub async fn establish<S>(&self, stream: S, peer: &str) -> Result<Connection>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let connection = self.attach(stream, peer);
        if let Err(error) = connection.negotiate().await {
            connection.close();
            return Err(error);
        }
        Ok(connection)
    }

    /// Wraps a stream in a connection sharing this client's tables, without
    /// negotiating.
    pub fn attach<S>(&self, stream: S, peer: &str) -> Connection
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let connection = Connection::new(stream, peer, self.config.clone(), self.scope.clone());
        let mut connections = self.connections.lock();
        connections.retain(|c| c.upgrade().is_some_and(|c| !c.is_closed()));
        connections.push(connection.downgrade());
        connection
    }

    /// Connections that are still open.
    pub fn connections(&self) -> Vec<Connection> {
        self.connections
            .lock()
            .iter()
            .filter_map(WeakConnection::upgrade)
            .filter(|c| !c.is_closed())
            .collect()
    }

    /// Closes every connection.
    pub fn close(&self) {
        let connections: Vec<Connection> =
            self.connections.lock().drain(..).filter_map(|c| c.upgrade()).collect();
        for connection in connections {
            connection.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_generates_client_guid() {
        let client = Client::new(ClientConfig::default());
        assert_ne!(client.client_guid(), Uuid::nil());
    }

    #[test]
    fn test_configured_guid_is_kept() {
        let guid = Uuid::new_v4();
        let client = Client::new(ClientConfig {
            client_guid: Some(guid),
            ..Default::default()
        });
        assert_eq!(client.client_guid(), guid);
    }

    #[tokio::test]
    async fn test_connections_share_scope() {
        let client = Client::new(ClientConfig::default());
        let (a, _sa) = tokio::io::duplex(1024);
        let (b, _sb) = tokio::io::duplex(1024);
        let first = client.attach(a, "a");
        let second = client.attach(b, "b");
        assert!(Arc::ptr_eq(&first.scope().breaks, &second.scope().breaks));
        assert_eq!(first.client_guid(), second.client_guid());
        assert_eq!(client.connections().len(), 2);
        client.close();
        assert!(first.is_closed() && second.is_closed());
    }

    #[tokio::test]
    async fn test_client_does_not_keep_dropped_connections_open() {
        let client = Client::new(ClientConfig::default());
        let (a, _sa) = tokio::io::duplex(1024);
        let kept = client.attach(a, "a");
        let (b, _sb) = tokio::io::duplex(1024);
        drop(client.attach(b, "b"));
        let open = client.connections();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id(), kept.id());
    }
}
