//! Per-tenant real-time broadcast hub.
//!
//! Each live dashboard connection owns a bounded `mpsc` mailbox; the hub
//! keeps the sending halves grouped by tenant behind one `RwLock`.
//! Delivery is at-most-once and best-effort: [`BroadcastHub::publish`]
//! serializes an event once and `try_send`s it to every mailbox, so one
//! slow client drops its own copy instead of stalling the publisher or
//! the other connections.
//!
//! Events published from one task to one tenant reach each connection in
//! publish order, since every mailbox is FIFO and publishing never
//! reorders sends.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::events::HubEvent;

/// Serialized frame shared by every recipient of one publish.
pub type Payload = Arc<[u8]>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HubError {
    #[error("connection {connection_id} not found for tenant {tenant_id}")]
    NotFound {
        tenant_id: String,
        connection_id: String,
    },
    #[error("mailbox full for connection {connection_id}")]
    MailboxFull { connection_id: String },
    #[error("failed to serialize event: {0}")]
    Encode(String),
}

/// Who is on the other end of a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    pub agent_id: String,
    pub agent_name: String,
    pub agent_email: Option<String>,
}

struct Connection {
    info: ConnectionInfo,
    mailbox: mpsc::Sender<Payload>,
}

/// Per-connection result counts of one publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    /// Mailbox was full; this connection missed the event.
    pub dropped: usize,
    /// Receiver already gone; waiting for unregister.
    pub closed: usize,
}

pub struct BroadcastHub {
    tenants: RwLock<HashMap<String, HashMap<String, Connection>>>,
    mailbox_capacity: usize,
}

impl BroadcastHub {
    pub fn new(mailbox_capacity: usize) -> Self {
        Self {
            tenants: RwLock::new(HashMap::new()),
            mailbox_capacity: mailbox_capacity.max(1),
        }
    }

    /// A fresh mailbox with the configured capacity.
    pub fn mailbox(&self) -> (mpsc::Sender<Payload>, mpsc::Receiver<Payload>) {
        mpsc::channel(self.mailbox_capacity)
    }

    /// Add a connection. A connection already registered under the same id
    /// is replaced and its mailbox closed.
    pub fn register(
        &self,
        tenant_id: &str,
        connection_id: &str,
        info: ConnectionInfo,
        mailbox: mpsc::Sender<Payload>,
    ) {
        let mut tenants = self.tenants.write().unwrap_or_else(PoisonError::into_inner);
        let replaced = tenants
            .entry(tenant_id.to_string())
            .or_default()
            .insert(connection_id.to_string(), Connection { info, mailbox });
        if replaced.is_some() {
            tracing::debug!(tenant = tenant_id, connection = connection_id, "replaced connection");
        }
        tracing::info!(tenant = tenant_id, connection = connection_id, "dashboard connected");
    }

    /// Remove a connection, closing its mailbox. Empty tenant sets are
    /// pruned. Returns `false` if it was not registered.
    pub fn unregister(&self, tenant_id: &str, connection_id: &str) -> bool {
        let mut tenants = self.tenants.write().unwrap_or_else(PoisonError::into_inner);
        let Some(connections) = tenants.get_mut(tenant_id) else {
            return false;
        };
        let removed = connections.remove(connection_id).is_some();
        if connections.is_empty() {
            tenants.remove(tenant_id);
        }
        if removed {
            tracing::info!(tenant = tenant_id, connection = connection_id, "dashboard disconnected");
        }
        removed
    }

    /// Serialize `event` once and fan it out to every connection of
    /// `tenant_id`. Never blocks and never fails the caller.
    pub fn publish(&self, tenant_id: &str, event: &HubEvent) -> PublishReport {
        match serde_json::to_vec(event) {
            Ok(bytes) => self.publish_payload(tenant_id, bytes.into()),
            Err(e) => {
                tracing::error!(tenant = tenant_id, event = event.type_name(), error = %e, "failed to serialize event");
                PublishReport::default()
            }
        }
    }

    /// Fan out an already-serialized payload.
    pub fn publish_payload(&self, tenant_id: &str, payload: Payload) -> PublishReport {
        let tenants = self.tenants.read().unwrap_or_else(PoisonError::into_inner);
        let mut report = PublishReport::default();
        let Some(connections) = tenants.get(tenant_id) else {
            return report;
        };

        for (connection_id, connection) in connections {
            match connection.mailbox.try_send(payload.clone()) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    report.dropped += 1;
                    tracing::warn!(
                        tenant = tenant_id,
                        connection = %connection_id,
                        "mailbox full; dropping event for this connection"
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    report.closed += 1;
                    tracing::debug!(tenant = tenant_id, connection = %connection_id, "mailbox closed");
                }
            }
        }
        report
    }

    /// Unicast to one connection.
    pub fn send_direct(
        &self,
        tenant_id: &str,
        connection_id: &str,
        payload: Payload,
    ) -> Result<(), HubError> {
        let tenants = self.tenants.read().unwrap_or_else(PoisonError::into_inner);
        let not_found = || HubError::NotFound {
            tenant_id: tenant_id.to_string(),
            connection_id: connection_id.to_string(),
        };
        let connection = tenants
            .get(tenant_id)
            .and_then(|c| c.get(connection_id))
            .ok_or_else(not_found)?;

        connection.mailbox.try_send(payload).map_err(|e| match e {
            TrySendError::Full(_) => HubError::MailboxFull {
                connection_id: connection_id.to_string(),
            },
            TrySendError::Closed(_) => not_found(),
        })
    }

    /// Serialize and unicast one event.
    pub fn send_event(
        &self,
        tenant_id: &str,
        connection_id: &str,
        event: &HubEvent,
    ) -> Result<(), HubError> {
        let bytes = serde_json::to_vec(event).map_err(|e| {
            tracing::error!(tenant = tenant_id, event = event.type_name(), error = %e, "failed to serialize event");
            HubError::Encode(e.to_string())
        })?;
        self.send_direct(tenant_id, connection_id, bytes.into())
    }

    /// Connections currently registered for a tenant, sorted by id.
    pub fn connections(&self, tenant_id: &str) -> Vec<(String, ConnectionInfo)> {
        let tenants = self.tenants.read().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<_> = tenants
            .get(tenant_id)
            .map(|c| {
                c.iter()
                    .map(|(id, conn)| (id.clone(), conn.info.clone()))
                    .collect()
            })
            .unwrap_or_default();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn tenant_count(&self) -> usize {
        self.tenants
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use replyhub_core::models::CustomerKey;

    fn event(text: &str) -> HubEvent {
        HubEvent::new(EventKind::MessageReceived {
            customer: CustomerKey::new("t1", "p1", "c1"),
            text: text.to_string(),
        })
    }

    fn decode(payload: &Payload) -> serde_json::Value {
        serde_json::from_slice(payload).unwrap()
    }

    #[test]
    fn test_full_mailbox_drops_only_that_connection() {
        let hub = BroadcastHub::new(1);
        let (tx_a, mut rx_a) = hub.mailbox();
        let (tx_b, mut rx_b) = hub.mailbox();
        hub.register("t1", "a", ConnectionInfo::default(), tx_a);
        hub.register("t1", "b", ConnectionInfo::default(), tx_b);

        // Fill B's single slot.
        hub.send_direct("t1", "b", Arc::from(&b"filler"[..])).unwrap();

        let report = hub.publish("t1", &event("hello"));
        assert_eq!(report.delivered, 1);
        assert_eq!(report.dropped, 1);

        assert_eq!(decode(&rx_a.try_recv().unwrap())["text"], "hello");
        assert_eq!(&*rx_b.try_recv().unwrap(), b"filler");
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn test_publish_is_tenant_scoped() {
        let hub = BroadcastHub::new(8);
        let (tx1, mut rx1) = hub.mailbox();
        let (tx2, mut rx2) = hub.mailbox();
        hub.register("t1", "a", ConnectionInfo::default(), tx1);
        hub.register("t2", "a", ConnectionInfo::default(), tx2);

        hub.publish("t1", &event("only t1"));
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());
        assert_eq!(hub.publish("nobody", &event("x")), PublishReport::default());
    }

    #[test]
    fn test_publish_order_preserved_per_connection() {
        let hub = BroadcastHub::new(16);
        let (tx, mut rx) = hub.mailbox();
        hub.register("t1", "a", ConnectionInfo::default(), tx);
        for i in 0..10 {
            hub.publish("t1", &event(&i.to_string()));
        }
        for i in 0..10 {
            assert_eq!(decode(&rx.try_recv().unwrap())["text"], i.to_string());
        }
    }

    #[test]
    fn test_send_direct_outcomes() {
        let hub = BroadcastHub::new(1);
        let (tx, _rx) = hub.mailbox();
        hub.register("t1", "a", ConnectionInfo::default(), tx);

        let payload: Payload = Arc::from(&b"ping"[..]);
        assert!(hub.send_direct("t1", "a", payload.clone()).is_ok());
        assert_eq!(
            hub.send_direct("t1", "a", payload.clone()),
            Err(HubError::MailboxFull {
                connection_id: "a".to_string()
            })
        );
        assert!(matches!(
            hub.send_direct("t1", "zzz", payload),
            Err(HubError::NotFound { .. })
        ));
    }

    #[test]
    fn test_send_event_delivers_one_json_frame() {
        let hub = BroadcastHub::new(4);
        let (tx, mut rx) = hub.mailbox();
        hub.register("t1", "a", ConnectionInfo::default(), tx);

        hub.send_event("t1", "a", &event("direct")).unwrap();
        let frame = rx.try_recv().unwrap();
        assert!(!frame.is_empty());
        assert_eq!(decode(&frame)["type"], "message_received");
        assert_eq!(decode(&frame)["text"], "direct");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_unregister_closes_mailbox_and_prunes_tenant() {
        let hub = BroadcastHub::new(4);
        let (tx, mut rx) = hub.mailbox();
        hub.register("t1", "a", ConnectionInfo::default(), tx);
        assert_eq!(hub.tenant_count(), 1);

        assert!(hub.unregister("t1", "a"));
        assert!(!hub.unregister("t1", "a"));
        assert_eq!(hub.tenant_count(), 0);
        // The only sender was dropped with the connection.
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn test_connections_lists_agents() {
        let hub = BroadcastHub::new(4);
        let (tx, _rx) = hub.mailbox();
        let info = ConnectionInfo {
            agent_id: "u1".to_string(),
            agent_name: "Ada".to_string(),
            agent_email: None,
        };
        hub.register("t1", "conn-1", info.clone(), tx);
        assert_eq!(hub.connections("t1"), vec![("conn-1".to_string(), info)]);
        assert!(hub.connections("t2").is_empty());
    }
}
