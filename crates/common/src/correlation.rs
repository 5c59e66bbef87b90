//! Request/response correlation.
//!
//! Every outbound request that expects a reply registers a pending entry
//! keyed either by its message id (default) or by an expected response type
//! (custom-event mode, used where the responder cannot echo the original id).
//! Keys are unique across the whole process, never per connection, because a
//! reply may arrive on a different connection object than the one the nested
//! wait was issued on. Type-keyed entries accept replies only from the
//! connection they were registered against, so a pending `task.result` wait
//! never captures an unrelated peer's result. Entries die on reply, timeout,
//! or owning-connection close, whichever comes first.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::debug;

use crate::envelope::Envelope;
use crate::error::{Result, SwitchboardError};

/// How a pending wait recognizes its reply.
#[derive(Debug, Clone)]
pub enum MatchBy {
    /// Reply's `requestId` equals the sent message id (default)
    RequestId,
    /// Reply's `type` equals `kind`; with `any_id` the `requestId` is
    /// ignored, otherwise it must still echo the sent id
    Kind { kind: String, any_id: bool },
}

/// Key under which a pending entry is stored. At most one live entry may
/// exist per key; a second registration fails fast.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CorrelationKey {
    Id(String),
    Kind(String),
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "id:{id}"),
            Self::Kind(kind) => write!(f, "type:{kind}"),
        }
    }
}

struct Pending {
    tx: oneshot::Sender<Envelope>,
    /// Type of the original outbound message, for timeout errors
    kind: String,
    /// Connection that owns this entry; swept on close
    owner: String,
    /// For `Kind` entries without any-id: the request id the reply must echo
    require_id: Option<String>,
}

/// Process-wide map of pending correlations.
#[derive(Default)]
pub struct Correlations {
    inner: Mutex<HashMap<CorrelationKey, Pending>>,
}

impl fmt::Debug for Correlations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Correlations")
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl Correlations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive the correlation key for a request about to be sent.
    pub fn key_for(envelope: &Envelope, match_by: &MatchBy) -> CorrelationKey {
        match match_by {
            MatchBy::RequestId => CorrelationKey::Id(envelope.id.clone()),
            MatchBy::Kind { kind, .. } => CorrelationKey::Kind(kind.clone()),
        }
    }

    /// Register a pending entry. Fails fast when the key is already live.
    pub fn register(
        &self,
        envelope: &Envelope,
        match_by: &MatchBy,
        owner: &str,
    ) -> Result<oneshot::Receiver<Envelope>> {
        let key = Self::key_for(envelope, match_by);
        let require_id = match match_by {
            MatchBy::Kind { any_id: false, .. } => Some(envelope.id.clone()),
            _ => None,
        };

        let mut inner = self.inner.lock().expect("correlation lock poisoned");
        if inner.contains_key(&key) {
            return Err(SwitchboardError::DuplicateCorrelation(key.to_string()));
        }

        let (tx, rx) = oneshot::channel();
        inner.insert(
            key,
            Pending {
                tx,
                kind: envelope.kind.clone(),
                owner: owner.to_string(),
                require_id,
            },
        );
        Ok(rx)
    }

    /// Offer an inbound envelope arriving on `connection_id` to the pending
    /// entries. Returns `None` when the envelope was consumed by a waiter,
    /// or gives it back otherwise. Id-keyed entries match on any connection;
    /// type-keyed entries only accept replies from their owning connection.
    pub fn resolve(&self, envelope: Envelope, connection_id: &str) -> Option<Envelope> {
        let mut inner = self.inner.lock().expect("correlation lock poisoned");

        if let Some(request_id) = envelope.request_id.clone() {
            let key = CorrelationKey::Id(request_id);
            if let Some(pending) = inner.remove(&key) {
                debug!(key = %key, kind = %envelope.kind, "correlation resolved by id");
                let _ = pending.tx.send(envelope);
                return None;
            }
        }

        let key = CorrelationKey::Kind(envelope.kind.clone());
        let matches = inner.get(&key).is_some_and(|pending| {
            pending.owner == connection_id
                && pending
                    .require_id
                    .as_ref()
                    .is_none_or(|id| envelope.request_id.as_deref() == Some(id))
        });
        if matches {
            if let Some(pending) = inner.remove(&key) {
                debug!(key = %key, "correlation resolved by type");
                let _ = pending.tx.send(envelope);
                return None;
            }
        }

        Some(envelope)
    }

    /// Drop a pending entry, e.g. after a timeout or a cancelled nested wait.
    pub fn remove(&self, key: &CorrelationKey) -> bool {
        self.inner
            .lock()
            .expect("correlation lock poisoned")
            .remove(key)
            .is_some()
    }

    /// Reject every entry owned by a closed connection. Dropping the senders
    /// fails the waiters with a connection-closed error. Returns how many
    /// entries were swept.
    pub fn sweep_connection(&self, owner: &str) -> usize {
        let mut inner = self.inner.lock().expect("correlation lock poisoned");
        let before = inner.len();
        inner.retain(|_, pending| pending.owner != owner);
        before - inner.len()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().expect("correlation lock poisoned").len()
    }

    /// Await the registered reply, enforcing the timeout contract: on expiry
    /// the entry is removed before the error is returned, so the key is
    /// immediately reusable.
    pub async fn wait(
        &self,
        key: CorrelationKey,
        kind: &str,
        rx: oneshot::Receiver<Envelope>,
        timeout: Duration,
    ) -> Result<Envelope> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(envelope)) => Ok(envelope),
            Ok(Err(_)) => Err(SwitchboardError::ConnectionClosed),
            Err(_) => {
                self.remove(&key);
                Err(SwitchboardError::Timeout {
                    kind: kind.to_string(),
                    elapsed: timeout,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Payload, PingPong};

    fn ping() -> Envelope {
        Envelope::new(&Payload::Ping(PingPong::default())).unwrap()
    }

    fn pong_for(request_id: &str) -> Envelope {
        Envelope::reply_to(request_id, &Payload::Pong(PingPong::default())).unwrap()
    }

    #[test]
    fn test_duplicate_key_fails_fast() {
        let correlations = Correlations::new();
        let request = ping();

        let _rx = correlations
            .register(&request, &MatchBy::RequestId, "conn-1")
            .unwrap();
        let second = correlations.register(&request, &MatchBy::RequestId, "conn-1");
        assert!(matches!(
            second,
            Err(SwitchboardError::DuplicateCorrelation(_))
        ));
        assert_eq!(correlations.pending_count(), 1);
    }

    #[test]
    fn test_resolve_by_request_id() {
        let correlations = Correlations::new();
        let request = ping();
        let mut rx = correlations
            .register(&request, &MatchBy::RequestId, "conn-1")
            .unwrap();

        let consumed = correlations.resolve(pong_for(&request.id), "conn-1");
        assert!(consumed.is_none());
        assert_eq!(correlations.pending_count(), 0);
        assert_eq!(rx.try_recv().unwrap().kind, "pong");
    }

    #[test]
    fn test_unrelated_envelope_is_returned() {
        let correlations = Correlations::new();
        let request = ping();
        let _rx = correlations
            .register(&request, &MatchBy::RequestId, "conn-1")
            .unwrap();

        let stray = pong_for("someone-else");
        let back = correlations.resolve(stray, "conn-1").expect("not consumed");
        assert_eq!(back.kind, "pong");
        assert_eq!(correlations.pending_count(), 1);
    }

    #[test]
    fn test_resolve_by_kind_any_id() {
        let correlations = Correlations::new();
        let request = ping();
        let mut rx = correlations
            .register(
                &request,
                &MatchBy::Kind {
                    kind: "task.result".into(),
                    any_id: true,
                },
                "conn-1",
            )
            .unwrap();

        // Reply tagged with the responder's own id, not ours.
        let mut reply = Envelope::new(&Payload::TaskResult(crate::envelope::TaskResultContent {
            task_id: Some("task_x".into()),
            result: serde_json::json!({"ok": true}),
        }))
        .unwrap();
        reply.request_id = Some("task_x".into());

        assert!(correlations.resolve(reply, "conn-1").is_none());
        assert_eq!(rx.try_recv().unwrap().kind, "task.result");
    }

    #[test]
    fn test_kind_entry_only_accepts_owning_connection() {
        let correlations = Correlations::new();
        let request = ping();
        let mut rx = correlations
            .register(
                &request,
                &MatchBy::Kind {
                    kind: "task.result".into(),
                    any_id: true,
                },
                "conn-1",
            )
            .unwrap();

        let reply = Envelope::new(&Payload::TaskResult(crate::envelope::TaskResultContent {
            task_id: Some("task_other".into()),
            result: serde_json::json!({"ok": true}),
        }))
        .unwrap();

        // Same type arriving on another connection stays unconsumed.
        let back = correlations
            .resolve(reply.clone(), "conn-2")
            .expect("foreign connection must not satisfy the wait");
        assert_eq!(back.kind, "task.result");
        assert_eq!(correlations.pending_count(), 1);

        // The owning connection's reply is consumed.
        assert!(correlations.resolve(reply, "conn-1").is_none());
        assert_eq!(rx.try_recv().unwrap().kind, "task.result");
    }

    #[test]
    fn test_resolve_by_kind_requires_id_when_not_any() {
        let correlations = Correlations::new();
        let request = ping();
        let _rx = correlations
            .register(
                &request,
                &MatchBy::Kind {
                    kind: "pong".into(),
                    any_id: false,
                },
                "conn-1",
            )
            .unwrap();

        // Wrong request id: stays pending.
        let back = correlations.resolve(pong_for("other"), "conn-1");
        assert!(back.is_some());
        assert_eq!(correlations.pending_count(), 1);

        // Matching id: consumed.
        assert!(correlations
            .resolve(pong_for(&request.id), "conn-1")
            .is_none());
        assert_eq!(correlations.pending_count(), 0);
    }

    #[test]
    fn test_debug_reports_pending_count() {
        let correlations = Correlations::new();
        let request = ping();
        let _rx = correlations
            .register(&request, &MatchBy::RequestId, "conn-1")
            .unwrap();

        assert_eq!(format!("{correlations:?}"), "Correlations { pending: 1 }");
    }

    #[test]
    fn test_connection_close_sweeps_all_owned_entries() {
        let correlations = Correlations::new();
        let mut receivers = Vec::new();
        for _ in 0..3 {
            let request = ping();
            receivers.push(
                correlations
                    .register(&request, &MatchBy::RequestId, "conn-1")
                    .unwrap(),
            );
        }
        let other = ping();
        let _kept = correlations
            .register(&other, &MatchBy::RequestId, "conn-2")
            .unwrap();

        assert_eq!(correlations.sweep_connection("conn-1"), 3);
        assert_eq!(correlations.pending_count(), 1);
        for mut rx in receivers {
            assert!(rx.try_recv().is_err());
        }
    }

    #[tokio::test]
    async fn test_timeout_removes_entry_and_frees_key() {
        let correlations = Correlations::new();
        let request = ping();
        let rx = correlations
            .register(&request, &MatchBy::RequestId, "conn-1")
            .unwrap();
        let key = Correlations::key_for(&request, &MatchBy::RequestId);

        let err = correlations
            .wait(key, &request.kind, rx, Duration::from_millis(20))
            .await
            .unwrap_err();
        match err {
            SwitchboardError::Timeout { kind, elapsed } => {
                assert_eq!(kind, "ping");
                assert_eq!(elapsed, Duration::from_millis(20));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert_eq!(correlations.pending_count(), 0);

        // Same id is registerable again after the timeout cleanup.
        let _rx = correlations
            .register(&request, &MatchBy::RequestId, "conn-1")
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_fails_with_connection_closed_after_sweep() {
        let correlations = Correlations::new();
        let request = ping();
        let rx = correlations
            .register(&request, &MatchBy::RequestId, "conn-1")
            .unwrap();
        let key = Correlations::key_for(&request, &MatchBy::RequestId);

        correlations.sweep_connection("conn-1");
        let err = correlations
            .wait(key, &request.kind, rx, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SwitchboardError::ConnectionClosed));
    }
}
