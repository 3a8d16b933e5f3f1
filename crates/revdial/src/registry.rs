//! Process-wide lookup of live dialers by id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::conn::BoxedConn;
use crate::dialer::Dialer;
use crate::error::RevdialError;

/// Live [`Dialer`]s indexed by their generated id.
///
/// Dialers add themselves on creation and remove themselves on close; the
/// pick-up HTTP handler uses [`pickup`](Self::pickup) to route an incoming
/// connection to the dialer that asked for it.
#[derive(Default)]
pub struct DialerRegistry {
    dialers: Mutex<HashMap<String, Arc<Dialer>>>,
}

impl DialerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn register(&self, dialer: Arc<Dialer>) {
        self.lock().insert(dialer.id().to_string(), dialer);
    }

    pub(crate) fn remove(&self, id: &str) {
        self.lock().remove(id);
    }

    pub fn get(&self, id: &str) -> Option<Arc<Dialer>> {
        self.lock().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hands a freshly upgraded pick-up connection to the dialer `dialer_id`.
    pub async fn pickup(
        &self,
        dialer_id: &str,
        uuid: &str,
        conn: BoxedConn,
    ) -> Result<(), RevdialError> {
        let Some(dialer) = self.get(dialer_id) else {
            debug!(dialer = dialer_id, "pick-up for unknown dialer");
            return Err(RevdialError::UnknownDialer(dialer_id.to_string()));
        };
        dialer.deliver(uuid.to_string(), conn).await
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Dialer>>> {
        self.dialers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// The `dialer=<id>&uuid=<req>` query of a pick-up request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PickupQuery {
    pub dialer: String,
    pub uuid: String,
}

impl PickupQuery {
    pub fn parse(query: &str) -> Result<Self, RevdialError> {
        let query = query.trim_start_matches('?');
        let mut dialer = None;
        let mut uuid = None;
        for pair in query.split('&') {
            match pair.split_once('=') {
                Some(("dialer", v)) if !v.is_empty() => dialer = Some(v),
                Some(("uuid", v)) if !v.is_empty() => uuid = Some(v),
                _ => {}
            }
        }
        match (dialer, uuid) {
            (Some(dialer), Some(uuid)) => Ok(Self {
                dialer: dialer.to_string(),
                uuid: uuid.to_string(),
            }),
            _ => Err(RevdialError::BadPickupQuery(query.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_query_in_any_order() {
        let q = PickupQuery::parse("uuid=u-1&dialer=abc").unwrap();
        assert_eq!(q.dialer, "abc");
        assert_eq!(q.uuid, "u-1");

        let q = PickupQuery::parse("?dialer=abc&x=1&uuid=u-2").unwrap();
        assert_eq!(q.uuid, "u-2");
    }

    #[test]
    fn parse_query_rejects_missing_fields() {
        assert!(PickupQuery::parse("dialer=abc").is_err());
        assert!(PickupQuery::parse("dialer=&uuid=x").is_err());
        assert!(PickupQuery::parse("").is_err());
    }

    #[tokio::test]
    async fn pickup_for_unknown_dialer_fails() {
        let registry = DialerRegistry::new();
        let (conn, _peer) = tokio::io::duplex(64);
        let err = registry
            .pickup("nope", "u", Box::new(conn))
            .await
            .unwrap_err();
        assert!(matches!(err, RevdialError::UnknownDialer(id) if id == "nope"));
        assert!(registry.is_empty());
    }
}
