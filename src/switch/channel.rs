//! Virtual channels between a client and a worker connection.
//!
//! A channel is created lazily on the first forwarded call between a
//! specific pair and lives until either endpoint disconnects. It tracks the
//! ids of in-flight requests together with the direction they flowed, which
//! drives refcount bookkeeping and disconnect cleanup.

use std::collections::HashMap;

use serde_json::Value;
use uuid::Uuid;

use super::registry::ConnId;

/// Request flowed client to worker; the response travels the other way.
pub(crate) const DIR_TO_WORKER: i8 = 1;
/// Request flowed worker to client.
pub(crate) const DIR_TO_CLIENT: i8 = -1;

/// An in-flight request on a channel.
pub(crate) struct PendingReq {
    pub id: Value,
    pub direction: i8,
}

pub(crate) struct Channel {
    pub vci: String,
    pub client: ConnId,
    pub worker: ConnId,
    /// Outstanding requests keyed by the JSON text of their id, which is
    /// injective across string and number ids.
    pub reqs: HashMap<String, PendingReq>,
}

impl Channel {
    pub fn new(client: ConnId, worker: ConnId) -> Self {
        Self {
            vci: Uuid::now_v7().to_string(),
            client,
            worker,
            reqs: HashMap::new(),
        }
    }

    pub fn is_endpoint(&self, conn: ConnId) -> bool {
        conn == self.client || conn == self.worker
    }

    pub fn other_end(&self, conn: ConnId) -> Option<ConnId> {
        if conn == self.client {
            Some(self.worker)
        } else if conn == self.worker {
            Some(self.client)
        } else {
            None
        }
    }

    /// Direction of a request sent by `sender`.
    pub fn direction_from(&self, sender: ConnId) -> Option<i8> {
        if sender == self.client {
            Some(DIR_TO_WORKER)
        } else if sender == self.worker {
            Some(DIR_TO_CLIENT)
        } else {
            None
        }
    }

    /// The endpoint a request with the given direction targets, i.e. the
    /// side that owes the response.
    pub fn responder(&self, direction: i8) -> ConnId {
        if direction == DIR_TO_WORKER {
            self.worker
        } else {
            self.client
        }
    }

    pub fn record(&mut self, id: &Value, direction: i8) {
        self.reqs.insert(
            id_key(id),
            PendingReq {
                id: id.clone(),
                direction,
            },
        );
    }

    /// Resolve an outstanding request by the response's id, but only if
    /// `sender` is the side that owed the response.
    pub fn resolve_from(&mut self, sender: ConnId, id: &Value) -> Option<PendingReq> {
        let key = id_key(id);
        let pending = self.reqs.get(&key)?;
        if self.responder(pending.direction) != sender {
            return None;
        }
        self.reqs.remove(&key)
    }
}

pub(crate) fn id_key(id: &Value) -> String {
    id.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn endpoints_and_directions() {
        let chan = Channel::new(1, 2);
        assert!(chan.is_endpoint(1));
        assert!(chan.is_endpoint(2));
        assert!(!chan.is_endpoint(3));
        assert_eq!(chan.other_end(1), Some(2));
        assert_eq!(chan.other_end(2), Some(1));
        assert_eq!(chan.other_end(3), None);
        assert_eq!(chan.direction_from(1), Some(DIR_TO_WORKER));
        assert_eq!(chan.direction_from(2), Some(DIR_TO_CLIENT));
        assert_eq!(chan.responder(DIR_TO_WORKER), 2);
        assert_eq!(chan.responder(DIR_TO_CLIENT), 1);
    }

    #[test]
    fn resolve_requires_matching_sender() {
        let mut chan = Channel::new(1, 2);
        chan.record(&json!(7), DIR_TO_WORKER);

        // the client cannot answer its own request
        assert!(chan.resolve_from(1, &json!(7)).is_none());
        assert_eq!(chan.reqs.len(), 1);

        let pending = chan.resolve_from(2, &json!(7)).expect("worker answers");
        assert_eq!(pending.direction, DIR_TO_WORKER);
        assert!(chan.reqs.is_empty());
    }

    #[test]
    fn string_and_number_ids_do_not_collide() {
        let mut chan = Channel::new(1, 2);
        chan.record(&json!(1), DIR_TO_WORKER);
        chan.record(&json!("1"), DIR_TO_CLIENT);
        assert_eq!(chan.reqs.len(), 2);
    }

    #[test]
    fn vcis_are_unique() {
        assert_ne!(Channel::new(1, 2).vci, Channel::new(1, 2).vci);
    }
}
