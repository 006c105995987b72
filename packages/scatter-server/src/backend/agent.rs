//! Agent backend: chunk operations over the relay.
//!
//! Commands travel as envelopes into the device's `inbox` session, which the
//! agent long-polls via `/relay/recv`. Replies come back on server-side
//! sessions: a STORE is confirmed on `ack-<chunk_id>`, a RETRIEVE delivers
//! bytes on `chunk-<chunk_id>`. DELETE is fire-and-forget.

use async_trait::async_trait;

use scatter_core::envelope::RelayMessage;
use scatter_core::{Error, Result};

use super::Backend;
use crate::relay::{Relay, SendOutcome};

/// Session the agent polls for commands.
const INBOX_SESSION: &str = "inbox";

/// Recipient name for server-side reply sessions.
const SERVER: &str = "server";

pub struct AgentBackend {
    relay: Relay,
    device_id: String,
}

impl AgentBackend {
    pub fn new(relay: Relay, device_id: &str) -> Self {
        Self {
            relay,
            device_id: device_id.to_string(),
        }
    }

    async fn enqueue(&self, msg: &RelayMessage) -> Result<()> {
        match self
            .relay
            .send(&self.device_id, INBOX_SESSION, msg.to_bytes())
            .await
        {
            SendOutcome::Accepted => Ok(()),
            SendOutcome::Dropped => Err(Error::Relay(format!(
                "inbox full for device {}",
                self.device_id
            ))),
        }
    }
}

#[async_trait]
impl Backend for AgentBackend {
    async fn put(&self, chunk_id: &str, data: Vec<u8>) -> Result<()> {
        self.enqueue(&RelayMessage::store(data)).await?;

        // The agent must confirm the store before the placement counts.
        let ack_session = format!("ack-{chunk_id}");
        let deadline = self.relay.config().ack_timeout;
        match self.relay.wait(SERVER, &ack_session, deadline).await {
            Some(_) => Ok(()),
            None => Err(Error::Timeout(format!(
                "no store ack for chunk {chunk_id} from device {}",
                self.device_id
            ))),
        }
    }

    async fn get(&self, chunk_id: &str) -> Result<Vec<u8>> {
        self.enqueue(&RelayMessage::retrieve(chunk_id)).await?;

        let chunk_session = format!("chunk-{chunk_id}");
        let deadline = self.relay.config().retrieve_timeout;
        self.relay
            .wait(SERVER, &chunk_session, deadline)
            .await
            .ok_or_else(|| {
                Error::Timeout(format!(
                    "chunk {chunk_id} not returned by device {}",
                    self.device_id
                ))
            })
    }

    async fn remove(&self, chunk_id: &str) -> Result<()> {
        // Best effort; a dropped delete is recovered by the deletion ledger.
        let _ = self
            .relay
            .send(
                &self.device_id,
                INBOX_SESSION,
                RelayMessage::delete(chunk_id).to_bytes(),
            )
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::RelayConfig;
    use scatter_core::envelope::RelayCommand;
    use std::time::Duration;

    fn fast_relay() -> Relay {
        Relay::new(RelayConfig {
            capacity: 10,
            send_timeout: Duration::from_millis(50),
            recv_timeout: Duration::from_millis(100),
            sweep_after: Duration::from_millis(500),
            ack_timeout: Duration::from_millis(200),
            retrieve_timeout: Duration::from_millis(200),
        })
    }

    /// Drives the agent side of one inbox command in the background.
    async fn agent_answers(relay: Relay, device_id: &str, reply_session: Option<String>, reply: Vec<u8>) {
        let device_id = device_id.to_string();
        tokio::spawn(async move {
            let raw = relay.recv(&device_id, "inbox").await.expect("inbox command");
            let msg = RelayMessage::from_bytes(&raw).expect("valid envelope");
            assert!(matches!(
                msg.command,
                RelayCommand::Store | RelayCommand::Retrieve | RelayCommand::Delete
            ));
            if let Some(session) = reply_session {
                relay.send("server", &session, reply).await;
            }
        });
        // Give the poller time to park on the inbox.
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn test_put_waits_for_ack() {
        let relay = fast_relay();
        let data = b"chunk bytes".to_vec();
        let chunk_id = scatter_core::chunking::chunk_id(&data);

        agent_answers(
            relay.clone(),
            "dev-1",
            Some(format!("ack-{chunk_id}")),
            b"ok".to_vec(),
        )
        .await;

        let backend = AgentBackend::new(relay, "dev-1");
        backend.put(&chunk_id, data).await.unwrap();
    }

    #[tokio::test]
    async fn test_put_full_inbox_is_candidate_failure() {
        let relay = fast_relay();
        let backend = AgentBackend::new(relay.clone(), "dev-silent");

        // Fill the inbox so the enqueue itself drops.
        for _ in 0..10 {
            relay.send("dev-silent", "inbox", vec![0]).await;
        }
        let err = backend.put("cafe", vec![1, 2, 3]).await.unwrap_err();
        assert!(matches!(err, Error::Relay(_)));
        assert!(err.is_candidate_failure());
    }

    #[tokio::test]
    async fn test_get_round_trip() {
        let relay = fast_relay();
        agent_answers(
            relay.clone(),
            "dev-1",
            Some("chunk-cafe".to_string()),
            b"the bytes".to_vec(),
        )
        .await;

        let backend = AgentBackend::new(relay, "dev-1");
        let got = backend.get("cafe").await.unwrap();
        assert_eq!(got, b"the bytes".to_vec());
    }

    #[tokio::test]
    async fn test_remove_is_fire_and_forget() {
        let relay = fast_relay();
        let backend = AgentBackend::new(relay.clone(), "dev-1");
        // No agent listening at all: remove still succeeds.
        backend.remove("cafe").await.unwrap();
        // The envelope is sitting in the inbox for whenever the agent polls.
        let raw = relay.recv("dev-1", "inbox").await.unwrap();
        let msg = RelayMessage::from_bytes(&raw).unwrap();
        assert_eq!(msg.command, RelayCommand::Delete);
        assert_eq!(msg.payload, b"cafe".to_vec());
    }
}
