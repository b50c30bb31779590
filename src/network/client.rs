//! Network Client
//!
//! TCP client used by the leader to push writes to followers.

use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::{read_message, write_message};
use crate::replication::{Message, ReplicationTransport};
use crate::error::{Error, Result};

/// Network client for connecting to peer nodes
pub struct NetworkClient {
    /// Connection timeout
    connect_timeout: Duration,
    /// Request timeout
    request_timeout: Duration,
}

impl NetworkClient {
    /// Create a new network client
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            request_timeout,
        }
    }

    /// Send a message to a peer and wait for its response
    pub async fn send(&self, address: &str, message: Message) -> Result<Message> {
        let result = timeout(self.request_timeout, self.send_inner(address, message)).await;

        match result {
            Ok(inner_result) => inner_result,
            Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
        }
    }

    async fn send_inner(&self, address: &str, message: Message) -> Result<Message> {
        let stream = self.connect(address).await?;
        let (mut reader, mut writer) = stream.into_split();

        write_message(&mut writer, &message).await?;
        read_message(&mut reader).await
    }

    /// Connect to an address
    async fn connect(&self, address: &str) -> Result<TcpStream> {
        let result = timeout(self.connect_timeout, TcpStream::connect(address)).await;

        match result {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                Ok(stream)
            }
            Ok(Err(e)) => Err(Error::ConnectionFailed {
                address: address.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
        }
    }
}

#[async_trait::async_trait]
impl ReplicationTransport for NetworkClient {
    async fn replicate(&self, address: &str, message: Message) -> Result<Message> {
        self.send(address, message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::collections::BTreeMap;

    use crate::network::ReplicationServer;
    use crate::replication::{RecordLog, ReplicaApplier};
    use crate::state::ViewPublisher;

    #[tokio::test]
    async fn test_connection_failure() {
        let client = NetworkClient::new(Duration::from_millis(100), Duration::from_millis(500));

        // Port 0 can never be connected to
        let result = client
            .send(
                "127.0.0.1:0",
                Message::ReplicateAck {
                    node_id: "x".into(),
                    index: 0,
                    accepted: true,
                    reason: None,
                },
            )
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_replicate_over_tcp() {
        let publisher = ViewPublisher::new("n2".into());
        publisher.publish(
            Some("n1".into()),
            BTreeMap::from([
                ("n1".to_string(), "x".to_string()),
                ("n2".to_string(), "y".to_string()),
            ]),
        );
        let log = Arc::new(RecordLog::new());
        let applier = Arc::new(ReplicaApplier::new(
            "n2".into(),
            publisher.reader(),
            Arc::clone(&log),
        ));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let server = Arc::new(ReplicationServer::new(applier));
        let serving = Arc::clone(&server);
        let handle = tokio::spawn(async move { serving.serve(listener).await });

        let client = NetworkClient::new(Duration::from_secs(1), Duration::from_secs(2));
        let ack = client
            .replicate(
                &address,
                Message::Replicate {
                    leader_id: "n1".into(),
                    epoch: 2,
                    index: 1,
                    payload: b"{\"name\":\"linus\"}".to_vec(),
                },
            )
            .await
            .unwrap();

        assert!(matches!(ack, Message::ReplicateAck { accepted: true, index: 1, .. }));
        assert_eq!(log.records().await[0].payload, b"{\"name\":\"linus\"}");

        server.stop();
        handle.await.unwrap().unwrap();
    }
}
