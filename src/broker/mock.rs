//! Mock RESP pub/sub server for standalone benchmarking and tests.
//!
//! Implements just enough of the protocol for the benchmark: `SUBSCRIBE`,
//! `PUBLISH` and `PING`. Publishes fan out to every connection subscribed to
//! the channel; the reply is the number of receivers.

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use rand::Rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

use super::resp::{read_frame, Frame};
use crate::config::MockBrokerConfig;

type Outbox = mpsc::UnboundedSender<Bytes>;

/// Channel subscriptions shared by all connections
#[derive(Default)]
struct Registry {
    channels: DashMap<Bytes, Vec<(u64, Outbox)>>,
    next_conn: AtomicU64,
}

impl Registry {
    fn subscribe(&self, channel: Bytes, conn_id: u64, outbox: &Outbox) {
        self.channels
            .entry(channel)
            .or_default()
            .push((conn_id, outbox.clone()));
    }

    /// Fan a message out and return the number of receivers
    fn publish(&self, channel: &Bytes, payload: &Bytes) -> i64 {
        let Some(subscribers) = self.channels.get(channel) else {
            return 0;
        };

        let mut out = BytesMut::new();
        Frame::Array(vec![
            Frame::bulk("message"),
            Frame::Bulk(channel.clone()),
            Frame::Bulk(payload.clone()),
        ])
        .encode(&mut out);
        let message = out.freeze();

        subscribers
            .iter()
            .filter(|(_, tx)| tx.send(message.clone()).is_ok())
            .count() as i64
    }

    fn remove_connection(&self, conn_id: u64) {
        for mut entry in self.channels.iter_mut() {
            entry.value_mut().retain(|(id, _)| *id != conn_id);
        }
        self.channels.retain(|_, subs| !subs.is_empty());
    }
}

/// Mock broker server
pub struct MockBroker {
    config: MockBrokerConfig,
    shutdown_tx: Option<watch::Sender<bool>>,
    registry: Arc<Registry>,
    port: u16,
}

impl MockBroker {
    /// Create a new mock broker with the given configuration
    pub fn new(config: MockBrokerConfig) -> Self {
        Self {
            config,
            shutdown_tx: None,
            registry: Arc::new(Registry::default()),
            port: 0,
        }
    }

    /// Start listening and return the actual port
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let addr = format!("127.0.0.1:{}", self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();
        self.port = port;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown_tx = Some(shutdown_tx);

        let registry = self.registry.clone();
        let error_rate = self.config.error_rate;

        tokio::spawn(async move {
            let mut shutdown = shutdown_rx.clone();
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let conn_id = registry.next_conn.fetch_add(1, Ordering::Relaxed);
                            tracing::trace!("Mock broker accepted connection {} from {}", conn_id, peer);
                            tokio::spawn(serve_connection(
                                stream,
                                conn_id,
                                registry.clone(),
                                error_rate,
                                shutdown_rx.clone(),
                            ));
                        }
                        Err(e) => {
                            tracing::warn!("Mock broker accept failed: {}", e);
                        }
                    },
                }
            }
            tracing::debug!("Mock broker stopped accepting connections");
        });

        tracing::info!("Mock broker listening on 127.0.0.1:{}", port);
        Ok(port)
    }

    /// Get the server's port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Get the server's address
    pub fn addr(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    /// Number of live subscriptions on `channel`
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.registry
            .channels
            .get(channel.as_bytes())
            .map(|subs| subs.len())
            .unwrap_or(0)
    }

    /// Stop the server and close every connection
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
    }
}

impl Drop for MockBroker {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn serve_connection(
    stream: TcpStream,
    conn_id: u64,
    registry: Arc<Registry>,
    error_rate: f64,
    mut shutdown: watch::Receiver<bool>,
) {
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();

    // Replies and fan-out share one ordered outbox per connection
    let (outbox, mut outbox_rx) = mpsc::unbounded_channel::<Bytes>();
    tokio::spawn(async move {
        while let Some(chunk) = outbox_rx.recv().await {
            if writer.write_all(&chunk).await.is_err() {
                break;
            }
        }
    });

    let mut buf = BytesMut::with_capacity(4096);
    let mut subscribed: HashSet<Bytes> = HashSet::new();

    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => break,
            frame = read_frame(&mut reader, &mut buf) => frame,
        };

        let frame = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("Mock broker connection {} closed: {}", conn_id, e);
                break;
            }
        };

        let mut out = BytesMut::new();
        for reply in execute(&registry, conn_id, frame, &outbox, &mut subscribed, error_rate) {
            reply.encode(&mut out);
        }
        if outbox.send(out.freeze()).is_err() {
            break;
        }
    }

    registry.remove_connection(conn_id);
}

/// Run one client command and return the direct replies
fn execute(
    registry: &Registry,
    conn_id: u64,
    frame: Frame,
    outbox: &Outbox,
    subscribed: &mut HashSet<Bytes>,
    error_rate: f64,
) -> Vec<Frame> {
    let args = match command_args(frame) {
        Some(args) if !args.is_empty() => args,
        _ => {
            return vec![Frame::Error(
                "ERR Protocol error: expected array of bulk strings".to_string(),
            )]
        }
    };

    let name = String::from_utf8_lossy(&args[0]).to_ascii_uppercase();
    match name.as_str() {
        "SUBSCRIBE" if args.len() >= 2 => args[1..]
            .iter()
            .map(|channel| {
                if subscribed.insert(channel.clone()) {
                    registry.subscribe(channel.clone(), conn_id, outbox);
                }
                Frame::Array(vec![
                    Frame::bulk("subscribe"),
                    Frame::Bulk(channel.clone()),
                    Frame::Integer(subscribed.len() as i64),
                ])
            })
            .collect(),
        "PUBLISH" if args.len() == 3 => {
            if error_rate > 0.0 && rand::thread_rng().gen::<f64>() < error_rate {
                return vec![Frame::Error("ERR simulated publish failure".to_string())];
            }
            vec![Frame::Integer(registry.publish(&args[1], &args[2]))]
        }
        "PING" => vec![Frame::Simple("PONG".to_string())],
        "SUBSCRIBE" | "PUBLISH" => vec![Frame::Error(format!(
            "ERR wrong number of arguments for '{}' command",
            name.to_lowercase()
        ))],
        _ => vec![Frame::Error(format!("ERR unknown command '{}'", name))],
    }
}

fn command_args(frame: Frame) -> Option<Vec<Bytes>> {
    match frame {
        Frame::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Frame::Bulk(b) => Some(b),
                Frame::Simple(s) => Some(Bytes::from(s)),
                _ => None,
            })
            .collect(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::resp::encode_command;
    use std::time::Duration;

    async fn send(stream: &mut TcpStream, args: &[&[u8]]) {
        let mut out = BytesMut::new();
        encode_command(args, &mut out);
        stream.write_all(&out).await.unwrap();
    }

    async fn recv(stream: &mut TcpStream, buf: &mut BytesMut) -> Frame {
        tokio::time::timeout(Duration::from_secs(2), read_frame(stream, buf))
            .await
            .expect("timed out waiting for frame")
            .unwrap()
            .expect("connection closed")
    }

    async fn start(error_rate: f64) -> MockBroker {
        let mut broker = MockBroker::new(MockBrokerConfig {
            port: 0,
            error_rate,
        });
        broker.start().await.unwrap();
        broker
    }

    #[tokio::test]
    async fn test_mock_broker_starts() {
        let broker = start(0.0).await;
        assert!(broker.port() > 0);

        let mut client = TcpStream::connect(broker.addr()).await.unwrap();
        let mut buf = BytesMut::new();
        send(&mut client, &[b"PING"]).await;
        assert_eq!(recv(&mut client, &mut buf).await, Frame::Simple("PONG".into()));
    }

    #[tokio::test]
    async fn test_publish_fans_out_to_subscribers() {
        let broker = start(0.0).await;
        let mut subs = Vec::new();
        for _ in 0..2 {
            let mut sub = TcpStream::connect(broker.addr()).await.unwrap();
            let mut buf = BytesMut::new();
            send(&mut sub, &[b"SUBSCRIBE", b"eventName"]).await;
            let ack = recv(&mut sub, &mut buf).await;
            assert_eq!(
                ack,
                Frame::Array(vec![
                    Frame::bulk("subscribe"),
                    Frame::bulk("eventName"),
                    Frame::Integer(1),
                ])
            );
            subs.push((sub, buf));
        }
        assert_eq!(broker.subscriber_count("eventName"), 2);

        let mut publisher = TcpStream::connect(broker.addr()).await.unwrap();
        let mut pub_buf = BytesMut::new();
        send(&mut publisher, &[b"PUBLISH", b"eventName", b"a"]).await;
        assert_eq!(recv(&mut publisher, &mut pub_buf).await, Frame::Integer(2));

        for (sub, buf) in subs.iter_mut() {
            let msg = recv(sub, buf).await;
            assert_eq!(
                msg,
                Frame::Array(vec![
                    Frame::bulk("message"),
                    Frame::bulk("eventName"),
                    Frame::bulk("a"),
                ])
            );
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let broker = start(0.0).await;
        let mut client = TcpStream::connect(broker.addr()).await.unwrap();
        let mut buf = BytesMut::new();
        send(&mut client, &[b"PUBLISH", b"nobody", b"a"]).await;
        assert_eq!(recv(&mut client, &mut buf).await, Frame::Integer(0));
    }

    #[tokio::test]
    async fn test_duplicate_subscribe_counts_once() {
        let broker = start(0.0).await;
        let mut client = TcpStream::connect(broker.addr()).await.unwrap();
        let mut buf = BytesMut::new();
        send(&mut client, &[b"SUBSCRIBE", b"ch"]).await;
        let _ = recv(&mut client, &mut buf).await;
        send(&mut client, &[b"SUBSCRIBE", b"ch"]).await;
        let _ = recv(&mut client, &mut buf).await;
        assert_eq!(broker.subscriber_count("ch"), 1);
    }

    #[tokio::test]
    async fn test_disconnect_removes_subscription() {
        let broker = start(0.0).await;
        let mut sub = TcpStream::connect(broker.addr()).await.unwrap();
        let mut buf = BytesMut::new();
        send(&mut sub, &[b"SUBSCRIBE", b"ch"]).await;
        let _ = recv(&mut sub, &mut buf).await;
        assert_eq!(broker.subscriber_count("ch"), 1);

        drop(sub);
        for _ in 0..50 {
            if broker.subscriber_count("ch") == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("subscription was not removed after disconnect");
    }

    #[tokio::test]
    async fn test_simulated_publish_errors() {
        let broker = start(1.0).await;
        let mut client = TcpStream::connect(broker.addr()).await.unwrap();
        let mut buf = BytesMut::new();
        send(&mut client, &[b"PUBLISH", b"ch", b"a"]).await;
        assert_eq!(
            recv(&mut client, &mut buf).await,
            Frame::Error("ERR simulated publish failure".into())
        );
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_commands() {
        let broker = start(0.0).await;
        let mut client = TcpStream::connect(broker.addr()).await.unwrap();
        let mut buf = BytesMut::new();

        send(&mut client, &[b"FLUSHALL"]).await;
        assert_eq!(
            recv(&mut client, &mut buf).await,
            Frame::Error("ERR unknown command 'FLUSHALL'".into())
        );

        send(&mut client, &[b"PUBLISH", b"ch"]).await;
        assert_eq!(
            recv(&mut client, &mut buf).await,
            Frame::Error("ERR wrong number of arguments for 'publish' command".into())
        );
    }

    #[tokio::test]
    async fn test_stop_closes_connections() {
        let mut broker = start(0.0).await;
        let mut client = TcpStream::connect(broker.addr()).await.unwrap();
        let mut buf = BytesMut::new();
        send(&mut client, &[b"SUBSCRIBE", b"ch"]).await;
        let _ = recv(&mut client, &mut buf).await;

        broker.stop();
        let closed = tokio::time::timeout(Duration::from_secs(2), read_frame(&mut client, &mut buf))
            .await
            .expect("connection was not closed");
        assert!(matches!(closed, Ok(None) | Err(_)));
    }

    #[tokio::test]
    async fn test_oversized_request_closes_connection() {
        let broker = start(0.0).await;
        let mut client = TcpStream::connect(broker.addr()).await.unwrap();
        client.write_all(b"*1\r\n$999999999999\r\n").await.unwrap();

        let mut buf = BytesMut::new();
        let closed = tokio::time::timeout(Duration::from_secs(2), read_frame(&mut client, &mut buf))
            .await
            .expect("connection was not closed");
        assert!(matches!(closed, Ok(None) | Err(_)));
    }
}
