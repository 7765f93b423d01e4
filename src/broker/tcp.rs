//! TCP client side of the broker collaborator.
//!
//! Each connection runs in its own task and only talks to the driver through
//! the event channel, so driver state stays on the event loop.

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use super::resp::{encode_command, read_frame, Frame};
use super::{Broker, BrokerEvent, Role};
use crate::error::{BenchError, Result};

type EventSender = mpsc::UnboundedSender<BrokerEvent<PublisherHandle>>;

/// Handle to an established publisher connection
#[derive(Debug, Clone)]
pub struct PublisherHandle {
    id: usize,
    commands: mpsc::UnboundedSender<PublishRequest>,
}

#[derive(Debug)]
struct PublishRequest {
    burst: u64,
    frame: Bytes,
}

/// Broker client that speaks RESP over TCP.
///
/// Connection tasks are owned by the client: dropping it (or calling
/// [`TcpBroker::shutdown`]) aborts them and closes their sockets.
pub struct TcpBroker {
    addr: String,
    connect_timeout: Duration,
    events: EventSender,
    tasks: JoinSet<()>,
}

impl TcpBroker {
    /// Create a client for `addr` ("host:port") reporting into `events`
    pub fn new(addr: impl Into<String>, connect_timeout: Duration, events: EventSender) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout,
            events,
            tasks: JoinSet::new(),
        }
    }

    /// Server address this client connects to
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Abort every connection task
    pub fn shutdown(&mut self) {
        if !self.tasks.is_empty() {
            tracing::debug!("Closing {} client connections", self.tasks.len());
        }
        self.tasks.abort_all();
    }
}

impl Broker for TcpBroker {
    type Publisher = PublisherHandle;

    fn open_subscriber(&mut self, id: usize, channel: &str) {
        let addr = self.addr.clone();
        let timeout = self.connect_timeout;
        let channel = channel.to_string();
        let events = self.events.clone();

        self.tasks.spawn(async move {
            if let Err(err) = run_subscriber(id, &addr, timeout, &channel, &events).await {
                let _ = events.send(BrokerEvent::Fault(err));
            }
        });
    }

    fn open_publisher(&mut self, id: usize) {
        let addr = self.addr.clone();
        let timeout = self.connect_timeout;
        let events = self.events.clone();

        self.tasks.spawn(async move {
            if let Err(err) = run_publisher(id, &addr, timeout, &events).await {
                let _ = events.send(BrokerEvent::Fault(err));
            }
        });
    }

    fn publish(&mut self, publisher: &PublisherHandle, burst: u64, channel: &str, payload: &Bytes) {
        let mut frame = BytesMut::new();
        encode_command(&[b"PUBLISH", channel.as_bytes(), &payload[..]], &mut frame);

        let request = PublishRequest {
            burst,
            frame: frame.freeze(),
        };
        if publisher.commands.send(request).is_err() {
            let _ = self.events.send(BrokerEvent::PublishFailed {
                burst,
                reason: format!("publisher #{} is closed", publisher.id),
            });
        }
    }
}

/// Connect with a timeout and disable Nagle
async fn connect(addr: &str, role: Role, id: usize, timeout: Duration) -> Result<TcpStream> {
    let stream = bounded_connect(TcpStream::connect(addr), role, id, timeout).await?;
    let _ = stream.set_nodelay(true);
    tracing::trace!("{} #{} connected to {}", role, id, addr);
    Ok(stream)
}

async fn bounded_connect<F>(connecting: F, role: Role, id: usize, timeout: Duration) -> Result<TcpStream>
where
    F: Future<Output = std::io::Result<TcpStream>>,
{
    match tokio::time::timeout(timeout, connecting).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(BenchError::Connect { role, id, source }),
        Err(_) => Err(BenchError::ConnectTimeout { role, id, timeout }),
    }
}

fn lost(role: Role, id: usize, reason: impl Into<String>) -> BenchError {
    BenchError::ConnectionLost {
        role,
        id,
        reason: reason.into(),
    }
}

/// Map read errors so that socket failures show up as a lost connection
fn read_failure(role: Role, id: usize, err: BenchError) -> BenchError {
    match err {
        BenchError::Io(e) => lost(role, id, e.to_string()),
        other => other,
    }
}

/// Subscriber-side push messages
#[derive(Debug, PartialEq)]
enum Push<'a> {
    Subscribed,
    Message,
    Error(&'a str),
    Other,
}

fn classify(frame: &Frame) -> Push<'_> {
    match frame {
        Frame::Array(items) => match items.first().and_then(Frame::as_bytes) {
            Some(kind) if kind.eq_ignore_ascii_case(b"subscribe") => Push::Subscribed,
            Some(kind) if kind.eq_ignore_ascii_case(b"message") => Push::Message,
            _ => Push::Other,
        },
        Frame::Error(msg) => Push::Error(msg),
        _ => Push::Other,
    }
}

async fn run_subscriber(
    id: usize,
    addr: &str,
    timeout: Duration,
    channel: &str,
    events: &EventSender,
) -> Result<()> {
    let mut stream = connect(addr, Role::Subscriber, id, timeout).await?;

    let mut out = BytesMut::new();
    encode_command(&[b"SUBSCRIBE", channel.as_bytes()], &mut out);
    stream
        .write_all(&out)
        .await
        .map_err(|e| lost(Role::Subscriber, id, e.to_string()))?;

    let mut buf = BytesMut::with_capacity(4096);
    let mut subscribed = false;

    loop {
        let frame = match read_frame(&mut stream, &mut buf).await {
            Ok(Some(frame)) => frame,
            Ok(None) => return Err(lost(Role::Subscriber, id, "server closed the connection")),
            Err(err) => return Err(read_failure(Role::Subscriber, id, err)),
        };

        let event = match classify(&frame) {
            Push::Subscribed if !subscribed => {
                subscribed = true;
                BrokerEvent::Subscribed { id }
            }
            Push::Message => BrokerEvent::Delivery { id },
            Push::Error(message) if !subscribed => {
                return Err(BenchError::SubscribeRejected {
                    id,
                    message: message.to_string(),
                });
            }
            Push::Error(message) => {
                return Err(lost(Role::Subscriber, id, format!("server error: {}", message)));
            }
            Push::Subscribed | Push::Other => {
                tracing::trace!("subscriber #{} ignoring frame {:?}", id, frame);
                continue;
            }
        };

        // Receiver gone means the run is over
        if events.send(event).is_err() {
            return Ok(());
        }
    }
}

async fn run_publisher(id: usize, addr: &str, timeout: Duration, events: &EventSender) -> Result<()> {
    let stream = connect(addr, Role::Publisher, id, timeout).await?;
    let (mut reader, mut writer) = stream.into_split();

    let (tx, mut commands) = mpsc::unbounded_channel();
    let handle = PublisherHandle { id, commands: tx };
    if events
        .send(BrokerEvent::PublisherConnected { id, handle })
        .is_err()
    {
        return Ok(());
    }

    // Replies come back in command order
    let mut in_flight: VecDeque<u64> = VecDeque::new();
    let mut buf = BytesMut::with_capacity(1024);

    loop {
        tokio::select! {
            request = commands.recv() => {
                let Some(request) = request else {
                    return Ok(());
                };
                in_flight.push_back(request.burst);
                writer
                    .write_all(&request.frame)
                    .await
                    .map_err(|e| lost(Role::Publisher, id, e.to_string()))?;
            }
            frame = read_frame(&mut reader, &mut buf) => {
                let frame = match frame {
                    Ok(Some(frame)) => frame,
                    Ok(None) => return Err(lost(Role::Publisher, id, "server closed the connection")),
                    Err(err) => return Err(read_failure(Role::Publisher, id, err)),
                };

                let Some(burst) = in_flight.pop_front() else {
                    return Err(BenchError::Protocol(format!(
                        "unsolicited reply on publisher #{}: {:?}",
                        id, frame
                    )));
                };

                let event = match frame {
                    Frame::Integer(n) => BrokerEvent::PublishReplied {
                        burst,
                        receivers: n.max(0) as u64,
                    },
                    Frame::Error(reason) => BrokerEvent::PublishFailed { burst, reason },
                    other => {
                        return Err(BenchError::Protocol(format!(
                            "unexpected PUBLISH reply on publisher #{}: {:?}",
                            id, other
                        )));
                    }
                };

                if events.send(event).is_err() {
                    return Ok(());
                }
            }
        }
    }
}
