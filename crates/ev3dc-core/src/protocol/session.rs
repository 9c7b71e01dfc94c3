//! Protocol session
//!
//! Ties the codec, the framer and the broker to a transport. Requests are
//! written through [`ProtocolSession`]; replies are fed in by a
//! [`ResponseReader`], either from a spawned read loop or by hand.

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::codec::Parameter;
use super::packet::{
    assemble_request_body, decode_response_body, decode_response_head, encode_request,
    DecodedValue, ResponseMessage, MAX_COUNTER,
};
use super::{Ev3Error, MessageFramer, ResponseBroker, Result, DEFAULT_TIMEOUT_MS};

/// Size of each read from the transport
const READ_CHUNK_SIZE: usize = 1024;

/// Capacity of the session event channel
const EVENT_CAPACITY: usize = 64;

/// Session configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// How long a request waits for its reply; zero waits forever
    pub timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }
}

/// Something noteworthy seen on the incoming stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A well-formed reply nobody was waiting for
    Unmatched {
        /// Counter carried by the reply
        counter: u16,
    },
    /// A framed message that failed header decoding
    Malformed {
        /// Why decoding failed
        reason: String,
        /// The offending message, length prefix included
        message: Bytes,
    },
    /// The transport reached end of stream or failed
    Closed,
}

/// Incoming half of a session: framer, header decoding and settlement
#[derive(Clone)]
pub struct ResponseReader {
    framer: Arc<Mutex<MessageFramer>>,
    broker: ResponseBroker<ResponseMessage>,
    events: broadcast::Sender<SessionEvent>,
}

impl ResponseReader {
    fn new(broker: ResponseBroker<ResponseMessage>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            framer: Arc::new(Mutex::new(MessageFramer::new())),
            broker,
            events,
        }
    }

    /// Feed a chunk received from the transport
    pub fn push(&self, chunk: &[u8]) {
        let messages = self
            .framer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(chunk);
        for message in messages {
            self.dispatch(message);
        }
    }

    /// Flush the framer at end of stream
    pub fn finish(&self) {
        let leftover = self
            .framer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .finish();
        if let Some(message) = leftover {
            self.dispatch(message);
        }
    }

    /// Read from `reader` until end of stream, dispatching every reply
    ///
    /// When the stream ends or fails, all pending requests are failed with
    /// a transport error.
    pub async fn run<R>(self, mut reader: R) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        let outcome = loop {
            match reader.read(&mut buf).await {
                Ok(0) => break Ok(()),
                Ok(n) => self.push(&buf[..n]),
                Err(e) => break Err(e),
            }
        };

        self.finish();
        self.close();

        match outcome {
            Ok(()) => {
                debug!("transport reached end of stream");
                Ok(())
            }
            Err(e) => {
                warn!("transport read failed: {}", e);
                Err(Ev3Error::Transport(e))
            }
        }
    }

    /// Subscribe to incoming-stream events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn dispatch(&self, message: Bytes) {
        debug!("framed reply of {} bytes", message.len());
        match decode_response_head(&message) {
            Ok(response) => {
                let counter = response.counter();
                if self.broker.settle(counter, response).is_err() {
                    warn!("reply for counter {} matches no pending request", counter);
                    self.emit(SessionEvent::Unmatched { counter });
                }
            }
            Err(e) => {
                warn!("dropping malformed reply ({} bytes): {}", message.len(), e);
                self.emit(SessionEvent::Malformed {
                    reason: e.to_string(),
                    message,
                });
            }
        }
    }

    fn close(&self) {
        self.broker.reject_all(|id| {
            Ev3Error::Transport(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("connection closed before reply to request {}", id),
            ))
        });
        self.emit(SessionEvent::Closed);
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// A Direct Command session over one transport
pub struct ProtocolSession<W> {
    writer: tokio::sync::Mutex<W>,
    next_counter: AtomicU32,
    broker: ResponseBroker<ResponseMessage>,
    reader: ResponseReader,
    config: SessionConfig,
}

impl<S> ProtocolSession<WriteHalf<S>>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Split a duplex stream and spawn its read loop
    pub fn over(stream: S, config: SessionConfig) -> (Self, JoinHandle<Result<()>>) {
        let (read_half, write_half): (ReadHalf<S>, WriteHalf<S>) = tokio::io::split(stream);
        let session = Self::new(write_half, config);
        let task = session.spawn_reader(read_half);
        (session, task)
    }
}

impl<W> ProtocolSession<W>
where
    W: AsyncWrite + Unpin,
{
    /// Create a session writing requests to `writer`
    ///
    /// Replies must be fed through [`ProtocolSession::reader`] or
    /// [`ProtocolSession::spawn_reader`].
    pub fn new(writer: W, config: SessionConfig) -> Self {
        let broker = ResponseBroker::new();
        Self {
            writer: tokio::sync::Mutex::new(writer),
            next_counter: AtomicU32::new(0),
            reader: ResponseReader::new(broker.clone()),
            broker,
            config,
        }
    }

    /// Handle for feeding replies into this session
    pub fn reader(&self) -> ResponseReader {
        self.reader.clone()
    }

    /// Spawn a task reading replies from `reader`
    pub fn spawn_reader<R>(&self, reader: R) -> JoinHandle<Result<()>>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        tokio::spawn(self.reader.clone().run(reader))
    }

    /// Subscribe to incoming-stream events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.reader.subscribe()
    }

    /// Configuration the session was created with
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Number of requests waiting for a reply
    pub fn pending(&self) -> usize {
        self.broker.size()
    }

    /// Send a request and, if `expect_response`, wait for its values
    pub async fn send(
        &self,
        params: &[Parameter],
        expect_response: bool,
    ) -> Result<Option<Vec<DecodedValue>>> {
        let counter = self.take_counter()?;
        let body = assemble_request_body(params)?;
        let message = encode_request(counter, &body, expect_response)?;

        // Registered before writing so a fast reply cannot be missed.
        let wait = if expect_response {
            Some(self.broker.register_wait(counter, self.config.timeout)?)
        } else {
            None
        };

        self.write(counter, &message).await?;

        let Some(wait) = wait else {
            return Ok(None);
        };

        match wait.await? {
            ResponseMessage::Ok { payload, .. } => {
                decode_response_body(&payload, &body.pointer_map).map(Some)
            }
            ResponseMessage::Error { counter } => Err(Ev3Error::DeviceError { counter }),
        }
    }

    /// Send a request and wait for the values it asks for
    pub async fn request(&self, params: &[Parameter]) -> Result<Vec<DecodedValue>> {
        Ok(self.send(params, true).await?.unwrap_or_default())
    }

    /// Send a request that expects no reply
    pub async fn command(&self, params: &[Parameter]) -> Result<()> {
        self.send(params, false).await.map(|_| ())
    }

    /// Shut down the write side of the transport
    pub async fn shutdown(&self) -> Result<()> {
        self.writer.lock().await.shutdown().await?;
        Ok(())
    }

    fn take_counter(&self) -> Result<u16> {
        let counter = self.next_counter.fetch_add(1, Ordering::SeqCst);
        if counter > MAX_COUNTER as u32 {
            // Wrapping could collide with a request still in flight.
            return Err(Ev3Error::validation(format!(
                "message counter exhausted after {} requests",
                MAX_COUNTER as u32 + 1
            )));
        }
        Ok(counter as u16)
    }

    async fn write(&self, counter: u16, message: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(message).await?;
        writer.flush().await?;
        debug!("request {} written ({} bytes)", counter, message.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> ProtocolSession<Vec<u8>> {
        ProtocolSession::new(Vec::new(), SessionConfig::default())
    }

    #[tokio::test]
    async fn test_unmatched_reply_is_reported() {
        let session = session();
        let mut events = session.subscribe();

        session.reader().push(&[0x03, 0x00, 0x09, 0x00, 0x02]);
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::Unmatched { counter: 9 }
        );
    }

    #[tokio::test]
    async fn test_malformed_reply_does_not_break_framing() {
        let session = session();
        let mut events = session.subscribe();
        let wait = session.broker.register_wait(1, Duration::ZERO).unwrap();

        // unknown status, then a good reply for counter 1
        session
            .reader()
            .push(&[0x03, 0x00, 0x00, 0x00, 0x07, 0x03, 0x00, 0x01, 0x00, 0x02]);

        match events.recv().await.unwrap() {
            SessionEvent::Malformed { reason, message } => {
                assert!(reason.contains("unknown status"));
                assert_eq!(message.len(), 5);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(
            wait.await.unwrap(),
            ResponseMessage::Ok {
                counter: 1,
                payload: Bytes::new(),
            }
        );
    }

    #[tokio::test]
    async fn test_truncated_tail_is_flushed_as_malformed() {
        let session = session();
        let mut events = session.subscribe();
        let reader = session.reader();

        reader.push(&[0x05, 0x00, 0x01]);
        reader.finish();
        assert!(matches!(
            events.recv().await.unwrap(),
            SessionEvent::Malformed { .. }
        ));
    }

    #[tokio::test]
    async fn test_counter_exhaustion() {
        let session = session();
        session
            .next_counter
            .store(MAX_COUNTER as u32, Ordering::SeqCst);

        session.command(&[Parameter::Byte(0x01)]).await.unwrap();
        let err = session.command(&[Parameter::Byte(0x01)]).await.unwrap_err();
        assert!(matches!(err, Ev3Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_counters_increase() {
        let session = session();
        session.command(&[Parameter::Byte(0x01)]).await.unwrap();
        session.command(&[Parameter::Byte(0x01)]).await.unwrap();

        let written = session.writer.lock().await.clone();
        assert_eq!(written.len(), 16);
        assert_eq!(&written[2..4], &[0, 0]);
        assert_eq!(&written[10..12], &[1, 0]);
    }

    #[tokio::test]
    async fn test_validation_error_leaves_nothing_pending() {
        let session = session();
        let err = session
            .request(&[Parameter::number(0, 99)])
            .await
            .unwrap_err();
        assert!(matches!(err, Ev3Error::Validation(_)));
        assert_eq!(session.pending(), 0);
        assert!(session.writer.lock().await.is_empty());
    }
}
