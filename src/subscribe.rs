//! Publish/subscribe sessions
//!
//! Entering a subscription swaps the facade's connection handle for a
//! specialized subscribed-mode session for the duration of the listen loop.
//! The session borrows the transport, so the original handle is restored on
//! every exit path by construction. While subscribed the connection stops
//! doing request/response and only reads server-pushed frames, dispatching
//! each to the caller's handler by message kind.

use crate::command::Command;
use crate::connection::Transport;
use crate::core::error::{Error, Result, TransportError};
use crate::core::reply::Reply;
use bytes::Bytes;
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tracing::debug;

/// A server-pushed subscription event, dispatched by kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Acknowledgement of a channel subscription
    Subscribe {
        /// Channel that was subscribed
        channel: String,
        /// Remaining number of subscriptions on this connection
        count: i64,
    },
    /// Acknowledgement of a channel unsubscription
    Unsubscribe {
        /// Channel that was unsubscribed; `None` for an unsubscribe-all ack
        channel: Option<String>,
        /// Remaining number of subscriptions on this connection
        count: i64,
    },
    /// Acknowledgement of a pattern subscription
    PSubscribe {
        /// Pattern that was subscribed
        pattern: String,
        /// Remaining number of subscriptions on this connection
        count: i64,
    },
    /// Acknowledgement of a pattern unsubscription
    PUnsubscribe {
        /// Pattern that was unsubscribed; `None` for an unsubscribe-all ack
        pattern: Option<String>,
        /// Remaining number of subscriptions on this connection
        count: i64,
    },
    /// A message published to a subscribed channel
    Message {
        /// Source channel
        channel: String,
        /// Message payload
        payload: Bytes,
    },
    /// A message delivered through a pattern subscription
    PMessage {
        /// Pattern that matched
        pattern: String,
        /// Source channel
        channel: String,
        /// Message payload
        payload: Bytes,
    },
}

/// Control handle passed to the subscription handler
///
/// Subscribe/unsubscribe requests made here are folded into the live
/// session: they are sent on the subscribed connection after the handler
/// returns, without opening a second session.
#[derive(Debug, Default)]
pub struct Subscription {
    pending: Vec<Command>,
}

impl Subscription {
    /// Add channel subscriptions to the live session
    pub fn subscribe<I, T>(&mut self, channels: I)
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.pending
            .push(Command::new("SUBSCRIBE").args(channels.into_iter().map(Into::into)));
    }

    /// Add pattern subscriptions to the live session
    pub fn psubscribe<I, T>(&mut self, patterns: I)
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.pending
            .push(Command::new("PSUBSCRIBE").args(patterns.into_iter().map(Into::into)));
    }

    /// Drop channel subscriptions; an empty list drops all of them
    pub fn unsubscribe<I, T>(&mut self, channels: I)
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.pending
            .push(Command::new("UNSUBSCRIBE").args(channels.into_iter().map(Into::into)));
    }

    /// Drop pattern subscriptions; an empty list drops all of them
    pub fn punsubscribe<I, T>(&mut self, patterns: I)
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.pending
            .push(Command::new("PUNSUBSCRIBE").args(patterns.into_iter().map(Into::into)));
    }

    /// Drop every channel and pattern subscription, ending the session
    pub fn stop(&mut self) {
        self.pending.push(Command::new("UNSUBSCRIBE"));
        self.pending.push(Command::new("PUNSUBSCRIBE"));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Subscribing,
    Subscribed,
    Unsubscribing,
}

/// A live subscribed-mode session over a borrowed transport
pub(crate) struct Session<'a> {
    transport: &'a mut dyn Transport,
    state: SessionState,
    channels: HashSet<String>,
    patterns: HashSet<String>,
}

impl<'a> Session<'a> {
    pub(crate) fn new(transport: &'a mut dyn Transport) -> Self {
        Self {
            transport,
            state: SessionState::Subscribing,
            channels: HashSet::new(),
            patterns: HashSet::new(),
        }
    }

    /// Drive the listen loop until all subscriptions are gone, the deadline
    /// elapses, or an error occurs
    ///
    /// A zero deadline blocks indefinitely. An elapsed deadline ends the
    /// session normally.
    pub(crate) async fn run<F>(
        &mut self,
        initial: Command,
        deadline: Duration,
        handler: &mut F,
    ) -> Result<()>
    where
        F: FnMut(Event, &mut Subscription) -> Result<()> + Send,
    {
        debug!(command = initial.name(), "entering subscribed mode");
        self.transport.send(&initial).await.map_err(Error::from)?;
        let started = Instant::now();

        loop {
            let wait = if deadline.is_zero() {
                None
            } else {
                match deadline.checked_sub(started.elapsed()) {
                    Some(remaining) if !remaining.is_zero() => Some(remaining),
                    _ => {
                        debug!("subscription deadline elapsed");
                        return Ok(());
                    }
                }
            };

            let frame = match self.transport.recv_push(wait).await {
                Ok(frame) => frame,
                // The only read deadline in force is the session's own.
                Err(TransportError::ReadTimeout(_)) if !deadline.is_zero() => {
                    debug!("subscription deadline elapsed");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };

            let event = parse_event(frame)?;
            let finished = self.track(&event);

            let mut control = Subscription::default();
            handler(event, &mut control)?;
            for command in control.pending.drain(..) {
                self.transport.send(&command).await.map_err(Error::from)?;
            }

            if finished {
                debug!("all subscriptions released, leaving subscribed mode");
                return Ok(());
            }
        }
    }

    /// Update the subscription registry; true when nothing is left
    fn track(&mut self, event: &Event) -> bool {
        match event {
            Event::Subscribe { channel, .. } => {
                self.channels.insert(channel.clone());
                self.state = SessionState::Subscribed;
            }
            Event::PSubscribe { pattern, .. } => {
                self.patterns.insert(pattern.clone());
                self.state = SessionState::Subscribed;
            }
            Event::Unsubscribe { channel, count } => {
                match channel {
                    Some(channel) => {
                        self.channels.remove(channel);
                    }
                    None => self.channels.clear(),
                }
                self.state = SessionState::Unsubscribing;
                if *count == 0 {
                    return true;
                }
            }
            Event::PUnsubscribe { pattern, count } => {
                match pattern {
                    Some(pattern) => {
                        self.patterns.remove(pattern);
                    }
                    None => self.patterns.clear(),
                }
                self.state = SessionState::Unsubscribing;
                if *count == 0 {
                    return true;
                }
            }
            Event::Message { .. } | Event::PMessage { .. } => {}
        }
        false
    }
}

fn parse_event(frame: Reply) -> Result<Event> {
    let framing_err =
        |frame: &[Reply]| TransportError::UnknownReply(format!("unexpected push frame: {:?}", frame));

    let items = match frame {
        Reply::Array(items) => items,
        other => {
            return Err(TransportError::UnknownReply(format!(
                "unexpected push frame: {:?}",
                other
            ))
            .into())
        }
    };

    let kind = items
        .first()
        .and_then(|k| k.as_string().ok())
        .ok_or_else(|| framing_err(&items))?;

    let event = match (kind.as_str(), items.len()) {
        ("subscribe", 3) => Event::Subscribe {
            channel: items[1].as_string().map_err(|_| framing_err(&items))?,
            count: items[2].as_int().map_err(|_| framing_err(&items))?,
        },
        ("unsubscribe", 3) => Event::Unsubscribe {
            channel: optional_name(&items[1]),
            count: items[2].as_int().map_err(|_| framing_err(&items))?,
        },
        ("psubscribe", 3) => Event::PSubscribe {
            pattern: items[1].as_string().map_err(|_| framing_err(&items))?,
            count: items[2].as_int().map_err(|_| framing_err(&items))?,
        },
        ("punsubscribe", 3) => Event::PUnsubscribe {
            pattern: optional_name(&items[1]),
            count: items[2].as_int().map_err(|_| framing_err(&items))?,
        },
        ("message", 3) => Event::Message {
            channel: items[1].as_string().map_err(|_| framing_err(&items))?,
            payload: items[2].as_bytes().map_err(|_| framing_err(&items))?,
        },
        ("pmessage", 4) => Event::PMessage {
            pattern: items[1].as_string().map_err(|_| framing_err(&items))?,
            channel: items[2].as_string().map_err(|_| framing_err(&items))?,
            payload: items[3].as_bytes().map_err(|_| framing_err(&items))?,
        },
        _ => return Err(framing_err(&items).into()),
    };
    Ok(event)
}

fn optional_name(reply: &Reply) -> Option<String> {
    reply.as_string().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::TransportResult;
    use crate::core::config::ReconnectPolicy;
    use async_trait::async_trait;
    use std::collections::VecDeque;

    struct ScriptedTransport {
        pushes: VecDeque<Reply>,
        sent: Vec<Command>,
    }

    impl ScriptedTransport {
        fn new(pushes: Vec<Reply>) -> Self {
            Self {
                pushes: pushes.into(),
                sent: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn call(&mut self, _: &Command) -> TransportResult<Reply> {
            Err(TransportError::Connection("not in call mode".into()))
        }

        async fn blocking_call(
            &mut self,
            _: Option<Duration>,
            _: &Command,
        ) -> TransportResult<Reply> {
            Err(TransportError::Connection("not in call mode".into()))
        }

        async fn exec_batch(&mut self, _: &[Command]) -> TransportResult<Vec<Reply>> {
            Err(TransportError::Connection("not in call mode".into()))
        }

        async fn send(&mut self, command: &Command) -> TransportResult<()> {
            self.sent.push(command.clone());
            Ok(())
        }

        async fn recv_push(&mut self, _: Option<Duration>) -> TransportResult<Reply> {
            self.pushes
                .pop_front()
                .ok_or_else(|| TransportError::ReadTimeout("no more pushes".into()))
        }

        fn read_timeout(&self) -> Duration {
            Duration::ZERO
        }

        fn set_reconnect(&mut self, policy: ReconnectPolicy) -> ReconnectPolicy {
            policy
        }

        fn is_connected(&self) -> bool {
            true
        }

        async fn close(&mut self) -> TransportResult<()> {
            Ok(())
        }
    }

    fn subscribe_ack(channel: &str, count: i64) -> Reply {
        Reply::Array(vec![
            Reply::from("subscribe"),
            Reply::from(channel),
            Reply::Integer(count),
        ])
    }

    fn unsubscribe_ack(channel: &str, count: i64) -> Reply {
        Reply::Array(vec![
            Reply::from("unsubscribe"),
            Reply::from(channel),
            Reply::Integer(count),
        ])
    }

    fn message(channel: &str, payload: &str) -> Reply {
        Reply::Array(vec![
            Reply::from("message"),
            Reply::from(channel),
            Reply::from(payload),
        ])
    }

    #[tokio::test]
    async fn session_dispatches_events_until_last_unsubscribe() {
        let mut transport = ScriptedTransport::new(vec![
            subscribe_ack("news", 1),
            message("news", "hello"),
            unsubscribe_ack("news", 0),
        ]);
        let mut events = Vec::new();
        let mut session = Session::new(&mut transport);
        session
            .run(
                Command::new("SUBSCRIBE").arg("news"),
                Duration::ZERO,
                &mut |event, control| {
                    if matches!(event, Event::Message { .. }) {
                        control.unsubscribe(["news"]);
                    }
                    events.push(event);
                    Ok(())
                },
            )
            .await
            .unwrap();

        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], Event::Subscribe { .. }));
        assert!(matches!(events[1], Event::Message { .. }));
        assert!(matches!(events[2], Event::Unsubscribe { .. }));

        let sent: Vec<_> = transport.sent.iter().map(Command::name).collect();
        assert_eq!(sent, ["SUBSCRIBE", "UNSUBSCRIBE"]);
    }

    #[tokio::test]
    async fn handler_can_fold_new_subscriptions_into_the_session() {
        let mut transport = ScriptedTransport::new(vec![
            subscribe_ack("a", 1),
            subscribe_ack("b", 2),
            unsubscribe_ack("a", 1),
            unsubscribe_ack("b", 0),
        ]);
        let mut session = Session::new(&mut transport);
        let mut first = true;
        session
            .run(
                Command::new("SUBSCRIBE").arg("a"),
                Duration::ZERO,
                &mut |event, control| {
                    if first && matches!(event, Event::Subscribe { .. }) {
                        first = false;
                        control.subscribe(["b"]);
                        control.unsubscribe(["a"]);
                        control.unsubscribe(["b"]);
                    }
                    Ok(())
                },
            )
            .await
            .unwrap();

        let sent: Vec<_> = transport.sent.iter().map(Command::name).collect();
        assert_eq!(
            sent,
            ["SUBSCRIBE", "SUBSCRIBE", "UNSUBSCRIBE", "UNSUBSCRIBE"]
        );
    }

    #[tokio::test]
    async fn elapsed_deadline_ends_the_session_without_error() {
        // The scripted transport reports a read timeout once pushes run out.
        let mut transport = ScriptedTransport::new(vec![subscribe_ack("news", 1)]);
        let mut session = Session::new(&mut transport);
        let result = session
            .run(
                Command::new("SUBSCRIBE").arg("news"),
                Duration::from_millis(20),
                &mut |_, _| Ok(()),
            )
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn handler_error_propagates() {
        let mut transport = ScriptedTransport::new(vec![subscribe_ack("news", 1)]);
        let mut session = Session::new(&mut transport);
        let result = session
            .run(
                Command::new("SUBSCRIBE").arg("news"),
                Duration::ZERO,
                &mut |_, _| {
                    Err(Error::Type("handler bailed".into()))
                },
            )
            .await;
        assert!(matches!(result, Err(Error::Type(_))));
    }

    #[tokio::test]
    async fn malformed_push_is_a_protocol_error() {
        let mut transport = ScriptedTransport::new(vec![Reply::Integer(5)]);
        let mut session = Session::new(&mut transport);
        let result = session
            .run(
                Command::new("SUBSCRIBE").arg("news"),
                Duration::ZERO,
                &mut |_, _| Ok(()),
            )
            .await;
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[test]
    fn parses_each_push_kind() {
        assert!(matches!(
            parse_event(subscribe_ack("c", 1)).unwrap(),
            Event::Subscribe { .. }
        ));
        assert!(matches!(
            parse_event(message("c", "p")).unwrap(),
            Event::Message { .. }
        ));
        let pmessage = Reply::Array(vec![
            Reply::from("pmessage"),
            Reply::from("c.*"),
            Reply::from("c.1"),
            Reply::from("p"),
        ]);
        assert!(matches!(
            parse_event(pmessage).unwrap(),
            Event::PMessage { .. }
        ));
        // An unsubscribe-all ack carries a null name.
        let all = Reply::Array(vec![
            Reply::from("punsubscribe"),
            Reply::Null,
            Reply::Integer(0),
        ]);
        assert!(matches!(
            parse_event(all).unwrap(),
            Event::PUnsubscribe { pattern: None, .. }
        ));
    }
}
