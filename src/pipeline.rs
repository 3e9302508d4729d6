//! Command batching
//!
//! A [`Pipeline`] only queues: nothing touches the network until the whole
//! batch is flushed in one round trip by [`Client::pipelined`]. Replies come
//! back in submission order, one per queued command. A batch is atomic at
//! the framing level only; server-side atomicity requires an explicit
//! [`Pipeline::multi`] section, whose queued replies are recovered from the
//! EXEC array during distribution.
//!
//! [`Client::pipelined`]: crate::client::Client::pipelined

use crate::command::Command;
use crate::core::error::{Error, Result, TransportError};
use crate::core::reply::Reply;

/// A batch of commands flushed in a single network round trip
#[derive(Debug, Default)]
pub struct Pipeline {
    commands: Vec<Command>,
    sections: Vec<Section>,
}

#[derive(Debug)]
enum Section {
    Single,
    Multi { len: usize },
}

/// Queues commands inside a MULTI/EXEC section
#[derive(Debug, Default)]
pub struct MultiBatch {
    commands: Vec<Command>,
}

impl MultiBatch {
    /// Queue a command inside the transaction
    pub fn queue(&mut self, command: Command) -> &mut Self {
        self.commands.push(command);
        self
    }
}

impl Pipeline {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Queue a command; it is sent when the batch is flushed
    pub fn queue(&mut self, command: Command) -> &mut Self {
        self.commands.push(command);
        self.sections.push(Section::Single);
        self
    }

    /// Queue a MULTI/EXEC section
    ///
    /// The section's commands are framed between MULTI and EXEC inside the
    /// same flush; the server executes them atomically. Each command still
    /// produces one entry in the distributed results, in order.
    pub fn multi<F>(&mut self, build: F) -> &mut Self
    where
        F: FnOnce(&mut MultiBatch),
    {
        let mut batch = MultiBatch::default();
        build(&mut batch);
        let len = batch.commands.len();
        self.commands.push(Command::new("MULTI"));
        self.commands.extend(batch.commands);
        self.commands.push(Command::new("EXEC"));
        self.sections.push(Section::Multi { len });
        self
    }

    /// Number of result slots the batch will produce
    pub fn len(&self) -> usize {
        self.sections
            .iter()
            .map(|s| match s {
                Section::Single => 1,
                Section::Multi { len } => *len,
            })
            .sum()
    }

    /// Whether nothing has been queued
    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    pub(crate) fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Map raw transport replies back onto the queued commands
    ///
    /// MULTI sections collapse their bookkeeping frames (the MULTI ack and
    /// per-command QUEUED acks) and inline the EXEC array. After
    /// distribution, the first server error anywhere in the batch is raised.
    pub(crate) fn distribute(&self, raw: Vec<Reply>) -> Result<Vec<Reply>> {
        if raw.len() != self.commands.len() {
            return Err(TransportError::UnknownReply(format!(
                "pipeline sent {} frames but received {} replies",
                self.commands.len(),
                raw.len()
            ))
            .into());
        }

        let mut frames = raw.into_iter();
        let mut results = Vec::with_capacity(self.len());
        for section in &self.sections {
            match section {
                Section::Single => {
                    results.push(next_frame(&mut frames)?);
                }
                Section::Multi { len } => {
                    let multi_ack = next_frame(&mut frames)?;
                    if let Reply::Error(msg) = multi_ack {
                        return Err(Error::from(TransportError::from_error_reply(msg)));
                    }
                    // QUEUED acks; a queuing error also aborts EXEC below.
                    for _ in 0..*len {
                        let _ = next_frame(&mut frames)?;
                    }
                    match next_frame(&mut frames)? {
                        Reply::Array(items) if items.len() == *len => results.extend(items),
                        Reply::Null => {
                            return Err(Error::from(TransportError::Command(
                                "EXEC aborted, transaction discarded".to_string(),
                            )))
                        }
                        Reply::Error(msg) => {
                            return Err(Error::from(TransportError::from_error_reply(msg)))
                        }
                        other => {
                            return Err(Error::from(TransportError::UnknownReply(format!(
                                "unexpected EXEC reply: {:?}",
                                other
                            ))))
                        }
                    }
                }
            }
        }

        // All replies are read before the first error is raised, so the
        // stream stays in sync.
        for reply in &results {
            if let Reply::Error(msg) = reply {
                return Err(Error::from(TransportError::from_error_reply(msg.clone())));
            }
        }
        Ok(results)
    }
}

fn next_frame(frames: &mut impl Iterator<Item = Reply>) -> Result<Reply> {
    frames.next().ok_or_else(|| {
        Error::from(TransportError::UnknownReply(
            "pipeline reply stream ended early".to_string(),
        ))
    })
}
