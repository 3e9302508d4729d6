//! Command representation
//!
//! A command is an ordered sequence of string tokens, never mutated after
//! submission. The facade does not know individual commands; callers build
//! whatever the server understands.

/// An ordered sequence of command tokens
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    tokens: Vec<String>,
}

impl Command {
    /// Start a command with its name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            tokens: vec![name.into()],
        }
    }

    /// Append one argument
    pub fn arg(mut self, arg: impl ToString) -> Self {
        self.tokens.push(arg.to_string());
        self
    }

    /// Append several arguments
    pub fn args<I, T>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: ToString,
    {
        self.tokens.extend(args.into_iter().map(|a| a.to_string()));
        self
    }

    /// The command name (first token)
    pub fn name(&self) -> &str {
        &self.tokens[0]
    }

    /// All tokens in submission order
    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// The token used for cluster routing, when present
    ///
    /// By convention this is the first argument after the command name. Keyless
    /// commands (PING, SUBSCRIBE acks, ...) return `None` and may be routed to
    /// any node.
    pub fn routing_key(&self) -> Option<&str> {
        self.tokens.get(1).map(String::as_str)
    }
}

impl From<Vec<String>> for Command {
    fn from(tokens: Vec<String>) -> Self {
        debug_assert!(!tokens.is_empty(), "a command needs at least a name");
        Self { tokens }
    }
}

impl<const N: usize> From<[&str; N]> for Command {
    fn from(tokens: [&str; N]) -> Self {
        Self {
            tokens: tokens.iter().map(|t| (*t).to_string()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_token_sequence_in_order() {
        let cmd = Command::new("SET").arg("key").arg("value").arg(42);
        assert_eq!(cmd.name(), "SET");
        assert_eq!(cmd.tokens(), ["SET", "key", "value", "42"]);
    }

    #[test]
    fn routing_key_is_first_argument() {
        assert_eq!(
            Command::new("GET").arg("mykey").routing_key(),
            Some("mykey")
        );
        assert_eq!(Command::new("PING").routing_key(), None);
    }
}
