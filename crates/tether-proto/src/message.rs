//! Owned IRC messages.
//!
//! `Message` keeps the verb as an uppercase string and the parameters as a
//! plain vector; the final parameter is re-serialized with a `:` sentinel
//! whenever the wire format requires one. Numerics are three-digit verbs.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use crate::error::ProtocolError;
use crate::prefix::Prefix;
use crate::tags::{escape_tag_value, unescape_tag_value};

/// A single IRCv3 message tag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tag(pub String, pub Option<String>);

/// An owned IRC protocol message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    /// IRCv3 tags, when the line carried a `@...` section.
    pub tags: Option<Vec<Tag>>,
    /// Message origin.
    pub prefix: Option<Prefix>,
    /// Uppercased verb (`PRIVMSG`, `CAP`, `001`, ...).
    pub verb: String,
    /// Positional parameters, trailing parameter last.
    pub params: Vec<String>,
}

impl Message {
    /// Build a message from a verb and parameters, no prefix or tags.
    pub fn new<V: Into<String>>(verb: V, params: Vec<String>) -> Self {
        Message {
            tags: None,
            prefix: None,
            verb: verb.into().to_ascii_uppercase(),
            params,
        }
    }

    /// `PRIVMSG <target> :<text>`
    pub fn privmsg(target: &str, text: &str) -> Self {
        Message::new("PRIVMSG", vec![target.to_string(), text.to_string()])
    }

    /// `NOTICE <target> :<text>`
    pub fn notice(target: &str, text: &str) -> Self {
        Message::new("NOTICE", vec![target.to_string(), text.to_string()])
    }

    /// `PONG :<token>`
    pub fn pong(token: &str) -> Self {
        Message::new("PONG", vec![token.to_string()])
    }

    /// `ERROR :<reason>`
    pub fn error(reason: &str) -> Self {
        Message::new("ERROR", vec![reason.to_string()])
    }

    /// Numeric reply `<code> <params...>` from the given server prefix.
    pub fn numeric(from: &str, code: &str, params: Vec<String>) -> Self {
        Message::new(code, params).with_prefix(Prefix::ServerName(from.to_string()))
    }

    /// Attach a prefix.
    pub fn with_prefix(mut self, prefix: Prefix) -> Self {
        self.prefix = Some(prefix);
        self
    }

    /// Attach one tag.
    pub fn with_tag(mut self, key: &str, value: Option<&str>) -> Self {
        self.tags
            .get_or_insert_with(Vec::new)
            .push(Tag(key.to_string(), value.map(str::to_string)));
        self
    }

    /// Parameter by index.
    pub fn arg(&self, index: usize) -> Option<&str> {
        self.params.get(index).map(String::as_str)
    }

    /// Nickname of the origin, when the prefix is a user mask.
    pub fn source_nick(&self) -> Option<&str> {
        self.prefix.as_ref().and_then(Prefix::nick)
    }
}

impl FromStr for Message {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut rest = s.trim_end_matches(['\r', '\n']);
        if rest.is_empty() {
            return Err(ProtocolError::EmptyMessage);
        }

        let tags = if let Some(after) = rest.strip_prefix('@') {
            let (raw_tags, tail) = after
                .split_once(' ')
                .ok_or_else(|| ProtocolError::MissingCommand(s.to_string()))?;
            rest = tail.trim_start_matches(' ');
            let parsed = raw_tags
                .split(';')
                .filter(|t| !t.is_empty())
                .map(|t| match t.split_once('=') {
                    Some((k, v)) => Tag(k.to_string(), Some(unescape_tag_value(v))),
                    None => Tag(t.to_string(), None),
                })
                .collect();
            Some(parsed)
        } else {
            None
        };

        let prefix = if let Some(after) = rest.strip_prefix(':') {
            let (raw_prefix, tail) = after
                .split_once(' ')
                .ok_or_else(|| ProtocolError::MissingCommand(s.to_string()))?;
            rest = tail.trim_start_matches(' ');
            Some(Prefix::parse(raw_prefix))
        } else {
            None
        };

        let mut params = Vec::new();
        let verb = match rest.split_once(' ') {
            None if rest.is_empty() => {
                return Err(ProtocolError::MissingCommand(s.to_string()));
            }
            None => rest.to_string(),
            Some((verb, mut tail)) => {
                loop {
                    tail = tail.trim_start_matches(' ');
                    if tail.is_empty() {
                        break;
                    }
                    if let Some(trailing) = tail.strip_prefix(':') {
                        params.push(trailing.to_string());
                        break;
                    }
                    match tail.split_once(' ') {
                        Some((word, more)) => {
                            params.push(word.to_string());
                            tail = more;
                        }
                        None => {
                            params.push(tail.to_string());
                            break;
                        }
                    }
                }
                verb.to_string()
            }
        };

        Ok(Message {
            tags,
            prefix,
            verb: verb.to_ascii_uppercase(),
            params,
        })
    }
}

impl Display for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if let Some(tags) = &self.tags
            && !tags.is_empty()
        {
            f.write_str("@")?;
            for (i, Tag(key, value)) in tags.iter().enumerate() {
                if i > 0 {
                    f.write_str(";")?;
                }
                f.write_str(key)?;
                if let Some(value) = value {
                    write!(f, "={}", escape_tag_value(value))?;
                }
            }
            f.write_str(" ")?;
        }

        if let Some(prefix) = &self.prefix {
            write!(f, ":{prefix} ")?;
        }

        f.write_str(&self.verb)?;

        let last = self.params.len().saturating_sub(1);
        for (i, param) in self.params.iter().enumerate() {
            if i == last && (param.is_empty() || param.contains(' ') || param.starts_with(':')) {
                write!(f, " :{param}")?;
            } else {
                write!(f, " {param}")?;
            }
        }
        Ok(())
    }
}
