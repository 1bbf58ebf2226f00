//! Message prefixes.
//!
//! A prefix is either a server name or a `nick[!user[@host]]` mask. The
//! parser is lenient: a dot before any `!`/`@` marks a server name.

use std::fmt::{self, Display, Formatter};

/// Origin of an IRC message.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Prefix {
    /// Server origin, e.g. `irc.example.net` or the bouncer's own prefix.
    ServerName(String),
    /// User origin: nickname, username, hostname (either may be empty).
    Nickname(String, String, String),
}

impl Prefix {
    /// Parse a prefix string (without the leading `:`).
    pub fn parse(s: &str) -> Self {
        let (name, rest) = match s.split_once('!') {
            Some((n, r)) => (n, Some(r)),
            None => (s, None),
        };

        if let Some(rest) = rest {
            let (user, host) = match rest.split_once('@') {
                Some((u, h)) => (u, h),
                None => (rest, ""),
            };
            return Prefix::Nickname(name.to_string(), user.to_string(), host.to_string());
        }

        // nick@host without a user part
        if let Some((nick, host)) = s.split_once('@') {
            return Prefix::Nickname(nick.to_string(), String::new(), host.to_string());
        }

        if s.contains('.') {
            Prefix::ServerName(s.to_string())
        } else {
            Prefix::Nickname(s.to_string(), String::new(), String::new())
        }
    }

    /// Nickname component, if this is a user prefix.
    pub fn nick(&self) -> Option<&str> {
        match self {
            Prefix::Nickname(nick, _, _) if !nick.is_empty() => Some(nick),
            _ => None,
        }
    }
}

impl Display for Prefix {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Prefix::ServerName(name) => write!(f, "{name}"),
            Prefix::Nickname(nick, user, host) => {
                write!(f, "{nick}")?;
                if !user.is_empty() {
                    write!(f, "!{user}")?;
                }
                if !host.is_empty() {
                    write!(f, "@{host}")?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_mask() {
        let p = Prefix::parse("nick!user@host.net");
        assert_eq!(
            p,
            Prefix::Nickname("nick".into(), "user".into(), "host.net".into())
        );
        assert_eq!(p.to_string(), "nick!user@host.net");
    }

    #[test]
    fn bare_name_with_dot_is_server() {
        assert_eq!(
            Prefix::parse("irc.example.net"),
            Prefix::ServerName("irc.example.net".into())
        );
    }

    #[test]
    fn bare_nick() {
        let p = Prefix::parse("bnc");
        assert_eq!(p.nick(), Some("bnc"));
        assert_eq!(p.to_string(), "bnc");
    }
}
