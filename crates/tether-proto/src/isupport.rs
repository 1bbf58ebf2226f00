//! ISUPPORT (005) token helpers.
//!
//! The bouncer stores the raw token strings it sees from upstream and only
//! ever interprets one of them itself: CHANTYPES, which decides whether a
//! buffer name refers to a channel.

use crate::message::Message;

/// Channel prefix characters assumed when no upstream has told us otherwise.
pub const DEFAULT_CHANTYPES: &str = "#&";

/// Extract the ISUPPORT tokens from a 005 line.
///
/// The first parameter is the client's nick and the last is the trailing
/// `are supported by this server` text; everything between is a token.
pub fn isupport_tokens(msg: &Message) -> Vec<String> {
    if msg.verb != "005" || msg.params.len() < 3 {
        return Vec::new();
    }
    msg.params[1..msg.params.len() - 1].to_vec()
}

/// Find the CHANTYPES value in a token list, if present.
pub fn chantypes(tokens: &[String]) -> Option<&str> {
    tokens
        .iter()
        .find_map(|t| t.strip_prefix("CHANTYPES="))
        .filter(|v| !v.is_empty())
}

/// Whether `name` names a channel under the given CHANTYPES value.
pub fn is_channel_name(name: &str, chantypes: &str) -> bool {
    name.chars()
        .next()
        .is_some_and(|c| chantypes.contains(c))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_tokens() {
        let msg: Message =
            ":irc.net 005 bob CHANTYPES=#& NICKLEN=30 :are supported by this server"
                .parse()
                .unwrap();
        let tokens = isupport_tokens(&msg);
        assert_eq!(tokens, vec!["CHANTYPES=#&", "NICKLEN=30"]);
        assert_eq!(chantypes(&tokens), Some("#&"));
    }

    #[test]
    fn non_005_yields_nothing() {
        let msg: Message = ":irc.net 001 bob :Welcome".parse().unwrap();
        assert!(isupport_tokens(&msg).is_empty());
    }

    #[test]
    fn channel_detection() {
        assert!(is_channel_name("#rust", DEFAULT_CHANTYPES));
        assert!(is_channel_name("&local", DEFAULT_CHANTYPES));
        assert!(!is_channel_name("bob", DEFAULT_CHANTYPES));
        assert!(!is_channel_name("", DEFAULT_CHANTYPES));
    }
}
