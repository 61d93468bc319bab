//! Private-message addressing convention.
//!
//! A private message is typed as `/<label> <body>`. The full prefixed text
//! travels on the wire; the sender parses it to pick the target, the
//! receiver parses it to recover the body.

/// First character of a private message.
pub const PRIVATE_PREFIX: char = '/';

/// A parsed `/<target> <body>` message, borrowing from the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrivateMessage<'a> {
    pub target: &'a str,
    pub body: &'a str,
}

/// Where a line of user input goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outgoing<'a> {
    Broadcast(&'a str),
    Private(PrivateMessage<'a>),
}

/// Whether `text` uses the private prefix at all.
pub fn is_private(text: &str) -> bool {
    text.starts_with(PRIVATE_PREFIX)
}

/// Parse the addressing prefix.
///
/// The label runs from just after the first `/` to the first space; the
/// body is everything after that space. Returns `None` when there is no
/// `/`, the label is empty, or no space follows the label.
pub fn parse(text: &str) -> Option<PrivateMessage<'_>> {
    let (_, rest) = text.split_once(PRIVATE_PREFIX)?;
    let (target, body) = rest.split_once(' ')?;
    if target.is_empty() {
        return None;
    }
    Some(PrivateMessage { target, body })
}

/// Build the wire text for a private message.
pub fn format(target: &str, body: &str) -> String {
    format!("{PRIVATE_PREFIX}{target} {body}")
}

/// Receiver side: the body of a private message, or `""` for degenerate text.
pub fn body(text: &str) -> &str {
    parse(text).map(|msg| msg.body).unwrap_or("")
}

/// Decide how a line of input is sent.
///
/// Only text that starts with `/` and parses cleanly is private; everything
/// else, including malformed `/...` text, goes to the whole room.
pub fn route(text: &str) -> Outgoing<'_> {
    if is_private(text) {
        if let Some(msg) = parse(text) {
            return Outgoing::Private(msg);
        }
    }
    Outgoing::Broadcast(text)
}
