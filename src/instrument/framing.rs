//! Reply framing.
//!
//! A frame is complete when the receive buffer ends with the terminator. In
//! permissive mode only the terminator's final character has to match, and the
//! trim removes every trailing character that appears anywhere in the
//! terminator. Strict mode matches and removes exactly the terminator.

/// Frame detection and trimming for one controller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Framer {
    terminator: String,
    permissive: bool,
}

impl Framer {
    /// Framer for `terminator`, permissive or strict.
    pub fn new(terminator: impl Into<String>, permissive: bool) -> Self {
        Self {
            terminator: terminator.into(),
            permissive,
        }
    }

    /// Whether `buffer` holds a complete frame.
    pub fn is_complete(&self, buffer: &str) -> bool {
        if self.permissive {
            match self.terminator.chars().last() {
                Some(last) => buffer.ends_with(last),
                None => false,
            }
        } else {
            !self.terminator.is_empty() && buffer.ends_with(self.terminator.as_str())
        }
    }

    /// Remove the terminator from a complete frame.
    pub fn trim<'a>(&self, frame: &'a str) -> &'a str {
        if self.permissive {
            frame.trim_end_matches(|c| self.terminator.contains(c))
        } else {
            frame
                .strip_suffix(self.terminator.as_str())
                .unwrap_or(frame)
        }
    }
}

/// Drop the first `len` characters of a reply.
///
/// Returns `None` when the reply is shorter than the prefix.
pub fn strip_response_prefix(reply: &str, len: usize) -> Option<&str> {
    if len == 0 {
        return Some(reply);
    }
    reply.char_indices().nth(len).map_or_else(
        || (reply.chars().count() == len).then_some(""),
        |(idx, _)| Some(&reply[idx..]),
    )
}
