// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Incremental live-output tailing.
//!
//! [`OutputTailer`] tracks a line cursor into the agent's live-output
//! buffer, keyed by the buffer's session id. When the id changes a new
//! build has started on the agent: the cursor resets to zero and any lines
//! fetched under the old cursor are discarded, since their offsets belong
//! to the previous session.

#[derive(Debug, Default)]
pub struct OutputTailer {
    session_id: Option<String>,
    next_line: usize,
}

impl OutputTailer {
    pub fn new() -> Self {
        Self::default()
    }

    /// The line offset to fetch next for the given session, resetting the
    /// cursor when the session changed since the last poll.
    pub fn cursor(&mut self, session_id: &str) -> usize {
        if self.session_id.as_deref() != Some(session_id) {
            self.session_id = Some(session_id.to_string());
            self.next_line = 0;
        }
        self.next_line
    }

    /// Account for fetched lines. Lines from a session other than the one
    /// the cursor was issued for are discarded.
    pub fn advance(&mut self, session_id: &str, lines: Vec<String>) -> Vec<String> {
        if self.session_id.as_deref() != Some(session_id) {
            return Vec::new();
        }
        self.next_line += lines.len();
        lines
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn lines(texts: &[&str]) -> Vec<String> {
        texts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn cursor_accumulates_within_a_session() {
        let mut tailer = OutputTailer::new();
        assert_eq!(tailer.cursor("s1"), 0);
        assert_eq!(tailer.advance("s1", lines(&["a", "b"])).len(), 2);
        assert_eq!(tailer.cursor("s1"), 2);
        assert_eq!(tailer.advance("s1", lines(&["c"])).len(), 1);
        assert_eq!(tailer.cursor("s1"), 3);
    }

    #[test]
    fn session_change_resets_the_cursor() {
        let mut tailer = OutputTailer::new();
        tailer.cursor("s1");
        tailer.advance("s1", lines(&["a", "b", "c"]));

        assert_eq!(tailer.cursor("s2"), 0);
    }

    #[test]
    fn lines_from_a_stale_session_are_discarded() {
        let mut tailer = OutputTailer::new();
        tailer.cursor("s1");
        // The session rotated between the cursor and the fetch.
        assert!(tailer.advance("s2", lines(&["x"])).is_empty());
        // The discarded lines did not move the new session's cursor.
        assert_eq!(tailer.cursor("s2"), 0);
    }
}
