// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Live build output buffering.
//!
//! Console lines from the running build accumulate here and are served
//! incrementally to tailing coordinators. Each build gets a fresh session
//! id; a tailer that sees the id change knows its line offset is stale and
//! starts over from zero.

use uuid::Uuid;

/// Upper bound on lines returned by a single retrieval call.
pub const MAX_LINES_PER_RETRIEVE: usize = 1000;

/// Buffered console output for the current (or most recent) build.
#[derive(Debug)]
pub struct LiveOutputBuffer {
    id: String,
    lines: Vec<String>,
}

impl LiveOutputBuffer {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            lines: Vec::new(),
        }
    }

    /// The current session id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Rotate the session id and drop the previous build's lines.
    pub fn start_new_session(&mut self) {
        self.id = Uuid::new_v4().to_string();
        self.lines.clear();
    }

    pub fn push_line(&mut self, line: String) {
        self.lines.push(line);
    }

    /// Lines from `first_line` on, capped at [`MAX_LINES_PER_RETRIEVE`].
    /// An offset past the end of the buffer yields an empty list.
    pub fn retrieve(&self, first_line: usize) -> Vec<String> {
        if first_line >= self.lines.len() {
            return Vec::new();
        }
        let end = (first_line + MAX_LINES_PER_RETRIEVE).min(self.lines.len());
        self.lines[first_line..end].to_vec()
    }
}

impl Default for LiveOutputBuffer {
    fn default() -> Self {
        Self::new()
    }
}
