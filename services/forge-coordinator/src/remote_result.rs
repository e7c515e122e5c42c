// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bookkeeping for one result set in transit from an agent.
//!
//! The directory fields describe where a result set lives on each side; the
//! temp archive file exists only between fetch and unpack. Each field is
//! set-once: a second assignment, even of the same value, is a logic error
//! in the transfer flow and is rejected rather than silently absorbed.

use std::path::{Path, PathBuf};

use forge_types::ResultType;
use thiserror::Error;

/// A transfer field was assigned twice.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("{field} is already set")]
pub struct SetOnceError {
    field: &'static str,
}

/// One result set's transfer state.
#[derive(Debug)]
pub struct RemoteResult {
    result_type: ResultType,
    agent_dir: Option<PathBuf>,
    master_dir: Option<PathBuf>,
    temp_archive_file: Option<PathBuf>,
}

impl RemoteResult {
    pub fn new(result_type: ResultType) -> Self {
        Self {
            result_type,
            agent_dir: None,
            master_dir: None,
            temp_archive_file: None,
        }
    }

    pub fn result_type(&self) -> ResultType {
        self.result_type
    }

    pub fn agent_dir(&self) -> Option<&Path> {
        self.agent_dir.as_deref()
    }

    pub fn set_agent_dir(&mut self, dir: PathBuf) -> Result<(), SetOnceError> {
        set_once(&mut self.agent_dir, dir, "agent dir")
    }

    pub fn master_dir(&self) -> Option<&Path> {
        self.master_dir.as_deref()
    }

    pub fn set_master_dir(&mut self, dir: PathBuf) -> Result<(), SetOnceError> {
        set_once(&mut self.master_dir, dir, "master dir")
    }

    pub fn temp_archive_file(&self) -> Option<&Path> {
        self.temp_archive_file.as_deref()
    }

    pub fn set_temp_archive_file(&mut self, file: PathBuf) -> Result<(), SetOnceError> {
        set_once(&mut self.temp_archive_file, file, "temp archive file")
    }

    /// Forget the temp archive after it has been unpacked and deleted; the
    /// slot becomes assignable again for a subsequent transfer.
    pub fn reset_temp_archive_file(&mut self) {
        self.temp_archive_file = None;
    }
}

fn set_once(
    slot: &mut Option<PathBuf>,
    value: PathBuf,
    field: &'static str,
) -> Result<(), SetOnceError> {
    if slot.is_some() {
        return Err(SetOnceError { field });
    }
    *slot = Some(value);
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn fields_are_set_once_even_with_the_same_value() {
        let mut result = RemoteResult::new(ResultType::Logs);
        result.set_master_dir(PathBuf::from("logs")).unwrap();
        assert_eq!(result.master_dir(), Some(Path::new("logs")));
        assert!(result.set_master_dir(PathBuf::from("logs")).is_err());
        assert!(result.set_master_dir(PathBuf::from("other")).is_err());
    }

    #[test]
    fn temp_archive_slot_is_reusable_after_reset() {
        let mut result = RemoteResult::new(ResultType::Output);
        result
            .set_temp_archive_file(PathBuf::from("a.zip"))
            .unwrap();
        assert!(result.set_temp_archive_file(PathBuf::from("b.zip")).is_err());

        result.reset_temp_archive_file();
        assert_eq!(result.temp_archive_file(), None);
        result
            .set_temp_archive_file(PathBuf::from("b.zip"))
            .unwrap();
    }
}
