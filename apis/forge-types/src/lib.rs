// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared types for the forge build coordination services.
//!
//! This crate contains the common data structures used by the build agent
//! (which runs builds on worker machines), the registry (where agents
//! advertise themselves), and the coordinator (which discovers, claims, and
//! dispatches work to agents).

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::Display;
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// Type Aliases
// ============================================================================

/// Unique identity of a registered service (stable for the process lifetime
/// of the advertising agent).
pub type ServiceId = Uuid;

// ============================================================================
// Attribute Entries
// ============================================================================

/// A single name/value property describing an agent (e.g. `os.name=Linux`).
///
/// A set of entries forms a match template: matching is logical AND over
/// equality of all entries, with no wildcards or ranges.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct AttributeEntry {
    /// Property name (unique within one template)
    pub name: String,
    /// Property value
    pub value: String,
}

impl AttributeEntry {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Errors from parsing an attribute search string.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AttributeParseError {
    /// A token had no `=` separator
    #[error("attribute entry '{0}' is missing '='")]
    MissingSeparator(String),

    /// A token had an empty name part
    #[error("attribute entry '{0}' has an empty name")]
    EmptyName(String),

    /// Two entries used the same name
    #[error("duplicate attribute entry name '{0}'")]
    DuplicateName(String),
}

/// Parse a semicolon-delimited search string (`"os.name=Linux;arch=x64"`)
/// into attribute entries.
///
/// Each token is split on the first `=`; whitespace is trimmed from both the
/// name and the value. Empty tokens are skipped, so a trailing `;` is
/// harmless. An empty (or all-whitespace) search string yields an empty
/// match-all template. Entry names must be unique within one template.
pub fn parse_attribute_entries(search: &str) -> Result<Vec<AttributeEntry>, AttributeParseError> {
    let mut entries: Vec<AttributeEntry> = Vec::new();

    for token in search.split(';') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }

        let (name, value) = token
            .split_once('=')
            .ok_or_else(|| AttributeParseError::MissingSeparator(token.to_string()))?;

        let name = name.trim();
        let value = value.trim();
        if name.is_empty() {
            return Err(AttributeParseError::EmptyName(token.to_string()));
        }
        if entries.iter().any(|e| e.name == name) {
            return Err(AttributeParseError::DuplicateName(name.to_string()));
        }

        entries.push(AttributeEntry::new(name, value));
    }

    Ok(entries)
}

/// Check whether `attributes` satisfies `template`: every template entry must
/// be present with an equal value. An empty template matches everything.
pub fn template_matches(template: &[AttributeEntry], attributes: &[AttributeEntry]) -> bool {
    template.iter().all(|want| {
        attributes
            .iter()
            .any(|have| have.name == want.name && have.value == want.value)
    })
}

// ============================================================================
// Registry Types
// ============================================================================

/// Capability type of a registered service. Part of the match template; a
/// lookup never returns services of a different kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ServiceKind {
    /// A worker process exposing the build agent contract
    BuildAgent,
}

/// An agent's advertisement, as held by a registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AgentRegistration {
    /// Unique service identity
    pub service_id: ServiceId,
    /// Capability type
    pub kind: ServiceKind,
    /// Hostname of the machine the agent runs on
    pub machine_name: String,
    /// Base URL for invoking the agent contract (e.g. `http://host:7980`)
    pub base_url: String,
    /// Descriptive attributes used for template matching
    pub attributes: Vec<AttributeEntry>,
}

/// Reply to a successful registration or renewal.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RegistrationReply {
    /// How long the registration is valid without a renewal, in seconds
    pub lease_secs: u64,
}

/// One change to a registry's service table.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", content = "body")]
#[serde(rename_all = "snake_case")]
pub enum RegistryEventKind {
    /// A service joined the registry
    Added(AgentRegistration),
    /// A service left (deregistered or lease expired)
    Removed { service_id: ServiceId },
    /// A service's advertisement changed
    Changed(AgentRegistration),
}

/// A change event with its position in the registry's event sequence.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RegistryEvent {
    /// Monotonic sequence number, per registry
    pub seq: u64,
    /// What changed
    pub body: RegistryEventKind,
}

/// A batch of events returned by the registry's long-poll endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EventBatch {
    /// Events after the caller's `after_seq`, in sequence order
    pub events: Vec<RegistryEvent>,
    /// Pass this as `after_seq` on the next poll
    pub next_seq: u64,
    /// True when the caller fell behind the retained event window. The
    /// batch then carries the full current table as `Added` events, and the
    /// caller must discard everything it previously learned from this
    /// registry before applying them.
    pub reset: bool,
}

// ============================================================================
// Agent Types
// ============================================================================

/// A deferred kill/restart requested while a build was in flight.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Display,
)]
#[strum(serialize_all = "snake_case")]
pub enum PendingAction {
    /// Nothing pending
    #[default]
    None,
    /// Shut down when the claim is released
    Kill,
    /// Restart when the claim is released
    Restart,
}

/// Snapshot of an agent's state, fetched freshly on every call.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AgentStatus {
    /// Hostname of the agent machine
    pub machine_name: String,
    /// Whether the agent is claimed or building
    pub busy: bool,
    /// Module of the build in progress, if any
    pub module: Option<String>,
    /// Deferred kill/restart, if any
    pub pending_action: PendingAction,
}

/// Parameters for dispatching one build to an agent.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BuildParams {
    /// Module (project) being built; used for logging and status
    pub module: String,
    /// Target override passed through to the build execution engine
    pub override_target: Option<String>,
    /// Project properties passed through to the build execution engine
    #[serde(default)]
    pub project_properties: BTreeMap<String, String>,
    /// Agent-side directory the build writes logs into; agent default when
    /// unset
    pub agent_log_dir: Option<String>,
    /// Agent-side directory the build writes output artifacts into; agent
    /// default when unset
    pub agent_output_dir: Option<String>,
}

/// Result of one build run, returned when the dispatch call completes.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BuildReport {
    /// Module that was built
    pub module: String,
    /// Target that was run, if overridden
    pub target: Option<String>,
    /// Whether the build succeeded
    pub succeeded: bool,
    /// Human-readable summary from the build execution engine
    pub summary: String,
    /// Wall-clock build duration in milliseconds
    pub duration_ms: u64,
}

/// Body for the kill/restart operations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema)]
pub struct ShutdownParams {
    /// When true and a build is in flight, defer the action until the claim
    /// is released; otherwise act immediately.
    pub wait_for_build_to_finish: bool,
}

// ============================================================================
// Result Transfer Types
// ============================================================================

/// The named result sets an agent produces per build.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
    Display,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ResultType {
    /// Build logs
    Logs,
    /// Build output artifacts
    Output,
}

/// A packaged result set in transit from agent to coordinator.
///
/// The zip bytes travel base64-encoded inside the JSON payload. `exists` is
/// false when the agent had nothing to transfer for this result type (an
/// empty source directory never produces an archive).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ResultArchive {
    /// Which result set this is
    pub result_type: ResultType,
    /// Whether an archive was produced
    pub exists: bool,
    /// Base64-encoded zip bytes when `exists` is true
    pub zip_base64: Option<String>,
}

/// Error decoding a received [`ResultArchive`].
#[derive(Debug, Error)]
#[error("result archive payload is not valid base64: {0}")]
pub struct ArchiveDecodeError(#[from] base64::DecodeError);

impl ResultArchive {
    /// An archive payload for "nothing to transfer".
    pub fn absent(result_type: ResultType) -> Self {
        Self {
            result_type,
            exists: false,
            zip_base64: None,
        }
    }

    /// Wrap raw zip bytes for transport.
    pub fn from_bytes(result_type: ResultType, bytes: &[u8]) -> Self {
        Self {
            result_type,
            exists: true,
            zip_base64: Some(BASE64.encode(bytes)),
        }
    }

    /// Decode the transported bytes; `None` when nothing was transferred.
    pub fn decode(&self) -> Result<Option<Vec<u8>>, ArchiveDecodeError> {
        match (&self.zip_base64, self.exists) {
            (Some(b64), true) => Ok(Some(BASE64.decode(b64)?)),
            _ => Ok(None),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parse_entries_in_order_with_trimming() {
        let entries = parse_attribute_entries(" os.name = Linux ; arch=x64").unwrap();
        assert_eq!(
            entries,
            vec![
                AttributeEntry::new("os.name", "Linux"),
                AttributeEntry::new("arch", "x64"),
            ]
        );
    }

    #[test]
    fn parse_empty_search_is_match_all() {
        assert!(parse_attribute_entries("").unwrap().is_empty());
        assert!(parse_attribute_entries("  ").unwrap().is_empty());
        // trailing semicolon is harmless
        assert_eq!(parse_attribute_entries("a=1;").unwrap().len(), 1);
    }

    #[test]
    fn parse_splits_on_first_equals() {
        let entries = parse_attribute_entries("cmd=a=b").unwrap();
        assert_eq!(entries, vec![AttributeEntry::new("cmd", "a=b")]);
    }

    #[test]
    fn parse_rejects_bad_tokens() {
        assert_eq!(
            parse_attribute_entries("no-separator"),
            Err(AttributeParseError::MissingSeparator(
                "no-separator".to_string()
            ))
        );
        assert_eq!(
            parse_attribute_entries("=value"),
            Err(AttributeParseError::EmptyName("=value".to_string()))
        );
        assert_eq!(
            parse_attribute_entries("a=1;a=2"),
            Err(AttributeParseError::DuplicateName("a".to_string()))
        );
    }

    #[test]
    fn template_matching_is_and_over_equality() {
        let attrs = vec![
            AttributeEntry::new("os.name", "Linux"),
            AttributeEntry::new("arch", "x64"),
        ];

        assert!(template_matches(&[], &attrs));
        assert!(template_matches(
            &[AttributeEntry::new("os.name", "Linux")],
            &attrs
        ));
        assert!(!template_matches(
            &[
                AttributeEntry::new("os.name", "Linux"),
                AttributeEntry::new("arch", "arm64"),
            ],
            &attrs
        ));
        assert!(!template_matches(
            &[AttributeEntry::new("missing", "x")],
            &attrs
        ));
    }

    #[test]
    fn result_archive_round_trip() {
        let bytes = b"PK\x03\x04fake-zip-bytes";
        let archive = ResultArchive::from_bytes(ResultType::Logs, bytes);
        assert!(archive.exists);
        assert_eq!(archive.decode().unwrap().as_deref(), Some(&bytes[..]));

        let absent = ResultArchive::absent(ResultType::Output);
        assert_eq!(absent.decode().unwrap(), None);
    }

    #[test]
    fn result_type_display_is_snake_case() {
        assert_eq!(ResultType::Logs.to_string(), "logs");
        assert_eq!(ResultType::Output.to_string(), "output");
    }

    #[test]
    fn registry_event_serialization() {
        let event = RegistryEvent {
            seq: 7,
            body: RegistryEventKind::Removed {
                service_id: Uuid::nil(),
            },
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""kind":"removed""#));
        assert!(json.contains(r#""seq":7"#));
    }
}
