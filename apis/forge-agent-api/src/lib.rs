// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Dropshot API trait for the forge build agent service.
//!
//! The build agent runs on each worker machine and executes builds
//! dispatched by a coordinator. The agent:
//!
//! - Advertises itself with registries so coordinators can discover it
//! - Accepts a claim (busy flag) so only one coordinator dispatches to it
//! - Runs one build at a time, buffering console output for live tailing
//! - Packages build logs/output into zip archives for retrieval
//!
//! ## Endpoints
//!
//! - `GET  /status` - Machine identity, busy flag, pending action
//! - `POST /claim` - Mark the agent busy (409 when already claimed)
//! - `POST /builds` - Run a build; responds when the build finishes
//! - `GET  /output/id` - Current live-output session id
//! - `GET  /output/lines` - Incremental live-output lines
//! - `GET  /results/{result_type}` - Fetch a zipped result set
//! - `POST /output/clear` - Delete result files and release the claim
//! - `POST /kill`, `POST /restart` - Shut the agent down

use dropshot::{
    HttpError, HttpResponseOk, HttpResponseUpdatedNoContent, Path, Query, RequestContext,
};
use forge_types::{
    AgentStatus, BuildParams, BuildReport, ResultArchive, ResultType, ShutdownParams,
};
use schemars::JsonSchema;
use serde::Deserialize;

/// Path parameters for the result retrieval endpoint.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ResultPath {
    /// Which result set to fetch
    pub result_type: ResultType,
}

/// Query parameters for the incremental line retrieval endpoint.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct OutputLinesQuery {
    /// 0-based index of the first line to return
    pub first_line: usize,
}

/// Forge Build Agent API
///
/// This is the remote capability surface a worker exposes to coordinators.
/// All operations are synchronous calls; a transport failure means "agent
/// currently unreachable", never "build failed".
#[dropshot::api_description]
pub trait ForgeAgentApi {
    /// Context type for request handlers
    type Context: Send + Sync + 'static;

    /// Report the agent's machine identity and busy flag
    ///
    /// Coordinators call this freshly every time they evaluate an agent's
    /// availability; the busy flag is never cached on the coordinator side.
    #[endpoint {
        method = GET,
        path = "/status",
        tags = ["agent"],
    }]
    async fn get_status(
        rqctx: RequestContext<Self::Context>,
    ) -> Result<HttpResponseOk<AgentStatus>, HttpError>;

    /// Claim the agent (set the busy flag)
    ///
    /// Returns 409 Conflict when the agent is already claimed. The busy flag
    /// on the agent is the sole source of truth for "claimed".
    #[endpoint {
        method = POST,
        path = "/claim",
        tags = ["agent"],
    }]
    async fn claim(
        rqctx: RequestContext<Self::Context>,
    ) -> Result<HttpResponseUpdatedNoContent, HttpError>;

    /// Run a build
    ///
    /// The agent must already be claimed. The response is sent when the
    /// build finishes; callers that want live progress poll the output
    /// endpoints concurrently. Returns 409 Conflict when the agent is not
    /// claimed or a build is already in flight (a lost claim race).
    ///
    /// A build failure on the agent releases the claim before the error is
    /// returned.
    #[endpoint {
        method = POST,
        path = "/builds",
        tags = ["builds"],
    }]
    async fn run_build(
        rqctx: RequestContext<Self::Context>,
        body: dropshot::TypedBody<BuildParams>,
    ) -> Result<HttpResponseOk<BuildReport>, HttpError>;

    /// Current live-output session id
    ///
    /// The id rotates every time a new build starts, so a tailing client can
    /// detect discontinuity and reset its line offset.
    #[endpoint {
        method = GET,
        path = "/output/id",
        tags = ["output"],
    }]
    async fn get_output_id(
        rqctx: RequestContext<Self::Context>,
    ) -> Result<HttpResponseOk<String>, HttpError>;

    /// Retrieve buffered output lines starting at `first_line`
    ///
    /// Returns at most an internal cap of lines per call, and an empty list
    /// (never an error) when `first_line` is beyond the end of the buffer.
    #[endpoint {
        method = GET,
        path = "/output/lines",
        tags = ["output"],
    }]
    async fn retrieve_lines(
        rqctx: RequestContext<Self::Context>,
        query: Query<OutputLinesQuery>,
    ) -> Result<HttpResponseOk<Vec<String>>, HttpError>;

    /// Fetch a zipped result set produced by the last build
    ///
    /// `exists` is false in the reply when the build left nothing to
    /// transfer for this result type.
    #[endpoint {
        method = GET,
        path = "/results/{result_type}",
        tags = ["results"],
    }]
    async fn retrieve_results(
        rqctx: RequestContext<Self::Context>,
        path: Path<ResultPath>,
    ) -> Result<HttpResponseOk<ResultArchive>, HttpError>;

    /// Delete result archives and directories, then release the claim
    ///
    /// Always releases the claim, even when some files could not be
    /// removed. Executes any pending kill/restart after the release.
    #[endpoint {
        method = POST,
        path = "/output/clear",
        tags = ["results"],
    }]
    async fn clear_output_files(
        rqctx: RequestContext<Self::Context>,
    ) -> Result<HttpResponseUpdatedNoContent, HttpError>;

    /// Shut the agent process down
    ///
    /// With `wait_for_build_to_finish` set and a build in flight, the kill
    /// is deferred until the claim is released; otherwise it is immediate.
    #[endpoint {
        method = POST,
        path = "/kill",
        tags = ["agent"],
    }]
    async fn kill(
        rqctx: RequestContext<Self::Context>,
        body: dropshot::TypedBody<ShutdownParams>,
    ) -> Result<HttpResponseUpdatedNoContent, HttpError>;

    /// Restart the agent process
    ///
    /// Same deferral semantics as `kill`; the agent exits with the restart
    /// exit code and relies on its supervisor to start it again.
    #[endpoint {
        method = POST,
        path = "/restart",
        tags = ["agent"],
    }]
    async fn restart(
        rqctx: RequestContext<Self::Context>,
        body: dropshot::TypedBody<ShutdownParams>,
    ) -> Result<HttpResponseUpdatedNoContent, HttpError>;
}
