// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Forge Agent Library
//!
//! This library provides the core functionality for the forge build agent
//! service. The agent runs on worker machines, advertises itself with
//! registries, and executes builds dispatched by a coordinator.
//!
//! # Modules
//!
//! - [`config`] - Agent configuration (data directory, build command)
//! - [`context`] - API context: claim state, build lifecycle, archives
//! - [`executor`] - The build execution seam and the command executor
//! - [`output`] - Live console output buffering for remote tailing
//! - [`registration`] - Self-registration with discovered registries

pub mod config;
pub mod context;
pub mod executor;
pub mod output;
pub mod registration;

use dropshot::{
    ClientErrorStatusCode, HttpError, HttpResponseOk, HttpResponseUpdatedNoContent, Path, Query,
    RequestContext,
};
use forge_agent_api::{ForgeAgentApi, OutputLinesQuery, ResultPath};
use forge_types::{AgentStatus, BuildParams, BuildReport, ResultArchive, ShutdownParams};

use crate::context::{ApiContext, BuildError};

/// Forge Agent API implementation
///
/// This enum serves as the implementation type for the `ForgeAgentApi`
/// trait. It contains no data - all state is stored in the `ApiContext`.
pub enum ForgeAgentImpl {}

impl ForgeAgentApi for ForgeAgentImpl {
    type Context = ApiContext;

    async fn get_status(
        rqctx: RequestContext<Self::Context>,
    ) -> Result<HttpResponseOk<AgentStatus>, HttpError> {
        Ok(HttpResponseOk(rqctx.context().status().await))
    }

    async fn claim(
        rqctx: RequestContext<Self::Context>,
    ) -> Result<HttpResponseUpdatedNoContent, HttpError> {
        rqctx.context().claim().await.map_err(|error| {
            HttpError::for_client_error(None, ClientErrorStatusCode::CONFLICT, error.to_string())
        })?;
        Ok(HttpResponseUpdatedNoContent())
    }

    async fn run_build(
        rqctx: RequestContext<Self::Context>,
        body: dropshot::TypedBody<BuildParams>,
    ) -> Result<HttpResponseOk<BuildReport>, HttpError> {
        let report = rqctx
            .context()
            .run_build(body.into_inner())
            .await
            .map_err(|error| match error {
                BuildError::NotClaimed | BuildError::BuildInFlight => HttpError::for_client_error(
                    None,
                    ClientErrorStatusCode::CONFLICT,
                    error.to_string(),
                ),
                BuildError::Executor(_) | BuildError::Archive { .. } => {
                    HttpError::for_internal_error(error.to_string())
                }
            })?;
        Ok(HttpResponseOk(report))
    }

    async fn get_output_id(
        rqctx: RequestContext<Self::Context>,
    ) -> Result<HttpResponseOk<String>, HttpError> {
        Ok(HttpResponseOk(rqctx.context().output_id().await))
    }

    async fn retrieve_lines(
        rqctx: RequestContext<Self::Context>,
        query: Query<OutputLinesQuery>,
    ) -> Result<HttpResponseOk<Vec<String>>, HttpError> {
        let first_line = query.into_inner().first_line;
        Ok(HttpResponseOk(
            rqctx.context().retrieve_lines(first_line).await,
        ))
    }

    async fn retrieve_results(
        rqctx: RequestContext<Self::Context>,
        path: Path<ResultPath>,
    ) -> Result<HttpResponseOk<ResultArchive>, HttpError> {
        let result_type = path.into_inner().result_type;
        let archive = rqctx
            .context()
            .retrieve_results(result_type)
            .await
            .map_err(|error| {
                HttpError::for_internal_error(format!(
                    "failed to read {result_type} archive: {error}"
                ))
            })?;
        Ok(HttpResponseOk(archive))
    }

    async fn clear_output_files(
        rqctx: RequestContext<Self::Context>,
    ) -> Result<HttpResponseUpdatedNoContent, HttpError> {
        rqctx.context().clear_output_files().await;
        Ok(HttpResponseUpdatedNoContent())
    }

    async fn kill(
        rqctx: RequestContext<Self::Context>,
        body: dropshot::TypedBody<ShutdownParams>,
    ) -> Result<HttpResponseUpdatedNoContent, HttpError> {
        rqctx
            .context()
            .kill(body.into_inner().wait_for_build_to_finish)
            .await;
        Ok(HttpResponseUpdatedNoContent())
    }

    async fn restart(
        rqctx: RequestContext<Self::Context>,
        body: dropshot::TypedBody<ShutdownParams>,
    ) -> Result<HttpResponseUpdatedNoContent, HttpError> {
        rqctx
            .context()
            .restart(body.into_inner().wait_for_build_to_finish)
            .await;
        Ok(HttpResponseUpdatedNoContent())
    }
}
