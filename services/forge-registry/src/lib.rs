// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Forge Registry Library
//!
//! The registry is a small directory service. Build agents register
//! themselves with a lease and renew it periodically; coordinators list the
//! table and long-poll the change-event stream to keep discovery caches
//! current. State is in memory only: a restarted registry simply starts
//! empty and agents re-register on their next renewal failure.
//!
//! # Modules
//!
//! - [`config`] - Registry configuration (lease length, event window)
//! - [`context`] - Service table, event log and lease sweeper

pub mod config;
pub mod context;

use std::time::Duration;

use dropshot::{
    HttpError, HttpResponseDeleted, HttpResponseOk, HttpResponseUpdatedNoContent, Path, Query,
    RequestContext,
};
use forge_registry_api::{EventsQuery, ForgeRegistryApi, ServicePath};
use forge_types::{AgentRegistration, EventBatch, RegistrationReply};

use crate::context::ApiContext;

/// Upper bound on a single long-poll's wait, regardless of what the caller
/// asked for.
const MAX_POLL_WAIT: Duration = Duration::from_secs(60);

/// Forge Registry API implementation
///
/// This enum serves as the implementation type for the `ForgeRegistryApi`
/// trait. It contains no data - all state is stored in the `ApiContext`.
pub enum ForgeRegistryImpl {}

impl ForgeRegistryApi for ForgeRegistryImpl {
    type Context = ApiContext;

    async fn register(
        rqctx: RequestContext<Self::Context>,
        body: dropshot::TypedBody<AgentRegistration>,
    ) -> Result<HttpResponseOk<RegistrationReply>, HttpError> {
        let ctx = rqctx.context();
        let lease_secs = ctx.register(body.into_inner()).await;
        Ok(HttpResponseOk(RegistrationReply { lease_secs }))
    }

    async fn renew(
        rqctx: RequestContext<Self::Context>,
        path: Path<ServicePath>,
        body: dropshot::TypedBody<AgentRegistration>,
    ) -> Result<HttpResponseOk<RegistrationReply>, HttpError> {
        let ctx = rqctx.context();
        let service_id = path.into_inner().service_id;
        let registration = body.into_inner();
        if registration.service_id != service_id {
            return Err(HttpError::for_bad_request(
                None,
                format!(
                    "body service id {} does not match path {}",
                    registration.service_id, service_id
                ),
            ));
        }
        match ctx.renew(registration).await {
            Some(lease_secs) => Ok(HttpResponseOk(RegistrationReply { lease_secs })),
            None => Err(HttpError::for_not_found(
                None,
                format!("no registration for service {}", service_id),
            )),
        }
    }

    async fn deregister(
        rqctx: RequestContext<Self::Context>,
        path: Path<ServicePath>,
    ) -> Result<HttpResponseDeleted, HttpError> {
        let ctx = rqctx.context();
        ctx.deregister(path.into_inner().service_id).await;
        Ok(HttpResponseDeleted())
    }

    async fn list_services(
        rqctx: RequestContext<Self::Context>,
    ) -> Result<HttpResponseOk<Vec<AgentRegistration>>, HttpError> {
        let ctx = rqctx.context();
        Ok(HttpResponseOk(ctx.list_services().await))
    }

    async fn poll_events(
        rqctx: RequestContext<Self::Context>,
        query: Query<EventsQuery>,
    ) -> Result<HttpResponseOk<EventBatch>, HttpError> {
        let ctx = rqctx.context();
        let query = query.into_inner();
        let wait = Duration::from_millis(query.wait_millis).min(MAX_POLL_WAIT);
        Ok(HttpResponseOk(ctx.poll_events(query.after_seq, wait).await))
    }

    async fn destroy(
        rqctx: RequestContext<Self::Context>,
    ) -> Result<HttpResponseUpdatedNoContent, HttpError> {
        let ctx = rqctx.context();
        tracing::info!("destroy requested; registry shutting down");
        ctx.request_shutdown();
        Ok(HttpResponseUpdatedNoContent())
    }
}
