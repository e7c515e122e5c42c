// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Dropshot API trait for the forge agent registry service.
//!
//! A registry is a network-visible directory where build agents advertise
//! themselves and coordinators search for them. Agents register and renew a
//! lease; coordinators take a snapshot of the table and then long-poll the
//! event stream to keep their caches current.
//!
//! ## Endpoints
//!
//! - `POST   /services` - Register an agent (returns the lease duration)
//! - `PUT    /services/{service_id}` - Renew the lease / update attributes
//! - `DELETE /services/{service_id}` - Deregister
//! - `GET    /services` - Snapshot of the current table
//! - `GET    /events` - Long-poll change events after a sequence number
//! - `POST   /destroy` - Administrative shutdown of the registry

use dropshot::{
    HttpError, HttpResponseDeleted, HttpResponseOk, HttpResponseUpdatedNoContent, Path, Query,
    RequestContext,
};
use forge_types::{AgentRegistration, EventBatch, RegistrationReply};
use schemars::JsonSchema;
use serde::Deserialize;
use uuid::Uuid;

/// Path parameters for service-specific endpoints.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ServicePath {
    /// The service id of the registration
    pub service_id: Uuid,
}

/// Query parameters for the event long-poll endpoint.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct EventsQuery {
    /// Return events with sequence numbers strictly greater than this.
    /// Pass 0 on the first poll.
    pub after_seq: u64,
    /// How long to wait for a first event before returning an empty batch,
    /// in milliseconds. 0 returns immediately.
    pub wait_millis: u64,
}

/// Forge Agent Registry API
///
/// The coordination core only requires of a registry that (a) it can be
/// found on the network (see `forge-locator`), (b) clients receive
/// add/remove/change notifications for registered services, and (c) lookups
/// return enough to invoke the agent contract remotely.
#[dropshot::api_description]
pub trait ForgeRegistryApi {
    /// Context type for request handlers
    type Context: Send + Sync + 'static;

    /// Register an agent
    ///
    /// Emits an `Added` event. Re-registering an existing service id renews
    /// its lease and emits `Changed` if the advertisement differs.
    #[endpoint {
        method = POST,
        path = "/services",
        tags = ["services"],
    }]
    async fn register(
        rqctx: RequestContext<Self::Context>,
        body: dropshot::TypedBody<AgentRegistration>,
    ) -> Result<HttpResponseOk<RegistrationReply>, HttpError>;

    /// Renew a lease, optionally updating the advertisement
    ///
    /// Returns 404 when the service id is unknown (the lease already
    /// expired); the agent must then re-register.
    #[endpoint {
        method = PUT,
        path = "/services/{service_id}",
        tags = ["services"],
    }]
    async fn renew(
        rqctx: RequestContext<Self::Context>,
        path: Path<ServicePath>,
        body: dropshot::TypedBody<AgentRegistration>,
    ) -> Result<HttpResponseOk<RegistrationReply>, HttpError>;

    /// Deregister an agent
    ///
    /// Emits a `Removed` event. Deregistering an unknown id is a no-op
    /// (the lease sweeper may have got there first).
    #[endpoint {
        method = DELETE,
        path = "/services/{service_id}",
        tags = ["services"],
    }]
    async fn deregister(
        rqctx: RequestContext<Self::Context>,
        path: Path<ServicePath>,
    ) -> Result<HttpResponseDeleted, HttpError>;

    /// Snapshot of all live registrations
    #[endpoint {
        method = GET,
        path = "/services",
        tags = ["services"],
    }]
    async fn list_services(
        rqctx: RequestContext<Self::Context>,
    ) -> Result<HttpResponseOk<Vec<AgentRegistration>>, HttpError>;

    /// Long-poll for change events
    ///
    /// Blocks up to `wait_millis` for the first event past `after_seq`. A
    /// caller that has fallen behind the retained window receives a `reset`
    /// batch carrying the full table.
    #[endpoint {
        method = GET,
        path = "/events",
        tags = ["events"],
    }]
    async fn poll_events(
        rqctx: RequestContext<Self::Context>,
        query: Query<EventsQuery>,
    ) -> Result<HttpResponseOk<EventBatch>, HttpError>;

    /// Administrative shutdown
    ///
    /// Out of the coordination hot path; tears the registry down. Watching
    /// clients observe the loss as a transport error and re-locate.
    #[endpoint {
        method = POST,
        path = "/destroy",
        tags = ["admin"],
    }]
    async fn destroy(
        rqctx: RequestContext<Self::Context>,
    ) -> Result<HttpResponseUpdatedNoContent, HttpError>;
}
