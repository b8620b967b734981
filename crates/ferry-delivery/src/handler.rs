//! Response handlers and their registry.
//!
//! Each correlated transfer names the handler that processes its response.
//! Handlers are created per completion from a factory keyed by [`HandlerId`],
//! and are also asked whether a newer request should replace an older one
//! that is still outstanding.

use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use ferry_core::{Destination, HandlerId, HandlerResult, Notification, Request};

use crate::{
    codec::ResponseBody,
    error::{DeliveryError, Result},
};

/// Processes the decoded response of a correlated transfer.
#[async_trait]
pub trait ResponseHandler: Send + Sync {
    /// Whether `proposed` should cancel and replace the outstanding `current`
    /// request for the same destination.
    fn should_replace(&self, current: &Request, proposed: &Request) -> bool;

    /// Handles the outcome of `request`.
    async fn handle(
        &self,
        request: &Request,
        result: &Result<ResponseBody>,
    ) -> Result<HandlerResult>;
}

/// Creates a handler for a destination.
pub type HandlerFactory = Arc<dyn Fn(&Destination) -> Box<dyn ResponseHandler> + Send + Sync>;

/// Builder for the closed handler table.
#[derive(Default)]
pub struct HandlerRegistryBuilder {
    entries: Vec<(HandlerId, HandlerFactory)>,
}

impl HandlerRegistryBuilder {
    /// Creates an empty builder. [`HandlerId::UNHANDLED`] is added at build
    /// time.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler factory.
    #[must_use]
    pub fn register<F>(mut self, id: HandlerId, factory: F) -> Self
    where
        F: Fn(&Destination) -> Box<dyn ResponseHandler> + Send + Sync + 'static,
    {
        self.entries.push((id, Arc::new(factory)));
        self
    }

    /// Registers the location update and service call handlers.
    #[must_use]
    pub fn with_builtins(self) -> Self {
        self.register(HandlerId::LOCATION_UPDATE, |_| Box::new(LocationUpdateResponse))
            .register(HandlerId::SERVICE_CALL, |_| Box::new(ServiceCallResponse))
    }

    /// Builds the registry.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateHandler` if an id was registered twice, including
    /// [`HandlerId::UNHANDLED`].
    pub fn build(self) -> Result<HandlerRegistry> {
        let mut factories: HashMap<HandlerId, HandlerFactory> = HashMap::new();
        factories.insert(HandlerId::UNHANDLED, Arc::new(|_| Box::new(UnhandledResponse)));

        for (id, factory) in self.entries {
            if factories.contains_key(&id) {
                return Err(DeliveryError::DuplicateHandler { handler_id: id.to_string() });
            }
            factories.insert(id, factory);
        }

        Ok(HandlerRegistry { factories: Arc::new(factories) })
    }
}

/// Immutable table of handler factories.
#[derive(Clone)]
pub struct HandlerRegistry {
    factories: Arc<HashMap<HandlerId, HandlerFactory>>,
}

impl HandlerRegistry {
    /// Starts building a registry.
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::new()
    }

    /// Whether a handler is registered.
    pub fn contains(&self, id: &HandlerId) -> bool {
        self.factories.contains_key(id)
    }

    /// Creates the handler registered under `id`.
    ///
    /// # Errors
    ///
    /// Returns `UnregisteredHandler` for unknown ids.
    pub fn instantiate(
        &self,
        id: &HandlerId,
        destination: &Destination,
    ) -> Result<Box<dyn ResponseHandler>> {
        self.factories
            .get(id)
            .map(|factory| factory(destination))
            .ok_or_else(|| DeliveryError::unregistered_handler(id.as_str()))
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<&str> = self.factories.keys().map(HandlerId::as_str).collect();
        ids.sort_unstable();
        f.debug_struct("HandlerRegistry").field("handlers", &ids).finish()
    }
}

/// Ignores responses.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnhandledResponse;

#[async_trait]
impl ResponseHandler for UnhandledResponse {
    fn should_replace(&self, _current: &Request, _proposed: &Request) -> bool {
        false
    }

    async fn handle(
        &self,
        _request: &Request,
        _result: &Result<ResponseBody>,
    ) -> Result<HandlerResult> {
        Ok(HandlerResult::none())
    }
}

/// Location reports. Only the latest one matters, so a new report replaces
/// any that is still outstanding.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocationUpdateResponse;

/// Request type of location reports.
pub const UPDATE_LOCATION: &str = "update_location";

#[async_trait]
impl ResponseHandler for LocationUpdateResponse {
    fn should_replace(&self, current: &Request, proposed: &Request) -> bool {
        current.kind == UPDATE_LOCATION && proposed.kind == UPDATE_LOCATION
    }

    async fn handle(
        &self,
        _request: &Request,
        result: &Result<ResponseBody>,
    ) -> Result<HandlerResult> {
        match result {
            Ok(_) => tracing::debug!("location update delivered"),
            Err(e) => tracing::debug!(error = %e, "location update failed"),
        }
        Ok(HandlerResult::none())
    }
}

/// Service calls. On success, presents the notification the caller attached
/// under `local_metadata.notification`, if any.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServiceCallResponse;

#[async_trait]
impl ResponseHandler for ServiceCallResponse {
    fn should_replace(&self, _current: &Request, _proposed: &Request) -> bool {
        false
    }

    async fn handle(
        &self,
        request: &Request,
        result: &Result<ResponseBody>,
    ) -> Result<HandlerResult> {
        if result.is_err() {
            return Ok(HandlerResult::none());
        }

        let notification = request
            .local_metadata
            .as_ref()
            .and_then(|metadata| metadata.get("notification"))
            .and_then(|value| serde_json::from_value::<Notification>(value.clone()).ok());

        Ok(notification.map_or_else(HandlerResult::none, HandlerResult::notify))
    }
}
