use std::collections::HashMap;
use std::sync::Arc;

use crate::error::RegistryError;
use crate::handler::{HandlerFn, HandlerMode, HandlerSpec, STATUS_ROUTE, normalize_route};

/// Mutable registry used while the application is being composed.
pub struct RegistryBuilder<C> {
    specs: HashMap<String, HandlerSpec<C>>,
    order: Vec<String>,
}

impl<C> RegistryBuilder<C> {
    pub fn new() -> Self {
        Self {
            specs: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Register a handler. Each route holds exactly one handler, whatever its mode.
    pub fn register(
        &mut self,
        route: &str,
        mode: HandlerMode,
        handler: HandlerFn<C>,
        webhook: Option<String>,
    ) -> Result<(), RegistryError> {
        let route = normalize_route(route);
        if route == STATUS_ROUTE {
            return Err(RegistryError::ReservedRoute { route });
        }
        if self.specs.contains_key(&route) {
            return Err(RegistryError::DuplicateRoute { route });
        }
        if let Some(url) = &webhook {
            validate_webhook(&route, mode, url)?;
        }

        self.order.push(route.clone());
        self.specs.insert(
            route.clone(),
            HandlerSpec {
                route,
                mode,
                webhook,
                handler,
            },
        );
        Ok(())
    }

    /// Attach or replace the webhook target of an async route.
    pub fn set_webhook(&mut self, route: &str, url: &str) -> Result<(), RegistryError> {
        let route = normalize_route(route);
        let spec = self
            .specs
            .get_mut(&route)
            .ok_or_else(|| RegistryError::RouteNotFound(route.clone()))?;
        validate_webhook(&route, spec.mode, url)?;
        spec.webhook = Some(url.to_string());
        Ok(())
    }

    pub fn mode_of(&self, route: &str) -> Option<HandlerMode> {
        self.specs.get(&normalize_route(route)).map(|spec| spec.mode)
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Close registration. At least one handler is required.
    pub fn freeze(self) -> Result<Registry<C>, RegistryError> {
        if self.specs.is_empty() {
            return Err(RegistryError::NoHandlers);
        }
        let mut specs = self.specs;
        let order = self.order;
        let entries = order
            .iter()
            .filter_map(|route| specs.remove(route).map(|spec| (route.clone(), Arc::new(spec))))
            .collect::<HashMap<_, _>>();

        tracing::debug!("registry frozen with {} routes", entries.len());
        Ok(Registry {
            specs: entries,
            order,
        })
    }
}

impl<C> Default for RegistryBuilder<C> {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_webhook(route: &str, mode: HandlerMode, url: &str) -> Result<(), RegistryError> {
    if mode == HandlerMode::Sync {
        return Err(RegistryError::WebhookOnSyncHandler {
            route: route.to_string(),
        });
    }
    let lowered = url.to_ascii_lowercase();
    let has_host = lowered
        .strip_prefix("http://")
        .or_else(|| lowered.strip_prefix("https://"))
        .is_some_and(|rest| !rest.is_empty() && !rest.starts_with('/'));
    if !has_host {
        return Err(RegistryError::InvalidWebhookUrl {
            route: route.to_string(),
            url: url.to_string(),
        });
    }
    Ok(())
}

/// Frozen, read-only route table shared by the dispatcher.
pub struct Registry<C> {
    specs: HashMap<String, Arc<HandlerSpec<C>>>,
    order: Vec<String>,
}

impl<C> Registry<C> {
    pub fn resolve(&self, route: &str) -> Result<Arc<HandlerSpec<C>>, RegistryError> {
        let route = normalize_route(route);
        self.specs
            .get(&route)
            .cloned()
            .ok_or(RegistryError::RouteNotFound(route))
    }

    /// Routes in registration order.
    pub fn routes(&self) -> Vec<Arc<HandlerSpec<C>>> {
        self.order
            .iter()
            .filter_map(|route| self.specs.get(route).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}
