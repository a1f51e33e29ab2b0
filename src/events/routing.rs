use std::collections::HashMap;

/// Routing keys of the process service, keyed by event type
const PROCESS_SERVICE_ROUTES: &[(&str, &str)] = &[
    ("process.created", "process.created"),
    ("process.updated", "process.updated"),
    ("process.archived", "process.archived"),
    ("process.reactivated", "process.reactivated"),
    ("process.monitoring.enabled", "process.monitoring.enabled"),
    ("process.monitoring.disabled", "process.monitoring.disabled"),
    ("process.synced", "process.sync.completed"),
    ("process.batch.sync.started", "process.sync.batch.started"),
    ("process.batch.sync.completed", "process.sync.batch.completed"),
    ("movement.created", "movement.created"),
    ("movement.analyzed", "movement.analyzed"),
    ("movement.important.detected", "movement.important.detected"),
    ("party.added", "party.added"),
    ("party.updated", "party.updated"),
];

/// Maps event types to broker routing keys
///
/// Types without an explicit entry route with the type string itself, so every event is
/// routable and the same type always yields the same key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingTable {
    routes: HashMap<String, String>,
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::process_service()
    }
}

impl RoutingTable {
    /// Table without explicit routes; every type routes as itself
    pub fn empty() -> Self {
        Self {
            routes: HashMap::new(),
        }
    }

    /// The process service routes (`process.synced` goes out as `process.sync.completed`, ...)
    pub fn process_service() -> Self {
        PROCESS_SERVICE_ROUTES
            .iter()
            .fold(Self::empty(), |table, (event_type, key)| {
                table.with_route(*event_type, *key)
            })
    }

    pub fn with_route(mut self, event_type: impl Into<String>, routing_key: impl Into<String>) -> Self {
        self.routes.insert(event_type.into(), routing_key.into());
        self
    }

    pub fn routing_key<'a>(&'a self, event_type: &'a str) -> &'a str {
        self.routes
            .get(event_type)
            .map(String::as_str)
            .unwrap_or(event_type)
    }

    pub fn has_route(&self, event_type: &str) -> bool {
        self.routes.contains_key(event_type)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
