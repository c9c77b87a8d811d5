//! Static origin → destination routing

use std::collections::HashMap;

/// Immutable routing table built once at startup.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    routes: HashMap<String, String>,
    default_destination: String,
}

impl RoutingTable {
    pub fn new(routes: HashMap<String, String>, default_destination: impl Into<String>) -> Self {
        Self {
            routes,
            default_destination: default_destination.into(),
        }
    }

    /// Destination for `origin_id`, or the default when it has no route.
    pub fn resolve(&self, origin_id: &str) -> &str {
        self.routes
            .get(origin_id)
            .map(String::as_str)
            .unwrap_or(&self.default_destination)
    }

    pub fn default_destination(&self) -> &str {
        &self.default_destination
    }

    /// All distinct destinations, default included, sorted.
    pub fn destinations(&self) -> Vec<&str> {
        let mut all: Vec<&str> = self.routes.values().map(String::as_str).collect();
        all.push(&self.default_destination);
        all.sort_unstable();
        all.dedup();
        all
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.routes.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> RoutingTable {
        let mut routes = HashMap::new();
        routes.insert("-1001279597711".to_string(), "@cryptonotifs".to_string());
        routes.insert("-1001750561680".to_string(), "@equitiesnotifs".to_string());
        RoutingTable::new(routes, "@defaultnotifs")
    }

    #[test]
    fn test_resolve_mapped() {
        let t = table();
        assert_eq!(t.resolve("-1001279597711"), "@cryptonotifs");
        assert_eq!(t.resolve("-1001750561680"), "@equitiesnotifs");
    }

    #[test]
    fn test_resolve_falls_back_to_default() {
        let t = table();
        assert_eq!(t.resolve("unknown"), "@defaultnotifs");
        assert_eq!(t.resolve(""), "@defaultnotifs");
    }

    #[test]
    fn test_empty_table_always_default() {
        let t = RoutingTable::new(HashMap::new(), "@out");
        assert!(t.is_empty());
        assert_eq!(t.resolve("anything"), "@out");
    }

    #[test]
    fn test_destinations_deduplicated() {
        let t = table();
        assert_eq!(t.destinations(), vec!["@cryptonotifs", "@defaultnotifs", "@equitiesnotifs"]);
    }
}
