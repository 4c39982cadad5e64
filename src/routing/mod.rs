use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Immutable route entry, built once at startup from configuration.
#[derive(Debug, Clone)]
pub struct ServiceRoute {
    pub name: String,
    pub upstream_base_url: String,
    pub timeout: Duration,
    pub public: bool,
    pub required_scopes: HashSet<String>,
}

/// Maps the `<service>` segment of `/api/<service>/<rest...>` to its route.
/// Read-only after construction — no interior mutability, no locking on the
/// request path.
pub struct RouteTable {
    routes: HashMap<String, ServiceRoute>,
}

impl RouteTable {
    pub fn new(routes: Vec<ServiceRoute>) -> Self {
        Self {
            routes: routes.into_iter().map(|r| (r.name.clone(), r)).collect(),
        }
    }

    pub fn resolve(&self, path: &str) -> Option<(&ServiceRoute, &str)> {
        let rest = path.strip_prefix("/api/")?;
        let (service, remainder) = match rest.split_once('/') {
            Some((svc, r)) => (svc, r),
            None => (rest, ""),
        };
        let route = self.routes.get(service)?;
        Some((route, remainder))
    }

    pub fn all(&self) -> impl Iterator<Item = &ServiceRoute> {
        self.routes.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(name: &str) -> ServiceRoute {
        ServiceRoute {
            name: name.to_string(),
            upstream_base_url: format!("http://{name}.internal"),
            timeout: Duration::from_secs(5),
            public: false,
            required_scopes: HashSet::new(),
        }
    }

    #[test]
    fn resolves_a_configured_service_and_strips_prefix() {
        let table = RouteTable::new(vec![route("users")]);
        let (matched, rest) = table.resolve("/api/users/42/profile").unwrap();
        assert_eq!(matched.name, "users");
        assert_eq!(rest, "42/profile");
    }

    #[test]
    fn resolves_with_no_trailing_path() {
        let table = RouteTable::new(vec![route("users")]);
        let (matched, rest) = table.resolve("/api/users").unwrap();
        assert_eq!(matched.name, "users");
        assert_eq!(rest, "");
    }

    #[test]
    fn unknown_service_returns_none() {
        let table = RouteTable::new(vec![route("users")]);
        assert!(table.resolve("/api/nonexistent/x").is_none());
    }

    #[test]
    fn non_api_path_returns_none() {
        let table = RouteTable::new(vec![route("users")]);
        assert!(table.resolve("/health").is_none());
    }
}
