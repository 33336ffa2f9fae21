//! Mapping request paths to dev server targets

use crate::gate::ForwardingGate;
use std::sync::Arc;

/// Remainder of `path` after `prefix` when the prefix ends on a segment
/// boundary. Matching ignores ASCII case.
pub fn strip_segment_prefix<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    if path.len() < prefix.len() || !path.is_char_boundary(prefix.len()) {
        return None;
    }
    let (head, rest) = path.split_at(prefix.len());
    if !head.eq_ignore_ascii_case(prefix) {
        return None;
    }
    if rest.is_empty() || rest.starts_with('/') {
        Some(rest)
    } else {
        None
    }
}

/// Routes each request to the gate with the longest matching public path,
/// falling back to the target mounted without one
#[derive(Default)]
pub struct TargetRouter {
    mounted: Vec<(String, Arc<ForwardingGate>)>,
    fallback: Option<Arc<ForwardingGate>>,
}

impl TargetRouter {
    /// Build a router from every configured gate
    pub fn new(gates: impl IntoIterator<Item = Arc<ForwardingGate>>) -> Self {
        let mut router = Self::default();
        for gate in gates {
            match gate.target().public_path.clone() {
                Some(prefix) => router.mounted.push((prefix, gate)),
                None => router.fallback = Some(gate),
            }
        }
        router.mounted.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        router
    }

    pub fn is_empty(&self) -> bool {
        self.mounted.is_empty() && self.fallback.is_none()
    }

    /// Gate responsible for `path`, if any
    pub fn route(&self, path: &str) -> Option<&Arc<ForwardingGate>> {
        self.mounted
            .iter()
            .find(|(prefix, _)| strip_segment_prefix(path, prefix).is_some())
            .map(|(_, gate)| gate)
            .or(self.fallback.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TargetConfig;
    use crate::forwarder::HttpForwarder;
    use crate::pool::PoolConfig;
    use crate::supervisor::tests::{FakeLauncher, ScriptedProbe};
    use crate::supervisor::SupervisorRegistry;
    use std::path::Path;
    use tokio::sync::watch;

    fn gate(registry: &Arc<SupervisorRegistry>, name: &str, public_path: Option<&str>) -> Arc<ForwardingGate> {
        let mut config = TargetConfig::new("http://127.0.0.1:3000", "npm start");
        if let Some(path) = public_path {
            config = config.with_public_path(path);
        }
        let target = config.resolve(name, &Default::default(), Path::new("."));
        let forwarder = Arc::new(HttpForwarder::new(PoolConfig::default()).unwrap());
        Arc::new(ForwardingGate::new(Arc::new(target), Arc::clone(registry), forwarder))
    }

    fn registry() -> Arc<SupervisorRegistry> {
        let (_tx, rx) = watch::channel(false);
        SupervisorRegistry::new(
            Arc::new(FakeLauncher::default()),
            Arc::new(ScriptedProbe::never()),
            rx,
        )
    }

    fn routed_name(router: &TargetRouter, path: &str) -> Option<String> {
        router.route(path).map(|g| g.target().name.clone())
    }

    #[test]
    fn test_strip_segment_prefix() {
        assert_eq!(strip_segment_prefix("/one", "/one"), Some(""));
        assert_eq!(strip_segment_prefix("/one/app.js", "/one"), Some("/app.js"));
        assert_eq!(strip_segment_prefix("/ONE/app.js", "/one"), Some("/app.js"));
        assert_eq!(strip_segment_prefix("/oneself", "/one"), None);
        assert_eq!(strip_segment_prefix("/on", "/one"), None);
    }

    #[test]
    fn test_longest_prefix_wins() {
        let registry = registry();
        let router = TargetRouter::new(vec![
            gate(&registry, "app", Some("app")),
            gate(&registry, "admin", Some("app/admin")),
        ]);

        assert_eq!(routed_name(&router, "/app/admin/users").as_deref(), Some("admin"));
        assert_eq!(routed_name(&router, "/app/home").as_deref(), Some("app"));
        assert_eq!(routed_name(&router, "/app").as_deref(), Some("app"));
        assert_eq!(routed_name(&router, "/application"), None);
    }

    #[test]
    fn test_fallback_target() {
        let registry = registry();
        let router = TargetRouter::new(vec![
            gate(&registry, "root", None),
            gate(&registry, "one", Some("/one/")),
        ]);

        assert_eq!(routed_name(&router, "/one/main.js").as_deref(), Some("one"));
        assert_eq!(routed_name(&router, "/").as_deref(), Some("root"));
        assert_eq!(routed_name(&router, "/other/page").as_deref(), Some("root"));
    }

    #[test]
    fn test_empty_router() {
        let router = TargetRouter::default();
        assert!(router.is_empty());
        assert!(router.route("/").is_none());
    }
}
