//! Interfaces of the collaborators the transport depends on.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::transport::SignalingTransport;

/// HTTP headers attached to the websocket upgrade request.
pub type AuthHeaders = Vec<(String, String)>;

/// Supplies the authorization for a new socket.
pub trait CredentialSource: Send + Sync {
    /// `None` when the user is not (or no longer) signed in.
    fn authorization(&self) -> Option<AuthHeaders>;
}

/// Dispatches call-signaling events to the call they belong to.
///
/// Invoked from the transport's event loop, one event at a time.
pub trait CallRouter: Send {
    fn route_event(&mut self, event: Value);
}

/// The lock is held while the inner router runs, including while call
/// observers are notified. Observers must read the call's phase from the
/// [`Call`](crate::call::Call) they are handed instead of locking the router.
impl<R: CallRouter> CallRouter for Arc<Mutex<R>> {
    fn route_event(&mut self, event: Value) {
        self.lock().route_event(event);
    }
}

/// Device registration. Asked to register again after an abnormal close;
/// a successful registration is expected to call
/// [`SignalingTransport::connect`] with the fresh endpoint.
pub trait Registrar: Send + Sync {
    fn reregister(&self, transport: SignalingTransport);
}

/// Refreshes media reachability once a connection is up.
pub trait ReachabilityService: Send + Sync {
    fn refresh(&self);
}

/// A fixed bearer token.
#[derive(Debug, Clone)]
pub struct StaticCredentials {
    token: Option<String>,
}

impl StaticCredentials {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
        }
    }

    pub fn none() -> Self {
        Self { token: None }
    }
}

impl CredentialSource for StaticCredentials {
    fn authorization(&self) -> Option<AuthHeaders> {
        let token = self.token.as_ref()?;
        Some(vec![(
            "Authorization".to_string(),
            format!("Bearer {token}"),
        )])
    }
}

/// Reachability for deployments without media clusters.
pub struct NoReachability;

impl ReachabilityService for NoReachability {
    fn refresh(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_credentials_build_authorization_header() {
        let headers = StaticCredentials::bearer("t0k").authorization().unwrap();
        assert_eq!(
            headers,
            vec![("Authorization".to_string(), "Bearer t0k".to_string())]
        );
        assert!(StaticCredentials::none().authorization().is_none());
    }

    struct Recorder(Vec<Value>);

    impl CallRouter for Recorder {
        fn route_event(&mut self, event: Value) {
            self.0.push(event);
        }
    }

    #[test]
    fn shared_router_forwards_to_inner() {
        let shared = Arc::new(Mutex::new(Recorder(Vec::new())));
        let mut router = shared.clone();
        router.route_event(serde_json::json!({"eventType": "locus.self_changed"}));
        assert_eq!(shared.lock().0.len(), 1);
    }
}
