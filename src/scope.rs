use crate::token::Identity;
use std::cell::RefCell;
use std::rc::Rc;

/// Mutable per-request record shared along the middleware chain.
///
/// Lives exactly as long as one request and never crosses threads; every
/// stage reaches it through the [`ScopeHandle`] stored in the request
/// extensions.
#[derive(Debug, Default)]
pub struct RequestScope {
    pub identity: Option<Identity>,
    /// Set by any stage that renders a terminal decision so later stages
    /// skip expensive work.
    pub access_denied: bool,
    /// Correlation id propagated to the upstream and the logs.
    pub request_id: String,
    /// Path and query exactly as the client sent them; normalization is a
    /// gating concern, the upstream sees the original.
    pub original_uri: String,
}

#[derive(Clone, Debug, Default)]
pub struct ScopeHandle(Rc<RefCell<RequestScope>>);

impl ScopeHandle {
    pub fn new(original_uri: String) -> Self {
        Self(Rc::new(RefCell::new(RequestScope {
            original_uri,
            ..RequestScope::default()
        })))
    }

    pub fn identity(&self) -> Option<Identity> {
        self.0.borrow().identity.clone()
    }

    pub fn set_identity(&self, identity: Identity) {
        self.0.borrow_mut().identity = Some(identity);
    }

    pub fn deny(&self) {
        self.0.borrow_mut().access_denied = true;
    }

    pub fn is_denied(&self) -> bool {
        self.0.borrow().access_denied
    }

    pub fn request_id(&self) -> String {
        self.0.borrow().request_id.clone()
    }

    pub fn set_request_id(&self, id: String) {
        self.0.borrow_mut().request_id = id;
    }

    pub fn original_uri(&self) -> String {
        self.0.borrow().original_uri.clone()
    }
}
