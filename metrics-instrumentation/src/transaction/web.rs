use std::{cell::RefCell, rc::Rc};

use crate::Labels;

use super::LabelSource;

#[derive(Clone, Debug)]
enum Route {
    Controller { controller: String, action: String },
    Endpoint { method: String, path: String },
}

/// Routing information of a web request.
///
/// Routing happens after the request's transaction has been created, so the environment is
/// shared: the transaction holds one clone, and the router fills in the route through another.
///
/// Controller routes are labelled `{controller, action}`.  API endpoints are labelled with
/// `controller` set to `"Grape"` and `action` set to `"<METHOD> <path>"`.
#[derive(Clone, Debug, Default)]
pub struct RequestEnv {
    route: Rc<RefCell<Option<Route>>>,
}

impl RequestEnv {
    /// Creates an unrouted `RequestEnv`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that the request was routed to a controller action.
    pub fn set_controller(&self, controller: &str, action: &str) {
        *self.route.borrow_mut() = Some(Route::Controller {
            controller: controller.to_string(),
            action: action.to_string(),
        });
    }

    /// Records that the request was routed to an API endpoint.
    pub fn set_endpoint(&self, method: &str, path: &str) {
        *self.route.borrow_mut() = Some(Route::Endpoint {
            method: method.to_ascii_uppercase(),
            path: path.to_string(),
        });
    }
}

impl LabelSource for RequestEnv {
    fn labels(&self) -> Option<Labels> {
        let route = self.route.borrow();
        match route.as_ref()? {
            Route::Controller { controller, action } => {
                Some(labels! { "controller" => controller, "action" => action })
            }
            Route::Endpoint { method, path } => {
                Some(labels! { "controller" => "Grape", "action" => format!("{method} {path}") })
            }
        }
    }
}
