//! Upgrade request routing.

use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request};
use tokio_tungstenite::tungstenite::http::StatusCode;

use backhaul_protocol::constants::{
    HEADER_DEVICE_UID, HEADER_TENANT_ID, V1_CONNECT_PATH, V2_CONNECT_PATH,
};
use backhaul_protocol::{ConnVersion, DeviceKey};
use backhaul_revdial::{DialerRegistry, PickupQuery};

/// What an accepted upgrade is for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Route {
    /// An agent registering its transport.
    Agent { key: DeviceKey, version: ConnVersion },
    /// A pick-up connection for a live v1 dialer.
    Pickup(PickupQuery),
}

/// Why an upgrade was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Rejection {
    pub status: StatusCode,
    pub reason: String,
}

impl Rejection {
    fn new(status: StatusCode, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
        }
    }

    pub fn into_response(self) -> ErrorResponse {
        let mut response = ErrorResponse::new(Some(self.reason));
        *response.status_mut() = self.status;
        response
    }
}

pub(crate) fn route(
    req: &Request,
    registry: &DialerRegistry,
    pickup_path: &str,
) -> Result<Route, Rejection> {
    let path = req.uri().path();

    let version = if path == V1_CONNECT_PATH {
        ConnVersion::V1
    } else if path == V2_CONNECT_PATH {
        ConnVersion::V2
    } else if path == pickup_path {
        let query = PickupQuery::parse(req.uri().query().unwrap_or_default())
            .map_err(|e| Rejection::new(StatusCode::BAD_REQUEST, e.to_string()))?;
        if registry.get(&query.dialer).is_none() {
            return Err(Rejection::new(
                StatusCode::NOT_FOUND,
                format!("unknown dialer {}", query.dialer),
            ));
        }
        return Ok(Route::Pickup(query));
    } else {
        return Err(Rejection::new(StatusCode::NOT_FOUND, format!("no route for {path}")));
    };

    let tenant = header(req, HEADER_TENANT_ID)?;
    let device = header(req, HEADER_DEVICE_UID)?;
    let key = DeviceKey::new(tenant, device)
        .map_err(|e| Rejection::new(StatusCode::BAD_REQUEST, e.to_string()))?;
    Ok(Route::Agent { key, version })
}

fn header<'a>(req: &'a Request, name: &str) -> Result<&'a str, Rejection> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Rejection::new(StatusCode::BAD_REQUEST, format!("missing {name} header")))
}
