//! Device identity used to index registered transports.

use std::fmt;
use std::str::FromStr;

use crate::error::ProtocolError;

/// `tenant_id:device_id` pair identifying one registered transport.
///
/// Both parts are non-empty. The tenant part may not contain `:`; the
/// device part is everything after the first separator.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceKey {
    tenant: String,
    device: String,
}

impl DeviceKey {
    /// Builds a key from its two parts.
    pub fn new(tenant: impl Into<String>, device: impl Into<String>) -> Result<Self, ProtocolError> {
        let tenant = tenant.into();
        let device = device.into();
        if tenant.is_empty() || device.is_empty() {
            return Err(ProtocolError::InvalidKey(format!("{tenant}:{device}")));
        }
        if tenant.contains(':') {
            return Err(ProtocolError::InvalidKey(format!(
                "tenant must not contain ':': {tenant}"
            )));
        }
        Ok(Self { tenant, device })
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub fn device(&self) -> &str {
        &self.device
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tenant, self.device)
    }
}

impl FromStr for DeviceKey {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((tenant, device)) => DeviceKey::new(tenant, device),
            None => Err(ProtocolError::InvalidKey(s.to_string())),
        }
    }
}
