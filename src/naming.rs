// Environment identity and per-environment resource names
use std::fmt;
use uuid::Uuid;

/// Random 128-bit token shared by every resource of one environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EnvironmentId(Uuid);

impl EnvironmentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Hex form without hyphens, safe in container and network names
    pub fn as_simple(&self) -> String {
        self.0.simple().to_string()
    }
}

impl Default for EnvironmentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EnvironmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// `<role><EnvironmentId>`, unique per environment
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceName(String);

impl ResourceName {
    /// Derive a name for `role` within environment `id`
    ///
    /// Docker names are lowercase alphanumeric, so the role is sanitized the
    /// same way compose project names are.
    pub fn derive(role: &str, id: &EnvironmentId) -> Self {
        Self(format!("{}{}", sanitize_role(role), id.as_simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ResourceName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Lowercase alphanumerics only, as accepted in container names
pub fn sanitize_role(role: &str) -> String {
    role.to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect()
}

/// Container role for a service's application container
pub fn service_role(service: &str) -> String {
    format!("tmp{}", service)
}

/// Container role for a service's backing data store
pub fn store_role(service: &str) -> String {
    format!("tmp{}db", service)
}

/// Role used for the environment's network
pub const NETWORK_ROLE: &str = "tmpnet";
