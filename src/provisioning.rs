//! Provisioning reload surface.
//!
//! Backs `POST /admin/provisioning/{class}/reload`. The HTTP binding lives
//! with the host; this module decides the status code.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Action required to trigger a reload.
pub const RELOAD_ACTION: &str = "provisioning:reload";

/// Kinds of provisioned entities that can be reloaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProvisioningClass {
    /// Dashboards.
    Dashboards,
    /// Data sources.
    Datasources,
    /// Plugins.
    Plugins,
    /// Legacy alert notifiers.
    Notifications,
    /// Access control roles.
    AccessControl,
}

impl ProvisioningClass {
    /// All classes.
    pub const ALL: [ProvisioningClass; 5] = [
        Self::Dashboards,
        Self::Datasources,
        Self::Plugins,
        Self::Notifications,
        Self::AccessControl,
    ];

    /// Path segment of the class.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dashboards => "dashboards",
            Self::Datasources => "datasources",
            Self::Plugins => "plugins",
            Self::Notifications => "notifications",
            Self::AccessControl => "accesscontrol",
        }
    }

    /// Permission scope guarding the class.
    pub fn scope(&self) -> String {
        format!("provisioners:{}", self.as_str())
    }
}

impl fmt::Display for ProvisioningClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProvisioningClass {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| Error::NotFound(format!("provisioning class {s}")))
    }
}

/// A granted permission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Permission {
    /// Action, e.g. `provisioning:reload`.
    pub action: String,
    /// Scope, e.g. `provisioners:plugins` or `provisioners:*`.
    pub scope: String,
}

impl Permission {
    /// Create a permission.
    pub fn new(action: impl Into<String>, scope: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            scope: scope.into(),
        }
    }

    /// True if this permission grants `action` on `scope`.
    ///
    /// A scope ending in `*` matches every scope with that prefix.
    pub fn grants(&self, action: &str, scope: &str) -> bool {
        if self.action != action {
            return false;
        }
        match self.scope.strip_suffix('*') {
            Some(prefix) => scope.starts_with(prefix),
            None => self.scope == scope,
        }
    }
}

/// An authenticated caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Principal {
    /// Login name.
    pub login: String,
    /// Granted permissions.
    pub permissions: Vec<Permission>,
}

impl Principal {
    /// Create a principal without permissions.
    pub fn new(login: impl Into<String>) -> Self {
        Self {
            login: login.into(),
            permissions: Vec::new(),
        }
    }

    /// Grant a permission.
    pub fn with_permission(mut self, action: impl Into<String>, scope: impl Into<String>) -> Self {
        self.permissions.push(Permission::new(action, scope));
        self
    }

    /// True if any permission grants `action` on `scope`.
    pub fn can(&self, action: &str, scope: &str) -> bool {
        self.permissions.iter().any(|p| p.grants(action, scope))
    }
}

/// Something that can re-read its provisioning sources.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Reload and return once the new state is in effect.
    async fn reload(&self, cancel: &CancellationToken) -> Result<()>;
}

/// Outcome of a reload request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadStatus {
    /// Reload completed.
    Ok,
    /// No authenticated principal.
    Unauthenticated,
    /// Principal lacks the reload permission.
    Forbidden,
    /// Unknown provisioning class.
    UnknownClass(String),
    /// Reload failed.
    Failed(String),
}

impl ReloadStatus {
    /// HTTP status code.
    pub fn code(&self) -> u16 {
        match self {
            Self::Ok => 200,
            Self::Unauthenticated => 401,
            Self::Forbidden => 403,
            Self::UnknownClass(_) => 404,
            Self::Failed(_) => 500,
        }
    }

    /// Response message.
    pub fn message(&self) -> String {
        match self {
            Self::Ok => "reload completed".to_string(),
            Self::Unauthenticated => "unauthorized".to_string(),
            Self::Forbidden => "permission denied".to_string(),
            Self::UnknownClass(class) => format!("unknown provisioning class: {class}"),
            Self::Failed(reason) => reason.clone(),
        }
    }

    /// True for a 200 response.
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// Dispatches reload requests to provisioners.
#[derive(Default)]
pub struct ProvisioningService {
    provisioners: HashMap<ProvisioningClass, Arc<dyn Provisioner>>,
    fine_grained_access: bool,
}

impl ProvisioningService {
    /// Create a service. With `fine_grained_access`, callers need the reload
    /// permission on the class scope.
    pub fn new(fine_grained_access: bool) -> Self {
        Self {
            provisioners: HashMap::new(),
            fine_grained_access,
        }
    }

    /// Register the provisioner for a class.
    pub fn with_provisioner(mut self, class: ProvisioningClass, provisioner: Arc<dyn Provisioner>) -> Self {
        self.provisioners.insert(class, provisioner);
        self
    }

    /// Reload `class` on behalf of `principal`.
    pub async fn reload(
        &self,
        principal: Option<&Principal>,
        class: ProvisioningClass,
        cancel: &CancellationToken,
    ) -> ReloadStatus {
        let Some(principal) = principal else {
            return ReloadStatus::Unauthenticated;
        };

        if self.fine_grained_access && !principal.can(RELOAD_ACTION, &class.scope()) {
            tracing::debug!(login = %principal.login, class = %class, "reload permission denied");
            return ReloadStatus::Forbidden;
        }

        let Some(provisioner) = self.provisioners.get(&class) else {
            return ReloadStatus::Failed(format!("no provisioner for {class}"));
        };

        match provisioner.reload(cancel).await {
            Ok(()) => {
                tracing::info!(login = %principal.login, class = %class, "provisioning reloaded");
                ReloadStatus::Ok
            }
            Err(err) => {
                tracing::warn!(class = %class, error = %err, "provisioning reload failed");
                ReloadStatus::Failed(err.to_string())
            }
        }
    }

    /// Reload by path segment, as received from the router.
    pub async fn reload_path(
        &self,
        principal: Option<&Principal>,
        class: &str,
        cancel: &CancellationToken,
    ) -> ReloadStatus {
        match class.parse() {
            Ok(class) => self.reload(principal, class, cancel).await,
            Err(_) => ReloadStatus::UnknownClass(class.to_string()),
        }
    }
}

impl fmt::Debug for ProvisioningService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut classes: Vec<_> = self.provisioners.keys().copied().collect();
        classes.sort();
        f.debug_struct("ProvisioningService")
            .field("classes", &classes)
            .field("fine_grained_access", &self.fine_grained_access)
            .finish()
    }
}
