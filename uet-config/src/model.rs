//! Typed form of the persisted document: tenants, applications and the
//! encryption flag. Pure data plus validation and legacy migration; nothing
//! in here touches the filesystem or the cipher.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field} is required")]
    Missing { field: &'static str },
    #[error("{field} is required for {kind} applications")]
    MissingForType {
        field: &'static str,
        kind: ApplicationType,
    },
    #[error("application type is required")]
    MissingType,
    #[error("invalid application type: {0} (must be one of: websdk, dmp, saml, oidc)")]
    UnknownType(String),
    #[error("tenant '{0}' does not exist")]
    UnknownTenant(String),
}

impl ValidationError {
    /// Name of the offending field, when the failure is about a single field.
    pub fn field(&self) -> Option<&'static str> {
        match self {
            ValidationError::Missing { field } | ValidationError::MissingForType { field, .. } => {
                Some(*field)
            }
            ValidationError::MissingType | ValidationError::UnknownType(_) => Some("type"),
            ValidationError::UnknownTenant(_) => Some("tenant_id"),
        }
    }
}

/// The four supported application flavours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ApplicationType {
    /// Redirect-based prompt (Web SDK v4).
    #[serde(rename = "websdk")]
    WebSdk,
    /// Device management portal.
    #[serde(rename = "dmp")]
    DevicePortal,
    #[serde(rename = "saml")]
    Saml,
    #[serde(rename = "oidc")]
    Oidc,
}

impl ApplicationType {
    pub const ALL: [ApplicationType; 4] = [
        ApplicationType::WebSdk,
        ApplicationType::DevicePortal,
        ApplicationType::Saml,
        ApplicationType::Oidc,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ApplicationType::WebSdk => "websdk",
            ApplicationType::DevicePortal => "dmp",
            ApplicationType::Saml => "saml",
            ApplicationType::Oidc => "oidc",
        }
    }
}

impl fmt::Display for ApplicationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ApplicationType::WebSdk => "Web SDK",
            ApplicationType::DevicePortal => "device portal",
            ApplicationType::Saml => "SAML",
            ApplicationType::Oidc => "OIDC",
        })
    }
}

impl FromStr for ApplicationType {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "" => Err(ValidationError::MissingType),
            other => ApplicationType::ALL
                .into_iter()
                .find(|kind| kind.as_str() == other)
                .ok_or_else(|| ValidationError::UnknownType(other.to_string())),
        }
    }
}

/// An isolated account and its Admin API credentials.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tenant {
    #[serde(deserialize_with = "scalar::string")]
    pub id: String,
    #[serde(deserialize_with = "scalar::string")]
    pub name: String,
    #[serde(deserialize_with = "scalar::string")]
    pub admin_api_key: String,
    #[serde(deserialize_with = "scalar::string")]
    pub admin_api_secret: String,
    #[serde(deserialize_with = "scalar::string")]
    pub api_hostname: String,
}

impl Tenant {
    pub fn validate(&self) -> Result<(), ValidationError> {
        require("name", &self.name)?;
        require("admin_api_key", &self.admin_api_key)?;
        require("admin_api_secret", &self.admin_api_secret)?;
        require("api_hostname", &self.api_hostname)
    }
}

/// One configured test integration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Application {
    #[serde(deserialize_with = "scalar::string")]
    pub id: String,
    #[serde(deserialize_with = "scalar::optional", skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(deserialize_with = "scalar::string")]
    pub name: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<ApplicationType>,
    /// Pre-`type` documents marked portal applications with this flag. It is
    /// folded into `kind` on load and never written back.
    #[serde(skip_serializing)]
    pub is_dmp: bool,
    pub enabled: bool,
    #[serde(deserialize_with = "scalar::string")]
    pub client_id: String,
    #[serde(deserialize_with = "scalar::string")]
    pub client_secret: String,
    #[serde(deserialize_with = "scalar::string")]
    pub api_hostname: String,

    // Service provider side of a SAML application.
    #[serde(deserialize_with = "scalar::optional", skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(deserialize_with = "scalar::optional", skip_serializing_if = "Option::is_none")]
    pub acs_url: Option<String>,
    #[serde(deserialize_with = "scalar::optional", skip_serializing_if = "Option::is_none")]
    pub metadata_url: Option<String>,
    #[serde(deserialize_with = "scalar::optional", skip_serializing_if = "Option::is_none")]
    pub signing_cert: Option<String>,
    #[serde(deserialize_with = "scalar::optional", skip_serializing_if = "Option::is_none")]
    pub signing_key: Option<String>,

    // Identity provider metadata for SAML.
    #[serde(deserialize_with = "scalar::optional", skip_serializing_if = "Option::is_none")]
    pub idp_entity_id: Option<String>,
    #[serde(deserialize_with = "scalar::optional", skip_serializing_if = "Option::is_none")]
    pub idp_sso_url: Option<String>,
    #[serde(deserialize_with = "scalar::optional", skip_serializing_if = "Option::is_none")]
    pub idp_certificate: Option<String>,

    // OIDC relying party.
    #[serde(deserialize_with = "scalar::optional", skip_serializing_if = "Option::is_none")]
    pub redirect_uri: Option<String>,
    #[serde(deserialize_with = "scalar::optional", skip_serializing_if = "Option::is_none")]
    pub idp_discovery_url: Option<String>,
    #[serde(deserialize_with = "scalar::optional", skip_serializing_if = "Option::is_none")]
    pub idp_issuer: Option<String>,
    #[serde(deserialize_with = "scalar::optional", skip_serializing_if = "Option::is_none")]
    pub idp_authorization_endpoint: Option<String>,
    #[serde(deserialize_with = "scalar::optional", skip_serializing_if = "Option::is_none")]
    pub idp_token_endpoint: Option<String>,
    #[serde(
        rename = "idp_userinfo_endpoint",
        deserialize_with = "scalar::optional",
        skip_serializing_if = "Option::is_none"
    )]
    pub idp_user_info_endpoint: Option<String>,
    #[serde(deserialize_with = "scalar::optional", skip_serializing_if = "Option::is_none")]
    pub idp_jwks_endpoint: Option<String>,
}

impl Application {
    /// The effective type, falling back to the legacy flag for records that
    /// have not been migrated yet.
    pub fn application_type(&self) -> ApplicationType {
        match self.kind {
            Some(kind) => kind,
            None if self.is_dmp => ApplicationType::DevicePortal,
            None => ApplicationType::WebSdk,
        }
    }

    pub fn belongs_to(&self, tenant_id: &str) -> bool {
        self.tenant_id.as_deref() == Some(tenant_id)
    }

    /// Folds the legacy `is_dmp` flag into `kind`. Returns true if the record changed.
    pub fn migrate_legacy_type(&mut self) -> bool {
        let changed = self.kind.is_none() || self.is_dmp;
        self.kind = Some(self.application_type());
        self.is_dmp = false;
        changed
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        require("name", &self.name)?;
        let kind = self.kind.ok_or(ValidationError::MissingType)?;

        match kind {
            ApplicationType::Saml => {
                require_for(kind, "entity_id", self.entity_id.as_deref())?;
                require_for(kind, "acs_url", self.acs_url.as_deref())?;
            }
            ApplicationType::Oidc => {
                require_for(kind, "client_id", Some(self.client_id.as_str()))?;
                require_for(kind, "client_secret", Some(self.client_secret.as_str()))?;
                require_for(kind, "redirect_uri", self.redirect_uri.as_deref())?;
            }
            ApplicationType::WebSdk | ApplicationType::DevicePortal => {
                require("client_id", &self.client_id)?;
                require("client_secret", &self.client_secret)?;
            }
        }

        require("api_hostname", &self.api_hostname)
    }
}

/// The whole persisted configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    #[serde(default)]
    pub encryption_enabled: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tenants: Vec<Tenant>,
    #[serde(default)]
    pub applications: Vec<Application>,
}

impl Document {
    /// Migrates every application lacking an explicit type. Safe to run repeatedly.
    pub fn migrate_legacy_fields(&mut self) -> usize {
        self.applications
            .iter_mut()
            .map(Application::migrate_legacy_type)
            .filter(|changed| *changed)
            .count()
    }

    pub fn tenant(&self, id: &str) -> Option<&Tenant> {
        self.tenants.iter().find(|tenant| tenant.id == id)
    }

    pub fn application(&self, id: &str) -> Option<&Application> {
        self.applications.iter().find(|app| app.id == id)
    }

    /// An application may name no tenant, but a named tenant must exist.
    pub fn check_tenant_reference(&self, app: &Application) -> Result<(), ValidationError> {
        match app.tenant_id.as_deref() {
            None | Some("") => Ok(()),
            Some(id) if self.tenant(id).is_some() => Ok(()),
            Some(id) => Err(ValidationError::UnknownTenant(id.to_string())),
        }
    }
}

/// Hand-edited documents sometimes carry a number or a boolean where text is
/// expected (`admin_api_key: 12345`). These read any scalar back as text and
/// a null as empty.
mod scalar {
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scalar {
        Text(String),
        Unsigned(u64),
        Signed(i64),
        Float(f64),
        Flag(bool),
    }

    impl Scalar {
        fn into_text(self) -> String {
            match self {
                Scalar::Text(text) => text,
                Scalar::Unsigned(n) => n.to_string(),
                Scalar::Signed(n) => n.to_string(),
                Scalar::Float(n) => n.to_string(),
                Scalar::Flag(flag) => flag.to_string(),
            }
        }
    }

    pub fn string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
        Ok(optional(deserializer)?.unwrap_or_default())
    }

    pub fn optional<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
        Ok(Option::<Scalar>::deserialize(deserializer)?.map(Scalar::into_text))
    }
}

fn require(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::Missing { field });
    }
    Ok(())
}

fn require_for(
    kind: ApplicationType,
    field: &'static str,
    value: Option<&str>,
) -> Result<(), ValidationError> {
    match value {
        Some(value) if !value.trim().is_empty() => Ok(()),
        _ => Err(ValidationError::MissingForType { field, kind }),
    }
}
