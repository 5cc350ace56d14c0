//! Resource identity: URNs and provider references

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const URN_PREFIX: &str = "urn:fleetstack:";

/// Type of the implicit root resource; children of it are not type-qualified.
pub const ROOT_STACK_TYPE: &str = "fleetstack:fleetstack:Stack";

/// Type prefix for provider resources (`fleetstack:providers:<package>`)
pub const PROVIDER_TYPE_PREFIX: &str = "fleetstack:providers:";

const SEPARATOR: &str = "::";

/// Stable, hierarchical resource identifier
///
/// Text form: `urn:fleetstack:<stack>::<project>::<qualified type>::<name>`,
/// where the qualified type is `<parent qualified type>$<type>` for resources
/// parented to anything other than the stack root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Urn(String);

impl Urn {
    pub fn new(
        stack: &str,
        project: &str,
        parent: Option<&Urn>,
        resource_type: &str,
        name: &str,
    ) -> Self {
        let qualified = match parent {
            Some(parent) if parent.resource_type() != ROOT_STACK_TYPE => {
                format!("{}${}", parent.qualified_type(), resource_type)
            }
            _ => resource_type.to_string(),
        };
        Self(format!(
            "{URN_PREFIX}{stack}{SEPARATOR}{project}{SEPARATOR}{qualified}{SEPARATOR}{name}"
        ))
    }

    pub fn parse(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        let rest = value
            .strip_prefix(URN_PREFIX)
            .ok_or_else(|| EngineError::InvalidUrn(value.clone()))?;
        let parts: Vec<&str> = rest.splitn(4, SEPARATOR).collect();
        if parts.len() != 4 || parts[..3].iter().any(|p| p.is_empty()) {
            return Err(EngineError::InvalidUrn(value));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn part(&self, index: usize) -> &str {
        self.0
            .strip_prefix(URN_PREFIX)
            .and_then(|rest| rest.splitn(4, SEPARATOR).nth(index))
            .unwrap_or_default()
    }

    pub fn stack(&self) -> &str {
        self.part(0)
    }

    pub fn project(&self) -> &str {
        self.part(1)
    }

    /// Type including the parent type chain (`a:b:Parent$a:b:Child`)
    pub fn qualified_type(&self) -> &str {
        self.part(2)
    }

    /// The resource's own type, without the parent chain
    pub fn resource_type(&self) -> &str {
        let qualified = self.qualified_type();
        qualified.rsplit('$').next().unwrap_or(qualified)
    }

    pub fn name(&self) -> &str {
        self.part(3)
    }

    pub fn is_provider(&self) -> bool {
        self.resource_type().starts_with(PROVIDER_TYPE_PREFIX)
    }
}

impl fmt::Display for Urn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Urn {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(value)
    }
}

impl From<Urn> for String {
    fn from(urn: Urn) -> Self {
        urn.0
    }
}

/// Opaque token binding a resource to one provider instance: `<provider urn>::<provider id>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProviderReference {
    urn: Urn,
    id: String,
}

impl ProviderReference {
    pub fn new(urn: Urn, id: impl Into<String>) -> Self {
        Self { urn, id: id.into() }
    }

    /// Parse `<urn>::<id>`, splitting on the last separator since URNs contain `::` themselves
    pub fn parse(value: &str) -> Result<Self> {
        let invalid = || EngineError::InvalidProviderReference(value.to_string());
        let (urn, id) = value.rsplit_once(SEPARATOR).ok_or_else(invalid)?;
        if id.is_empty() {
            return Err(invalid());
        }
        let urn = Urn::parse(urn).map_err(|_| invalid())?;
        if !urn.is_provider() {
            return Err(invalid());
        }
        Ok(Self::new(urn, id))
    }

    pub fn urn(&self) -> &Urn {
        &self.urn
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for ProviderReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{SEPARATOR}{}", self.urn, self.id)
    }
}

impl TryFrom<String> for ProviderReference {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ProviderReference> for String {
    fn from(reference: ProviderReference) -> Self {
        reference.to_string()
    }
}
