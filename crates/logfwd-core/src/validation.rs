//! Argument validation.
//!
//! Every rule is checked against the raw string parameters and every
//! failure is collected, so a caller can report all problems at once.
//! Patterns are full-string matches: each one is compiled wrapped in
//! `^(?:...)$` regardless of how the constant is written.

use std::collections::BTreeMap;
use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::fields;

/// Lowercase alphanumerics, 3 to 20 characters.
pub const DEPLOYMENT_NAME_PATTERN: &str = "[a-z0-9]{3,20}";

/// Event Hub connection string including the entity path.
pub const EVENT_HUB_CONNECTION_STRING_PATTERN: &str = r"Endpoint=sb://.*EntityPath=\S+";

/// Environment URL, used when a new ActiveGate is deployed in front of it.
pub const ENVIRONMENT_URL_PATTERN: &str =
    r"https?://[-a-zA-Z0-9@:%._+~=]{1,255}(/e/[-a-z0-9]{36})?/?";

/// Existing ActiveGate or direct-ingest URL; TLS only.
pub const ACTIVEGATE_URL_PATTERN: &str = r"https://[-a-zA-Z0-9@:%._+~=]{1,255}(/e/[-a-z0-9]{1,36})?/?";

/// `key=value` pairs separated by `;`, optional trailing separator.
pub const FILTER_CONFIG_PATTERN: &str = r"[^;=\s]+=[^;]*(;[^;=\s]+=[^;]*)*;?";

pub const GUID_PATTERN: &str =
    "[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}";

pub const EVENT_HUB_NAME_PATTERN: &str = "[a-zA-Z0-9][-._a-zA-Z0-9]{0,255}";

pub const FULLY_QUALIFIED_NAMESPACE_PATTERN: &str =
    r"[a-zA-Z][-a-zA-Z0-9]{4,48}[a-zA-Z0-9]\.servicebus\.windows\.net";

pub const IDENTITY_NAME_PATTERN: &str = "[a-zA-Z0-9][-_a-zA-Z0-9]{2,127}";

pub const RESOURCE_GROUP_PATTERN: &str = r"[-a-zA-Z0-9._()]{1,90}";

pub const LOCATION_PATTERN: &str = "[a-z0-9]+";

pub const SUBNET_ID_PATTERN: &str = r"(?i)/subscriptions/[^/]+/resourceGroups/[^/]+/providers/Microsoft\.Network/virtualNetworks/[^/]+/subnets/[^/]+";

pub const PACKAGE_URL_PATTERN: &str = r"https://\S+";

pub const BOOLEAN_PATTERN: &str = "(?i)true|false";

/// One field check.
#[derive(Debug, Clone)]
pub struct ValidationRule {
    field: &'static str,
    required: bool,
    pattern: Option<Regex>,
    message: String,
}

impl ValidationRule {
    pub fn new(
        field: &'static str,
        required: bool,
        pattern: Option<&str>,
        message: impl Into<String>,
    ) -> Result<Self, regex::Error> {
        let pattern = pattern.map(|p| Regex::new(&format!("^(?:{p})$"))).transpose()?;
        Ok(Self {
            field,
            required,
            pattern,
            message: message.into(),
        })
    }

    pub fn field(&self) -> &'static str {
        self.field
    }

    /// Check one value; `None` means the rule passed.
    pub fn check(&self, value: Option<&str>) -> Option<FieldFailure> {
        let present = value.filter(|v| !v.trim().is_empty());
        match (present, &self.pattern) {
            (None, _) if self.required => Some(FieldFailure {
                field: self.field.to_string(),
                message: format!("{} is required", self.field),
            }),
            (None, _) => None,
            (Some(v), Some(re)) if !re.is_match(v) => Some(FieldFailure {
                field: self.field.to_string(),
                message: self.message.clone(),
            }),
            (Some(_), _) => None,
        }
    }
}

/// A single rule violation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldFailure {
    pub field: String,
    pub message: String,
}

/// Outcome of one validation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub failures: Vec<FieldFailure>,
}

impl ValidationResult {
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn has_failure_for(&self, field: &str) -> bool {
        self.failures.iter().any(|f| f.field == field)
    }
}

impl fmt::Display for ValidationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.passed() {
            return write!(f, "all parameters valid");
        }
        for (i, failure) in self.failures.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "  - {}: {}", failure.field, failure.message)?;
        }
        Ok(())
    }
}

/// Mode switches that select which rules apply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuleContext {
    pub deploy_activegate: bool,
    pub managed_identity: bool,
}

/// Evaluate every rule against `args`.
pub fn validate(args: &BTreeMap<String, String>, rules: &[ValidationRule]) -> ValidationResult {
    let failures = rules
        .iter()
        .filter_map(|rule| rule.check(args.get(rule.field()).map(String::as_str)))
        .collect();
    ValidationResult { failures }
}

/// The deployer's rule set for the given mode.
pub fn standard_rules(ctx: RuleContext) -> Result<Vec<ValidationRule>, regex::Error> {
    let mut rules = vec![
        ValidationRule::new(
            fields::DEPLOYMENT_NAME,
            true,
            Some(DEPLOYMENT_NAME_PATTERN),
            "must be 3-20 characters of lowercase letters and digits",
        )?,
        ValidationRule::new(
            fields::RESOURCE_GROUP,
            true,
            Some(RESOURCE_GROUP_PATTERN),
            "is not a valid resource group name",
        )?,
        ValidationRule::new(
            fields::LOCATION,
            true,
            Some(LOCATION_PATTERN),
            "must be an Azure region name such as 'westeurope'",
        )?,
        ValidationRule::new(fields::TARGET_API_TOKEN, true, None, "")?,
        ValidationRule::new(
            fields::FILTER_CONFIG,
            false,
            Some(FILTER_CONFIG_PATTERN),
            "must be key=value pairs separated by ';'",
        )?,
        ValidationRule::new(
            fields::EXISTING_FUNCTION_SUBNET_ID,
            false,
            Some(SUBNET_ID_PATTERN),
            "must be a virtual network subnet resource ID",
        )?,
        ValidationRule::new(
            fields::EXISTING_ACTIVEGATE_SUBNET_ID,
            false,
            Some(SUBNET_ID_PATTERN),
            "must be a virtual network subnet resource ID",
        )?,
        ValidationRule::new(
            fields::FUNCTION_PACKAGE_URL,
            false,
            Some(PACKAGE_URL_PATTERN),
            "must be an https:// URL",
        )?,
    ];

    for flag in fields::FLAGS {
        rules.push(ValidationRule::new(
            flag,
            false,
            Some(BOOLEAN_PATTERN),
            "must be 'true' or 'false'",
        )?);
    }

    if ctx.deploy_activegate {
        rules.push(ValidationRule::new(
            fields::TARGET_URL,
            true,
            Some(ENVIRONMENT_URL_PATTERN),
            "must be an environment URL such as https://<environment-id>.live.dynatrace.com",
        )?);
        rules.push(ValidationRule::new(fields::TARGET_PAAS_TOKEN, true, None, "")?);
    } else {
        rules.push(ValidationRule::new(
            fields::TARGET_URL,
            true,
            Some(ACTIVEGATE_URL_PATTERN),
            "must be https://<activegate-host>:9999/e/<environment-id> or an https environment URL",
        )?);
    }

    if ctx.managed_identity {
        rules.push(ValidationRule::new(
            fields::EVENT_HUB_NAME,
            true,
            Some(EVENT_HUB_NAME_PATTERN),
            "is not a valid Event Hub name",
        )?);
        rules.push(ValidationRule::new(
            fields::EVENTHUB_CONNECTION_CLIENT_ID,
            true,
            Some(GUID_PATTERN),
            "must be a GUID",
        )?);
        rules.push(ValidationRule::new(
            fields::MANAGED_IDENTITY_RESOURCE_NAME,
            true,
            Some(IDENTITY_NAME_PATTERN),
            "is not a valid managed identity name",
        )?);
        rules.push(ValidationRule::new(
            fields::EVENTHUB_CONNECTION_FULLY_QUALIFIED_NAMESPACE,
            true,
            Some(FULLY_QUALIFIED_NAMESPACE_PATTERN),
            "must look like <namespace>.servicebus.windows.net",
        )?);
        rules.push(ValidationRule::new(
            fields::EVENT_HUB_CONNECTION_STRING,
            false,
            Some(EVENT_HUB_CONNECTION_STRING_PATTERN),
            "must look like Endpoint=sb://...;EntityPath=<event hub>",
        )?);
    } else {
        rules.push(ValidationRule::new(
            fields::EVENT_HUB_CONNECTION_STRING,
            true,
            Some(EVENT_HUB_CONNECTION_STRING_PATTERN),
            "must look like Endpoint=sb://...;EntityPath=<event hub>",
        )?);
    }

    Ok(rules)
}
