use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ===== DIRECTIVE TYPES =====

/// Separator between an activator name and its reference name inside one
/// marker-attribute token.
pub const DIRECTIVE_SEPARATOR: char = ':';

/// One `activatorName[:refName]` token of a marker attribute.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct Directive {
    pub activator: String,
    pub reference: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirectiveError {
    #[error("directive token is empty")]
    Empty,
    #[error("directive '{0}' has no activator name")]
    MissingActivator(String),
}

impl Directive {
    /// Parses a single token. The first colon separates the activator name
    /// from the reference name; an absent or empty reference name falls back
    /// to the activator name.
    pub fn parse(token: &str) -> Result<Self, DirectiveError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(DirectiveError::Empty);
        }
        let (activator, reference) = match token.split_once(DIRECTIVE_SEPARATOR) {
            Some((activator, reference)) => (activator, reference),
            None => (token, ""),
        };
        if activator.is_empty() {
            return Err(DirectiveError::MissingActivator(token.to_string()));
        }
        let reference = if reference.is_empty() { activator } else { reference };
        Ok(Self {
            activator: activator.to_string(),
            reference: reference.to_string(),
        })
    }

    /// Splits a marker-attribute value on whitespace and parses every token,
    /// left to right.
    pub fn parse_all(value: &str) -> impl Iterator<Item = Result<Self, DirectiveError>> + '_ {
        value.split_whitespace().map(Self::parse)
    }
}

impl FromStr for Directive {
    type Err = DirectiveError;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        Self::parse(token)
    }
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.activator == self.reference {
            write!(f, "{}", self.activator)
        } else {
            write!(f, "{}{}{}", self.activator, DIRECTIVE_SEPARATOR, self.reference)
        }
    }
}

// ===== SCOPED NAMING =====

/// Namespaces `attribute` under an instance name: `name:attribute`.
pub fn scoped_key(name: &str, attribute: &str) -> String {
    let mut key = String::with_capacity(name.len() + attribute.len() + 1);
    key.push_str(name);
    key.push(DIRECTIVE_SEPARATOR);
    key.push_str(attribute);
    key
}

/// Serializes `ident` as a CSS identifier so it can be embedded in an
/// attribute selector such as `[act\:as]`.
pub fn css_escape(ident: &str) -> String {
    let chars: Vec<char> = ident.chars().collect();
    let mut escaped = String::with_capacity(ident.len() + 4);
    for (index, &c) in chars.iter().enumerate() {
        match c {
            '\0' => escaped.push('\u{FFFD}'),
            '\u{1}'..='\u{1F}' | '\u{7F}' => escaped.push_str(&format!("\\{:x} ", c as u32)),
            '0'..='9' if index == 0 || (index == 1 && chars[0] == '-') => {
                escaped.push_str(&format!("\\{:x} ", c as u32))
            }
            '-' if index == 0 && chars.len() == 1 => escaped.push_str("\\-"),
            c if c >= '\u{80}' || c == '-' || c == '_' || c.is_ascii_alphanumeric() => {
                escaped.push(c)
            }
            c => {
                escaped.push('\\');
                escaped.push(c);
            }
        }
    }
    escaped
}

// ===== CONFIG TYPES =====

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ObserverConfig {
    /// Attribute whose value lists the directives of a node.
    pub marker_attribute: String,
    /// Child name used by data lookups when none is given.
    pub data_target: String,
    /// Tag of the out-of-band elements carrying `name`/`content` pairs.
    pub metadata_tag: String,
}

impl ObserverConfig {
    pub const DEFAULT_MARKER_ATTRIBUTE: &'static str = "act:as";
    pub const DEFAULT_DATA_TARGET: &'static str = "data";
    pub const DEFAULT_METADATA_TAG: &'static str = "meta";

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.marker_attribute.trim().is_empty() {
            return Err(ConfigError::Empty("marker_attribute"));
        }
        if self.data_target.trim().is_empty() {
            return Err(ConfigError::Empty("data_target"));
        }
        if self.metadata_tag.trim().is_empty() {
            return Err(ConfigError::Empty("metadata_tag"));
        }
        Ok(())
    }
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            marker_attribute: Self::DEFAULT_MARKER_ATTRIBUTE.to_string(),
            data_target: Self::DEFAULT_DATA_TARGET.to_string(),
            metadata_tag: Self::DEFAULT_METADATA_TAG.to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse observer config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize observer config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("observer config field '{0}' must not be empty")]
    Empty(&'static str),
}
