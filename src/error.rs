use std::{fmt, io};

use quick_xml::Error as XmlError;
use regex::Error as RegexError;
use serde::{Deserialize, Serialize};
use serde_json::Error as JsonError;
use thiserror::Error;
use url::ParseError as UrlParseError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
pub enum RecordError {
    /// The metadata subtree handed to a composer lacks a required key.
    #[error("{composer}: missing required field '{field}'")]
    MissingField { composer: String, field: String },
    /// A composer's insertion point does not exist in its fragment template.
    #[error("{composer}: insertion point '{key}' ({locator}) not found in fragment template")]
    TemplateMismatch {
        composer: String,
        key: String,
        locator: String,
    },
    /// A parent locator or sibling anchor did not resolve in the base document.
    #[error("{composer}: no attachment point for '{locator}'")]
    Attachment { composer: String, locator: String },
    #[error("record '{owner}' references '{target}' which has no registered identifier")]
    UnresolvedReference { owner: String, target: String },
    #[error("identifier '{0}' was already registered")]
    DuplicateIdentifier(String),
    #[error("Invalid usage: {0}")]
    Usage(String),
    #[error("Registration of '{local_id}' failed: {message}")]
    Registration { local_id: String, message: String },
    #[error("Patch of '{owner}' failed: {message}")]
    Patch { owner: String, message: String },
    #[error("XML error: {0}")]
    Xml(String),
    #[error("Invalid locator '{locator}': {message}")]
    Locator { locator: String, message: String },
    #[error("File System error: {0}")]
    Io(String),
    #[error("Item Not Found: {0}")]
    NotFound(String),
    #[error("(De)Serialization error: {0}")]
    Serialization(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

impl RecordError {
    pub fn missing_field(composer: impl Into<String>, field: impl Into<String>) -> Self {
        RecordError::MissingField {
            composer: composer.into(),
            field: field.into(),
        }
    }

    /// Template and registry inconsistencies. These are never worth retrying.
    pub fn is_programming_error(&self) -> bool {
        matches!(
            self,
            RecordError::TemplateMismatch { .. }
                | RecordError::Attachment { .. }
                | RecordError::Locator { .. }
                | RecordError::Usage(_)
        )
    }
}

impl From<io::Error> for RecordError {
    fn from(x: io::Error) -> Self {
        match x.kind() {
            io::ErrorKind::NotFound => RecordError::NotFound(format!("{x}")),
            _ => RecordError::Io(format!("IOError: {x}")),
        }
    }
}

impl From<walkdir::Error> for RecordError {
    fn from(x: walkdir::Error) -> Self {
        let path = x.path().map(|p| p.display().to_string()).unwrap_or_default();
        match x.into_io_error() {
            Some(io_err) if io_err.kind() == io::ErrorKind::NotFound => {
                RecordError::NotFound(format!("{path}: {io_err}"))
            }
            Some(io_err) => RecordError::Io(format!("IOError at {path}: {io_err}")),
            None => RecordError::Io(format!("Filesystem loop at {path}")),
        }
    }
}

impl From<fmt::Error> for RecordError {
    fn from(x: fmt::Error) -> Self {
        RecordError::Serialization(format!("{x}"))
    }
}

impl From<serde_yaml::Error> for RecordError {
    fn from(src: serde_yaml::Error) -> RecordError {
        RecordError::Serialization(format!("YAML deserialization error: {src}"))
    }
}

impl From<JsonError> for RecordError {
    fn from(src: JsonError) -> RecordError {
        RecordError::Serialization(format!("JSON (de)serialization error: {src}"))
    }
}

impl From<toml::de::Error> for RecordError {
    fn from(src: toml::de::Error) -> RecordError {
        RecordError::Config(format!("Toml deserialization error: {src}"))
    }
}

impl From<csv::Error> for RecordError {
    fn from(src: csv::Error) -> RecordError {
        RecordError::Serialization(format!("CSV error: {src}"))
    }
}

impl From<XmlError> for RecordError {
    fn from(src: XmlError) -> RecordError {
        RecordError::Xml(format!("{src}"))
    }
}

impl From<quick_xml::events::attributes::AttrError> for RecordError {
    fn from(src: quick_xml::events::attributes::AttrError) -> RecordError {
        RecordError::Xml(format!("malformed attribute: {src}"))
    }
}

impl From<uuid::Error> for RecordError {
    fn from(src: uuid::Error) -> RecordError {
        RecordError::Serialization(format!("UUID conversion failed: {src}"))
    }
}

impl From<UrlParseError> for RecordError {
    fn from(src: UrlParseError) -> RecordError {
        RecordError::Config(format!("Invalid URL: {src}"))
    }
}

impl From<RegexError> for RecordError {
    fn from(x: RegexError) -> Self {
        RecordError::Serialization(format!("Regex parse failed: {x}"))
    }
}

impl From<std::string::FromUtf8Error> for RecordError {
    fn from(x: std::string::FromUtf8Error) -> Self {
        RecordError::Xml(format!("serialized document is not UTF-8: {x}"))
    }
}
