// Structured error record shared by the tokenizer, parser, optimizer and evaluator
// Every failure carries a stable code; the leading letter names its family

use serde::Serialize;
use thiserror::Error;

use crate::value::JValue;

/// Error families, identified by the first character of the code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorFamily {
    /// `S0xxx` - raised while tokenizing, parsing or optimizing
    Syntax,
    /// `T xxxx` - operand or argument of the wrong type at evaluation time
    Type,
    /// `D xxxx` - dynamic failures, mostly from the native library
    Dynamic,
    /// `U xxxx` - host-imposed resource limits (depth, step budget)
    Resource,
}

/// An evaluation or compilation failure.
///
/// Serializes as the wire-level diagnostic record
/// `{code, position?, token?, value?, value2?, message}`.
#[derive(Error, Debug, Clone, Serialize)]
#[error("{code}: {message}")]
pub struct Error {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<JValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value2: Option<JValue>,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Error {
            code,
            message: message.into(),
            position: None,
            token: None,
            value: None,
            value2: None,
        }
    }

    /// Syntax error pinned to a source position and the offending token text
    pub fn syntax(
        code: &'static str,
        message: impl Into<String>,
        position: usize,
        token: Option<String>,
    ) -> Self {
        Error {
            position: Some(position),
            token,
            ..Error::new(code, message)
        }
    }

    pub fn at(mut self, position: usize) -> Self {
        self.position = Some(position);
        self
    }

    /// Attach a position only if none was recorded closer to the failure
    pub fn or_position(mut self, position: Option<usize>) -> Self {
        if self.position.is_none() {
            self.position = position;
        }
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_value(mut self, value: Option<JValue>) -> Self {
        self.value = value;
        self
    }

    pub fn with_value2(mut self, value: Option<JValue>) -> Self {
        self.value2 = value;
        self
    }

    pub fn family(&self) -> ErrorFamily {
        match self.code.as_bytes().first() {
            Some(b'S') => ErrorFamily::Syntax,
            Some(b'T') => ErrorFamily::Type,
            Some(b'U') => ErrorFamily::Resource,
            _ => ErrorFamily::Dynamic,
        }
    }

    /// Resource exhaustion and raw nodes reaching the evaluator abort the whole
    /// evaluation and must not be retried
    pub fn is_fatal(&self) -> bool {
        self.family() == ErrorFamily::Resource || self.code == "S0206"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_code() {
        let err = Error::new("T2001", "The left side of the + operator must evaluate to a number");
        assert_eq!(
            err.to_string(),
            "T2001: The left side of the + operator must evaluate to a number"
        );
    }

    #[test]
    fn test_family_from_code() {
        assert_eq!(Error::new("S0201", "x").family(), ErrorFamily::Syntax);
        assert_eq!(Error::new("T1006", "x").family(), ErrorFamily::Type);
        assert_eq!(Error::new("D3060", "x").family(), ErrorFamily::Dynamic);
        assert_eq!(Error::new("U1001", "x").family(), ErrorFamily::Resource);
        assert!(Error::new("U1001", "x").is_fatal());
    }

    #[test]
    fn test_position_is_not_overwritten() {
        let err = Error::new("T2002", "x").at(4).or_position(Some(9));
        assert_eq!(err.position, Some(4));

        let err = Error::new("T2002", "x").or_position(Some(9));
        assert_eq!(err.position, Some(9));
    }

    #[test]
    fn test_wire_record_skips_missing_fields() {
        let err = Error::syntax("S0202", "Expected \")\", got \"]\"", 7, Some("]".to_string()));
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "S0202");
        assert_eq!(json["position"], 7);
        assert_eq!(json["token"], "]");
        assert!(json.get("value").is_none());
    }
}
