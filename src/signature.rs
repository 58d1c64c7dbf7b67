// Function signature parsing and argument validation
// A signature such as `<s-n?:s>` compiles to one regex over per-argument type symbols

use regex::Regex;
use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::error::Error;
use crate::value::JValue;

/// Signature parsing and validation errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SignatureError {
    #[error("Type parameters can only be applied to functions and arrays")]
    TypeParameterNotAllowed { position: usize, symbol: String },

    #[error("Choice groups containing parameterized types are not supported")]
    Malformed { position: usize, text: String },

    #[error("Argument {index} of function {name} does not match function signature")]
    ArgumentMismatch {
        index: usize,
        name: String,
        value: Option<JValue>,
    },

    #[error("Context value is not a compatible type with argument {index} of function {name}")]
    ContextMismatch {
        index: usize,
        name: String,
        value: Option<JValue>,
    },

    #[error("Argument {index} of function {name} must be an array of {expected}")]
    ArrayTypeMismatch {
        index: usize,
        name: String,
        expected: &'static str,
        value: Option<JValue>,
    },
}

impl From<SignatureError> for Error {
    fn from(err: SignatureError) -> Self {
        let message = err.to_string();
        match err {
            SignatureError::TypeParameterNotAllowed { position, symbol } => {
                Error::syntax("S0401", message, position, Some(symbol))
            }
            SignatureError::Malformed { position, text } => {
                Error::syntax("S0402", message, position, Some(text))
            }
            SignatureError::ArgumentMismatch { name, value, .. } => {
                Error::new("T0410", message).with_token(name).with_value(value)
            }
            SignatureError::ContextMismatch { name, value, .. } => {
                Error::new("T0411", message).with_token(name).with_value(value)
            }
            SignatureError::ArrayTypeMismatch { name, value, .. } => {
                Error::new("T0412", message).with_token(name).with_value(value)
            }
        }
    }
}

/// Parameter type
#[derive(Debug, Clone, PartialEq)]
pub enum ParamType {
    Boolean,
    Number,
    String,
    Null,
    Array,
    Object,
    Function,
    /// `j`: any JSON value
    Json,
    /// `x`: any value including functions
    Any,
    /// `(sao)`: one of the listed symbols
    Choice(String),
}

/// One parameter of a signature
#[derive(Debug, Clone)]
pub struct Parameter {
    pub param_type: ParamType,
    /// Regex fragment matched against the argument's type symbol
    pattern: String,
    /// `-`: an absent argument is replaced by the context value
    pub use_context: bool,
    context_pattern: Option<Regex>,
    /// `a<n>` / `f<...>` subtype text
    pub subtype: Option<String>,
    /// Marked `?`: may be omitted by the caller
    pub optional: bool,
}

/// Parsed function signature
#[derive(Debug, Clone)]
pub struct Signature {
    definition: String,
    pub params: Vec<Parameter>,
    matcher: Regex,
}

impl PartialEq for Signature {
    fn eq(&self, other: &Self) -> bool {
        self.definition == other.definition
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.definition)
    }
}

fn find_closing(chars: &[char], start: usize, open: char, close: char) -> usize {
    let mut depth = 1;
    let mut position = start;
    while position + 1 < chars.len() {
        position += 1;
        let symbol = chars[position];
        if symbol == close {
            depth -= 1;
            if depth == 0 {
                break;
            }
        } else if symbol == open {
            depth += 1;
        }
    }
    position
}

/// Type symbol of an argument; absent arguments are `m`
fn type_symbol(value: Option<&JValue>) -> char {
    match value {
        None => 'm',
        Some(JValue::Null) => 'l',
        Some(JValue::Bool(_)) => 'b',
        Some(JValue::Number(_)) => 'n',
        Some(JValue::String(_)) => 's',
        Some(JValue::Array(_)) => 'a',
        Some(JValue::Object(_)) => 'o',
        Some(JValue::Function(_)) | Some(JValue::Regex(_)) => 'f',
    }
}

fn array_type_name(subtype: &str) -> &'static str {
    match subtype {
        "a" => "arrays",
        "b" => "booleans",
        "f" => "functions",
        "n" => "numbers",
        "o" => "objects",
        "s" => "strings",
        _ => "values",
    }
}

impl Signature {
    /// Parse a signature string such as `<a<n>:n>` or `<s-(sf)n?:a<s>>`
    pub fn parse(definition: &str) -> Result<Signature, SignatureError> {
        let chars: Vec<char> = definition.chars().collect();
        let mut params: Vec<Parameter> = Vec::new();
        let mut position = 1;

        let simple = |param_type: ParamType, pattern: &str| Parameter {
            param_type,
            pattern: pattern.to_string(),
            use_context: false,
            context_pattern: None,
            subtype: None,
            optional: false,
        };

        while position < chars.len() {
            let symbol = chars[position];
            if symbol == ':' {
                break;
            }
            match symbol {
                'b' => params.push(simple(ParamType::Boolean, "[bm]")),
                'n' => params.push(simple(ParamType::Number, "[nm]")),
                's' => params.push(simple(ParamType::String, "[sm]")),
                'l' => params.push(simple(ParamType::Null, "[lm]")),
                'o' => params.push(simple(ParamType::Object, "[om]")),
                'a' => params.push(simple(ParamType::Array, "[asnblfom]")),
                'f' => params.push(simple(ParamType::Function, "f")),
                'j' => params.push(simple(ParamType::Json, "[asnblom]")),
                'x' => params.push(simple(ParamType::Any, "[asnblfom]")),
                'u' => params.push(simple(ParamType::Choice("bnsl".into()), "[bnslm]")),
                '-' => {
                    if let Some(prev) = params.last_mut() {
                        prev.use_context = true;
                        prev.context_pattern = Regex::new(&format!("^{}$", prev.pattern)).ok();
                        prev.pattern.push('?');
                    }
                }
                '?' | '+' => {
                    if let Some(prev) = params.last_mut() {
                        prev.pattern.push(symbol);
                        prev.optional |= symbol == '?';
                    }
                }
                '(' => {
                    let end = find_closing(&chars, position, '(', ')');
                    let choice: String = chars[position + 1..end.min(chars.len())].iter().collect();
                    if choice.contains('<') {
                        return Err(SignatureError::Malformed {
                            position,
                            text: choice,
                        });
                    }
                    params.push(simple(
                        ParamType::Choice(choice.clone()),
                        &format!("[{}m]", choice),
                    ));
                    position = end;
                }
                '<' => {
                    let typed = matches!(
                        params.last().map(|p| &p.param_type),
                        Some(ParamType::Array) | Some(ParamType::Function)
                    );
                    match params.last_mut() {
                        Some(prev) if typed => {
                            let end = find_closing(&chars, position, '<', '>');
                            prev.subtype =
                                Some(chars[position + 1..end.min(chars.len())].iter().collect());
                            position = end;
                        }
                        prev => {
                            return Err(SignatureError::TypeParameterNotAllowed {
                                position,
                                symbol: prev
                                    .map(|p| p.pattern.clone())
                                    .unwrap_or_default(),
                            })
                        }
                    }
                }
                _ => {}
            }
            position += 1;
        }

        let pattern: String = params.iter().map(|p| format!("({})", p.pattern)).collect();
        let matcher = Regex::new(&format!("^{}$", pattern)).map_err(|_| SignatureError::Malformed {
            position: 0,
            text: definition.to_string(),
        })?;

        Ok(Signature {
            definition: definition.to_string(),
            params,
            matcher,
        })
    }

    pub fn definition(&self) -> &str {
        &self.definition
    }

    /// Validate arguments, returning the effective argument list.
    ///
    /// An absent `-` argument is replaced by `context`; a non-array value
    /// passed to an `a` parameter is wrapped in a one-element array.
    pub fn validate(
        &self,
        args: &[Option<JValue>],
        context: Option<&JValue>,
        name: &str,
    ) -> Result<Vec<Option<JValue>>, SignatureError> {
        let supplied: String = args.iter().map(|a| type_symbol(a.as_ref())).collect();
        let Some(captures) = self.matcher.captures(&supplied) else {
            return Err(self.mismatch(args, &supplied, name));
        };

        let mut validated = Vec::with_capacity(self.params.len());
        let mut arg_index = 0;
        for (index, param) in self.params.iter().enumerate() {
            let matched = captures.get(index + 1).map_or("", |m| m.as_str());
            if matched.is_empty() {
                let context_fits = param.use_context
                    && param
                        .context_pattern
                        .as_ref()
                        .is_some_and(|re| re.is_match(&type_symbol(context).to_string()));
                if param.use_context {
                    if context_fits {
                        validated.push(context.cloned());
                    } else {
                        return Err(SignatureError::ContextMismatch {
                            index: arg_index + 1,
                            name: name.to_string(),
                            value: context.cloned(),
                        });
                    }
                } else {
                    validated.push(args.get(arg_index).cloned().flatten());
                    arg_index += 1;
                }
                continue;
            }

            for single in matched.chars() {
                let arg = args.get(arg_index).cloned().flatten();
                if param.param_type == ParamType::Array {
                    let arg = match arg {
                        None => None,
                        Some(value) => {
                            self.check_array_subtype(param, single, matched, &value, arg_index, name)?;
                            if single == 'a' {
                                Some(value)
                            } else {
                                Some(JValue::array(vec![value]))
                            }
                        }
                    };
                    validated.push(arg);
                } else {
                    validated.push(arg);
                }
                arg_index += 1;
            }
        }
        Ok(validated)
    }

    fn check_array_subtype(
        &self,
        param: &Parameter,
        single: char,
        matched: &str,
        value: &JValue,
        arg_index: usize,
        name: &str,
    ) -> Result<(), SignatureError> {
        let Some(subtype) = param.subtype.as_deref() else {
            return Ok(());
        };
        let ok = if single != 'a' {
            matched == subtype
        } else {
            match value.as_array().and_then(|arr| arr.first().map(|first| (arr, first))) {
                None => true,
                Some((arr, first)) => {
                    let item_type = type_symbol(Some(first));
                    subtype.starts_with(item_type)
                        && arr.iter().all(|v| type_symbol(Some(v)) == item_type)
                }
            }
        };
        if ok {
            Ok(())
        } else {
            Err(SignatureError::ArrayTypeMismatch {
                index: arg_index + 1,
                name: name.to_string(),
                expected: array_type_name(subtype),
                value: Some(value.clone()),
            })
        }
    }

    /// Locate the first offending argument by matching ever longer prefixes
    fn mismatch(&self, args: &[Option<JValue>], supplied: &str, name: &str) -> SignatureError {
        let mut partial = String::from("^");
        let mut good_to = 0;
        for param in &self.params {
            partial.push_str(&param.pattern);
            let matched = Regex::new(&partial)
                .ok()
                .and_then(|re| re.find(supplied).map(|m| m.end()));
            match matched {
                Some(end) => good_to = end,
                None => break,
            }
        }
        SignatureError::ArgumentMismatch {
            index: good_to + 1,
            name: name.to_string(),
            value: args.get(good_to).cloned().flatten(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jvalue;

    fn some(v: JValue) -> Option<JValue> {
        Some(v)
    }

    #[test]
    fn test_optional_parameter() {
        let sig = Signature::parse("<sn?:s>").unwrap();
        assert!(sig.validate(&[some(jvalue!("a"))], None, "f").is_ok());
        assert!(sig
            .validate(&[some(jvalue!("a")), some(jvalue!(1i64))], None, "f")
            .is_ok());
        let err = sig
            .validate(&[some(jvalue!(1i64))], None, "f")
            .unwrap_err();
        assert!(matches!(err, SignatureError::ArgumentMismatch { index: 1, .. }));
    }

    #[test]
    fn test_mismatch_reports_offending_index() {
        let sig = Signature::parse("<snb:s>").unwrap();
        let err = sig
            .validate(
                &[some(jvalue!("a")), some(jvalue!(1i64)), some(jvalue!("x"))],
                None,
                "f",
            )
            .unwrap_err();
        assert!(matches!(err, SignatureError::ArgumentMismatch { index: 3, .. }));
        assert_eq!(Error::from(err).code, "T0410");
    }

    #[test]
    fn test_context_substitution() {
        let sig = Signature::parse("<s-:s>").unwrap();
        let ctx = jvalue!("hello");
        let args = sig.validate(&[], Some(&ctx), "uppercase").unwrap();
        assert_eq!(args, vec![some(jvalue!("hello"))]);

        let ctx = jvalue!(42i64);
        let err = sig.validate(&[], Some(&ctx), "uppercase").unwrap_err();
        assert_eq!(Error::from(err).code, "T0411");
    }

    #[test]
    fn test_array_parameter_wraps_singletons() {
        let sig = Signature::parse("<a<n>:n>").unwrap();
        let args = sig.validate(&[some(jvalue!(5i64))], None, "sum").unwrap();
        assert_eq!(args, vec![some(jvalue!([5i64]))]);

        let err = sig
            .validate(&[some(jvalue!([1i64, "two"]))], None, "sum")
            .unwrap_err();
        assert_eq!(Error::from(err).code, "T0412");
    }

    #[test]
    fn test_choice_group() {
        let sig = Signature::parse("<s-(sf)(sf)n?:s>").unwrap();
        assert!(sig
            .validate(
                &[some(jvalue!("abc")), some(jvalue!("b")), some(jvalue!("x"))],
                None,
                "replace"
            )
            .is_ok());
    }

    #[test]
    fn test_malformed_signatures() {
        let err = Signature::parse("<n<n>:n>").unwrap_err();
        assert_eq!(Error::from(err).code, "S0401");
        let err = Signature::parse("<(sa<n>):n>").unwrap_err();
        assert_eq!(Error::from(err).code, "S0402");
    }
}
