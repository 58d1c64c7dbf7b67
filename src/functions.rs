// Built-in function library
// Natives are registered once per thread in a read-only root frame

use indexmap::IndexMap;
use regex::Regex;

use crate::environment::{Env, Environment};
use crate::error::{Error, Result};
use crate::evaluator::Evaluator;
use crate::procedure::{CallContext, Procedure};
use crate::sequence::Sequence;
use crate::signature::{Signature, SignatureError};
use crate::value::{stringify, JValue};

type NativeFn = fn(&mut Evaluator, &[Option<JValue>], &CallContext<'_>) -> Result<Sequence>;

/// Name, signature and implementation of every native function
const NATIVES: &[(&str, &str, NativeFn)] = &[
    // strings
    ("string", "<x-b?:s>", string::string),
    ("length", "<s-:n>", string::length),
    ("substring", "<s-nn?:s>", string::substring),
    ("substringBefore", "<s-s:s>", string::substring_before),
    ("substringAfter", "<s-s:s>", string::substring_after),
    ("uppercase", "<s-:s>", string::uppercase),
    ("lowercase", "<s-:s>", string::lowercase),
    ("trim", "<s-:s>", string::trim),
    ("pad", "<s-ns?:s>", string::pad),
    ("contains", "<s-(sf):b>", string::contains),
    ("split", "<s-(sf)n?:a<s>>", string::split),
    ("join", "<a<s>s?:s>", string::join),
    ("match", "<s-f<s:o>n?:a<o>>", string::match_regex),
    ("replace", "<s-(sf)(sf)n?:s>", string::replace),
    // numbers
    ("number", "<(nsb)-:n>", numeric::number),
    ("abs", "<n-:n>", numeric::abs),
    ("floor", "<n-:n>", numeric::floor),
    ("ceil", "<n-:n>", numeric::ceil),
    ("round", "<n-n?:n>", numeric::round),
    ("power", "<n-n:n>", numeric::power),
    ("sqrt", "<n-:n>", numeric::sqrt),
    ("sum", "<a<n>:n>", numeric::sum),
    ("max", "<a<n>:n>", numeric::max),
    ("min", "<a<n>:n>", numeric::min),
    ("average", "<a<n>:n>", numeric::average),
    // booleans
    ("boolean", "<x-:b>", boolean::boolean),
    ("not", "<x-:b>", boolean::not),
    ("exists", "<x:b>", boolean::exists),
    // arrays
    ("count", "<a:n>", array::count),
    ("append", "<xx:a>", array::append),
    ("reverse", "<a:a>", array::reverse),
    ("sort", "<af?:a>", array::sort),
    ("distinct", "<x:x>", array::distinct),
    ("zip", "<a+>", array::zip),
    // objects
    ("keys", "<x-:a<s>>", object::keys),
    ("lookup", "<x-s:x>", object::lookup),
    ("spread", "<x-:a<o>>", object::spread),
    ("merge", "<a<o>:o>", object::merge),
    ("each", "<o-f:a>", object::each),
    ("sift", "<o-f?:o>", object::sift),
    ("type", "<x:s>", object::type_of),
    ("error", "<s?:x>", object::error),
    ("assert", "<bs?:x>", object::assert),
    // higher order
    ("map", "<af>", hof::map),
    ("filter", "<af>", hof::filter),
    ("single", "<af?>", hof::single),
    ("reduce", "<afj?:j>", hof::reduce),
    ("eval", "<sx?:x>", hof::eval),
    // date and time
    ("now", "<s?s?:s>", date::now),
    ("millis", "<:n>", date::millis),
    ("fromMillis", "<n-s?s?:s>", date::from_millis),
    ("toMillis", "<s-s?:n>", date::to_millis),
];

thread_local! {
    static ROOT: Result<Env> = build_root();
}

/// The root frame holding every native function.
///
/// Built once per thread and shared by every evaluation on it. Nothing binds
/// into it after construction; each evaluation works in child frames.
pub fn root_env() -> Result<Env> {
    ROOT.with(Clone::clone)
}

fn build_root() -> Result<Env> {
    let env = Environment::new();
    for (name, definition, implementation) in NATIVES {
        let signature = Signature::parse(definition)?;
        let arity = signature.params.iter().filter(|p| !p.optional).count();
        let procedure = Procedure::native(*name, arity, Some(signature), *implementation);
        env.bind(*name, Sequence::from(JValue::function(procedure)));
    }
    log::debug!("registered {} native functions", NATIVES.len());
    Ok(env)
}

// ── Argument helpers ────────────────────────────────────────────────────────

#[inline]
fn arg(args: &[Option<JValue>], index: usize) -> Option<&JValue> {
    args.get(index).and_then(Option::as_ref)
}

#[inline]
fn number_arg(args: &[Option<JValue>], index: usize) -> Option<f64> {
    arg(args, index).and_then(JValue::as_f64)
}

#[inline]
fn text_arg(args: &[Option<JValue>], index: usize) -> Option<&str> {
    arg(args, index).and_then(JValue::as_str)
}

/// Optional non-negative limit argument; a negative value raises `code`
fn limit_arg(
    args: &[Option<JValue>],
    index: usize,
    code: &'static str,
    message: &str,
) -> Result<usize> {
    match number_arg(args, index) {
        None => Ok(usize::MAX),
        Some(n) if n < 0.0 => {
            Err(Error::new(code, message).with_value(Some(JValue::Number(n))))
        }
        Some(n) => Ok(n.floor() as usize),
    }
}

/// `value, index, array` for per-element callbacks; trimmed to the callee's arity
fn element_args(value: &JValue, index: usize, array: &JValue) -> Vec<Option<JValue>> {
    vec![Some(value.clone()), Some(JValue::from(index)), Some(array.clone())]
}

/// A string or regex pattern argument
#[derive(Clone, Copy)]
enum Pattern<'a> {
    Text(&'a str),
    Regex(&'a Regex),
}

fn pattern_arg<'a>(args: &'a [Option<JValue>], index: usize, name: &str) -> Result<Option<Pattern<'a>>> {
    match arg(args, index) {
        None => Ok(None),
        Some(JValue::String(s)) => Ok(Some(Pattern::Text(&**s))),
        Some(JValue::Regex(re)) => Ok(Some(Pattern::Regex(&**re))),
        Some(other) => Err(SignatureError::ArgumentMismatch {
            index: index + 1,
            name: name.to_string(),
            value: Some(other.clone()),
        }
        .into()),
    }
}

fn zero_length_match() -> Error {
    Error::new("D1004", "Regular expression matches zero length string")
}

/// All matches of `regex` in `s`; a pattern matching the empty string is an error
fn regex_matches<'t>(regex: &Regex, s: &'t str) -> Result<Vec<regex::Captures<'t>>> {
    let mut matches = Vec::new();
    for captures in regex.captures_iter(s) {
        if captures.get(0).map_or(true, |m| m.as_str().is_empty()) {
            return Err(zero_length_match());
        }
        matches.push(captures);
    }
    Ok(matches)
}

fn captured_groups(captures: &regex::Captures<'_>) -> Vec<String> {
    (1..captures.len())
        .map(|i| captures.get(i).map_or(String::new(), |m| m.as_str().to_string()))
        .collect()
}

/// `{match, index, groups}` record handed to `$match` callers and replacement functions
fn match_record(matched: &str, index: usize, groups: Vec<String>) -> JValue {
    let mut record = IndexMap::new();
    record.insert("match".to_string(), JValue::from(matched));
    record.insert("index".to_string(), JValue::from(index));
    record.insert(
        "groups".to_string(),
        JValue::array(groups.into_iter().map(JValue::from).collect()),
    );
    JValue::object(record)
}

/// Built-in string functions
pub mod string {
    use super::*;

    /// String form used by `$string` and `&`: strings as-is, anything else as JSON
    pub fn cast(value: &JValue) -> Result<String> {
        cast_with(value, false)
    }

    fn cast_with(value: &JValue, pretty: bool) -> Result<String> {
        match value {
            JValue::String(s) => Ok(s.to_string()),
            JValue::Function(_) | JValue::Regex(_) => Ok(String::new()),
            JValue::Number(n) if !n.is_finite() => Err(Error::new(
                "D3001",
                "Attempting to invoke string function on Infinity or NaN",
            )
            .with_value(Some(value.clone()))),
            other => Ok(stringify(other, pretty)),
        }
    }

    /// Slice by code points with negative offsets counted from the end
    fn slice_chars(chars: &[char], start: f64, end: Option<f64>) -> String {
        let len = chars.len() as f64;
        let resolve = |i: f64| -> usize {
            let i = i.trunc();
            let i = if i < 0.0 { (len + i).max(0.0) } else { i.min(len) };
            i as usize
        };
        let from = resolve(start);
        let to = end.map_or(chars.len(), resolve);
        if from >= to {
            String::new()
        } else {
            chars[from..to].iter().collect()
        }
    }

    /// $string() - Cast value to string
    pub fn string(_: &mut Evaluator, args: &[Option<JValue>], _: &CallContext<'_>) -> Result<Sequence> {
        let Some(value) = arg(args, 0) else {
            return Ok(Sequence::Absent);
        };
        let pretty = arg(args, 1).is_some_and(JValue::truthy);
        Ok(Sequence::from(JValue::from(cast_with(value, pretty)?)))
    }

    /// $length() - Number of code points
    pub fn length(_: &mut Evaluator, args: &[Option<JValue>], _: &CallContext<'_>) -> Result<Sequence> {
        Ok(Sequence::from(
            text_arg(args, 0).map(|s| JValue::from(s.chars().count())),
        ))
    }

    pub fn substring(_: &mut Evaluator, args: &[Option<JValue>], _: &CallContext<'_>) -> Result<Sequence> {
        let Some(s) = text_arg(args, 0) else {
            return Ok(Sequence::Absent);
        };
        let chars: Vec<char> = s.chars().collect();
        let mut start = number_arg(args, 1).unwrap_or(0.0);
        if chars.len() as f64 + start < 0.0 {
            start = 0.0;
        }
        let result = match number_arg(args, 2) {
            Some(length) if length <= 0.0 => String::new(),
            Some(length) => {
                let end = if start >= 0.0 {
                    start + length
                } else {
                    chars.len() as f64 + start + length
                };
                slice_chars(&chars, start, Some(end))
            }
            None => slice_chars(&chars, start, None),
        };
        Ok(Sequence::from(JValue::from(result)))
    }

    pub fn substring_before(_: &mut Evaluator, args: &[Option<JValue>], _: &CallContext<'_>) -> Result<Sequence> {
        let Some(s) = text_arg(args, 0) else {
            return Ok(Sequence::Absent);
        };
        let result = match text_arg(args, 1).and_then(|chars| s.find(chars)) {
            Some(index) => &s[..index],
            None => s,
        };
        Ok(Sequence::from(JValue::from(result)))
    }

    pub fn substring_after(_: &mut Evaluator, args: &[Option<JValue>], _: &CallContext<'_>) -> Result<Sequence> {
        let Some(s) = text_arg(args, 0) else {
            return Ok(Sequence::Absent);
        };
        let result = match text_arg(args, 1) {
            Some(chars) => match s.find(chars) {
                Some(index) => &s[index + chars.len()..],
                None => s,
            },
            None => s,
        };
        Ok(Sequence::from(JValue::from(result)))
    }

    pub fn uppercase(_: &mut Evaluator, args: &[Option<JValue>], _: &CallContext<'_>) -> Result<Sequence> {
        Ok(Sequence::from(text_arg(args, 0).map(|s| JValue::from(s.to_uppercase()))))
    }

    pub fn lowercase(_: &mut Evaluator, args: &[Option<JValue>], _: &CallContext<'_>) -> Result<Sequence> {
        Ok(Sequence::from(text_arg(args, 0).map(|s| JValue::from(s.to_lowercase()))))
    }

    /// $trim() - Collapse whitespace runs to one space and strip the ends
    pub fn trim(_: &mut Evaluator, args: &[Option<JValue>], _: &CallContext<'_>) -> Result<Sequence> {
        let Some(s) = text_arg(args, 0) else {
            return Ok(Sequence::Absent);
        };
        let mut collapsed = String::with_capacity(s.len());
        let mut in_space = false;
        for c in s.chars() {
            if matches!(c, ' ' | '\t' | '\n' | '\r') {
                if !in_space {
                    collapsed.push(' ');
                }
                in_space = true;
            } else {
                collapsed.push(c);
                in_space = false;
            }
        }
        let trimmed = collapsed.strip_prefix(' ').unwrap_or(&collapsed);
        let trimmed = trimmed.strip_suffix(' ').unwrap_or(trimmed);
        Ok(Sequence::from(JValue::from(trimmed)))
    }

    /// $pad() - Pad to `width` code points; negative widths pad on the left
    pub fn pad(_: &mut Evaluator, args: &[Option<JValue>], _: &CallContext<'_>) -> Result<Sequence> {
        let Some(s) = text_arg(args, 0) else {
            return Ok(Sequence::Absent);
        };
        let width = number_arg(args, 1).unwrap_or(0.0);
        let fill = text_arg(args, 2).filter(|c| !c.is_empty()).unwrap_or(" ");
        let missing = width.abs().trunc() - s.chars().count() as f64;
        if missing <= 0.0 {
            return Ok(Sequence::from(JValue::from(s)));
        }
        let padding: String = fill.chars().cycle().take(missing as usize).collect();
        let result = if width > 0.0 {
            format!("{}{}", s, padding)
        } else {
            format!("{}{}", padding, s)
        };
        Ok(Sequence::from(JValue::from(result)))
    }

    pub fn contains(_: &mut Evaluator, args: &[Option<JValue>], ctx: &CallContext<'_>) -> Result<Sequence> {
        let Some(s) = text_arg(args, 0) else {
            return Ok(Sequence::Absent);
        };
        let found = match pattern_arg(args, 1, ctx.name)? {
            None => return Ok(Sequence::Absent),
            Some(Pattern::Text(token)) => s.contains(token),
            Some(Pattern::Regex(regex)) => match regex.find(s) {
                Some(m) if m.as_str().is_empty() => return Err(zero_length_match()),
                found => found.is_some(),
            },
        };
        Ok(Sequence::from(JValue::Bool(found)))
    }

    pub fn split(_: &mut Evaluator, args: &[Option<JValue>], ctx: &CallContext<'_>) -> Result<Sequence> {
        let Some(s) = text_arg(args, 0) else {
            return Ok(Sequence::Absent);
        };
        let limit = limit_arg(
            args,
            2,
            "D3020",
            "Third argument of split function must evaluate to a positive number",
        )?;
        let parts: Vec<String> = match pattern_arg(args, 1, ctx.name)? {
            None => return Ok(Sequence::Absent),
            Some(Pattern::Text("")) => s.chars().map(String::from).collect(),
            Some(Pattern::Text(separator)) => s.split(separator).map(str::to_string).collect(),
            Some(Pattern::Regex(regex)) => {
                let mut parts = Vec::new();
                let mut start = 0;
                for captures in regex_matches(regex, s)? {
                    if let Some(m) = captures.get(0) {
                        parts.push(s[start..m.start()].to_string());
                        start = m.end();
                    }
                }
                parts.push(s[start..].to_string());
                parts
            }
        };
        Ok(Sequence::array(
            parts.into_iter().take(limit).map(JValue::from).collect(),
        ))
    }

    pub fn join(_: &mut Evaluator, args: &[Option<JValue>], _: &CallContext<'_>) -> Result<Sequence> {
        let Some(strings) = arg(args, 0) else {
            return Ok(Sequence::Absent);
        };
        let separator = text_arg(args, 1).unwrap_or("");
        let joined = strings
            .members()
            .iter()
            .filter_map(JValue::as_str)
            .collect::<Vec<_>>()
            .join(separator);
        Ok(Sequence::from(JValue::from(joined)))
    }

    /// $match() - `{match, index, groups}` for each regex match
    pub fn match_regex(_: &mut Evaluator, args: &[Option<JValue>], ctx: &CallContext<'_>) -> Result<Sequence> {
        let Some(s) = text_arg(args, 0) else {
            return Ok(Sequence::Absent);
        };
        let limit = limit_arg(
            args,
            2,
            "D3040",
            "Third argument of match function must evaluate to a positive number",
        )?;
        let regex = match pattern_arg(args, 1, ctx.name)? {
            Some(Pattern::Regex(regex)) => regex,
            None => return Ok(Sequence::Absent),
            Some(Pattern::Text(text)) => {
                return Err(SignatureError::ArgumentMismatch {
                    index: 2,
                    name: ctx.name.to_string(),
                    value: Some(JValue::from(text)),
                }
                .into())
            }
        };

        let mut results = Vec::new();
        for captures in regex_matches(regex, s)?.into_iter().take(limit) {
            if let Some(m) = captures.get(0) {
                let index = s[..m.start()].chars().count();
                results.push(match_record(m.as_str(), index, captured_groups(&captures)));
            }
        }
        Ok(Sequence::from_items(results))
    }

    /// Expand `$0`, `$1`.. and `$$` in a replacement string
    fn substitute(replacement: &str, matched: &str, groups: &[String]) -> String {
        let bytes = replacement.as_bytes();
        let mut out = String::with_capacity(replacement.len());
        let mut position = 0;
        while let Some(offset) = replacement[position..].find('$') {
            let dollar = position + offset;
            out.push_str(&replacement[position..dollar]);
            position = dollar + 1;
            match bytes.get(position) {
                Some(b'$') => {
                    out.push('$');
                    position += 1;
                }
                Some(b'0') => {
                    out.push_str(matched);
                    position += 1;
                }
                _ => {
                    let max_digits = if groups.is_empty() {
                        1
                    } else {
                        (groups.len() as f64).log10().floor() as usize + 1
                    };
                    let read = |width: usize| -> Option<usize> {
                        let digits: String = replacement[position..]
                            .chars()
                            .take(width)
                            .take_while(char::is_ascii_digit)
                            .collect();
                        digits.parse().ok()
                    };
                    let mut group = read(max_digits);
                    if max_digits > 1 && group.is_some_and(|g| g > groups.len()) {
                        group = read(max_digits - 1);
                    }
                    match group {
                        Some(g) => {
                            if let Some(text) = g.checked_sub(1).and_then(|i| groups.get(i)) {
                                out.push_str(text);
                            }
                            position += g.to_string().len();
                        }
                        None => out.push('$'),
                    }
                }
            }
        }
        out.push_str(&replacement[position..]);
        out
    }

    pub fn replace(ev: &mut Evaluator, args: &[Option<JValue>], ctx: &CallContext<'_>) -> Result<Sequence> {
        let Some(s) = text_arg(args, 0) else {
            return Ok(Sequence::Absent);
        };
        let Some(pattern) = pattern_arg(args, 1, ctx.name)? else {
            return Ok(Sequence::Absent);
        };
        if let Pattern::Text("") = pattern {
            return Err(Error::new(
                "D3010",
                "Second argument of replace function cannot be an empty string",
            ));
        }
        let limit = limit_arg(
            args,
            3,
            "D3011",
            "Fourth argument of replace function must evaluate to a positive number",
        )?;
        let replacement = arg(args, 2);

        let mut replace_one = |matched: &str, index: usize, groups: Vec<String>| -> Result<String> {
            match replacement {
                Some(JValue::String(text)) => Ok(match pattern {
                    Pattern::Text(_) => text.to_string(),
                    Pattern::Regex(_) => substitute(text, matched, &groups),
                }),
                Some(JValue::Function(procedure)) => {
                    let record = match_record(matched, index, groups);
                    match ev.call_function(procedure, vec![Some(record)], ctx)? {
                        Some(JValue::String(text)) => Ok(text.to_string()),
                        other => Err(Error::new(
                            "D3012",
                            "Attempted to replace a matched string with a non-string value",
                        )
                        .with_value(other)),
                    }
                }
                _ => Ok(String::new()),
            }
        };

        let mut out = String::with_capacity(s.len());
        let mut position = 0;
        match pattern {
            Pattern::Text(token) => {
                for (index, _) in s.match_indices(token).take(limit) {
                    out.push_str(&s[position..index]);
                    let char_index = s[..index].chars().count();
                    out.push_str(&replace_one(token, char_index, Vec::new())?);
                    position = index + token.len();
                }
            }
            Pattern::Regex(regex) => {
                for captures in regex_matches(regex, s)?.into_iter().take(limit) {
                    if let Some(m) = captures.get(0) {
                        out.push_str(&s[position..m.start()]);
                        let char_index = s[..m.start()].chars().count();
                        out.push_str(&replace_one(m.as_str(), char_index, captured_groups(&captures))?);
                        position = m.end();
                    }
                }
            }
        }
        out.push_str(&s[position..]);
        Ok(Sequence::from(JValue::from(out)))
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_substitute_groups() {
            let groups = vec!["John".to_string(), "Smith".to_string()];
            assert_eq!(substitute("$2, $1", "John Smith", &groups), "Smith, John");
            assert_eq!(substitute("$0!", "hi", &[]), "hi!");
            assert_eq!(substitute("$$5", "x", &[]), "$5");
            assert_eq!(substitute("$x", "x", &[]), "$x");
            assert_eq!(substitute("[$3]", "x", &groups), "[]");
        }

        #[test]
        fn test_slice_chars_from_end() {
            let chars: Vec<char> = "héllo".chars().collect();
            assert_eq!(slice_chars(&chars, -3.0, None), "llo");
            assert_eq!(slice_chars(&chars, 1.0, Some(3.0)), "él");
            assert_eq!(slice_chars(&chars, 4.0, Some(2.0)), "");
        }
    }
}

/// Built-in numeric functions
pub mod numeric {
    use std::sync::OnceLock;

    use super::*;

    fn decimal_grammar() -> &'static Regex {
        static DECIMAL: OnceLock<Regex> = OnceLock::new();
        DECIMAL.get_or_init(|| {
            Regex::new(r"^-?(0|[1-9][0-9]*)(\.[0-9]+)?([Ee][-+]?[0-9]+)?$")
                .unwrap_or_else(|_| unreachable!("decimal grammar is a valid pattern"))
        })
    }

    /// Numbers of an `a<n>` argument
    fn numbers(args: &[Option<JValue>], index: usize) -> Option<Vec<f64>> {
        arg(args, index).map(|value| value.members().iter().filter_map(JValue::as_f64).collect())
    }

    fn parse_number(text: &str) -> Option<f64> {
        if decimal_grammar().is_match(text) {
            return text.parse::<f64>().ok().filter(|n| n.is_finite());
        }
        let (radix, digits) = match text.get(..2) {
            Some("0x") | Some("0X") => (16, &text[2..]),
            Some("0o") | Some("0O") => (8, &text[2..]),
            Some("0b") | Some("0B") => (2, &text[2..]),
            _ => return None,
        };
        i64::from_str_radix(digits, radix).ok().map(|n| n as f64)
    }

    /// $number() - Cast a string or boolean to a number
    pub fn number(_: &mut Evaluator, args: &[Option<JValue>], _: &CallContext<'_>) -> Result<Sequence> {
        let Some(value) = arg(args, 0) else {
            return Ok(Sequence::Absent);
        };
        let n = match value {
            JValue::Number(n) => Some(*n),
            JValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            JValue::String(s) => parse_number(s),
            _ => None,
        };
        match n {
            Some(n) => Ok(Sequence::from(JValue::Number(n))),
            None => Err(Error::new(
                "D3030",
                format!("Unable to cast value to a number: {}", value),
            )
            .with_value(Some(value.clone()))),
        }
    }

    pub fn abs(_: &mut Evaluator, args: &[Option<JValue>], _: &CallContext<'_>) -> Result<Sequence> {
        Ok(Sequence::from(number_arg(args, 0).map(|n| JValue::Number(n.abs()))))
    }

    pub fn floor(_: &mut Evaluator, args: &[Option<JValue>], _: &CallContext<'_>) -> Result<Sequence> {
        Ok(Sequence::from(number_arg(args, 0).map(|n| JValue::Number(n.floor()))))
    }

    pub fn ceil(_: &mut Evaluator, args: &[Option<JValue>], _: &CallContext<'_>) -> Result<Sequence> {
        Ok(Sequence::from(number_arg(args, 0).map(|n| JValue::Number(n.ceil()))))
    }

    /// Move the decimal point through the text form, avoiding binary scaling error
    fn shift(value: f64, places: i32) -> f64 {
        format!("{}e{}", value, places).parse().unwrap_or(value)
    }

    /// Round half to even at `precision` decimal places
    pub fn round_half_even(value: f64, precision: i32) -> f64 {
        let shifted = if precision != 0 { shift(value, precision) } else { value };
        let mut result = (shifted + 0.5).floor();
        if (result - shifted).abs() == 0.5 && (result % 2.0).abs() == 1.0 {
            result -= 1.0;
        }
        if precision != 0 {
            result = shift(result, -precision);
        }
        if result == 0.0 {
            0.0
        } else {
            result
        }
    }

    pub fn round(_: &mut Evaluator, args: &[Option<JValue>], _: &CallContext<'_>) -> Result<Sequence> {
        let Some(value) = number_arg(args, 0) else {
            return Ok(Sequence::Absent);
        };
        let precision = number_arg(args, 1).map_or(0, |p| p as i32);
        Ok(Sequence::from(JValue::Number(round_half_even(value, precision))))
    }

    pub fn power(_: &mut Evaluator, args: &[Option<JValue>], _: &CallContext<'_>) -> Result<Sequence> {
        let (Some(base), Some(exponent)) = (number_arg(args, 0), number_arg(args, 1)) else {
            return Ok(Sequence::Absent);
        };
        let result = base.powf(exponent);
        if !result.is_finite() {
            return Err(Error::new(
                "D3061",
                format!(
                    "The power function has resulted in a value that cannot be represented as a JSON number: base={}, exponent={}",
                    JValue::Number(base),
                    JValue::Number(exponent)
                ),
            )
            .with_value(Some(JValue::Number(base))));
        }
        Ok(Sequence::from(JValue::Number(result)))
    }

    pub fn sqrt(_: &mut Evaluator, args: &[Option<JValue>], _: &CallContext<'_>) -> Result<Sequence> {
        let Some(n) = number_arg(args, 0) else {
            return Ok(Sequence::Absent);
        };
        if n < 0.0 {
            return Err(Error::new(
                "D3060",
                format!("The sqrt function cannot be applied to a negative number: {}", JValue::Number(n)),
            )
            .with_value(Some(JValue::Number(n))));
        }
        Ok(Sequence::from(JValue::Number(n.sqrt())))
    }

    /// $sum() - Sum array of numbers
    pub fn sum(_: &mut Evaluator, args: &[Option<JValue>], _: &CallContext<'_>) -> Result<Sequence> {
        Ok(Sequence::from(
            numbers(args, 0).map(|ns| JValue::Number(ns.iter().sum())),
        ))
    }

    pub fn max(_: &mut Evaluator, args: &[Option<JValue>], _: &CallContext<'_>) -> Result<Sequence> {
        Ok(Sequence::from(
            numbers(args, 0)
                .and_then(|ns| ns.into_iter().reduce(f64::max))
                .map(JValue::Number),
        ))
    }

    pub fn min(_: &mut Evaluator, args: &[Option<JValue>], _: &CallContext<'_>) -> Result<Sequence> {
        Ok(Sequence::from(
            numbers(args, 0)
                .and_then(|ns| ns.into_iter().reduce(f64::min))
                .map(JValue::Number),
        ))
    }

    pub fn average(_: &mut Evaluator, args: &[Option<JValue>], _: &CallContext<'_>) -> Result<Sequence> {
        Ok(Sequence::from(numbers(args, 0).and_then(|ns| {
            if ns.is_empty() {
                None
            } else {
                Some(JValue::Number(ns.iter().sum::<f64>() / ns.len() as f64))
            }
        })))
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_round_half_even() {
            assert_eq!(round_half_even(2.5, 0), 2.0);
            assert_eq!(round_half_even(3.5, 0), 4.0);
            assert_eq!(round_half_even(-2.5, 0), -2.0);
            assert_eq!(round_half_even(2.675, 2), 2.68);
            assert_eq!(round_half_even(125.0, -1), 120.0);
            assert_eq!(round_half_even(-0.4, 0), 0.0);
        }

        #[test]
        fn test_parse_number_grammar() {
            assert_eq!(parse_number("12.5e1"), Some(125.0));
            assert_eq!(parse_number("-0.5"), Some(-0.5));
            assert_eq!(parse_number("0x1F"), Some(31.0));
            assert_eq!(parse_number("0b101"), Some(5.0));
            assert_eq!(parse_number("012"), None);
            assert_eq!(parse_number(" 1"), None);
            assert_eq!(parse_number("1e400"), None);
        }
    }
}

/// Built-in boolean functions
pub mod boolean {
    use super::*;

    pub fn boolean(_: &mut Evaluator, args: &[Option<JValue>], _: &CallContext<'_>) -> Result<Sequence> {
        Ok(Sequence::from(arg(args, 0).map(|v| JValue::Bool(v.truthy()))))
    }

    pub fn not(_: &mut Evaluator, args: &[Option<JValue>], _: &CallContext<'_>) -> Result<Sequence> {
        Ok(Sequence::from(arg(args, 0).map(|v| JValue::Bool(!v.truthy()))))
    }

    pub fn exists(_: &mut Evaluator, args: &[Option<JValue>], _: &CallContext<'_>) -> Result<Sequence> {
        Ok(Sequence::from(JValue::Bool(arg(args, 0).is_some())))
    }
}

/// Built-in array functions
pub mod array {
    use super::*;

    /// $count() - Count array elements
    pub fn count(_: &mut Evaluator, args: &[Option<JValue>], _: &CallContext<'_>) -> Result<Sequence> {
        let count = arg(args, 0).map_or(0, |v| v.members().len());
        Ok(Sequence::from(JValue::from(count)))
    }

    /// $append() - Concatenate two values as arrays
    pub fn append(_: &mut Evaluator, args: &[Option<JValue>], _: &CallContext<'_>) -> Result<Sequence> {
        match (arg(args, 0), arg(args, 1)) {
            (None, second) => Ok(Sequence::from(second.cloned())),
            (Some(first), None) => Ok(Sequence::from(first.clone())),
            (Some(first), Some(second)) => {
                let mut items = first.members().to_vec();
                items.extend(second.members().iter().cloned());
                Ok(if first.is_array() {
                    Sequence::array(items)
                } else {
                    Sequence::from_items(items)
                })
            }
        }
    }

    pub fn reverse(_: &mut Evaluator, args: &[Option<JValue>], _: &CallContext<'_>) -> Result<Sequence> {
        let Some(value) = arg(args, 0) else {
            return Ok(Sequence::Absent);
        };
        let mut items = value.members().to_vec();
        items.reverse();
        Ok(Sequence::array(items))
    }

    /// Stable merge sort; `after(a, b)` says whether `a` belongs after `b`
    fn merge_sort(
        mut items: Vec<JValue>,
        after: &mut dyn FnMut(&JValue, &JValue) -> Result<bool>,
    ) -> Result<Vec<JValue>> {
        if items.len() <= 1 {
            return Ok(items);
        }
        let right = items.split_off(items.len() / 2);
        let left = merge_sort(items, after)?;
        let right = merge_sort(right, after)?;

        let mut merged = Vec::with_capacity(left.len() + right.len());
        let mut left = left.into_iter().peekable();
        let mut right = right.into_iter().peekable();
        while let (Some(l), Some(r)) = (left.peek(), right.peek()) {
            let take_right = after(l, r)?;
            if take_right {
                merged.extend(right.next());
            } else {
                merged.extend(left.next());
            }
        }
        merged.extend(left);
        merged.extend(right);
        Ok(merged)
    }

    /// $sort() - Sort by natural order, or by a comparator `function($a, $b)`
    /// returning true when `$a` should come after `$b`
    pub fn sort(ev: &mut Evaluator, args: &[Option<JValue>], ctx: &CallContext<'_>) -> Result<Sequence> {
        let Some(value) = arg(args, 0) else {
            return Ok(Sequence::Absent);
        };
        let items = value.members().to_vec();
        if items.len() <= 1 {
            return Ok(Sequence::array(items));
        }

        let sorted = match arg(args, 1).and_then(JValue::as_procedure) {
            Some(comparator) => merge_sort(items, &mut |a, b| {
                Ok(ev
                    .call_function(comparator, vec![Some(a.clone()), Some(b.clone())], ctx)?
                    .is_some_and(|v| v.truthy()))
            })?,
            None => {
                let all_numbers = items.iter().all(JValue::is_number);
                let all_strings = items.iter().all(JValue::is_string);
                if !all_numbers && !all_strings {
                    return Err(Error::new(
                        "D3070",
                        "The single argument form of the sort function can only be applied to an array of strings or an array of numbers.  Use the second argument to specify a comparison function",
                    )
                    .with_value(Some(value.clone())));
                }
                merge_sort(items, &mut |a, b| {
                    Ok(match (a, b) {
                        (JValue::Number(x), JValue::Number(y)) => x > y,
                        (JValue::String(x), JValue::String(y)) => x > y,
                        _ => false,
                    })
                })?
            }
        };
        Ok(Sequence::array(sorted))
    }

    /// $distinct() - Drop repeated values, keeping first occurrences
    pub fn distinct(_: &mut Evaluator, args: &[Option<JValue>], _: &CallContext<'_>) -> Result<Sequence> {
        let Some(value) = arg(args, 0) else {
            return Ok(Sequence::Absent);
        };
        let JValue::Array(items) = value else {
            return Ok(Sequence::from(value.clone()));
        };
        let mut unique: Vec<JValue> = Vec::with_capacity(items.len());
        for item in items.iter() {
            if !unique.contains(item) {
                unique.push(item.clone());
            }
        }
        Ok(Sequence::array(unique))
    }

    /// $zip() - Tuples of same-index elements, as long as the shortest input
    pub fn zip(_: &mut Evaluator, args: &[Option<JValue>], _: &CallContext<'_>) -> Result<Sequence> {
        let arrays: Vec<&[JValue]> = args.iter().flatten().map(JValue::members).collect();
        let length = arrays.iter().map(|a| a.len()).min().unwrap_or(0);
        let tuples = (0..length)
            .map(|i| JValue::array(arrays.iter().map(|a| a[i].clone()).collect()))
            .collect();
        Ok(Sequence::array(tuples))
    }
}

/// Built-in object functions
pub mod object {
    use super::*;

    /// $keys() - Get object keys; for an array, the union over its objects
    pub fn keys(_: &mut Evaluator, args: &[Option<JValue>], _: &CallContext<'_>) -> Result<Sequence> {
        let mut keys: Vec<String> = Vec::new();
        match arg(args, 0) {
            Some(JValue::Object(map)) => keys.extend(map.keys().cloned()),
            Some(JValue::Array(items)) => {
                for map in items.iter().filter_map(JValue::as_object) {
                    for key in map.keys() {
                        if !keys.contains(key) {
                            keys.push(key.clone());
                        }
                    }
                }
            }
            _ => return Ok(Sequence::Absent),
        }
        Ok(Sequence::from_items(keys.into_iter().map(JValue::from).collect()))
    }

    pub fn lookup(_: &mut Evaluator, args: &[Option<JValue>], _: &CallContext<'_>) -> Result<Sequence> {
        let (Some(value), Some(key)) = (arg(args, 0), text_arg(args, 1)) else {
            return Ok(Sequence::Absent);
        };
        Ok(crate::evaluator::lookup_field(&Sequence::from(value.clone()), key))
    }

    fn spread_into(value: &JValue, out: &mut Vec<JValue>) {
        match value {
            JValue::Array(items) => items.iter().for_each(|item| spread_into(item, out)),
            JValue::Object(map) => {
                for (key, value) in map.iter() {
                    let mut single = IndexMap::with_capacity(1);
                    single.insert(key.clone(), value.clone());
                    out.push(JValue::object(single));
                }
            }
            other => out.push(other.clone()),
        }
    }

    /// $spread() - Split objects into one single-key object per field
    pub fn spread(_: &mut Evaluator, args: &[Option<JValue>], _: &CallContext<'_>) -> Result<Sequence> {
        let Some(value) = arg(args, 0) else {
            return Ok(Sequence::Absent);
        };
        let mut out = Vec::new();
        spread_into(value, &mut out);
        Ok(Sequence::from_items(out))
    }

    /// $merge() - Merge an array of objects; later keys win
    pub fn merge(_: &mut Evaluator, args: &[Option<JValue>], _: &CallContext<'_>) -> Result<Sequence> {
        let Some(value) = arg(args, 0) else {
            return Ok(Sequence::Absent);
        };
        let mut merged = IndexMap::new();
        for map in value.members().iter().filter_map(JValue::as_object) {
            for (key, value) in map.iter() {
                merged.insert(key.clone(), value.clone());
            }
        }
        Ok(Sequence::from(JValue::object(merged)))
    }

    /// $each() - Apply `function($value, $key, $object)` to every field
    pub fn each(ev: &mut Evaluator, args: &[Option<JValue>], ctx: &CallContext<'_>) -> Result<Sequence> {
        let (Some(object), Some(f)) = (arg(args, 0), arg(args, 1).and_then(JValue::as_procedure)) else {
            return Ok(Sequence::Absent);
        };
        let Some(map) = object.as_object() else {
            return Ok(Sequence::Absent);
        };
        let mut results = Vec::with_capacity(map.len());
        for (key, value) in map.iter() {
            let call_args = vec![Some(value.clone()), Some(JValue::from(key.as_str())), Some(object.clone())];
            results.extend(ev.call_function(f, call_args, ctx)?);
        }
        Ok(Sequence::from_items(results))
    }

    /// $sift() - Keep the fields for which `function($value, $key, $object)` is truthy
    pub fn sift(ev: &mut Evaluator, args: &[Option<JValue>], ctx: &CallContext<'_>) -> Result<Sequence> {
        let (Some(object), Some(f)) = (arg(args, 0), arg(args, 1).and_then(JValue::as_procedure)) else {
            return Ok(Sequence::Absent);
        };
        let Some(map) = object.as_object() else {
            return Ok(Sequence::Absent);
        };
        let mut kept = IndexMap::new();
        for (key, value) in map.iter() {
            let call_args = vec![Some(value.clone()), Some(JValue::from(key.as_str())), Some(object.clone())];
            if ev.call_function(f, call_args, ctx)?.is_some_and(|v| v.truthy()) {
                kept.insert(key.clone(), value.clone());
            }
        }
        Ok(if kept.is_empty() {
            Sequence::Absent
        } else {
            Sequence::from(JValue::object(kept))
        })
    }

    pub fn type_of(_: &mut Evaluator, args: &[Option<JValue>], _: &CallContext<'_>) -> Result<Sequence> {
        Ok(Sequence::from(arg(args, 0).map(|v| JValue::from(v.type_name()))))
    }

    pub fn error(_: &mut Evaluator, args: &[Option<JValue>], _: &CallContext<'_>) -> Result<Sequence> {
        let message = text_arg(args, 0).unwrap_or("$error() function evaluated");
        Err(Error::new("D3137", message))
    }

    pub fn assert(_: &mut Evaluator, args: &[Option<JValue>], _: &CallContext<'_>) -> Result<Sequence> {
        if arg(args, 0).is_some_and(JValue::truthy) {
            return Ok(Sequence::Absent);
        }
        let message = text_arg(args, 1).unwrap_or("$assert() statement failed");
        Err(Error::new("D3141", message))
    }
}

/// Higher-order functions and `$eval`
pub mod hof {
    use super::*;

    /// $map() - Apply `function($value, $index, $array)` to each element
    pub fn map(ev: &mut Evaluator, args: &[Option<JValue>], ctx: &CallContext<'_>) -> Result<Sequence> {
        let (Some(array), Some(f)) = (arg(args, 0), arg(args, 1).and_then(JValue::as_procedure)) else {
            return Ok(Sequence::Absent);
        };
        let mut results = Vec::new();
        for (index, item) in array.members().iter().enumerate() {
            results.extend(ev.call_function(f, element_args(item, index, array), ctx)?);
        }
        Ok(Sequence::from_items(results))
    }

    /// $filter() - Elements for which the predicate is truthy; absent when none are
    pub fn filter(ev: &mut Evaluator, args: &[Option<JValue>], ctx: &CallContext<'_>) -> Result<Sequence> {
        let (Some(array), Some(f)) = (arg(args, 0), arg(args, 1).and_then(JValue::as_procedure)) else {
            return Ok(Sequence::Absent);
        };
        let mut kept = Vec::new();
        for (index, item) in array.members().iter().enumerate() {
            if ev
                .call_function(f, element_args(item, index, array), ctx)?
                .is_some_and(|v| v.truthy())
            {
                kept.push(item.clone());
            }
        }
        Ok(Sequence::from_items(kept))
    }

    /// $single() - The one element matching the predicate
    pub fn single(ev: &mut Evaluator, args: &[Option<JValue>], ctx: &CallContext<'_>) -> Result<Sequence> {
        let Some(array) = arg(args, 0) else {
            return Ok(Sequence::Absent);
        };
        let predicate = arg(args, 1).and_then(JValue::as_procedure);
        let mut found: Option<JValue> = None;
        for (index, item) in array.members().iter().enumerate() {
            let matches = match predicate {
                Some(f) => ev
                    .call_function(f, element_args(item, index, array), ctx)?
                    .is_some_and(|v| v.truthy()),
                None => true,
            };
            if !matches {
                continue;
            }
            if found.is_some() {
                return Err(Error::new(
                    "D3138",
                    "The $single() function expected exactly 1 matching result.  Instead it matched more.",
                ));
            }
            found = Some(item.clone());
        }
        match found {
            Some(item) => Ok(Sequence::from(item)),
            None => Err(Error::new(
                "D3139",
                "The $single() function expected exactly 1 matching result.  Instead it matched 0.",
            )),
        }
    }

    /// $reduce() - Fold with `function($acc, $value[, $index[, $array]])`
    pub fn reduce(ev: &mut Evaluator, args: &[Option<JValue>], ctx: &CallContext<'_>) -> Result<Sequence> {
        let (Some(array), Some(f)) = (arg(args, 0), arg(args, 1).and_then(JValue::as_procedure)) else {
            return Ok(Sequence::Absent);
        };
        if f.arity() < 2 {
            return Err(Error::new(
                "D3050",
                "The second argument of reduce function must be a function with at least two arguments",
            ));
        }
        let items = array.members();
        let (mut accumulator, start) = match arg(args, 2) {
            Some(init) => (Some(init.clone()), 0),
            None => (items.first().cloned(), 1),
        };
        for (index, item) in items.iter().enumerate().skip(start) {
            let call_args = vec![
                accumulator.take(),
                Some(item.clone()),
                Some(JValue::from(index)),
                Some(array.clone()),
            ];
            accumulator = ev.call_function(f, call_args, ctx)?;
        }
        Ok(Sequence::from(accumulator))
    }

    /// $eval() - Compile and evaluate an expression held in a string
    pub fn eval(ev: &mut Evaluator, args: &[Option<JValue>], ctx: &CallContext<'_>) -> Result<Sequence> {
        let Some(source) = text_arg(args, 0) else {
            return Ok(Sequence::Absent);
        };
        let ast = crate::optimizer::optimize(crate::parser::parse(source)?)?;
        let input = match arg(args, 1) {
            Some(focus) => Sequence::from(focus.clone()),
            None => ctx.input.clone(),
        };
        ev.evaluate(&ast, &input, ctx.env)
    }
}

/// Date and time functions
pub mod date {
    use super::*;
    use crate::datetime;

    /// $now() - Evaluation timestamp as ISO 8601
    pub fn now(ev: &mut Evaluator, _: &[Option<JValue>], _: &CallContext<'_>) -> Result<Sequence> {
        Ok(Sequence::from(JValue::from(datetime::format_iso8601(&ev.timestamp()))))
    }

    /// $millis() - Evaluation timestamp in milliseconds since the epoch
    pub fn millis(ev: &mut Evaluator, _: &[Option<JValue>], _: &CallContext<'_>) -> Result<Sequence> {
        Ok(Sequence::from(JValue::from_i64(ev.timestamp().timestamp_millis())))
    }

    pub fn from_millis(_: &mut Evaluator, args: &[Option<JValue>], _: &CallContext<'_>) -> Result<Sequence> {
        let Some(millis) = number_arg(args, 0) else {
            return Ok(Sequence::Absent);
        };
        Ok(Sequence::from(JValue::from(datetime::from_millis(millis)?)))
    }

    pub fn to_millis(_: &mut Evaluator, args: &[Option<JValue>], _: &CallContext<'_>) -> Result<Sequence> {
        let Some(timestamp) = text_arg(args, 0) else {
            return Ok(Sequence::Absent);
        };
        Ok(Sequence::from(JValue::from_i64(datetime::to_millis(timestamp)?)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jvalue;

    fn eval(source: &str, input: JValue) -> Result<Option<JValue>> {
        crate::evaluate(source, &input)
    }

    fn ok(source: &str) -> Option<JValue> {
        match eval(source, JValue::Null) {
            Ok(value) => value,
            Err(e) => panic!("{} failed: {}", source, e),
        }
    }

    fn code(source: &str) -> &'static str {
        match eval(source, JValue::Null) {
            Ok(value) => panic!("{} should fail, got {:?}", source, value),
            Err(e) => e.code,
        }
    }

    #[test]
    fn test_registry_builds() {
        let root = root_env().unwrap();
        for (name, _, _) in NATIVES {
            assert!(root.contains(name), "missing ${}", name);
        }
    }

    #[test]
    fn test_string_functions() {
        assert_eq!(ok("$string(1.0)"), Some(JValue::from("1")));
        assert_eq!(ok("$string({'a': [1, true]})"), Some(JValue::from("{\"a\":[1,true]}")));
        assert_eq!(ok("$string(0.1 + 0.2)"), Some(JValue::from("0.3")));
        assert_eq!(code("$string(1/0)"), "D3001");
        assert_eq!(ok("$length('héllo')"), Some(JValue::from(5i64)));
        assert_eq!(ok("$substring('hello world', 3, 5)"), Some(JValue::from("lo wo")));
        assert_eq!(ok("$substring('hello', -3)"), Some(JValue::from("llo")));
        assert_eq!(ok("$substringBefore('a-b-c', '-')"), Some(JValue::from("a")));
        assert_eq!(ok("$substringAfter('a-b-c', '-')"), Some(JValue::from("b-c")));
        assert_eq!(ok("$uppercase('abc')"), Some(JValue::from("ABC")));
        assert_eq!(ok("$lowercase('ABC')"), Some(JValue::from("abc")));
        assert_eq!(ok("$trim('  a \t\n b  ')"), Some(JValue::from("a b")));
        assert_eq!(ok("$pad('x', 3)"), Some(JValue::from("x  ")));
        assert_eq!(ok("$pad('x', -4, 'ab')"), Some(JValue::from("abax")));
        assert_eq!(ok("$join(['a', 'b', 'c'], ',')"), Some(JValue::from("a,b,c")));
        assert_eq!(ok("$uppercase(missing)"), None);
    }

    #[test]
    fn test_context_argument() {
        let data = jvalue!({"name": "ada"});
        assert_eq!(eval("name.$uppercase()", data).unwrap(), Some(JValue::from("ADA")));
    }

    #[test]
    fn test_regex_functions() {
        assert_eq!(ok("$contains('abracadabra', /a.r/)"), Some(JValue::Bool(true)));
        assert_eq!(ok("$contains('abc', 'd')"), Some(JValue::Bool(false)));
        assert_eq!(ok("$split('a1b22c', /[0-9]+/)"), Some(jvalue!(["a", "b", "c"])));
        assert_eq!(ok("$split('a,b,c', ',', 2)"), Some(jvalue!(["a", "b"])));
        assert_eq!(ok("$split('abc', '')"), Some(jvalue!(["a", "b", "c"])));
        assert_eq!(code("$split('a,b', ',', -1)"), "D3020");
        assert_eq!(
            ok("$match('ab12cd3', /[0-9]+/)"),
            Some(jvalue!([
                {"match": "12", "index": 2, "groups": []},
                {"match": "3", "index": 6, "groups": []}
            ]))
        );
        assert_eq!(code("$match('abc', /x*/)"), "D1004");
        assert_eq!(code("$match('abc', /b/, -1)"), "D3040");
    }

    #[test]
    fn test_replace() {
        assert_eq!(ok("$replace('a-b-c', '-', '+')"), Some(JValue::from("a+b+c")));
        assert_eq!(ok("$replace('a-b-c', '-', '+', 1)"), Some(JValue::from("a+b-c")));
        assert_eq!(
            ok("$replace('John Smith', /(\\w+)\\s(\\w+)/, '$2, $1')"),
            Some(JValue::from("Smith, John"))
        );
        assert_eq!(
            ok("$replace('abc', /b/, function($m) { $uppercase($m.match) })"),
            Some(JValue::from("aBc"))
        );
        assert_eq!(code("$replace('abc', '', 'x')"), "D3010");
        assert_eq!(code("$replace('abc', 'b', 'x', -2)"), "D3011");
        assert_eq!(code("$replace('abc', /b/, function($m) { 1 })"), "D3012");
        assert_eq!(code("$replace('abc', /x?/, 'y')"), "D1004");
    }

    #[test]
    fn test_numeric_functions() {
        assert_eq!(ok("$number('12.5')"), Some(JValue::from(12.5)));
        assert_eq!(ok("$number(true)"), Some(JValue::from(1i64)));
        assert_eq!(code("$number('abc')"), "D3030");
        assert_eq!(ok("$abs(-3)"), Some(JValue::from(3i64)));
        assert_eq!(ok("$floor(2.7)"), Some(JValue::from(2i64)));
        assert_eq!(ok("$ceil(2.1)"), Some(JValue::from(3i64)));
        assert_eq!(ok("$round(2.5)"), Some(JValue::from(2i64)));
        assert_eq!(ok("$round(3.14159, 2)"), Some(JValue::from(3.14)));
        assert_eq!(ok("$power(2, 10)"), Some(JValue::from(1024i64)));
        assert_eq!(code("$power(10, 400)"), "D3061");
        assert_eq!(ok("$sqrt(16)"), Some(JValue::from(4i64)));
        assert_eq!(code("$sqrt(-1)"), "D3060");
        assert_eq!(ok("$sum([1, 2, 3])"), Some(JValue::from(6i64)));
        assert_eq!(ok("$max([1, 5, 3])"), Some(JValue::from(5i64)));
        assert_eq!(ok("$min([4, 2, 8])"), Some(JValue::from(2i64)));
        assert_eq!(ok("$average([1, 2, 3, 4])"), Some(JValue::from(2.5)));
        assert_eq!(ok("$max([])"), None);
        assert_eq!(ok("$sum(5)"), Some(JValue::from(5i64)));
        assert_eq!(code("$sum(['a'])"), "T0412");
    }

    #[test]
    fn test_boolean_functions() {
        assert_eq!(ok("$boolean([])"), Some(JValue::Bool(false)));
        assert_eq!(ok("$boolean([0, 1])"), Some(JValue::Bool(true)));
        assert_eq!(ok("$not('')"), Some(JValue::Bool(true)));
        assert_eq!(ok("$exists(missing)"), Some(JValue::Bool(false)));
        assert_eq!(ok("$exists(null)"), Some(JValue::Bool(true)));
    }

    #[test]
    fn test_array_functions() {
        assert_eq!(ok("$count([1, 2, 3])"), Some(JValue::from(3i64)));
        assert_eq!(ok("$count(missing)"), Some(JValue::from(0i64)));
        assert_eq!(ok("$append([1, 2], 3)"), Some(jvalue!([1, 2, 3])));
        assert_eq!(ok("$append(missing, [1])"), Some(jvalue!([1])));
        assert_eq!(ok("$reverse([1, 2, 3])"), Some(jvalue!([3, 2, 1])));
        assert_eq!(ok("$distinct([1, 2, 1, 3, 2])"), Some(jvalue!([1, 2, 3])));
        assert_eq!(ok("$zip([1, 2, 3], [4, 5])"), Some(jvalue!([[1, 4], [2, 5]])));
    }

    #[test]
    fn test_sort() {
        assert_eq!(ok("$sort(['b', 'a', 'c'])"), Some(jvalue!(["a", "b", "c"])));
        assert_eq!(ok("$sort([3, 1, 2])"), Some(jvalue!([1, 2, 3])));
        assert_eq!(code("$sort([1, 'two', 3])"), "D3070");
        assert_eq!(
            ok("$sort([1, 3, 2], function($a, $b) { $a < $b })"),
            Some(jvalue!([3, 2, 1]))
        );
        // equal keys keep their input order
        assert_eq!(
            ok("$sort([{'k': 1, 'i': 0}, {'k': 0, 'i': 1}, {'k': 1, 'i': 2}], function($a, $b) { $a.k > $b.k }).i"),
            Some(jvalue!([1, 0, 2]))
        );
    }

    #[test]
    fn test_object_functions() {
        let data = jvalue!({"a": 1, "b": {"c": 2}});
        assert_eq!(eval("$keys($)", data.clone()).unwrap(), Some(jvalue!(["a", "b"])));
        assert_eq!(eval("$lookup($, 'a')", data.clone()).unwrap(), Some(JValue::from(1i64)));
        assert_eq!(
            eval("$spread($)", data.clone()).unwrap(),
            Some(jvalue!([{"a": 1}, {"b": {"c": 2}}]))
        );
        assert_eq!(
            ok("$merge([{'a': 1}, {'b': 2}, {'a': 3}])"),
            Some(jvalue!({"a": 3, "b": 2}))
        );
        assert_eq!(
            eval("$each($, function($v, $k) { $k })", data.clone()).unwrap(),
            Some(jvalue!(["a", "b"]))
        );
        assert_eq!(
            eval("$sift($, function($v) { $type($v) = 'number' })", data).unwrap(),
            Some(jvalue!({"a": 1}))
        );
        assert_eq!(ok("$type('x')"), Some(JValue::from("string")));
        assert_eq!(ok("$type(function() { 1 })"), Some(JValue::from("function")));
        assert_eq!(ok("$type(missing)"), None);
    }

    #[test]
    fn test_error_and_assert() {
        let err = eval("$error('boom')", JValue::Null).unwrap_err();
        assert_eq!(err.code, "D3137");
        assert_eq!(err.message, "boom");
        assert_eq!(code("$assert(1 = 2, 'nope')"), "D3141");
        assert_eq!(ok("$assert(1 = 1)"), None);
        assert_eq!(code("$assert('yes')"), "T0410");
    }

    #[test]
    fn test_higher_order_functions() {
        assert_eq!(ok("$map([1, 2, 3], function($v) { $v * 2 })"), Some(jvalue!([2, 4, 6])));
        assert_eq!(ok("$map([1, 2], function($v, $i) { $i })"), Some(jvalue!([0, 1])));
        assert_eq!(ok("$map([5], function($v) { $v })"), Some(JValue::from(5i64)));
        assert_eq!(ok("$filter([1, 2, 3, 4], function($v) { $v % 2 = 0 })"), Some(jvalue!([2, 4])));
        assert_eq!(ok("$filter([1, 2], function($x) { $x > 5 })"), None);
        assert_eq!(ok("$single([1, 2, 3], function($v) { $v = 2 })"), Some(JValue::from(2i64)));
        assert_eq!(code("$single([1, 2, 3], function($v) { $v > 1 })"), "D3138");
        assert_eq!(code("$single([1, 2, 3], function($v) { $v > 5 })"), "D3139");
        assert_eq!(
            ok("$reduce([1, 2, 3, 4], function($acc, $v) { $acc + $v })"),
            Some(JValue::from(10i64))
        );
        assert_eq!(
            ok("$reduce([1, 2, 3], function($acc, $v) { $acc + $v }, 10)"),
            Some(JValue::from(16i64))
        );
        assert_eq!(code("$reduce([1, 2], function($v) { $v })"), "D3050");
        assert_eq!(ok("$map([1, 2], $string)"), Some(jvalue!(["1", "2"])));
    }

    #[test]
    fn test_eval() {
        assert_eq!(ok("$eval('1 + 2')"), Some(JValue::from(3i64)));
        assert_eq!(eval("$eval('a * 2')", jvalue!({"a": 21})).unwrap(), Some(JValue::from(42i64)));
        assert_eq!(ok("$eval('x', {'x': 'y'})"), Some(JValue::from("y")));
        assert_eq!(code("$eval('1 +')"), "S0207");
    }

    #[test]
    fn test_date_functions() {
        assert_eq!(
            ok("$fromMillis(1510067274972)"),
            Some(JValue::from("2017-11-07T15:07:54.972Z"))
        );
        assert_eq!(
            ok("$toMillis('2017-11-07T15:07:54.972Z')"),
            Some(JValue::from(1510067274972i64))
        );
        assert_eq!(code("$toMillis('not a date')"), "D3110");
        assert_eq!(ok("$now() = $now()"), Some(JValue::Bool(true)));
        assert_eq!(ok("$toMillis($now()) = $millis()"), Some(JValue::Bool(true)));
    }
}
