// Sequence: the evaluator's uniform result box
// Distinguishes absence, a value that began life as a single value, and a multi-value sequence

use crate::procedure::Procedure;
use crate::value::JValue;

/// Result of evaluating any expression.
///
/// - `Absent` is the "no value" result. It never appears inside arrays.
/// - `Scalar` holds exactly one value as it was produced, including whole arrays.
/// - `Values` is a flattened sequence of two or more values, or a single value
///   the path asked to keep in array form (`keep_singleton`).
///
/// An empty `Values` is never built; the constructors normalise it to `Absent`.
/// An explicit array constructor that ends up empty is `Scalar(Array([]))`, so
/// it still prints as `[]`.
#[derive(Clone, Debug, PartialEq)]
pub enum Sequence {
    Absent,
    Scalar(JValue),
    Values {
        items: Vec<JValue>,
        keep_singleton: bool,
    },
}

impl Default for Sequence {
    fn default() -> Self {
        Sequence::Absent
    }
}

impl From<JValue> for Sequence {
    #[inline]
    fn from(value: JValue) -> Self {
        Sequence::Scalar(value)
    }
}

impl From<Option<JValue>> for Sequence {
    #[inline]
    fn from(value: Option<JValue>) -> Self {
        value.map_or(Sequence::Absent, Sequence::Scalar)
    }
}

// ── Construction ─────────────────────────────────────────────────────────────

impl Sequence {
    /// Build a sequence from collected items, collapsing the empty and singleton cases
    pub fn from_items(mut items: Vec<JValue>) -> Self {
        match items.len() {
            0 => Sequence::Absent,
            1 => Sequence::Scalar(items.remove(0)),
            _ => Sequence::Values {
                items,
                keep_singleton: false,
            },
        }
    }

    /// Array result that must survive as an array even when empty or singleton
    #[inline]
    pub fn array(items: Vec<JValue>) -> Self {
        Sequence::Scalar(JValue::array(items))
    }

    /// A singleton `Values` without the keep flag becomes the value itself.
    ///
    /// Applied to every evaluation result, so callers never observe a
    /// one-element sequence unless a path asked for array form.
    pub fn collapse(self) -> Self {
        match self {
            Sequence::Values {
                mut items,
                keep_singleton: false,
            } if items.len() == 1 => Sequence::Scalar(items.remove(0)),
            Sequence::Values { items, .. } if items.is_empty() => Sequence::Absent,
            other => other,
        }
    }

    /// Force array form for the `[]` path suffix
    pub fn keep_singleton(self) -> Self {
        match self {
            Sequence::Absent => Sequence::Absent,
            Sequence::Scalar(JValue::Array(arr)) => Sequence::Scalar(JValue::Array(arr)),
            Sequence::Scalar(value) => Sequence::Values {
                items: vec![value],
                keep_singleton: true,
            },
            Sequence::Values { items, .. } => Sequence::Values {
                items,
                keep_singleton: true,
            },
        }
    }
}

// ── Inspection ───────────────────────────────────────────────────────────────

impl Sequence {
    #[inline]
    pub fn is_absent(&self) -> bool {
        matches!(self, Sequence::Absent)
    }

    /// A sequence of several values, as opposed to one value or absence
    #[inline]
    pub fn is_multi(&self) -> bool {
        matches!(self, Sequence::Values { .. })
    }

    /// Members that a path step or predicate iterates over.
    ///
    /// A scalar array contributes its elements, any other scalar itself.
    pub fn members(&self) -> &[JValue] {
        match self {
            Sequence::Absent => &[],
            Sequence::Scalar(JValue::Array(arr)) => arr.as_slice(),
            Sequence::Scalar(value) => std::slice::from_ref(value),
            Sequence::Values { items, .. } => items.as_slice(),
        }
    }

    /// The single value, when there is exactly one and it is not an array
    pub fn as_scalar(&self) -> Option<&JValue> {
        match self {
            Sequence::Scalar(value) => Some(value),
            Sequence::Values { items, .. } if items.len() == 1 => items.first(),
            _ => None,
        }
    }

    pub fn as_procedure(&self) -> Option<&Procedure> {
        self.as_scalar().and_then(JValue::as_procedure)
    }

    /// Boolean coercion; a sequence behaves like the array it would print as
    pub fn truthy(&self) -> bool {
        match self {
            Sequence::Absent => false,
            Sequence::Scalar(value) => value.truthy(),
            Sequence::Values { items, .. } => match items.len() {
                1 => items[0].truthy(),
                _ => items.iter().any(JValue::truthy),
            },
        }
    }

    /// Unwrap into the value handed back to callers; `None` is absence
    pub fn into_value(self) -> Option<JValue> {
        match self {
            Sequence::Absent => None,
            Sequence::Scalar(value) => Some(value),
            Sequence::Values {
                mut items,
                keep_singleton,
            } => {
                if items.len() == 1 && !keep_singleton {
                    Some(items.remove(0))
                } else {
                    Some(JValue::array(items))
                }
            }
        }
    }

    pub fn to_value(&self) -> Option<JValue> {
        self.clone().into_value()
    }

    pub fn contains_function(&self) -> bool {
        match self {
            Sequence::Absent => false,
            Sequence::Scalar(value) => value.contains_function(),
            Sequence::Values { items, .. } => items.iter().any(JValue::contains_function),
        }
    }
}
