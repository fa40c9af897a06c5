use derive_more::{Deref, Display};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{collections::BTreeMap, fmt};

///
/// CONSTANTS
///

/// Text tokens longer than this are replaced by their SHA-256 digest so
/// index keys stay bounded.
pub const MAX_TOKEN_BYTES: usize = 64;

const HASHED_TOKEN_PREFIX: &str = "#";

///
/// Row
///
/// Field-name → value map for one stored instance. The primary key is never
/// part of the row; it addresses it.
///

pub type Row = BTreeMap<String, Value>;

///
/// Id
///
/// Serialized primary key of one instance.
///

#[derive(
    Clone, Debug, Deref, Deserialize, Display, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(transparent)]
pub struct Id(String);

impl Id {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Allocate a fresh, time-ordered id.
    #[must_use]
    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }
}

impl From<&str> for Id {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Id {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&Id> for Id {
    fn from(value: &Id) -> Self {
        value.clone()
    }
}

///
/// Value
///
/// Runtime field value. Serialized into rows and tokenized into index keys.
///

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Ref(Id),
}

impl Value {
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_id(&self) -> Option<&Id> {
        match self {
            Self::Ref(id) => Some(id),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Canonical index token for this value, or `None` for null.
    ///
    /// Tokens are stable across processes: two values produce the same token
    /// iff they compare equal after field coercion.
    #[must_use]
    pub fn index_token(&self) -> Option<String> {
        let token = match self {
            Self::Null => return None,
            Self::Bool(true) => "1".to_string(),
            Self::Bool(false) => "0".to_string(),
            Self::Int(v) => v.to_string(),
            Self::Float(v) => {
                // -0.0 and 0.0 share one index entry
                let v = if *v == 0.0 { 0.0 } else { *v };
                format!("{v}")
            }
            Self::Text(s) => s.clone(),
            Self::Ref(id) => id.as_str().to_string(),
        };

        if token.len() > MAX_TOKEN_BYTES {
            Some(hashed_token(token.as_bytes()))
        } else {
            Some(token)
        }
    }

    /// Ordering score used by range indexes.
    #[must_use]
    #[expect(clippy::cast_precision_loss)]
    pub const fn score(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }
}

fn hashed_token(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(HASHED_TOKEN_PREFIX.len() + digest.len() * 2);
    out.push_str(HASHED_TOKEN_PREFIX);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }

    out
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "'{v}'"),
            Self::Ref(id) => write!(f, "#{id}"),
        }
    }
}

macro_rules! impl_value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(value: $ty) -> Self {
                    Self::$variant(value.into())
                }
            }
        )*
    };
}

impl_value_from! {
    bool => Bool,
    i32 => Int,
    i64 => Int,
    u32 => Int,
    f32 => Float,
    f64 => Float,
    String => Text,
    &str => Text,
    Id => Ref,
}

impl From<&Id> for Value {
    fn from(value: &Id) -> Self {
        Self::Ref(value.clone())
    }
}

impl<T: Into<Self>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

///
/// LookupValue
///
/// Right-hand side of one keyword predicate: a single value for equality and
/// range lookups, a list for `__in`.
///

#[derive(Clone, Debug, PartialEq)]
pub enum LookupValue {
    One(Value),
    Many(Vec<Value>),
}

impl fmt::Display for LookupValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::One(v) => write!(f, "{v}"),
            Self::Many(values) => {
                write!(f, "[")?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
        }
    }
}

macro_rules! impl_lookup_from {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for LookupValue {
                fn from(value: $ty) -> Self {
                    Self::One(value.into())
                }
            }
        )*
    };
}

impl_lookup_from!(bool, i32, i64, u32, f32, f64, String, &str, Id, &Id, Value);

impl<T: Into<Value>> From<Vec<T>> for LookupValue {
    fn from(values: Vec<T>) -> Self {
        Self::Many(values.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>, const N: usize> From<[T; N]> for LookupValue {
    fn from(values: [T; N]) -> Self {
        Self::Many(values.into_iter().map(Into::into).collect())
    }
}

///
/// TESTS
///
