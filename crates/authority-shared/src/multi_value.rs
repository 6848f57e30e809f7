//! Configuration values which may either be written as a single scalar or as
//! a list of scalars.
//!
//! ```
//! use authority_shared::multi_value::MultiString;
//!
//! let one: MultiString = serde_json::from_str(r#""example.com""#).unwrap();
//! let many: MultiString = serde_json::from_str(r#"["example.com","example.org"]"#).unwrap();
//!
//! assert_eq!(one.len(), 1);
//! assert_eq!(many.first(), "example.com");
//! ```
use std::ops::Deref;

use serde::{Deserialize, Serialize};

/// A list of strings which serializes as a bare string when it contains
/// exactly one element.
pub type MultiString = MultiValue<String>;

/// A sequence of `T` which (de)serializes as a bare scalar when it contains
/// exactly one element, and as an array otherwise. An empty sequence is
/// serialized as the default value of `T`, e.g. `""` for strings.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MultiValue<T>(Vec<T>);

impl<T> MultiValue<T>
where
    T: Clone + Default + PartialEq,
{
    /// Returns the first element, or the default value of `T` if the
    /// sequence is empty.
    pub fn first(&self) -> T {
        self.0.first().cloned().unwrap_or_default()
    }

    /// Returns `true` if the sequence is empty or if any element is the
    /// default value of `T`.
    pub fn has_empties(&self) -> bool {
        let empty = T::default();
        self.0.is_empty() || self.0.iter().any(|value| *value == empty)
    }
}

impl<T> Deref for MultiValue<T> {
    type Target = [T];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> From<Vec<T>> for MultiValue<T> {
    fn from(values: Vec<T>) -> Self {
        Self(values)
    }
}

impl<T> FromIterator<T> for MultiValue<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<T> Serialize for MultiValue<T>
where
    T: Serialize + Default,
{
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self.0.as_slice() {
            [] => T::default().serialize(serializer),
            [value] => value.serialize(serializer),
            values => values.serialize(serializer),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Repr<T> {
    One(T),
    Many(Vec<T>),
}

impl<'de, T> Deserialize<'de> for MultiValue<T>
where
    T: Deserialize<'de>,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        match Repr::deserialize(deserializer)? {
            Repr::One(value) => Ok(Self(vec![value])),
            Repr::Many(values) => Ok(Self(values)),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn multi(values: &[&str]) -> MultiString {
        values.iter().map(ToString::to_string).collect()
    }

    #[rstest]
    #[case(&[], "")]
    #[case(&["one"], "one")]
    #[case(&["one", "two"], "one")]
    fn first(#[case] values: &[&str], #[case] expected: &str) {
        assert_eq!(multi(values).first(), expected);
    }

    #[rstest]
    #[case(&[], true)]
    #[case(&["one"], false)]
    #[case(&[""], true)]
    #[case(&["one", "two"], false)]
    #[case(&["one", ""], true)]
    fn has_empties(#[case] values: &[&str], #[case] expected: bool) {
        assert_eq!(multi(values).has_empties(), expected);
    }

    #[rstest]
    #[case(&[], r#""""#)]
    #[case(&["a string"], r#""a string""#)]
    #[case(&["string one", "string two"], r#"["string one","string two"]"#)]
    fn serialize(#[case] values: &[&str], #[case] expected: &str) {
        assert_eq!(serde_json::to_string(&multi(values)).unwrap(), expected);
    }

    #[rstest]
    #[case(r#""""#, &[""])]
    #[case(r#""a string""#, &["a string"])]
    #[case(r#"["string one","string two"]"#, &["string one", "string two"])]
    #[case("[]", &[])]
    fn deserialize(#[case] input: &str, #[case] expected: &[&str]) {
        let value: MultiString = serde_json::from_str(input).unwrap();
        assert_eq!(value, multi(expected));
    }

    #[rstest]
    #[case(r#"["123",123]"#)]
    #[case("123")]
    #[case(r#"{"a":"b"}"#)]
    #[case("null")]
    fn deserialize_invalid(#[case] input: &str) {
        assert!(serde_json::from_str::<MultiString>(input).is_err());
    }
}
