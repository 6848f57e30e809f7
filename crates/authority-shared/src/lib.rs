//! This crate contains value types which are shared across the authority
//! crates, most notably a human-readable [`Duration`][time::Duration] and
//! the singular-or-plural [`MultiValue`][multi_value::MultiValue].
pub mod multi_value;
pub mod time;
