//! Hashable argument atoms and the traits that turn Rust call arguments
//! into cache key material.
//!
//! Every argument of a graph call is lowered to a [`KeyPart`], a small enum
//! of hashable atoms. [`ArgKey`] is the fallible conversion point: a value
//! that has no canonical key form (a NaN float, for example) surfaces
//! [`CalcError::UnhashableArg`] here. [`NodeArgs`] lifts the conversion to
//! whole argument tuples, optionally ending in a [`Kwargs`] segment for
//! keyword-style calls.
//!
//! # Numeric canonicalization
//!
//! A float with an exact integer value keys equal to that integer, an
//! unsigned value in `i64` range keys equal to the signed form, and a bool
//! keys equal to 0 or 1. Typed keying (see the registration options)
//! re-distinguishes them through type tags.
//! Canonicalization is applied when the long identity is assembled, not
//! here, so `Kwargs` handed to a user function still shows the caller's
//! original atoms.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::CalcError;

/// Largest magnitude at which every integer is exactly representable as f64.
const FLOAT_INT_LIMIT: f64 = 9_007_199_254_740_992.0; // 2^53

/// Bit-pattern wrapper so float atoms can be `Eq` and `Hash`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FloatBits(u64);

impl FloatBits {
    pub fn new(value: f64) -> Self {
        FloatBits(value.to_bits())
    }

    pub fn get(self) -> f64 {
        f64::from_bits(self.0)
    }
}

/// A single hashable argument atom.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyPart {
    Int(i64),
    UInt(u64),
    Float(FloatBits),
    Bool(bool),
    Str(String),
    Bytes(Vec<u8>),
    /// Stable identity token of a method receiver.
    Receiver(u64),
}

impl KeyPart {
    /// Folds equal-valued numerics onto one representative so that, under
    /// untyped keying, `f(1)`, `f(1u64)`, `f(1.0)` and `f(true)` share a
    /// node identity.
    pub(crate) fn canonical(self) -> KeyPart {
        match self {
            KeyPart::Float(bits) => {
                let v = bits.get();
                if v == 0.0 {
                    return KeyPart::Int(0);
                }
                if v.fract() == 0.0 && v.abs() <= FLOAT_INT_LIMIT {
                    KeyPart::Int(v as i64)
                } else {
                    KeyPart::Float(bits)
                }
            }
            KeyPart::UInt(u) => {
                if let Ok(i) = i64::try_from(u) {
                    KeyPart::Int(i)
                } else {
                    KeyPart::UInt(u)
                }
            }
            KeyPart::Bool(b) => KeyPart::Int(i64::from(b)),
            other => other,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            KeyPart::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            KeyPart::Float(bits) => Some(bits.get()),
            KeyPart::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            KeyPart::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            KeyPart::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPart::Int(v) => write!(f, "{v}"),
            KeyPart::UInt(v) => write!(f, "{v}"),
            KeyPart::Float(bits) => write!(f, "{}", bits.get()),
            KeyPart::Bool(b) => write!(f, "{b}"),
            KeyPart::Str(s) => write!(f, "{s}"),
            KeyPart::Bytes(b) => {
                write!(f, "0x")?;
                for byte in b {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
            KeyPart::Receiver(t) => write!(f, "{t:#x}"),
        }
    }
}

impl From<i32> for KeyPart {
    fn from(v: i32) -> Self {
        KeyPart::Int(v.into())
    }
}

impl From<i64> for KeyPart {
    fn from(v: i64) -> Self {
        KeyPart::Int(v)
    }
}

impl From<u32> for KeyPart {
    fn from(v: u32) -> Self {
        KeyPart::Int(v.into())
    }
}

impl From<u64> for KeyPart {
    fn from(v: u64) -> Self {
        KeyPart::UInt(v)
    }
}

impl From<f32> for KeyPart {
    fn from(v: f32) -> Self {
        KeyPart::Float(FloatBits::new(v.into()))
    }
}

impl From<f64> for KeyPart {
    fn from(v: f64) -> Self {
        KeyPart::Float(FloatBits::new(v))
    }
}

impl From<bool> for KeyPart {
    fn from(v: bool) -> Self {
        KeyPart::Bool(v)
    }
}

impl From<&str> for KeyPart {
    fn from(v: &str) -> Self {
        KeyPart::Str(v.to_owned())
    }
}

impl From<String> for KeyPart {
    fn from(v: String) -> Self {
        KeyPart::Str(v)
    }
}

impl From<Instance> for KeyPart {
    fn from(v: Instance) -> Self {
        KeyPart::Receiver(v.token())
    }
}

/// Interned identity token for a method receiver.
///
/// Two distinct instances always carry distinct tokens, so the same method
/// invoked on different receivers produces disjoint graph nodes. Tokens are
/// drawn from a process-wide counter and are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instance(u64);

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

impl Instance {
    pub fn new() -> Self {
        Instance(NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed))
    }

    pub fn token(self) -> u64 {
        self.0
    }
}

impl Default for Instance {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Conversion of one argument value into key material.
///
/// `to_part` is the single point where identity computation can fail; the
/// error is surfaced at the call site as [`CalcError::UnhashableArg`].
/// Custom argument types implement this to become keyable; a type acting as
/// a method receiver additionally overrides `as_receiver`.
pub trait ArgKey {
    fn to_part(&self) -> Result<KeyPart, CalcError>;

    /// Static tag recorded when typed keying is enabled.
    fn type_tag(&self) -> &'static str;

    /// The receiver token, when this argument identifies a method receiver.
    fn as_receiver(&self) -> Option<Instance> {
        None
    }
}

impl<T: ArgKey + ?Sized> ArgKey for &T {
    fn to_part(&self) -> Result<KeyPart, CalcError> {
        (**self).to_part()
    }

    fn type_tag(&self) -> &'static str {
        (**self).type_tag()
    }

    fn as_receiver(&self) -> Option<Instance> {
        (**self).as_receiver()
    }
}

macro_rules! arg_key_infallible {
    ($($ty:ty => $tag:literal),+ $(,)?) => {
        $(
            impl ArgKey for $ty {
                fn to_part(&self) -> Result<KeyPart, CalcError> {
                    Ok(KeyPart::from(self.clone()))
                }

                fn type_tag(&self) -> &'static str {
                    $tag
                }
            }
        )+
    };
}

arg_key_infallible! {
    i32 => "i32",
    i64 => "i64",
    u32 => "u32",
    u64 => "u64",
    bool => "bool",
    String => "str",
}

impl ArgKey for str {
    fn to_part(&self) -> Result<KeyPart, CalcError> {
        Ok(KeyPart::Str(self.to_owned()))
    }

    fn type_tag(&self) -> &'static str {
        "str"
    }
}

impl ArgKey for f64 {
    fn to_part(&self) -> Result<KeyPart, CalcError> {
        if self.is_nan() {
            return Err(CalcError::unhashable("NaN has no canonical key form"));
        }
        Ok(KeyPart::from(*self))
    }

    fn type_tag(&self) -> &'static str {
        "f64"
    }
}

impl ArgKey for f32 {
    fn to_part(&self) -> Result<KeyPart, CalcError> {
        if self.is_nan() {
            return Err(CalcError::unhashable("NaN has no canonical key form"));
        }
        Ok(KeyPart::from(*self))
    }

    fn type_tag(&self) -> &'static str {
        "f32"
    }
}

impl ArgKey for Instance {
    fn to_part(&self) -> Result<KeyPart, CalcError> {
        Ok(KeyPart::Receiver(self.token()))
    }

    fn type_tag(&self) -> &'static str {
        "instance"
    }

    fn as_receiver(&self) -> Option<Instance> {
        Some(*self)
    }
}

/// Dynamic argument: a pre-built [`KeyPart`] passes through unchanged, with
/// its tag reflecting the variant. This is how a single node can be keyed by
/// values of differing runtime type.
impl ArgKey for KeyPart {
    fn to_part(&self) -> Result<KeyPart, CalcError> {
        if let KeyPart::Float(bits) = self {
            if bits.get().is_nan() {
                return Err(CalcError::unhashable("NaN has no canonical key form"));
            }
        }
        Ok(self.clone())
    }

    fn type_tag(&self) -> &'static str {
        match self {
            KeyPart::Int(_) => "i64",
            KeyPart::UInt(_) => "u64",
            KeyPart::Float(_) => "f64",
            KeyPart::Bool(_) => "bool",
            KeyPart::Str(_) => "str",
            KeyPart::Bytes(_) => "bytes",
            KeyPart::Receiver(_) => "instance",
        }
    }
}

/// Insertion-ordered keyword-argument set.
///
/// The Rust rendition of keyword calls: may appear as the final element of
/// an argument tuple. Insertion order is identity-relevant, matching the
/// caller-side ordering of the long id's keyword segment. Re-inserting an
/// existing name replaces the value in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Kwargs {
    entries: Vec<(&'static str, KeyPart)>,
}

impl Kwargs {
    pub fn new() -> Self {
        Kwargs::default()
    }

    pub fn insert(&mut self, name: &'static str, value: impl Into<KeyPart>) {
        let part = value.into();
        if let Some(slot) = self.entries.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = part;
        } else {
            self.entries.push((name, part));
        }
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn with(mut self, name: &'static str, value: impl Into<KeyPart>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&KeyPart> {
        self.entries
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &KeyPart)> {
        self.entries.iter().map(|(n, v)| (*n, v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Builds a [`Kwargs`] from `name: value` pairs.
///
/// ```
/// use calcgraph::kwargs;
///
/// let kw = kwargs! { y: -3, label: "rate" };
/// assert_eq!(kw.len(), 2);
/// ```
#[macro_export]
macro_rules! kwargs {
    () => {
        $crate::Kwargs::new()
    };
    ($($name:ident : $value:expr),+ $(,)?) => {{
        let mut kw = $crate::Kwargs::new();
        $(kw.insert(stringify!($name), $value);)+
        kw
    }};
}

/// Split call arguments: positional and keyword segments plus type tags,
/// ready for long-id assembly.
#[derive(Debug, Clone, Default)]
pub struct CallParts {
    pub(crate) pos: SmallVec<[KeyPart; 4]>,
    pub(crate) pos_tags: SmallVec<[&'static str; 4]>,
    pub(crate) kw: Vec<(&'static str, KeyPart)>,
    pub(crate) kw_tags: Vec<&'static str>,
    pub(crate) receiver: Option<Instance>,
}

impl CallParts {
    pub fn positional(&self) -> &[KeyPart] {
        &self.pos
    }

    pub fn keywords(&self) -> &[(&'static str, KeyPart)] {
        &self.kw
    }

    pub fn receiver(&self) -> Option<Instance> {
        self.receiver
    }
}

/// Argument tuples accepted by graph calls.
///
/// Implemented for tuples up to arity four of [`ArgKey`] values, each
/// optionally followed by a trailing [`Kwargs`] segment.
pub trait NodeArgs {
    fn split(&self) -> Result<CallParts, CalcError>;
}

impl NodeArgs for () {
    fn split(&self) -> Result<CallParts, CalcError> {
        Ok(CallParts::default())
    }
}

impl NodeArgs for (Kwargs,) {
    fn split(&self) -> Result<CallParts, CalcError> {
        let mut parts = CallParts::default();
        push_kwargs(&mut parts, &self.0)?;
        Ok(parts)
    }
}

fn push_kwargs(parts: &mut CallParts, kw: &Kwargs) -> Result<(), CalcError> {
    for (name, value) in kw.iter() {
        parts.kw.push((name, value.to_part()?));
        parts.kw_tags.push(value.type_tag());
    }
    Ok(())
}

macro_rules! node_args_tuple {
    (kw = $kwidx:tt; $($T:ident => $idx:tt),+) => {
        impl<$($T: ArgKey),+> NodeArgs for ($($T,)+) {
            fn split(&self) -> Result<CallParts, CalcError> {
                let mut parts = CallParts::default();
                $(
                    parts.pos.push(self.$idx.to_part()?);
                    parts.pos_tags.push(self.$idx.type_tag());
                )+
                parts.receiver = self.0.as_receiver();
                Ok(parts)
            }
        }

        impl<$($T: ArgKey),+> NodeArgs for ($($T,)+ Kwargs) {
            fn split(&self) -> Result<CallParts, CalcError> {
                let mut parts = CallParts::default();
                $(
                    parts.pos.push(self.$idx.to_part()?);
                    parts.pos_tags.push(self.$idx.type_tag());
                )+
                push_kwargs(&mut parts, &self.$kwidx)?;
                parts.receiver = self.0.as_receiver();
                Ok(parts)
            }
        }
    };
}

node_args_tuple!(kw = 1; A0 => 0);
node_args_tuple!(kw = 2; A0 => 0, A1 => 1);
node_args_tuple!(kw = 3; A0 => 0, A1 => 1, A2 => 2);
node_args_tuple!(kw = 4; A0 => 0, A1 => 1, A2 => 2, A3 => 3);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_folds_integral_floats() {
        assert_eq!(KeyPart::from(1.0f64).canonical(), KeyPart::Int(1));
        assert_eq!(KeyPart::from(-0.0f64).canonical(), KeyPart::Int(0));
        assert_eq!(KeyPart::from(2.5f64).canonical(), KeyPart::from(2.5f64));
    }

    #[test]
    fn canonical_folds_small_unsigned() {
        assert_eq!(KeyPart::UInt(7).canonical(), KeyPart::Int(7));
        assert_eq!(KeyPart::UInt(u64::MAX).canonical(), KeyPart::UInt(u64::MAX));
    }

    #[test]
    fn canonical_folds_bools_onto_integers() {
        assert_eq!(KeyPart::Bool(true).canonical(), KeyPart::Int(1));
        assert_eq!(KeyPart::Bool(false).canonical(), KeyPart::Int(0));
    }

    #[test]
    fn nan_is_unhashable() {
        let err = f64::NAN.to_part().unwrap_err();
        assert!(matches!(err, CalcError::UnhashableArg { .. }));

        let part = KeyPart::from(f64::NAN);
        assert!(part.to_part().is_err());
    }

    #[test]
    fn instances_are_distinct_and_act_as_receivers() {
        let a = Instance::new();
        let b = Instance::new();
        assert_ne!(a.token(), b.token());
        assert_eq!(a.as_receiver(), Some(a));
        assert_eq!(a.to_part().unwrap(), KeyPart::Receiver(a.token()));
    }

    #[test]
    fn kwargs_preserve_insertion_order_and_replace_in_place() {
        let mut kw = kwargs! { y: -3, z: "s" };
        kw.insert("y", 9);
        let names: Vec<_> = kw.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["y", "z"]);
        assert_eq!(kw.get("y").and_then(KeyPart::as_i64), Some(9));
    }

    #[test]
    fn tuple_split_collects_positions_and_tags() {
        let parts = (2i64, 3.5f64, "abc").split().unwrap();
        assert_eq!(
            parts.positional(),
            &[
                KeyPart::Int(2),
                KeyPart::from(3.5f64),
                KeyPart::Str("abc".into())
            ]
        );
        assert_eq!(parts.pos_tags.as_slice(), &["i64", "f64", "str"]);
        assert!(parts.keywords().is_empty());
        assert_eq!(parts.receiver(), None);
    }

    #[test]
    fn trailing_kwargs_split_into_keyword_segment() {
        let parts = (5i64, kwargs! { y: -3 }).split().unwrap();
        assert_eq!(parts.positional(), &[KeyPart::Int(5)]);
        assert_eq!(parts.keywords(), &[("y", KeyPart::Int(-3))]);
        assert_eq!(parts.kw_tags, vec!["i64"]);
    }

    #[test]
    fn leading_instance_is_reported_as_receiver() {
        let this = Instance::new();
        let parts = (this, 5i64).split().unwrap();
        assert_eq!(parts.receiver(), Some(this));
    }
}
