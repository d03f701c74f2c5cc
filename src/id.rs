//! Node identity: structured long ids and their short hex fingerprints.
//!
//! A node is a unique `(function, arguments)` call site. Its [`LongId`] is
//! the structured tuple `(fqn, positional…, KWD_MARK, name, value, …)` with
//! optional trailing type tags under typed keying; it is retained for
//! diagnostics only. The [`ShortId`] is a 64-bit fingerprint of the long id,
//! derived from a domain-separated blake3 digest over a canonical byte
//! encoding, and is the key used for every cache and graph operation.
//!
//! Hashing is deterministic: the same long id always yields the same short
//! id, within a process and across processes.

use std::fmt;

use serde::{Serialize, Serializer};

use crate::key::{CallParts, KeyPart};

/// Sentinel separating the positional and keyword segments of a long id.
pub const KWD_MARK: &str = "___KWDS___";

const ID_DOMAIN: &[u8] = b"calcgraph.node-id.v1";

/// Short node id: the cache key. Displays as 16 hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShortId(u64);

impl ShortId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ShortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl Serialize for ShortId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// One element of a long id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum IdAtom {
    /// A positional value, keyword name, or keyword value.
    Value(KeyPart),
    /// The positional/keyword separator, present only when keywords are.
    KwdMark,
    /// A type tag appended under typed keying.
    TypeTag(String),
}

impl fmt::Display for IdAtom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdAtom::Value(part) => write!(f, "{part}"),
            IdAtom::KwdMark => write!(f, "{KWD_MARK}"),
            IdAtom::TypeTag(tag) => write!(f, "<{tag}>"),
        }
    }
}

/// Structured node identity, retained for diagnostics and collision checks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct LongId {
    fqn: String,
    atoms: Vec<IdAtom>,
}

impl LongId {
    pub fn fqn(&self) -> &str {
        &self.fqn
    }

    pub fn atoms(&self) -> &[IdAtom] {
        &self.atoms
    }
}

impl fmt::Display for LongId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}", self.fqn)?;
        for atom in &self.atoms {
            write!(f, ", {atom}")?;
        }
        write!(f, "]")
    }
}

/// Assembles the long id for a call.
///
/// Order mirrors the classic memoization key: canonical positional values,
/// then the keyword segment behind [`KWD_MARK`] (only when non-empty), then
/// one type tag per positional and keyword value when `typed` is set. For a
/// method node the first positional value is substituted by the receiver
/// token when a receiver is present.
pub(crate) fn make_long_id(
    fqn: &str,
    parts: &CallParts,
    typed: bool,
    is_method: bool,
) -> LongId {
    let mut atoms = Vec::with_capacity(parts.pos.len() + 2 * parts.kw.len() + 1);
    for (i, part) in parts.pos.iter().enumerate() {
        let mut value = part.clone().canonical();
        if i == 0 && is_method {
            if let Some(receiver) = parts.receiver {
                value = KeyPart::Receiver(receiver.token());
            }
        }
        atoms.push(IdAtom::Value(value));
    }
    if !parts.kw.is_empty() {
        atoms.push(IdAtom::KwdMark);
        for (name, value) in &parts.kw {
            atoms.push(IdAtom::Value(KeyPart::Str((*name).to_owned())));
            atoms.push(IdAtom::Value(value.clone().canonical()));
        }
    }
    if typed {
        for tag in parts.pos_tags.iter().chain(parts.kw_tags.iter()) {
            atoms.push(IdAtom::TypeTag((*tag).to_owned()));
        }
    }
    LongId {
        fqn: fqn.to_owned(),
        atoms,
    }
}

/// Fingerprints a long id into its short form.
pub(crate) fn short_of(long: &LongId) -> ShortId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(ID_DOMAIN);
    write_str(&mut hasher, &long.fqn);
    for atom in &long.atoms {
        write_atom(&mut hasher, atom);
    }
    let digest = hasher.finalize();
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&digest.as_bytes()[..8]);
    ShortId(u64::from_le_bytes(buf))
}

fn write_str(hasher: &mut blake3::Hasher, s: &str) {
    hasher.update(&(s.len() as u64).to_le_bytes());
    hasher.update(s.as_bytes());
}

fn write_atom(hasher: &mut blake3::Hasher, atom: &IdAtom) {
    match atom {
        IdAtom::Value(part) => {
            hasher.update(&[0]);
            write_part(hasher, part);
        }
        IdAtom::KwdMark => {
            hasher.update(&[1]);
        }
        IdAtom::TypeTag(tag) => {
            hasher.update(&[2]);
            write_str(hasher, tag);
        }
    }
}

fn write_part(hasher: &mut blake3::Hasher, part: &KeyPart) {
    match part {
        KeyPart::Int(v) => {
            hasher.update(&[0]);
            hasher.update(&v.to_le_bytes());
        }
        KeyPart::UInt(v) => {
            hasher.update(&[1]);
            hasher.update(&v.to_le_bytes());
        }
        KeyPart::Float(bits) => {
            hasher.update(&[2]);
            hasher.update(&bits.get().to_bits().to_le_bytes());
        }
        KeyPart::Bool(b) => {
            hasher.update(&[3, u8::from(*b)]);
        }
        KeyPart::Str(s) => {
            hasher.update(&[4]);
            write_str(hasher, s);
        }
        KeyPart::Bytes(b) => {
            hasher.update(&[5]);
            hasher.update(&(b.len() as u64).to_le_bytes());
            hasher.update(b);
        }
        KeyPart::Receiver(t) => {
            hasher.update(&[6]);
            hasher.update(&t.to_le_bytes());
        }
    }
}
