//! Per-registration function metadata.
//!
//! A [`FunctionHelper`] is attached to every graph wrapper and is what marks
//! it as a graph node: call-plan entries can only be built from helper
//! handles, so only graph wrappers are discoverable as dependencies.

use std::panic::Location;

use crate::id::{make_long_id, short_of, LongId, ShortId};
use crate::key::{CallParts, Instance};
use crate::scan::{scan, CallPlan};

/// Identity and dependency metadata for one registered function.
#[derive(Debug)]
pub struct FunctionHelper {
    fqn: String,
    typed: bool,
    is_method: bool,
    plan: CallPlan,
}

impl FunctionHelper {
    pub(crate) fn new(
        name: &str,
        path: Option<&str>,
        location: &'static Location<'static>,
        source_roots: &[String],
        typed: bool,
        is_method: bool,
        plan: CallPlan,
    ) -> Self {
        let module_path = match path {
            Some(p) => p.to_owned(),
            None => module_path_for(location.file(), source_roots),
        };
        FunctionHelper {
            fqn: format!("{module_path}.{name}"),
            typed,
            is_method,
            plan,
        }
    }

    /// Fully-qualified name: module path plus node name, with both halves
    /// overridable at registration.
    pub fn fqn(&self) -> &str {
        &self.fqn
    }

    pub fn typed(&self) -> bool {
        self.typed
    }

    pub fn is_method(&self) -> bool {
        self.is_method
    }

    pub(crate) fn plan(&self) -> &CallPlan {
        &self.plan
    }

    /// Computes the `(short, long)` identity pair for a call with the given
    /// split arguments.
    pub fn make_node_id_pair(&self, parts: &CallParts) -> (ShortId, LongId) {
        let long = make_long_id(&self.fqn, parts, self.typed, self.is_method);
        (short_of(&long), long)
    }

    /// The statically discovered dependency set: one id per declared
    /// call site, in declaration order, duplicates removed.
    pub fn required_node_ids(&self, this: Option<Instance>) -> Vec<ShortId> {
        let mut out = Vec::new();
        for (short, _) in scan(&self.plan, this) {
            if !out.contains(&short) {
                out.push(short);
            }
        }
        out
    }

    pub(crate) fn scan_with_longs(&self, this: Option<Instance>) -> Vec<(ShortId, LongId)> {
        scan(&self.plan, this)
    }
}

/// Derives the default module path from a registration call site's file,
/// relative to the longest matching configured source root.
fn module_path_for(file: &str, source_roots: &[String]) -> String {
    let normalized = file.replace('\\', "/");
    let stripped = source_roots
        .iter()
        .filter(|root| normalized.starts_with(root.as_str()))
        .max_by_key(|root| root.len())
        .map(|root| normalized[root.len()..].trim_start_matches('/'))
        .unwrap_or(normalized.as_str());
    stripped.trim_end_matches(".rs").replace('/', ".")
}
