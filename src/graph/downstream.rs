//! Type-erased walking of the dispatch graph.
//!
//! Output things are generic over their event type, so debugging helpers
//! that cross several things go through this object-safe view instead.

/// The output side of a thing, seen without its event type.
pub trait Downstream {
    fn thing_name(&self) -> String;

    fn has_connections(&self) -> bool;

    /// Append every path starting at this thing to `paths`, each prefixed
    /// with `prefix`.
    fn collect_paths(&self, prefix: &str, paths: &mut Vec<String>);

    /// Replace every connection reachable from this thing with a wrapper
    /// that logs each event before passing it on.
    fn install_tracing(&self);
}
