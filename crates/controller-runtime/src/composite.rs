//! Merged listing over two kinds that describe the same logical resource.

use crate::kind::{Object, ObjectKey};
use crate::view::{ListFilter, ReadView};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Lists a primary kind followed by a secondary kind converted into it.
///
/// Both views are read independently, so the result may combine two
/// different points in time.
pub struct CompositeView<P: Object, S: Object, F> {
    primary: ReadView<P>,
    secondary: ReadView<S>,
    adapter: F,
}

impl<P, S, F, E> CompositeView<P, S, F>
where
    P: Object,
    S: Object,
    F: Fn(&S) -> Result<P, E>,
    E: fmt::Display,
{
    /// Combine `primary` with `secondary`, converting the latter with `adapter`.
    pub fn new(primary: ReadView<P>, secondary: ReadView<S>, adapter: F) -> Self {
        Self {
            primary,
            secondary,
            adapter,
        }
    }

    /// Primary objects in view order, then every convertible secondary object.
    ///
    /// Secondary objects the adapter rejects are left out.
    pub fn list(&self, filter: &ListFilter) -> Vec<Arc<P>> {
        let mut merged = self.primary.list(filter);
        for obj in self.secondary.list(filter) {
            match (self.adapter)(&obj) {
                Ok(converted) => merged.push(Arc::new(converted)),
                Err(err) => debug!(
                    kind = %self.secondary.kind(),
                    key = ?ObjectKey::from_object(obj.as_ref()),
                    error = %err,
                    "Skipping unconvertible object"
                ),
            }
        }
        merged
    }
}
