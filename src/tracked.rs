//! # Results that carry their request id.
//!
//! [`Tracked`] is the only requirement the task manager places on a result type:
//! it must expose a mutable request id. The manager stamps the id itself when it
//! resolves a task, so remote workers are never trusted to round-trip it.
//!
//! Results cross the registry type-erased as [`AnyResult`] (boxed value plus the
//! original type name) and are checked back into the caller's type on return.

use std::any::{Any, type_name};

/// A result payload correlated by request id.
///
/// # Example
/// ```
/// use taskrelay::Tracked;
///
/// #[derive(Default)]
/// struct Reply { request_id: String, text: String }
///
/// impl Tracked for Reply {
///     fn request_id(&self) -> &str { &self.request_id }
///     fn set_request_id(&mut self, id: String) { self.request_id = id; }
/// }
///
/// let mut r = Reply::default();
/// r.set_request_id("req-1".into());
/// assert_eq!(r.request_id(), "req-1");
/// ```
pub trait Tracked: Send + 'static {
    /// Returns the request id this result answers.
    fn request_id(&self) -> &str;

    /// Overwrites the request id.
    fn set_request_id(&mut self, id: String);
}

/// Type-erased tracked result stored in a task slot.
pub(crate) struct AnyResult {
    value: Box<dyn Any + Send>,
    type_name: &'static str,
}

impl AnyResult {
    pub(crate) fn new<R: Tracked>(value: R) -> Self {
        Self {
            value: Box::new(value),
            type_name: type_name::<R>(),
        }
    }

    pub(crate) fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Recovers the concrete result, or returns the erased value untouched on mismatch.
    pub(crate) fn downcast<R: Tracked>(self) -> Result<R, Self> {
        let type_name = self.type_name;
        match self.value.downcast::<R>() {
            Ok(v) => Ok(*v),
            Err(value) => Err(Self { value, type_name }),
        }
    }
}

impl std::fmt::Debug for AnyResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnyResult")
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Reply(String);

    impl Tracked for Reply {
        fn request_id(&self) -> &str {
            &self.0
        }
        fn set_request_id(&mut self, id: String) {
            self.0 = id;
        }
    }

    struct Other(String);

    impl Tracked for Other {
        fn request_id(&self) -> &str {
            &self.0
        }
        fn set_request_id(&mut self, id: String) {
            self.0 = id;
        }
    }

    #[test]
    fn downcast_matching_type() {
        let erased = AnyResult::new(Reply("a".into()));
        assert_eq!(erased.downcast::<Reply>().ok(), Some(Reply("a".into())));
    }

    #[test]
    fn downcast_mismatch_keeps_type_name() {
        let erased = AnyResult::new(Other("a".into()));
        let back = erased.downcast::<Reply>().unwrap_err();
        assert!(back.type_name().ends_with("Other"));
    }
}
