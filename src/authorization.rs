use std::fmt::Debug;
use std::rc::Rc;

use crate::deferred::Deferred;

/// Decides whether an actor may perform an action on a resource.
///
/// `grants` only looks at data that is already loaded. Anything it depends on should be loaded
/// through the context first and joined into the value passed to [`Gate::reveal`].
pub trait Authorizer: 'static {
    type Actor: 'static;
    type Resource: 'static;
    type Action: 'static + Debug;

    fn grants(&self, actor: &Self::Actor, resource: &Self::Resource, action: &Self::Action) -> bool;
}

/// Applies an [`Authorizer`] for one actor as the final step of a field's load chain.
///
/// A denied check resolves to `None`; it is never an error.
pub struct Gate<A: Authorizer> {
    authorizer: Rc<A>,
    actor: Rc<A::Actor>,
}

impl<A: Authorizer> Clone for Gate<A> {
    fn clone(&self) -> Self {
        Self { authorizer: Rc::clone(&self.authorizer), actor: Rc::clone(&self.actor) }
    }
}

impl<A: Authorizer> Gate<A> {
    pub fn new(authorizer: Rc<A>, actor: A::Actor) -> Self {
        Self { authorizer, actor: Rc::new(actor) }
    }

    pub fn actor(&self) -> &A::Actor {
        &self.actor
    }

    /// Checks `action` once `ready` has resolved.
    ///
    /// `select` splits the loaded dependencies into the resource to check and the value to
    /// reveal. The value is revealed only if the check passes. Failures of `ready` pass through
    /// without running the check.
    pub fn reveal<D, V, S>(&self, ready: Deferred<D>, action: A::Action, select: S) -> Deferred<Option<V>>
    where
        D: Clone + 'static,
        V: Clone + 'static,
        S: FnOnce(D) -> (A::Resource, Option<V>) + 'static,
    {
        let gate = self.clone();
        ready.map(move |loaded| {
            let (resource, value) = select(loaded);
            if gate.authorizer.grants(&gate.actor, &resource, &action) {
                value
            } else {
                tracing::debug!(?action, "authorization denied, hiding value");
                None
            }
        })
    }

    /// Reveals a loaded resource only if `action` is granted on the resource itself.
    pub fn filter(&self, resource: Deferred<Option<A::Resource>>, action: A::Action) -> Deferred<Option<A::Resource>>
    where
        A::Resource: Clone,
    {
        let gate = self.clone();
        resource.map(move |resource| {
            resource.filter(|resource| {
                let granted = gate.authorizer.grants(&gate.actor, resource, &action);
                if !granted {
                    tracing::debug!(?action, "authorization denied, hiding resource");
                }
                granted
            })
        })
    }
}
