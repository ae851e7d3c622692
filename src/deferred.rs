use std::cell::RefCell;
use std::fmt;
use std::mem;
use std::rc::Rc;

use crate::error::LoadError;

type Continuation<T> = Box<dyn FnOnce(Result<T, LoadError>)>;

enum State<T> {
    Pending(Vec<Continuation<T>>),
    Settled(Result<T, LoadError>),
}

/// A value that is pending, resolved, or failed.
///
/// A `Deferred` settles exactly once. Continuations attached while it is pending run in
/// attachment order when it settles; continuations attached afterwards run immediately with
/// the settled outcome. Clones share the same state, so every clone observes the same outcome.
///
/// Nothing here is `Send`: a deferred value belongs to the single task driving one
/// [`ExecutionContext`](crate::ExecutionContext).
pub struct Deferred<T> {
    state: Rc<RefCell<State<T>>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self { state: Rc::clone(&self.state) }
    }
}

impl<T: fmt::Debug> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.state.borrow() {
            State::Pending(continuations) => {
                f.debug_struct("Deferred").field("pending", &continuations.len()).finish()
            }
            State::Settled(outcome) => f.debug_struct("Deferred").field("settled", outcome).finish(),
        }
    }
}

impl<T> From<Result<T, LoadError>> for Deferred<T> {
    fn from(outcome: Result<T, LoadError>) -> Self {
        Self { state: Rc::new(RefCell::new(State::Settled(outcome))) }
    }
}

impl<T: Clone + 'static> Deferred<T> {
    pub(crate) fn pending() -> Self {
        Self { state: Rc::new(RefCell::new(State::Pending(Vec::new()))) }
    }

    /// A deferred value already resolved with `value`.
    pub fn resolved(value: T) -> Self {
        Self { state: Rc::new(RefCell::new(State::Settled(Ok(value)))) }
    }

    /// A deferred value already failed with `error`.
    pub fn failed(error: LoadError) -> Self {
        Self { state: Rc::new(RefCell::new(State::Settled(Err(error)))) }
    }

    pub fn is_pending(&self) -> bool {
        matches!(&*self.state.borrow(), State::Pending(_))
    }

    /// Returns the settled outcome, or `None` while pending.
    pub fn peek(&self) -> Option<Result<T, LoadError>> {
        match &*self.state.borrow() {
            State::Pending(_) => None,
            State::Settled(outcome) => Some(outcome.clone()),
        }
    }

    /// Settles with `outcome` and runs the queued continuations in order.
    ///
    /// Returns false, leaving the first outcome in place, if this value had already settled.
    pub(crate) fn settle(&self, outcome: Result<T, LoadError>) -> bool {
        let continuations = {
            let mut state = self.state.borrow_mut();
            match mem::replace(&mut *state, State::Settled(outcome.clone())) {
                State::Pending(continuations) => continuations,
                previous @ State::Settled(_) => {
                    *state = previous;
                    tracing::warn!("ignoring second settlement of a deferred value");
                    return false;
                }
            }
        };
        for continuation in continuations {
            continuation(outcome.clone());
        }
        true
    }

    /// Runs `f` with the outcome once this value settles.
    pub fn subscribe<F>(&self, f: F)
    where
        F: FnOnce(Result<T, LoadError>) + 'static,
    {
        let outcome = {
            let mut state = self.state.borrow_mut();
            match &mut *state {
                State::Pending(continuations) => {
                    continuations.push(Box::new(f));
                    return;
                }
                State::Settled(outcome) => outcome.clone(),
            }
        };
        f(outcome)
    }

    /// Settles `target` with this value's outcome.
    fn forward(&self, target: Deferred<T>) {
        self.subscribe(move |outcome| {
            target.settle(outcome);
        });
    }

    /// Chains a dependent load.
    ///
    /// The returned value settles with the outcome of the deferred value `f` produces, not
    /// before it. A failure of `self` skips `f` and is passed through.
    pub fn then<U, F>(&self, f: F) -> Deferred<U>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Deferred<U> + 'static,
    {
        let next = Deferred::pending();
        let target = next.clone();
        self.subscribe(move |outcome| match outcome {
            Ok(value) => f(value).forward(target),
            Err(error) => {
                target.settle(Err(error));
            }
        });
        next
    }

    /// Transforms the resolved value. Failures pass through untouched.
    pub fn map<U, F>(&self, f: F) -> Deferred<U>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> U + 'static,
    {
        self.try_map(move |value| Ok(f(value)))
    }

    /// Transforms the resolved value with a step that may itself fail.
    pub fn try_map<U, F>(&self, f: F) -> Deferred<U>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Result<U, LoadError> + 'static,
    {
        let next = Deferred::pending();
        let target = next.clone();
        self.subscribe(move |outcome| {
            target.settle(outcome.and_then(f));
        });
        next
    }

    /// Handles a failure of this value.
    ///
    /// This is the only way a failure stops short-circuiting a chain: `f` receives the error and
    /// produces the replacement value. Successful outcomes pass through and `f` is dropped.
    pub fn recover<F>(&self, f: F) -> Deferred<T>
    where
        F: FnOnce(LoadError) -> Deferred<T> + 'static,
    {
        let next = Deferred::pending();
        let target = next.clone();
        self.subscribe(move |outcome| match outcome {
            Ok(value) => {
                target.settle(Ok(value));
            }
            Err(error) => f(error).forward(target),
        });
        next
    }

    /// Joins several deferred values into one that resolves with all of their values, in input
    /// order.
    ///
    /// The join fails as soon as any input fails, with that input's error. Inputs that settle
    /// after that still run their other continuations (and so still populate caches), but their
    /// outcomes are discarded by the join.
    pub fn all<I>(inputs: I) -> Deferred<Vec<T>>
    where
        I: IntoIterator<Item = Deferred<T>>,
    {
        let inputs = inputs.into_iter().collect::<Vec<_>>();
        if inputs.is_empty() {
            return Deferred::resolved(Vec::new());
        }

        let joined = Deferred::pending();
        let slots = Rc::new(RefCell::new(JoinSlots { values: vec![None; inputs.len()], remaining: inputs.len() }));
        for (index, input) in inputs.iter().enumerate() {
            let joined = joined.clone();
            let slots = Rc::clone(&slots);
            input.subscribe(move |outcome| {
                if !joined.is_pending() {
                    return;
                }
                match outcome {
                    Ok(value) => {
                        let complete = {
                            let mut slots = slots.borrow_mut();
                            slots.values[index] = Some(value);
                            slots.remaining -= 1;
                            if slots.remaining == 0 {
                                Some(mem::take(&mut slots.values))
                            } else {
                                None
                            }
                        };
                        if let Some(values) = complete {
                            joined.settle(Ok(values.into_iter().flatten().collect()));
                        }
                    }
                    Err(error) => {
                        joined.settle(Err(error));
                    }
                }
            });
        }
        joined
    }

    /// Joins two deferred values of different types.
    ///
    /// Fails with the first failure to settle, like [`Deferred::all`].
    pub fn join<U>(&self, other: &Deferred<U>) -> Deferred<(T, U)>
    where
        U: Clone + 'static,
    {
        let joined = Deferred::pending();
        let slots = Rc::new(RefCell::new((None::<T>, None::<U>)));

        let left_joined = joined.clone();
        let left_slots = Rc::clone(&slots);
        self.subscribe(move |outcome| match outcome {
            Ok(value) => {
                let pair = {
                    let mut slots = left_slots.borrow_mut();
                    slots.0 = Some(value);
                    take_pair(&mut slots)
                };
                if let Some(pair) = pair {
                    left_joined.settle(Ok(pair));
                }
            }
            Err(error) => {
                if left_joined.is_pending() {
                    left_joined.settle(Err(error));
                }
            }
        });

        let right_joined = joined.clone();
        other.subscribe(move |outcome| match outcome {
            Ok(value) => {
                let pair = {
                    let mut slots = slots.borrow_mut();
                    slots.1 = Some(value);
                    take_pair(&mut slots)
                };
                if let Some(pair) = pair {
                    right_joined.settle(Ok(pair));
                }
            }
            Err(error) => {
                if right_joined.is_pending() {
                    right_joined.settle(Err(error));
                }
            }
        });

        joined
    }
}

impl<T: Clone + 'static> Deferred<Option<T>> {
    /// Chains a dependent load that only runs when a value is present. Absence passes through.
    pub fn then_some<U, F>(&self, f: F) -> Deferred<Option<U>>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Deferred<Option<U>> + 'static,
    {
        self.then(move |value| match value {
            Some(value) => f(value),
            None => Deferred::resolved(None),
        })
    }
}

struct JoinSlots<T> {
    values: Vec<Option<T>>,
    remaining: usize,
}

fn take_pair<T, U>(slots: &mut (Option<T>, Option<U>)) -> Option<(T, U)> {
    if slots.0.is_some() && slots.1.is_some() {
        slots.0.take().zip(slots.1.take())
    } else {
        None
    }
}
