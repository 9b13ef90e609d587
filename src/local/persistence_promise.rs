use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{FirestoreError, FirestoreResult};
use crate::util::assert::fail;

type Callback<T> = Box<dyn FnOnce(FirestoreResult<T>)>;

enum State<T> {
    Pending(Option<Callback<T>>),
    Settled(Option<FirestoreResult<T>>),
}

/// A chainable continuation value for code running inside a storage
/// transaction.
///
/// The host storage engine closes its transaction as soon as control returns
/// to the scheduler with no pending storage operation, so continuations must
/// run inline whenever the upstream value is already available. Generic async
/// executors cannot guarantee that; this type does: `next`/`map`/`recover`
/// dispatch eagerly when the promise is already settled and only register a
/// callback when it is not.
pub struct PersistencePromise<T> {
    state: Rc<RefCell<State<T>>>,
}

/// Settles a deferred [`PersistencePromise`]; see
/// [`PersistencePromise::defer`].
pub struct Settle<T> {
    state: Rc<RefCell<State<T>>>,
}

impl<T: 'static> Settle<T> {
    pub fn with(self, result: FirestoreResult<T>) {
        let mut state = self.state.borrow_mut();
        match &mut *state {
            State::Settled(_) => fail("PersistencePromise settled twice"),
            State::Pending(slot) => match slot.take() {
                Some(callback) => {
                    // The value goes straight to the continuation.
                    *state = State::Settled(None);
                    drop(state);
                    callback(result);
                }
                None => *state = State::Settled(Some(result)),
            },
        }
    }

    pub fn resolve(self, value: T) {
        self.with(Ok(value));
    }

    pub fn reject(self, error: FirestoreError) {
        self.with(Err(error));
    }
}

impl<T: 'static> PersistencePromise<T> {
    pub fn resolve(value: T) -> Self {
        Self::from_result(Ok(value))
    }

    pub fn reject(error: FirestoreError) -> Self {
        Self::from_result(Err(error))
    }

    pub fn from_result(result: FirestoreResult<T>) -> Self {
        Self {
            state: Rc::new(RefCell::new(State::Settled(Some(result)))),
        }
    }

    /// A pending promise plus its settle handle, for operations whose value
    /// arrives from a storage completion callback.
    pub fn defer() -> (Self, Settle<T>) {
        let state = Rc::new(RefCell::new(State::Pending(None)));
        (
            Self {
                state: Rc::clone(&state),
            },
            Settle { state },
        )
    }

    fn on_settled(self, callback: Callback<T>) {
        let mut state = self.state.borrow_mut();
        match &mut *state {
            State::Settled(result) => {
                let result = result
                    .take()
                    .unwrap_or_else(|| fail("PersistencePromise consumed twice"));
                drop(state);
                callback(result);
            }
            State::Pending(slot) => {
                if slot.is_some() {
                    fail("PersistencePromise already has a continuation");
                }
                *slot = Some(callback);
            }
        }
    }

    /// Chains a continuation producing another promise. Runs inline when this
    /// promise is already settled.
    pub fn next<U: 'static, F>(self, f: F) -> PersistencePromise<U>
    where
        F: FnOnce(T) -> PersistencePromise<U> + 'static,
    {
        let (promise, settle) = PersistencePromise::defer();
        self.on_settled(Box::new(move |result| match result {
            Ok(value) => f(value).on_settled(Box::new(move |inner| settle.with(inner))),
            Err(err) => settle.with(Err(err)),
        }));
        promise
    }

    pub fn map<U: 'static, F>(self, f: F) -> PersistencePromise<U>
    where
        F: FnOnce(T) -> U + 'static,
    {
        self.next(move |value| PersistencePromise::resolve(f(value)))
    }

    /// Chains an error handler; successful values pass through untouched.
    pub fn recover<F>(self, f: F) -> PersistencePromise<T>
    where
        F: FnOnce(FirestoreError) -> PersistencePromise<T> + 'static,
    {
        let (promise, settle) = PersistencePromise::defer();
        self.on_settled(Box::new(move |result| match result {
            Ok(value) => settle.with(Ok(value)),
            Err(err) => f(err).on_settled(Box::new(move |inner| settle.with(inner))),
        }));
        promise
    }

    /// Unwraps a promise that must have settled by the time the transaction
    /// body finished. All memory-backed operations settle inline, so an
    /// unsettled promise here is a programming fault.
    pub fn into_result(self) -> FirestoreResult<T> {
        match Rc::try_unwrap(self.state) {
            Ok(cell) => match cell.into_inner() {
                State::Settled(Some(result)) => result,
                State::Settled(None) => fail("PersistencePromise consumed twice"),
                State::Pending(_) => fail("PersistencePromise still pending at transaction end"),
            },
            Err(_) => fail("PersistencePromise still shared at transaction end"),
        }
    }
}

impl PersistencePromise<()> {
    /// Runs promise-producing actions in order, stopping at the first error.
    pub fn wait_for<I, F>(actions: I) -> PersistencePromise<()>
    where
        I: IntoIterator<Item = F>,
        F: FnOnce() -> PersistencePromise<()> + 'static,
    {
        let mut chain = PersistencePromise::resolve(());
        for action in actions {
            chain = chain.next(move |()| action());
        }
        chain
    }

    /// Applies `f` to each element in order, threading errors.
    pub fn for_each<I, T, F>(items: I, f: F) -> PersistencePromise<()>
    where
        I: IntoIterator<Item = T>,
        T: 'static,
        F: FnMut(T) -> PersistencePromise<()> + 'static,
    {
        fn step<T: 'static, F>(
            mut iter: std::vec::IntoIter<T>,
            mut f: F,
        ) -> PersistencePromise<()>
        where
            F: FnMut(T) -> PersistencePromise<()> + 'static,
        {
            match iter.next() {
                None => PersistencePromise::resolve(()),
                Some(item) => f(item).next(move |()| step(iter, f)),
            }
        }
        step(items.into_iter().collect::<Vec<_>>().into_iter(), f)
    }
}
