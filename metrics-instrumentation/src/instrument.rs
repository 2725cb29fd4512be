//! Call site timing.
//!
//! A [`CallSite`] names an instrumented method.  Calls routed through it are attributed to the
//! method call timer of that name on the current transaction; with no transaction running they go
//! straight to the callee.
//!
//! [`Instrumented`] wraps a callable with its call site, keeping the callable's argument list and
//! return type:
//!
//! ```
//! use metrics_instrumentation::instrument::{CallSite, InstrumentedCall};
//!
//! let find = CallSite::associated("Project", "find").wrap(|id: u64| format!("project-{id}"));
//! assert_eq!(find.call((7,)), "project-7");
//! ```
use std::fmt;

use crate::transaction::Transaction;

/// How a method is invoked on its owner.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MethodKind {
    /// Called on an instance; qualified as `Owner#method`.
    Instance,

    /// Called on the owner type itself; qualified as `Owner.method`.
    Associated,
}

impl MethodKind {
    const fn separator(&self) -> char {
        match self {
            MethodKind::Instance => '#',
            MethodKind::Associated => '.',
        }
    }
}

/// An instrumented method, identified by owner and name.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CallSite {
    owner: String,
    method: String,
    kind: MethodKind,
    qualified_name: String,
}

impl CallSite {
    /// Creates a new `CallSite`.
    pub fn new(owner: &str, method: &str, kind: MethodKind) -> Self {
        CallSite {
            owner: owner.to_string(),
            method: method.to_string(),
            kind,
            qualified_name: format!("{owner}{}{method}", kind.separator()),
        }
    }

    /// Creates a call site for an instance method.
    pub fn instance(owner: &str, method: &str) -> Self {
        Self::new(owner, method, MethodKind::Instance)
    }

    /// Creates a call site for an associated function.
    pub fn associated(owner: &str, method: &str) -> Self {
        Self::new(owner, method, MethodKind::Associated)
    }

    /// Owner name.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Method name.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Method kind.
    pub fn kind(&self) -> MethodKind {
        self.kind
    }

    /// `Owner#method` or `Owner.method`.
    pub fn qualified_name(&self) -> &str {
        &self.qualified_name
    }

    /// Calls `f`, timing it against the current transaction if there is one.
    ///
    /// The result of `f` is returned unchanged, and panics propagate.  A call that panics is not
    /// counted.
    pub fn call<T, F>(&self, f: F) -> T
    where
        F: FnOnce() -> T,
    {
        match Transaction::current() {
            Some(transaction) => transaction.measure_method(&self.qualified_name, f),
            None => f(),
        }
    }

    /// Wraps `f` so that every call through the wrapper is timed at this call site.
    pub fn wrap<F>(self, f: F) -> Instrumented<F> {
        Instrumented::new(self, f)
    }
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.qualified_name)
    }
}

/// A callable paired with the call site it is timed under.
#[derive(Clone)]
pub struct Instrumented<F> {
    site: CallSite,
    inner: F,
}

impl<F> Instrumented<F> {
    /// Creates a new `Instrumented` wrapper.
    pub fn new(site: CallSite, inner: F) -> Self {
        Instrumented { site, inner }
    }

    /// Call site this wrapper times under.
    pub fn call_site(&self) -> &CallSite {
        &self.site
    }

    /// Gets a reference to the wrapped callable.
    pub fn get_ref(&self) -> &F {
        &self.inner
    }

    /// Consumes the wrapper, returning the wrapped callable.
    pub fn into_inner(self) -> F {
        self.inner
    }
}

impl<F> fmt::Debug for Instrumented<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instrumented").field("site", &self.site).finish_non_exhaustive()
    }
}

/// Invocation of an instrumented callable with its arguments as a tuple.
pub trait InstrumentedCall<Args> {
    /// Return type of the wrapped callable.
    type Output;

    /// Calls the wrapped callable.
    fn call(&self, args: Args) -> Self::Output;
}

macro_rules! impl_instrumented_call {
    ($($arg:ident),*) => {
        impl<Func, Ret, $($arg,)*> InstrumentedCall<($($arg,)*)> for Instrumented<Func>
        where
            Func: Fn($($arg),*) -> Ret,
        {
            type Output = Ret;

            #[allow(non_snake_case)]
            fn call(&self, ($($arg,)*): ($($arg,)*)) -> Ret {
                self.site.call(|| (self.inner)($($arg),*))
            }
        }
    };
}

impl_instrumented_call!();
impl_instrumented_call!(A1);
impl_instrumented_call!(A1, A2);
impl_instrumented_call!(A1, A2, A3);
impl_instrumented_call!(A1, A2, A3, A4);
impl_instrumented_call!(A1, A2, A3, A4, A5);
impl_instrumented_call!(A1, A2, A3, A4, A5, A6);

#[cfg(test)]
mod tests {
    use std::{
        panic::{catch_unwind, AssertUnwindSafe},
        sync::Arc,
        time::Duration,
    };

    use metrics::NoopRecorder;
    use quanta::Clock;

    use super::{CallSite, InstrumentedCall, MethodKind};
    use crate::{transaction::Transaction, Config, MemorySink, Telemetry};

    #[test]
    fn qualified_names() {
        assert_eq!(CallSite::instance("Project", "repository").qualified_name(), "Project#repository");
        assert_eq!(CallSite::associated("Project", "find").to_string(), "Project.find");
        assert_eq!(CallSite::new("A", "b", MethodKind::Instance).kind(), MethodKind::Instance);
    }

    #[test]
    fn passes_through_without_transaction() {
        let add = CallSite::associated("Math", "add").wrap(|a: i32, b: i32| a + b);
        assert_eq!(add.call((2, 3)), 5);

        let unit = CallSite::associated("Noop", "call").wrap(|| ());
        unit.call(());

        let six = CallSite::associated("Many", "args")
            .wrap(|a: u8, b: u8, c: u8, d: u8, e: u8, f: u8| [a, b, c, d, e, f].iter().map(|v| *v as u32).sum::<u32>());
        assert_eq!(six.call((1, 2, 3, 4, 5, 6)), 21);
    }

    #[test]
    fn attributes_calls_to_current_transaction() {
        let (clock, mock) = Clock::mock();
        let telemetry = Telemetry::builder()
            .with_config(Config::default().with_method_call_threshold(Duration::ZERO))
            .with_recorder(Arc::new(NoopRecorder))
            .with_sink(MemorySink::new())
            .with_clock(clock)
            .build()
            .unwrap();

        let find = CallSite::associated("Project", "find").wrap(|id: u64| {
            mock.increment(Duration::from_millis(2));
            id * 2
        });
        let transaction = Transaction::new(&telemetry, labels! { "controller" => "A", "action" => "b" });

        let results = transaction.run(|| (find.call((1,)), find.call((2,)))).unwrap();
        assert_eq!(results, (2, 4));
        assert_eq!(transaction.method_call_count("Project.find"), 2);
    }

    #[test]
    fn panicking_call_is_not_counted() {
        let telemetry = Telemetry::builder()
            .with_recorder(Arc::new(NoopRecorder))
            .with_sink(MemorySink::new())
            .build()
            .unwrap();
        let site = CallSite::instance("Repository", "fetch");
        let transaction = Transaction::new(&telemetry, labels! { "controller" => "A", "action" => "b" });

        transaction
            .run(|| {
                site.call(|| ());
                let result = catch_unwind(AssertUnwindSafe(|| site.call(|| panic!("fetch failed"))));
                assert!(result.is_err());
            })
            .unwrap();

        assert_eq!(transaction.method_call_count("Repository#fetch"), 1);
    }
}
