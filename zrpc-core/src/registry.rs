//! Procedure registry and the callable/generator seams.
//!
//! Procedures are looked up dynamically by name. A name is either registered
//! directly or contributed by an object through [`MethodSet`]; dotted
//! namespaces are literal key prefixes, not nested tables.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::{Result, RpcError};
use crate::serializer::{Kwargs, Value};

/// Names the framework refuses to register, keeping the exposed surface
/// clean of framework-internal verbs.
pub const RESERVED_NAMES: &[&str] = &[
    "register",
    "register_object",
    "proc",
    "task",
    "start",
    "stop",
    "serve",
    "reset",
    "connect",
    "bind",
    "bind_ports",
    "YIELD_SEND",
    "YIELD_THROW",
    "YIELD_CLOSE",
];

/// Error raised by a procedure or a generator.
///
/// Carries the class name and string form that end up in the FAIL reply's
/// error descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcError {
    pub ename: String,
    pub evalue: String,
}

impl ProcError {
    pub fn new(ename: impl Into<String>, evalue: impl Into<String>) -> Self {
        ProcError {
            ename: ename.into(),
            evalue: evalue.into(),
        }
    }
}

impl fmt::Display for ProcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.ename, self.evalue)
    }
}

impl std::error::Error for ProcError {}

/// What a procedure produced: a plain value, or a generator to be driven by
/// the streaming sub-protocol.
pub enum Outcome {
    Value(Value),
    Stream(Box<dyn Generator>),
}

/// A registered callable.
#[async_trait]
pub trait Procedure: Send + Sync {
    async fn invoke(&self, args: Vec<Value>, kwargs: Kwargs) -> std::result::Result<Outcome, ProcError>;
}

/// One turn of a generator.
pub enum GenStep {
    /// The generator produced a value and awaits the next command.
    Yielded(Value),
    /// The generator finished normally.
    Done,
    /// The generator failed; the error terminates the stream.
    Failed(ProcError),
}

/// Server half of a streaming procedure.
///
/// Mirrors the classic generator protocol: the driver feeds it values via
/// `send`, injects errors via `throw` and finally `close`s it. The defaults
/// give uncaught-error semantics; implement `throw`/`close` to observe them.
#[async_trait]
pub trait Generator: Send {
    /// Advance with a sent value (`Value::Null` for a bare "next").
    async fn send(&mut self, value: Value) -> GenStep;

    /// Inject an error. The default does not catch it: the stream fails
    /// with the injected error.
    async fn throw(&mut self, ename: &str, evalue: &str) -> GenStep {
        GenStep::Failed(ProcError::new(ename, evalue))
    }

    /// Release resources. The default just completes.
    async fn close(&mut self) -> GenStep {
        GenStep::Done
    }
}

/// Adapts any iterator of values into a [`Generator`]. Sent values are
/// discarded, which is what a plain yielding loop does.
pub struct IterGenerator<I> {
    iter: I,
}

impl<I> IterGenerator<I>
where
    I: Iterator<Item = Value> + Send,
{
    pub fn new(iter: I) -> Self {
        IterGenerator { iter }
    }
}

#[async_trait]
impl<I> Generator for IterGenerator<I>
where
    I: Iterator<Item = Value> + Send,
{
    async fn send(&mut self, _value: Value) -> GenStep {
        match self.iter.next() {
            Some(value) => GenStep::Yielded(value),
            None => GenStep::Done,
        }
    }
}

/// An object exposing callables for [`Registry::register_object`].
///
/// The Rust stand-in for attribute reflection: the object advertises its
/// methods, the registry applies the private/restricted/reserved filtering.
pub trait MethodSet {
    fn rpc_methods(&self) -> Vec<(String, Arc<dyn Procedure>)>;
}

struct FnProcedure<F>(F);

#[async_trait]
impl<F> Procedure for FnProcedure<F>
where
    F: Fn(Vec<Value>, Kwargs) -> std::result::Result<Value, ProcError> + Send + Sync,
{
    async fn invoke(&self, args: Vec<Value>, kwargs: Kwargs) -> std::result::Result<Outcome, ProcError> {
        (self.0)(args, kwargs).map(Outcome::Value)
    }
}

struct AsyncFnProcedure<F>(F);

#[async_trait]
impl<F, Fut> Procedure for AsyncFnProcedure<F>
where
    F: Fn(Vec<Value>, Kwargs) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<Value, ProcError>> + Send,
{
    async fn invoke(&self, args: Vec<Value>, kwargs: Kwargs) -> std::result::Result<Outcome, ProcError> {
        (self.0)(args, kwargs).await.map(Outcome::Value)
    }
}

struct GenFnProcedure<F>(F);

#[async_trait]
impl<F> Procedure for GenFnProcedure<F>
where
    F: Fn(Vec<Value>, Kwargs) -> std::result::Result<Box<dyn Generator>, ProcError> + Send + Sync,
{
    async fn invoke(&self, args: Vec<Value>, kwargs: Kwargs) -> std::result::Result<Outcome, ProcError> {
        (self.0)(args, kwargs).map(Outcome::Stream)
    }
}

/// Wrap a plain function into a [`Procedure`].
pub fn from_fn<F>(f: F) -> Arc<dyn Procedure>
where
    F: Fn(Vec<Value>, Kwargs) -> std::result::Result<Value, ProcError> + Send + Sync + 'static,
{
    Arc::new(FnProcedure(f))
}

/// Wrap an async function into a [`Procedure`].
pub fn from_async_fn<F, Fut>(f: F) -> Arc<dyn Procedure>
where
    F: Fn(Vec<Value>, Kwargs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Value, ProcError>> + Send + 'static,
{
    Arc::new(AsyncFnProcedure(f))
}

/// Wrap a generator constructor into a streaming [`Procedure`].
pub fn from_generator_fn<F>(f: F) -> Arc<dyn Procedure>
where
    F: Fn(Vec<Value>, Kwargs) -> std::result::Result<Box<dyn Generator>, ProcError>
        + Send
        + Sync
        + 'static,
{
    Arc::new(GenFnProcedure(f))
}

/// The procedure table: fully qualified name to callable.
#[derive(Default)]
pub struct Registry {
    procedures: Mutex<HashMap<String, Arc<dyn Procedure>>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    /// Register a callable under `name`. Reserved names fail loudly and
    /// leave the table unchanged.
    pub fn register(&self, name: &str, procedure: Arc<dyn Procedure>) -> Result<()> {
        if RESERVED_NAMES.contains(&name) {
            return Err(RpcError::Config(format!(
                "'{name}' is a reserved procedure name"
            )));
        }
        self.lock().insert(name.to_string(), procedure);
        Ok(())
    }

    /// Register every method an object advertises.
    ///
    /// Names starting with `_` are private and skipped; names listed in
    /// `restricted` are skipped; reserved names are skipped silently. With a
    /// namespace, entries are keyed `"<namespace>.<method>"` - the namespace
    /// itself may be dotted and is treated as a literal prefix.
    pub fn register_object(&self, object: &dyn MethodSet, namespace: Option<&str>, restricted: &[&str]) {
        let mut procedures = self.lock();
        for (name, procedure) in object.rpc_methods() {
            if name.starts_with('_')
                || restricted.contains(&name.as_str())
                || RESERVED_NAMES.contains(&name.as_str())
            {
                continue;
            }
            let key = match namespace {
                Some(ns) if !ns.is_empty() => format!("{ns}.{name}"),
                _ => name,
            };
            procedures.insert(key, procedure);
        }
    }

    /// Remove a registration. Returns whether the name was present.
    pub fn unregister(&self, name: &str) -> bool {
        self.lock().remove(name).is_some()
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn Procedure>> {
        self.lock().get(name).cloned()
    }

    /// The currently registered names, unordered.
    pub fn names(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<dyn Procedure>>> {
        self.procedures.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dummy() -> Arc<dyn Procedure> {
        from_fn(|_args, _kwargs| Ok(Value::Null))
    }

    struct Toy {
        value: i64,
    }

    impl MethodSet for Toy {
        fn rpc_methods(&self) -> Vec<(String, Arc<dyn Procedure>)> {
            let value = self.value;
            vec![
                (
                    "value".into(),
                    from_fn(move |_args, _kwargs| Ok(json!(value))),
                ),
                ("restricted".into(), dummy()),
                ("_private".into(), dummy()),
            ]
        }
    }

    #[test]
    fn reserved_names_are_rejected_and_table_unchanged() {
        let registry = Registry::new();
        for name in RESERVED_NAMES {
            let err = registry.register(name, dummy()).unwrap_err();
            let msg = err.to_string();
            assert!(msg.contains(name), "message {msg:?} does not name {name:?}");
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn register_object_skips_reserved_silently() {
        struct Hostile;
        impl MethodSet for Hostile {
            fn rpc_methods(&self) -> Vec<(String, Arc<dyn Procedure>)> {
                RESERVED_NAMES
                    .iter()
                    .map(|name| (name.to_string(), dummy()))
                    .collect()
            }
        }

        let registry = Registry::new();
        registry.register_object(&Hostile, None, &[]);
        assert!(registry.is_empty());
    }

    #[test]
    fn private_methods_are_not_registered() {
        let registry = Registry::new();
        registry.register_object(&Toy { value: 12 }, None, &[]);

        let mut names = registry.names();
        names.sort();
        assert_eq!(names, vec!["restricted", "value"]);
    }

    #[test]
    fn restricted_methods_are_not_registered() {
        let registry = Registry::new();
        registry.register_object(&Toy { value: 12 }, None, &["restricted"]);

        assert!(registry.lookup("restricted").is_none());
        assert!(registry.lookup("value").is_some());
    }

    #[test]
    fn namespaces_are_literal_prefixes() {
        let registry = Registry::new();
        registry.register_object(&Toy { value: 7 }, Some("this.has.a.toy"), &[]);

        assert!(registry.lookup("this.has.a.toy.value").is_some());
        assert!(registry.lookup("value").is_none());
        assert!(registry.lookup("toy.value").is_none());
    }

    #[test]
    fn unregister_removes_the_entry() {
        let registry = Registry::new();
        registry.register("f", dummy()).unwrap();
        assert!(registry.unregister("f"));
        assert!(!registry.unregister("f"));
        assert!(registry.lookup("f").is_none());
    }

    #[tokio::test]
    async fn iter_generator_yields_then_finishes() {
        let mut gen = IterGenerator::new((0..2).map(|i| json!(i)));
        assert!(matches!(gen.send(Value::Null).await, GenStep::Yielded(v) if v == json!(0)));
        assert!(matches!(gen.send(Value::Null).await, GenStep::Yielded(v) if v == json!(1)));
        assert!(matches!(gen.send(Value::Null).await, GenStep::Done));
    }

    #[tokio::test]
    async fn default_throw_fails_with_the_injected_error() {
        let mut gen = IterGenerator::new(std::iter::empty());
        match gen.throw("TypeError", "spam").await {
            GenStep::Failed(err) => assert_eq!(err, ProcError::new("TypeError", "spam")),
            _ => panic!("expected the stream to fail"),
        }
    }
}
