//! Provides [Service], the lookup table that getter chains are resolved
//! against and that dispatches invocations to registered operations.
use futures::future::BoxFuture;
use futures::prelude::*;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::RemoteError;
use crate::message::GetterLink;
use crate::value::{ArgLists, FromValue, IntoValue, TypeMismatch, Value};

pub type BoxProcedure = BoxFuture<'static, Result<(), RemoteError>>;
pub type BoxCall = BoxFuture<'static, Result<Value, RemoteError>>;
pub type BoxObservable = BoxStream<'static, Result<Value, RemoteError>>;

type Handler<T> = Box<dyn Fn(ArgLists) -> Result<T, ArgsError> + Send + Sync + 'static>;

/// Error resolving a getter chain or an operation. Raised before any user
/// code runs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("Getter \"{name}\" not found")]
    UnknownGetter { name: String },
    #[error("Operation \"{name}\" not found")]
    UnknownOperation { name: String },
    #[error("\"{name}\" expects argument lists of sizes {expected:?}, got {actual:?}")]
    ArityMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("Invalid argument {index} in list {list} of \"{name}\"")]
    InvalidArgument {
        name: String,
        list: usize,
        index: usize,
        #[source]
        error: TypeMismatch,
    },
}

impl DispatchError {
    pub const UNKNOWN_GETTER: &'static str = "UNKNOWN_GETTER";
    pub const UNKNOWN_OPERATION: &'static str = "UNKNOWN_OPERATION";
    pub const ARITY_MISMATCH: &'static str = "ARITY_MISMATCH";
    pub const INVALID_ARGUMENT: &'static str = "INVALID_ARGUMENT";

    /// Stable error kind sent to the client.
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::UnknownGetter { .. } => Self::UNKNOWN_GETTER,
            DispatchError::UnknownOperation { .. } => Self::UNKNOWN_OPERATION,
            DispatchError::ArityMismatch { .. } => Self::ARITY_MISMATCH,
            DispatchError::InvalidArgument { .. } => Self::INVALID_ARGUMENT,
        }
    }

    /// Returns true if a remote error kind denotes a dispatch error.
    pub fn is_dispatch_kind(kind: &str) -> bool {
        [
            Self::UNKNOWN_GETTER,
            Self::UNKNOWN_OPERATION,
            Self::ARITY_MISMATCH,
            Self::INVALID_ARGUMENT,
        ]
        .contains(&kind)
    }
}

impl From<DispatchError> for RemoteError {
    fn from(error: DispatchError) -> Self {
        let message = match &error {
            DispatchError::InvalidArgument { error: source, .. } => {
                format!("{}: {}", error, source)
            }
            _ => error.to_string(),
        };
        RemoteError::new(error.kind(), message)
    }
}

/// Error returned by [FromArgs].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArgsError {
    #[error("Expected argument lists of sizes {expected:?}, got {actual:?}")]
    Arity {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("Invalid argument {index} in list {list}")]
    Type {
        list: usize,
        index: usize,
        #[source]
        error: TypeMismatch,
    },
}

impl ArgsError {
    fn into_dispatch(self, name: &str) -> DispatchError {
        let name = name.to_string();
        match self {
            ArgsError::Arity { expected, actual } => DispatchError::ArityMismatch {
                name,
                expected,
                actual,
            },
            ArgsError::Type { list, index, error } => DispatchError::InvalidArgument {
                name,
                list,
                index,
                error,
            },
        }
    }
}

/// Typed arguments of an operation or a getter.
pub trait FromArgs: Sized {
    fn from_args(arg_lists: ArgLists) -> Result<Self, ArgsError>;
}

impl FromArgs for ArgLists {
    fn from_args(arg_lists: ArgLists) -> Result<Self, ArgsError> {
        Ok(arg_lists)
    }
}

impl FromArgs for () {
    fn from_args(arg_lists: ArgLists) -> Result<Self, ArgsError> {
        match arg_lists.as_slice() {
            [] => Ok(()),
            [list] if list.is_empty() => Ok(()),
            _ => Err(ArgsError::Arity {
                expected: vec![],
                actual: arg_lists.iter().map(Vec::len).collect(),
            }),
        }
    }
}

fn single_list(mut arg_lists: ArgLists, len: usize) -> Result<Vec<Value>, ArgsError> {
    if arg_lists.len() == 1 && arg_lists[0].len() == len {
        Ok(arg_lists.remove(0))
    } else {
        Err(ArgsError::Arity {
            expected: vec![len],
            actual: arg_lists.iter().map(Vec::len).collect(),
        })
    }
}

macro_rules! tuple_args {
    ($len:literal; $($name:ident : $index:literal),+) => {
        impl<$($name: FromValue),+> FromArgs for ($($name,)+) {
            fn from_args(arg_lists: ArgLists) -> Result<Self, ArgsError> {
                let mut args = single_list(arg_lists, $len)?.into_iter();
                Ok(($(
                    $name::from_value(args.next().unwrap_or_default()).map_err(|error| {
                        ArgsError::Type {
                            list: 0,
                            index: $index,
                            error,
                        }
                    })?,
                )+))
            }
        }
    };
}

tuple_args!(1; A: 0);
tuple_args!(2; A: 0, B: 1);
tuple_args!(3; A: 0, B: 1, C: 2);
tuple_args!(4; A: 0, B: 1, C: 2, D: 3);

/// Dispatch target with named operations and getters for nested targets.
#[derive(Default)]
pub struct Service {
    procedures: HashMap<String, Handler<BoxProcedure>>,
    functions: HashMap<String, Handler<BoxCall>>,
    observables: HashMap<String, Handler<BoxObservable>>,
    getters: HashMap<String, Handler<Arc<Service>>>,
}

impl Service {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fire and forget operation.
    pub fn add_procedure<Args, Fut>(
        &mut self,
        name: impl ToString,
        f: impl Fn(Args) -> Fut + Send + Sync + 'static,
    ) where
        Args: FromArgs,
        Fut: Future<Output = Result<(), RemoteError>> + Send + 'static,
    {
        self.procedures.insert(
            name.to_string(),
            Box::new(move |arg_lists| Ok(f(Args::from_args(arg_lists)?).boxed())),
        );
    }

    /// Register an operation with a single result.
    pub fn add_function<Args, Fut, Output>(
        &mut self,
        name: impl ToString,
        f: impl Fn(Args) -> Fut + Send + Sync + 'static,
    ) where
        Args: FromArgs,
        Fut: Future<Output = Result<Output, RemoteError>> + Send + 'static,
        Output: IntoValue + 'static,
    {
        self.functions.insert(
            name.to_string(),
            Box::new(move |arg_lists| {
                let call = f(Args::from_args(arg_lists)?);
                Ok(call.map_ok(IntoValue::into_value).boxed())
            }),
        );
    }

    /// Register an operation that produces a stream. Every subscription calls
    /// `f` and gets an independent stream.
    pub fn add_observable<Args, Source, Item>(
        &mut self,
        name: impl ToString,
        f: impl Fn(Args) -> Source + Send + Sync + 'static,
    ) where
        Args: FromArgs,
        Source: Stream<Item = Result<Item, RemoteError>> + Send + 'static,
        Item: IntoValue + 'static,
    {
        self.observables.insert(
            name.to_string(),
            Box::new(move |arg_lists| {
                let source = f(Args::from_args(arg_lists)?);
                Ok(source.map_ok(IntoValue::into_value).boxed())
            }),
        );
    }

    /// Register a getter that builds a nested service from its arguments.
    pub fn add_getter<Args>(
        &mut self,
        name: impl ToString,
        f: impl Fn(Args) -> Service + Send + Sync + 'static,
    ) where
        Args: FromArgs,
    {
        self.getters.insert(
            name.to_string(),
            Box::new(move |arg_lists| Ok(Arc::new(f(Args::from_args(arg_lists)?)))),
        );
    }

    /// Register `service` as a nested service reachable through a getter
    /// without arguments.
    pub fn add_service(&mut self, name: impl ToString, service: Service) {
        let service = Arc::new(service);
        self.getters.insert(
            name.to_string(),
            Box::new(move |arg_lists| {
                <()>::from_args(arg_lists)?;
                Ok(Arc::clone(&service))
            }),
        );
    }

    /// Follow `getter_chain` starting at this service and return the final
    /// target.
    pub fn resolve(
        self: &Arc<Self>,
        getter_chain: Vec<GetterLink>,
    ) -> Result<Arc<Service>, DispatchError> {
        getter_chain
            .into_iter()
            .try_fold(Arc::clone(self), |target, link| {
                target.get(&link.name, link.arg_lists)
            })
    }

    fn get(&self, name: &str, arg_lists: ArgLists) -> Result<Arc<Service>, DispatchError> {
        let getter = self
            .getters
            .get(name)
            .ok_or_else(|| DispatchError::UnknownGetter {
                name: name.to_string(),
            })?;
        getter(arg_lists).map_err(|error| error.into_dispatch(name))
    }

    pub fn fire(&self, name: &str, arg_lists: ArgLists) -> Result<BoxProcedure, DispatchError> {
        dispatch(&self.procedures, name, arg_lists)
    }

    pub fn call(&self, name: &str, arg_lists: ArgLists) -> Result<BoxCall, DispatchError> {
        dispatch(&self.functions, name, arg_lists)
    }

    pub fn observe(&self, name: &str, arg_lists: ArgLists) -> Result<BoxObservable, DispatchError> {
        dispatch(&self.observables, name, arg_lists)
    }
}

fn dispatch<T>(
    handlers: &HashMap<String, Handler<T>>,
    name: &str,
    arg_lists: ArgLists,
) -> Result<T, DispatchError> {
    let handler = handlers
        .get(name)
        .ok_or_else(|| DispatchError::UnknownOperation {
            name: name.to_string(),
        })?;
    handler(arg_lists).map_err(|error| error.into_dispatch(name))
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("procedures", &self.procedures.keys().collect::<Vec<_>>())
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .field("observables", &self.observables.keys().collect::<Vec<_>>())
            .field("getters", &self.getters.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::value::Marker;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter_service() -> (Arc<Service>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);

        let mut counter = Service::new();
        counter.add_function("add", move |(a, b): (i32, i32)| {
            calls2.fetch_add(1, Ordering::SeqCst);
            future::ready(Ok(a + b))
        });

        let mut scaled = Service::new();
        scaled.add_getter("by", |(factor,): (i64,)| {
            let mut service = Service::new();
            service.add_function("apply", move |(x,): (i64,)| future::ready(Ok(x * factor)));
            service.add_observable("repeat", move |(times,): (Count,)| {
                stream::iter((0..times.0).map(move |_| Ok(factor)))
            });
            service
        });

        let mut root = Service::new();
        root.add_service("counter", counter);
        root.add_service("scaled", scaled);
        (Arc::new(root), calls)
    }

    /// Newtype so that the repeat count can be given as an `Int`.
    struct Count(i32);

    impl FromValue for Count {
        fn from_value(value: Value) -> Result<Self, TypeMismatch> {
            i32::from_value(value).map(Count)
        }
    }

    #[async_std::test]
    async fn resolve_nested_chain() {
        let (root, _) = counter_service();
        let target = root
            .resolve(vec![
                GetterLink::new("scaled", vec![]),
                GetterLink::new("by", vec![vec![Value::Long(3)]]),
            ])
            .unwrap();
        let result = target
            .call("apply", vec![vec![Value::Long(5)]])
            .unwrap()
            .await;
        assert_eq!(result, Ok(Value::Long(15)));

        let items = target
            .observe("repeat", vec![vec![Value::Int(2)]])
            .unwrap()
            .collect::<Vec<_>>()
            .await;
        assert_eq!(items, vec![Ok(Value::Long(3)), Ok(Value::Long(3))]);
    }

    #[test]
    fn unknown_getter() {
        let (root, _) = counter_service();
        let error = root
            .resolve(vec![
                GetterLink::new("counter", vec![]),
                GetterLink::new("missing", vec![]),
            ])
            .unwrap_err();
        assert_eq!(
            error,
            DispatchError::UnknownGetter {
                name: "missing".to_string()
            }
        );
        assert_eq!(RemoteError::from(error).kind, "UNKNOWN_GETTER");
    }

    #[test]
    fn dispatch_errors_do_not_run_user_code() {
        let (root, calls) = counter_service();
        let counter = root
            .resolve(vec![GetterLink::new("counter", vec![])])
            .unwrap();

        let error = counter.call("sub", vec![]).err().unwrap();
        assert_eq!(error.kind(), DispatchError::UNKNOWN_OPERATION);

        let error = counter
            .call("add", vec![vec![Value::Int(1)]])
            .err()
            .unwrap();
        assert_eq!(
            error,
            DispatchError::ArityMismatch {
                name: "add".to_string(),
                expected: vec![2],
                actual: vec![1],
            }
        );

        let error = counter
            .call("add", vec![vec![Value::Int(1), Value::Null]])
            .err()
            .unwrap();
        assert_eq!(
            error,
            DispatchError::InvalidArgument {
                name: "add".to_string(),
                list: 0,
                index: 1,
                error: TypeMismatch {
                    expected: "int",
                    actual: Marker::Null,
                },
            }
        );

        // A function is not a procedure.
        let error = counter
            .fire("add", vec![vec![Value::Int(1), Value::Int(2)]])
            .err()
            .unwrap();
        assert_eq!(error.kind(), DispatchError::UNKNOWN_OPERATION);

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn static_service_rejects_arguments() {
        let (root, _) = counter_service();
        let error = root
            .resolve(vec![GetterLink::new("counter", vec![vec![Value::Null]])])
            .unwrap_err();
        assert_eq!(error.kind(), DispatchError::ARITY_MISMATCH);
    }

    #[test]
    fn dispatch_kinds() {
        for kind in &[
            "UNKNOWN_GETTER",
            "UNKNOWN_OPERATION",
            "ARITY_MISMATCH",
            "INVALID_ARGUMENT",
        ] {
            assert!(DispatchError::is_dispatch_kind(kind));
        }
        assert!(!DispatchError::is_dispatch_kind("IllegalStateException"));
    }
}
