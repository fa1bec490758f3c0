//! Named handlers for the three block code variants.
//!
//! Executable code is never deserialized. A block stores the registry name
//! of its handler (plus serialized state for invokables); the worker looks
//! the name up here. Recording and execution therefore have to run the same
//! registry setup.

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::models::block::{BlockCode, BlockFailure};
use crate::{AppError, Result};

use super::wrapper::BlockWrapper;

/// Return type of every handler: an optional structured output, or a failure
/// that is recorded on the block.
pub type HandlerResult = std::result::Result<Option<Value>, BlockFailure>;

/// Arguments handed to a handler for one invocation.
pub struct Invocation {
    /// Present when the handler asked for the execution-context wrapper.
    pub wrapper: Option<Arc<dyn BlockWrapper>>,
    /// Decoded positional arguments.
    pub args: Vec<Value>,
}

impl Invocation {
    /// Positional argument `index`.
    #[must_use]
    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    /// Report progress to the wrapper, if one was injected.
    pub fn activity(&self, message: &str) {
        if let Some(wrapper) = &self.wrapper {
            wrapper.activity(message);
        }
    }
}

/// Object whose serialized state is stored with the block and which is
/// called as a function at execution time.
pub trait Invokable: Serialize + DeserializeOwned + Send + 'static {
    /// Registry name.
    const TYPE_NAME: &'static str;
    /// Whether the wrapper is injected into the invocation.
    const WANTS_WRAPPER: bool = false;

    /// Execute with the recorded arguments.
    fn invoke(&mut self, call: Invocation) -> HandlerResult;
}

/// Type instantiated fresh at execution time and run through [`EntryPoint::run`].
pub trait EntryPoint: Default + Send + 'static {
    /// Registry name.
    const CLASS: &'static str;
    /// Whether the wrapper is injected into the invocation.
    const WANTS_WRAPPER: bool = false;

    /// Execute with the recorded arguments.
    fn run(&mut self, call: Invocation) -> HandlerResult;
}

type CallFn = Arc<dyn Fn(Invocation) -> HandlerResult + Send + Sync>;
type StatefulFn = Arc<dyn Fn(Value, Invocation) -> HandlerResult + Send + Sync>;

struct Registered<F> {
    wants_wrapper: bool,
    call: F,
}

/// A handler bound to its code, ready to run on a blocking thread.
pub type PreparedCall = Box<dyn FnOnce(Invocation) -> HandlerResult + Send>;

/// Registry: handler name -> callable, one table per code variant.
#[derive(Default)]
pub struct BlockRegistry {
    closures: HashMap<String, Registered<CallFn>>,
    invokables: HashMap<String, Registered<StatefulFn>>,
    classes: HashMap<String, Registered<CallFn>>,
}

impl BlockRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a closure under `name`.
    pub fn register_closure(
        &mut self,
        name: impl Into<String>,
        wants_wrapper: bool,
        handler: impl Fn(Invocation) -> HandlerResult + Send + Sync + 'static,
    ) {
        self.closures.insert(
            name.into(),
            Registered {
                wants_wrapper,
                call: Arc::new(handler),
            },
        );
    }

    /// Register an invokable type under [`Invokable::TYPE_NAME`].
    pub fn register_invokable<T: Invokable>(&mut self) {
        let call: StatefulFn = Arc::new(|state: Value, call: Invocation| {
            let mut object: T = serde_json::from_value(state)
                .map_err(|e| BlockFailure::new("serialization", e.to_string()))?;
            object.invoke(call)
        });
        self.invokables.insert(
            T::TYPE_NAME.to_owned(),
            Registered {
                wants_wrapper: T::WANTS_WRAPPER,
                call,
            },
        );
    }

    /// Register an entry-point type under [`EntryPoint::CLASS`].
    pub fn register_class<T: EntryPoint>(&mut self) {
        let call: CallFn = Arc::new(|call: Invocation| T::default().run(call));
        self.classes.insert(
            T::CLASS.to_owned(),
            Registered {
                wants_wrapper: T::WANTS_WRAPPER,
                call,
            },
        );
    }

    /// Whether `code` resolves to a handler that wants the wrapper injected.
    ///
    /// # Errors
    ///
    /// Returns `AppError::UnknownHandler` if nothing is registered for `code`.
    pub fn wants_wrapper(&self, code: &BlockCode) -> Result<bool> {
        let found = match code {
            BlockCode::Closure { handler } => self.closures.get(handler).map(|r| r.wants_wrapper),
            BlockCode::Invokable { type_name, .. } => {
                self.invokables.get(type_name).map(|r| r.wants_wrapper)
            }
            BlockCode::ClassName { class } => self.classes.get(class).map(|r| r.wants_wrapper),
        };
        found.ok_or_else(|| AppError::UnknownHandler(code.handler_name().to_owned()))
    }

    /// Bind `code` to its handler.
    ///
    /// # Errors
    ///
    /// Returns `AppError::UnknownHandler` if nothing is registered for `code`.
    pub fn prepare(&self, code: &BlockCode) -> Result<PreparedCall> {
        let unknown = || AppError::UnknownHandler(code.handler_name().to_owned());
        match code {
            BlockCode::Closure { handler } => {
                let call = Arc::clone(&self.closures.get(handler).ok_or_else(unknown)?.call);
                Ok(Box::new(move |inv| call(inv)))
            }
            BlockCode::Invokable { type_name, state } => {
                let call = Arc::clone(&self.invokables.get(type_name).ok_or_else(unknown)?.call);
                let state = state.clone();
                Ok(Box::new(move |inv| call(state, inv)))
            }
            BlockCode::ClassName { class } => {
                let call = Arc::clone(&self.classes.get(class).ok_or_else(unknown)?.call);
                Ok(Box::new(move |inv| call(inv)))
            }
        }
    }
}

/// Code for an invokable object, capturing its current state.
///
/// # Errors
///
/// Returns `AppError::Serialization` if the object cannot be encoded.
pub fn invokable<T: Invokable>(object: &T) -> Result<BlockCode> {
    Ok(BlockCode::Invokable {
        type_name: T::TYPE_NAME.to_owned(),
        state: serde_json::to_value(object)?,
    })
}

/// Code for an entry-point type.
#[must_use]
pub fn class<T: EntryPoint>() -> BlockCode {
    BlockCode::class(T::CLASS)
}
