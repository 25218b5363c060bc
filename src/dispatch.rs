//! Driver-specific functions, reachable through `func` on any handle.
//!
//! Each backend resource type carries a [`FuncTable`] naming the functions it
//! offers, how many arguments each takes, and whether it wants a block.
//! [`invoke`] checks a call against that signature before running it, so
//! that an interface error always means the caller got the call wrong. Any
//! error produced by the function body is returned exactly as produced.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;

use crate::error::{Error, Result};
use crate::types::Value;

/// Prefix under which driver functions are registered.
pub const FUNC_PREFIX: &str = "__";

/// Callback handed to a driver function that wants one. Each call passes
/// one value to the caller and returns the caller's answer.
pub type FuncBlock<'a> = &'a mut (dyn FnMut(Value) -> Result<Value> + Send + 'a);

/// How many arguments a driver function accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
}

impl Arity {
    pub fn accepts(self, given: usize) -> bool {
        match self {
            Arity::Exact(n) => given == n,
            Arity::AtLeast(n) => given >= n,
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arity::Exact(n) => write!(f, "{}", n),
            Arity::AtLeast(n) => write!(f, "{}+", n),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FuncSignature {
    pub arity: Arity,
    pub needs_block: bool,
}

type Handler<B> = Box<
    dyn for<'a> Fn(&'a mut B, Vec<Value>, Option<FuncBlock<'a>>) -> BoxFuture<'a, Result<Value>>
        + Send
        + Sync,
>;

/// One registered driver function.
pub struct Func<B: ?Sized> {
    signature: FuncSignature,
    handler: Handler<B>,
}

impl<B: ?Sized> Func<B> {
    pub fn signature(&self) -> FuncSignature {
        self.signature
    }

    pub async fn call<'a>(
        &self,
        target: &'a mut B,
        args: Vec<Value>,
        block: Option<FuncBlock<'a>>,
    ) -> Result<Value> {
        (self.handler)(target, args, block).await
    }
}

/// The driver functions offered by one backend resource type.
pub struct FuncTable<B: ?Sized> {
    funcs: HashMap<String, Arc<Func<B>>>,
}

impl<B: ?Sized> FuncTable<B> {
    pub fn new() -> Self {
        Self {
            funcs: HashMap::new(),
        }
    }

    /// Register a function that takes no block.
    pub fn register<F>(&mut self, name: &str, arity: Arity, handler: F)
    where
        F: for<'a> Fn(&'a mut B, Vec<Value>, Option<FuncBlock<'a>>) -> BoxFuture<'a, Result<Value>>
            + Send
            + Sync
            + 'static,
    {
        self.insert(name, arity, false, handler);
    }

    /// Register a function that must be called with a block.
    pub fn register_with_block<F>(&mut self, name: &str, arity: Arity, handler: F)
    where
        F: for<'a> Fn(&'a mut B, Vec<Value>, Option<FuncBlock<'a>>) -> BoxFuture<'a, Result<Value>>
            + Send
            + Sync
            + 'static,
    {
        self.insert(name, arity, true, handler);
    }

    fn insert<F>(&mut self, name: &str, arity: Arity, needs_block: bool, handler: F)
    where
        F: for<'a> Fn(&'a mut B, Vec<Value>, Option<FuncBlock<'a>>) -> BoxFuture<'a, Result<Value>>
            + Send
            + Sync
            + 'static,
    {
        let func = Func {
            signature: FuncSignature { arity, needs_block },
            handler: Box::new(handler),
        };
        self.funcs
            .insert(format!("{}{}", FUNC_PREFIX, name), Arc::new(func));
    }

    pub fn get(&self, name: &str) -> Option<Arc<Func<B>>> {
        self.funcs
            .get(&format!("{}{}", FUNC_PREFIX, name))
            .map(Arc::clone)
    }

    pub fn signature(&self, name: &str) -> Option<FuncSignature> {
        self.get(name).map(|func| func.signature())
    }

    /// Names of the registered functions, without the prefix.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .funcs
            .keys()
            .filter_map(|key| key.strip_prefix(FUNC_PREFIX))
            .collect();
        names.sort_unstable();
        names
    }

    /// Run `name` against `target`. Signatures are not checked here; use
    /// [`invoke`] for that.
    pub async fn call<'a>(
        &self,
        target: &'a mut B,
        name: &str,
        args: Vec<Value>,
        block: Option<FuncBlock<'a>>,
    ) -> Result<Value> {
        match self.get(name) {
            Some(func) => func.call(target, args, block).await,
            None => Err(not_available(name)),
        }
    }
}

impl<B: ?Sized> Default for FuncTable<B> {
    fn default() -> Self {
        Self::new()
    }
}

/// A backend resource that may offer driver functions.
///
/// The defaults offer none.
#[async_trait]
pub trait Extensible: Send {
    fn func_signature(&self, _name: &str) -> Option<FuncSignature> {
        None
    }

    async fn call_func<'a>(
        &'a mut self,
        name: &str,
        _args: Vec<Value>,
        _block: Option<FuncBlock<'a>>,
    ) -> Result<Value> {
        Err(not_available(name))
    }
}

fn not_available(name: &str) -> Error {
    Error::interface(format!("Driver specific function <{}> not available", name))
}

/// Call a driver function on `target` after checking the call against its
/// signature.
pub async fn invoke<'a, E>(
    target: &'a mut E,
    name: &str,
    args: Vec<Value>,
    block: Option<FuncBlock<'a>>,
) -> Result<Value>
where
    E: Extensible + ?Sized,
{
    let signature = target
        .func_signature(name)
        .ok_or_else(|| not_available(name))?;

    if !signature.arity.accepts(args.len()) {
        return Err(Error::interface(format!(
            "wrong number of arguments for driver specific function <{}> (given {}, expected {})",
            name,
            args.len(),
            signature.arity
        )));
    }

    if signature.needs_block && block.is_none() {
        return Err(Error::interface(format!(
            "no block given to driver specific function <{}>",
            name
        )));
    }

    tracing::debug!(func = name, args = args.len(), "calling driver specific function");
    target.call_func(name, args, block).await
}
