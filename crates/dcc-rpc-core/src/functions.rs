//! Process-local function registry.
//!
//! Maps function names to callables. Purely in-memory: rebuilt on every
//! process start, so functions a peer registers remotely live exactly as
//! long as this process. Names are unique; last registration wins.

use crate::error::{Result, RpcError};
use crate::script::ScriptHost;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// A registered callable. Receives the call kwargs, returns a JSON value.
pub type Handler = Arc<dyn Fn(&Map<String, Value>) -> Result<Value> + Send + Sync>;

/// Where a function may execute.
///
/// `MainThread` functions touch a host API that is not thread-safe; the
/// server routes them through the host pump instead of calling them on a
/// network task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecAffinity {
    Any,
    MainThread,
}

/// One registry entry.
#[derive(Clone)]
pub struct RegisteredFunction {
    pub name: String,
    pub handler: Handler,
    pub affinity: ExecAffinity,
    pub description: Option<String>,
}

/// In-memory registry of callable functions.
pub struct FunctionRegistry {
    functions: RwLock<HashMap<String, RegisteredFunction>>,
    script_host: ScriptHost,
    /// Host capability names advertised at server start
    /// (`additional_globals`); surfaced through the server's `get_globals`.
    globals: Vec<String>,
}

impl FunctionRegistry {
    pub fn new(globals: Vec<String>) -> Result<Self> {
        Ok(Self {
            functions: RwLock::new(HashMap::new()),
            script_host: ScriptHost::new()?,
            globals,
        })
    }

    /// Register a callable under `name`. Replaces any previous entry.
    pub fn register<F>(&self, name: &str, handler: F)
    where
        F: Fn(&Map<String, Value>) -> Result<Value> + Send + Sync + 'static,
    {
        self.register_entry(RegisteredFunction {
            name: name.to_string(),
            handler: Arc::new(handler),
            affinity: ExecAffinity::Any,
            description: None,
        });
    }

    /// Register a callable with an explicit thread affinity and description.
    pub fn register_entry(&self, function: RegisteredFunction) {
        debug!("Registering function '{}'", function.name);
        self.functions
            .write()
            .expect("function registry lock poisoned")
            .insert(function.name.clone(), function);
    }

    /// Register a function from peer-supplied source (WAT or wasm binary).
    ///
    /// The source is compiled by the sandboxed script host; the module must
    /// export a function named `name`.
    pub fn register_source(&self, name: &str, source: &[u8]) -> Result<()> {
        let compiled = self.script_host.compile(name, source)?;
        self.register_entry(RegisteredFunction {
            name: name.to_string(),
            handler: Arc::new(move |kwargs| compiled.invoke(kwargs)),
            affinity: ExecAffinity::Any,
            description: Some("registered remotely".to_string()),
        });
        Ok(())
    }

    /// Look up a function by name.
    pub fn get(&self, name: &str) -> Option<RegisteredFunction> {
        self.functions
            .read()
            .expect("function registry lock poisoned")
            .get(name)
            .cloned()
    }

    /// Look up a function, failing with a lookup error when absent.
    pub fn get_required(&self, name: &str) -> Result<RegisteredFunction> {
        self.get(name).ok_or_else(|| RpcError::FunctionNotRegistered {
            name: name.to_string(),
        })
    }

    /// Remove a function. Returns whether it existed.
    pub fn unregister(&self, name: &str) -> bool {
        self.functions
            .write()
            .expect("function registry lock poisoned")
            .remove(name)
            .is_some()
    }

    /// Sorted snapshot of all registered names.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .functions
            .read()
            .expect("function registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Name/description metadata for one function.
    pub fn describe(&self, name: &str) -> Value {
        match self.get(name) {
            Some(f) => json!({
                "found": true,
                "name": f.name,
                "description": f.description,
            }),
            None => json!({"found": false, "name": name}),
        }
    }

    /// Host capability names advertised at server start.
    pub fn globals(&self) -> &[String] {
        &self.globals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> FunctionRegistry {
        FunctionRegistry::new(vec!["cmds".to_string()]).unwrap()
    }

    #[test]
    fn test_register_and_call() {
        let reg = registry();
        reg.register("add", |kwargs| {
            let a = kwargs.get("a").and_then(Value::as_i64).unwrap_or(0);
            let b = kwargs.get("b").and_then(Value::as_i64).unwrap_or(0);
            Ok(json!(a + b))
        });

        let func = reg.get("add").unwrap();
        let mut kwargs = Map::new();
        kwargs.insert("a".to_string(), json!(1));
        kwargs.insert("b".to_string(), json!(2));
        assert_eq!((func.handler)(&kwargs).unwrap(), json!(3));
    }

    #[test]
    fn test_get_required_absent_is_lookup_error() {
        let reg = registry();
        assert!(matches!(
            reg.get_required("missing"),
            Err(RpcError::FunctionNotRegistered { .. })
        ));
    }

    #[test]
    fn test_last_registration_wins() {
        let reg = registry();
        reg.register("f", |_| Ok(json!("first")));
        reg.register("f", |_| Ok(json!("second")));

        let func = reg.get("f").unwrap();
        assert_eq!((func.handler)(&Map::new()).unwrap(), json!("second"));
        assert_eq!(reg.list().len(), 1);
    }

    #[test]
    fn test_list_is_sorted() {
        let reg = registry();
        reg.register("zeta", |_| Ok(Value::Null));
        reg.register("alpha", |_| Ok(Value::Null));

        assert_eq!(reg.list(), vec!["alpha".to_string(), "zeta".to_string()]);
    }

    #[test]
    fn test_unregister() {
        let reg = registry();
        reg.register("f", |_| Ok(Value::Null));

        assert!(reg.unregister("f"));
        assert!(!reg.unregister("f"));
        assert!(reg.get("f").is_none());
    }

    #[test]
    fn test_register_source_and_invoke() {
        let reg = registry();
        let wat = r#"
            (module
              (memory (export "memory") 1)
              (func (export "alloc") (param i32) (result i32) (i32.const 2048))
              (func (export "echo") (param i32 i32) (result i64)
                (i64.or
                  (i64.shl (i64.extend_i32_u (local.get 0)) (i64.const 32))
                  (i64.extend_i32_u (local.get 1)))))
        "#;
        reg.register_source("echo", wat.as_bytes()).unwrap();

        let func = reg.get("echo").unwrap();
        let mut kwargs = Map::new();
        kwargs.insert("k".to_string(), json!("v"));
        assert_eq!((func.handler)(&kwargs).unwrap(), json!({"k": "v"}));
    }

    #[test]
    fn test_register_source_bad_module_does_not_register() {
        let reg = registry();
        assert!(reg.register_source("f", b"garbage").is_err());
        assert!(reg.get("f").is_none());
    }

    #[test]
    fn test_describe() {
        let reg = registry();
        reg.register("f", |_| Ok(Value::Null));

        let described = reg.describe("f");
        assert_eq!(described["found"], json!(true));
        assert_eq!(described["name"], json!("f"));

        assert_eq!(reg.describe("missing")["found"], json!(false));
    }

    #[test]
    fn test_globals() {
        let reg = registry();
        assert_eq!(reg.globals(), &["cmds".to_string()]);
    }
}
