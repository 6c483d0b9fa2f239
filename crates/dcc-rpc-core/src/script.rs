//! Sandboxed script host for remotely registered functions.
//!
//! A peer "teaches" this process a new capability by sending function
//! source as a WebAssembly module (text or binary). Modules are the
//! security boundary: they may declare **no imports**, run against a fresh
//! store with a fuel budget per invocation, and touch nothing but their own
//! linear memory. A guest that loops forever traps on fuel exhaustion
//! instead of wedging the server.
//!
//! # Guest ABI
//!
//! A module must export:
//! - `memory` — its linear memory,
//! - `alloc(len: i32) -> i32` — returns a pointer the host may write
//!   `len` bytes of UTF-8 JSON call kwargs to,
//! - the function itself: `name(ptr: i32, len: i32) -> i64`, returning the
//!   result location packed as `ptr << 32 | len` (UTF-8 JSON in guest
//!   memory).

use crate::config::RpcConfig;
use crate::error::{Result, RpcError};
use serde_json::{Map, Value};
use wasmtime::{Config, Engine, Instance, Module, Store};

/// Compiles peer-supplied source into invocable functions.
pub struct ScriptHost {
    engine: Engine,
}

impl ScriptHost {
    pub fn new() -> Result<Self> {
        let mut config = Config::new();
        config.consume_fuel(true);
        let engine = Engine::new(&config).map_err(|e| RpcError::Config {
            message: format!("Failed to initialize script engine: {}", e),
        })?;
        Ok(Self { engine })
    }

    /// Compile `source` (WAT text or wasm binary) and validate that it
    /// exports `name` with the expected ABI.
    ///
    /// Validation instantiates the module once so that a bad module fails
    /// at registration time, not on the first call.
    pub fn compile(&self, name: &str, source: &[u8]) -> Result<ScriptFunction> {
        let module = Module::new(&self.engine, source).map_err(|e| RpcError::Script {
            name: name.to_string(),
            message: format!("Failed to compile module: {}", e),
        })?;

        if module.imports().len() > 0 {
            return Err(RpcError::Script {
                name: name.to_string(),
                message: "Sandboxed modules may not declare imports".to_string(),
            });
        }

        let function = ScriptFunction {
            name: name.to_string(),
            engine: self.engine.clone(),
            module,
        };
        function.instantiate().map(|_| ())?;
        Ok(function)
    }
}

/// One compiled, invocable guest function.
///
/// Each [`invoke`](Self::invoke) runs in a fresh store: guests keep no
/// state between calls and cannot observe each other.
pub struct ScriptFunction {
    name: String,
    engine: Engine,
    module: Module,
}

struct GuestCall {
    store: Store<()>,
    instance: Instance,
}

impl ScriptFunction {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn err(&self, message: impl std::fmt::Display) -> RpcError {
        RpcError::Script {
            name: self.name.clone(),
            message: message.to_string(),
        }
    }

    fn instantiate(&self) -> Result<GuestCall> {
        let mut store = Store::new(&self.engine, ());
        store
            .set_fuel(RpcConfig::SCRIPT_FUEL)
            .map_err(|e| self.err(e))?;
        let instance =
            Instance::new(&mut store, &self.module, &[]).map_err(|e| self.err(e))?;

        // Fail fast if the ABI exports are missing or mistyped.
        instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| self.err("module does not export `memory`"))?;
        instance
            .get_typed_func::<i32, i32>(&mut store, "alloc")
            .map_err(|e| self.err(format!("bad `alloc` export: {}", e)))?;
        instance
            .get_typed_func::<(i32, i32), i64>(&mut store, &self.name)
            .map_err(|e| self.err(format!("bad `{}` export: {}", self.name, e)))?;

        Ok(GuestCall { store, instance })
    }

    /// Invoke the guest function with the given call kwargs.
    pub fn invoke(&self, kwargs: &Map<String, Value>) -> Result<Value> {
        let GuestCall {
            mut store,
            instance,
        } = self.instantiate()?;

        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| self.err("module does not export `memory`"))?;
        let alloc = instance
            .get_typed_func::<i32, i32>(&mut store, "alloc")
            .map_err(|e| self.err(e))?;
        let func = instance
            .get_typed_func::<(i32, i32), i64>(&mut store, &self.name)
            .map_err(|e| self.err(e))?;

        let input = serde_json::to_vec(&Value::Object(kwargs.clone()))?;
        let ptr = alloc
            .call(&mut store, input.len() as i32)
            .map_err(|e| self.err(format!("alloc trapped: {}", e)))?;
        memory
            .write(&mut store, ptr as u32 as usize, &input)
            .map_err(|e| self.err(format!("input out of bounds: {}", e)))?;

        let packed = func
            .call(&mut store, (ptr, input.len() as i32))
            .map_err(|e| self.err(format!("call trapped: {}", e)))?;

        let out_ptr = (packed >> 32) as u32 as usize;
        let out_len = (packed & 0xFFFF_FFFF) as u32 as usize;
        if out_len > RpcConfig::MAX_MESSAGE_SIZE {
            return Err(self.err(format!("result too large: {} bytes", out_len)));
        }
        let mut out = vec![0u8; out_len];
        memory
            .read(&store, out_ptr, &mut out)
            .map_err(|e| self.err(format!("result out of bounds: {}", e)))?;

        serde_json::from_slice(&out)
            .map_err(|e| self.err(format!("result is not valid JSON: {}", e)))
    }
}
