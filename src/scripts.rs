use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::rc::Rc;

use anyhow::{anyhow, Context, Result};
use rhai::{Dynamic, Engine, EvalAltResult, Module, Position, Scope};
use tracing::info;

use crate::object::ObjRef;

/// Mapping of variable name to value, shared by every fragment of one
/// dispatch call.
pub type Namespace = HashMap<String, Dynamic>;

/// A deferred scheduling request pushed by the `call_in` builtin while a
/// fragment runs; the engine drains the queue after each fragment returns.
#[derive(Debug, Clone)]
pub struct ScheduleRequest {
    pub delay_secs: f64,
    pub obj: ObjRef,
    pub name: String,
}

pub type PendingQueue = Rc<RefCell<Vec<ScheduleRequest>>>;

/// How one fragment execution ended.
#[derive(Debug)]
pub enum Outcome {
    Completed,
    /// The script called `interrupt()`: intentional early stop, not a fault.
    Interrupted,
    Fault { message: String, line: Option<usize>, trace: String },
}

const INTERRUPT_TOKEN: &str = "__merlin_interrupt__";

/// The embedded interpreter boundary. Fragments are text bodies evaluated
/// against a namespace; the runtime reports completion, an explicit
/// interrupt, or a fault with best-effort line information.
pub struct ScriptRuntime {
    engine: Engine,
    base: Namespace,
}

impl ScriptRuntime {
    pub fn new(pending: PendingQueue) -> Self {
        let mut engine = Engine::new();
        engine.set_fast_operators(true);
        register_api(&mut engine, pending);
        Self { engine, base: Namespace::new() }
    }

    /// Seed a value into the base namespace every fresh call starts from.
    pub fn set_base_var(&mut self, name: &str, value: Dynamic) {
        self.base.insert(name.to_string(), value);
    }

    pub fn base_namespace(&self) -> Namespace {
        self.base.clone()
    }

    /// Compile a helper bundle and merge it in: its functions become globally
    /// callable from fragments, its top-level variables join the base
    /// namespace.
    pub fn load_helpers(&mut self, path: &Path) -> Result<()> {
        let source = fs::read_to_string(path)
            .with_context(|| format!("reading helper bundle {}", path.display()))?;
        let ast = self
            .engine
            .compile(&source)
            .map_err(|err| anyhow!("compiling helper bundle {}: {err}", path.display()))?;
        // Module::eval_ast_as_new only exposes exported variables; plain
        // top-level `let`s have to be harvested from an evaluation scope.
        let mut scope = Scope::new();
        self.engine
            .eval_ast_with_scope::<Dynamic>(&mut scope, &ast)
            .map_err(|err| anyhow!("evaluating helper bundle {}: {err}", path.display()))?;
        for (name, _, value) in scope.iter() {
            self.base.insert(name.to_string(), value);
        }
        let module = Module::eval_ast_as_new(Scope::new(), &ast, &self.engine)
            .map_err(|err| anyhow!("loading helper functions from {}: {err}", path.display()))?;
        self.engine.register_global_module(module.into());
        Ok(())
    }

    /// Run one fragment body against the shared namespace. Mutations made
    /// before a fault or interrupt are still written back, so later fragments
    /// observe them.
    pub fn execute(&self, code: &str, ns: &mut Namespace) -> Outcome {
        let mut scope = Scope::new();
        for (name, value) in ns.iter() {
            scope.push_dynamic(name.clone(), value.clone());
        }
        let result = self.engine.eval_with_scope::<Dynamic>(&mut scope, code);
        for (name, _, value) in scope.iter() {
            ns.insert(name.to_string(), value);
        }
        match result {
            Ok(_) => Outcome::Completed,
            Err(err) if is_interrupt(&err) => Outcome::Interrupted,
            Err(err) => Outcome::Fault {
                message: err.to_string(),
                line: fault_line(&err),
                trace: format!("{err:?}"),
            },
        }
    }
}

fn is_interrupt(err: &EvalAltResult) -> bool {
    match err {
        EvalAltResult::ErrorRuntime(token, _) => token.to_string() == INTERRUPT_TOKEN,
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => is_interrupt(inner),
        _ => false,
    }
}

fn fault_line(err: &EvalAltResult) -> Option<usize> {
    if let Some(line) = err.position().line() {
        return Some(line);
    }
    if let EvalAltResult::ErrorInFunctionCall(_, _, inner, _) = err {
        return fault_line(inner);
    }
    None
}

fn register_api(engine: &mut Engine, pending: PendingQueue) {
    engine.register_type_with_name::<ObjRef>("Obj");
    engine.register_get("id", |obj: &mut ObjRef| obj.id as rhai::INT);
    engine.register_get("key", |obj: &mut ObjRef| obj.key.clone());
    engine.register_get("type_id", |obj: &mut ObjRef| obj.type_id.clone());
    engine.register_fn("to_string", |obj: &mut ObjRef| obj.key.clone());

    engine.register_fn("interrupt", || -> Result<(), Box<EvalAltResult>> {
        Err(EvalAltResult::ErrorRuntime(INTERRUPT_TOKEN.into(), Position::NONE).into())
    });

    let queue = pending.clone();
    engine.register_fn("call_in", move |obj: ObjRef, name: &str, seconds: f64| {
        queue
            .borrow_mut()
            .push(ScheduleRequest { delay_secs: seconds, obj, name: name.to_string() });
    });
    let queue = pending;
    engine.register_fn("call_in", move |obj: ObjRef, name: &str, seconds: rhai::INT| {
        queue
            .borrow_mut()
            .push(ScheduleRequest { delay_secs: seconds as f64, obj, name: name.to_string() });
    });

    engine.register_fn("log", |message: &str| {
        info!(target: "script", "{message}");
    });
}
