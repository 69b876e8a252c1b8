//! Script execution with an explicit capability table.
//!
//! Pattern source is evaluated by an embedded `rhai` engine that starts with
//! no functions at all. Only the language core, arithmetic, strings and
//! arrays are added, followed by the runtime's [`Exports`]. `eval` and module
//! imports are switched off and every run is bounded by [`SandboxConfig`].
//!
//! Strings are double-quoted. A single-quoted `'c3'` is a character literal
//! and only compiles when it holds exactly one character.

use std::sync::Arc;

use rhai::{
    module_resolvers::DummyModuleResolver,
    packages::{BasicArrayPackage, BasicMathPackage, BasicStringPackage, CorePackage, Package},
    Dynamic, Engine, Scope,
};
use tracing::{debug, info};

use crate::{config::SandboxConfig, engine::Exports, GardenLiveError, Result};

const SCRIPT_TARGET: &str = "garden_live::script";

#[derive(Clone)]
pub struct Sandbox {
    engine: Arc<Engine>,
    constants: Arc<Vec<(String, Dynamic)>>,
    symbols: Arc<Vec<String>>,
}

impl Sandbox {
    pub fn new(exports: &Exports, config: &SandboxConfig) -> Self {
        let mut engine = Engine::new_raw();

        engine
            .register_global_module(CorePackage::new().as_shared_module())
            .register_global_module(BasicMathPackage::new().as_shared_module())
            .register_global_module(BasicStringPackage::new().as_shared_module())
            .register_global_module(BasicArrayPackage::new().as_shared_module());

        engine
            .set_max_operations(config.max_operations)
            .set_max_call_levels(config.max_call_levels)
            .set_max_expr_depths(config.max_expr_depth, config.max_expr_depth)
            .set_max_string_size(config.max_string_size)
            .set_max_array_size(config.max_array_size)
            .set_module_resolver(DummyModuleResolver::new());
        engine.disable_symbol("eval");

        engine.on_print(|text| info!(target: SCRIPT_TARGET, "{text}"));
        engine.on_debug(|text, source, pos| {
            debug!(target: SCRIPT_TARGET, source, position = %pos, "{text}")
        });

        exports.install(&mut engine);

        Self {
            engine: Arc::new(engine),
            constants: Arc::new(exports.values().to_vec()),
            symbols: Arc::new(exports.names().into_iter().map(String::from).collect()),
        }
    }

    /// Names reachable from pattern code, besides the language core.
    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    /// Compiles and runs `source` unmodified on the calling thread.
    pub fn run(&self, source: &str) -> Result<()> {
        let mut scope = Scope::new();
        for (name, value) in self.constants.iter() {
            scope.push_constant_dynamic(name.as_str(), value.clone());
        }

        self.engine
            .run_with_scope(&mut scope, source)
            .map_err(|err| GardenLiveError::Runtime(err.to_string()))
    }

    /// Runs `source` on the blocking pool and waits for it to finish.
    pub async fn execute(&self, source: String) -> Result<()> {
        let sandbox = self.clone();
        tokio::task::spawn_blocking(move || sandbox.run(&source))
            .await
            .map_err(|err| GardenLiveError::Runtime(format!("pattern task failed: {err}")))?
    }
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("symbols", &self.symbols)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    fn counting_exports(counter: Arc<AtomicUsize>) -> Exports {
        Exports::new()
            .function("tick", move |engine| {
                let counter = counter.clone();
                engine.register_fn("tick", move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
            })
            .value("answer", Dynamic::from(42_i64))
    }

    fn sandbox() -> (Sandbox, Arc<AtomicUsize>) {
        let counter = Arc::new(AtomicUsize::new(0));
        let sandbox = Sandbox::new(&counting_exports(counter.clone()), &SandboxConfig::default());
        (sandbox, counter)
    }

    #[test]
    fn exported_functions_and_values_are_in_scope() {
        let (sandbox, counter) = sandbox();
        sandbox
            .run("for i in 0..answer / 21 { tick(); } let x = sin(0.0);")
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(sandbox.symbols(), &["tick".to_string(), "answer".to_string()]);
    }

    #[test]
    fn unexported_functions_are_unreachable() {
        let (sandbox, _) = sandbox();
        let err = sandbox.run("fetch(\"http://example.com\");").unwrap_err();
        assert!(matches!(err, GardenLiveError::Runtime(_)));
    }

    #[test]
    fn eval_and_imports_are_disabled() {
        let (sandbox, _) = sandbox();
        assert!(sandbox.run("eval(\"tick()\");").is_err());
        assert!(sandbox.run("import \"net\" as net;").is_err());
    }

    #[test]
    fn runaway_loops_hit_the_operation_limit() {
        let (sandbox, _) = sandbox();
        let err = sandbox.run("loop { }").unwrap_err();
        assert!(err.to_string().to_lowercase().contains("operations"));
    }

    #[test]
    fn constants_cannot_be_reassigned() {
        let (sandbox, _) = sandbox();
        assert!(sandbox.run("answer = 1;").is_err());
    }

    #[test]
    fn strings_need_double_quotes() {
        let (sandbox, _) = sandbox();
        assert!(sandbox.run(r#"let note = "c3 e3";"#).is_ok());
        let err = sandbox.run("let note = 'c3';").unwrap_err();
        assert!(matches!(err, GardenLiveError::Runtime(_)));
    }

    #[tokio::test]
    async fn executes_off_the_async_thread() {
        let (sandbox, counter) = sandbox();
        sandbox.execute("tick(); tick(); tick();".into()).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }
}
