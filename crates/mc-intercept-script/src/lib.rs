//! Sandboxed Lua filter predicates over packets (mlua, Lua 5.4).
//!
//! A filter is a named chunk compiled once and run per packet with two read-only arguments,
//! `packet` and `player`. The chunk is either an expression (`packet.integers[1] > 5`) or a
//! statement block that returns a value. Results are interpreted leniently: booleans as-is,
//! numbers as non-zero, anything else as "allow".

mod binding;
mod limits;

pub use binding::ScriptPlayer;
pub use limits::ScriptLimits;

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use mc_intercept_proto::PacketContainer;
use mlua::prelude::*;
use mlua::{HookTriggers, VmState};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Instructions between two budget checks.
const HOOK_INTERVAL: u32 = 1000;

const PRELUDE: &str = "local packet, player = ...; ";

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("failed to compile filter '{name}': {message}")]
    Compile { name: String, message: String },

    #[error("filter '{name}' failed: {message}")]
    Runtime { name: String, message: String },

    #[error("no filter named '{0}'")]
    UnknownFilter(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Lua setup error: {0}")]
    Setup(String),
}

/// Called for every failure swallowed by [`ScriptEngine::execute`].
pub type ErrorHook = Arc<dyn Fn(&str, &ScriptError) + Send + Sync>;

/// Name of the filter currently running, for console output.
struct CurrentFilter(String);

struct ScriptState {
    lua: Lua,
    filters: HashMap<String, LuaFunction>,
}

// ─── ScriptEngine ────────────────────────────────────────────────────────────

/// Compiles and runs named filters. One VM, runs are serialized.
pub struct ScriptEngine {
    state: Mutex<ScriptState>,
    budget_used: Arc<AtomicU32>,
    error_hook: RwLock<Option<ErrorHook>>,
}

impl ScriptEngine {
    pub fn new(limits: &ScriptLimits) -> Result<Self, ScriptError> {
        let lua = Lua::new();
        setup_sandbox(&lua, limits.memory_mb).map_err(|e| ScriptError::Setup(e.to_string()))?;
        setup_console(&lua).map_err(|e| ScriptError::Setup(e.to_string()))?;

        let budget_used = Arc::new(AtomicU32::new(0));
        let max_checks = (limits.instruction_limit / HOOK_INTERVAL).max(1);
        let counter = budget_used.clone();
        lua.set_hook(
            HookTriggers::new().every_nth_instruction(HOOK_INTERVAL),
            move |_lua, _debug| {
                if counter.fetch_add(1, Ordering::Relaxed) + 1 >= max_checks {
                    Err(LuaError::RuntimeError(
                        "instruction budget exhausted".to_string(),
                    ))
                } else {
                    Ok(VmState::Continue)
                }
            },
        );

        Ok(Self {
            state: Mutex::new(ScriptState {
                lua,
                filters: HashMap::new(),
            }),
            budget_used,
            error_hook: RwLock::new(None),
        })
    }

    /// Compile `source` under `name`, replacing any previous filter with that name.
    pub fn compile(&self, name: &str, source: &str) -> Result<(), ScriptError> {
        let mut state = self.lock()?;
        let function = {
            let lua = &state.lua;
            let as_expression = format!("{PRELUDE}return {source}");
            match lua.load(as_expression.as_str()).set_name(name).into_function() {
                Ok(f) => f,
                Err(_) => lua
                    .load(format!("{PRELUDE}{source}"))
                    .set_name(name)
                    .into_function()
                    .map_err(|e| ScriptError::Compile {
                        name: name.to_string(),
                        message: e.to_string(),
                    })?,
            }
        };
        if state.filters.insert(name.to_string(), function).is_some() {
            debug!("Recompiled filter '{name}'");
        } else {
            debug!("Compiled filter '{name}'");
        }
        Ok(())
    }

    /// Drop a filter. Returns whether it existed.
    pub fn remove(&self, name: &str) -> bool {
        self.lock()
            .map(|mut s| s.filters.remove(name).is_some())
            .unwrap_or(false)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock()
            .map(|s| s.filters.contains_key(name))
            .unwrap_or(false)
    }

    /// Compiled filter names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .lock()
            .map(|s| s.filters.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn set_error_hook(&self, hook: ErrorHook) {
        if let Ok(mut slot) = self.error_hook.write() {
            *slot = Some(hook);
        }
    }

    /// Run a filter and report failures to the caller.
    pub fn evaluate(
        &self,
        name: &str,
        player: &ScriptPlayer,
        packet: &PacketContainer,
    ) -> Result<bool, ScriptError> {
        let state = self.lock()?;
        let function = state
            .filters
            .get(name)
            .ok_or_else(|| ScriptError::UnknownFilter(name.to_string()))?;
        let lua = &state.lua;
        let runtime = |e: LuaError| ScriptError::Runtime {
            name: name.to_string(),
            message: e.to_string(),
        };

        let packet_table = binding::packet_table(lua, packet).map_err(runtime)?;
        let player_table = binding::player_table(lua, player).map_err(runtime)?;

        self.budget_used.store(0, Ordering::Relaxed);
        lua.set_app_data(CurrentFilter(name.to_string()));
        let result = function.call::<LuaValue>((packet_table, player_table));
        lua.remove_app_data::<CurrentFilter>();

        Ok(truthy(&result.map_err(runtime)?))
    }

    /// Run a filter; any failure (including a missing filter) allows the packet.
    pub fn execute(&self, name: &str, player: &ScriptPlayer, packet: &PacketContainer) -> bool {
        match self.evaluate(name, player, packet) {
            Ok(allow) => allow,
            Err(e) => {
                warn!("{e}");
                let hook = self.error_hook.read().ok().and_then(|h| h.clone());
                if let Some(hook) = hook {
                    hook(name, &e);
                }
                true
            }
        }
    }

    /// Compile every `*.lua` file in `dir`, named by file stem. Returns how many loaded.
    pub fn load_dir(&self, dir: &Path) -> Result<usize, ScriptError> {
        let mut loaded = 0;
        for entry in std::fs::read_dir(dir)?.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("lua") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let source = match std::fs::read_to_string(&path) {
                Ok(s) => s,
                Err(e) => {
                    error!("Failed to read filter {}: {e}", path.display());
                    continue;
                }
            };
            match self.compile(name, &source) {
                Ok(()) => {
                    info!("Loaded filter '{name}' from {}", path.display());
                    loaded += 1;
                }
                Err(e) => error!("{e}"),
            }
        }
        Ok(loaded)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ScriptState>, ScriptError> {
        self.state
            .lock()
            .map_err(|_| ScriptError::Setup("script state poisoned".to_string()))
    }
}

fn truthy(value: &LuaValue) -> bool {
    match value {
        LuaValue::Boolean(b) => *b,
        LuaValue::Integer(i) => *i != 0,
        LuaValue::Number(n) => *n != 0.0,
        _ => true,
    }
}

// ─── Sandbox ─────────────────────────────────────────────────────────────────

fn setup_sandbox(lua: &Lua, memory_mb: usize) -> LuaResult<()> {
    let globals = lua.globals();
    for name in ["os", "io", "debug", "loadfile", "dofile", "load", "require", "package"] {
        globals.set(name, LuaValue::Nil)?;
    }
    lua.set_memory_limit(memory_mb * 1024 * 1024)?;
    Ok(())
}

/// `console.log(msg)`, `console.warn(msg)`, `console.error(msg)`.
fn setup_console(lua: &Lua) -> LuaResult<()> {
    fn current(lua: &Lua) -> String {
        lua.app_data_ref::<CurrentFilter>()
            .map(|f| f.0.clone())
            .unwrap_or_default()
    }

    let console = lua.create_table()?;
    console.set(
        "log",
        lua.create_function(|lua, msg: String| {
            info!("[filter {}] {msg}", current(lua));
            Ok(())
        })?,
    )?;
    console.set(
        "warn",
        lua.create_function(|lua, msg: String| {
            warn!("[filter {}] {msg}", current(lua));
            Ok(())
        })?,
    )?;
    console.set(
        "error",
        lua.create_function(|lua, msg: String| {
            error!("[filter {}] {msg}", current(lua));
            Ok(())
        })?,
    )?;
    lua.globals().set("console", console)?;
    Ok(())
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use mc_intercept_proto::{PacketType, Schema, Uuid};
    use std::sync::atomic::AtomicUsize;

    fn engine() -> ScriptEngine {
        ScriptEngine::new(&ScriptLimits::default()).unwrap()
    }

    fn player() -> ScriptPlayer {
        ScriptPlayer::new(Uuid::new(7, 7), "Alex")
    }

    fn chat(message: &str) -> PacketContainer {
        let schema = Schema::builtin().unwrap();
        let mut packet = PacketContainer::create(&schema, PacketType::PlayClientChat).unwrap();
        packet.set_message(message).unwrap();
        packet
    }

    #[test]
    fn expression_filter() {
        let engine = engine();
        engine
            .compile("no_spam", "packet.strings[1] ~= 'spam'")
            .unwrap();
        assert!(engine.execute("no_spam", &player(), &chat("hello")));
        assert!(!engine.execute("no_spam", &player(), &chat("spam")));
    }

    #[test]
    fn statement_filter() {
        let engine = engine();
        engine
            .compile(
                "block_alex",
                "if player.name == 'Alex' then return false end\nreturn true",
            )
            .unwrap();
        assert!(!engine.execute("block_alex", &player(), &chat("x")));
        let steve = ScriptPlayer::new(Uuid::new(1, 1), "Steve");
        assert!(engine.execute("block_alex", &steve, &chat("x")));
    }

    #[test]
    fn truthiness_rules() {
        let engine = engine();
        let cases = [
            ("zero", "0", false),
            ("one", "1", true),
            ("float_zero", "0.0", false),
            ("nil", "nil", true),
            ("string", "'no'", true),
            ("table", "{}", true),
            ("false", "false", false),
        ];
        for (name, source, expected) in cases {
            engine.compile(name, source).unwrap();
            assert_eq!(engine.execute(name, &player(), &chat("x")), expected, "{name}");
        }
    }

    #[test]
    fn runtime_error_fails_open() {
        let engine = engine();
        let reported = Arc::new(AtomicUsize::new(0));
        let counter = reported.clone();
        engine.set_error_hook(Arc::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        engine.compile("broken", "packet.nope.deeper == 1").unwrap();
        assert!(matches!(
            engine.evaluate("broken", &player(), &chat("x")),
            Err(ScriptError::Runtime { .. })
        ));
        assert!(engine.execute("broken", &player(), &chat("x")));
        assert!(engine.execute("missing", &player(), &chat("x")));
        assert_eq!(reported.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn compile_error_is_reported() {
        let engine = engine();
        let err = engine.compile("bad", "if then end end").unwrap_err();
        assert!(matches!(err, ScriptError::Compile { ref name, .. } if name == "bad"));
        assert!(!engine.contains("bad"));
    }

    #[test]
    fn recompile_replaces() {
        let engine = engine();
        engine.compile("f", "false").unwrap();
        engine.compile("f", "true").unwrap();
        assert!(engine.execute("f", &player(), &chat("x")));
        assert_eq!(engine.names(), vec!["f".to_string()]);
        assert!(engine.remove("f"));
        assert!(!engine.remove("f"));
        assert!(engine.names().is_empty());
    }

    #[test]
    fn sandbox_removes_dangerous_globals() {
        let engine = engine();
        engine
            .compile("sandboxed", "os == nil and io == nil and load == nil and require == nil")
            .unwrap();
        assert!(engine.evaluate("sandboxed", &player(), &chat("x")).unwrap());
    }

    #[test]
    fn instruction_budget_aborts_loops() {
        let limits = ScriptLimits {
            memory_mb: 16,
            instruction_limit: 10_000,
        };
        let engine = ScriptEngine::new(&limits).unwrap();
        engine.compile("spin", "while true do end").unwrap();
        assert!(matches!(
            engine.evaluate("spin", &player(), &chat("x")),
            Err(ScriptError::Runtime { .. })
        ));
        // The budget resets per run.
        engine.compile("ok", "packet.type == 'PLAY_CLIENT_CHAT'").unwrap();
        assert!(engine.evaluate("ok", &player(), &chat("x")).unwrap());
    }

    #[test]
    fn console_is_available() {
        let engine = engine();
        engine
            .compile("chatty", "console.log('seen ' .. packet.type)\nreturn true")
            .unwrap();
        assert!(engine.evaluate("chatty", &player(), &chat("x")).unwrap());
    }

    #[test]
    fn load_dir_compiles_lua_files() {
        let dir = std::env::temp_dir().join(format!("mc-intercept-filters-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("allow_all.lua"), "true").unwrap();
        std::fs::write(dir.join("broken.lua"), "if if").unwrap();
        std::fs::write(dir.join("notes.txt"), "ignored").unwrap();

        let engine = engine();
        assert_eq!(engine.load_dir(&dir).unwrap(), 1);
        assert_eq!(engine.names(), vec!["allow_all".to_string()]);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
