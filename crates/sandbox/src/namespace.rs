//! The global namespace a script runs in.
//!
//! [`NamespaceBuilder`] collects bindings while the session is being set up.
//! [`NamespaceBuilder::freeze`] turns them into a [`Namespace`]: an empty
//! environment table whose locked metatable reads through to the host
//! bindings and refuses to overwrite any of them. Scripts can still create
//! their own globals; they cannot replace or erase what the host installed.
//!
//! Nothing from the VM's real globals reaches a script unless it is on
//! [`BASE_ALLOW_LIST`] or is one of the library tables picked for the mode,
//! and those are exposed as read-only proxies over private copies.

use mlua::{ChunkMode, Function, Lua, Table, Value};

use crate::error::SandboxError;
use crate::interrupt::is_interrupt;
use crate::registry::Mode;

/// Base functions a script may use. `load`, `loadfile`, `dofile`,
/// `require`, `collectgarbage` and `print` are deliberately absent.
pub const BASE_ALLOW_LIST: &[&str] = &[
    "assert",
    "error",
    "getmetatable",
    "ipairs",
    "next",
    "pairs",
    "pcall",
    "rawequal",
    "rawget",
    "rawlen",
    "select",
    "setmetatable",
    "tonumber",
    "tostring",
    "type",
    "xpcall",
    "_VERSION",
];

/// Libraries every session gets.
pub const RESTRICTED_LIBRARIES: &[&str] = &["string", "table", "math", "utf8"];

/// Libraries added in privileged mode.
pub const PRIVILEGED_LIBRARIES: &[&str] = &["coroutine", "os"];

/// The part of `os` privileged sessions see.
const OS_ALLOW_LIST: &[&str] = &["clock", "date", "difftime", "time"];

/// Library members never exposed.
const STRIPPED: &[(&str, &str)] = &[("string", "dump")];

/// Trusted helpers, run once per VM against the real globals. Returns the
/// proxy factory, the environment factory, the guarded `rawset`, and the
/// interrupt-preserving `pcall`, `xpcall` and `coroutine.resume`.
const PRELUDE: &str = r#"
local is_interrupt = ...
local next, error, rawget, rawset, setmetatable, tostring =
    next, error, rawget, rawset, setmetatable, tostring
local pcall, xpcall = pcall, xpcall
local resume = coroutine and coroutine.resume

local frozen = setmetatable({}, { __mode = "k" })
local hosts = setmetatable({}, { __mode = "k" })

local function read_only(inner, name)
    local proxy = {}
    setmetatable(proxy, {
        __index = inner,
        __newindex = function()
            error("attempt to modify read-only table '" .. name .. "'", 2)
        end,
        __pairs = function()
            return function(_, k) return next(inner, k) end, proxy, nil
        end,
        __len = function() return #inner end,
        __metatable = false,
    })
    frozen[proxy] = true
    return proxy
end

local function environment(host)
    local env = {}
    setmetatable(env, {
        __index = host,
        __newindex = function(t, k, v)
            if rawget(host, k) ~= nil then
                error("cannot assign to protected global '" .. tostring(k) .. "'", 2)
            end
            rawset(t, k, v)
        end,
        __metatable = false,
    })
    hosts[env] = host
    return env
end

local function guarded_rawset(t, k, v)
    if frozen[t] then
        error("attempt to modify read-only table", 2)
    end
    local host = hosts[t]
    if host ~= nil and rawget(host, k) ~= nil then
        error("cannot assign to protected global '" .. tostring(k) .. "'", 2)
    end
    return rawset(t, k, v)
end

local function pass(ok, ...)
    if not ok and is_interrupt((...)) then
        error((...), 0)
    end
    return ok, ...
end

local function safe_pcall(f, ...)
    return pass(pcall(f, ...))
end

local function safe_xpcall(f, handler, ...)
    return pass(xpcall(f, function(e)
        if is_interrupt(e) then return e end
        return handler(e)
    end, ...))
end

local safe_resume = resume and function(co, ...)
    return pass(resume(co, ...))
end

return {
    read_only = read_only,
    environment = environment,
    rawset = guarded_rawset,
    pcall = safe_pcall,
    xpcall = safe_xpcall,
    resume = safe_resume,
}
"#;

/// Libraries installed for `mode`, in install order.
pub fn libraries(mode: Mode) -> Vec<&'static str> {
    let mut libs = RESTRICTED_LIBRARIES.to_vec();
    if mode == Mode::Privileged {
        libs.extend_from_slice(PRIVILEGED_LIBRARIES);
    }
    libs
}

/// Mutable collection of bindings, before the namespace is sealed.
pub struct NamespaceBuilder {
    mode: Mode,
    bindings: Vec<(String, Value)>,
}

impl NamespaceBuilder {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            bindings: Vec::new(),
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn bind(&mut self, name: impl Into<String>, value: Value) -> Result<(), SandboxError> {
        let name = name.into();
        if self.contains(&name) || is_reserved(&name, self.mode) {
            return Err(SandboxError::DuplicateBinding(name));
        }
        self.bindings.push((name, value));
        Ok(())
    }

    /// Bind every function of a pool under its own name.
    pub fn bind_functions<'a>(
        &mut self,
        functions: impl IntoIterator<Item = (&'a str, &'a Function)>,
    ) -> Result<(), SandboxError> {
        for (name, f) in functions {
            self.bind(name, Value::Function(f.clone()))?;
        }
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.bindings.iter().any(|(n, _)| n == name)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Seal the namespace. Consumes the builder: nothing can be bound after.
    pub fn freeze(self, lua: &Lua) -> Result<Namespace, SandboxError> {
        let probe = lua.create_function(|_, value: Value| {
            Ok(match value {
                Value::Error(err) => is_interrupt(&err),
                _ => false,
            })
        })?;
        let helpers: Table = lua
            .load(PRELUDE)
            .set_name("=sandbox")
            .set_mode(ChunkMode::Text)
            .call(probe)?;
        let read_only: Function = helpers.get("read_only")?;
        let environment: Function = helpers.get("environment")?;

        let globals = lua.globals();
        let host = lua.create_table()?;

        for name in BASE_ALLOW_LIST {
            let value: Value = globals.get(*name)?;
            if !value.is_nil() {
                host.raw_set(*name, value)?;
            }
        }
        host.raw_set("pcall", helpers.get::<Function>("pcall")?)?;
        host.raw_set("xpcall", helpers.get::<Function>("xpcall")?)?;
        host.raw_set("rawset", helpers.get::<Function>("rawset")?)?;

        for lib in libraries(self.mode) {
            let Value::Table(real) = globals.get::<Value>(lib)? else {
                continue;
            };
            let copy = copy_library(lua, lib, real)?;
            if lib == "coroutine" {
                if let Value::Function(resume) = helpers.get::<Value>("resume")? {
                    copy.raw_set("resume", resume)?;
                }
            }
            let proxy: Table = read_only.call((copy, lib))?;
            if lib == "string" {
                redirect_string_methods(lua, &proxy)?;
            }
            host.raw_set(lib, proxy)?;
        }

        let mut names = Vec::with_capacity(self.bindings.len());
        for (name, value) in self.bindings {
            host.raw_set(name.as_str(), value)?;
            names.push(name);
        }

        let env: Table = environment.call(host.clone())?;
        host.raw_set("_G", env.clone())?;

        Ok(Namespace { env, host, names })
    }
}

fn is_reserved(name: &str, mode: Mode) -> bool {
    name == "_G"
        || name == "rawset"
        || BASE_ALLOW_LIST.contains(&name)
        || libraries(mode).contains(&name)
}

fn copy_library(lua: &Lua, lib: &str, real: Table) -> mlua::Result<Table> {
    let copy = lua.create_table()?;
    for pair in real.pairs::<Value, Value>() {
        let (key, value) = pair?;
        if let Value::String(s) = &key {
            let key_str = s.to_str()?;
            if STRIPPED.iter().any(|(l, m)| *l == lib && *m == &*key_str) {
                continue;
            }
            if lib == "os" && !OS_ALLOW_LIST.contains(&&*key_str) {
                continue;
            }
        }
        copy.raw_set(key, value)?;
    }
    Ok(copy)
}

/// Method calls on strings (`s:upper()`) go through the string metatable;
/// point it at the proxy so the real library stays unreachable.
fn redirect_string_methods(lua: &Lua, proxy: &Table) -> mlua::Result<()> {
    let mt: Option<Table> = lua
        .load("return getmetatable('')")
        .set_mode(ChunkMode::Text)
        .eval()?;
    if let Some(mt) = mt {
        mt.raw_set("__index", proxy.clone())?;
        mt.raw_set("__metatable", false)?;
    }
    Ok(())
}

/// A sealed namespace: the environment every chunk of the session runs in.
pub struct Namespace {
    env: Table,
    host: Table,
    names: Vec<String>,
}

impl Namespace {
    /// Table to use as the chunk environment.
    pub fn env(&self) -> &Table {
        &self.env
    }

    /// Names bound by the host beyond the base functions and libraries.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn is_host_bound(&self, name: &str) -> mlua::Result<bool> {
        Ok(!self.host.raw_get::<Value>(name)?.is_nil())
    }

    /// Global `name` as the script currently sees it, if it is callable.
    pub fn entry_point(&self, name: &str) -> mlua::Result<Option<Function>> {
        match self.env.get::<Value>(name)? {
            Value::Function(f) => Ok(Some(f)),
            _ => Ok(None),
        }
    }
}
