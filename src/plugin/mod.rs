//! Staged plugin pipeline.
//!
//! Five fixed lifecycle stages fire during a connection's life; each holds
//! an ordered callback list populated at load time. Compiled-in plugins
//! register before config-listed ones, and config-listed plugins load in
//! listed order. A callback returning [`StageStatus::NotMe`] lets the scan
//! continue; anything else claims the connection and stops the scan, and
//! the plugin's disposition is handed back to the scheduler.
//!
//! Loadable plugins are not shared libraries here: the loader resolves a
//! provider name derived from the configured identifier against a
//! compiled-in provider table, validates the returned descriptor, and
//! rejects it (without aborting startup or other plugins) when a required
//! field is missing. The registry is frozen once built and shared by
//! reference across workers.

pub mod api;
pub mod builtin;

pub use api::PluginApi;

use crate::http::header::ResponseHeaders;
use crate::http::request::Request;
use bytes::Bytes;
use std::fmt;
use tracing::{debug, warn};

/// The five fixed lifecycle hook points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// A connection was just accepted.
    Accepted = 10,
    /// The request head was parsed; routing decision point.
    RequestParsed = 20,
    /// Content/handler dispatch.
    Content = 30,
    /// Response finalize, before the header block is queued.
    Finalize = 40,
    /// Connection cleanup.
    Cleanup = 50,
}

impl Stage {
    const ALL: [Stage; 5] = [
        Stage::Accepted,
        Stage::RequestParsed,
        Stage::Content,
        Stage::Finalize,
        Stage::Cleanup,
    ];

    fn index(self) -> usize {
        match self {
            Stage::Accepted => 0,
            Stage::RequestParsed => 1,
            Stage::Content => 2,
            Stage::Finalize => 3,
            Stage::Cleanup => 4,
        }
    }
}

/// Return value of a stage callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    /// Not handled; the scan continues with the next plugin.
    NotMe,
    /// Claimed; proceed with normal flow.
    Continue,
    /// Claimed; end the connection.
    End,
    /// Claimed; park the connection, the plugin resumes it later.
    Defer,
}

/// Capability bitmask declared by a plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities(u8);

impl Capabilities {
    pub const NONE: Capabilities = Capabilities(0);
    /// The plugin hooks connection lifecycle stages.
    pub const STAGE: Capabilities = Capabilities(0x01);
    /// The plugin provides a transport layer.
    pub const NETWORK: Capabilities = Capabilities(0x02);

    pub fn contains(self, other: Capabilities) -> bool {
        self.0 & other.0 == other.0
    }
}

/// How a plugin entered the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadKind {
    /// Compiled into the server.
    Static,
    /// Selected through the load configuration.
    Dynamic,
}

/// Mutable per-dispatch state a stage callback may inspect and shape.
pub struct StageContext<'a> {
    pub api: &'a PluginApi,
    /// Absent for stages 10 and 50, which run outside a request.
    pub request: Option<&'a Request>,
    pub headers: &'a mut ResponseHeaders,
    pub body: &'a mut Option<Bytes>,
}

/// A stage callback.
pub type StageHandler = fn(&mut StageContext) -> StageStatus;

/// Plugin descriptor: identity, lifecycle callbacks and stage hooks.
///
/// Identity fields and both lifecycle callbacks are mandatory; a
/// descriptor failing validation is rejected at load time.
pub struct PluginSpec {
    pub shortname: &'static str,
    pub name: &'static str,
    pub version: &'static str,
    pub capabilities: Capabilities,
    pub init: Option<fn(&PluginApi) -> i32>,
    pub exit: Option<fn()>,
    pub stage10: Option<StageHandler>,
    pub stage20: Option<StageHandler>,
    pub stage30: Option<StageHandler>,
    pub stage40: Option<StageHandler>,
    pub stage50: Option<StageHandler>,
}

impl PluginSpec {
    /// An empty descriptor to splat defaults from.
    pub const fn empty() -> PluginSpec {
        PluginSpec {
            shortname: "",
            name: "",
            version: "",
            capabilities: Capabilities::NONE,
            init: None,
            exit: None,
            stage10: None,
            stage20: None,
            stage30: None,
            stage40: None,
            stage50: None,
        }
    }

    fn stage_handler(&self, stage: Stage) -> Option<StageHandler> {
        match stage {
            Stage::Accepted => self.stage10,
            Stage::RequestParsed => self.stage20,
            Stage::Content => self.stage30,
            Stage::Finalize => self.stage40,
            Stage::Cleanup => self.stage50,
        }
    }
}

/// Why a plugin failed to load.
#[derive(Debug, PartialEq, Eq)]
pub enum PluginLoadError {
    /// No provider matches the derived name.
    ProviderNotFound(String),
    /// A mandatory descriptor field is unset.
    MissingField(&'static str),
    /// Declared STAGE capability without any stage handler.
    NoStageHandlers,
    /// The init callback reported failure.
    InitFailed(i32),
}

impl fmt::Display for PluginLoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginLoadError::ProviderNotFound(name) => {
                write!(f, "no plugin provider named '{name}'")
            }
            PluginLoadError::MissingField(field) => {
                write!(f, "descriptor field '{field}' is not set")
            }
            PluginLoadError::NoStageHandlers => {
                write!(f, "STAGE capability declared without stage handlers")
            }
            PluginLoadError::InitFailed(code) => write!(f, "init returned {code}"),
        }
    }
}

impl std::error::Error for PluginLoadError {}

/// A named descriptor constructor, the unit of "dynamic" loading.
pub type PluginCtor = fn() -> PluginSpec;

/// Providers selectable through the `[plugins] load` configuration.
///
/// A configured identifier `x` resolves to the provider named `plugin_x`.
pub fn providers() -> &'static [(&'static str, PluginCtor)] {
    &[("plugin_trace", builtin::trace_plugin)]
}

struct RegisteredPlugin {
    spec: PluginSpec,
    load_kind: LoadKind,
}

/// The frozen plugin registry: per-stage ordered callback lists.
pub struct PluginRegistry {
    plugins: Vec<RegisteredPlugin>,
    stages: [Vec<(usize, StageHandler)>; 5],
}

impl PluginRegistry {
    /// Build the registry: compiled-in plugins first, then the configured
    /// load list resolved against `providers`, in listed order. Rejected
    /// plugins are skipped with a warning; the rest proceed.
    pub fn load(
        providers: &[(&str, PluginCtor)],
        load_list: &[String],
        api: &PluginApi,
    ) -> PluginRegistry {
        let mut registry = PluginRegistry {
            plugins: Vec::new(),
            stages: Default::default(),
        };

        for ctor in builtin::static_plugins() {
            registry.register(ctor(), LoadKind::Static, api);
        }

        for ident in load_list {
            let symbol = format!("plugin_{ident}");
            let Some((_, ctor)) = providers.iter().find(|(name, _)| *name == symbol) else {
                warn!(
                    plugin = ident.as_str(),
                    "{}",
                    PluginLoadError::ProviderNotFound(symbol)
                );
                continue;
            };
            registry.register(ctor(), LoadKind::Dynamic, api);
        }

        registry
    }

    fn register(&mut self, spec: PluginSpec, load_kind: LoadKind, api: &PluginApi) -> bool {
        if let Err(e) = validate(&spec) {
            warn!(plugin = spec.shortname, error = %e, "plugin rejected");
            return false;
        }
        if let Some(init) = spec.init {
            let ret = init(api);
            if ret < 0 {
                warn!(plugin = spec.shortname, error = %PluginLoadError::InitFailed(ret), "plugin rejected");
                return false;
            }
        }

        debug!(
            plugin = spec.shortname,
            version = spec.version,
            kind = ?load_kind,
            "plugin registered"
        );
        let idx = self.plugins.len();
        for stage in Stage::ALL {
            if let Some(handler) = spec.stage_handler(stage) {
                self.stages[stage.index()].push((idx, handler));
            }
        }
        self.plugins.push(RegisteredPlugin { spec, load_kind });
        true
    }

    /// Run one stage: callbacks in registration order until a plugin
    /// claims the connection. Returns `NotMe` when no plugin did.
    pub fn run_stage(&self, stage: Stage, ctx: &mut StageContext) -> StageStatus {
        for &(idx, handler) in &self.stages[stage.index()] {
            let status = handler(ctx);
            if status != StageStatus::NotMe {
                debug!(
                    stage = stage as u32,
                    plugin = self.plugins[idx].spec.shortname,
                    status = ?status,
                    "stage claimed"
                );
                return status;
            }
        }
        StageStatus::NotMe
    }

    /// Invoke every plugin's exit hook, in registration order. Called
    /// after all event loops have stopped; no request is in flight.
    pub fn exit_all(&self) {
        for plugin in &self.plugins {
            if let Some(exit) = plugin.spec.exit {
                exit();
            }
        }
    }

    /// Whether a plugin with this shortname is active.
    pub fn is_active(&self, shortname: &str) -> bool {
        self.plugins.iter().any(|p| p.spec.shortname == shortname)
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn load_kind(&self, shortname: &str) -> Option<LoadKind> {
        self.plugins
            .iter()
            .find(|p| p.spec.shortname == shortname)
            .map(|p| p.load_kind)
    }
}

fn validate(spec: &PluginSpec) -> Result<(), PluginLoadError> {
    if spec.shortname.is_empty() {
        return Err(PluginLoadError::MissingField("shortname"));
    }
    if spec.name.is_empty() {
        return Err(PluginLoadError::MissingField("name"));
    }
    if spec.version.is_empty() {
        return Err(PluginLoadError::MissingField("version"));
    }
    if spec.init.is_none() {
        return Err(PluginLoadError::MissingField("init"));
    }
    if spec.exit.is_none() {
        return Err(PluginLoadError::MissingField("exit"));
    }
    let has_stage = Stage::ALL.iter().any(|&s| spec.stage_handler(s).is_some());
    if spec.capabilities.contains(Capabilities::STAGE) && !has_stage {
        return Err(PluginLoadError::NoStageHandlers);
    }
    Ok(())
}

/// Build a scratch context for stages that run outside a request
/// (10 and 50).
pub fn scratch_context<'a>(
    api: &'a PluginApi,
    headers: &'a mut ResponseHeaders,
    body: &'a mut Option<Bytes>,
) -> StageContext<'a> {
    StageContext {
        api,
        request: None,
        headers,
        body,
    }
}
