use crate::backup::command::CommandRunner;
use crate::backup::config::ConfigMap;
use crate::backup::function_path;
use crate::backup::plugin::schema::{describe, HandlerConfig, HandlerSchema};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{AddFunctionName, AddMsg};
use function_name::named;
use getset::{CopyGetters, Getters};
use itertools::Itertools;
use std::collections::{BTreeMap, HashMap};
use std::fmt::{Debug, Formatter};

/// A named operation of a handler, selected by the method registration.
pub struct EntryPoint<H> {
    pub name: &'static str,
    pub run: fn(&mut H, &CommandRunner) -> Result<()>,
}

/// A backup handler type: option schema, constructor and entry points.
///
/// A new handler instance is built for every job invocation.
pub trait BackupHandler: Sized + 'static {
    const SCHEMA: &'static HandlerSchema;
    const ENTRY_POINTS: &'static [EntryPoint<Self>];

    fn from_config(conf: HandlerConfig) -> Result<Self>;
}

/// Type-erased handle on a [`BackupHandler`] implementation.
#[derive(Clone, Copy)]
pub struct HandlerType {
    type_name: &'static str,
    schema: &'static HandlerSchema,
    has_entry_point: fn(&str) -> bool,
    invoke: fn(&ConfigMap, &ConfigMap, &str, &CommandRunner) -> Result<()>,
}

impl Debug for HandlerType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.type_name)
    }
}

impl HandlerType {
    pub fn of<H: BackupHandler>() -> Self {
        Self {
            type_name: std::any::type_name::<H>(),
            schema: H::SCHEMA,
            has_entry_point: has_entry_point::<H>,
            invoke: invoke_handler::<H>,
        }
    }

    pub fn schema(&self) -> &'static HandlerSchema {
        self.schema
    }

    pub fn has_entry_point(&self, name: &str) -> bool {
        (self.has_entry_point)(name)
    }
}

fn has_entry_point<H: BackupHandler>(name: &str) -> bool {
    H::ENTRY_POINTS.iter().any(|e| e.name == name)
}

fn invoke_handler<H: BackupHandler>(
    global: &ConfigMap,
    job: &ConfigMap,
    entry_point: &str,
    runner: &CommandRunner,
) -> Result<()> {
    let conf = HandlerConfig::build(H::SCHEMA, global, job)?;
    tracing::trace!("Handler configuration: {:?}", conf);
    let mut handler = H::from_config(conf)?;
    let entry = H::ENTRY_POINTS
        .iter()
        .find(|e| e.name == entry_point)
        .ok_or_else(|| {
            Error::bad_plugin(format!(
                "Entry point {entry_point} not found in {}.",
                std::any::type_name::<H>()
            ))
        })?;
    (entry.run)(&mut handler, runner)
}

/// A method offered by a plugin module.
#[derive(Clone, Copy, Debug)]
pub struct MethodDecl {
    pub method: &'static str,
    pub handler: HandlerType,
    pub entry_point: &'static str,
}

/// A named unit of methods, loaded as a whole.
pub trait PluginModule {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn methods(&self) -> Vec<MethodDecl>;
}

#[derive(Clone, Debug, Getters, CopyGetters)]
pub struct Registration {
    #[getset(get_copy = "pub")]
    handler: HandlerType,
    #[getset(get_copy = "pub")]
    entry_point: &'static str,
    #[getset(get = "pub")]
    plugin: Option<String>,
}

#[derive(Clone, Debug, Getters)]
#[getset(get = "pub")]
pub struct PluginInfo {
    description: String,
}

/// Method name to handler registrations plus the loaded plugin modules.
#[derive(Debug, Default)]
pub struct PluginRegistry {
    methods: HashMap<String, Registration>,
    plugins: BTreeMap<String, PluginInfo>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `method`; a later registration of the same name wins.
    pub fn register(
        &mut self,
        method: &str,
        handler: HandlerType,
        entry_point: &'static str,
    ) -> Result<()> {
        self.register_for(method, handler, entry_point, None)
    }

    fn register_for(
        &mut self,
        method: &str,
        handler: HandlerType,
        entry_point: &'static str,
        plugin: Option<&str>,
    ) -> Result<()> {
        if method.trim().is_empty() {
            return Err(Error::bad_plugin("Backup method name must not be empty."));
        }
        if !handler.has_entry_point(entry_point) {
            return Err(Error::bad_plugin(format!(
                "Entry point {entry_point} for backup method {method} not found in {:?}.",
                handler
            )));
        }
        let registration = Registration {
            handler,
            entry_point,
            plugin: plugin.map(str::to_owned),
        };
        if let Some(previous) = self.methods.insert(method.to_owned(), registration) {
            tracing::warn!(
                "Backup method {method} registered again, replacing {:?}::{}",
                previous.handler,
                previous.entry_point
            );
        }
        tracing::debug!("Registered backup method {method}");
        Ok(())
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    pub fn registration(&self, method: &str) -> Option<&Registration> {
        self.methods.get(method)
    }

    /// Builds a handler for `method` from the effective configuration and runs its entry point.
    pub fn invoke(
        &self,
        method: &str,
        global: &ConfigMap,
        job: &ConfigMap,
        runner: &CommandRunner,
    ) -> Result<()> {
        let registration = self
            .methods
            .get(method)
            .ok_or_else(|| Error::config(format!("Backup method {method} not registered.")))?;
        tracing::debug!(
            "Invoking {:?}::{} for backup method {method}",
            registration.handler,
            registration.entry_point
        );
        (registration.handler.invoke)(global, job, registration.entry_point, runner)
    }

    pub fn describe_method(&self, method: &str) -> Option<String> {
        let registration = self.methods.get(method)?;
        let (plugin, description) = match &registration.plugin {
            Some(name) => (
                name.as_str(),
                self.plugins
                    .get(name)
                    .map(|p| p.description.as_str())
                    .unwrap_or_default(),
            ),
            None => ("-", ""),
        };
        Some(describe(method, plugin, description, registration.handler.schema()))
    }

    pub fn list_plugins(&self) -> Vec<(&str, &str)> {
        self.plugins
            .iter()
            .map(|(name, info)| (name.as_str(), info.description.as_str()))
            .collect()
    }

    pub fn list_methods(&self, plugin: Option<&str>) -> Vec<&str> {
        self.methods
            .iter()
            .filter(|(_, r)| plugin.is_none() || r.plugin.as_deref() == plugin)
            .map(|(m, _)| m.as_str())
            .sorted()
            .collect()
    }

    /// Registers all methods of `module` under its plugin name.
    #[named]
    pub fn load_plugin(&mut self, module: &dyn PluginModule) -> Result<()> {
        let name = module.name();
        let methods = module.methods();
        if methods.is_empty() {
            return Err(Error::bad_plugin(format!(
                "Plugin {name} does not provide any backup method."
            )));
        }
        for decl in &methods {
            self.register_for(decl.method, decl.handler, decl.entry_point, Some(name))
                .add_msg(format!("Loading plugin {name} failed"))
                .add_fn_name(function_path!())?;
        }
        self.plugins.insert(
            name.to_owned(),
            PluginInfo {
                description: module.description().to_owned(),
            },
        );
        tracing::debug!("Loaded plugin {name}: {}", methods.iter().map(|d| d.method).join(", "));
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::backup::plugin::schema::OptionDecl;
    use crate::backup::result_error::error::ErrorKind;
    use std::cell::RefCell;

    thread_local! {
        pub(crate) static CALLS: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
    }

    pub(crate) fn calls() -> Vec<String> {
        CALLS.with(|c| c.borrow().clone())
    }

    pub(crate) fn global() -> ConfigMap {
        [("cmd_compress", "gzip"), ("suffix_compress", "gz")]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    /// Records its invocations and fails on demand through `fail_with`.
    pub(crate) struct SpyHandler {
        conf: HandlerConfig,
    }

    impl SpyHandler {
        fn record(&mut self, tag: &str) -> Result<()> {
            let job = self.conf.get("job_name").unwrap_or("-").to_owned();
            CALLS.with(|c| c.borrow_mut().push(format!("{tag}:{job}")));
            match self.conf.get("fail_with") {
                None => Ok(()),
                Some("config") => Err(Error::config("spy config failure")),
                Some("fatal_config") => Err(Error::fatal_config("spy fatal failure")),
                Some("environment") => Err(Error::environment("spy environment failure")),
                Some(_) => Err(Error::command("spy command failure")),
            }
        }

        fn first(&mut self, _runner: &CommandRunner) -> Result<()> {
            self.record("first")
        }

        fn second(&mut self, _runner: &CommandRunner) -> Result<()> {
            self.record("second")
        }
    }

    const SPY_SCHEMA: HandlerSchema = HandlerSchema {
        options: &[
            OptionDecl::new("fail_with", "Error kind to fail with."),
            OptionDecl::new("needed", "Required value."),
        ],
        required: &[],
        defaults: &[],
    };

    impl BackupHandler for SpyHandler {
        const SCHEMA: &'static HandlerSchema = &SPY_SCHEMA;
        const ENTRY_POINTS: &'static [EntryPoint<Self>] = &[
            EntryPoint {
                name: "first",
                run: SpyHandler::first,
            },
            EntryPoint {
                name: "second",
                run: SpyHandler::second,
            },
        ];

        fn from_config(conf: HandlerConfig) -> Result<Self> {
            Ok(Self { conf })
        }
    }

    /// Like [`SpyHandler`] but its job section must define `needed`.
    pub(crate) struct StrictSpyHandler(SpyHandler);

    const STRICT_SPY_SCHEMA: HandlerSchema = HandlerSchema {
        options: SPY_SCHEMA.options,
        required: &["needed"],
        defaults: &[],
    };

    impl StrictSpyHandler {
        fn strict(&mut self, _runner: &CommandRunner) -> Result<()> {
            self.0.record("strict")
        }
    }

    impl BackupHandler for StrictSpyHandler {
        const SCHEMA: &'static HandlerSchema = &STRICT_SPY_SCHEMA;
        const ENTRY_POINTS: &'static [EntryPoint<Self>] = &[EntryPoint {
            name: "strict",
            run: StrictSpyHandler::strict,
        }];

        fn from_config(conf: HandlerConfig) -> Result<Self> {
            Ok(Self(SpyHandler { conf }))
        }
    }

    pub(crate) struct SpyPlugin;

    impl PluginModule for SpyPlugin {
        fn name(&self) -> &'static str {
            "spies"
        }

        fn description(&self) -> &'static str {
            "Spy methods."
        }

        fn methods(&self) -> Vec<MethodDecl> {
            vec![
                MethodDecl {
                    method: "spy",
                    handler: HandlerType::of::<SpyHandler>(),
                    entry_point: "first",
                },
                MethodDecl {
                    method: "strict_spy",
                    handler: HandlerType::of::<StrictSpyHandler>(),
                    entry_point: "strict",
                },
            ]
        }
    }

    struct BrokenPlugin;

    impl PluginModule for BrokenPlugin {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn description(&self) -> &'static str {
            "Broken."
        }

        fn methods(&self) -> Vec<MethodDecl> {
            vec![MethodDecl {
                method: "broken",
                handler: HandlerType::of::<SpyHandler>(),
                entry_point: "missing",
            }]
        }
    }

    struct EmptyPlugin;

    impl PluginModule for EmptyPlugin {
        fn name(&self) -> &'static str {
            "empty"
        }

        fn description(&self) -> &'static str {
            "Provides nothing."
        }

        fn methods(&self) -> Vec<MethodDecl> {
            Vec::new()
        }
    }

    fn job(pairs: &[(&str, &str)]) -> ConfigMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_register_and_invoke() {
        let mut registry = PluginRegistry::new();
        registry
            .register("spy", HandlerType::of::<SpyHandler>(), "first")
            .unwrap();

        assert!(registry.has_method("spy"));
        assert!(!registry.has_method("other"));

        let mut global = global();
        global.insert("job_name".to_string(), "web".to_string());
        registry
            .invoke("spy", &global, &job(&[("method", "spy")]), &CommandRunner::new(false))
            .unwrap();
        assert_eq!(calls(), vec!["first:web"]);
    }

    #[test]
    fn test_last_registration_wins() {
        let mut registry = PluginRegistry::new();
        registry
            .register("spy", HandlerType::of::<SpyHandler>(), "first")
            .unwrap();
        registry
            .register("spy", HandlerType::of::<SpyHandler>(), "second")
            .unwrap();

        registry
            .invoke("spy", &global(), &ConfigMap::new(), &CommandRunner::new(false))
            .unwrap();
        assert_eq!(calls(), vec!["second:-"]);
    }

    #[test]
    fn test_invoke_unregistered_method() {
        let registry = PluginRegistry::new();
        let error = registry
            .invoke("nope", &global(), &ConfigMap::new(), &CommandRunner::new(false))
            .unwrap_err();

        assert_eq!(error.kind(), ErrorKind::Config);
        assert!(error.to_string().contains("nope"));
    }

    #[test]
    fn test_invoke_propagates_handler_errors() {
        let mut registry = PluginRegistry::new();
        registry
            .register("spy", HandlerType::of::<SpyHandler>(), "first")
            .unwrap();

        let error = registry
            .invoke(
                "spy",
                &global(),
                &job(&[("fail_with", "command")]),
                &CommandRunner::new(false),
            )
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Command);

        let error = registry
            .invoke(
                "spy",
                &global(),
                &job(&[("bogus", "1")]),
                &CommandRunner::new(false),
            )
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Config);
    }

    #[test]
    fn test_register_rejects_bad_registrations() {
        let mut registry = PluginRegistry::new();

        let error = registry
            .register(" ", HandlerType::of::<SpyHandler>(), "first")
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::BadPlugin);

        let error = registry
            .register("spy", HandlerType::of::<SpyHandler>(), "third")
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::BadPlugin);
        assert!(!registry.has_method("spy"));
    }

    #[test]
    fn test_load_plugin() {
        let mut registry = PluginRegistry::new();
        registry.load_plugin(&SpyPlugin).unwrap();

        assert_eq!(registry.list_plugins(), vec![("spies", "Spy methods.")]);
        assert_eq!(registry.list_methods(Some("spies")), vec!["spy", "strict_spy"]);
        assert!(registry.list_methods(Some("other")).is_empty());
        assert_eq!(
            registry.registration("spy").unwrap().plugin().as_deref(),
            Some("spies")
        );

        let text = registry.describe_method("strict_spy").unwrap();
        assert!(text.starts_with("strict_spy (plugin spies: Spy methods.)"));
        assert!(text.contains("needed: Required value. (required)"));
        assert!(registry.describe_method("nope").is_none());
    }

    #[test]
    fn test_load_broken_plugin_is_fatal() {
        let mut registry = PluginRegistry::new();
        let error = registry.load_plugin(&BrokenPlugin).unwrap_err();

        assert!(error.is_fatal());
        assert_eq!(error.kind(), ErrorKind::BadPlugin);
        assert!(registry.list_plugins().is_empty());
    }

    #[test]
    fn test_load_plugin_without_methods() {
        let mut registry = PluginRegistry::new();
        let error = registry.load_plugin(&EmptyPlugin).unwrap_err();

        assert_eq!(error.kind(), ErrorKind::BadPlugin);
        assert!(error.to_string().contains("empty"));
        assert!(registry.list_plugins().is_empty());
        assert!(registry.list_methods(None).is_empty());
    }
}
