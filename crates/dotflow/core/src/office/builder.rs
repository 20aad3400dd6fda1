// Dotflow
// Copyright (C) 2025 Synerthink

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Builder assembling the office and its teams into a [`Kernel`].

use super::{FunctionEscalationHandler, FunctionMetaData, FunctionResult, ManagedFunction, ManagedFunctionContext, ObjectRequirement, OfficeMetaData};
use crate::asset::AssetManager;
use crate::config::{KernelConfig, PASSIVE_TEAM, TeamKind};
use crate::error::{KernelError, KernelResult};
use crate::escalation::{Escalation, EscalationFlow, EscalationHandler, EscalationMatcher, EscalationProcedure, LoggingEscalationHandler};
use crate::kernel::Kernel;
use crate::managed_object::{
    Administration, Governance, ManagedObject, ManagedObjectMetaData, ManagedObjectPool, ManagedObjectRef, ManagedObjectScope, ManagedObjectSource,
    ManagedObjectSourceContext, RecycleContext, RecycleFunction, SourcingMode,
};
use crate::team::{TeamRegistry, TeamSource};
use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

struct ObjectDeclaration {
    name: String,
    scope: ManagedObjectScope,
    index: usize,
    source: Arc<dyn ManagedObjectSource>,
    asynchronous: Option<Option<Duration>>,
    pool: Option<Arc<dyn ManagedObjectPool>>,
    recycle: Option<Arc<dyn RecycleFunction>>,
    recycle_team: Option<String>,
    pre_administration: Vec<Arc<dyn Administration>>,
    post_administration: Vec<Arc<dyn Administration>>,
    governance: Vec<Arc<dyn Governance>>,
}

struct FunctionDeclaration {
    name: String,
    logic: Arc<dyn ManagedFunction>,
    team: Option<String>,
    required_objects: Vec<ObjectRequirement>,
    next: Option<String>,
    escalations: Vec<(EscalationMatcher, String)>,
    asynchronous_timeout: Option<Duration>,
}

/// Declares teams, managed objects and functions, then builds a [`Kernel`].
///
/// # Example
/// ```
/// use dotflow_core::config::KernelConfig;
/// use dotflow_core::office::{FunctionResult, KernelBuilder, ManagedFunctionContext};
///
/// let mut builder = KernelBuilder::new(KernelConfig::default());
/// builder
///     .function("greet", |_: &mut ManagedFunctionContext<'_>| -> FunctionResult { Ok(Some(Box::new("hello"))) })
///     .next("done");
/// builder.function("done", |_: &mut ManagedFunctionContext<'_>| -> FunctionResult { Ok(None) });
///
/// let kernel = builder.build().unwrap();
/// kernel.open().unwrap();
/// let outcome = kernel.invoke_process("greet", None).unwrap().wait();
/// assert!(outcome.is_success());
/// kernel.close().unwrap();
/// ```
pub struct KernelBuilder {
    config: KernelConfig,
    teams: Vec<(String, Box<dyn TeamSource>)>,
    objects: Vec<ObjectDeclaration>,
    functions: Vec<FunctionDeclaration>,
    office_escalations: Vec<(EscalationMatcher, String)>,
    top_handler: Arc<dyn EscalationHandler>,
}

impl KernelBuilder {
    pub fn new(config: KernelConfig) -> Self {
        Self {
            config,
            teams: Vec::new(),
            objects: Vec::new(),
            functions: Vec::new(),
            office_escalations: Vec::new(),
            top_handler: Arc::new(LoggingEscalationHandler),
        }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Registers a team created by `source`, alongside the configured ones
    pub fn team(&mut self, name: impl Into<String>, source: impl TeamSource) -> &mut Self {
        self.teams.push((name.into(), Box::new(source)));
        self
    }

    /// Declares a managed object of type `T`, indexed within `scope` in declaration order
    pub fn managed_object<T>(&mut self, name: impl Into<String>, scope: ManagedObjectScope, source: Arc<dyn ManagedObjectSource>) -> ManagedObjectBuilder<'_, T> {
        let index = self.objects.iter().filter(|object| object.scope == scope).count();
        self.objects.push(ObjectDeclaration {
            name: name.into(),
            scope,
            index,
            source,
            asynchronous: None,
            pool: None,
            recycle: None,
            recycle_team: None,
            pre_administration: Vec::new(),
            post_administration: Vec::new(),
            governance: Vec::new(),
        });
        let len = self.objects.len();
        ManagedObjectBuilder {
            declaration: &mut self.objects[len - 1],
            _marker: PhantomData,
        }
    }

    pub fn function<F>(&mut self, name: impl Into<String>, logic: F) -> FunctionBuilder<'_>
    where
        F: Fn(&mut ManagedFunctionContext<'_>) -> FunctionResult + Send + Sync + 'static,
    {
        self.managed_function(name, Arc::new(logic))
    }

    pub fn managed_function(&mut self, name: impl Into<String>, logic: Arc<dyn ManagedFunction>) -> FunctionBuilder<'_> {
        self.functions.push(FunctionDeclaration {
            name: name.into(),
            logic,
            team: None,
            required_objects: Vec::new(),
            next: None,
            escalations: Vec::new(),
            asynchronous_timeout: None,
        });
        let len = self.functions.len();
        FunctionBuilder {
            declaration: &mut self.functions[len - 1],
        }
    }

    /// Thread level handler, consulted after every region declined the escalation
    pub fn office_escalation(&mut self, matcher: impl Into<EscalationMatcher>, handler_function: impl Into<String>) -> &mut Self {
        self.office_escalations.push((matcher.into(), handler_function.into()));
        self
    }

    /// Process level handler, replacing the default that logs
    pub fn process_escalation_handler(&mut self, handler: impl EscalationHandler) -> &mut Self {
        self.top_handler = Arc::new(handler);
        self
    }

    /// Validates the declarations, creates the teams and initialises every source.
    ///
    /// # Errors
    /// - invalid configuration, duplicate names, unknown teams or functions
    /// - a team that could not be created
    /// - a source whose `init` failed
    pub fn build(self) -> KernelResult<Kernel> {
        let KernelBuilder {
            config,
            teams,
            objects,
            functions,
            office_escalations,
            top_handler,
        } = self;
        config.validate()?;

        let registry = TeamRegistry::new();
        let stop_timeout = config.stop_timeout();
        registry.create(PASSIVE_TEAM, &TeamKind::Passive, stop_timeout)?;
        for team in &config.teams {
            registry.create(&team.name, &team.kind, stop_timeout)?;
        }
        for (name, source) in &teams {
            registry.create(name, source.as_ref(), stop_timeout)?;
        }
        let default_team = registry.require(&config.default_team)?;

        let mut object_names = HashSet::new();
        let mut managed_objects = Vec::with_capacity(objects.len());
        for object in objects {
            if !object_names.insert(object.name.clone()) {
                return Err(KernelError::DuplicateName {
                    kind: "managed object",
                    name: object.name,
                });
            }
            managed_objects.push(Arc::new(build_managed_object(object, &registry, &config)?));
        }

        let function_names: HashSet<String> = functions.iter().map(|function| function.name.clone()).collect();
        if function_names.len() != functions.len() {
            let mut seen = HashSet::new();
            let duplicate = functions.iter().find(|function| !seen.insert(function.name.as_str())).map(|function| function.name.clone());
            return Err(KernelError::DuplicateName {
                kind: "function",
                name: duplicate.unwrap_or_default(),
            });
        }
        let require_function = |name: &str| -> KernelResult<()> {
            if function_names.contains(name) {
                Ok(())
            } else {
                Err(KernelError::UnknownFunction { name: name.to_string() })
            }
        };

        let mut office_functions = HashMap::with_capacity(functions.len());
        for function in functions {
            if let Some(next) = &function.next {
                require_function(next)?;
            }
            let team = match &function.team {
                Some(team) => registry.require(team)?,
                None => default_team.clone(),
            };
            let flows = function
                .escalations
                .into_iter()
                .map(|(matcher, handler)| -> KernelResult<EscalationFlow> {
                    require_function(&handler)?;
                    Ok(escalation_flow(matcher, handler))
                })
                .collect::<KernelResult<Vec<_>>>()?;
            debug!(function = %function.name, team = %team.id(), "function declared");
            let meta = FunctionMetaData {
                name: function.name.clone(),
                team,
                logic: function.logic,
                required_objects: function.required_objects,
                next: function.next,
                escalation: Arc::new(EscalationProcedure::new(flows)),
                asynchronous_timeout: function.asynchronous_timeout.unwrap_or_else(|| config.default_asynchronous_timeout()),
            };
            office_functions.insert(function.name, Arc::new(meta));
        }

        let office_flows = office_escalations
            .into_iter()
            .map(|(matcher, handler)| -> KernelResult<EscalationFlow> {
                require_function(&handler)?;
                Ok(escalation_flow(matcher, handler))
            })
            .collect::<KernelResult<Vec<_>>>()?;

        let office = OfficeMetaData::new(office_functions, managed_objects, EscalationProcedure::new(office_flows));
        let assets = Arc::new(AssetManager::new(config.asset_check_interval()));
        info!(
            functions = office.function_names().len(),
            teams = registry.len(),
            default_team = %config.default_team,
            "kernel built"
        );
        Ok(Kernel::new(config, Arc::new(office), registry, default_team, assets, top_handler))
    }
}

fn escalation_flow(matcher: EscalationMatcher, handler: String) -> EscalationFlow {
    let function = Arc::new(FunctionEscalationHandler::new(handler.clone()));
    EscalationFlow::new(matcher, handler, function)
}

fn build_managed_object(object: ObjectDeclaration, registry: &TeamRegistry, config: &KernelConfig) -> KernelResult<ManagedObjectMetaData> {
    let mut context = ManagedObjectSourceContext::new(&object.name);
    object.source.init(&mut context).map_err(|err| KernelError::ManagedObjectSource {
        name: object.name.clone(),
        message: format!("{err:#}"),
    })?;
    let (source_recycle, source_asynchronous) = context.into_parts();

    let sourcing = match object.asynchronous.or(source_asynchronous) {
        None => SourcingMode::Synchronous,
        Some(timeout) => SourcingMode::Asynchronous {
            timeout: timeout.unwrap_or_else(|| config.default_asynchronous_timeout()),
        },
    };
    let recycle_team = object.recycle_team.as_deref().map(|team| registry.require(team)).transpose()?;
    debug!(object = %object.name, scope = ?object.scope, index = object.index, ?sourcing, "managed object declared");

    Ok(ManagedObjectMetaData {
        name: object.name,
        scope: object.scope,
        index: object.index,
        source: object.source,
        sourcing,
        pool: object.pool,
        recycle: object.recycle.or(source_recycle),
        recycle_team,
        pre_administration: object.pre_administration,
        post_administration: object.post_administration,
        governance: object.governance,
    })
}

/// Refines a managed object declaration.
pub struct ManagedObjectBuilder<'a, T> {
    declaration: &'a mut ObjectDeclaration,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ManagedObjectBuilder<'_, T> {
    /// Objects arrive asynchronously; `None` uses the kernel's default timeout
    pub fn asynchronous(self, timeout: Option<Duration>) -> Self {
        self.declaration.asynchronous = Some(timeout);
        self
    }

    pub fn pool(self, pool: Arc<dyn ManagedObjectPool>) -> Self {
        self.declaration.pool = Some(pool);
        self
    }

    /// Overrides any recycle function the source declares
    pub fn recycle<F>(self, recycle: F) -> Self
    where
        F: Fn(&mut RecycleContext<'_>) -> Result<(), Escalation> + Send + Sync + 'static,
    {
        self.declaration.recycle = Some(Arc::new(recycle));
        self
    }

    /// Team the recycle function runs on
    pub fn recycle_team(self, team: impl Into<String>) -> Self {
        self.declaration.recycle_team = Some(team.into());
        self
    }

    pub fn pre_administration<F>(self, administration: F) -> Self
    where
        F: Fn(&dyn ManagedObject) -> Result<(), Escalation> + Send + Sync + 'static,
    {
        self.declaration.pre_administration.push(Arc::new(administration));
        self
    }

    pub fn post_administration<F>(self, administration: F) -> Self
    where
        F: Fn(&dyn ManagedObject) -> Result<(), Escalation> + Send + Sync + 'static,
    {
        self.declaration.post_administration.push(Arc::new(administration));
        self
    }

    pub fn governance(self, governance: impl Governance) -> Self {
        self.declaration.governance.push(Arc::new(governance));
        self
    }

    /// Typed handle functions use to require and access the object
    pub fn reference(&self) -> ManagedObjectRef<T> {
        ManagedObjectRef::new(self.declaration.scope, self.declaration.index, &self.declaration.name)
    }
}

/// Refines a function declaration.
pub struct FunctionBuilder<'a> {
    declaration: &'a mut FunctionDeclaration,
}

impl FunctionBuilder<'_> {
    /// Team that must execute the function, the default team otherwise
    pub fn team(self, team: impl Into<String>) -> Self {
        self.declaration.team = Some(team.into());
        self
    }

    /// Requires the object; it is loaded before the logic runs
    pub fn requires<T>(self, object: &ManagedObjectRef<T>) -> Self {
        let requirement = ObjectRequirement {
            scope: object.scope(),
            index: object.index(),
        };
        if !self.declaration.required_objects.contains(&requirement) {
            self.declaration.required_objects.push(requirement);
        }
        self
    }

    /// Function receiving this function's return value
    pub fn next(self, function: impl Into<String>) -> Self {
        self.declaration.next = Some(function.into());
        self
    }

    /// Handles matching escalations raised by this function or the flows it starts
    pub fn escalation(self, matcher: impl Into<EscalationMatcher>, handler_function: impl Into<String>) -> Self {
        self.declaration.escalations.push((matcher.into(), handler_function.into()));
        self
    }

    pub fn asynchronous_timeout(self, timeout: Duration) -> Self {
        self.declaration.asynchronous_timeout = Some(timeout);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escalation::EscalationKind;
    use crate::managed_object::{ManagedObjectUser, managed};

    fn noop(_: &mut ManagedFunctionContext<'_>) -> FunctionResult {
        Ok(None)
    }

    fn value_source(value: u32) -> Arc<dyn ManagedObjectSource> {
        Arc::new(move |user: ManagedObjectUser| user.set_managed_object(managed(value)))
    }

    #[test]
    fn test_duplicate_function_rejected() {
        let mut builder = KernelBuilder::new(KernelConfig::default());
        builder.function("same", noop);
        builder.function("same", noop);
        let err = builder.build().unwrap_err();
        assert_eq!(err, KernelError::DuplicateName { kind: "function", name: "same".into() });
    }

    #[test]
    fn test_unknown_next_rejected() {
        let mut builder = KernelBuilder::new(KernelConfig::default());
        builder.function("start", noop).next("missing");
        assert_eq!(builder.build().unwrap_err(), KernelError::UnknownFunction { name: "missing".into() });
    }

    #[test]
    fn test_unknown_handler_rejected() {
        let mut builder = KernelBuilder::new(KernelConfig::default());
        builder.function("start", noop).escalation(EscalationKind::Panic, "missing");
        assert_eq!(builder.build().unwrap_err(), KernelError::UnknownFunction { name: "missing".into() });

        let mut builder = KernelBuilder::new(KernelConfig::default());
        builder.function("start", noop);
        builder.office_escalation(EscalationMatcher::Any, "missing");
        assert!(builder.build().is_err());
    }

    #[test]
    fn test_unknown_team_rejected() {
        let mut builder = KernelBuilder::new(KernelConfig::default());
        builder.function("start", noop).team("io");
        assert_eq!(builder.build().unwrap_err(), KernelError::UnknownTeam { name: "io".into() });
    }

    #[test]
    fn test_duplicate_object_rejected() {
        let mut builder = KernelBuilder::new(KernelConfig::default());
        builder.managed_object::<u32>("db", ManagedObjectScope::Thread, value_source(1));
        builder.managed_object::<u32>("db", ManagedObjectScope::Process, value_source(2));
        assert!(matches!(builder.build().unwrap_err(), KernelError::DuplicateName { kind: "managed object", .. }));
    }

    #[test]
    fn test_object_indices_are_per_scope() {
        let mut builder = KernelBuilder::new(KernelConfig::default());
        let a = builder.managed_object::<u32>("a", ManagedObjectScope::Thread, value_source(1)).reference();
        let b = builder.managed_object::<u32>("b", ManagedObjectScope::Process, value_source(2)).reference();
        let c = builder.managed_object::<u32>("c", ManagedObjectScope::Thread, value_source(3)).reference();
        assert_eq!((a.index(), b.index(), c.index()), (0, 0, 1));

        let kernel = builder.build().unwrap();
        let office = kernel.office();
        assert_eq!(office.managed_objects(ManagedObjectScope::Thread)[1].name(), "c");
        assert_eq!(office.managed_objects(ManagedObjectScope::Process)[0].name(), "b");
    }

    struct DeclaringSource;

    impl ManagedObjectSource for DeclaringSource {
        fn init(&self, context: &mut ManagedObjectSourceContext) -> anyhow::Result<()> {
            context.set_asynchronous(None);
            context.set_recycle_function(Arc::new(|_: &mut RecycleContext<'_>| -> Result<(), Escalation> { Ok(()) }));
            Ok(())
        }

        fn source_managed_object(&self, user: ManagedObjectUser) {
            user.set_managed_object(managed(()));
        }
    }

    struct FailingSource;

    impl ManagedObjectSource for FailingSource {
        fn init(&self, _context: &mut ManagedObjectSourceContext) -> anyhow::Result<()> {
            anyhow::bail!("no connection string")
        }

        fn source_managed_object(&self, _user: ManagedObjectUser) {}
    }

    #[test]
    fn test_source_init_declarations_apply() {
        let config = KernelConfig::default().with_default_asynchronous_timeout(Duration::from_millis(250));
        let mut builder = KernelBuilder::new(config);
        builder.managed_object::<()>("remote", ManagedObjectScope::Thread, Arc::new(DeclaringSource));
        let kernel = builder.build().unwrap();

        let meta = &kernel.office().managed_objects(ManagedObjectScope::Thread)[0];
        assert_eq!(
            meta.sourcing(),
            SourcingMode::Asynchronous {
                timeout: Duration::from_millis(250)
            }
        );
        assert!(meta.has_recycle_function());
    }

    #[test]
    fn test_source_init_failure() {
        let mut builder = KernelBuilder::new(KernelConfig::default());
        builder.managed_object::<()>("broken", ManagedObjectScope::Process, Arc::new(FailingSource));
        match builder.build() {
            Err(KernelError::ManagedObjectSource { name, message }) => {
                assert_eq!(name, "broken");
                assert_eq!(message, "no connection string");
            }
            other => panic!("unexpected build result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_configured_teams_are_registered() {
        let config = KernelConfig::default().with_team("io", TeamKind::Fixed { size: 1 });
        let mut builder = KernelBuilder::new(config);
        builder.team("custom", TeamKind::WorkerPerJob);
        builder.function("start", noop).team("custom");
        let kernel = builder.build().unwrap();
        assert_eq!(kernel.team_names(), vec!["custom", "io", "passive"]);
    }
}
