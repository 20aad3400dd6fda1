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

mod common;

use common::{Log, Tracked, TrackedSource, WAIT, init_tracing};
use dotflow_core::escalation::TimeoutKind;
use dotflow_core::managed_object::{BoundedManagedObjectPool, ManagedObjectPool, RecycleContext};
use dotflow_core::{
    Escalation, EscalationKind, FunctionResult, Kernel, KernelConfig, ManagedFunctionContext, ManagedObjectRef, ManagedObjectScope, ManagedObjectSource,
    ManagedObjectUser, TeamKind,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

fn reading(log: &Log, entry: &'static str, object: &ManagedObjectRef<String>) -> impl Fn(&mut ManagedFunctionContext<'_>) -> FunctionResult + Send + Sync + 'static {
    let log = log.clone();
    let object = object.clone();
    move |context| {
        let label = context.object(&object)?;
        log.record(format!("{entry}:{label}"));
        Ok(None)
    }
}

/// Asynchronous source that holds on to its users until told to supply.
#[derive(Default)]
struct DeferredSource {
    users: Mutex<Vec<ManagedObjectUser>>,
}

impl ManagedObjectSource for DeferredSource {
    fn source_managed_object(&self, user: ManagedObjectUser) {
        self.users.lock().push(user);
    }
}

#[test]
fn test_asynchronous_sourcing_times_out() {
    init_tracing();
    let log = Log::default();
    let source = Arc::new(DeferredSource::default());
    let config = KernelConfig::default().with_asset_check_interval(Duration::from_millis(10));

    let mut builder = Kernel::builder(config);
    let remote = builder
        .managed_object::<String>("remote", ManagedObjectScope::Thread, Arc::clone(&source) as Arc<dyn ManagedObjectSource>)
        .asynchronous(Some(Duration::from_millis(30)))
        .reference();
    builder
        .function("use", reading(&log, "use", &remote))
        .requires(&remote)
        .escalation(EscalationKind::Timeout(TimeoutKind::ManagedObjectSourcing), "on_timeout");
    let handler_log = log.clone();
    builder.function("on_timeout", move |context: &mut ManagedFunctionContext<'_>| -> FunctionResult {
        let timed_out = context.argument::<Escalation>().is_some_and(Escalation::is_timeout);
        handler_log.record(format!("on_timeout:{timed_out}"));
        Ok(None)
    });
    let kernel = builder.build().unwrap();
    kernel.open().unwrap();

    let outcome = kernel.invoke_process("use", None).unwrap().wait_timeout(WAIT).unwrap();
    assert!(outcome.is_success(), "{:?}", outcome.escalation());
    assert_eq!(log.entries(), vec!["on_timeout:true"]);

    let late = source.users.lock().pop().unwrap();
    late.set_managed_object(Arc::new(Tracked::new("late", &log)));
    assert!(log.contains("unload:late:LateArrival"), "{:?}", log.entries());
}

#[test]
fn test_thread_object_shared_along_chain() {
    init_tracing();
    let log = Log::default();
    let source = TrackedSource::new("conn", &log);
    let config = KernelConfig::default().with_team("cpu", TeamKind::Fixed { size: 2 }).with_default_team("cpu");

    let mut builder = Kernel::builder(config);
    let conn = builder
        .managed_object::<String>("conn", ManagedObjectScope::Thread, Arc::clone(&source) as Arc<dyn ManagedObjectSource>)
        .reference();
    builder.function("first", reading(&log, "first", &conn)).requires(&conn).next("second");
    builder.function("second", reading(&log, "second", &conn)).requires(&conn);
    let kernel = builder.build().unwrap();
    kernel.open().unwrap();

    assert!(kernel.invoke_process("first", None).unwrap().wait_timeout(WAIT).unwrap().is_success());
    assert_eq!(source.sourced(), 1);
    assert_eq!(log.entries(), vec!["first:conn", "second:conn", "unload:conn:NoRecycleFunction"]);

    assert!(kernel.invoke_process("first", None).unwrap().wait_timeout(WAIT).unwrap().is_success());
    assert_eq!(source.sourced(), 2);
}

#[test]
fn test_function_object_per_invocation() {
    init_tracing();
    let log = Log::default();
    let source = TrackedSource::new("buffer", &log);

    let mut builder = Kernel::builder(KernelConfig::default());
    let buffer = builder
        .managed_object::<String>("buffer", ManagedObjectScope::Function, Arc::clone(&source) as Arc<dyn ManagedObjectSource>)
        .reference();
    builder.function("first", reading(&log, "first", &buffer)).requires(&buffer).next("second");
    builder.function("second", reading(&log, "second", &buffer)).requires(&buffer);
    let kernel = builder.build().unwrap();
    kernel.open().unwrap();

    assert!(kernel.invoke_process("first", None).unwrap().wait().is_success());
    assert_eq!(source.sourced(), 2);
    assert_eq!(
        log.entries(),
        vec![
            "first:buffer",
            "unload:buffer:NoRecycleFunction",
            "second:buffer",
            "unload:buffer:NoRecycleFunction"
        ]
    );
}

#[test]
fn test_process_object_shared_across_threads() {
    init_tracing();
    let log = Log::default();
    let source = TrackedSource::new("cache", &log);
    let config = KernelConfig::default().with_team("workers", TeamKind::Fixed { size: 3 }).with_default_team("workers");

    let mut builder = Kernel::builder(config);
    let cache = builder
        .managed_object::<String>("cache", ManagedObjectScope::Process, Arc::clone(&source) as Arc<dyn ManagedObjectSource>)
        .reference();
    builder.function("fan_out", |context: &mut ManagedFunctionContext<'_>| -> FunctionResult {
        context.spawn_flow("work", None)?;
        context.spawn_flow("work", None)?;
        Ok(None)
    });
    builder.function("work", reading(&log, "work", &cache)).requires(&cache);
    let kernel = builder.build().unwrap();
    kernel.open().unwrap();

    let outcome = kernel.invoke_process("fan_out", None).unwrap().wait_timeout(WAIT).unwrap();
    assert!(outcome.is_success());
    assert_eq!(source.sourced(), 1);

    // unloaded once, after both threads are done, before the process completes
    assert_eq!(log.entries(), vec!["work:cache", "work:cache", "unload:cache:NoRecycleFunction"]);
}

#[test]
fn test_recycle_batch_collects_cleanup_escalations() {
    init_tracing();
    let log = Log::default();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let mut builder = Kernel::builder(KernelConfig::default());
    let first = builder
        .managed_object::<String>("a", ManagedObjectScope::Thread, TrackedSource::new("a", &log))
        .recycle(|_: &mut RecycleContext<'_>| -> Result<(), Escalation> { Err(Escalation::application("flush", "disk full")) })
        .reference();
    let recycle_seen = Arc::clone(&seen);
    let second = builder
        .managed_object::<String>("b", ManagedObjectScope::Thread, TrackedSource::new("b", &log))
        .recycle(move |context: &mut RecycleContext<'_>| -> Result<(), Escalation> {
            let earlier: Vec<String> = context.cleanup_escalations().iter().map(|cleanup| cleanup.object_name().to_string()).collect();
            recycle_seen.lock().extend(earlier);
            Ok(())
        })
        .reference();
    let both = log.clone();
    let (a, b) = (first.clone(), second.clone());
    builder
        .function("use", move |context: &mut ManagedFunctionContext<'_>| -> FunctionResult {
            both.record(format!("use:{}+{}", context.object(&a)?, context.object(&b)?));
            Ok(None)
        })
        .requires(&first)
        .requires(&second);
    let kernel = builder.build().unwrap();
    kernel.open().unwrap();

    let outcome = kernel.invoke_process("use", None).unwrap().wait();
    assert!(outcome.is_success());
    assert_eq!(outcome.cleanup_escalations().len(), 1);
    assert_eq!(outcome.cleanup_escalations()[0].object_name(), "a");
    assert_eq!(outcome.cleanup_escalations()[0].escalation().message(), "disk full");
    assert_eq!(*seen.lock(), vec!["a".to_string()]);
    assert_eq!(log.entries(), vec!["use:a+b", "unload:a:RecycleFailed", "unload:b:NotReused"]);
}

#[test]
fn test_pooled_object_reused_across_processes() {
    init_tracing();
    let log = Log::default();
    let source = TrackedSource::new("session", &log);
    let pool = Arc::new(BoundedManagedObjectPool::new(1));

    let mut builder = Kernel::builder(KernelConfig::default());
    let session = builder
        .managed_object::<String>("session", ManagedObjectScope::Process, Arc::clone(&source) as Arc<dyn ManagedObjectSource>)
        .pool(Arc::clone(&pool) as Arc<dyn ManagedObjectPool>)
        .recycle(|context: &mut RecycleContext<'_>| -> Result<(), Escalation> {
            context.reuse_managed_object();
            Ok(())
        })
        .reference();
    builder.function("use", reading(&log, "use", &session)).requires(&session);
    let kernel = builder.build().unwrap();
    kernel.open().unwrap();

    for _ in 0..3 {
        assert!(kernel.invoke_process("use", None).unwrap().wait().is_success());
    }
    assert_eq!(source.sourced(), 1);
    assert_eq!((pool.misses(), pool.hits(), pool.idle()), (1, 2, 1));
    assert_eq!(log.entries(), vec!["use:session", "use:session", "use:session"]);
}
