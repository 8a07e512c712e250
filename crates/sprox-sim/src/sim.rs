//! Randomized convergence run
//!
//! Several proxy contexts share one [`MemoryStore`]. Every context holds a
//! collection and a variable proxy for the same two stores, and a handful of
//! consumers per context write through them concurrently. Once the writers
//! finish the run waits for every replica to settle, then checks each one
//! against the store.

use crate::config::SimConfig;
use crate::link;
use anyhow::Result;
use futures_util::future::join_all;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use serde_json::json;
use sprox_core::{
    entity_id, ChannelObserver, CollectionProxy, ConsumerId, Entity, HandleOptions, Notification,
    PortReporter, ProxyFactory, ProxyId, ProxyPort, Scheduler, Snapshot, SyncState, VariableProxy, Version,
};
use sprox_store::{BackingStore, MemoryStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub const COLLECTION_ID: &str = "sim:items";
pub const VARIABLE_ID: &str = "sim:name";

const POLL_INTERVAL: Duration = Duration::from_millis(10);

type Inbox = mpsc::UnboundedReceiver<(ConsumerId, Notification)>;

/// Outcome of a simulation run
#[derive(Debug, Clone, Default, Serialize)]
pub struct SimReport {
    pub seed: u64,
    pub contexts: usize,
    pub operations: usize,
    pub failed_operations: usize,
    pub store_version: u64,
    pub final_items: usize,
    pub syncs: usize,
    pub updates: usize,
    pub desyncs: usize,
    pub converged: bool,
    pub mismatches: Vec<String>,
}

struct Context {
    name: String,
    factory: Arc<ProxyFactory>,
    collection: Arc<CollectionProxy>,
    variable: Arc<VariableProxy>,
    inboxes: Vec<Inbox>,
}

impl Context {
    fn open(
        index: usize,
        store: &Arc<MemoryStore>,
        config: &SimConfig,
        seed: u64,
    ) -> Result<Self> {
        let name = format!("ctx{}", index);
        let backing: Arc<dyn BackingStore> = store.clone();

        // Odd contexts talk to the store through the framed codec
        let (port, inbound) = if index % 2 == 1 {
            link::framed(backing, &name, &config.transport)
        } else {
            link::jittered(
                backing,
                &name,
                Duration::from_millis(config.max_delay_ms),
                seed,
            )
        };

        let port: Arc<dyn ProxyPort> = Arc::new(port);
        let scheduler = Scheduler::with_config(
            Arc::new(PortReporter(port.clone())),
            config.scheduler.clone(),
        )?;
        let factory = Arc::new(ProxyFactory::new(port, scheduler));
        tokio::spawn(inbound.run(factory.clone()));

        let collection = factory.collection(ProxyId::new(COLLECTION_ID)?)?;
        let variable = factory.variable(ProxyId::new(VARIABLE_ID)?)?;

        Ok(Self {
            name,
            factory,
            collection,
            variable,
            inboxes: Vec::new(),
        })
    }

    fn consumer(&self, index: usize) -> ConsumerId {
        ConsumerId::new(format!("{}-c{}", self.name, index))
    }

    /// Register `consumer` on both proxies, keeping its notification inboxes
    fn attach(&mut self, consumer: &ConsumerId) {
        let options = HandleOptions {
            notify_desync: true,
            ..HandleOptions::default()
        };

        let (observer, inbox) = ChannelObserver::new(options);
        self.collection.register(consumer.clone(), Arc::new(observer));
        self.inboxes.push(inbox);

        let (observer, inbox) = ChannelObserver::new(options);
        self.variable.register(consumer.clone(), Arc::new(observer));
        self.inboxes.push(inbox);
    }

    fn settled(&self, store: &MemoryStore) -> bool {
        let caught_up = |state: SyncState, version: Option<Version>, queued: usize, id: &ProxyId| {
            state == SyncState::Full && queued == 0 && version == store.version(id)
        };

        caught_up(
            self.collection.sync_state(),
            self.collection.version(),
            self.collection.queued_updates(),
            self.collection.id(),
        ) && caught_up(
            self.variable.sync_state(),
            self.variable.version(),
            self.variable.queued_updates(),
            self.variable.id(),
        ) && !self.factory.scheduler().busy()
    }
}

/// One consumer's share of the workload. Returns how many operations failed.
async fn drive(
    consumer: ConsumerId,
    collection: Arc<CollectionProxy>,
    variable: Arc<VariableProxy>,
    config: SimConfig,
    seed: u64,
) -> usize {
    let mut rng = StdRng::seed_from_u64(seed);
    let items = config.items.max(1);
    let mut failed = 0;

    for op in 0..config.ops {
        let item = format!("item{}", rng.gen_range(0..items));
        let roll = rng.gen_range(0..100u32);

        let result = match roll {
            0..=44 => collection.store(
                json!({ "id": item }),
                vec![format!("{}:{}", consumer, op)],
                &consumer,
            ),
            45..=69 => collection.remove(&item, Vec::new(), &consumer),
            70..=91 => variable.set(json!({ "id": format!("{}:{}", consumer, op) }), &consumer),
            92..=94 => variable.clear(&consumer),
            95..=96 => collection.clear(&consumer),
            _ => collection.to_list(&consumer).await.map(|entries| {
                debug!(consumer = %consumer, entries = entries.len(), "Listed collection");
            }),
        };

        if let Err(e) = result {
            warn!(consumer = %consumer, op, error = %e, "Operation failed");
            failed += 1;
        }

        if config.max_delay_ms > 0 {
            let pause = rng.gen_range(0..=config.max_delay_ms * 1_000);
            tokio::time::sleep(Duration::from_micros(pause)).await;
        }
    }

    failed
}

/// Run a simulation to completion
pub async fn run(config: &SimConfig) -> Result<SimReport> {
    let seed = config.seed.unwrap_or_else(rand::random);
    info!(
        seed,
        contexts = config.contexts,
        consumers = config.consumers,
        ops = config.ops,
        "Starting simulation"
    );

    let store = Arc::new(MemoryStore::with_event_capacity(config.event_capacity));
    let mut contexts = Vec::with_capacity(config.contexts);
    for index in 0..config.contexts {
        contexts.push(Context::open(index, &store, config, mix(seed, index, 0))?);
    }

    let mut writers = Vec::new();
    for (ctx_index, context) in contexts.iter_mut().enumerate() {
        for index in 0..config.consumers {
            let consumer = context.consumer(index);
            context.attach(&consumer);
            writers.push(drive(
                consumer,
                context.collection.clone(),
                context.variable.clone(),
                config.clone(),
                mix(seed, ctx_index, index + 1),
            ));
        }
    }

    let failed_operations: usize = join_all(writers).await.into_iter().sum();
    info!(failed_operations, "Writers finished, waiting for replicas to settle");

    let mut report = SimReport {
        seed,
        contexts: config.contexts,
        operations: config.contexts * config.consumers * config.ops,
        failed_operations,
        ..SimReport::default()
    };

    let deadline = Instant::now() + Duration::from_millis(config.settle_timeout_ms);
    while !contexts.iter().all(|c| c.settled(&store)) {
        if Instant::now() >= deadline {
            for context in contexts.iter().filter(|c| !c.settled(&store)) {
                report.mismatches.push(format!(
                    "{}: did not settle (collection {:?} at {:?}, variable {:?} at {:?})",
                    context.name,
                    context.collection.sync_state(),
                    context.collection.version(),
                    context.variable.sync_state(),
                    context.variable.version(),
                ));
            }
            break;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    let collection_ref = contexts
        .first()
        .map(|c| c.collection.store_ref().clone());
    let variable_ref = contexts.first().map(|c| c.variable.store_ref().clone());

    if let (Some(collection_ref), Some(variable_ref)) = (collection_ref, variable_ref) {
        let mut expected: Vec<Entity> = store
            .to_list(&collection_ref)
            .await?
            .into_iter()
            .map(|entry| entry.value)
            .collect();
        sort_by_id(&mut expected);
        let expected_value = store.get(&variable_ref).await?;

        report.store_version = store.version(&collection_ref.id).unwrap_or(0)
            + store.version(&variable_ref.id).unwrap_or(0);
        report.final_items = expected.len();

        for context in &contexts {
            match context.collection.snapshot() {
                Snapshot::Collection(mut values) => {
                    sort_by_id(&mut values);
                    if values != expected {
                        report.mismatches.push(format!(
                            "{}: collection holds {} items, store holds {}",
                            context.name,
                            values.len(),
                            expected.len()
                        ));
                    }
                }
                other => report
                    .mismatches
                    .push(format!("{}: unexpected collection snapshot {:?}", context.name, other)),
            }

            if context.variable.snapshot() != Snapshot::Variable(expected_value.clone()) {
                report.mismatches.push(format!(
                    "{}: variable {:?} differs from store {:?}",
                    context.name,
                    context.variable.snapshot(),
                    expected_value
                ));
            }
        }
    }

    for context in &mut contexts {
        context.factory.scheduler().idle().await;
        for inbox in &mut context.inboxes {
            while let Ok((_, notification)) = inbox.try_recv() {
                match notification {
                    Notification::Sync(_) => report.syncs += 1,
                    Notification::Update(_) => report.updates += 1,
                    Notification::Desync => report.desyncs += 1,
                }
            }
        }
    }

    report.converged = report.mismatches.is_empty();
    info!(
        converged = report.converged,
        desyncs = report.desyncs,
        items = report.final_items,
        "Simulation finished"
    );
    Ok(report)
}

fn sort_by_id(values: &mut [Entity]) {
    values.sort_by(|a, b| {
        entity_id(a)
            .unwrap_or_default()
            .cmp(entity_id(b).unwrap_or_default())
    });
}

fn mix(seed: u64, context: usize, consumer: usize) -> u64 {
    seed ^ (((context as u64) << 32) | consumer as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sprox_protocol::Format;

    fn small(seed: u64) -> SimConfig {
        SimConfig {
            contexts: 3,
            consumers: 2,
            ops: 25,
            items: 4,
            max_delay_ms: 1,
            seed: Some(seed),
            ..SimConfig::default()
        }
    }

    #[tokio::test]
    async fn test_small_run_converges() {
        let report = run(&small(1)).await.unwrap();
        assert!(report.converged, "mismatches: {:?}", report.mismatches);
        assert_eq!(report.operations, 150);
        assert_eq!(report.failed_operations, 0);
        assert!(report.syncs > 0);
    }

    #[tokio::test]
    async fn test_converges_over_msgpack_without_delay() {
        let mut config = small(2);
        config.max_delay_ms = 0;
        config.transport.format = Format::Msgpack;
        config.scheduler.consumers_per_turn = Some(1);

        let report = run(&config).await.unwrap();
        assert!(report.converged, "mismatches: {:?}", report.mismatches);
    }

    #[test]
    fn test_seeds_differ_per_consumer() {
        assert_ne!(mix(7, 0, 1), mix(7, 0, 2));
        assert_ne!(mix(7, 0, 1), mix(7, 1, 1));
        assert_eq!(mix(7, 2, 3), mix(7, 2, 3));
    }
}
