//! Basic sprox Example
//!
//! Two proxy contexts share one in-memory store. A write made through one
//! context shows up in the other once the store pushes the update.
//!
//! Run with: cargo run --example basic

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use sprox_core::{
    ChannelObserver, ConsumerId, HandleOptions, Notification, PortReporter, ProxyFactory, ProxyId,
    ProxyPort, Scheduler, SyncState,
};
use sprox_protocol::TransportConfig;
use sprox_store::{BackingStore, MemoryStore};
use sprox_transport::{connect, in_process};
use tokio::net::TcpStream;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("sprox Basic Example\n");

    println!("=== Embedded Mode ===\n");
    embedded_example().await?;

    println!("\n=== TCP Client Mode ===");
    println!("(Start a host first with: cargo run --bin sprox-sim -- --serve 127.0.0.1:6390)\n");

    // Uncomment to test with a running host:
    // tcp_client_example().await?;

    Ok(())
}

fn factory(port: impl ProxyPort + 'static) -> Result<Arc<ProxyFactory>, Box<dyn std::error::Error>> {
    let port: Arc<dyn ProxyPort> = Arc::new(port);
    let scheduler = Scheduler::new(Arc::new(PortReporter(port.clone())))?;
    Ok(Arc::new(ProxyFactory::new(port, scheduler)))
}

async fn embedded_example() -> Result<(), Box<dyn std::error::Error>> {
    let store: Arc<dyn BackingStore> = Arc::new(MemoryStore::new());
    let id = ProxyId::new("demo:todos")?;

    // Two contexts, as two separate pages would have
    let (port_a, inbound_a, _) = in_process(store.clone(), "page-a");
    let context_a = factory(port_a)?;
    tokio::spawn(inbound_a.run(context_a.clone()));

    let (port_b, inbound_b, _) = in_process(store.clone(), "page-b");
    let context_b = factory(port_b)?;
    tokio::spawn(inbound_b.run(context_b.clone()));

    let todos_a = context_a.collection(id.clone())?;
    let todos_b = context_b.collection(id)?;

    let alice = ConsumerId::from("alice");
    let bob = ConsumerId::from("bob");

    let (observer, _) = ChannelObserver::new(HandleOptions::default());
    todos_a.register(alice.clone(), Arc::new(observer));
    let (observer, mut bob_inbox) = ChannelObserver::new(HandleOptions::default());
    todos_b.register(bob.clone(), Arc::new(observer));

    while todos_a.sync_state() != SyncState::Full || todos_b.sync_state() != SyncState::Full {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    todos_a.store(json!({"id": "milk", "title": "Buy milk"}), vec!["k1".into()], &alice)?;
    todos_a.store(json!({"id": "bread", "title": "Buy bread"}), vec!["k2".into()], &alice)?;

    while todos_b.version() != Some(2) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    println!("Bob sees: {:?}", todos_b.to_list(&bob).await?);

    todos_b.remove("milk", vec![], &bob)?;
    while todos_a.version() != Some(3) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    println!("Alice sees: {:?}", todos_a.to_list(&alice).await?);

    while let Ok((consumer, notification)) = bob_inbox.try_recv() {
        match notification {
            Notification::Sync(snapshot) => println!("{} synced: {:?}", consumer, snapshot),
            Notification::Update(delta) => println!("{} updated: {:?}", consumer, delta),
            Notification::Desync => println!("{} desynced", consumer),
        }
    }

    println!("Store stats: {:?}", store.stats().await?);
    println!("Context A: {:?}", context_a.stats());

    Ok(())
}

#[allow(dead_code)]
async fn tcp_client_example() -> Result<(), Box<dyn std::error::Error>> {
    let stream = TcpStream::connect("127.0.0.1:6390").await?;
    let (port, inbound, _pump) = connect(stream, &TransportConfig::default());
    let context = factory(port)?;
    tokio::spawn(inbound.run(context.clone()));

    let name = context.variable(ProxyId::new("demo:name")?)?;
    let me = ConsumerId::from("cli");

    name.set(json!({"id": "n1", "value": "Alice"}), &me)?;
    println!("Name: {:?}", name.get(&me).await?);

    Ok(())
}
