//! Pipe pair - parent and child sides of one link in a single process.
//!
//! This example demonstrates:
//! - Binding a local pipe and connecting both ends
//! - Running the three-phase handshake with endpoint setup in between
//! - Typed calls, an event subscription and cancellation through a proxy
//! - Two-phase teardown
//!
//! ```text
//! RUST_LOG=proclink=debug cargo run --example pipe_pair
//! ```

use std::sync::{Arc, Weak};
use std::time::Duration;

use proclink::dispatch::{CallContext, CallOptions, Endpoint, EndpointHost, Proxy, RemoteProxy};
use proclink::ipc::{IpcConnector, Role};
use proclink::transport::{generate_pipe_path, PipeListener, PipeStream};
use proclink::{Address, Connection, RpcError};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Serialize, Deserialize)]
struct Progress {
    done: u32,
    total: u32,
}

fn worker_endpoint(host: Weak<EndpointHost>) -> Endpoint {
    Endpoint::new("worker")
        .method("Add", |(a, b): (i64, i64), _ctx: CallContext| async move { Ok(a + b) })
        .method("Crunch", move |(steps,): (u32,), ctx: CallContext| {
            let host = host.clone();
            async move {
                let host = host.upgrade().ok_or(RpcError::Cancelled)?;
                for done in 1..=steps {
                    tokio::select! {
                        _ = ctx.cancelled() => return Err(RpcError::Cancelled),
                        _ = tokio::time::sleep(Duration::from_millis(20)) => {}
                    }
                    host.raise_event("worker", "Progress", &Progress { done, total: steps })
                        .await?;
                }
                Ok(steps)
            }
        })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let path = generate_pipe_path();
    let listener = PipeListener::bind(&path).await?;
    let (accepted, connected) = tokio::join!(listener.accept(), PipeStream::connect(&path));
    let (parent_read, parent_write) = accepted?.into_split();
    let (child_read, child_write) = connected?.into_split();

    let host = Arc::new(EndpointHost::new());
    // The spawned child initiates; the parent answers once it is listening.
    let parent = IpcConnector::new(Role::Responder);
    let child = IpcConnector::new(Role::Initiator)
        .connection(Connection::builder().handler(host.clone()));

    let (parent_conn, _child_conn) = tokio::join!(
        parent.connect(parent_read, parent_write, || async { Ok(()) }),
        child.connect(child_read, child_write, || async {
            host.add_endpoint(worker_endpoint(Arc::downgrade(&host)));
            Ok(())
        }),
    );
    let parent_conn = parent_conn?;
    println!("handshake done: {:?}", parent.state());

    let worker: RemoteProxy = RemoteProxy::bind(parent_conn.clone(), Address::parse("/child/worker")?);
    let sum: i64 = worker.call("Add", (2i64, 40i64)).await?;
    println!("Add(2, 40) = {sum}");

    worker
        .subscribe("Progress", |p: Progress| println!("progress {}/{}", p.done, p.total))
        .await?;
    let steps: u32 = worker.call("Crunch", (5u32,)).await?;
    println!("Crunch finished {steps} steps");

    let options = CallOptions::default().timeout(Duration::from_millis(50));
    match worker.call_with::<_, u32>("Crunch", (100u32,), options).await {
        Err(RpcError::Cancelled) => println!("long Crunch cancelled at its deadline"),
        other => println!("unexpected outcome: {other:?}"),
    }

    parent_conn.teardown().await?;
    println!("teardown done: {:?}", parent.state());
    Ok(())
}
