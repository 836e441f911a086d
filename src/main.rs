use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use std::{env, thread};

use tokio::{runtime, task::JoinSet};
use tracing::{error, info, warn};
use twilight_model::gateway::payload::incoming::Ready;

use shardlink::config::{self, Config};
use shardlink::gateway::{JsonCodec, SessionContext, TungsteniteConnector};
use shardlink::{
    Category, EventDispatcher, EventFilter, EventKind, Listener, Scheduler, SessionRegistry,
    ShardSession,
};

const DEFAULT_CONFIG_PATH: &str = "./config.toml";
const STATUS_INTERVAL: Duration = Duration::from_secs(300);

fn main() -> Result<(), Box<dyn Error>> {
    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = Config::read(&config_path)?;
    shardlink::log::init_subscriber(&config.logging.filter);

    let dispatch_pool = runtime::Builder::new_multi_thread()
        .worker_threads(config.dispatch.worker_threads)
        .thread_name("shardlink-dispatch")
        .enable_all()
        .build()?;
    let mut waiters = JoinSet::new();

    for (client_name, client_config) in config.clients.iter() {
        let client_handle = spawn_client(client_name, client_config.clone(), &config, &dispatch_pool);
        let client_name = client_name.clone();

        waiters.spawn_blocking_on(
            move || (client_handle.join().is_err(), client_name),
            dispatch_pool.handle(),
        );
    }

    runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(async {
            while let Some(client_join) = waiters.join_next().await {
                let Ok((panicked, client_name)) = client_join else {
                    continue;
                };

                if !panicked {
                    info!(client = %client_name, "client stopped");
                    continue;
                }

                error!(client = %client_name, "client thread panicked, reloading config and restarting");
                let updated = match Config::read(&config_path) {
                    Ok(updated) => updated,
                    Err(err) => {
                        warn!(error = %err, "could not reload config, continuing with initial config");
                        config.clone()
                    }
                };

                if let Some(client_config) = updated.clients.get(&client_name) {
                    let client_handle =
                        spawn_client(&client_name, client_config.clone(), &updated, &dispatch_pool);
                    waiters.spawn_blocking_on(
                        move || (client_handle.join().is_err(), client_name),
                        dispatch_pool.handle(),
                    );
                } else {
                    info!(client = %client_name, "client no longer configured, not restarting");
                }
            }
        });

    Ok(())
}

fn spawn_client(
    client_name: &str,
    client_config: config::Client,
    config: &Config,
    dispatch_pool: &runtime::Runtime,
) -> thread::JoinHandle<()> {
    let name = client_name.to_string();
    let dispatcher = EventDispatcher::new(
        config.dispatch.capacity,
        Scheduler::Runtime(dispatch_pool.handle().clone()),
        Arc::new(config.logging.sink()),
    );

    thread::spawn(move || {
        let thread_local_runtime = match runtime::Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime,
            Err(err) => {
                error!(client = %name, error = %err, "could not build client runtime");
                return;
            }
        };

        thread_local_runtime.block_on(run_client(name, client_config, dispatcher));
    })
}

async fn run_client(name: String, client_config: config::Client, dispatcher: EventDispatcher) {
    let context = SessionContext {
        config: Arc::new(client_config.session_config(&name)),
        connector: Arc::new(TungsteniteConnector),
        codec: Arc::new(JsonCodec::new()),
        dispatcher: dispatcher.clone(),
    };
    let sessions = client_config
        .identify_options()
        .into_iter()
        .map(|options| ShardSession::new(options, context.clone()));

    let registry = match SessionRegistry::register_all(sessions) {
        Ok(registry) => Arc::new(registry),
        Err(err) => {
            error!(client = %name, error = %err, "could not register shards");
            return;
        }
    };

    let listener = Listener::new(dispatcher);
    let _ready = listener.on(EventKind::Ready, |event| async move {
        match event.deserialize::<Ready>() {
            Some(Ok(ready)) => info!(
                client = %event.gateway(),
                shard = event.shard().index(),
                "bot started for {}",
                ready.user.name
            ),
            Some(Err(err)) => warn!(client = %event.gateway(), error = %err, "unreadable ready payload"),
            None => (),
        }
    });
    let _lifecycle = listener.on(EventFilter::category(Category::Lifecycle), |event| async move {
        info!(client = %event.gateway(), shard = event.shard().index(), "{event}");
    });

    info!(client = %name, shards = registry.len(), "starting shards");
    registry.start_all();

    let connections: Vec<_> = registry
        .shards()
        .filter_map(|session| registry.connection(session.shard().index()).ok())
        .collect();
    let mut status = tokio::time::interval(STATUS_INTERVAL);
    let signal = registry.close_signal();
    tokio::pin! {
        let closed = signal.closed();
        let ctrl_c = tokio::signal::ctrl_c();
    }

    loop {
        tokio::select! {
            _ = &mut closed => {
                info!(client = %name, "all shards logged out");
                break;
            }
            result = &mut ctrl_c => {
                if let Err(err) = result {
                    warn!(error = %err, "could not listen for ctrl-c, shutting down");
                }
                info!(client = %name, "logging out");
                registry.close_all(false).await;
                break;
            }
            _ = status.tick() => {
                for connection in &connections {
                    info!(
                        client = %name,
                        shard = connection.shard().index(),
                        connected = connection.is_connected(),
                        latency = ?connection.response_time(),
                        "shard status"
                    );
                }
            }
        }
    }
}
