use std::{
    process,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use futures::future::join_all;
use querycache::{
    BoxError, InvalidateFilters, MutationOptions, MutationRunner, QueryClient, QueryError,
    QueryHandle, QueryOptions, config, query_key, telemetry,
};
use thiserror::Error;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[derive(Debug, Error)]
enum AppError {
    #[error("failed to load configuration: {0}")]
    Config(#[from] config::LoadError),
    #[error(transparent)]
    Telemetry(#[from] telemetry::TelemetryError),
    #[error("query failed: {0}")]
    Query(#[from] QueryError),
}

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Demo(Box::<config::DemoArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Demo(args) => run_demo(settings, *args).await,
    }
}

#[derive(Debug)]
struct TodoList {
    revision: u32,
    items: Vec<String>,
}

/// Simulated backend: fails the first `failures` calls, then serves an
/// increasing revision on every call.
struct Backend {
    calls: AtomicU32,
    failures: u32,
    latency: Duration,
}

impl Backend {
    async fn fetch(&self) -> Result<TodoList, BoxError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;
        if call < self.failures {
            return Err(format!("backend unavailable (call {})", call + 1).into());
        }
        let revision = call + 1 - self.failures;
        Ok(TodoList {
            revision,
            items: (1..=revision).map(|n| format!("todo #{n}")).collect(),
        })
    }
}

async fn settled(handle: &QueryHandle<TodoList>) -> Result<Arc<TodoList>, AppError> {
    let state = handle.wait_for(|state| state.is_settled()).await;
    match (state.data, state.error) {
        (Some(data), _) => Ok(data),
        (None, Some(error)) => Err(error.into()),
        (None, None) => Err(QueryError::Cancelled.into()),
    }
}

async fn run_demo(settings: config::Settings, args: config::DemoArgs) -> Result<(), AppError> {
    let client: QueryClient<TodoList> = QueryClient::new(settings.client.clone());
    let backend = Arc::new(Backend {
        calls: AtomicU32::new(0),
        failures: args.failures,
        latency: Duration::from_millis(args.latency_ms),
    });

    let options = {
        let backend = Arc::clone(&backend);
        QueryOptions::from_future(move |_key| {
            let backend = Arc::clone(&backend);
            async move { backend.fetch().await }
        })
        .with_config(client.config())
    };

    info!(consumers = args.consumers, failures = args.failures, "Attaching consumers");
    let key = query_key!["todos", { "filter": "all" }];
    let handles: Vec<_> = (0..args.consumers.max(1))
        .map(|_| client.query(key.clone(), options.clone()))
        .collect();
    for handle in &handles {
        let data = settled(handle).await?;
        info!(revision = data.revision, items = data.items.len(), "Consumer settled");
    }
    info!(
        backend_calls = backend.calls.load(Ordering::SeqCst),
        "Shared execution finished"
    );

    let report = client.invalidate_queries(InvalidateFilters::key(["todos"]));
    info!(
        marked_stale = report.marked_stale,
        triggered = report.triggered,
        "Invalidated todos"
    );
    let refreshed = handles[0]
        .wait_for(|state| {
            state.is_settled() && state.data.as_ref().is_some_and(|data| data.revision >= 2)
        })
        .await;
    if let Some(data) = refreshed.data.as_ref() {
        info!(revision = data.revision, "Refetched after invalidation");
    }

    client.gate().set_online(false);
    handles[0].refetch();
    let paused = handles[0].wait_for(|state| state.is_paused).await;
    info!(failure_count = paused.failure_count, "Refetch paused while offline");
    client.gate().set_online(true);
    let resumed = settled(&handles[0]).await?;
    info!(revision = resumed.revision, "Refetch resumed after reconnect");

    run_mutations(&client, &args).await;

    drop(handles);
    info!(
        backend_calls = backend.calls.load(Ordering::SeqCst),
        cached = client.get_query_data(&key).is_some(),
        "Demo finished"
    );
    Ok(())
}

async fn run_mutations(client: &QueryClient<TodoList>, args: &config::DemoArgs) {
    let latency = Duration::from_millis(args.latency_ms);
    let runner = MutationRunner::new(
        move |title: String| async move {
            tokio::time::sleep(latency).await;
            Ok::<_, BoxError>(title.len())
        },
        MutationOptions::default()
            .with_config(client.config())
            .with_map_operator(args.operator),
        client.gate().clone(),
    );

    let calls: Vec<_> = (1..=args.mutations)
        .map(|n| runner.mutate(format!("new todo {n}")))
        .collect();
    for (n, outcome) in join_all(calls).await.into_iter().enumerate() {
        match outcome {
            Ok(length) => info!(call = n + 1, operator = %args.operator, length = *length, "Mutation resolved"),
            Err(error) => warn!(call = n + 1, operator = %args.operator, error = %error, "Mutation dropped"),
        }
    }

    let state = runner.state();
    info!(status = ?state.status, variables = ?state.variables, "Final mutation state");

    let report = client.invalidate_queries(InvalidateFilters::key(["todos"]));
    info!(triggered = report.triggered, "Invalidated todos after mutations");
}
