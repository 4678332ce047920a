use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use metrics_util::debugging::DebuggingRecorder;
use querycache::{
    BoxError, ClientConfig, InvalidateFilters, MapOperator, MutationOptions, MutationRunner,
    NetworkGate, QueryClient, QueryOptions, query_key,
};
use serial_test::serial;

#[tokio::test]
#[serial]
async fn engine_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");
    querycache::telemetry::describe_metrics();

    let client: QueryClient<u32> = QueryClient::new(ClientConfig::default());
    let calls = Arc::new(AtomicU32::new(0));
    let options = {
        let calls = Arc::clone(&calls);
        QueryOptions::from_future(move |_key| {
            let calls = Arc::clone(&calls);
            async move {
                let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::time::sleep(Duration::from_millis(5)).await;
                if call == 1 {
                    return Err::<u32, BoxError>("first call fails".into());
                }
                Ok(call)
            }
        })
        .with_retry(1u32)
        .with_stale_time(Duration::from_secs(60))
    };

    // Fetch, retry and dedupe join
    let first = client.query(query_key!["todos"], options.clone());
    let (fetched, _) = tokio::join!(
        client.fetch_query(query_key!["todos"], options.clone()),
        first.wait_for(|state| state.is_settled()),
    );
    fetched.expect("fetch joins the running execution");

    // Cache hit
    let _second = client.query(query_key!["todos"], options);
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Invalidation
    client.invalidate_queries(InvalidateFilters::key(["todos"]));
    first
        .wait_for(|state| state.is_settled() && state.data.as_deref() == Some(&3))
        .await;

    // Mutation
    let runner = MutationRunner::new(
        |n: u32| async move { Ok::<_, BoxError>(n) },
        MutationOptions::default().with_map_operator(MapOperator::Concat),
        NetworkGate::default(),
    );
    runner.mutate(1).await.expect("mutation resolves");

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "querycache_fetch_total",
        "querycache_cache_hit_total",
        "querycache_dedupe_join_total",
        "querycache_retry_total",
        "querycache_invalidated_total",
        "querycache_mutation_total",
        "querycache_fetch_ms",
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}
