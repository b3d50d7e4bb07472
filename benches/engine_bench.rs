//! Throughput of task submission and completion through the distribution
//! engine, using the in-memory broker so the benchmark measures engine
//! overhead rather than network latency.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use orcd::broker::fake::FakeBroker;
use orcd::broker::{Broker, Channel};
use orcd::engine::model::{PublicTaskStatus, TaskDefinitionInput};
use orcd::engine::TaskDistributionEngine;
use orcd::notify::BrokerNotificationSink;
use orcd::registry::model::{AgentClass, AgentStatus};
use orcd::registry::AgentRegistry;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("build tokio runtime")
}

async fn build_engine() -> (Arc<TaskDistributionEngine>, Arc<dyn Broker>) {
    let broker: Arc<dyn Broker> = Arc::new(FakeBroker::new());
    let registry = Arc::new(AgentRegistry::new(broker.clone()));
    registry
        .register(
            "bench-agent".to_string(),
            AgentClass::Analysis,
            HashSet::new(),
            AgentStatus::Active,
            Default::default(),
        )
        .await
        .unwrap();
    let notify = Arc::new(BrokerNotificationSink::new(broker.clone()));
    let engine = TaskDistributionEngine::new(broker.clone(), registry, notify, Duration::from_secs(90));
    engine.spawn_progress_listener();
    (engine, broker)
}

fn bench_submit_and_complete(c: &mut Criterion) {
    let rt = runtime();

    c.bench_function("submit_task_single_agent", |b| {
        b.to_async(&rt).iter_batched(
            || {},
            |_| async {
                let (engine, _broker) = build_engine().await;
                let input = TaskDefinitionInput::new("generate_summary", AgentClass::Analysis, serde_json::json!({}));
                criterion::black_box(engine.submit_task(input).await.unwrap());
            },
            BatchSize::SmallInput,
        )
    });

    c.bench_function("submit_then_complete_via_task_progress", |b| {
        b.to_async(&rt).iter_batched(
            || {},
            |_| async {
                let (engine, broker) = build_engine().await;
                let input = TaskDefinitionInput::new("generate_summary", AgentClass::Analysis, serde_json::json!({}));
                let task_id = engine.submit_task(input).await.unwrap();
                broker
                    .publish(
                        Channel::TaskProgress,
                        serde_json::json!({
                            "taskId": task_id,
                            "agentId": "bench-agent",
                            "result": {},
                        }),
                    )
                    .await
                    .unwrap();
                loop {
                    if engine.get_task_status(&task_id).await.unwrap() == PublicTaskStatus::Completed {
                        break;
                    }
                    tokio::task::yield_now().await;
                }
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, bench_submit_and_complete);
criterion_main!(benches);
