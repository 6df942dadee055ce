#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;
    use tem_core::{
        BatchInterruptionCriteria, Ctx, Handler, HandlerError, NewBatch, NewTask, RateLimit, Tem, TaskStatus,
    };

    struct Greet;

    #[async_trait]
    impl Handler for Greet {
        async fn handle(&self, payload: serde_json::Value, _ctx: Ctx) -> Result<serde_json::Value, HandlerError> {
            let name = payload["name"].as_str().unwrap_or("stranger");
            Ok(json!({ "msg": format!("Hi, {name}!") }))
        }
    }

    struct FailNTimes {
        seen: Arc<std::sync::Mutex<HashMap<i64, u32>>>,
        invocations: Arc<AtomicUsize>,
        failures_per_task: u32,
    }

    #[async_trait]
    impl Handler for FailNTimes {
        async fn handle(&self, _payload: serde_json::Value, ctx: Ctx) -> Result<serde_json::Value, HandlerError> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            let seen = {
                let mut table = self.seen.lock().unwrap();
                let entry = table.entry(ctx.task_id.0).or_insert(0);
                let seen = *entry;
                *entry += 1;
                seen
            };
            if seen < self.failures_per_task {
                return Err(HandlerError::Retryable("HTTP 500: transient".into()));
            }
            Ok(json!({ "ok": true }))
        }
    }

    struct AlwaysRateLimited;

    #[async_trait]
    impl Handler for AlwaysRateLimited {
        async fn handle(&self, _payload: serde_json::Value, _ctx: Ctx) -> Result<serde_json::Value, HandlerError> {
            Err(HandlerError::Retryable("HTTP 429: rate_limit_exceeded".into()))
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl Handler for AlwaysFails {
        async fn handle(&self, _payload: serde_json::Value, _ctx: Ctx) -> Result<serde_json::Value, HandlerError> {
            Err(HandlerError::NonRetryable("permanently broken".into()))
        }
    }

    struct AlwaysRetryableFails {
        invocations: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Handler for AlwaysRetryableFails {
        async fn handle(&self, _payload: serde_json::Value, _ctx: Ctx) -> Result<serde_json::Value, HandlerError> {
            let n = self.invocations.fetch_add(1, Ordering::SeqCst) + 1;
            Err(HandlerError::Retryable(format!("HTTP 503: attempt {n}")))
        }
    }

    #[tokio::test]
    async fn happy_path_completes_every_task() {
        let tem = Tem::builder()
            .concurrency(3)
            .poll_interval(Duration::from_millis(20))
            .handler("greet", Arc::new(Greet))
            .build()
            .await
            .expect("build");

        let batch = tem
            .batches()
            .create(NewBatch {
                code: "BASIC".into(),
                r#type: "greet".into(),
                ..Default::default()
            })
            .await
            .expect("create batch");

        for name in ["A", "B", "C", "D", "E"] {
            tem.tasks()
                .create(NewTask {
                    batch_id: Some(batch.id),
                    r#type: "greet".into(),
                    payload: json!({ "name": name }),
                    max_attempt: None,
                })
                .await
                .expect("create task");
        }

        tem.start().await;

        let stats = wait_until(|| {
            let tem = tem.clone();
            let batch_id = batch.id;
            async move { tem.batches().get_stats(batch_id).await.unwrap() }
        }, |stats| stats.completed == 5)
        .await;

        assert_eq!(stats.total, 5);
        assert_eq!(stats.completed, 5);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.running, 0);
        assert_eq!(stats.pending, 0);

        let tasks = tem.tasks().list_by_batch(batch.id).await.unwrap();
        for task in tasks {
            assert_eq!(task.status, TaskStatus::Completed);
            let result = task.result.expect("completed task has a result");
            assert!(result["msg"].as_str().unwrap().starts_with("Hi, "));
        }

        tem.stop().await.unwrap();
    }

    #[tokio::test]
    async fn retry_until_success_eventually_completes_all() {
        let seen = Arc::new(std::sync::Mutex::new(HashMap::new()));
        let invocations = Arc::new(AtomicUsize::new(0));

        let tem = Tem::builder()
            .concurrency(2)
            .default_max_attempts(3)
            .poll_interval(Duration::from_millis(10))
            .handler(
                "flaky",
                Arc::new(FailNTimes {
                    seen: seen.clone(),
                    invocations: invocations.clone(),
                    failures_per_task: 2,
                }),
            )
            .build()
            .await
            .expect("build");

        let batch = tem
            .batches()
            .create(NewBatch {
                code: "FLAKY".into(),
                r#type: "flaky".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        for _ in 0..3 {
            tem.tasks()
                .create(NewTask {
                    batch_id: Some(batch.id),
                    r#type: "flaky".into(),
                    payload: json!({}),
                    max_attempt: Some(3),
                })
                .await
                .unwrap();
        }

        tem.start().await;

        let stats = wait_until(
            || {
                let tem = tem.clone();
                let batch_id = batch.id;
                async move { tem.batches().get_stats(batch_id).await.unwrap() }
            },
            |stats| stats.completed + stats.failed == 3,
        )
        .await;

        assert_eq!(stats.completed, 3);
        assert_eq!(stats.failed, 0);
        assert!(invocations.load(Ordering::SeqCst) >= 9);

        tem.stop().await.unwrap();
    }

    #[tokio::test]
    async fn resume_resets_running_tasks_to_pending_and_is_idempotent() {
        let tem = Tem::builder()
            .concurrency(1)
            .handler("noop", Arc::new(Greet))
            .build()
            .await
            .unwrap();

        let batch = tem
            .batches()
            .create(NewBatch {
                code: "CRASH".into(),
                r#type: "noop".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let task = tem
            .tasks()
            .create(NewTask {
                batch_id: Some(batch.id),
                r#type: "noop".into(),
                payload: json!({}),
                max_attempt: None,
            })
            .await
            .unwrap();

        // Simulate a crash mid-execution: claim it directly without a
        // worker loop running, leaving it stuck in `running`.
        let claimed = tem.tasks().claim(Some(batch.id)).await.unwrap().unwrap();
        assert_eq!(claimed.id, task.id);
        assert_eq!(claimed.status, TaskStatus::Running);

        let n = tem.batches().resume(batch.id).await.unwrap();
        assert_eq!(n, 1);
        let reloaded = tem.tasks().get_by_id(task.id).await.unwrap();
        assert_eq!(reloaded.status, TaskStatus::Pending);
        assert_eq!(reloaded.claimed_at, None);

        // Idempotent: nothing left running, second call is a no-op.
        let n_again = tem.batches().resume(batch.id).await.unwrap();
        assert_eq!(n_again, 0);
    }

    #[tokio::test]
    async fn retry_failed_resets_failed_tasks_and_clears_attempt() {
        let tem = Tem::builder().concurrency(1).build().await.unwrap();

        let batch = tem
            .batches()
            .create(NewBatch {
                code: "RETRY".into(),
                r#type: "noop".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let task = tem
            .tasks()
            .create(NewTask {
                batch_id: Some(batch.id),
                r#type: "noop".into(),
                payload: json!({}),
                max_attempt: None,
            })
            .await
            .unwrap();

        tem.tasks().claim(Some(batch.id)).await.unwrap();
        tem.tasks().fail(task.id, "boom").await.unwrap();

        let n = tem.batches().retry_failed(batch.id).await.unwrap();
        assert_eq!(n, 1);
        let reloaded = tem.tasks().get_by_id(task.id).await.unwrap();
        assert_eq!(reloaded.status, TaskStatus::Pending);
        assert_eq!(reloaded.attempt, 0);
        assert_eq!(reloaded.error, None);

        let n_again = tem.batches().retry_failed(batch.id).await.unwrap();
        assert_eq!(n_again, 0);
    }

    #[tokio::test]
    async fn rate_limit_hits_trigger_interruption() {
        let tem = Tem::builder()
            .concurrency(1)
            .poll_interval(Duration::from_millis(5))
            .handler("flaky429", Arc::new(AlwaysRateLimited))
            .build()
            .await
            .unwrap();

        let batch = tem
            .batches()
            .create(NewBatch {
                code: "RL".into(),
                r#type: "flaky429".into(),
                interruption_criteria: Some(BatchInterruptionCriteria {
                    max_rate_limit_hits: Some(5),
                    ..Default::default()
                }),
                ..Default::default()
            })
            .await
            .unwrap();

        for _ in 0..5 {
            tem.tasks()
                .create(NewTask {
                    batch_id: Some(batch.id),
                    r#type: "flaky429".into(),
                    payload: json!({}),
                    max_attempt: Some(1),
                })
                .await
                .unwrap();
        }

        tem.start().await;

        let batch_after = wait_until(
            || {
                let tem = tem.clone();
                let batch_id = batch.id;
                async move { tem.batches().get_by_id(batch_id).await.unwrap() }
            },
            |batch| matches!(batch.status, tem_core::BatchStatus::Interrupted),
        )
        .await;

        assert!(matches!(batch_after.status, tem_core::BatchStatus::Interrupted));
        let log = tem.interruption().get_interruption_log(batch.id).await.unwrap();
        assert_eq!(log[0].reason, tem_core::InterruptionReason::RateLimitHitsExceeded);

        tem.stop().await.unwrap();
    }

    #[tokio::test]
    async fn error_rate_threshold_interrupts_batch() {
        let tem = Tem::builder()
            .concurrency(1)
            .poll_interval(Duration::from_millis(5))
            .handler("broken", Arc::new(AlwaysFails))
            .build()
            .await
            .unwrap();

        let batch = tem
            .batches()
            .create(NewBatch {
                code: "ERR".into(),
                r#type: "broken".into(),
                interruption_criteria: Some(BatchInterruptionCriteria {
                    max_error_rate: Some(0.2),
                    ..Default::default()
                }),
                ..Default::default()
            })
            .await
            .unwrap();

        for _ in 0..5 {
            tem.tasks()
                .create(NewTask {
                    batch_id: Some(batch.id),
                    r#type: "broken".into(),
                    payload: json!({}),
                    max_attempt: Some(1),
                })
                .await
                .unwrap();
        }

        tem.start().await;

        let batch_after = wait_until(
            || {
                let tem = tem.clone();
                let batch_id = batch.id;
                async move { tem.batches().get_by_id(batch_id).await.unwrap() }
            },
            |batch| matches!(batch.status, tem_core::BatchStatus::Interrupted),
        )
        .await;

        assert!(matches!(batch_after.status, tem_core::BatchStatus::Interrupted));

        tem.stop().await.unwrap();
    }

    #[tokio::test]
    async fn concurrency_gate_admits_at_most_configured_slots() {
        use tem_core::ConcurrencyGate;

        let gate = ConcurrencyGate::new(2);
        let a = gate.acquire().await;
        let b = gate.acquire().await;
        assert_eq!(gate.running(), 2);

        let gate2 = gate.clone();
        let acquired_third = Arc::new(AtomicUsize::new(0));
        let acquired_third2 = acquired_third.clone();
        let handle = tokio::spawn(async move {
            let _c = gate2.acquire().await;
            acquired_third2.store(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(acquired_third.load(Ordering::SeqCst), 0, "third acquire must wait");

        drop(a);
        handle.await.unwrap();
        assert_eq!(acquired_third.load(Ordering::SeqCst), 1);

        drop(b);
    }

    #[tokio::test]
    async fn rate_limiter_try_acquire_respects_capacity_and_refills() {
        use tem_core::RateLimiter;

        let limiter = RateLimiter::new(RateLimit {
            capacity: 2,
            window: Duration::from_millis(100),
        });

        assert!(limiter.try_acquire().await);
        assert!(limiter.try_acquire().await);
        assert!(!limiter.try_acquire().await, "bucket should be empty");

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(limiter.try_acquire().await, "bucket should have refilled");
    }

    #[tokio::test]
    async fn max_attempt_cutoff_fails_after_exactly_max_attempt_invocations() {
        let invocations = Arc::new(AtomicUsize::new(0));

        let tem = Tem::builder()
            .concurrency(1)
            .poll_interval(Duration::from_millis(10))
            .handler(
                "doomed",
                Arc::new(AlwaysRetryableFails {
                    invocations: invocations.clone(),
                }),
            )
            .build()
            .await
            .unwrap();

        let batch = tem
            .batches()
            .create(NewBatch {
                code: "CUTOFF".into(),
                r#type: "doomed".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let task = tem
            .tasks()
            .create(NewTask {
                batch_id: Some(batch.id),
                r#type: "doomed".into(),
                payload: json!({}),
                max_attempt: Some(2),
            })
            .await
            .unwrap();

        tem.start().await;

        let reloaded = wait_until(
            || {
                let tem = tem.clone();
                let task_id = task.id;
                async move { tem.tasks().get_by_id(task_id).await.unwrap() }
            },
            |task| task.status == TaskStatus::Failed,
        )
        .await;

        assert_eq!(reloaded.status, TaskStatus::Failed);
        assert_eq!(reloaded.attempt, 2);
        assert_eq!(reloaded.error.as_deref(), Some("HTTP 503: attempt 2"));
        assert_eq!(invocations.load(Ordering::SeqCst), 2);

        tem.stop().await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_claims_admit_exactly_as_many_winners_as_pending_tasks() {
        let tem = Tem::builder().concurrency(1).build().await.unwrap();

        let batch = tem
            .batches()
            .create(NewBatch {
                code: "CLAIM-RACE".into(),
                r#type: "noop".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        const PENDING: usize = 4;
        const CLAIMERS: usize = 20;

        for _ in 0..PENDING {
            tem.tasks()
                .create(NewTask {
                    batch_id: Some(batch.id),
                    r#type: "noop".into(),
                    payload: json!({}),
                    max_attempt: None,
                })
                .await
                .unwrap();
        }

        let handles: Vec<_> = (0..CLAIMERS)
            .map(|_| {
                let tasks = tem.tasks().clone();
                let batch_id = batch.id;
                tokio::spawn(async move { tasks.claim(Some(batch_id)).await.unwrap() })
            })
            .collect();

        let mut winners = Vec::new();
        for handle in handles {
            if let Some(task) = handle.await.unwrap() {
                winners.push(task.id);
            }
        }

        assert_eq!(winners.len(), PENDING, "exactly K of N concurrent claims should win");
        let unique: std::collections::HashSet<_> = winners.iter().collect();
        assert_eq!(unique.len(), PENDING, "no task should be claimed twice");

        let tasks = tem.tasks().list_by_batch(batch.id).await.unwrap();
        assert!(tasks.iter().all(|t| t.status == TaskStatus::Running));
    }

    #[tokio::test]
    async fn durable_store_survives_reopening_against_the_same_file() {
        use rand::{Rng, SeedableRng};
        use rand_chacha::ChaCha8Rng;

        let db_file = tempfile::NamedTempFile::new().expect("temp db file");
        let db_path = db_file.path().to_path_buf();

        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let payloads: Vec<String> = (0..3).map(|_| format!("payload-{}", rng.gen::<u32>())).collect();

        let batch_id = {
            let tem = Tem::builder()
                .concurrency(1)
                .database_path(db_path.clone())
                .build()
                .await
                .expect("build against file");

            let batch = tem
                .batches()
                .create(NewBatch {
                    code: "DURABLE".into(),
                    r#type: "noop".into(),
                    ..Default::default()
                })
                .await
                .unwrap();

            for payload in &payloads {
                tem.tasks()
                    .create(NewTask {
                        batch_id: Some(batch.id),
                        r#type: "noop".into(),
                        payload: json!({ "data": payload }),
                        max_attempt: None,
                    })
                    .await
                    .unwrap();
            }

            // Simulate a crash mid-execution: claim one task directly, with
            // no worker loop running to ever complete it, then drop the
            // engine entirely while it's stuck `running`.
            tem.tasks().claim(Some(batch.id)).await.unwrap();

            tem.stop().await.unwrap();
            batch.id
        };

        // Fresh engine, same file: schema and rows must have survived the
        // first engine going away, including the `_migration` bookkeeping
        // (a second `open_or_create` against this path must not re-run or
        // fail the migration it already applied).
        let tem = Tem::builder()
            .concurrency(1)
            .database_path(db_path)
            .build()
            .await
            .expect("reopen against same file");

        let tasks = tem.tasks().list_by_batch(batch_id).await.unwrap();
        assert_eq!(tasks.len(), 3);
        let running = tasks.iter().filter(|t| t.status == TaskStatus::Running).count();
        assert_eq!(running, 1, "the claimed task should still be running after reopen");

        let stored_payloads: std::collections::HashSet<String> = tasks
            .iter()
            .map(|t| t.payload["data"].as_str().unwrap().to_string())
            .collect();
        for payload in &payloads {
            assert!(stored_payloads.contains(payload));
        }

        let n = tem.batches().resume(batch_id).await.unwrap();
        assert_eq!(n, 1, "resume should recover the task stuck running by the simulated crash");
        let reloaded = tem.tasks().list_by_batch(batch_id).await.unwrap();
        assert!(reloaded.iter().all(|t| t.status != TaskStatus::Running));

        tem.stop().await.unwrap();
    }

    async fn wait_until<T, F, Fut, P>(mut fetch: F, mut predicate: P) -> T
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = T>,
        P: FnMut(&T) -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let value = fetch().await;
            if predicate(&value) {
                return value;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("condition not met before deadline");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}
