//! A task stuck `running` by a simulated crash is recovered by `resume`
//! and completes on the next worker pass.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value as Json};
use tem_core::{Ctx, Handler, HandlerError, NewBatch, NewTask, Tem, TaskStatus};

struct Noop;

#[async_trait]
impl Handler for Noop {
    async fn handle(&self, _payload: Json, _ctx: Ctx) -> Result<Json, HandlerError> {
        Ok(json!({ "done": true }))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let tem = Tem::builder().concurrency(1).handler("noop", Arc::new(Noop)).build().await?;

    let batch = tem
        .batches()
        .create(NewBatch {
            code: "CRASH".into(),
            r#type: "noop".into(),
            ..Default::default()
        })
        .await?;

    let task = tem
        .tasks()
        .create(NewTask {
            batch_id: Some(batch.id),
            r#type: "noop".into(),
            payload: json!({}),
            max_attempt: None,
        })
        .await?;

    // Claim directly, without a worker loop running, to simulate a process
    // that crashed mid-execution and left the task stuck `running`.
    tem.tasks().claim(Some(batch.id)).await?;
    let stuck = tem.tasks().get_by_id(task.id).await?;
    assert_eq!(stuck.status, TaskStatus::Running);
    println!("task {} stuck in 'running' after simulated crash", task.id);

    let resumed = tem.batches().resume(batch.id).await?;
    println!("resumed {resumed} task(s) back to pending");

    tem.start().await;
    loop {
        let reloaded = tem.tasks().get_by_id(task.id).await?;
        if reloaded.status == TaskStatus::Completed {
            println!("task {} recovered and completed", task.id);
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }

    tem.stop().await?;
    Ok(())
}
