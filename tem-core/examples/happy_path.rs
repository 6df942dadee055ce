//! Five tasks, one handler, all complete.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value as Json};
use tem_core::{Ctx, Handler, HandlerError, NewBatch, NewTask, Tem};

struct Greet;

#[async_trait]
impl Handler for Greet {
    async fn handle(&self, payload: Json, _ctx: Ctx) -> Result<Json, HandlerError> {
        let name = payload["name"].as_str().unwrap_or("stranger");
        Ok(json!({ "msg": format!("Hi, {name}!") }))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let tem = Tem::builder()
        .concurrency(3)
        .default_max_attempts(3)
        .handler("greet", Arc::new(Greet))
        .build()
        .await?;

    let batch = tem
        .batches()
        .create(NewBatch {
            code: "BASIC".into(),
            r#type: "greet".into(),
            ..Default::default()
        })
        .await?;

    for name in ["A", "B", "C", "D", "E"] {
        tem.tasks()
            .create(NewTask {
                batch_id: Some(batch.id),
                r#type: "greet".into(),
                payload: json!({ "name": name }),
                max_attempt: None,
            })
            .await?;
    }

    tem.start().await;

    loop {
        let stats = tem.batches().get_stats(batch.id).await?;
        tracing::info!(?stats, "polling batch");
        if stats.completed + stats.failed == stats.total {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }

    for task in tem.tasks().list_by_batch(batch.id).await? {
        println!("task {}: {:?}", task.id, task.result);
    }

    tem.stop().await?;
    Ok(())
}
