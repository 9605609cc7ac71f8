//! Redis queue intake
//!
//! Jobs are popped from `runner:queue`. Each reply is stored under
//! `runner:result:<request_id>` for an hour and published on
//! `runner:results`. The queue itself is the backlog, so a job is only popped
//! while this worker can hold it, and waits for a gate slot however long that
//! takes.

use std::sync::Arc;

use anyhow::{Context, Result};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::gate::ExecutionService;
use crate::protocol::{RunJob, RunReply};

pub const QUEUE_NAME: &str = "runner:queue";
pub const RESULT_CHANNEL: &str = "runner:results";
pub const RESULT_KEY_PREFIX: &str = "runner:result:";

const RESULT_TTL_SECS: u64 = 3600;
/// BLPOP timeout, so shutdown is noticed between polls
const POLL_TIMEOUT_SECS: f64 = 5.0;

pub fn result_key(request_id: Uuid) -> String {
    format!("{}{}", RESULT_KEY_PREFIX, request_id)
}

/// Consume the queue until `shutdown` fires, then wait for in-flight jobs
pub async fn run_worker(
    redis_url: &str,
    service: Arc<ExecutionService>,
    shutdown: CancellationToken,
) -> Result<()> {
    let client = redis::Client::open(redis_url).context("Invalid REDIS_URL")?;
    let Some(mut conn) = get_redis_connection(&client, &shutdown).await else {
        return Ok(());
    };
    info!("Connected to Redis, waiting for jobs on {}", QUEUE_NAME);

    let tracker = TaskTracker::new();

    while !shutdown.is_cancelled() {
        let popped: Option<(String, String)> = match conn.blpop(QUEUE_NAME, POLL_TIMEOUT_SECS).await
        {
            Ok(popped) => popped,
            Err(e) => {
                warn!("Redis BLPOP failed: {}. Attempting to reconnect...", e);
                match get_redis_connection(&client, &shutdown).await {
                    Some(new_conn) => conn = new_conn,
                    None => break,
                }
                continue;
            }
        };
        let Some((_, payload)) = popped else {
            continue;
        };

        let mut job = match serde_json::from_str::<RunJob>(&payload) {
            Ok(job) => job,
            Err(e) => {
                error!("Discarding malformed job: {}", e);
                continue;
            }
        };
        let request_id = job.request_id();
        let request = match job.into_request() {
            Ok(request) => request,
            Err(e) => {
                warn!("Rejecting job {}: {}", request_id, e);
                let reply = RunReply::failed(request_id, &e);
                if let Err(e) = store_reply(&mut conn, &client, &reply).await {
                    error!("Failed to store reply for request {}: {:#}", request_id, e);
                }
                continue;
            }
        };
        info!(
            "Received job: request_id={}, language={}",
            request.request_id, request.language
        );

        let admission = match service.gate().acquire(&shutdown).await {
            Ok(admission) => admission,
            Err(_) => {
                // Shutting down: hand the job back for the next worker
                if let Err(e) = conn.lpush::<_, _, ()>(QUEUE_NAME, &payload).await {
                    error!("Failed to requeue job {}: {}", request.request_id, e);
                }
                break;
            }
        };

        let service = Arc::clone(&service);
        let client = client.clone();
        let mut job_conn = conn.clone();
        let cancel = shutdown.child_token();
        tracker.spawn(async move {
            let outcome = service.run_admitted(&request, admission, &cancel).await;
            let reply = RunReply::new(request.request_id, outcome);
            if let Err(e) = store_reply(&mut job_conn, &client, &reply).await {
                error!(
                    "Failed to store reply for request {}: {:#}",
                    request.request_id, e
                );
            }
        });
    }

    tracker.close();
    info!("Queue worker stopping, waiting for {} jobs", tracker.len());
    tracker.wait().await;
    Ok(())
}

async fn store_reply(
    conn: &mut MultiplexedConnection,
    client: &redis::Client,
    reply: &RunReply,
) -> Result<()> {
    let reply_json = serde_json::to_string(reply)?;
    let key = result_key(reply.request_id);

    // Stored for polling, expires in 1 hour
    if let Err(e) = conn
        .set_ex::<_, _, ()>(&key, &reply_json, RESULT_TTL_SECS)
        .await
    {
        warn!("Redis set_ex failed: {}. Reconnecting and retrying...", e);
        let mut new_conn = client.get_multiplexed_async_connection().await?;
        new_conn
            .set_ex::<_, _, ()>(&key, &reply_json, RESULT_TTL_SECS)
            .await?;
        *conn = new_conn;
    }

    if let Err(e) = conn
        .publish::<_, _, ()>(RESULT_CHANNEL, &reply_json)
        .await
    {
        warn!("Redis publish failed: {}. Reconnecting and retrying...", e);
        let mut new_conn = client.get_multiplexed_async_connection().await?;
        new_conn
            .publish::<_, _, ()>(RESULT_CHANNEL, &reply_json)
            .await?;
        *conn = new_conn;
    }

    Ok(())
}

/// Connect, retrying every 3 seconds; `None` once shutdown is requested
async fn get_redis_connection(
    client: &redis::Client,
    shutdown: &CancellationToken,
) -> Option<MultiplexedConnection> {
    loop {
        match client.get_multiplexed_async_connection().await {
            Ok(conn) => return Some(conn),
            Err(e) => {
                warn!(
                    "Failed to connect to Redis: {}. Retrying in 3 seconds...",
                    e
                );
                tokio::select! {
                    _ = shutdown.cancelled() => return None,
                    _ = sleep(Duration::from_secs(3)) => {}
                }
            }
        }
    }
}
