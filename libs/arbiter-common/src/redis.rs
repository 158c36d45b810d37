//! Redis queue semantics shared by the worker and its clients.
//!
//! Jobs travel as a reliable queue: the worker atomically moves each payload
//! from the inbound list into its own processing list, and removing it from
//! there is the acknowledgement. Replies go to whatever list the requester
//! named in `reply_to`.

use crate::types::{JobData, JobResult};
use redis::{AsyncCommands, RedisResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const PROCESSING_PREFIX: &str = "arbiter:processing";
pub const REPLY_PREFIX: &str = "arbiter:reply";
pub const DEAD_LETTER_QUEUE: &str = "arbiter:dead";
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Replies nobody collects expire after 24 hours
pub const REPLY_TTL_SECONDS: u64 = 86400;

/// Processing list owned by one worker
pub fn processing_queue(worker_id: &str) -> String {
    format!("{}:{}", PROCESSING_PREFIX, worker_id)
}

/// Private reply list for one request
pub fn reply_queue(correlation_id: &str) -> String {
    format!("{}:{}", REPLY_PREFIX, correlation_id)
}

/// Inbound message as it sits in the queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub correlation_id: String,
    pub reply_to: String,
    pub body: serde_json::Value,
}

/// Outbound reply carrying the request's correlation id unchanged
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    pub correlation_id: String,
    pub content_type: String,
    pub body: JobResult,
}

/// A decoded job together with its routing metadata
#[derive(Debug, Clone)]
pub struct Job {
    pub correlation_id: String,
    pub reply_to: String,
    pub data: JobData,
}

/// A payload received into a processing list and not yet acknowledged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub processing_queue: String,
    pub payload: String,
}

impl Delivery {
    pub fn decode(&self) -> serde_json::Result<Job> {
        let envelope: JobEnvelope = serde_json::from_str(&self.payload)?;
        let data: JobData = serde_json::from_value(envelope.body)?;
        Ok(Job {
            correlation_id: envelope.correlation_id,
            reply_to: envelope.reply_to,
            data,
        })
    }
}

fn serialization_error(e: serde_json::Error) -> redis::RedisError {
    redis::RedisError::from((redis::ErrorKind::TypeError, "serialization error", e.to_string()))
}

/// Push a job onto the inbound queue (FIFO with RPUSH + left receive)
pub async fn push_job(
    conn: &mut redis::aio::ConnectionManager,
    queue: &str,
    correlation_id: &str,
    reply_to: &str,
    job: &JobData,
) -> RedisResult<()> {
    let envelope = JobEnvelope {
        correlation_id: correlation_id.to_string(),
        reply_to: reply_to.to_string(),
        body: serde_json::to_value(job).map_err(serialization_error)?,
    };
    let payload = serde_json::to_string(&envelope).map_err(serialization_error)?;

    conn.rpush(queue, payload).await
}

/// Move the next payload into the processing list.
/// Blocks up to `timeout`; `None` means nothing arrived.
pub async fn receive(
    conn: &mut redis::aio::ConnectionManager,
    queue: &str,
    processing_queue: &str,
    timeout: Duration,
) -> RedisResult<Option<Delivery>> {
    let payload: Option<String> = redis::cmd("BLMOVE")
        .arg(queue)
        .arg(processing_queue)
        .arg("LEFT")
        .arg("RIGHT")
        .arg(timeout.as_secs_f64())
        .query_async(conn)
        .await?;

    Ok(payload.map(|payload| Delivery {
        processing_queue: processing_queue.to_string(),
        payload,
    }))
}

/// Acknowledge a delivery by dropping it from the processing list
pub async fn ack(conn: &mut redis::aio::ConnectionManager, delivery: &Delivery) -> RedisResult<()> {
    let _: i64 = conn
        .lrem(&delivery.processing_queue, 1, &delivery.payload)
        .await?;
    Ok(())
}

/// Reject a delivery without requeueing it; the raw payload is kept in the
/// dead-letter list for inspection
pub async fn dead_letter(
    conn: &mut redis::aio::ConnectionManager,
    delivery: &Delivery,
) -> RedisResult<()> {
    let _: i64 = conn.rpush(DEAD_LETTER_QUEUE, &delivery.payload).await?;
    ack(conn, delivery).await
}

/// Return payloads left in a processing list (e.g. after a crash) to the
/// front of the inbound queue. Returns how many were moved.
pub async fn requeue_unacked(
    conn: &mut redis::aio::ConnectionManager,
    processing_queue: &str,
    queue: &str,
) -> RedisResult<usize> {
    let mut moved = 0;
    loop {
        let payload: Option<String> = redis::cmd("LMOVE")
            .arg(processing_queue)
            .arg(queue)
            .arg("RIGHT")
            .arg("LEFT")
            .query_async(conn)
            .await?;
        if payload.is_none() {
            return Ok(moved);
        }
        moved += 1;
    }
}

/// Publish a job result to the requester's reply list
pub async fn publish_reply(
    conn: &mut redis::aio::ConnectionManager,
    reply_to: &str,
    correlation_id: &str,
    result: &JobResult,
) -> RedisResult<()> {
    let envelope = ReplyEnvelope {
        correlation_id: correlation_id.to_string(),
        content_type: JSON_CONTENT_TYPE.to_string(),
        body: result.clone(),
    };
    let payload = serde_json::to_string(&envelope).map_err(serialization_error)?;

    let _: i64 = conn.rpush(reply_to, payload).await?;
    let _: i64 = redis::cmd("EXPIRE")
        .arg(reply_to)
        .arg(REPLY_TTL_SECONDS)
        .query_async(conn)
        .await?;
    Ok(())
}

/// Block until a reply lands in `reply_to` or `timeout` passes
pub async fn wait_reply(
    conn: &mut redis::aio::ConnectionManager,
    reply_to: &str,
    timeout: Duration,
) -> RedisResult<Option<ReplyEnvelope>> {
    let popped: Option<(String, String)> = redis::cmd("BLPOP")
        .arg(reply_to)
        .arg(timeout.as_secs_f64())
        .query_async(conn)
        .await?;

    match popped {
        Some((_key, payload)) => {
            let reply: ReplyEnvelope = serde_json::from_str(&payload).map_err(|e| {
                redis::RedisError::from((
                    redis::ErrorKind::TypeError,
                    "deserialization error",
                    e.to_string(),
                ))
            })?;
            Ok(Some(reply))
        }
        None => Ok(None),
    }
}
