use std::time::Duration;
use tracing::{info, warn};

use crate::error::Error;
use crate::helpers::now_ms;
use crate::keys;
use crate::model::{Job, JobKind, JobPayload, Store};
use crate::provider::{KvCommand, KvHandle, KvValue, SetOptions};

/// Chance that a claim also runs the stale-job sweeper.
const SWEEP_PROBABILITY: f64 = 0.1;

const SCAN_BATCH: usize = 64;

/// A claimed job. Holding the handle means holding the global consumer
/// gate; exactly one handle can exist across the fleet at any instant.
#[derive(Debug)]
pub struct JobHandle {
    pub job: Job,
    kv: KvHandle,
    gate_token: String,
    worker_ttl: Duration,
}

impl JobHandle {
    /// Delete the processing record, then release the gate. A crash
    /// between the two leaves the gate to lapse by TTL; the job itself
    /// is already done.
    pub async fn ack(&self) -> Result<(), Error> {
        self.kv.del(&keys::job_processing(&self.job.id)).await?;
        self.release_gate().await
    }

    /// Delete the processing record and optionally push the job back to
    /// the head of the queue so the next claim retries promptly.
    pub async fn fail(&self, requeue: bool) -> Result<(), Error> {
        self.kv.del(&keys::job_processing(&self.job.id)).await?;
        if requeue {
            self.kv
                .lpush(keys::JOBS_QUEUE, &serde_json::to_string(&self.job)?)
                .await?;
        }
        self.release_gate().await
    }

    /// Refresh both the processing-record TTL and the gate TTL. Called
    /// around every long-latency step of an executing job.
    pub async fn heartbeat(&self) -> Result<(), Error> {
        self.kv
            .expire(&keys::job_processing(&self.job.id), self.worker_ttl)
            .await?;
        self.kv.expire(keys::JOBS_GATE, self.worker_ttl).await?;
        Ok(())
    }

    async fn release_gate(&self) -> Result<(), Error> {
        if let Some(value) = self.kv.get(keys::JOBS_GATE).await? {
            if value.into_plain() == self.gate_token {
                self.kv.del(keys::JOBS_GATE).await?;
            }
        }
        Ok(())
    }
}

fn decode_job(value: &KvValue) -> Option<Job> {
    match value.decode::<Job>() {
        Ok(job) => Some(job),
        Err(error) => {
            warn!("dropping unparsable queue entry: {}", error);
            None
        },
    }
}

fn is_fresh(job: &Job, max_age: Duration) -> bool {
    let age_ms = now_ms().saturating_sub(job.enqueued_at);
    age_ms <= max_age.as_millis() as i64
}

impl Store<Job> {
    /// Append a job to the tail of the FIFO. With a dedup key, the
    /// enqueue is suppressed (returns None) while another writer owns
    /// that key.
    pub async fn enqueue(
        &self,
        kind: JobKind,
        payload: JobPayload,
        dedupe: Option<(&str, Duration)>,
    ) -> Result<Option<Job>, Error> {
        if let Some((raw, ttl)) = dedupe {
            let accepted = self
                .kv
                .set(&keys::job_dedupe(raw), "1", SetOptions::nx_ex(ttl))
                .await?;
            if !accepted {
                return Ok(None);
            }
        }

        let job = Job {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            payload,
            attempts: 0,
            enqueued_at: now_ms(),
            last_attempt_at: None,
        };
        self.kv
            .rpush(keys::JOBS_QUEUE, &serde_json::to_string(&job)?)
            .await?;
        info!("enqueued {} job {}", kind, &job.id);
        Ok(Some(job))
    }

    /// Claim the head of the queue under the global gate. Returns None
    /// when another consumer holds the gate or the queue is empty.
    pub async fn claim_next(
        &self,
        worker_ttl: Duration,
        max_age: Duration,
    ) -> Result<Option<JobHandle>, Error> {
        let gate_token = match self.acquire_gate(worker_ttl).await? {
            Some(token) => token,
            None => return Ok(None),
        };

        if rand::random::<f64>() < SWEEP_PROBABILITY {
            if let Err(error) = self.sweep(max_age).await {
                warn!("stale-job sweep failed: {}", error);
            }
        }

        loop {
            let head = match self.kv.lpop(keys::JOBS_QUEUE).await? {
                Some(head) => head,
                None => {
                    self.release_gate(&gate_token).await?;
                    return Ok(None);
                },
            };

            // unparsable entries are dropped, the next entry is tried
            let job = match decode_job(&head) {
                Some(job) => job,
                None => continue,
            };

            return Ok(Some(
                self.start_processing(job, gate_token, worker_ttl).await?,
            ));
        }
    }

    /// Claim one specific job for synchronous execution on the HTTP
    /// claim path. Scans at most `max_skip` entries; the non-matching
    /// ones are re-appended at the tail in their original order.
    pub async fn claim_by_id(
        &self,
        job_id: &str,
        max_skip: usize,
        worker_ttl: Duration,
        max_age: Duration,
    ) -> Result<Option<JobHandle>, Error> {
        let gate_token = match self.acquire_gate(worker_ttl).await? {
            Some(token) => token,
            None => return Ok(None),
        };

        let mut skipped: Vec<String> = Vec::new();
        let mut found: Option<Job> = None;

        for _ in 0..=max_skip {
            let head = match self.kv.lpop(keys::JOBS_QUEUE).await? {
                Some(head) => head,
                None => break,
            };
            let job = match decode_job(&head) {
                Some(job) => job,
                None => continue,
            };
            if job.id == job_id {
                found = Some(job);
                break;
            }
            // stale entries are swept here instead of rotating forever
            if is_fresh(&job, max_age) {
                skipped.push(serde_json::to_string(&job)?);
            } else {
                info!("sweeping stale job {} during targeted claim", &job.id);
            }
        }

        for raw in &skipped {
            self.kv.rpush(keys::JOBS_QUEUE, raw).await?;
        }

        match found {
            Some(job) => Ok(Some(
                self.start_processing(job, gate_token, worker_ttl).await?,
            )),
            None => {
                self.release_gate(&gate_token).await?;
                Ok(None)
            },
        }
    }

    /// Drop jobs older than `max_age` and unparsable entries, rebuild
    /// the queue from the kept entries in order. Returns the number of
    /// dropped entries.
    pub async fn sweep(&self, max_age: Duration) -> Result<u64, Error> {
        let entries = self.kv.lrange(keys::JOBS_QUEUE, 0, -1).await?;
        let mut kept: Vec<String> = Vec::new();
        for entry in &entries {
            if let Some(job) = decode_job(entry) {
                if is_fresh(&job, max_age) {
                    kept.push(serde_json::to_string(&job)?);
                }
            }
        }

        let dropped = entries.len() as u64 - kept.len() as u64;
        if dropped > 0 {
            let mut commands = vec![KvCommand::Del {
                key: keys::JOBS_QUEUE.to_string(),
            }];
            commands.extend(kept.into_iter().map(|value| KvCommand::RPush {
                key: keys::JOBS_QUEUE.to_string(),
                value,
            }));
            self.kv.pipeline(commands).await?;
            info!("stale-job sweeper dropped {} entries", dropped);
        }
        Ok(dropped)
    }

    pub async fn size(&self) -> Result<u64, Error> {
        self.kv.llen(keys::JOBS_QUEUE).await
    }

    pub async fn peek(&self, limit: usize) -> Result<Vec<Job>, Error> {
        let entries = self
            .kv
            .lrange(keys::JOBS_QUEUE, 0, limit as i64 - 1)
            .await?;
        Ok(entries.iter().filter_map(decode_job).collect())
    }

    pub async fn clear(&self) -> Result<(), Error> {
        self.kv.del(keys::JOBS_QUEUE).await?;
        Ok(())
    }

    /// Whether a job of the given kind (or any kind) currently holds a
    /// processing record. Drives the status endpoints.
    pub async fn is_processing(
        &self,
        kind: Option<JobKind>,
    ) -> Result<bool, Error> {
        let mut cursor = 0;
        loop {
            let (next, page) = self
                .kv
                .scan(cursor, keys::JOBS_PROCESSING_PATTERN, SCAN_BATCH)
                .await?;
            for key in page {
                match kind {
                    None => return Ok(true),
                    Some(kind) => {
                        if let Some(value) = self.kv.get(&key).await? {
                            if let Ok(job) = value.decode::<Job>() {
                                if job.kind == kind {
                                    return Ok(true);
                                }
                            }
                        }
                    },
                }
            }
            if next == 0 {
                return Ok(false);
            }
            cursor = next;
        }
    }

    async fn start_processing(
        &self,
        mut job: Job,
        gate_token: String,
        worker_ttl: Duration,
    ) -> Result<JobHandle, Error> {
        job.attempts += 1;
        job.last_attempt_at = Some(now_ms());
        self.kv
            .set(
                &keys::job_processing(&job.id),
                &serde_json::to_string(&job)?,
                SetOptions::ex(worker_ttl),
            )
            .await?;
        Ok(JobHandle {
            job,
            kv: self.kv.clone(),
            gate_token,
            worker_ttl,
        })
    }

    async fn acquire_gate(
        &self,
        worker_ttl: Duration,
    ) -> Result<Option<String>, Error> {
        let token = format!("{}-{:08x}", now_ms(), rand::random::<u32>());
        let acquired = self
            .kv
            .set(keys::JOBS_GATE, &token, SetOptions::nx_ex(worker_ttl))
            .await?;
        Ok(acquired.then_some(token))
    }

    async fn release_gate(&self, token: &str) -> Result<(), Error> {
        if let Some(value) = self.kv.get(keys::JOBS_GATE).await? {
            if value.into_plain() == token {
                self.kv.del(keys::JOBS_GATE).await?;
            }
        }
        Ok(())
    }
}
