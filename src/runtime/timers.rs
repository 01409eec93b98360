/// Background timer service
///
/// Turns `RegisterTimer` effects into one-shot tokio-cron-scheduler jobs.
/// When a job fires it does not touch the instance itself: it sends a
/// [`TimerFired`] notice to the engine loop, which delivers `TimerFired` on
/// the timer channel inside a normal transactional pass.

use crate::runtime::channel::ChannelId;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::{mpsc, RwLock};
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

/// A timer whose deadline passed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub instance_id: Uuid,
    pub timer: ChannelId,
}

pub struct TimerService {
    scheduler: Arc<RwLock<JobScheduler>>,
    /// "instance:channel" → scheduler job
    job_uuid_map: Arc<RwLock<HashMap<String, Uuid>>>,
    fired: mpsc::UnboundedSender<TimerFired>,
}

fn job_key(instance_id: Uuid, timer: ChannelId) -> String {
    format!("{}:{}", instance_id, timer.0)
}

impl TimerService {
    pub async fn new(fired: mpsc::UnboundedSender<TimerFired>) -> Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler: Arc::new(RwLock::new(scheduler)),
            job_uuid_map: Arc::new(RwLock::new(HashMap::new())),
            fired,
        })
    }

    pub async fn start(&self) -> Result<()> {
        tracing::info!("⏰ Starting timer service");
        let scheduler = self.scheduler.read().await;
        scheduler.start().await?;
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        tracing::info!("⏹️ Stopping timer service");
        self.job_uuid_map.write().await.clear();
        let mut scheduler = self.scheduler.write().await;
        scheduler.shutdown().await?;
        Ok(())
    }

    /// Arm (or re-arm) the timer of an instance
    pub async fn schedule(&self, instance_id: Uuid, timer: ChannelId, fire_at: DateTime<Utc>) -> Result<()> {
        let key = job_key(instance_id, timer);
        self.cancel(instance_id, timer).await;

        // Deadlines in the past fire on the next scheduler tick
        let delay = (fire_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);

        let fired = self.fired.clone();
        let job_uuid_map = Arc::clone(&self.job_uuid_map);
        let job_key_owned = key.clone();

        let job = Job::new_one_shot_async(delay, move |_uuid, _l| {
            let fired = fired.clone();
            let job_uuid_map = Arc::clone(&job_uuid_map);
            let key = job_key_owned.clone();

            Box::pin(async move {
                job_uuid_map.write().await.remove(&key);
                tracing::debug!("🔔 Timer fired: {}", key);
                if fired.send(TimerFired { instance_id, timer }).is_err() {
                    tracing::warn!("⚠️ Engine loop gone, dropping timer {}", key);
                }
            })
        })?;

        let job_uuid = {
            let scheduler = self.scheduler.write().await;
            scheduler.add(job).await?
        };
        self.job_uuid_map.write().await.insert(key.clone(), job_uuid);

        tracing::debug!("⏳ Timer {} armed for {} ({:?} from now)", key, fire_at, delay);
        Ok(())
    }

    /// Disarm a timer; unknown timers are ignored
    pub async fn cancel(&self, instance_id: Uuid, timer: ChannelId) {
        let key = job_key(instance_id, timer);
        let Some(job_uuid) = self.job_uuid_map.write().await.remove(&key) else {
            return;
        };
        let scheduler = self.scheduler.read().await;
        if let Err(e) = scheduler.remove(&job_uuid).await {
            tracing::warn!("⚠️ Failed to remove timer job {} from scheduler: {}", key, e);
        } else {
            tracing::debug!("🛑 Timer cancelled: {}", key);
        }
    }
}
