//! The schedule engine: tick loop, hydration, and the job API.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use caseflow_core::Result;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use crate::persistence::{PersistedJob, SchedulerDb};
use crate::triggers::Trigger;

/// What the engine hands the runner when a job fires.
#[derive(Debug, Clone)]
pub struct ScheduledJob {
    pub id: i64,
    pub name: String,
    pub trigger: Trigger,
}

/// The work side of the engine, injected at construction. The engine
/// never learns what a fire actually does.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, job: &ScheduledJob) -> Result<()>;
}

struct JobState {
    name: String,
    trigger: Trigger,
    paused: bool,
    next_fire: Option<DateTime<Utc>>,
}

/// Read-only view of a live job, for the API edge.
#[derive(Debug, Clone, serde::Serialize)]
pub struct JobSnapshot {
    pub id: i64,
    pub name: String,
    pub paused: bool,
    pub next_fire: Option<DateTime<Utc>>,
}

struct Inner {
    db: SchedulerDb,
    jobs: Mutex<HashMap<i64, JobState>>,
    runner: Arc<dyn JobRunner>,
    tick_interval: Duration,
    grace: chrono::Duration,
}

pub struct ScheduleEngine {
    inner: Arc<Inner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ScheduleEngine {
    pub fn new(
        db: SchedulerDb,
        runner: Arc<dyn JobRunner>,
        tick_secs: u64,
        misfire_grace_secs: u64,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                db,
                jobs: Mutex::new(HashMap::new()),
                runner,
                tick_interval: Duration::from_secs(tick_secs.max(1)),
                grace: chrono::Duration::seconds(misfire_grace_secs as i64),
            }),
            handle: Mutex::new(None),
        }
    }

    /// Hydrate persisted jobs and start the tick loop. Calling start on
    /// a running engine is a no-op.
    pub fn start(&self) -> Result<()> {
        let mut handle = self.handle.lock().unwrap();
        if handle.is_some() {
            tracing::debug!("schedule engine already running");
            return Ok(());
        }
        self.hydrate()?;

        let inner = Arc::clone(&self.inner);
        *handle = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(inner.tick_interval);
            loop {
                interval.tick().await;
                tick_once(&inner);
            }
        }));
        tracing::info!(
            "schedule engine started (tick {:?}, grace {}s)",
            self.inner.tick_interval,
            self.inner.grace.num_seconds()
        );
        Ok(())
    }

    pub fn stop(&self) {
        let mut handle = self.handle.lock().unwrap();
        if let Some(h) = handle.take() {
            h.abort();
            tracing::info!("schedule engine stopped");
        }
    }

    /// Reload every persisted job and recompute stale fire times. A
    /// one-shot job whose date passed while the engine was down cannot
    /// fire anymore; it is disabled, not silently run late.
    fn hydrate(&self) -> Result<()> {
        let now = Utc::now();
        let persisted = self.inner.db.load_all()?;
        let mut jobs = self.inner.jobs.lock().unwrap();
        jobs.clear();
        for job in persisted {
            let mut paused = job.paused;
            let next_fire = match job.next_fire.filter(|t| *t > now) {
                Some(t) => Some(t),
                None => match job.trigger.next_fire(now) {
                    Some(t) => Some(t),
                    None => {
                        tracing::warn!("job {} ({}) can no longer fire, disabling", job.id, job.name);
                        paused = true;
                        None
                    }
                },
            };
            self.inner.db.set_next_fire(job.id, next_fire)?;
            if paused != job.paused {
                self.inner.db.set_paused(job.id, paused)?;
            }
            jobs.insert(
                job.id,
                JobState { name: job.name, trigger: job.trigger, paused, next_fire },
            );
        }
        tracing::info!("hydrated {} scheduled jobs", jobs.len());
        Ok(())
    }

    /// Register a job. Validation happens before anything is written,
    /// and re-creating an existing id replaces it.
    pub fn create_job(&self, id: i64, name: &str, trigger: Trigger) -> Result<()> {
        let now = Utc::now();
        trigger.validate(now)?;
        let next_fire = trigger.next_fire(now);
        self.inner.db.upsert_job(&PersistedJob {
            id,
            name: name.to_string(),
            trigger: trigger.clone(),
            paused: false,
            next_fire,
        })?;
        let mut jobs = self.inner.jobs.lock().unwrap();
        jobs.insert(
            id,
            JobState { name: name.to_string(), trigger, paused: false, next_fire },
        );
        tracing::info!("job {id} ({name}) scheduled, next fire {next_fire:?}");
        Ok(())
    }

    /// Same contract as `create_job`: a modify for an unknown id creates it.
    pub fn modify_job(&self, id: i64, name: &str, trigger: Trigger) -> Result<()> {
        self.create_job(id, name, trigger)
    }

    /// The persisted flag is written even when the job is not live, so
    /// the intent survives a restart and a later hydrate respects it.
    pub fn pause_job(&self, id: i64) -> Result<()> {
        let mut jobs = self.inner.jobs.lock().unwrap();
        self.inner.db.set_paused(id, true)?;
        match jobs.get_mut(&id) {
            Some(state) => {
                state.paused = true;
                tracing::info!("job {id} paused");
            }
            None => tracing::debug!("pause for job {id} recorded, not live"),
        }
        Ok(())
    }

    /// Resume recomputes the fire time from now, never from the past.
    /// Like pause, the persisted flag is written unconditionally.
    pub fn resume_job(&self, id: i64) -> Result<()> {
        let mut jobs = self.inner.jobs.lock().unwrap();
        self.inner.db.set_paused(id, false)?;
        match jobs.get_mut(&id) {
            Some(state) => {
                state.paused = false;
                state.next_fire = state.trigger.next_fire(Utc::now());
                self.inner.db.set_next_fire(id, state.next_fire)?;
                tracing::info!("job {id} resumed, next fire {:?}", state.next_fire);
            }
            None => tracing::debug!("resume for job {id} recorded, not live"),
        }
        Ok(())
    }

    pub fn remove_job(&self, id: i64) -> Result<()> {
        let mut jobs = self.inner.jobs.lock().unwrap();
        jobs.remove(&id);
        self.inner.db.remove_job(id)?;
        Ok(())
    }

    pub fn list_jobs(&self) -> Vec<JobSnapshot> {
        let jobs = self.inner.jobs.lock().unwrap();
        let mut out: Vec<JobSnapshot> = jobs
            .iter()
            .map(|(id, s)| JobSnapshot {
                id: *id,
                name: s.name.clone(),
                paused: s.paused,
                next_fire: s.next_fire,
            })
            .collect();
        out.sort_by_key(|j| j.id);
        out
    }

    /// One scheduling pass. The loop calls this every tick; tests call
    /// it directly and may await the returned run handles.
    pub fn tick(&self) -> Vec<JoinHandle<()>> {
        tick_once(&self.inner)
    }
}

fn tick_once(inner: &Inner) -> Vec<JoinHandle<()>> {
    let now = Utc::now();
    let mut due = Vec::new();
    {
        let mut jobs = inner.jobs.lock().unwrap();
        for (id, state) in jobs.iter_mut() {
            if state.paused {
                continue;
            }
            let Some(fire) = state.next_fire else { continue };
            if fire > now {
                continue;
            }
            if now - fire > inner.grace {
                tracing::warn!(
                    "job {id} ({}) missed its fire at {fire} beyond the {}s grace, skipping",
                    state.name,
                    inner.grace.num_seconds()
                );
            } else {
                due.push(ScheduledJob {
                    id: *id,
                    name: state.name.clone(),
                    trigger: state.trigger.clone(),
                });
            }
            state.next_fire = state.trigger.next_fire(now);
            if state.next_fire.is_none() {
                state.paused = true;
            }
            if let Err(e) = inner.db.set_next_fire(*id, state.next_fire) {
                tracing::error!("persisting fire time for job {id} failed: {e}");
            }
            if state.paused {
                if let Err(e) = inner.db.set_paused(*id, true) {
                    tracing::error!("persisting pause for job {id} failed: {e}");
                }
            }
        }
    }

    due.into_iter()
        .map(|job| {
            let runner = Arc::clone(&inner.runner);
            tokio::spawn(async move {
                tracing::info!("job {} ({}) fired", job.id, job.name);
                if let Err(e) = runner.run(&job).await {
                    tracing::error!("job {} ({}) run failed: {e}", job.id, job.name);
                }
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct CountingRunner {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl JobRunner for CountingRunner {
        async fn run(&self, _job: &ScheduledJob) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn engine(runner: Arc<CountingRunner>) -> ScheduleEngine {
        ScheduleEngine::new(SchedulerDb::open_in_memory().unwrap(), runner, 1, 30)
    }

    /// Point a job's fire time into the past to make the next tick see it.
    fn backdate(engine: &ScheduleEngine, id: i64, secs_ago: i64) {
        let mut jobs = engine.inner.jobs.lock().unwrap();
        let state = jobs.get_mut(&id).unwrap();
        state.next_fire = Some(Utc::now() - chrono::Duration::seconds(secs_ago));
    }

    #[tokio::test]
    async fn test_due_job_fires_and_reschedules() {
        let runner = Arc::new(CountingRunner::default());
        let engine = engine(runner.clone());
        engine.create_job(1, "hourly", Trigger::Interval { seconds: 3600 }).unwrap();
        backdate(&engine, 1, 5);

        for handle in engine.tick() {
            handle.await.unwrap();
        }
        assert_eq!(runner.runs.load(Ordering::SeqCst), 1);

        let jobs = engine.list_jobs();
        assert!(jobs[0].next_fire.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn test_misfire_beyond_grace_is_skipped() {
        let runner = Arc::new(CountingRunner::default());
        let engine = engine(runner.clone());
        engine.create_job(1, "hourly", Trigger::Interval { seconds: 3600 }).unwrap();
        backdate(&engine, 1, 120);

        assert!(engine.tick().is_empty());
        assert_eq!(runner.runs.load(Ordering::SeqCst), 0);
        // the missed fire is dropped, not replayed
        assert!(engine.list_jobs()[0].next_fire.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn test_date_job_disables_after_firing() {
        let runner = Arc::new(CountingRunner::default());
        let engine = engine(runner.clone());
        engine
            .create_job(1, "once", Trigger::Date { run_at: Utc::now() + chrono::Duration::hours(1) })
            .unwrap();
        backdate(&engine, 1, 2);

        for handle in engine.tick() {
            handle.await.unwrap();
        }
        assert_eq!(runner.runs.load(Ordering::SeqCst), 1);
        let job = &engine.list_jobs()[0];
        assert!(job.paused);
        assert!(job.next_fire.is_none());
    }

    #[tokio::test]
    async fn test_paused_job_does_not_fire() {
        let runner = Arc::new(CountingRunner::default());
        let engine = engine(runner.clone());
        engine.create_job(1, "hourly", Trigger::Interval { seconds: 3600 }).unwrap();
        engine.pause_job(1).unwrap();
        backdate(&engine, 1, 5);

        assert!(engine.tick().is_empty());
        assert_eq!(runner.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_pause_unknown_job_is_noop() {
        let engine = engine(Arc::new(CountingRunner::default()));
        engine.pause_job(404).unwrap();
        engine.resume_job(404).unwrap();
        engine.remove_job(404).unwrap();
    }

    #[tokio::test]
    async fn test_create_rejects_past_date_without_persisting() {
        let engine = engine(Arc::new(CountingRunner::default()));
        let err = engine
            .create_job(1, "late", Trigger::Date { run_at: Utc::now() - chrono::Duration::hours(1) })
            .unwrap_err();
        assert!(matches!(err, caseflow_core::CaseflowError::InvalidArgument(_)));
        assert!(engine.list_jobs().is_empty());
        assert!(engine.inner.db.load_all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pause_persists_for_job_not_in_live_map() {
        let engine = engine(Arc::new(CountingRunner::default()));
        engine.create_job(1, "hourly", Trigger::Interval { seconds: 3600 }).unwrap();
        engine.inner.jobs.lock().unwrap().remove(&1);

        engine.pause_job(1).unwrap();
        let persisted = engine.inner.db.load_all().unwrap();
        assert!(persisted[0].paused);

        engine.resume_job(1).unwrap();
        let persisted = engine.inner.db.load_all().unwrap();
        assert!(!persisted[0].paused);
    }

    #[tokio::test]
    async fn test_modify_creates_missing_job() {
        let engine = engine(Arc::new(CountingRunner::default()));
        engine.modify_job(7, "new", Trigger::Interval { seconds: 60 }).unwrap();
        assert_eq!(engine.list_jobs().len(), 1);
    }
}
