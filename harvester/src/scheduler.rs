//! Top-level harvest loop: polls online recorders and fans work out under
//! the device and interest semaphores.

use dashmap::{DashMap, DashSet};
use harvest_common::{Interest, OnlineDevice};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::cms::{CmsApi, CmsSession};
use crate::config::ProcessConfig;
use crate::error::{HarvestError, Result};
use crate::processor::{InterestHandler, InterestOutcome, InterestTask};
use crate::refill::{RefillController, RefillOutcome};
use crate::state_store::StateStore;

/// Marks a recorder as being harvested until dropped.
struct InProgress {
    set: Arc<DashSet<String>>,
    reg_id: String,
}

impl InProgress {
    fn claim(set: &Arc<DashSet<String>>, reg_id: &str) -> Option<Self> {
        if !set.insert(reg_id.to_string()) {
            return None;
        }
        Some(Self {
            set: Arc::clone(set),
            reg_id: reg_id.to_string(),
        })
    }
}

impl Drop for InProgress {
    fn drop(&mut self) {
        self.set.remove(&self.reg_id);
    }
}

pub struct HarvestScheduler {
    cms: Arc<dyn CmsApi>,
    state: Arc<StateStore>,
    refill: Arc<RefillController>,
    handler: Arc<dyn InterestHandler>,
    devices: Arc<Semaphore>,
    global_interests: Arc<Semaphore>,
    per_device: DashMap<String, Arc<Semaphore>>,
    in_progress: Arc<DashSet<String>>,
    max_per_device: usize,
    max_batch: usize,
    tick: Duration,
}

impl HarvestScheduler {
    pub fn new(
        cms: Arc<dyn CmsApi>,
        state: Arc<StateStore>,
        refill: Arc<RefillController>,
        handler: Arc<dyn InterestHandler>,
        config: &ProcessConfig,
    ) -> Self {
        Self {
            cms,
            state,
            refill,
            handler,
            devices: Arc::new(Semaphore::new(config.max_devices_concurrent)),
            global_interests: Arc::new(Semaphore::new(config.max_global_interests)),
            per_device: DashMap::new(),
            in_progress: Arc::new(DashSet::new()),
            max_per_device: config.max_interests_per_device,
            max_batch: config.max_interests_per_batch,
            tick: Duration::from_secs(config.tick_interval_sec),
        }
    }

    /// Runs until `shutdown` fires. Returns only on shutdown or on a state
    /// file failure.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let mut session: Option<CmsSession> = None;
        let mut devices: JoinSet<Result<()>> = JoinSet::new();
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let known = self.state.recorders().await?;
        info!(
            tick_sec = self.tick.as_secs(),
            recorders = known.len(),
            "Harvest loop started"
        );
        let result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                Some(joined) = devices.join_next(), if !devices.is_empty() => {
                    if let Err(e) = reap(joined, &mut session) {
                        break Err(e);
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.dispatch(&mut session, &mut devices, &shutdown).await {
                        if e.is_fatal() {
                            error!("Harvest cycle aborted: {}", e);
                            session = None;
                        } else {
                            warn!("Harvest cycle failed: {}", e);
                        }
                    }
                }
            }
        };

        shutdown.cancel();
        devices.abort_all();
        while devices.join_next().await.is_some() {}
        info!("Harvest loop stopped");
        result
    }

    /// One cycle: dispatches every online recorder and waits for all of them.
    pub async fn run_once(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let mut session = None;
        let mut devices: JoinSet<Result<()>> = JoinSet::new();
        self.dispatch(&mut session, &mut devices, &shutdown).await?;

        let mut first_error = None;
        while let Some(joined) = devices.join_next().await {
            if let Err(e) = reap(joined, &mut session) {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn dispatch(
        self: &Arc<Self>,
        session: &mut Option<CmsSession>,
        devices: &mut JoinSet<Result<()>>,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        let current = match session.clone() {
            Some(current) => current,
            None => {
                let fresh = self.cms.login().await?;
                *session = Some(fresh.clone());
                fresh
            }
        };

        let online = self.cms.online_devices(&current).await?;
        debug!(online = online.len(), busy = self.in_progress.len(), "Online devices");

        for device in online {
            let guard = match InProgress::claim(&self.in_progress, &device.did) {
                Some(guard) => guard,
                None => continue,
            };
            let scheduler = Arc::clone(self);
            let session = current.clone();
            let shutdown = shutdown.clone();
            devices.spawn(async move {
                let _guard = guard;
                scheduler.harvest_device(session, device, shutdown).await
            });
        }
        Ok(())
    }

    #[instrument(skip_all, fields(reg_id = %device.did))]
    async fn harvest_device(
        &self,
        session: CmsSession,
        device: OnlineDevice,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let _permit = self
            .devices
            .acquire()
            .await
            .map_err(|_| HarvestError::Cancelled)?;
        let reg_id = device.did.as_str();

        let recorder = self.state.create_recorder(reg_id, device.vid.as_deref()).await?;
        if recorder.ignore {
            debug!("Recorder ignored");
            return Ok(());
        }

        let mut pending = recorder.pending_interests;
        if pending.is_empty() {
            match self.refill.refill(&session, reg_id).await? {
                RefillOutcome::Done { added, .. } if added > 0 => {
                    pending = self.state.get_recorder(reg_id).await?.pending_interests;
                }
                outcome => {
                    debug!(?outcome, "Nothing to harvest");
                    return Ok(());
                }
            }
        }

        let batch = next_batch(pending, self.max_batch);
        self.run_batch(&session, reg_id, recorder.chanel_id, batch, &shutdown)
            .await
    }

    fn device_semaphore(&self, reg_id: &str) -> Arc<Semaphore> {
        self.per_device
            .entry(reg_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.max_per_device)))
            .clone()
    }

    /// Runs a batch of one recorder's interests. A device-offline result
    /// cancels and drains every sibling before returning.
    async fn run_batch(
        &self,
        session: &CmsSession,
        reg_id: &str,
        primary_channel: u8,
        interests: Vec<Interest>,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        let cancel = shutdown.child_token();
        let device_slots = self.device_semaphore(reg_id);
        let mut batch: JoinSet<Result<InterestOutcome>> = JoinSet::new();

        for interest in interests {
            let global = Arc::clone(&self.global_interests);
            let device_slots = Arc::clone(&device_slots);
            let handler = Arc::clone(&self.handler);
            let session = session.clone();
            let cancel = cancel.clone();
            let task = InterestTask {
                reg_id: reg_id.to_string(),
                primary_channel,
                interest,
            };
            batch.spawn(async move {
                let _global = global.acquire_owned().await.map_err(|_| HarvestError::Cancelled)?;
                let _device = device_slots
                    .acquire_owned()
                    .await
                    .map_err(|_| HarvestError::Cancelled)?;
                if cancel.is_cancelled() {
                    return Err(HarvestError::Cancelled);
                }
                handler.handle(&session, task, &cancel).await
            });
        }

        let mut fatal = None;
        while let Some(joined) = batch.join_next().await {
            match joined {
                Ok(Ok(outcome)) => debug!(?outcome, "Interest finished"),
                Ok(Err(HarvestError::Cancelled)) => {}
                Ok(Err(e)) if e.is_device_offline() || e.is_fatal() => {
                    if !cancel.is_cancelled() {
                        warn!("Cancelling device batch: {}", e);
                        cancel.cancel();
                        batch.abort_all();
                    }
                    if e.is_fatal() {
                        fatal.get_or_insert(e);
                    }
                }
                Ok(Err(e)) => warn!("Interest left pending: {}", e),
                Err(e) if e.is_cancelled() => {}
                Err(e) => error!("Interest task panicked: {}", e),
            }
        }

        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Pending interests in start order, at most `limit` of them.
fn next_batch(mut pending: Vec<Interest>, limit: usize) -> Vec<Interest> {
    pending.sort_by_key(|i| (i.date(), i.beg_sec));
    pending.truncate(limit);
    pending
}

fn reap(joined: std::result::Result<Result<()>, JoinError>, session: &mut Option<CmsSession>) -> Result<()> {
    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(HarvestError::StateIo(message))) => {
            error!("State file failure: {}", message);
            Err(HarvestError::StateIo(message))
        }
        Ok(Err(e)) if e.is_fatal() => {
            error!("Device harvest aborted: {}", e);
            *session = None;
            Ok(())
        }
        Ok(Err(HarvestError::Cancelled)) => Ok(()),
        Ok(Err(e)) => {
            warn!("Device harvest failed: {}", e);
            Ok(())
        }
        Err(e) if e.is_cancelled() => Ok(()),
        Err(e) => {
            error!("Device task panicked: {}", e);
            Ok(())
        }
    }
}
