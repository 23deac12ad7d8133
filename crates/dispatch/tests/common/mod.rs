#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Utc};
use spool_core::resources::ResourceSlice;
use spool_core::states::HardwareState;
use spool_core::types::DbId;
use spool_db::models::directory::{CreateGroup, CreateJob, CreateLayer, CreateShow, Job, Layer};
use spool_db::models::frame::{CreateFrameRange, Frame};
use spool_db::models::host::{FrameUsage, HostReport};
use spool_db::repositories::{FrameRepo, GroupRepo, JobRepo, LayerRepo, ShowRepo};
use spool_dispatch::{DependManager, DispatchConfig, FrameStateMachine, HostReportHandler};
use spool_events::EventBus;
use sqlx::PgPool;

pub const GB: i64 = 1024 * 1024;

/// Every dispatch service wired to one pool and one bus.
pub struct Farm {
    pub pool: PgPool,
    pub bus: Arc<EventBus>,
    pub config: DispatchConfig,
    pub reports: HostReportHandler,
    pub frames: FrameStateMachine,
    pub depends: DependManager,
    pub show_id: DbId,
    pub group_id: DbId,
}

impl Farm {
    pub async fn new(pool: PgPool) -> Self {
        Self::with_config(pool, DispatchConfig::default()).await
    }

    pub async fn with_config(pool: PgPool, config: DispatchConfig) -> Self {
        let bus = Arc::new(EventBus::default());
        let show = ShowRepo::create(
            &pool,
            &CreateShow {
                name: "testshow".to_string(),
                max_cores: None,
            },
        )
        .await
        .unwrap();
        let group = GroupRepo::create(
            &pool,
            &CreateGroup {
                show_id: show.id,
                name: "lighting".to_string(),
                max_cores: None,
            },
        )
        .await
        .unwrap();
        Self {
            reports: HostReportHandler::new(pool.clone(), bus.clone(), &config),
            frames: FrameStateMachine::new(pool.clone(), bus.clone()),
            depends: DependManager::new(pool.clone(), bus.clone()),
            show_id: show.id,
            group_id: group.id,
            pool,
            bus,
            config,
        }
    }

    pub fn job(&self, name: &str) -> CreateJob {
        CreateJob {
            show_id: self.show_id,
            group_id: self.group_id,
            name: name.to_string(),
            priority: None,
            min_cores: None,
            max_cores: None,
            auto_eat: None,
            max_retries: None,
            is_paused: None,
            started_at: None,
        }
    }

    pub async fn create_job(&self, input: CreateJob) -> Job {
        JobRepo::create(&self.pool, &input).await.unwrap()
    }

    /// Add a one-core, 1 GB layer with frames `1..=frames`, still in `Setup`.
    pub async fn add_layer(&self, job: &Job, name: &str, frames: i32) -> Layer {
        self.add_layer_with(layer(job.id, name), frames).await
    }

    pub async fn add_layer_with(&self, input: CreateLayer, frames: i32) -> Layer {
        let layer = LayerRepo::create(&self.pool, &input).await.unwrap();
        FrameRepo::create_range(
            &self.pool,
            &CreateFrameRange {
                layer_id: layer.id,
                start: 1,
                end: frames,
                step: None,
            },
        )
        .await
        .unwrap();
        layer
    }

    /// A started job with one layer of `frames` frames, all `Waiting`.
    pub async fn simple_job(&self, input: CreateJob, frames: i32) -> (Job, Layer) {
        let job = self.create_job(input).await;
        let layer = self.add_layer(&job, "render", frames).await;
        self.frames.activate_job(job.id).await.unwrap();
        (job, layer)
    }

    pub async fn frames_of(&self, layer: &Layer) -> Vec<Frame> {
        FrameRepo::list_by_layer(&self.pool, layer.id).await.unwrap()
    }

    pub async fn frame(&self, id: DbId) -> Frame {
        FrameRepo::find_by_id(&self.pool, id).await.unwrap().unwrap()
    }

    pub async fn job_row(&self, id: DbId) -> Job {
        JobRepo::find_by_id(&self.pool, id).await.unwrap().unwrap()
    }
}

pub fn layer(job_id: DbId, name: &str) -> CreateLayer {
    CreateLayer {
        job_id,
        name: name.to_string(),
        command: Some(format!("render {name}")),
        dispatch_order: None,
        min_cores: Some(100),
        min_memory: Some(GB),
        min_gpus: None,
        min_gpu_memory: None,
        is_threadable: None,
        checkpoint_enabled: None,
        tags: None,
    }
}

pub fn report(name: &str, cores: i32, memory: i64) -> HostReport {
    HostReport {
        name: name.to_string(),
        total: ResourceSlice::new(cores, memory, 0, 0),
        tags: vec!["general".to_string()],
        hardware_state: HardwareState::Up,
        running: vec![],
    }
}

pub fn report_running(name: &str, cores: i32, memory: i64, running: Vec<FrameUsage>) -> HostReport {
    HostReport {
        running,
        ..report(name, cores, memory)
    }
}

pub fn at(hour: u32) -> DateTime<Utc> {
    use chrono::TimeZone;
    Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0).unwrap()
}
