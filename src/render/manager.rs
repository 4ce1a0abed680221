//! Render dispatch and the hot style-swap protocol.
//!
//! Style updates are staged on every worker in turn; only when all workers
//! accepted the new set is the commit posted and the active-styles snapshot
//! published. A failure on any worker cancels the staging everywhere. At most
//! one update runs at a time; updates arriving meanwhile are coalesced into
//! the latest observed value.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use log::{error, warn};
use serde_json::Value;

use crate::config::{ConfigObserver, ConfigStore};
use crate::pool::{InitBarrier, WorkerId, WorkerInitTask, WorkerPool};
use crate::render::engine::SharedEngine;
use crate::render::style::{parse_styles, StyleInfo};
use crate::render::worker::RenderWorker;
use crate::render::{
    RenderError, RenderRequest, RenderTask, RenderWorkItem, SubtileRequest, WorkRequest,
};
use crate::task::Executor;

pub struct RenderManagerConfig {
    pub workers: usize,
    pub queue_limit: usize,
    pub styles: Option<Arc<Value>>,
}

impl Default for RenderManagerConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            queue_limit: 1000,
            styles: None,
        }
    }
}

impl RenderManagerConfig {
    /// Reads `render/workers`, `render/queue_limit` and `render/styles`.
    pub fn from_config(config: &ConfigStore) -> Self {
        let defaults = Self::default();
        let workers = config
            .get_value("render/workers")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(defaults.workers);
        let queue_limit = config
            .get_value("render/queue_limit")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(defaults.queue_limit);
        let styles = config.get_value("render/styles");
        Self {
            workers,
            queue_limit,
            styles,
        }
    }
}

type StyleVersion = (String, u32);

struct UpdateState {
    token: u64,
    styles: Arc<Vec<StyleInfo>>,
    remaining: Vec<WorkerId>,
    updated: Vec<WorkerId>,
}

struct ManagerInner {
    pool: WorkerPool<RenderWorker>,
    executor: Executor,
    active_styles: RwLock<Arc<Vec<StyleVersion>>>,
    pending_update: Mutex<Option<Arc<Value>>>,
    update: Mutex<Option<UpdateState>>,
    update_seq: AtomicU64,
    inited: AtomicBool,
    init_barrier: InitBarrier,
}

#[derive(Clone)]
pub struct RenderManager {
    inner: Arc<ManagerInner>,
}

impl RenderManager {
    pub fn new(engine: SharedEngine, config: RenderManagerConfig, executor: Executor) -> Self {
        let styles: Vec<StyleInfo> = config
            .styles
            .as_deref()
            .map(|value| parse_styles(value))
            .unwrap_or_default();
        let active: Vec<StyleVersion> = styles
            .iter()
            .map(|style| (style.name.clone(), style.version))
            .collect();
        let styles = Arc::new(styles);

        let workers = config.workers.max(1);
        let inner = Arc::new(ManagerInner {
            pool: WorkerPool::new(config.queue_limit),
            executor,
            active_styles: RwLock::new(Arc::new(active)),
            pending_update: Mutex::new(None),
            update: Mutex::new(None),
            update_seq: AtomicU64::new(1),
            inited: AtomicBool::new(false),
            init_barrier: InitBarrier::new(workers),
        });

        for _ in 0..workers {
            let barrier = inner.init_barrier.clone();
            let err_barrier = barrier.clone();
            let init_task = Arc::new(WorkerInitTask::new(
                move |_id| barrier.notify(),
                move |(id, e)| {
                    error!("render worker {id:?} failed to initialize: {e}");
                    err_barrier.notify();
                },
            ));
            inner.pool.push_worker(
                RenderWorker::new(Arc::clone(&engine), Arc::clone(&styles)),
                Some(init_task),
            );
        }

        let manager = Self { inner };
        manager.inner.inited.store(true, Ordering::Release);
        manager.try_process_style_update();
        manager
    }

    /// Blocks until every worker finished initialization. Startup-only.
    pub fn wait_for_init(&self) {
        self.inner.init_barrier.wait();
    }

    pub fn stop(&self) {
        self.inner.pool.stop();
    }

    pub fn has_style(&self, style_name: &str) -> bool {
        self.style_version(style_name).is_some()
    }

    pub fn style_version(&self, style_name: &str) -> Option<u32> {
        let snapshot = self.active_snapshot();
        snapshot
            .iter()
            .find(|(name, _)| name == style_name)
            .map(|(_, version)| *version)
    }

    pub fn active_snapshot(&self) -> Arc<Vec<StyleVersion>> {
        Arc::clone(
            &self
                .inner
                .active_styles
                .read()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    /// Observer endpoint for `render/styles` updates.
    pub fn post_style_update(&self, styles: Arc<Value>) {
        *self
            .inner
            .pending_update
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(styles);
        self.try_process_style_update();
    }

    /// Attaches this manager to the config store's `render/styles` key.
    pub fn observe(&self, config: &ConfigStore) {
        struct StyleUpdateObserver(RenderManager);
        impl ConfigObserver for StyleUpdateObserver {
            fn on_update(&self, value: Arc<Value>) {
                self.0.post_style_update(value);
            }
        }
        config.attach("render/styles", Arc::new(StyleUpdateObserver(self.clone())));
    }

    pub fn render<S, F>(&self, request: RenderRequest, on_success: S, on_error: F) -> Arc<RenderTask>
    where
        S: FnOnce(crate::tile::Metatile) + Send + 'static,
        F: FnOnce(RenderError) + Send + 'static,
    {
        let task = Arc::new(RenderTask::with_executor(
            self.inner.executor.clone(),
            on_success,
            on_error,
        ));
        if !self.has_style(&request.style_name) {
            task.complete_error(RenderError::UnknownStyle);
            return task;
        }
        self.inner.pool.post(RenderWorkItem {
            task: Arc::clone(&task),
            request: WorkRequest::Render(request),
        });
        task
    }

    pub fn make_subtile<S, F>(
        &self,
        request: SubtileRequest,
        on_success: S,
        on_error: F,
    ) -> Arc<RenderTask>
    where
        S: FnOnce(crate::tile::Metatile) + Send + 'static,
        F: FnOnce(RenderError) + Send + 'static,
    {
        let task = Arc::new(RenderTask::with_executor(
            self.inner.executor.clone(),
            on_success,
            on_error,
        ));
        if !(request.mvt_tile.id.valid() && request.tile_id.valid()) {
            error!("invalid tile id in subtile request");
            task.complete_error(RenderError::InvalidTile);
            return task;
        }
        self.inner.pool.post(RenderWorkItem {
            task: Arc::clone(&task),
            request: WorkRequest::Subtile(request),
        });
        task
    }

    fn try_process_style_update(&self) {
        let inner = &self.inner;
        if !inner.inited.load(Ordering::Acquire) {
            return;
        }
        let pending = inner
            .pending_update
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(styles_value) = pending else {
            return;
        };
        let next = {
            let mut update = inner.update.lock().unwrap_or_else(PoisonError::into_inner);
            if update.is_some() {
                // An update is already running; put the value back so the
                // finishing update picks the latest one up.
                *inner
                    .pending_update
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(styles_value);
                return;
            }
            let styles = parse_styles(&styles_value);
            if styles.is_empty() {
                warn!("style update carries no usable styles, skipping");
                return;
            }
            let remaining = inner.pool.workers();
            let Some(next) = remaining.last().copied() else {
                warn!("render pool has no workers, skipping update");
                return;
            };
            let token = inner.update_seq.fetch_add(1, Ordering::Relaxed);
            *update = Some(UpdateState {
                token,
                styles: Arc::new(styles),
                remaining,
                updated: Vec::new(),
            });
            next
        };
        self.post_update_to(next);
    }

    fn post_update_to(&self, worker_id: WorkerId) {
        let manager = self.clone();
        let posted = self.inner.pool.execute_on(worker_id, move |worker| {
            manager.update_worker(worker_id, worker);
        });
        if !posted {
            // The worker disappeared between listing and posting; treat it as
            // updated and move on.
            self.advance_update(worker_id, true, false);
        }
    }

    fn update_worker(&self, worker_id: WorkerId, worker: &mut RenderWorker) {
        let (styles, token) = {
            let update = self
                .inner
                .update
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let Some(state) = update.as_ref() else {
                return;
            };
            (Arc::clone(&state.styles), state.token)
        };
        let ok = worker.update_styles(&styles, token);
        self.advance_update(worker_id, ok, true);
    }

    fn advance_update(&self, worker_id: WorkerId, ok: bool, staged: bool) {
        enum Outcome {
            Continue(WorkerId),
            Commit(u64, Vec<WorkerId>, Arc<Vec<StyleInfo>>),
            Cancel(u64, Vec<WorkerId>),
        }
        let outcome = {
            let mut update = self
                .inner
                .update
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let Some(state) = update.as_mut() else {
                return;
            };
            state.remaining.retain(|id| *id != worker_id);
            if !ok {
                error!("error updating render worker {worker_id:?}, cancelling update");
                let cancelled = update
                    .take()
                    .map(|state| (state.token, state.updated))
                    .unwrap_or((0, Vec::new()));
                Outcome::Cancel(cancelled.0, cancelled.1)
            } else {
                if staged {
                    state.updated.push(worker_id);
                }
                match state.remaining.last().copied() {
                    Some(next) => Outcome::Continue(next),
                    None => {
                        let Some(state) = update.take() else {
                            return;
                        };
                        Outcome::Commit(state.token, state.updated, state.styles)
                    }
                }
            }
        };
        match outcome {
            Outcome::Continue(next) => self.post_update_to(next),
            Outcome::Commit(token, updated, styles) => {
                for id in updated {
                    self.inner.pool.execute_on(id, move |worker| {
                        worker.commit_update(token);
                    });
                }
                let active: Vec<StyleVersion> = styles
                    .iter()
                    .map(|style| (style.name.clone(), style.version))
                    .collect();
                *self
                    .inner
                    .active_styles
                    .write()
                    .unwrap_or_else(PoisonError::into_inner) = Arc::new(active);
                self.try_process_style_update();
            }
            Outcome::Cancel(token, updated) => {
                for id in updated {
                    self.inner.pool.execute_on(id, move |worker| {
                        worker.cancel_update(token);
                    });
                }
                self.try_process_style_update();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::render::engine::{BlankEngine, CompiledMap, EngineError, MapEngine};

    /// Engine that can be scripted to refuse compilation.
    struct FlakyEngine {
        fail: Arc<AtomicBool>,
    }

    impl MapEngine for FlakyEngine {
        fn compile(&self, style: &StyleInfo) -> Result<Box<dyn CompiledMap>, EngineError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(EngineError::StyleLoad(
                    style.name.clone(),
                    "scripted failure".to_string(),
                ));
            }
            BlankEngine.compile(style)
        }
    }

    fn styles_json(version: u32) -> Arc<Value> {
        Arc::new(json!({"osm": {"map": "builtin://osm", "version": version}}))
    }

    async fn wait_for_version(manager: &RenderManager, version: u32) {
        for _ in 0..200 {
            if manager.style_version("osm") == Some(version) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("style version never reached {version}");
    }

    #[tokio::test]
    async fn failed_update_is_cancelled_and_next_one_commits() {
        let fail = Arc::new(AtomicBool::new(false));
        let manager = RenderManager::new(
            Arc::new(FlakyEngine {
                fail: Arc::clone(&fail),
            }),
            RenderManagerConfig {
                workers: 2,
                queue_limit: 10,
                styles: Some(styles_json(1)),
            },
            Executor::current(),
        );
        manager.wait_for_init();
        assert_eq!(manager.style_version("osm"), Some(1));
        assert!(manager.has_style("osm"));
        assert!(!manager.has_style("night"));

        // A failing compile cancels the update; the active snapshot is
        // unchanged.
        fail.store(true, Ordering::SeqCst);
        manager.post_style_update(styles_json(2));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(manager.style_version("osm"), Some(1));

        fail.store(false, Ordering::SeqCst);
        manager.post_style_update(styles_json(3));
        wait_for_version(&manager, 3).await;
        manager.stop();
    }

    #[tokio::test]
    async fn unknown_style_fails_render_immediately() {
        let manager = RenderManager::new(
            Arc::new(BlankEngine),
            RenderManagerConfig {
                workers: 1,
                queue_limit: 10,
                styles: None,
            },
            Executor::current(),
        );
        manager.wait_for_init();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        manager.render(
            RenderRequest {
                style_name: "missing".to_string(),
                ..Default::default()
            },
            |_| panic!("must not render"),
            move |e| {
                let _ = tx.send(e);
            },
        );
        assert_eq!(rx.recv().await, Some(RenderError::UnknownStyle));
        manager.stop();
    }
}
