//! 동기화 서비스: 단일 워커 큐로 동기화기 호출을 직렬화
//!
//! [`SyncService::spawn()`]은 블로킹 워커 하나에서 [`Synchronizer`]를 실행합니다.
//! 동기화 요청과 종료 시그널에 의한 해제 요청이 같은 큐를 지나므로,
//! 동기화 도중 시그널이 도착해도 해제는 동기화가 끝난 뒤 정확히 한 번 실행됩니다.
//!
//! ```text
//! SyncHandle ──Request──▶ mpsc ──▶ worker (spawn_blocking) ──▶ Synchronizer
//!     ▲                                   │
//!     └────────────── oneshot reply ──────┘
//! ```

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use infw_core::types::InterfaceRules;

use crate::error::SyncError;
use crate::sync::{SyncReport, SyncState, Synchronizer};

/// 요청 큐 기본 용량
pub const DEFAULT_QUEUE_CAPACITY: usize = 16;

enum Request {
    Sync {
        desired: InterfaceRules,
        is_delete_all: bool,
        reply: oneshot::Sender<Result<SyncReport, SyncError>>,
    },
    Teardown {
        reply: oneshot::Sender<Result<bool, SyncError>>,
    },
}

/// 동기화 서비스 (워커 태스크 소유)
pub struct SyncService {
    handle: SyncHandle,
    worker: JoinHandle<()>,
}

impl SyncService {
    /// 워커를 스폰합니다. tokio 런타임 안에서 호출해야 합니다.
    pub fn spawn(synchronizer: Synchronizer) -> Self {
        Self::with_capacity(synchronizer, DEFAULT_QUEUE_CAPACITY)
    }

    /// 큐 용량을 지정해 워커를 스폰합니다.
    pub fn with_capacity(synchronizer: Synchronizer, capacity: usize) -> Self {
        let synchronizer = Arc::new(synchronizer);
        let (tx, mut rx) = mpsc::channel::<Request>(capacity.max(1));

        let worker_sync = Arc::clone(&synchronizer);
        let worker = tokio::task::spawn_blocking(move || {
            debug!("sync worker started");
            while let Some(request) = rx.blocking_recv() {
                match request {
                    Request::Sync {
                        desired,
                        is_delete_all,
                        reply,
                    } => {
                        let result = worker_sync.sync_interface_rules(&desired, is_delete_all);
                        let _ = reply.send(result);
                    }
                    Request::Teardown { reply } => {
                        let _ = reply.send(worker_sync.teardown());
                    }
                }
            }
            debug!("sync worker stopped");
        });

        Self {
            handle: SyncHandle { tx, synchronizer },
            worker,
        }
    }

    /// 요청 핸들
    pub fn handle(&self) -> SyncHandle {
        self.handle.clone()
    }

    /// 남은 요청을 처리한 뒤 워커가 끝날 때까지 기다립니다.
    ///
    /// 다른 `SyncHandle` 복제본이 살아 있으면 그것들이 드롭될 때까지 기다립니다.
    pub async fn join(self) {
        let Self { handle, worker } = self;
        drop(handle);
        if let Err(e) = worker.await {
            error!(error = %e, "sync worker panicked");
        }
    }
}

/// 동기화 서비스 요청 핸들
#[derive(Clone)]
pub struct SyncHandle {
    tx: mpsc::Sender<Request>,
    synchronizer: Arc<Synchronizer>,
}

impl SyncHandle {
    /// 동기화를 요청하고 결과를 기다립니다.
    ///
    /// # 에러
    /// 동기화 에러, 또는 워커가 종료됐으면 `ServiceStopped`
    pub async fn sync_interface_rules(
        &self,
        desired: InterfaceRules,
        is_delete_all: bool,
    ) -> Result<SyncReport, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request::Sync {
                desired,
                is_delete_all,
                reply,
            })
            .await
            .map_err(|_| SyncError::ServiceStopped)?;
        rx.await.map_err(|_| SyncError::ServiceStopped)?
    }

    /// 인스턴스 해제를 요청합니다. 인스턴스가 없었으면 `Ok(false)`입니다.
    pub async fn teardown(&self) -> Result<bool, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request::Teardown { reply })
            .await
            .map_err(|_| SyncError::ServiceStopped)?;
        rx.await.map_err(|_| SyncError::ServiceStopped)?
    }

    /// 동기화기 상태
    ///
    /// 게시된 스냅샷만 읽으므로 진행 중인 동기화가 있어도 런타임 워커를 막지 않습니다.
    pub fn state(&self) -> SyncState {
        self.synchronizer.state()
    }

    /// 관리 중인 인터페이스 (직전에 끝난 호출 기준)
    pub fn managed_interfaces(&self) -> Vec<String> {
        self.synchronizer.managed_interfaces()
    }
}

/// `trigger`가 완료되면 해제를 요청하는 태스크를 스폰합니다.
///
/// 해제 에러는 로그로 남기고 재시도하지 않습니다.
pub fn spawn_teardown_on<F>(handle: SyncHandle, trigger: F) -> JoinHandle<Result<bool, SyncError>>
where
    F: Future<Output = &'static str> + Send + 'static,
{
    tokio::spawn(async move {
        let reason = trigger.await;
        info!(reason, "tearing down firewall instance");
        let result = handle.teardown().await;
        match &result {
            Ok(true) => info!("firewall instance torn down"),
            Ok(false) => debug!("no firewall instance to tear down"),
            Err(e) => error!(error = %e, "teardown failed"),
        }
        result
    })
}

/// SIGINT/SIGTERM을 받으면 해제를 요청하는 태스크를 스폰합니다.
///
/// # 에러
/// 시그널 핸들러를 설치할 수 없으면 에러를 반환합니다.
#[cfg(unix)]
pub fn spawn_signal_teardown(
    handle: SyncHandle,
) -> std::io::Result<JoinHandle<Result<bool, SyncError>>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    Ok(spawn_teardown_on(handle, async move {
        tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
        }
    }))
}
