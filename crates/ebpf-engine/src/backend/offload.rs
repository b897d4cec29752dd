//! 오프로드 백엔드: 외부 프로그램에 룰 적용 위임
//!
//! `apply()`는 인터페이스별 룰 맵을 JSON(camelCase 키)으로 직렬화해
//! 오프로드 명령의 표준 입력으로 전달합니다. `flush()`는 정리 명령을 실행합니다.
//! 두 명령 모두 종료 코드 1은 "제거할 대상 없음"으로 보고 성공으로 처리합니다.
//!
//! 커널 자원을 쓰지 않으므로 어태치/디태치는 목록 관리만 하며,
//! 인터페이스 검증은 XDP 백엔드와 동일하게 적용합니다.

use std::io::{self, Write};
use std::process::{ChildStdin, Command, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, info, warn};

use infw_core::error::EngineError;
use infw_core::types::InterfaceRules;

use super::{FirewallBackend, InterfaceAttacher, RuleSink};
use crate::attach::{AttachmentManager, BookkeepingDriver, InterfaceValidator};
use crate::codec;
use crate::config::{CommandSpec, OffloadCommands};
use crate::error::{InterfaceFailure, InterfaceOp, SyncError};

/// "제거할 대상 없음"을 뜻하는 종료 코드
const EXIT_NOTHING_TO_UNLOAD: i32 = 1;

/// 오프로드 명령 표준 입력으로 보낼 JSON을 생성합니다.
pub fn payload(rules: &InterfaceRules) -> Result<Vec<u8>, SyncError> {
    serde_json::to_vec(rules).map_err(|e| SyncError::TableInstallFailed(e.to_string()))
}

/// 명령을 실행하고 종료를 기다립니다.
///
/// `input`이 있으면 별도 스레드에서 표준 입력으로 전달하고, 그동안
/// stdout/stderr를 함께 읽습니다. 자식이 입력을 다 읽지 않고 종료해
/// 생긴 `BrokenPipe`는 무시하며, 결과는 종료 코드로 판정합니다.
pub fn run_command(spec: &CommandSpec, input: Option<&[u8]>) -> Result<(), EngineError> {
    let offload_err =
        |reason: String| EngineError::Offload(format!("{}: {reason}", spec.program));

    let mut child = Command::new(&spec.program)
        .args(&spec.args)
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| offload_err(e.to_string()))?;

    let writer = match (input, child.stdin.take()) {
        (Some(input), Some(stdin)) => Some(spawn_stdin_writer(stdin, input.to_vec())),
        _ => None,
    };

    let output = child
        .wait_with_output()
        .map_err(|e| offload_err(e.to_string()))?;
    let write_result = match writer {
        Some(handle) => handle
            .join()
            .unwrap_or_else(|_| Err(io::Error::other("stdin writer panicked"))),
        None => Ok(()),
    };
    let stdout = String::from_utf8_lossy(&output.stdout);

    if output.status.success() || output.status.code() == Some(EXIT_NOTHING_TO_UNLOAD) {
        // 성공 종료인데 입력이 끝까지 전달되지 않았다면 룰이 잘렸을 수 있음
        if let Err(e) = write_result {
            warn!(program = spec.program.as_str(), error = %e, "offload command input incomplete");
            return Err(offload_err(format!("failed to write stdin: {e}")));
        }
        debug!(program = spec.program.as_str(), status = %output.status, output = %stdout, "offload command finished");
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    warn!(program = spec.program.as_str(), status = %output.status, output = %stdout, "offload command failed");
    Err(offload_err(format!(
        "exited with {}: {}",
        output.status,
        stderr.trim()
    )))
}

/// 표준 입력 쓰기 스레드. 파이프가 닫혀 생긴 `BrokenPipe`는 성공으로 봅니다.
fn spawn_stdin_writer(mut stdin: ChildStdin, input: Vec<u8>) -> JoinHandle<io::Result<()>> {
    thread::spawn(move || match stdin.write_all(&input) {
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(()),
        other => other,
    })
}

/// 외부 오프로드 프로그램 백엔드
pub struct OffloadBackend {
    commands: OffloadCommands,
    links: AttachmentManager<BookkeepingDriver>,
}

impl OffloadBackend {
    /// 새 백엔드를 생성합니다. 명령은 `apply()`/`flush()` 시점에 실행됩니다.
    pub fn new(commands: OffloadCommands, validator: Arc<dyn InterfaceValidator>) -> Self {
        Self {
            commands,
            links: AttachmentManager::new(BookkeepingDriver, validator),
        }
    }
}

impl RuleSink for OffloadBackend {
    fn apply(&mut self, rules: &InterfaceRules) -> Result<usize, SyncError> {
        let count = codec::validate(rules)?;
        let json = payload(rules)?;
        run_command(&self.commands.offload, Some(&json))
            .map_err(|e| SyncError::TableInstallFailed(e.to_string()))?;
        info!(interfaces = rules.len(), rules = count, "rules offloaded");
        Ok(count)
    }

    fn flush(&mut self) -> Result<(), SyncError> {
        run_command(&self.commands.flush, None)
            .map_err(|e| SyncError::TableInstallFailed(e.to_string()))
    }
}

impl InterfaceAttacher for OffloadBackend {
    fn attach(&mut self, interface: &str) -> Result<bool, EngineError> {
        self.links.attach(interface)
    }

    fn detach(&mut self, interface: &str) -> Result<bool, EngineError> {
        self.links.detach(interface)
    }
}

impl FirewallBackend for OffloadBackend {
    fn name(&self) -> &'static str {
        "offload"
    }

    fn close(&mut self) -> Result<(), SyncError> {
        let mut errors: Vec<SyncError> = Vec::new();

        let failures: Vec<InterfaceFailure> = self
            .links
            .detach_all()
            .into_iter()
            .map(|(interface, e)| InterfaceFailure {
                interface,
                operation: InterfaceOp::Detach,
                reason: e.to_string(),
            })
            .collect();
        if !failures.is_empty() {
            errors.push(SyncError::AttachDetachFailed(failures));
        }
        if let Err(e) = self.flush() {
            errors.push(e);
        }

        match SyncError::aggregate(errors) {
            Some(err) => Err(err),
            None => {
                info!("offload backend closed");
                Ok(())
            }
        }
    }
}
