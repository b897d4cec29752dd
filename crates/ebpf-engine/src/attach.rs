//! 인터페이스 어태치 관리: 이름/상태 검증, ifindex 조회, 멱등 어태치/디태치
//!
//! [`AttachmentManager`]는 실제 어태치 수단([`LinkDriver`])을 감싸서
//! 같은 인터페이스에 두 번 어태치하거나 어태치되지 않은 인터페이스를
//! 디태치하는 호출을 무시합니다.
//!
//! # 인터페이스 유효성
//! - 이름: 1-15 바이트, `/`·공백·`:` 불가, `.`/`..` 불가
//! - `/sys/class/net/<name>` 존재
//! - `operstate`가 `up` (캐리어를 보고하지 않는 가상 장치는 `unknown`)

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};

use infw_core::error::EngineError;

/// 리눅스 인터페이스 이름 최대 길이 (IFNAMSIZ - 1)
pub const MAX_INTERFACE_NAME_LEN: usize = 15;

/// 기본 sysfs 네트워크 장치 경로
pub const SYSFS_NET: &str = "/sys/class/net";

/// 인터페이스 이름과 상태 검증
pub trait InterfaceValidator: Send + Sync {
    /// 이름이 커널 규칙에 맞고, 장치가 존재하며 동작 중이면 `true`
    fn is_valid_interface_name_and_state(&self, name: &str) -> bool;
}

impl<F> InterfaceValidator for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn is_valid_interface_name_and_state(&self, name: &str) -> bool {
        self(name)
    }
}

/// 인터페이스 이름 → ifindex 조회
pub trait IfIndexResolver: Send + Sync {
    /// ifindex를 반환합니다.
    ///
    /// # 에러
    /// - `EngineError::InterfaceLookup`: 장치가 없거나 읽을 수 없음
    fn ifindex(&self, name: &str) -> Result<u32, EngineError>;
}

/// 커널 인터페이스 이름 규칙을 검사합니다.
pub fn is_valid_interface_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_INTERFACE_NAME_LEN
        && name != "."
        && name != ".."
        && !name
            .chars()
            .any(|c| c == '/' || c == ':' || c.is_whitespace())
}

/// sysfs 기반 검증기 및 ifindex 조회기
///
/// 테스트에서는 `with_root()`로 임시 디렉토리를 sysfs 대신 사용합니다.
#[derive(Debug, Clone)]
pub struct SysfsInterfaceValidator {
    root: PathBuf,
}

impl SysfsInterfaceValidator {
    /// `/sys/class/net`을 사용하는 검증기를 생성합니다.
    pub fn new() -> Self {
        Self::with_root(SYSFS_NET)
    }

    /// 지정한 디렉토리를 sysfs 네트워크 장치 경로로 사용합니다.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn read_attr(&self, name: &str, attr: &str) -> std::io::Result<String> {
        std::fs::read_to_string(self.root.join(name).join(attr)).map(|s| s.trim().to_owned())
    }
}

impl Default for SysfsInterfaceValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl InterfaceValidator for SysfsInterfaceValidator {
    fn is_valid_interface_name_and_state(&self, name: &str) -> bool {
        if !is_valid_interface_name(name) {
            debug!(interface = name, "interface name rejected");
            return false;
        }
        if !self.root.join(name).exists() {
            debug!(interface = name, "interface does not exist");
            return false;
        }
        match self.read_attr(name, "operstate") {
            Ok(state) if state == "up" || state == "unknown" => true,
            Ok(state) => {
                debug!(interface = name, state = state.as_str(), "interface is not up");
                false
            }
            Err(e) => {
                debug!(interface = name, error = %e, "failed to read operstate");
                false
            }
        }
    }
}

impl IfIndexResolver for SysfsInterfaceValidator {
    fn ifindex(&self, name: &str) -> Result<u32, EngineError> {
        let lookup_err = |reason: String| EngineError::InterfaceLookup {
            interface: name.to_owned(),
            reason,
        };
        if !is_valid_interface_name(name) {
            return Err(lookup_err("invalid interface name".to_owned()));
        }
        let raw = self
            .read_attr(name, "ifindex")
            .map_err(|e| lookup_err(e.to_string()))?;
        raw.parse()
            .map_err(|_| lookup_err(format!("malformed ifindex '{raw}'")))
    }
}

/// 고정된 이름 → ifindex 표
///
/// 외부 오프로드 백엔드처럼 커널 ifindex가 필요 없는 경우와 테스트에서 사용합니다.
#[derive(Debug, Clone, Default)]
pub struct StaticIfIndexResolver {
    table: BTreeMap<String, u32>,
}

impl StaticIfIndexResolver {
    /// (이름, ifindex) 목록으로 생성합니다.
    pub fn new<'a>(entries: impl IntoIterator<Item = (&'a str, u32)>) -> Self {
        Self {
            table: entries
                .into_iter()
                .map(|(name, idx)| (name.to_owned(), idx))
                .collect(),
        }
    }
}

impl IfIndexResolver for StaticIfIndexResolver {
    fn ifindex(&self, name: &str) -> Result<u32, EngineError> {
        self.table
            .get(name)
            .copied()
            .ok_or_else(|| EngineError::InterfaceLookup {
                interface: name.to_owned(),
                reason: "unknown interface".to_owned(),
            })
    }
}

/// 인터페이스에 분류기를 실제로 붙이고 떼는 수단
pub trait LinkDriver: Send {
    /// 어태치 결과로 보관하는 링크 핸들
    type Link: Send;

    /// 인터페이스에 어태치합니다.
    fn attach(&mut self, name: &str) -> Result<Self::Link, EngineError>;

    /// 링크를 해제합니다.
    ///
    /// 실패 시 링크 핸들이 아직 유효하면 [`DetachFailure::link`]로 돌려줍니다.
    fn detach(&mut self, name: &str, link: Self::Link) -> Result<(), DetachFailure<Self::Link>>;
}

/// 드라이버 디태치 실패
#[derive(Debug)]
pub struct DetachFailure<T> {
    /// 돌려받은 링크 핸들. 드라이버가 핸들을 소비했다면 `None`
    pub link: Option<T>,
    pub error: EngineError,
}

/// 커널 상태 없이 어태치 목록만 관리하는 드라이버 (오프로드 백엔드용)
#[derive(Debug, Default)]
pub struct BookkeepingDriver;

impl LinkDriver for BookkeepingDriver {
    type Link = ();

    fn attach(&mut self, _name: &str) -> Result<(), EngineError> {
        Ok(())
    }

    fn detach(&mut self, _name: &str, _link: ()) -> Result<(), DetachFailure<()>> {
        Ok(())
    }
}

/// 멱등 어태치/디태치 관리자
pub struct AttachmentManager<L: LinkDriver> {
    driver: L,
    validator: Arc<dyn InterfaceValidator>,
    links: BTreeMap<String, L::Link>,
}

impl<L: LinkDriver> AttachmentManager<L> {
    /// 새 관리자를 생성합니다.
    pub fn new(driver: L, validator: Arc<dyn InterfaceValidator>) -> Self {
        Self {
            driver,
            validator,
            links: BTreeMap::new(),
        }
    }

    /// 인터페이스를 검증하고 어태치합니다.
    ///
    /// 이미 어태치되어 있으면 아무것도 하지 않고 `Ok(false)`를 반환합니다.
    ///
    /// # 에러
    /// - `EngineError::InterfaceLookup`: 이름/상태 검증 실패
    /// - `EngineError::Attach`: 드라이버 어태치 실패
    pub fn attach(&mut self, name: &str) -> Result<bool, EngineError> {
        if self.links.contains_key(name) {
            return Ok(false);
        }
        if !self.validator.is_valid_interface_name_and_state(name) {
            warn!(interface = name, "skipping invalid interface");
            return Err(EngineError::InterfaceLookup {
                interface: name.to_owned(),
                reason: "invalid interface name or state".to_owned(),
            });
        }

        let link = self.driver.attach(name)?;
        self.links.insert(name.to_owned(), link);
        info!(interface = name, "interface attached");
        Ok(true)
    }

    /// 인터페이스를 디태치합니다.
    ///
    /// 어태치되어 있지 않으면 아무것도 하지 않고 `Ok(false)`를 반환합니다.
    /// 드라이버 디태치가 실패하고 링크 핸들을 돌려받으면 인터페이스는
    /// 어태치된 상태로 남으며, 다음 디태치에서 다시 시도합니다.
    pub fn detach(&mut self, name: &str) -> Result<bool, EngineError> {
        let Some(link) = self.links.remove(name) else {
            return Ok(false);
        };
        match self.driver.detach(name, link) {
            Ok(()) => {
                info!(interface = name, "interface detached");
                Ok(true)
            }
            Err(DetachFailure { link, error }) => {
                match link {
                    Some(link) => {
                        self.links.insert(name.to_owned(), link);
                        warn!(interface = name, error = %error, "detach failed, interface stays attached");
                    }
                    None => {
                        warn!(interface = name, error = %error, "detach failed, link handle released");
                    }
                }
                Err(error)
            }
        }
    }

    /// 모든 인터페이스를 디태치하고 실패 목록을 반환합니다.
    pub fn detach_all(&mut self) -> Vec<(String, EngineError)> {
        let names: Vec<String> = self.links.keys().cloned().collect();
        names
            .into_iter()
            .filter_map(|name| match self.detach(&name) {
                Ok(_) => None,
                Err(e) => Some((name, e)),
            })
            .collect()
    }

    /// 현재 어태치된 인터페이스 이름
    pub fn attached(&self) -> impl Iterator<Item = &str> {
        self.links.keys().map(String::as_str)
    }

    /// 어태치 여부
    pub fn is_attached(&self, name: &str) -> bool {
        self.links.contains_key(name)
    }

    /// 드라이버에 대한 가변 참조
    pub fn driver_mut(&mut self) -> &mut L {
        &mut self.driver
    }
}
