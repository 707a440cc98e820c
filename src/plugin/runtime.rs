use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::core::error::{EngineError, EngineResult};
use super::{BackendFactory, GlobalOption};

struct RegisteredBackend {
    factory: Arc<dyn BackendFactory>,
    refs: usize,
}

/// 后端注册表和进程级生命周期
///
/// 克隆共享同一份状态；不同的 `PluginRuntime::new()` 之间互不影响。
#[derive(Clone, Default)]
pub struct PluginRuntime {
    backends: Arc<Mutex<HashMap<String, RegisteredBackend>>>,
}

impl PluginRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, RegisteredBackend>> {
        self.backends.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 注册后端；已初始化的同名后端不会被替换
    pub fn register(&self, factory: Arc<dyn BackendFactory>) -> EngineResult<()> {
        let name = factory.descriptor().name.clone();
        let mut backends = self.lock();
        if let Some(existing) = backends.get(&name) {
            if existing.refs > 0 {
                return Err(EngineError::BackendGlobal(format!("后端 {} 正在使用，无法替换", name)));
            }
        }
        log::debug!("注册后端: {}", name);
        backends.insert(name, RegisteredBackend { factory, refs: 0 });
        Ok(())
    }

    pub fn factory(&self, name: &str) -> Option<Arc<dyn BackendFactory>> {
        self.lock().get(name).map(|b| b.factory.clone())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn ref_count(&self, name: &str) -> usize {
        self.lock().get(name).map(|b| b.refs).unwrap_or(0)
    }

    pub fn is_initialized(&self, name: &str) -> bool {
        self.ref_count(name) > 0
    }

    /// 设置进程级选项；`Init(true)`/`Init(false)` 按引用计数配对
    pub fn global_set(&self, name: &str, option: GlobalOption) -> EngineResult<()> {
        let mut backends = self.lock();
        let backend = backends
            .get_mut(name)
            .ok_or_else(|| EngineError::BackendNotFound(name.to_string()))?;
        match option {
            GlobalOption::Init(true) => {
                if backend.refs == 0 {
                    backend.factory.global_init()?;
                    log::info!("后端 {} 已初始化", name);
                }
                backend.refs += 1;
            }
            GlobalOption::Init(false) => {
                if backend.refs == 0 {
                    log::warn!("后端 {} 未初始化，忽略清理请求", name);
                    return Ok(());
                }
                backend.refs -= 1;
                if backend.refs == 0 {
                    backend.factory.global_final();
                    log::info!("后端 {} 已清理", name);
                }
            }
            other => backend.factory.global_set(&other)?,
        }
        Ok(())
    }

    /// 初始化一次并返回守卫，守卫释放时对应地清理一次
    pub fn acquire(&self, name: &str) -> EngineResult<GlobalGuard> {
        self.global_set(name, GlobalOption::Init(true))?;
        Ok(GlobalGuard {
            runtime: self.clone(),
            name: name.to_string(),
        })
    }
}

/// 一次进程级初始化的持有者
pub struct GlobalGuard {
    runtime: PluginRuntime,
    name: String,
}

impl GlobalGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for GlobalGuard {
    fn drop(&mut self) {
        if let Err(e) = self.runtime.global_set(&self.name, GlobalOption::Init(false)) {
            log::warn!("清理后端 {} 失败: {}", self.name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use crate::plugin::{Backend, BackendDescriptor, BackendKind, Capabilities, EmptyBackend};
    use crate::core::category::MatchRules;

    struct CountingFactory {
        descriptor: BackendDescriptor,
        inits: AtomicUsize,
        finals: AtomicUsize,
    }

    impl CountingFactory {
        fn new() -> Self {
            Self {
                descriptor: BackendDescriptor {
                    name: "counting".into(),
                    kind: BackendKind::Empty,
                    rules: MatchRules::default(),
                    capabilities: Capabilities::empty(),
                },
                inits: AtomicUsize::new(0),
                finals: AtomicUsize::new(0),
            }
        }
    }

    impl BackendFactory for CountingFactory {
        fn descriptor(&self) -> &BackendDescriptor {
            &self.descriptor
        }

        fn create(&self) -> Box<dyn Backend> {
            Box::new(EmptyBackend::new())
        }

        fn global_init(&self) -> EngineResult<()> {
            self.inits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn global_final(&self) {
            self.finals.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_init_final_reference_counted() {
        let runtime = PluginRuntime::new();
        let factory = Arc::new(CountingFactory::new());
        runtime.register(factory.clone()).unwrap();

        runtime.global_set("counting", GlobalOption::Init(true)).unwrap();
        runtime.global_set("counting", GlobalOption::Init(true)).unwrap();
        assert_eq!(factory.inits.load(Ordering::SeqCst), 1);

        runtime.global_set("counting", GlobalOption::Init(false)).unwrap();
        assert_eq!(factory.finals.load(Ordering::SeqCst), 0);
        runtime.global_set("counting", GlobalOption::Init(false)).unwrap();
        assert_eq!(factory.finals.load(Ordering::SeqCst), 1);

        // 多余的清理是安全的
        runtime.global_set("counting", GlobalOption::Init(false)).unwrap();
        assert_eq!(factory.finals.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_guards_are_independent() {
        let runtime = PluginRuntime::new();
        let factory = Arc::new(CountingFactory::new());
        runtime.register(factory.clone()).unwrap();

        let first = runtime.acquire("counting").unwrap();
        let second = runtime.acquire("counting").unwrap();
        drop(first);
        assert!(runtime.is_initialized("counting"));
        drop(second);
        assert!(!runtime.is_initialized("counting"));
        assert_eq!(factory.finals.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_separate_runtimes_do_not_interfere() {
        let a = PluginRuntime::new();
        let b = PluginRuntime::new();
        a.register(Arc::new(CountingFactory::new())).unwrap();
        b.register(Arc::new(CountingFactory::new())).unwrap();
        let _guard = a.acquire("counting").unwrap();
        assert!(a.is_initialized("counting"));
        assert!(!b.is_initialized("counting"));
    }

    #[test]
    fn test_unknown_backend() {
        let runtime = PluginRuntime::new();
        assert!(matches!(
            runtime.global_set("missing", GlobalOption::Init(true)),
            Err(EngineError::BackendNotFound(_))
        ));
    }

    #[test]
    fn test_register_in_use_rejected() {
        let runtime = PluginRuntime::new();
        runtime.register(Arc::new(CountingFactory::new())).unwrap();
        let _guard = runtime.acquire("counting").unwrap();
        assert!(runtime.register(Arc::new(CountingFactory::new())).is_err());
    }
}
