use crate::core::category::MatchRules;
use crate::core::data::DataBundle;
use super::{Backend, BackendDescriptor, BackendFactory, BackendKind, Capabilities, Control, Event, EventKind};

/// 空后端：接受任何任务，直到被停止前一直处于运行状态
#[derive(Debug, Default)]
pub struct EmptyBackend {
    started: bool,
    stopped: bool,
    limit: [u64; 2],
    events: Vec<Event>,
}

impl EmptyBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn limit(&self) -> [u64; 2] {
        self.limit
    }
}

impl Backend for EmptyBackend {
    fn accept(&mut self, _data: &DataBundle) -> bool {
        true
    }

    fn control(&mut self, command: &Control) -> bool {
        match command {
            Control::SetSpeedLimit { download, upload } => {
                self.limit = [*download, *upload];
                true
            }
            Control::EraseData => false,
        }
    }

    fn start(&mut self) -> bool {
        self.started = true;
        self.events.push(Event::new(EventKind::Start, "空后端已启动"));
        true
    }

    fn sync(&mut self, _data: &mut DataBundle) -> bool {
        self.started && !self.stopped
    }

    fn stop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.events.push(Event::new(EventKind::Stopped, "空后端已停止"));
        }
    }

    fn pop_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }
}

pub struct EmptyFactory {
    descriptor: BackendDescriptor,
}

impl EmptyFactory {
    pub fn new() -> Self {
        Self {
            descriptor: BackendDescriptor {
                name: "empty".to_string(),
                kind: BackendKind::Empty,
                rules: MatchRules::default(),
                capabilities: Capabilities::SPEED_LIMIT,
            },
        }
    }
}

impl Default for EmptyFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendFactory for EmptyFactory {
    fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }

    fn create(&self) -> Box<dyn Backend> {
        Box::new(EmptyBackend::new())
    }
}
