//! 全局限速：每个调度周期按各任务的实测速度重新分配全局上限
//!
//! 分配规则（每个方向独立计算，上限为 c，n 个任务，实测速度 s_i）：
//! 1. c 为 0、总速度为 0 或总速度不超过 c 时全部不限速；
//! 2. 否则取保底 F = max(1, min(speed_floor, c / n))，按比例分配，
//!    比例份额低于 F 的任务改为分得 F，剩余带宽在其余任务之间重新按比例分配，直到稳定；
//! 3. 节点自身的限速在此基础上再取较小值。
//!
//! 当 F·n ≤ c 时限速总和不超过 c；c < n 时每个任务至少分得 1，超出量不超过 n。

use crate::core::node::NodeId;
use crate::core::relation::RelationRecord;
use crate::plugin::Control;

/// 默认保底速度（字节/秒）
pub const DEFAULT_SPEED_FLOOR: u64 = 1024;

#[derive(Debug)]
pub struct SpeedGovernor {
    records: Vec<RelationRecord>,
    /// [下载, 上传]，0 表示不限速
    limit: [u64; 2],
    speed_floor: u64,
}

impl Default for SpeedGovernor {
    fn default() -> Self {
        Self::new(DEFAULT_SPEED_FLOOR)
    }
}

impl SpeedGovernor {
    pub fn new(speed_floor: u64) -> Self {
        Self {
            records: Vec::new(),
            limit: [0, 0],
            speed_floor: speed_floor.max(1),
        }
    }

    /// 新的上限在下一次 adjust 时生效
    pub fn set_global_speed(&mut self, download: u64, upload: u64) {
        self.limit = [download, upload];
    }

    pub fn global_speed(&self) -> [u64; 2] {
        self.limit
    }

    pub fn speed_floor(&self) -> u64 {
        self.speed_floor
    }

    /// 加入活动集合；同一节点已有记录时替换并返回旧记录
    pub fn add(&mut self, record: RelationRecord) -> Option<RelationRecord> {
        match self.records.iter().position(|r| r.node == record.node) {
            Some(index) => Some(std::mem::replace(&mut self.records[index], record)),
            None => {
                self.records.push(record);
                None
            }
        }
    }

    pub fn remove(&mut self, node: NodeId) -> Option<RelationRecord> {
        let index = self.records.iter().position(|r| r.node == node)?;
        Some(self.records.remove(index))
    }

    pub fn remove_all(&mut self) -> Vec<RelationRecord> {
        std::mem::take(&mut self.records)
    }

    pub fn get(&self, node: NodeId) -> Option<&RelationRecord> {
        self.records.iter().find(|r| r.node == node)
    }

    pub fn get_mut(&mut self, node: NodeId) -> Option<&mut RelationRecord> {
        self.records.iter_mut().find(|r| r.node == node)
    }

    pub fn records(&self) -> impl Iterator<Item = &RelationRecord> {
        self.records.iter()
    }

    pub fn records_mut(&mut self) -> impl Iterator<Item = &mut RelationRecord> {
        self.records.iter_mut()
    }

    pub fn nodes(&self) -> Vec<NodeId> {
        self.records.iter().map(|r| r.node).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// 各活动任务速度之和 [下载, 上传]
    pub fn total_speed(&self) -> [u64; 2] {
        self.records.iter().fold([0u64, 0u64], |acc, r| {
            [acc[0].saturating_add(r.speed[0]), acc[1].saturating_add(r.speed[1])]
        })
    }

    /// 重新计算每个任务的限速并推送给后端
    pub fn adjust(&mut self) {
        if self.records.is_empty() {
            return;
        }
        for direction in 0..2 {
            let speeds: Vec<u64> = self.records.iter().map(|r| r.speed[direction]).collect();
            let limits = distribute(self.limit[direction], &speeds, self.speed_floor);
            for (record, limit) in self.records.iter_mut().zip(limits) {
                record.limit[direction] = cap_by_own(limit, record.own_limit[direction]);
            }
        }
        for record in &self.records {
            let [download, upload] = record.limit;
            if !record.adapter.control(&Control::SetSpeedLimit { download, upload }) {
                log::trace!("后端 {} 不支持限速", record.adapter.name());
            }
        }
    }
}

fn cap_by_own(limit: u64, own: u64) -> u64 {
    match (limit, own) {
        (limit, 0) => limit,
        (0, own) => own,
        (limit, own) => limit.min(own),
    }
}

/// 单个方向的分配，返回值与 `speeds` 一一对应，0 表示不限速
pub fn distribute(cap: u64, speeds: &[u64], speed_floor: u64) -> Vec<u64> {
    let n = speeds.len();
    if n == 0 {
        return Vec::new();
    }
    let total: u128 = speeds.iter().map(|&s| s as u128).sum();
    if cap == 0 || total == 0 || total <= cap as u128 {
        return vec![0; n];
    }

    let floor = speed_floor.min(cap / n as u64).max(1);
    let mut floored = vec![false; n];
    let (mut remaining, mut rest) = pool(cap, speeds, &floored, floor);
    loop {
        let mut changed = false;
        for (i, &speed) in speeds.iter().enumerate() {
            if !floored[i] && share(remaining, rest, speed) < floor as u128 {
                floored[i] = true;
                changed = true;
            }
        }
        if !changed {
            break;
        }
        (remaining, rest) = pool(cap, speeds, &floored, floor);
    }

    speeds
        .iter()
        .zip(&floored)
        .map(|(&speed, &is_floored)| {
            if is_floored {
                floor
            } else {
                share(remaining, rest, speed) as u64
            }
        })
        .collect()
}

/// 扣除保底后剩余的带宽，以及未保底任务的速度之和
fn pool(cap: u64, speeds: &[u64], floored: &[bool], floor: u64) -> (u128, u128) {
    let count = floored.iter().filter(|f| **f).count() as u128;
    let remaining = (cap as u128).saturating_sub(floor as u128 * count);
    let rest = speeds
        .iter()
        .zip(floored)
        .filter(|(_, f)| !**f)
        .map(|(&s, _)| s as u128)
        .sum();
    (remaining, rest)
}

fn share(remaining: u128, rest: u128, speed: u64) -> u128 {
    if rest == 0 {
        0
    } else {
        remaining * speed as u128 / rest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::data::Priority;
    use crate::plugin::{EmptyFactory, PluginAdapter};

    fn record(speed: [u64; 2]) -> RelationRecord {
        let adapter = PluginAdapter::create(&EmptyFactory::new());
        let mut record = RelationRecord::new(NodeId::new(), adapter, Priority::Normal, [0, 0]);
        record.speed = speed;
        record
    }

    fn governor(speeds: &[[u64; 2]]) -> SpeedGovernor {
        let mut governor = SpeedGovernor::new(DEFAULT_SPEED_FLOOR);
        for &speed in speeds {
            governor.add(record(speed));
        }
        governor
    }

    const SCENARIO: [[u64; 2]; 7] = [
        [2000, 1500],
        [1800, 1300],
        [1600, 1100],
        [1400, 900],
        [1200, 700],
        [1000, 500],
        [800, 300],
    ];

    #[test]
    fn test_scenario_under_cap_is_unlimited() {
        // 总速度 9800/6300 都没有超过 12000/8000
        let mut governor = governor(&SCENARIO);
        governor.set_global_speed(12000, 8000);
        governor.adjust();
        assert_eq!(governor.total_speed(), [9800, 6300]);
        for record in governor.records() {
            assert_eq!(record.limit, [0, 0]);
        }
    }

    #[test]
    fn test_scenario_throttled_is_proportional() {
        let mut governor = SpeedGovernor::new(100);
        for &speed in &SCENARIO {
            governor.add(record(speed));
        }
        governor.set_global_speed(4900, 1400);
        governor.adjust();

        let limits: Vec<[u64; 2]> = governor.records().map(|r| r.limit).collect();
        // 下载方向正好按比例分到一半
        let down: Vec<u64> = limits.iter().map(|l| l[0]).collect();
        assert_eq!(down, vec![1000, 900, 800, 700, 600, 500, 400]);
        // 上传方向最慢的任务份额低于保底，剩余带宽由其它任务重新分配
        let up: Vec<u64> = limits.iter().map(|l| l[1]).collect();
        assert_eq!(up, vec![325, 281, 238, 195, 151, 108, 100]);
        assert!(up.iter().sum::<u64>() <= 1400);
    }

    #[test]
    fn test_zero_total_never_divides() {
        assert_eq!(distribute(1000, &[0, 0, 0], 100), vec![0, 0, 0]);
        assert_eq!(distribute(1000, &[], 100), Vec::<u64>::new());
        assert_eq!(distribute(0, &[5000, 5000], 100), vec![0, 0]);
    }

    #[test]
    fn test_stalled_task_keeps_floor() {
        let limits = distribute(10_000, &[50_000, 0, 10], 500);
        assert_eq!(limits[1], 500);
        assert_eq!(limits[2], 500);
        assert_eq!(limits[0], 9_000);
        assert!(limits.iter().sum::<u64>() <= 10_000);
    }

    #[test]
    fn test_sum_respects_cap() {
        let speeds = [7_000, 3_000, 900, 100, 40_000, 1];
        for cap in [600, 1_000, 5_000, 12_345, 50_000] {
            let limits = distribute(cap, &speeds, 1024);
            let floor = 1024u64.min(cap / speeds.len() as u64).max(1);
            assert!(limits.iter().sum::<u64>() <= cap, "cap {}", cap);
            assert!(limits.iter().all(|&l| l >= floor), "cap {}", cap);
        }
    }

    #[test]
    fn test_cap_below_task_count_bounded_overshoot() {
        let limits = distribute(3, &[100, 100, 100, 100, 100], 1024);
        assert!(limits.iter().all(|&l| l == 1));
        assert!(limits.iter().sum::<u64>() <= 3 + 5);
    }

    #[test]
    fn test_own_limit_caps_result() {
        let mut governor = governor(&[[10_000, 0], [10_000, 0]]);
        let node = governor.nodes()[1];
        governor.get_mut(node).unwrap().own_limit = [1_000, 200];
        governor.set_global_speed(10_000, 0);
        governor.adjust();
        let limits: Vec<[u64; 2]> = governor.records().map(|r| r.limit).collect();
        assert_eq!(limits[0], [5_000, 0]);
        assert_eq!(limits[1], [1_000, 200]);
    }

    #[test]
    fn test_add_replaces_and_remove() {
        let mut governor = governor(&[[1, 1], [2, 2]]);
        let node = governor.nodes()[0];
        let mut again = record([9, 9]);
        again.node = node;
        assert!(governor.add(again).is_some());
        assert_eq!(governor.len(), 2);
        assert_eq!(governor.get(node).map(|r| r.speed), Some([9, 9]));

        assert!(governor.remove(node).is_some());
        assert!(governor.remove(node).is_none());
        assert_eq!(governor.len(), 1);
        assert_eq!(governor.remove_all().len(), 1);
        assert!(governor.is_empty());
    }
}
