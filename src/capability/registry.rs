//! 能力注册表
//!
//! 启动时读入的静态目录（id / 角色 / 优先级 / 超时 / 重试次数 / 是否启用）。
//! 运行期只允许切换启用状态；切换时由上层同时重置该能力的熔断器。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::capability::{CapabilityRole, Tier};

/// 能力描述（目录条目）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    pub id: String,
    pub role: CapabilityRole,
    /// 静态优先级 1-5
    pub priority: u8,
    pub timeout_ms: u64,
    pub retry_count: u32,
    pub enabled: bool,
}

impl CapabilityDescriptor {
    pub fn new(id: impl Into<String>, role: CapabilityRole) -> Self {
        Self {
            id: id.into(),
            role,
            priority: 3,
            timeout_ms: 30_000,
            retry_count: 1,
            enabled: true,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.clamp(1, 5);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// 默认目录：一个分诊、两个主分析、三个辅助能力
pub fn default_catalog() -> Vec<CapabilityDescriptor> {
    vec![
        CapabilityDescriptor::new("triage", CapabilityRole::Triage)
            .with_priority(5)
            .with_timeout_ms(10_000)
            .with_retry_count(2),
        CapabilityDescriptor::new("symptom_analysis", CapabilityRole::Diagnosis).with_priority(4),
        CapabilityDescriptor::new("differential_diagnosis", CapabilityRole::Diagnosis)
            .with_priority(4),
        CapabilityDescriptor::new("treatment_planning", CapabilityRole::Treatment),
        CapabilityDescriptor::new("drug_safety", CapabilityRole::RiskAssessment),
        CapabilityDescriptor::new("follow_up", CapabilityRole::General).with_priority(2),
    ]
}

struct Entry {
    descriptor: CapabilityDescriptor,
    enabled: AtomicBool,
}

/// 能力注册表：按 id 存储，保留注册顺序
#[derive(Default)]
pub struct CapabilityRegistry {
    order: Vec<String>,
    entries: HashMap<String, Entry>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_descriptors(descriptors: impl IntoIterator<Item = CapabilityDescriptor>) -> Self {
        let mut registry = Self::new();
        for d in descriptors {
            registry.register(d);
        }
        registry
    }

    /// 注册能力；同 id 重复注册时覆盖旧条目
    pub fn register(&mut self, descriptor: CapabilityDescriptor) {
        let id = descriptor.id.clone();
        if !self.entries.contains_key(&id) {
            self.order.push(id.clone());
        }
        let enabled = AtomicBool::new(descriptor.enabled);
        self.entries.insert(id, Entry { descriptor, enabled });
    }

    /// 返回描述的副本，enabled 为当前运行期状态
    pub fn get(&self, id: &str) -> Option<CapabilityDescriptor> {
        self.entries.get(id).map(|e| {
            let mut d = e.descriptor.clone();
            d.enabled = e.enabled.load(Ordering::Acquire);
            d
        })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn is_enabled(&self, id: &str) -> bool {
        self.entries
            .get(id)
            .map(|e| e.enabled.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// 切换启用状态；未知 id 返回 false
    pub fn set_enabled(&self, id: &str, enabled: bool) -> bool {
        match self.entries.get(id) {
            Some(e) => {
                e.enabled.store(enabled, Ordering::Release);
                true
            }
            None => false,
        }
    }

    pub fn ids(&self) -> Vec<String> {
        self.order.clone()
    }

    pub fn descriptors(&self) -> Vec<CapabilityDescriptor> {
        self.order.iter().filter_map(|id| self.get(id)).collect()
    }

    pub fn by_tier(&self, tier: Tier) -> Vec<CapabilityDescriptor> {
        self.descriptors()
            .into_iter()
            .filter(|d| d.role.tier() == tier)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_keeps_order_and_overrides() {
        let mut registry = CapabilityRegistry::new();
        registry.register(CapabilityDescriptor::new("b", CapabilityRole::General));
        registry.register(CapabilityDescriptor::new("a", CapabilityRole::Triage));
        registry.register(CapabilityDescriptor::new("b", CapabilityRole::Diagnosis));

        assert_eq!(registry.ids(), vec!["b".to_string(), "a".to_string()]);
        assert_eq!(registry.get("b").unwrap().role, CapabilityRole::Diagnosis);
    }

    #[test]
    fn test_toggle_enabled() {
        let registry = CapabilityRegistry::from_descriptors(default_catalog());
        assert!(registry.is_enabled("triage"));
        assert!(registry.set_enabled("triage", false));
        assert!(!registry.get("triage").unwrap().enabled);
        assert!(!registry.set_enabled("missing", true));
    }

    #[test]
    fn test_priority_clamped() {
        let d = CapabilityDescriptor::new("x", CapabilityRole::General).with_priority(9);
        assert_eq!(d.priority, 5);
    }

    #[test]
    fn test_default_catalog_tiers() {
        let registry = CapabilityRegistry::from_descriptors(default_catalog());
        assert_eq!(registry.by_tier(Tier::Triage).len(), 1);
        assert_eq!(registry.by_tier(Tier::Primary).len(), 2);
        assert_eq!(registry.by_tier(Tier::Secondary).len(), 3);
    }
}
