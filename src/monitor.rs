//! Monitor collaborator
//!
//! Routers' health figures flow in through [`Monitor::report_health`]; the
//! Cradle asks [`Monitor::suggest_rebalance`] what, if anything, to split or
//! merge next.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::keyspace::KeyRange;

/// Point-in-time health of one router
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthMetrics {
    pub range: KeyRange,
    pub record_count: usize,

    /// Key splitting the router's records in half, if it has any
    pub median_key: Option<Vec<u8>>,

    /// Requests answered since the router started
    pub requests_served: u64,
}

/// Rebalancing advice
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rebalance {
    Split { name: String, boundary: Vec<u8> },
    Merge { a: String, b: String },
    None,
}

pub trait Monitor: Send + Sync {
    fn report_health(&self, name: &str, metrics: HealthMetrics);

    /// Stop tracking a router that no longer exists
    fn forget(&self, name: &str);

    fn suggest_rebalance(&self) -> Rebalance;
}

/// Record-count thresholds: split big routers, merge small neighbours
pub struct ThresholdMonitor {
    latest: Mutex<HashMap<String, HealthMetrics>>,
    split_threshold: usize,
    merge_threshold: usize,
}

impl ThresholdMonitor {
    pub fn new(split_threshold: usize, merge_threshold: usize) -> Self {
        Self {
            latest: Mutex::new(HashMap::new()),
            split_threshold,
            merge_threshold,
        }
    }
}

impl Monitor for ThresholdMonitor {
    fn report_health(&self, name: &str, metrics: HealthMetrics) {
        self.latest.lock().insert(name.to_string(), metrics);
    }

    fn forget(&self, name: &str) {
        self.latest.lock().remove(name);
    }

    fn suggest_rebalance(&self) -> Rebalance {
        let latest = self.latest.lock();

        let largest = latest
            .iter()
            .filter(|(_, m)| m.record_count > self.split_threshold)
            .max_by_key(|(_, m)| m.record_count);
        if let Some((name, metrics)) = largest {
            // The median may equal the range start when keys are few; such a split is rejected
            if let Some(boundary) = &metrics.median_key {
                if metrics.range.split_at(boundary).is_some() {
                    return Rebalance::Split {
                        name: name.clone(),
                        boundary: boundary.clone(),
                    };
                }
            }
        }

        let mut ordered: Vec<(&String, &HealthMetrics)> = latest.iter().collect();
        ordered.sort_by(|a, b| a.1.range.start().cmp(b.1.range.start()));
        ordered
            .windows(2)
            .filter(|pair| pair[0].1.range.precedes(&pair[1].1.range))
            .map(|pair| (pair[0].1.record_count + pair[1].1.record_count, pair))
            .filter(|(combined, _)| *combined < self.merge_threshold)
            .min_by_key(|(combined, _)| *combined)
            .map(|(_, pair)| Rebalance::Merge {
                a: pair[0].0.clone(),
                b: pair[1].0.clone(),
            })
            .unwrap_or(Rebalance::None)
    }
}
