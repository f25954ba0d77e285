use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// A named counter that jobs update while running. Counters are cheap to
/// clone and safe to update from any task.
#[derive(Debug)]
pub struct Counter {
    group: String,
    name: String,
    value: AtomicU64,
}

impl Counter {
    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A set of counters aggregated for one job and reported with its result.
#[derive(Debug, Default)]
pub struct CounterSet {
    counters: Mutex<Vec<Arc<Counter>>>,
}

impl CounterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the counter with the given group and name, creating it if it
    /// does not exist yet.
    pub fn counter(&self, group: &str, name: &str) -> Arc<Counter> {
        let mut counters = match self.counters.lock() {
            Ok(x) => x,
            Err(e) => e.into_inner(),
        };
        if let Some(counter) = counters
            .iter()
            .find(|c| c.group == group && c.name == name)
        {
            return Arc::clone(counter);
        }
        let counter = Arc::new(Counter {
            group: group.to_string(),
            name: name.to_string(),
            value: AtomicU64::new(0),
        });
        counters.push(Arc::clone(&counter));
        counter
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        let counters = match self.counters.lock() {
            Ok(x) => x,
            Err(e) => e.into_inner(),
        };
        CounterSnapshot {
            counters: counters
                .iter()
                .map(|c| CounterValue {
                    group: c.group.clone(),
                    name: c.name.clone(),
                    value: c.value(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub counters: Vec<CounterValue>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterValue {
    pub group: String,
    pub name: String,
    pub value: u64,
}
