//! Execution budgets
//!
//! One uniform set of numeric ceilings governs every extension. A [`Meter`] is
//! created fresh for each invocation; once a ceiling is breached the meter
//! stays tripped and every further charge fails with the same error.

use crate::script::ScriptValue;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Numeric ceilings for one sandboxed invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionBudget {
    /// Operation count (script steps plus host calls)
    pub max_operations: u64,
    /// Nested call depth
    pub max_call_depth: u32,
    /// Longest string a script may hold, in bytes
    pub max_string_bytes: usize,
    /// Longest list a script may hold
    pub max_array_len: usize,
    /// Largest map a script may hold
    pub max_map_entries: usize,
}

impl Default for ExecutionBudget {
    fn default() -> Self {
        Self {
            max_operations: 100_000,
            max_call_depth: 64,
            max_string_bytes: 64 * 1024,
            max_array_len: 4_096,
            max_map_entries: 1_024,
        }
    }
}

/// Which ceiling was breached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetDimension {
    /// Operation count
    Operations,
    /// Call-stack depth
    CallDepth,
    /// String size
    StringSize,
    /// Array length
    ArraySize,
    /// Map entry count
    MapSize,
    /// Phase-level wall clock
    WallClock,
}

impl BudgetDimension {
    /// Stable lowercase name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Operations => "operations",
            Self::CallDepth => "call_depth",
            Self::StringSize => "string_size",
            Self::ArraySize => "array_size",
            Self::MapSize => "map_size",
            Self::WallClock => "wall_clock",
        }
    }
}

impl fmt::Display for BudgetDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A breached ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{dimension} limit {limit} exceeded (observed {observed})")]
pub struct BudgetExceeded {
    /// Dimension breached
    pub dimension: BudgetDimension,
    /// Configured ceiling
    pub limit: u64,
    /// Value that breached it
    pub observed: u64,
}

/// Per-invocation budget counters
///
/// Enforces pre-declared limits at runtime. This is primitive enforcement,
/// not validation.
#[derive(Debug, Clone)]
pub struct Meter {
    budget: ExecutionBudget,
    operations: u64,
    depth: u32,
    deadline: Option<Instant>,
    tripped: Option<BudgetExceeded>,
}

impl Meter {
    /// Fresh counters for one invocation
    #[must_use]
    pub fn new(budget: ExecutionBudget, deadline: Option<Instant>) -> Self {
        Self {
            budget,
            operations: 0,
            depth: 0,
            deadline,
            tripped: None,
        }
    }

    fn trip(&mut self, dimension: BudgetDimension, limit: u64, observed: u64) -> BudgetExceeded {
        let exceeded = BudgetExceeded {
            dimension,
            limit,
            observed,
        };
        self.tripped = Some(exceeded);
        exceeded
    }

    fn latched(&self) -> Result<(), BudgetExceeded> {
        match self.tripped {
            Some(exceeded) => Err(exceeded),
            None => Ok(()),
        }
    }

    /// Check the phase deadline
    pub fn check_deadline(&mut self) -> Result<(), BudgetExceeded> {
        self.latched()?;
        if let Some(deadline) = self.deadline {
            let now = Instant::now();
            if now > deadline {
                let over = u64::try_from(now.duration_since(deadline).as_millis()).unwrap_or(u64::MAX);
                return Err(self.trip(BudgetDimension::WallClock, 0, over));
            }
        }
        Ok(())
    }

    /// Charge `ops` operations
    pub fn charge(&mut self, ops: u64) -> Result<(), BudgetExceeded> {
        self.latched()?;
        self.operations = self.operations.saturating_add(ops);
        if self.operations > self.budget.max_operations {
            let (limit, observed) = (self.budget.max_operations, self.operations);
            return Err(self.trip(BudgetDimension::Operations, limit, observed));
        }
        self.check_deadline()
    }

    /// Enter a nested call
    pub fn enter(&mut self) -> Result<(), BudgetExceeded> {
        self.latched()?;
        self.depth += 1;
        if self.depth > self.budget.max_call_depth {
            let (limit, observed) = (u64::from(self.budget.max_call_depth), u64::from(self.depth));
            return Err(self.trip(BudgetDimension::CallDepth, limit, observed));
        }
        Ok(())
    }

    /// Leave a nested call
    pub fn leave(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    /// Check that a value fits the size ceilings
    pub fn check_value(&mut self, value: &ScriptValue) -> Result<(), BudgetExceeded> {
        self.latched()?;
        match value {
            ScriptValue::Str(s) | ScriptValue::Error(s) => self.check_len(BudgetDimension::StringSize, s.len()),
            ScriptValue::List(items) => {
                self.check_len(BudgetDimension::ArraySize, items.len())?;
                items.iter().try_for_each(|v| self.check_value(v))
            }
            ScriptValue::Map(map) => {
                self.check_len(BudgetDimension::MapSize, map.len())?;
                map.iter().try_for_each(|(k, v)| {
                    self.check_len(BudgetDimension::StringSize, k.len())?;
                    self.check_value(v)
                })
            }
            ScriptValue::Null
            | ScriptValue::Bool(_)
            | ScriptValue::Int(_)
            | ScriptValue::Float(_)
            | ScriptValue::Signal(_) => Ok(()),
        }
    }

    /// Check a single length against its ceiling
    pub fn check_len(&mut self, dimension: BudgetDimension, len: usize) -> Result<(), BudgetExceeded> {
        self.latched()?;
        let limit = match dimension {
            BudgetDimension::StringSize => self.budget.max_string_bytes,
            BudgetDimension::ArraySize => self.budget.max_array_len,
            BudgetDimension::MapSize => self.budget.max_map_entries,
            BudgetDimension::Operations | BudgetDimension::CallDepth | BudgetDimension::WallClock => {
                return Ok(());
            }
        };
        if len > limit {
            return Err(self.trip(dimension, limit as u64, len as u64));
        }
        Ok(())
    }

    /// Ceilings this meter enforces
    #[must_use]
    pub fn budget(&self) -> ExecutionBudget {
        self.budget
    }

    /// Operations charged so far
    #[must_use]
    pub fn operations(&self) -> u64 {
        self.operations
    }

    /// Current call depth
    #[must_use]
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// First breach, if any
    #[must_use]
    pub fn tripped(&self) -> Option<BudgetExceeded> {
        self.tripped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn small() -> ExecutionBudget {
        ExecutionBudget {
            max_operations: 10,
            max_call_depth: 2,
            max_string_bytes: 8,
            max_array_len: 3,
            max_map_entries: 2,
        }
    }

    #[test]
    fn operations_at_exact_limit_succeed() {
        let mut meter = Meter::new(small(), None);
        assert!(meter.charge(10).is_ok());
        let err = meter.charge(1).unwrap_err();
        assert_eq!(err.dimension, BudgetDimension::Operations);
        assert_eq!(err.observed, 11);
    }

    #[test]
    fn breach_is_latched() {
        let mut meter = Meter::new(small(), None);
        meter.enter().unwrap();
        meter.enter().unwrap();
        let first = meter.enter().unwrap_err();
        assert_eq!(first.dimension, BudgetDimension::CallDepth);
        assert_eq!(meter.charge(1).unwrap_err(), first);
        assert_eq!(meter.tripped(), Some(first));
    }

    #[test]
    fn nested_values_are_measured() {
        let mut meter = Meter::new(small(), None);
        assert!(meter.check_value(&ScriptValue::Str("short".into())).is_ok());

        let mut map = BTreeMap::new();
        map.insert("k".to_string(), ScriptValue::List(vec![ScriptValue::Int(1); 4]));
        let err = meter.check_value(&ScriptValue::Map(map)).unwrap_err();
        assert_eq!(err.dimension, BudgetDimension::ArraySize);
    }

    #[test]
    fn oversized_string_trips() {
        let mut meter = Meter::new(small(), None);
        let err = meter.check_value(&ScriptValue::Str("much too long".into())).unwrap_err();
        assert_eq!(err.dimension, BudgetDimension::StringSize);
        assert_eq!(err.limit, 8);
    }

    #[test]
    fn passed_deadline_trips_wall_clock() {
        let past = Instant::now().checked_sub(Duration::from_millis(5));
        let mut meter = Meter::new(small(), past);
        assert_eq!(meter.charge(1).unwrap_err().dimension, BudgetDimension::WallClock);
    }

    #[test]
    fn leave_never_underflows() {
        let mut meter = Meter::new(small(), None);
        meter.leave();
        assert_eq!(meter.depth(), 0);
    }
}
