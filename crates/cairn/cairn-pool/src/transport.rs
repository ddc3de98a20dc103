//! The transport capability: zero-copy views or per-worker snapshots.
//!
//! Hosts with shared memory run `Shared`: workers attach read views over
//! the bus segment and touch no copies. Hosts without it run `Copy`: every
//! worker gets the same immutable snapshot of the inputs behind an `Arc`.
//! Ordering, determinism and the error taxonomy are identical either way;
//! only footprint and attach cost differ.

use cairn_bus::{BusError, BusReader};
use cairn_model::{AssumptionSet, Policy};
use std::sync::Arc;

/// Which transport a run uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Shared,
    Copy,
}

/// A per-run copy of all inputs, shared by `Arc` across workers.
pub struct InputSnapshot {
    pub policies: Vec<Policy>,
    pub policy_bytes: Vec<u8>,
    pub mortality: Vec<f64>,
    pub lapse: Vec<f64>,
    pub expenses: Vec<f64>,
}

impl InputSnapshot {
    pub fn capture(policies: &[Policy], assumptions: &AssumptionSet) -> Self {
        let mut policy_bytes = Vec::with_capacity(policies.len() * 32);
        for p in policies {
            policy_bytes.extend_from_slice(&p.encode());
        }
        Self {
            policies: policies.to_vec(),
            policy_bytes,
            mortality: assumptions.mortality.flat(),
            lapse: assumptions.lapse.annual.to_vec(),
            expenses: assumptions.expenses.flat().to_vec(),
        }
    }
}

/// What a worker reads its inputs through for one run.
#[derive(Clone)]
pub enum WorkerInputs {
    Shared(BusReader),
    Copied(Arc<InputSnapshot>),
}

impl WorkerInputs {
    pub fn policy_bytes(&self) -> &[u8] {
        match self {
            WorkerInputs::Shared(bus) => bus.policy_bytes(),
            WorkerInputs::Copied(snap) => &snap.policy_bytes,
        }
    }

    pub fn policies(&self) -> Result<Vec<Policy>, BusError> {
        match self {
            WorkerInputs::Shared(bus) => bus.policies(),
            WorkerInputs::Copied(snap) => Ok(snap.policies.clone()),
        }
    }

    pub fn mortality(&self) -> &[f64] {
        match self {
            WorkerInputs::Shared(bus) => bus.mortality(),
            WorkerInputs::Copied(snap) => &snap.mortality,
        }
    }

    pub fn lapse(&self) -> &[f64] {
        match self {
            WorkerInputs::Shared(bus) => bus.lapse(),
            WorkerInputs::Copied(snap) => &snap.lapse,
        }
    }

    pub fn expenses(&self) -> &[f64] {
        match self {
            WorkerInputs::Shared(bus) => bus.expense_values(),
            WorkerInputs::Copied(snap) => &snap.expenses,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_model::{
        ExpenseAssumptions, Gender, LapseTable, MortalityTable, ProductType,
    };

    #[test]
    fn snapshot_captures_both_policy_forms() {
        let policies = vec![Policy {
            policy_id: 5,
            age: 30,
            gender: Gender::Male,
            sum_assured: 1.0,
            premium: 2.0,
            term_years: 10,
            product_type: ProductType::Term,
        }];
        let assumptions = AssumptionSet {
            mortality: MortalityTable::zeroed(),
            lapse: LapseTable::zeroed(),
            expenses: ExpenseAssumptions::default(),
        };
        let snap = InputSnapshot::capture(&policies, &assumptions);
        assert_eq!(snap.policy_bytes.len(), 32);
        assert_eq!(Policy::decode(&snap.policy_bytes).unwrap(), policies[0]);
        assert_eq!(snap.mortality.len(), 242);
        assert_eq!(snap.lapse.len(), 50);
        assert_eq!(snap.expenses.len(), 4);
    }
}
