//! Assumption tables with fixed binary shapes.
//!
//! All tables serialize as packed little-endian f64 arrays:
//! mortality 242 rates (121 male then 121 female), lapse 50 annual rates
//! (policy year 1 at index 0), expenses 4 values in fixed order.

/// Ages 0..=120.
pub const MORTALITY_AGES: usize = 121;
/// Total mortality rates on the wire: male then female.
pub const MORTALITY_RATES: usize = 2 * MORTALITY_AGES;
/// Policy years 1..=50.
pub const LAPSE_YEARS: usize = 50;
/// acquisition, maintenance, percent-of-premium, claim.
pub const EXPENSE_FIELDS: usize = 4;

#[derive(Debug, Clone, PartialEq)]
pub struct MortalityTable {
    pub male: [f64; MORTALITY_AGES],
    pub female: [f64; MORTALITY_AGES],
}

impl MortalityTable {
    pub fn zeroed() -> Self {
        Self {
            male: [0.0; MORTALITY_AGES],
            female: [0.0; MORTALITY_AGES],
        }
    }

    /// Build from rate slices; missing trailing ages are treated as zero,
    /// surplus entries are ignored.
    pub fn from_rates(male: &[f64], female: &[f64]) -> Self {
        let mut t = Self::zeroed();
        for (dst, src) in t.male.iter_mut().zip(male) {
            *dst = *src;
        }
        for (dst, src) in t.female.iter_mut().zip(female) {
            *dst = *src;
        }
        t
    }

    /// Flatten to the wire order: male block then female block.
    pub fn flat(&self) -> Vec<f64> {
        let mut out = Vec::with_capacity(MORTALITY_RATES);
        out.extend_from_slice(&self.male);
        out.extend_from_slice(&self.female);
        out
    }

    pub fn from_flat(rates: &[f64]) -> Self {
        let male = &rates[..rates.len().min(MORTALITY_AGES)];
        let female = if rates.len() > MORTALITY_AGES {
            &rates[MORTALITY_AGES..rates.len().min(MORTALITY_RATES)]
        } else {
            &[]
        };
        Self::from_rates(male, female)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LapseTable {
    /// Index 0 holds policy year 1.
    pub annual: [f64; LAPSE_YEARS],
}

impl LapseTable {
    pub fn zeroed() -> Self {
        Self {
            annual: [0.0; LAPSE_YEARS],
        }
    }

    pub fn from_rates(rates: &[f64]) -> Self {
        let mut t = Self::zeroed();
        for (dst, src) in t.annual.iter_mut().zip(rates) {
            *dst = *src;
        }
        t
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ExpenseAssumptions {
    pub acquisition: f64,
    pub maintenance: f64,
    pub percent_premium: f64,
    pub claim: f64,
}

impl ExpenseAssumptions {
    pub fn flat(&self) -> [f64; EXPENSE_FIELDS] {
        [
            self.acquisition,
            self.maintenance,
            self.percent_premium,
            self.claim,
        ]
    }

    pub fn from_flat(values: &[f64]) -> Self {
        let get = |i: usize| values.get(i).copied().unwrap_or(0.0);
        Self {
            acquisition: get(0),
            maintenance: get(1),
            percent_premium: get(2),
            claim: get(3),
        }
    }
}

/// The full assumption bundle loaded per run.
#[derive(Debug, Clone, PartialEq)]
pub struct AssumptionSet {
    pub mortality: MortalityTable,
    pub lapse: LapseTable,
    pub expenses: ExpenseAssumptions,
}
