use crate::pricing::round_usd;

/// One charge recorded against a session
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEntry {
    pub label: String,
    pub cost: f64,
}

/// Running cost total for a single session.
///
/// Owned by the session's control flow and dropped with it.
#[derive(Debug, Clone, Default)]
pub struct SessionLedger {
    entries: Vec<LedgerEntry>,
}

impl SessionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, label: impl Into<String>, cost: f64) {
        self.entries.push(LedgerEntry {
            label: label.into(),
            cost,
        });
    }

    pub fn total(&self) -> f64 {
        self.entries.iter().map(|e| e.cost).sum()
    }

    pub fn total_rounded(&self) -> f64 {
        round_usd(self.total())
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }
}
