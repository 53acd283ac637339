pub mod budget;
pub mod job;
pub mod ledger;

pub use budget::{AlertState, Budget, BudgetPeriod, BudgetStatus, BudgetUsage};
pub use job::{JobStatus, SimulationJob};
pub use ledger::CostLedgerEntry;
