pub mod plan;
pub mod scheduler;

pub use plan::{plan_work_set, WorkItem, WorkSet};
pub use scheduler::{BatchScheduler, SchedulerOptions};
