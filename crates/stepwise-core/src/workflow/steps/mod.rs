//! Built-in step executors, one module per state kind.
//!
//! - `inject` -- write a literal value
//! - `switch` -- route on a context value, first matching condition wins
//! - `parallel` -- concurrent branches with a join policy
//! - `foreach` -- one branch per item, bounded concurrency, ordered output
//! - `operation` -- delegate to the agent executor with timeout and retry
//! - `timer` -- suspend the run until a point in time
//! - `try_catch` -- run a body and route classified errors
//! - `cron` -- schedule declaration; never executed as a step
//! - `transform` -- compute a value with an expression
//! - `approval` -- park the run until a person approves or rejects

pub mod approval;
pub mod cron;
pub mod foreach;
pub mod inject;
pub mod operation;
pub mod parallel;
pub mod switch;
pub mod timer;
pub mod transform;
pub mod try_catch;
