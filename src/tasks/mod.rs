//! # Task Execution
//!
//! Consumer side of the broker's task queue. [`TaskExecutor::run_next`] dequeues one task,
//! runs it according to its kind and records the outcome. Draining the queue in a loop is
//! left to the process hosting the broker.
//!
//! | Kind                            | Work                                                   |
//! |---------------------------------|--------------------------------------------------------|
//! | `delete`                        | deprovision the resource, then drop the record         |
//! | `perform-post-provision`        | wait for readiness, run post-provision, resync record  |
//! | `change-plans`                  | modify in place, or move to another provider           |
//! | `restore-backup`                | restore the instance from the named backup             |
//! | `notify-create-service-webhook` | POST readiness to the requester once ready             |
//!
//! Delivery is at-least-once: a retried task starts from scratch.

pub mod executor;

pub use executor::{TaskExecutor, TaskOutcome, DEFAULT_MAX_RETRIES, WAITING_MAX_RETRIES};
