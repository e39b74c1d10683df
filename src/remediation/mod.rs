//! The remediation pipeline: poll, lock, analyze, patch, publish, and the
//! review-comment loop.
//!
//! | Module       | Stage                                              |
//! |--------------|----------------------------------------------------|
//! | `scheduler`  | Periodic sweep, qualification, rate limiting        |
//! | `processor`  | Per-issue control flow and the single ledger write |
//! | `lock`       | Marker-note advisory lock across instances         |
//! | `context`    | Issue detail, latest event, source snippets        |
//! | `analyzer`   | Agent analysis and the acceptance gate             |
//! | `duplicates` | Keyword search over existing change requests       |
//! | `patch`      | Branch, exact-substring patch, commit, push        |
//! | `publisher`  | Open or update the change request                  |
//! | `monitor`    | Reviewer-comment revisions                         |
//! | `worker`     | Explicit worker context shared by both loops       |

pub mod analyzer;
pub mod context;
pub mod duplicates;
pub mod lock;
pub mod monitor;
pub mod patch;
pub mod processor;
pub mod publisher;
pub mod scheduler;
pub mod worker;

pub use monitor::{MonitorReport, run_monitor_forever, run_sweep};
pub use processor::{IssueDisposition, process_issue};
pub use scheduler::{CycleReport, run_cycle, run_forever};
pub use worker::{Services, WorkerContext};
