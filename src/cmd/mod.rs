//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module     | Commands handled                              |
//! |------------|-----------------------------------------------|
//! | `init`     | `Init`                                        |
//! | `task`     | `Run`, `Resume`, `Rerun`                      |
//! | `session`  | `Status`, `History`, `Abandon`                |
//! | `review`   | `Pending`, `Approve`, `Reject`, `Decide`,     |
//! |            | `Feedback`, `Review`                          |
//! | `serve`    | `Serve`                                       |
//! | `safety`   | `CheckPath`                                   |
//! | `config`   | `Config`                                      |

pub mod config;
pub mod init;
pub mod review;
pub mod safety;
pub mod serve;
pub mod session;
pub mod task;

pub use config::cmd_config;
pub use init::cmd_init;
pub use review::{cmd_approve, cmd_decide, cmd_feedback, cmd_pending, cmd_reject, cmd_review};
pub use safety::cmd_check_path;
pub use serve::cmd_serve;
pub use session::{cmd_abandon, cmd_history, cmd_status};
pub use task::{cmd_rerun, cmd_resume, cmd_run};
