//! The per-task state machine and the polling machinery behind it.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ Uploading ──▶ Parsing ──▶ Detecting ──▶ (Reducing) ──▶ Polling ──▶ Completed
//! (path/URL)  (storage)    (words)     (submit)      (submit)       (poll)      | Failed
//! ```
//!
//! 1. [`input`]: turn a user-supplied path or URL into a validated document
//! 2. [`stage`]: the stage enum and the one transition rule every write
//!    goes through
//! 3. [`task`]: the task record, its observers and the shared handle
//! 4. [`poll`]: batched status polling with per-job deadlines; the only
//!    part that runs on its own task

pub mod input;
pub mod poll;
pub mod stage;
pub mod task;
