//! Message protocol between the scheduler, frontend and backend roles.
//!
//! Every cross-process call is a one-way [`Message`]. A logical request and
//! its reply are two independent messages correlated by a small identifier
//! (rank, file descriptor or resource name).
//!
//! | From → To | Messages |
//! |---|---|
//! | Frontend → Scheduler | `RequestJob`, `RenewLease`, `CancelJob`, `JobFinished`, `BackendFailed` |
//! | Scheduler → Frontend | `AssignJobNumber`, `AssignBackend`, `RenewLease`, `CancelJob` |
//! | Backend → Frontend | `BackendReady`, `BackendFinished`, `RenewLease`, `CancelJob`, `RequestResource`, file requests |
//! | Frontend → Backend | `CommenceJob`, `CancelJob`, `JobFinished`, `ReportResource`, file results |

pub mod codec;
pub mod message;

pub use codec::MessageCodec;
pub use message::{
    BackendAddresses, BackendMessage, FrontendMessage, LaunchInfo, Message, Role,
    SchedulerMessage,
};
