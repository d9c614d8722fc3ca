//! Supervise interactive CLI agents running in tmux sessions and infer what
//! each one is doing from its terminal output.

pub mod config;
pub mod git;
pub mod reconcile;
pub mod session;
pub mod status;
pub mod storage;
pub mod supervisor;
pub mod tmux;

pub use config::{Config, Paths};
pub use reconcile::ReconcileReport;
pub use session::{NewSession, Orchestra, OrchestraError, Session, SessionView};
pub use status::{ActivityState, SessionStatus};
pub use tmux::{BackendError, TerminalBackend, TmuxClient};
