//! rex-client: run commands on remote systems and record what they print.
//!
//! Connections are made through pluggable [`Dialer`](rex_core::Dialer) and
//! [`Connector`](rex_core::Connector) implementations. Every command's output
//! is captured with timing by a [`Recorder`](rex_core::Recorder) and can be
//! replayed later at any speed.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use rex_client::{Ex, ExConfig, Target};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(connector: Arc<dyn rex_core::Connector>) -> rex_core::RexResult<()> {
//! let ex = Ex::new(connector);
//! let cancel = CancellationToken::new();
//! ex.connect_all(&cancel, &ExConfig::load(ExConfig::default_path()?)?).await?;
//!
//! if let Some(web) = ex.get_target("web").await {
//!     let recorder = web.command("uptime", &[]).run(&cancel).await?;
//!     let mut out = tokio::io::stdout();
//!     recorder.replay_combined(&mut out, 1.0).await?;
//! }
//!
//! ex.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dialer;
pub mod dispatcher;
pub mod ex;
pub mod exec;
pub mod session;
pub mod target;

#[cfg(test)]
mod stub;

// Re-export primary public types.
pub use config::{ExConfig, TargetConfig};
pub use dialer::{TcpDialer, TracedDialer};
pub use dispatcher::{SignalDispatcher, SignalHandlers};
pub use ex::Ex;
pub use session::{SessionHandle, SessionState};
pub use target::{ConnectionManager, Target};

// Re-export rex-core error types for convenience.
pub use rex_core::{RexError, RexResult};
