//! # strm-mirror core
//!
//! Incremental synchronization engine that keeps a mirror of a `.strm`
//! placeholder tree, regrouped one directory level deeper by the catalog
//! identifier found in each filename.
//!
//! ## Architecture
//!
//! - [`mapper`]: pure source → mirror path mapping and its inverse
//! - [`sync`]: copy, delete, prune and authoritative full reconciliation
//! - [`watch`]: `notify` subscription feeding the pending change set
//! - [`reconcile`]: the state machine choosing between incremental batches
//!   and scheduled full syncs
//! - [`refresh`]: the independently scheduled remote refresh job
//! - [`lifecycle`]: starts both loops and drains them on shutdown
//! - [`identifier`]: catalog identifier extraction
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use strm_mirror_core::{
//!     CatalogIdExtractor, MirrorMapper, MirrorService, ReconcileSettings, SyncExecutor,
//! };
//!
//! # async fn run() -> strm_mirror_core::Result<()> {
//! let extractor = Arc::new(CatalogIdExtractor::new(Vec::new(), &[])?);
//! let mapper = MirrorMapper::new("/media/library", "/media/mirror", "strm", extractor);
//! let executor = Arc::new(SyncExecutor::new(mapper));
//!
//! let running = MirrorService::new(
//!     executor,
//!     "/media/library",
//!     "strm",
//!     ReconcileSettings::default(),
//! )
//! .start()?;
//!
//! let report = running
//!     .run_until(async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await;
//! println!("clean shutdown: {}", report.is_clean());
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod error;
pub mod identifier;
pub mod lifecycle;
pub mod mapper;
pub mod reconcile;
pub mod refresh;
pub mod settings;
pub mod sync;
pub mod watch;

pub use error::{MirrorError, Result, RootRole};
pub use identifier::{CatalogIdExtractor, IdentifierExtractor};
pub use lifecycle::{MirrorService, RunningService, ShutdownReport, TaskExit};
pub use mapper::MirrorMapper;
pub use reconcile::{LoopState, ReconcileLoop, ReconcileSettings};
pub use refresh::{CommandRefreshJob, NoopRefreshJob, RefreshJob, run_refresh_loop};
pub use sync::{MirrorSync, SyncCounters, SyncExecutor};
pub use watch::{ChangeAggregator, PendingSnapshot, WatchSubscription};
