//! Feature pipeline back-end.
//!
//! ## Module Map
//!
//! ```text
//!  forgeflow run ──> pipeline.rs  (Pipeline: analysis → approaches → judging
//!                        │          → implementation → pr, human checkpoints)
//!                        │
//!                        ├─ sandbox.rs  (Sandbox / SandboxProvider, LocalSandboxProvider)
//!                        ├─ github.rs   (PullRequestCreator, GitHubClient)
//!                        ├─ notify.rs   (Notification, LogNotifier, BroadcastNotifier)
//!                        └─ db.rs       (FlowDb over SQLite, DbHandle)
//! ```
//!
//! ## Supporting Modules
//!
//! | Module     | Responsibility                                             |
//! |------------|------------------------------------------------------------|
//! | `models`   | Row types: `FeatureRun`, `PhaseResult`, `AgentInvocation`, `CtaEvent` |
//! | `db`       | SQLite access via `DbHandle` (thin `Arc<Mutex<_>>`)        |
//! | `notify`   | Chat/notification surface and output tails                 |
//! | `github`   | Repo locators and PR creation over the REST API            |
//! | `sandbox`  | Isolated checkouts the agents read and write               |
//!
//! ## Typical Run
//!
//! 1. `Pipeline::start_run` creates the `FeatureRun` and provisions a sandbox
//!    on branch `forgeflow/<slug>-<id8>`.
//! 2. Each phase opens a `running` phase result, runs its agents, and is
//!    marked `passed` before the run advances.
//! 3. A human approves (or chooses an approach) between phases through a CTA.
//! 4. The PR phase commits, pushes, and opens the pull request; the run ends
//!    `completed` with the PR URL. The sandbox is stopped on every exit path.

pub mod db;
pub mod github;
pub mod models;
pub mod notify;
pub mod pipeline;
pub mod sandbox;
