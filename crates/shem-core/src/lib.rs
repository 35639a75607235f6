//! ---
//! shem_section: "01-core-functionality"
//! shem_subsection: "module"
//! shem_type: "source"
//! shem_scope: "code"
//! shem_description: "Primary orchestration and lifecycle management."
//! shem_version: "v0.1.0"
//! shem_owner: "tbd"
//! ---
//! The orchestrator core: the module lifecycle supervisor, the inter-module
//! message router, the signed-artifact update engine, the watchdog
//! heartbeat, and the two-phase self-update protocol, wired together over a
//! single process-wide shutdown channel.

pub mod heartbeat;
pub mod orchestrator;
pub mod router;
pub mod selfupdate;
pub mod supervisor;
pub mod update;

pub use orchestrator::{HealthCheck, Orchestrator};
